//! Splitting translated packets into IPv6 fragment chains.
//!
//! IPv4 routers could fragment on the way; IPv6 routers never do. So when
//! a translated packet exceeds the minimum IPv6 MTU it must leave this
//! translator pre-fragmented, unless the original sender set DF, in which
//! case it gets a Fragmentation Needed error instead.

use crate::error::{Error, Result};
use crate::options::TranslateOptions;
use crate::protocols::{FragmentHeader, Ipv6Packet};

/// Serialize a synthesized IPv6 packet, splitting it into a fragment chain
/// when it exceeds the configured MTU.
///
/// The first fragment keeps the transport header (it leads `payload`);
/// later fragments carry payload bytes only. A packet that was already a
/// fragment keeps its offset base and its original M flag on the last
/// piece.
pub fn emit(
    packet: Ipv6Packet,
    dont_fragment: bool,
    fragment_id: u32,
    options: &TranslateOptions,
) -> Result<Vec<Vec<u8>>> {
    let mtu = usize::from(options.min_ipv6_mtu);
    let whole = packet.to_bytes();
    if whole.len() <= mtu {
        return Ok(vec![whole]);
    }

    if dont_fragment {
        return Err(Error::FragmentationNeeded {
            mtu: options.min_ipv6_mtu.saturating_sub(20).max(68),
        });
    }

    // Offsets count 8-byte units, so the room left after the IPv6 and
    // fragment headers is clamped down to a multiple of 8
    let capacity = (mtu - 40 - FragmentHeader::SIZE) & !7;
    let base = packet.fragment.unwrap_or(FragmentHeader {
        offset: 0,
        more: false,
        id: fragment_id,
    });

    let chunks: Vec<&[u8]> = packet.payload.chunks(capacity).collect();
    let last_index = chunks.len() - 1;
    Ok(chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            #[allow(clippy::cast_possible_truncation)]
            let offset = base.offset + ((index * capacity) / 8) as u16;
            Ipv6Packet {
                fragment: Some(FragmentHeader {
                    offset,
                    // Every fragment but the last promises more; the last
                    // one repeats whatever the original datagram said
                    more: index < last_index || base.more,
                    id: base.id,
                }),
                payload: chunk.to_vec(),
                ..packet.clone()
            }
            .to_bytes()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet_packet::ip::IpNextHeaderProtocols;

    fn packet_with_payload(payload: Vec<u8>) -> Ipv6Packet {
        Ipv6Packet {
            traffic_class: 0,
            flow_label: 0,
            next_header: IpNextHeaderProtocols::Udp,
            hop_limit: 63,
            source_address: "64:ff9b::c0a8:201".parse().unwrap(),
            destination_address: "2001:db8::1".parse().unwrap(),
            fragment: None,
            payload,
        }
    }

    #[test]
    fn test_small_packets_pass_through() {
        let output = emit(
            packet_with_payload(vec![0xab; 100]),
            false,
            7,
            &TranslateOptions::default(),
        )
        .unwrap();
        assert_eq!(output.len(), 1);
        assert!(Ipv6Packet::from_bytes(&output[0]).unwrap().fragment.is_none());
    }

    #[test]
    fn test_df_wins_over_fragmenting() {
        assert_eq!(
            emit(
                packet_with_payload(vec![0xab; 2000]),
                true,
                7,
                &TranslateOptions::default(),
            ),
            Err(Error::FragmentationNeeded { mtu: 1260 })
        );
    }

    #[test]
    fn test_chain_reassembles_to_original_payload() {
        let payload: Vec<u8> = (0..2000u32).map(|byte| (byte % 251) as u8).collect();
        let output = emit(
            packet_with_payload(payload.clone()),
            false,
            0xcafe,
            &TranslateOptions::default(),
        )
        .unwrap();
        assert_eq!(output.len(), 2);

        let mut reassembled = Vec::new();
        let mut expected_offset = 0u16;
        for (index, bytes) in output.iter().enumerate() {
            assert!(bytes.len() <= 1280, "fragment exceeds the minimum MTU");
            let fragment = Ipv6Packet::from_bytes(bytes).unwrap();
            let header = fragment.fragment.unwrap();
            assert_eq!(header.id, 0xcafe);
            assert_eq!(header.offset, expected_offset);
            assert_eq!(header.more, index == 0);
            expected_offset += u16::try_from(fragment.payload.len() / 8).unwrap();
            reassembled.extend_from_slice(&fragment.payload);
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn test_refragmenting_keeps_offset_base() {
        let mut packet = packet_with_payload(vec![0xab; 1500]);
        packet.fragment = Some(FragmentHeader {
            offset: 400,
            more: true,
            id: 9,
        });
        let output = emit(packet, false, 9, &TranslateOptions::default()).unwrap();
        assert!(output.len() > 1);

        let first = Ipv6Packet::from_bytes(&output[0]).unwrap();
        assert_eq!(first.fragment.unwrap().offset, 400);
        // The original datagram had more fragments coming, so even the
        // last piece keeps M set
        let last = Ipv6Packet::from_bytes(output.last().unwrap()).unwrap();
        assert!(last.fragment.unwrap().more);
    }
}
