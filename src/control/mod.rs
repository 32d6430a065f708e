//! The control channel: a framed request/response protocol the `statectl`
//! tooling speaks over a Unix socket.
//!
//! Every request starts with a six-byte header: `length` (`u32`, little
//! endian, counting only the payload), `mode` and `operation` (one byte
//! each). Responses carry the same shape with `mode` replaced by a status
//! code (0 for success) and `operation` by a "more" flag used by the
//! paginated DISPLAY operations. Failure responses carry a human-readable
//! message as their payload.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

use crate::pipeline::Nat64;

pub mod codec;
mod handler;

/// The largest request payload the server will read
const MAX_REQUEST: u32 = 1 << 16;

/// Which database a request addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Pool6,
    Pool4,
    Bib,
    Session,
    General,
}

impl Mode {
    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Pool6),
            1 => Some(Self::Pool4),
            2 => Some(Self::Bib),
            3 => Some(Self::Session),
            4 => Some(Self::General),
            _ => None,
        }
    }
}

/// What to do with the addressed database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Display,
    Count,
    Add,
    Update,
    Remove,
    Flush,
}

impl Operation {
    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Display),
            1 => Some(Self::Count),
            2 => Some(Self::Add),
            3 => Some(Self::Update),
            4 => Some(Self::Remove),
            5 => Some(Self::Flush),
            _ => None,
        }
    }
}

/// A fully assembled response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u8,
    pub more: bool,
    pub payload: Vec<u8>,
}

impl Response {
    fn ok(payload: Vec<u8>) -> Self {
        Self {
            code: 0,
            more: false,
            payload,
        }
    }

    fn ok_more(payload: Vec<u8>, more: bool) -> Self {
        Self {
            code: 0,
            more,
            payload,
        }
    }

    fn bad_request(message: &str) -> Self {
        Self {
            code: 1,
            more: false,
            payload: message.as_bytes().to_vec(),
        }
    }

    fn rejected(message: &str) -> Self {
        Self {
            code: 2,
            more: false,
            payload: message.as_bytes().to_vec(),
        }
    }

    fn to_frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(6 + self.payload.len());
        frame.extend_from_slice(&u32::try_from(self.payload.len()).unwrap().to_le_bytes());
        frame.push(self.code);
        frame.push(u8::from(self.more));
        frame.extend_from_slice(&self.payload);
        frame
    }
}

/// Dispatch one decoded request
pub fn dispatch(core: &Nat64, mode: u8, operation: u8, payload: &[u8]) -> Response {
    let Some(mode) = Mode::from_wire(mode) else {
        return Response::bad_request("unknown mode");
    };
    let Some(operation) = Operation::from_wire(operation) else {
        return Response::bad_request("unknown operation");
    };
    handler::handle(core, mode, operation, payload)
}

/// Accept clients forever, one at a time
pub fn serve(core: &Arc<Nat64>, listener: &UnixListener) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(error) = serve_client(core, stream) {
                    log::debug!("Control client error: {}", error);
                }
            }
            Err(error) => log::warn!("Control accept failed: {}", error),
        }
    }
}

fn serve_client(core: &Arc<Nat64>, mut stream: UnixStream) -> std::io::Result<()> {
    loop {
        let mut header = [0u8; 6];
        match stream.read_exact(&mut header) {
            Ok(()) => {}
            // A clean hangup between requests ends the conversation
            Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(error) => return Err(error),
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let response = if length > MAX_REQUEST {
            Response::bad_request("request too large")
        } else {
            let mut payload = vec![0u8; length as usize];
            stream.read_exact(&mut payload)?;
            dispatch(core, header[4], header[5], &payload)
        };

        stream.write_all(&response.to_frame())?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_and_operation_decoding() {
        assert_eq!(Mode::from_wire(0), Some(Mode::Pool6));
        assert_eq!(Mode::from_wire(4), Some(Mode::General));
        assert_eq!(Mode::from_wire(5), None);
        assert_eq!(Operation::from_wire(5), Some(Operation::Flush));
        assert_eq!(Operation::from_wire(6), None);
    }

    #[test]
    fn test_response_framing() {
        let frame = Response::ok(vec![0xaa, 0xbb]).to_frame();
        assert_eq!(frame, vec![2, 0, 0, 0, 0, 0, 0xaa, 0xbb]);

        let frame = Response::rejected("no").to_frame();
        assert_eq!(&frame[..6], &[2, 0, 0, 0, 2, 0]);
        assert_eq!(&frame[6..], b"no");
    }
}
