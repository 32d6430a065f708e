//! This is the entrypoint for `statemask` from the command line.

use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use nix::unistd::Uid;

use statemask::config::Config;
use statemask::pipeline::{Nat64, PacketSink};
use stateful_nat::{Pool4, Transport4, Transport6};

mod logging;

#[derive(Parser)]
#[clap(author, version, about = "Stateful NAT64 translator", long_about = None)]
struct Args {
    /// Path to the config file
    #[clap(short, long, default_value = "/etc/statemask.toml")]
    config_file: PathBuf,

    /// Enable verbose logging
    #[clap(short, long)]
    verbose: bool,
}

/// Writes translated packets back out the TUN device
struct TunSink(Arc<tun_tap::Iface>);

impl PacketSink for TunSink {
    fn send(&self, packet: &[u8]) {
        if let Err(error) = self.0.send(packet) {
            log::warn!("Failed to emit packet: {}", error);
        }
    }
}

#[tokio::main]
pub async fn main() {
    // Parse CLI args
    let args = Args::parse();

    // Set up logging
    logging::enable_logger(args.verbose);

    // We must be root to own a TUN device
    if !Uid::effective().is_root() {
        log::error!("This program must be run as root");
        std::process::exit(1);
    }

    // Parse the config file and build the initial runtime snapshot
    let config = Config::load(&args.config_file).unwrap();
    let runtime = match config.runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            log::error!("Invalid configuration: {}", error);
            std::process::exit(1);
        }
    };

    // Load the pools
    let mut pool6 = rfc6052::Pool6::new();
    for prefix in &config.pool6 {
        if let Err(error) = pool6.add(*prefix) {
            log::error!("Rejected translation prefix {}: {}", prefix, error);
            std::process::exit(1);
        }
    }
    let mut pool4 = Pool4::new();
    for net in &config.pool4 {
        if let Err(error) = pool4.add_net(*net) {
            log::error!("Rejected pool prefix {}: {}", net, error);
            std::process::exit(1);
        }
    }

    // Bring up the TUN interface. Routing the pool6 and pool4 prefixes at
    // it is the operator's job.
    log::debug!("Creating new TUN interface");
    let iface = Arc::new(
        tun_tap::Iface::without_packet_info("statemask%d", tun_tap::Mode::Tun).unwrap(),
    );
    log::debug!("Created TUN interface: {}", iface.name());

    // Build the core
    let core = Arc::new(Nat64::new(
        pool6,
        pool4,
        runtime,
        Arc::new(TunSink(iface.clone())),
    ));

    // Pin static bindings from the config
    for rule in &config.static_bib {
        let Some(l4) = rule.l4() else {
            log::error!("Unknown protocol in static binding: {}", rule.protocol);
            std::process::exit(1);
        };
        if let Err(error) = core.add_static_binding(
            l4,
            Transport6::new(rule.v6, rule.v6_port),
            Transport4::new(rule.v4, rule.v4_port),
        ) {
            log::error!("Rejected static binding: {}", error);
            std::process::exit(1);
        }
    }

    // Handle metrics requests
    if let Some(bind_addr) = config.prom_bind_addr {
        log::info!("Enabling metrics server on {}", bind_addr);
        tokio::spawn(statemask::metrics::http::serve_metrics(bind_addr));
    }

    // Handle control requests
    let _ = std::fs::remove_file(&config.control_socket);
    let listener = UnixListener::bind(&config.control_socket).unwrap();
    log::info!("Control socket listening on {}", config.control_socket);
    {
        let core = core.clone();
        std::thread::Builder::new()
            .name("statemask-ctl".to_string())
            .spawn(move || statemask::control::serve(&core, &listener))
            .unwrap();
    }

    // Age out idle sessions
    let expiry = core.run_expirer();

    // Translate all incoming packets
    log::info!("Translating packets on {}", iface.name());
    let datapath = {
        let core = core.clone();
        tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; 65536];
            loop {
                match iface.recv(&mut buffer) {
                    Ok(length) => {
                        let _ = core.process(&buffer[..length]);
                    }
                    Err(error) => {
                        log::error!("TUN read failed: {}", error);
                        break;
                    }
                }
            }
        })
    };
    datapath.await.unwrap();

    // Timers are cancelled and joined before the tables go away
    core.shutdown();
    expiry.join().unwrap();
}
