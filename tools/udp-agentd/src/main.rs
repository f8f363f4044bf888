//! UDP bridge around an embedded Probelink agent instance.
//!
//! Runs the agent the way a firmware superloop would: datagram payloads are
//! fed straight into the frame decoder, the agent is ticked at a fixed
//! period, and outbound response bytes are returned to whichever peer spoke
//! last. The published memory is a demo data block whose secret region is
//! covered by a forbidden range, so the full guard behavior can be exercised
//! from a host without real hardware.

mod demo;

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use probelink_agent::{Config, MainHandler};

use demo::DemoTarget;

/// Expose a demo Probelink agent over UDP for host-side protocol testing.
#[derive(Parser, Debug)]
#[command(name = "udp-agentd", version)]
struct Cli {
    /// UDP port to listen on.
    #[arg(long, default_value_t = 8765)]
    port: u16,
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,
    /// Agent tick period, e.g. 5ms or 500us.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5ms")]
    tick: Duration,
    /// Link bitrate reported through GetParams, in bits per second.
    #[arg(long, default_value_t = 1_000_000)]
    bitrate: u32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let layout = DemoTarget::install();

    let mut config = Config::new();
    config.display_name = "probelink-udp-agentd";
    config.max_bitrate_bps = cli.bitrate;
    config.session_id_seed = std::process::id();
    config
        .add_forbidden_address_range(layout.secret_start, layout.secret_end)
        .map_err(|err| anyhow!("guard range rejected: {err:?}"))?;

    let mut handler: MainHandler = MainHandler::new();
    handler.init(&config);

    let socket = UdpSocket::bind((cli.bind.as_str(), cli.port))
        .with_context(|| format!("bind {}:{}", cli.bind, cli.port))?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    println!("udp-agentd ({}) on {}:{}", config.display_name, cli.bind, cli.port);
    println!(
        "demo target: base 0x{:016X} len {} bytes, message at 0x{:016X}",
        layout.base, layout.len, layout.message_addr
    );
    println!(
        "forbidden:   0x{:016X}..0x{:016X}",
        layout.secret_start, layout.secret_end
    );

    let mut peer: Option<SocketAddr> = None;
    let mut pending: Vec<u8> = Vec::new();
    let mut rx = [0u8; 2048];
    let mut tx = [0u8; 512];
    let mut last_tick = Instant::now();

    loop {
        // Drain whatever datagrams arrived since the previous tick.
        loop {
            match socket.recv_from(&mut rx) {
                Ok((n, from)) => {
                    peer = Some(from);
                    pending.extend_from_slice(&rx[..n]);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => return Err(err).context("recv_from"),
            }
        }

        // Bytes the agent is not ready for stay queued; that is the
        // transport-side half of the one-request-deep pipeline.
        if !pending.is_empty() {
            let consumed = handler.receive_data(&pending);
            pending.drain(..consumed);
        }

        let dt = last_tick.elapsed();
        last_tick = Instant::now();
        handler.process(dt.as_micros().min(u128::from(u32::MAX)) as u32);

        while handler.data_to_send() > 0 {
            let n = handler.pop_data(&mut tx);
            if let Some(addr) = peer {
                socket.send_to(&tx[..n], addr).context("send_to")?;
            }
        }

        std::thread::sleep(cli.tick);
    }
}
