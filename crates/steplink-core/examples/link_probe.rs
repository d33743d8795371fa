//! Link Probe Tool
//!
//! Opens a controller port, runs the boot handshake, optionally sends one
//! command, listens for notifications, and prints the link counters.
//!
//! Usage:
//!   cargo run --example link_probe -- [OPTIONS] [PORT]
//!
//! Options:
//!   --port PORT       Serial port (default: first detected port)
//!   --baud RATE       Baud rate (default: 115200)
//!   --config FILE     Load connection settings from a JSON file
//!   --reset           Pulse DTR before the handshake
//!   --send OP[:HEX]   Send one command, e.g. --send 0x10:0102
//!   --listen N        Poll for N idle periods afterwards (default: 10)
//!   --list            List serial ports and exit
//!
//! Set RUST_LOG=steplink_core=trace to see every byte on the wire.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use steplink_core::config::ConnectionConfig;
use steplink_core::protocol::{list_ports, Connection};
use tracing_subscriber::EnvFilter;

fn parse_byte(text: &str) -> Result<u8> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("invalid byte: {}", text))
}

fn parse_command(text: &str) -> Result<(u8, Vec<u8>)> {
    let (op, data) = text.split_once(':').unwrap_or((text, ""));
    if !data.is_ascii() || data.len() % 2 != 0 {
        bail!("payload must be an even number of hex digits: {}", data);
    }
    let payload = data
        .as_bytes()
        .chunks(2)
        .map(|pair| -> Result<u8> { Ok(u8::from_str_radix(std::str::from_utf8(pair)?, 16)?) })
        .collect::<Result<Vec<u8>>>()
        .with_context(|| format!("invalid payload hex: {}", data))?;
    Ok((parse_byte(op)?, payload))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut port_name: Option<String> = None;
    let mut baud_rate: Option<u32> = None;
    let mut config_path: Option<PathBuf> = None;
    let mut reset = false;
    let mut command: Option<(u8, Vec<u8>)> = None;
    let mut listen = 10u32;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).map(String::as_str);
        match (args[i].as_str(), value) {
            ("--port" | "-p", Some(v)) => {
                port_name = Some(v.to_string());
                i += 1;
            }
            ("--baud" | "-b", Some(v)) => {
                baud_rate = Some(v.parse().context("invalid baud rate")?);
                i += 1;
            }
            ("--config" | "-c", Some(v)) => {
                config_path = Some(PathBuf::from(v));
                i += 1;
            }
            ("--send" | "-s", Some(v)) => {
                command = Some(parse_command(v)?);
                i += 1;
            }
            ("--listen" | "-l", Some(v)) => {
                listen = v.parse().context("invalid poll count")?;
                i += 1;
            }
            ("--reset" | "-r", _) => reset = true,
            ("--list", _) => {
                for port in list_ports() {
                    match (port.vid, port.pid) {
                        (Some(vid), Some(pid)) => println!(
                            "{}  {:04x}:{:04x}  {}",
                            port.name,
                            vid,
                            pid,
                            port.product.unwrap_or_default()
                        ),
                        _ => println!("{}", port.name),
                    }
                }
                return Ok(());
            }
            ("--help" | "-h", _) => {
                println!(
                    "usage: link_probe [--port PORT] [--baud RATE] [--config FILE] [--reset] \
                     [--send OP[:HEX]] [--listen N] [--list]"
                );
                return Ok(());
            }
            (arg, _) if !arg.starts_with('-') => port_name = Some(arg.to_string()),
            (arg, _) => bail!("unknown or incomplete option: {}", arg),
        }
        i += 1;
    }

    let mut config = match &config_path {
        Some(path) => ConnectionConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConnectionConfig::default(),
    };
    if let Some(name) = port_name {
        config.port_name = name;
    }
    if config.port_name.is_empty() {
        config.port_name = list_ports()
            .into_iter()
            .next()
            .map(|p| p.name)
            .context("no serial ports found")?;
    }
    if let Some(baud) = baud_rate {
        config.baud_rate = baud;
    }
    config.reset_on_open |= reset;

    println!("Opening {} at {} baud", config.port_name, config.baud_rate);
    let mut conn = Connection::open(config).context("failed to synchronize with device")?;
    println!("Link synchronized ({:?})", conn.handshake_state());

    if let Some((opcode, payload)) = command {
        let reply = conn.call(opcode, &payload)?;
        println!("Command {:#04x} -> {:02x?}", opcode, reply);
    }

    let mut idle = 0;
    while idle < listen {
        if !conn.poll()? {
            idle += 1;
        }
    }

    let stats = conn.stats();
    println!();
    println!("Link statistics:");
    println!("  tx: {} frames, {} bytes", stats.tx_frames, stats.tx_bytes);
    println!("  rx: {} frames, {} bytes", stats.rx_frames, stats.rx_bytes);
    println!("  retransmissions: {}", stats.retransmissions);
    println!("  NACKs sent:      {}", stats.nacks_sent);
    println!("  duplicates:      {}", stats.duplicates);
    println!("  garbage bytes:   {}", stats.garbage_bytes);
    println!("  debug lines:     {}", stats.debug_lines);
    println!("  moves pending:   {}", conn.outstanding_moves());

    conn.disconnect();
    Ok(())
}
