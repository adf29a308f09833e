use anyhow::{bail, Context, Result};
use keybridge::common;
use keybridge::input::LoggingSink;
use keybridge::peer_link::{LinkConfig, LinkEvent, PeerLink, SignalCode};
use keybridge::stream::{StreamEvent, StreamReceiver, StreamSender};
use keybridge::stun::{self, StunClient};
use std::env;
use tokio::io::{AsyncBufReadExt, BufReader};

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        std::process::exit(1);
    }

    match args[1].as_str() {
        "stun" => {
            if args.len() != 3 {
                eprintln!("Usage: {} stun <local_port>", args[0]);
                std::process::exit(1);
            }
            let local_port = parse_port(&args[2])?;
            run_stun(local_port)?
        }
        "link" => {
            let (local_port, peer) = parse_peer_args(&args, "link")?;
            run_link(local_port, &peer)?
        }
        "stream-send" => {
            let (local_port, peer) = parse_peer_args(&args, "stream-send")?;
            run_stream_send(local_port, &peer)?
        }
        "stream-recv" => {
            let (local_port, peer) = parse_peer_args(&args, "stream-recv")?;
            run_stream_recv(local_port, &peer)?
        }
        _ => {
            eprintln!("Error: Invalid mode '{}'", args[1]);
            eprintln!();
            print_usage(&args[0]);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_usage(program_name: &str) {
    eprintln!("keybridge - NAT discovery and UDP peer signaling for input forwarding");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  {} stun <local_port>                      # Discover the public endpoint of a local port", program_name);
    eprintln!("  {} link -p <local_port> <peer IP:PORT>    # Run the signaling link to a peer", program_name);
    eprintln!("  {} stream-send -p <local_port> <peer IP:PORT>  # Forward captured input events", program_name);
    eprintln!("  {} stream-recv -p <local_port> <peer IP:PORT>  # Receive and apply input events", program_name);
    eprintln!();
    eprintln!("STUN MODE:");
    eprintln!("  Prints the public \"IP:port\" of the local UDP port once per query round.");
    eprintln!("  Exchange that address with the remote peer out of band, then run 'link'.");
    eprintln!();
    eprintln!("  Optional environment variables:");
    eprintln!("    STUN_SERVER         STUN server as host:port");
    eprintln!("                        (default: {}:{})", stun::GOOGLE_STUN_SERVER, stun::GOOGLE_STUN_PORT);
    eprintln!();
    eprintln!("LINK MODE:");
    eprintln!("  Reads control tokens from stdin: stream_request, stream_accept, stream_reject.");
    eprintln!("  Prints round-trip latency (milliseconds) and received signal tokens to stdout.");
}

/// Validate and parse the `-p <local_port> <peer IP:PORT>` argument form
/// shared by the link and stream modes.
fn parse_peer_args(args: &[String], mode: &str) -> Result<(u16, String)> {
    if args.len() != 5 || args[2] != "-p" {
        bail!(
            "Invalid arguments. Usage: {} {} -p <local_port> <peer_address> (IP:PORT)",
            args[0],
            mode
        );
    }

    let local_port = parse_port(&args[3])?;

    if !common::validate_socket_string(&args[4]) {
        bail!("Invalid peer address: {}", args[4]);
    }

    Ok((local_port, args[4].clone()))
}

fn parse_port(port_str: &str) -> Result<u16> {
    if !common::validate_port_str(port_str) {
        bail!("Invalid port number: {}", port_str);
    }
    port_str.parse().context("Invalid port number")
}

/// The STUN server to query, from the environment or the default.
fn stun_server_from_env() -> Result<(String, u16)> {
    match env::var("STUN_SERVER") {
        Err(_) => Ok((stun::GOOGLE_STUN_SERVER.to_string(), stun::GOOGLE_STUN_PORT)),
        Ok(value) => {
            let (host, port) = common::extract_ip_port(&value)
                .with_context(|| format!("STUN_SERVER must be host:port, got '{}'", value))?;
            if host.is_empty() || !common::validate_port_str(port) {
                bail!("STUN_SERVER must be host:port, got '{}'", value);
            }
            Ok((host.to_string(), port.parse()?))
        }
    }
}

/// Periodically discover and print the public endpoint of the local port.
fn run_stun(local_port: u16) -> Result<()> {
    let (server_name, server_port) = stun_server_from_env()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut client = StunClient::new(local_port);
        client
            .periodic_query(
                |endpoint| match endpoint {
                    Some(endpoint) => println!("{}", endpoint),
                    None => eprintln!("Public endpoint unknown"),
                },
                stun::QUERY_INTERVAL,
                &server_name,
                server_port,
            )
            .await
    })
}

/// Run the signaling link, wiring stdin tokens in and observer events out.
fn run_link(local_port: u16, peer: &str) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (link, mut handle) = PeerLink::bind(local_port, peer, LinkConfig::default()).await?;

        let commander = handle.commander();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let token = line.trim();
                if token.is_empty() {
                    continue;
                }
                match SignalCode::from_token(token) {
                    Some(code) => {
                        if commander.command(code).await.is_err() {
                            break;
                        }
                    }
                    None => eprintln!("Unknown command: {}", token),
                }
            }
        });

        tokio::spawn(async move {
            while let Some(event) = handle.next_event().await {
                match event {
                    LinkEvent::Pong { latency } => println!("{}", latency.as_millis()),
                    LinkEvent::Signal { received, .. } => {
                        if let Some(token) = received.token() {
                            println!("{}", token);
                        }
                    }
                    LinkEvent::Acked(code) => {
                        if let Some(token) = code.token() {
                            println!("{}", token);
                        }
                    }
                    LinkEvent::TimedOut => {}
                }
            }
        });

        link.run().await
    })
}

/// Forward input events read from stdin (one encoded event per line).
fn run_stream_send(local_port: u16, peer: &str) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (sender, mut handle) =
            StreamSender::bind(local_port, peer, LinkConfig::default()).await?;

        let forwarder = handle.forwarder();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                match keybridge::InputEvent::parse(text) {
                    Ok(event) => {
                        if forwarder.forward(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => eprintln!("Invalid input event: {}", e),
                }
            }
        });

        tokio::spawn(async move {
            while let Some(event) = handle.next_event().await {
                if let StreamEvent::Pong { latency } = event {
                    println!("{}", latency.as_millis());
                }
            }
        });

        sender.run().await
    })
}

/// Receive the input stream and hand events to the configured sink.
fn run_stream_recv(local_port: u16, peer: &str) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let receiver = StreamReceiver::bind(local_port, peer, Box::new(LoggingSink)).await?;
        receiver.run().await
    })
}
