//! socketr demo client
//!
//! Connects to a text-mode server, sends a numbered `Message N` line at a
//! fixed interval and logs every response line.

use clap::Parser;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the demo client
#[derive(Parser, Debug)]
#[command(name = "socketr-client")]
#[command(version)]
#[command(about = "Sends numbered lines to a socketr server", long_about = None)]
struct ClientArgs {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,

    /// Server port
    #[arg(short, long, default_value_t = 12345)]
    port: u16,

    /// Delay between messages in milliseconds
    #[arg(short, long, default_value_t = 3000)]
    interval_ms: u64,

    /// Number of messages to send (unlimited when omitted)
    #[arg(short, long)]
    count: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = ClientArgs::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let stream = TcpStream::connect((args.address.as_str(), args.port)).await?;
    info!(server = %stream.peer_addr()?, "Connected");

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut response = String::new();
    let interval = Duration::from_millis(args.interval_ms);

    let mut counter: u64 = 1;
    loop {
        if args.count.is_some_and(|count| counter > count) {
            break;
        }

        let message = format!("Message {counter}\n");
        counter += 1;

        if let Err(e) = writer.write_all(message.as_bytes()).await {
            error!(error = %e, "Failed to send message");
            break;
        }

        response.clear();
        match reader.read_line(&mut response).await {
            Ok(0) => {
                warn!("Server closed the connection");
                break;
            }
            Ok(_) => info!(response = %response.trim_end(), "Server response"),
            Err(e) => {
                error!(error = %e, "Failed to read response");
                break;
            }
        }

        tokio::time::sleep(interval).await;
    }

    Ok(())
}
