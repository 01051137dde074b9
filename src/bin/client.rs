//! multiconn-client: send one message to a multiconn server and print the reply.

use clap::Parser;
use multiconn::{Connection, ConnectionEvent, ConnectionOptions, Encoding};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the client
#[derive(Parser, Debug)]
#[command(name = "multiconn-client")]
#[command(version = "0.1.0")]
#[command(about = "Send one <<EOF>>-framed message and print the reply", long_about = None)]
struct Args {
    /// Message to send
    message: String,

    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 5500)]
    port: u16,

    /// Text encoding used on the wire
    #[arg(long, value_enum, default_value = "utf-8")]
    encoding: Encoding,

    /// Seconds to wait for a reply
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let (events_tx, mut events) = mpsc::unbounded_channel::<ConnectionEvent>();
    let connection = Connection::unconnected(ConnectionOptions {
        encoding: args.encoding,
        ..Default::default()
    });
    connection.subscribe(Arc::new(events_tx))?;
    connection.connect(&args.host, args.port).await?;
    connection.send(&args.message)?;

    match tokio::time::timeout(Duration::from_secs(args.timeout), events.recv()).await {
        Ok(Some(ConnectionEvent::Message { text, .. })) => println!("Received : {text}"),
        Ok(Some(ConnectionEvent::Closed { .. })) | Ok(None) => eprintln!("Server disconnected"),
        Err(_) => eprintln!("No reply within {}s", args.timeout),
    }

    connection.close();
    Ok(())
}
