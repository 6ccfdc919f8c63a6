//! Runs one command over SSH and prints its output.
//!
//! Usage:
//!   KESTREL_PASSWORD=<password> cargo run --example exec <host:port> <username> <command> [fingerprint]
//!
//! Example:
//!   KESTREL_PASSWORD=secret cargo run --example exec 127.0.0.1:22 admin "uname -a"
//!
//! Without a fingerprint every host key is accepted and the server's
//! fingerprint is logged, so it can be pinned on the next run.
//! `RUST_LOG=debug` shows the protocol steps.

use kestrel_proto::ssh::auth::PasswordList;
use kestrel_proto::ssh::client::{Client, ClientConfig};
use kestrel_proto::ssh::hostkey::FingerprintCheck;
use std::env;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 4 && args.len() != 5 {
        eprintln!(
            "Usage: KESTREL_PASSWORD=<password> {} <host:port> <username> <command> [fingerprint]",
            args[0]
        );
        std::process::exit(1);
    }
    let password = env::var("KESTREL_PASSWORD").map_err(|_| "KESTREL_PASSWORD is not set")?;

    let mut config =
        ClientConfig::new(args[2].as_str()).with_password_supplier(PasswordList::new([password]));
    if let Some(fingerprint) = args.get(4) {
        config = config.with_host_key_check(FingerprintCheck::new(fingerprint.as_str()));
    }

    let mut client = Client::connect(args[1].as_str(), config).await?;
    let output = client.exec(&args[3]).await?;
    client.close().await?;

    print!("{}", String::from_utf8_lossy(&output.stdout));
    eprint!("{}", String::from_utf8_lossy(&output.stderr));
    std::io::Write::flush(&mut std::io::stdout())?;
    match output.exit_status {
        Some(status) => std::process::exit(status as i32),
        None => Ok(()),
    }
}
