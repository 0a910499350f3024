//! QKDNet consumer - receive one relayed key

use clap::Parser;
use qkdnet::{NodeConfig, RelayConsumer};
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[clap(name = "qkd-consumer")]
#[clap(about = "Wait for a single relayed key datagram")]
#[clap(version = "0.1.0")]
struct Args {
    /// Configuration file (JSON)
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration
    #[clap(short, long)]
    listen: Option<String>,

    /// Print the received bits
    #[clap(long)]
    show_key: bool,

    /// Verbose output
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let mut config = match NodeConfig::load_or_default(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            process::exit(1);
        }
    };
    if let Some(listen) = args.listen {
        config.relay.consumer_listen_addr = listen;
    }

    let addr = match config.relay.consumer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    let consumer = match RelayConsumer::bind(addr).await {
        Ok(consumer) => consumer,
        Err(e) => {
            eprintln!("Failed to listen on {}: {}", addr, e);
            process::exit(1);
        }
    };

    match consumer.receive().await {
        Ok(Some(bits)) => {
            println!("Received key: {} bits", bits.len());
            if args.show_key {
                println!("{}", bits);
            }
        }
        Ok(None) => {
            eprintln!("Received an unexpected datagram, no key extracted");
            process::exit(2);
        }
        Err(e) => {
            eprintln!("Receive failed: {}", e);
            process::exit(1);
        }
    }
}
