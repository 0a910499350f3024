//! QKDNet relay - fetch the key from the controller and forward it one hop

use clap::error::ErrorKind;
use clap::Parser;
use qkdnet::link::RawSocketLink;
use qkdnet::protocol::KeyRequest;
use qkdnet::relay::RelayRequester;
use qkdnet::{NodeConfig, QkdNetError};
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[clap(name = "qkd-relay")]
#[clap(about = "Request the key over raw control frames and relay it over UDP")]
#[clap(version = "0.1.0")]
struct Args {
    /// Interface to send the request on (needs CAP_NET_RAW)
    interface: String,

    /// Downstream host receiving the relayed key
    downstream: String,

    /// Name of the requesting station
    requester: String,

    /// Name of the peer station
    peer: String,

    /// Requested key size in bits
    size: usize,

    /// Configuration file (JSON)
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            let _ = e.print();
            process::exit(1);
        }
    };

    let filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let config = match NodeConfig::load_or_default(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            process::exit(1);
        }
    };

    let link = match RawSocketLink::open(&args.interface) {
        Ok(link) => link,
        Err(e) => {
            eprintln!("Failed to open {}: {}", args.interface, e);
            process::exit(1);
        }
    };

    let requester = RelayRequester::new(link, config.relay);
    let request = KeyRequest::new(&args.requester, &args.peer, args.size);

    match requester.relay(&request, &args.downstream).await {
        Ok(n_bits) => println!("Relayed {} bits to {}", n_bits, args.downstream),
        Err(e @ (QkdNetError::Timeout(_) | QkdNetError::Protocol(_))) => {
            eprintln!("No usable key reply: {}", e);
            process::exit(2);
        }
        Err(e) => {
            eprintln!("Relay failed: {}", e);
            process::exit(1);
        }
    }
}
