//! QKDNet controller - key custodian serving pushes and REQ_KEY frames

use clap::Parser;
use qkdnet::controller::{Controller, RawPortDatapath};
use qkdnet::ingest::PushIngestListener;
use qkdnet::link::RawSocketLink;
use qkdnet::{KeyCustodian, NodeConfig};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(name = "qkd-controller")]
#[clap(about = "QKD key custodian - accept key pushes and serve keys on the data plane")]
#[clap(version = "0.1.0")]
struct Args {
    /// Configuration file (JSON)
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Push listener address, overrides the configuration
    #[clap(short, long)]
    listen: Option<String>,

    /// Serve REQ_KEY frames on this interface (needs CAP_NET_RAW)
    #[clap(short, long)]
    interface: Option<String>,

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
        config.controller.push_listen_addr = listen;
    }

    let custodian = KeyCustodian::new();
    let listener = PushIngestListener::new(custodian.clone(), config.controller.clone());

    let Some(interface) = args.interface else {
        if let Err(e) = listener.start().await {
            eprintln!("Push listener failed: {}", e);
            process::exit(1);
        }
        return;
    };

    let link = match RawSocketLink::open(&interface) {
        Ok(link) => Arc::new(link),
        Err(e) => {
            eprintln!("Failed to open {}: {}", interface, e);
            process::exit(1);
        }
    };
    let datapath = RawPortDatapath::new(link, config.controller.control_ethertype);
    let controller = Controller::new(custodian, config.controller.clone());

    tokio::select! {
        result = listener.start() => {
            if let Err(e) = result {
                eprintln!("Push listener failed: {}", e);
                process::exit(1);
            }
        }
        result = datapath.run(&controller) => {
            if let Err(e) = result {
                eprintln!("Datapath on {} failed: {}", interface, e);
                process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
        }
    }
}
