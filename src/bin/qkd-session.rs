//! QKDNet session - run a simulated key agreement and hand the key to the controller

use clap::Parser;
use qkdnet::codec::{pack, parse_bitstring, to_bitstring};
use qkdnet::custodian::KEY_PREFIX;
use qkdnet::ingest::{push_key, PushResponse, DEFAULT_PUSH_TIMEOUT};
use qkdnet::qkd::{KeyAgreementSession, SimLink};
use qkdnet::{Bit, NodeConfig};
use rand::Rng;
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[clap(name = "qkd-session")]
#[clap(about = "Run both key agreement roles over the simulator and push the sifted key")]
#[clap(version = "0.1.0")]
struct Args {
    /// Configuration file (JSON)
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Number of key bits to agree on
    #[clap(short = 'n', long, default_value = "16")]
    bits: usize,

    /// Use this secret instead of a random one (string of 0/1)
    #[clap(long)]
    secret: Option<String>,

    /// Controller push address, overrides the configuration
    #[clap(long)]
    controller: Option<String>,

    /// Skip pushing the key to the controller
    #[clap(long)]
    no_push: bool,

    /// Message sent encrypted under the agreed key
    #[clap(short, long, default_value = "hello")]
    message: String,

    /// Verbose output
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let config = match NodeConfig::load_or_default(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            process::exit(1);
        }
    };

    let secret: Vec<Bit> = match &args.secret {
        Some(text) => match parse_bitstring(text) {
            Some(bits) => bits,
            None => {
                eprintln!("Secret must be a non-empty string of 0 and 1");
                process::exit(1);
            }
        },
        None => {
            let mut rng = rand::thread_rng();
            (0..args.bits).map(|_| rng.gen()).collect()
        }
    };
    if secret.is_empty() {
        eprintln!("Key length must be at least 1");
        process::exit(1);
    }

    let (initiator_end, responder_end) = SimLink::pair();
    let mut initiator = KeyAgreementSession::new(initiator_end, config.handshake.clone());
    let mut responder = KeyAgreementSession::new(responder_end, config.handshake.clone());

    let key_len = secret.len();
    let (initiator_key, responder_key) = tokio::join!(
        initiator.run_initiator(&secret),
        responder.run_responder(key_len)
    );
    let (initiator_key, responder_key) = match (initiator_key, responder_key) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("Key agreement failed: {}", e);
            process::exit(1);
        }
    };

    let stats = initiator.stats();
    log::info!(
        "Agreed on {} bits in {} attempts ({} basis mismatches, {} timeouts)",
        initiator_key.len(),
        stats.attempts,
        stats.basis_mismatches,
        stats.timeouts
    );
    if initiator_key != responder_key {
        log::warn!("Initiator and responder keys differ");
    }
    if args.verbose {
        println!("Sifted key: {}", to_bitstring(&initiator_key));
    }

    if !args.no_push {
        let addr = args.controller.unwrap_or_else(|| config.controller.push_listen_addr.clone());
        let payload = format!("{}{}", KEY_PREFIX, pack(&initiator_key));
        match push_key(&addr, &payload, DEFAULT_PUSH_TIMEOUT).await {
            Ok(PushResponse::Ack { n_bits }) => println!("Controller stored {} bits", n_bits),
            Ok(other) => {
                eprintln!("Controller rejected key: {}", other);
                process::exit(1);
            }
            Err(e) => {
                eprintln!("Failed to push key to {}: {}", addr, e);
                process::exit(1);
            }
        }
    }

    let (sent, received) = tokio::join!(
        initiator.send_encrypted(&initiator_key, &args.message),
        responder.receive_encrypted(&responder_key)
    );
    if let Err(e) = sent {
        eprintln!("Failed to send encrypted message: {}", e);
        process::exit(1);
    }
    match received {
        Ok(plaintext) => println!("Responder decrypted: {}", plaintext),
        Err(e) => {
            eprintln!("Failed to receive encrypted message: {}", e);
            process::exit(1);
        }
    }
}
