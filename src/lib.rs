//! QKDNet - quantum key agreement with SDN-controller key custody
//!
//! A simulated BB84-style key agreement produces a sifted key, which is pushed
//! to a network controller acting as key custodian. End stations then pull the
//! key through the data plane with raw link-layer control frames and relay it
//! one hop further over UDP.

pub mod codec;
pub mod cipher;
pub mod config;
pub mod qkd;
pub mod custodian;
pub mod ingest;
pub mod protocol;
pub mod frame;
pub mod link;
pub mod controller;
pub mod relay;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QkdNetError {
    #[error("Bad key format: {0}")]
    Format(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("No key available")]
    NoKeyAvailable,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, QkdNetError>;

/// Re-exports for convenience
pub use codec::{Bit, PackedKey};
pub use config::NodeConfig;
pub use custodian::{KeyCustodian, StoredKey};
pub use ingest::{PushIngestListener, PushResponse};
pub use frame::{EthernetFrame, MacAddr};
pub use controller::Controller;
pub use relay::{RelayConsumer, RelayRequester};
