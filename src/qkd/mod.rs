//! Simulated quantum key agreement
//!
//! The qubit physics and both channels are external capabilities, consumed
//! through the [`QubitOps`], [`ClassicalChannel`] and [`QuantumChannel`]
//! traits. [`sim`] provides a lossless in-process implementation.

use std::fmt;
use std::time::Duration;
use rand::Rng;
use crate::codec::Bit;
use crate::Result;

pub mod bb84;
pub mod message;
pub mod sim;

pub use bb84::{KeyAgreementSession, SessionStats};
pub use message::{AttemptId, HandshakeMessage};
pub use sim::{SimLink, SimQubit};

/// Encoding/measurement basis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Basis {
    Rectilinear,
    Diagonal,
}

impl Basis {
    /// Pick a basis uniformly at random
    pub fn random() -> Self {
        if rand::thread_rng().gen::<bool>() {
            Basis::Diagonal
        } else {
            Basis::Rectilinear
        }
    }

    /// Wire digit: 0 rectilinear, 1 diagonal
    pub fn digit(self) -> u8 {
        match self {
            Basis::Rectilinear => 0,
            Basis::Diagonal => 1,
        }
    }

    pub fn from_digit(digit: &str) -> Option<Self> {
        match digit {
            "0" => Some(Basis::Rectilinear),
            "1" => Some(Basis::Diagonal),
            _ => None,
        }
    }
}

impl fmt::Display for Basis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.digit())
    }
}

/// Single-qubit primitives supplied by the physical layer
pub trait QubitOps: Send + Sized + 'static {
    /// Prepare a qubit holding `bit` in the rectilinear basis
    fn prepare(bit: Bit) -> Self;

    /// Rotate into `basis` (a Hadamard for the diagonal basis, identity otherwise)
    fn rotate(&mut self, basis: Basis);

    /// Measure in the computational basis, collapsing the state
    fn measure(self) -> Bit;
}

/// Classical (authenticated, public) message channel to the peer
#[async_trait::async_trait]
pub trait ClassicalChannel: Send + Sync {
    async fn send_classical(&self, message: String) -> Result<()>;

    /// Wait up to `timeout` for the next message; `None` on timeout
    async fn recv_classical(&self, timeout: Duration) -> Result<Option<String>>;
}

/// Quantum channel to the peer
///
/// Each qubit travels with the [`AttemptId`] it was prepared for, so a
/// receiver can tell a retry's qubit from one left over by an earlier try.
#[async_trait::async_trait]
pub trait QuantumChannel: Send + Sync {
    type Qubit: QubitOps;

    async fn send_qubit(&self, id: AttemptId, qubit: Self::Qubit) -> Result<()>;

    /// Wait up to `timeout` for the next qubit; `None` on timeout
    async fn recv_qubit(&self, timeout: Duration) -> Result<Option<(AttemptId, Self::Qubit)>>;
}
