//! Lossless in-process simulation of the qubit and both channels.
//!
//! Photon-level effects, loss and eavesdropping are not modelled.

use std::time::Duration;
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use crate::codec::Bit;
use crate::qkd::{AttemptId, Basis, ClassicalChannel, QuantumChannel, QubitOps};
use crate::{QkdNetError, Result};

/// Single-qubit state restricted to the four BB84 states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimQubit {
    Zero,
    One,
    Plus,
    Minus,
}

impl SimQubit {
    fn hadamard(self) -> Self {
        match self {
            SimQubit::Zero => SimQubit::Plus,
            SimQubit::One => SimQubit::Minus,
            SimQubit::Plus => SimQubit::Zero,
            SimQubit::Minus => SimQubit::One,
        }
    }
}

impl QubitOps for SimQubit {
    fn prepare(bit: Bit) -> Self {
        if bit {
            SimQubit::One
        } else {
            SimQubit::Zero
        }
    }

    fn rotate(&mut self, basis: Basis) {
        if basis == Basis::Diagonal {
            *self = self.hadamard();
        }
    }

    fn measure(self) -> Bit {
        match self {
            SimQubit::Zero => false,
            SimQubit::One => true,
            // Superposition collapses uniformly
            SimQubit::Plus | SimQubit::Minus => rand::thread_rng().gen(),
        }
    }
}

/// One end of a simulated point-to-point link
pub struct SimLink {
    classical_tx: mpsc::UnboundedSender<String>,
    classical_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    quantum_tx: mpsc::UnboundedSender<(AttemptId, SimQubit)>,
    quantum_rx: Mutex<mpsc::UnboundedReceiver<(AttemptId, SimQubit)>>,
}

impl SimLink {
    /// Create two connected link ends
    pub fn pair() -> (SimLink, SimLink) {
        let (a_classical_tx, b_classical_rx) = mpsc::unbounded_channel();
        let (b_classical_tx, a_classical_rx) = mpsc::unbounded_channel();
        let (a_quantum_tx, b_quantum_rx) = mpsc::unbounded_channel();
        let (b_quantum_tx, a_quantum_rx) = mpsc::unbounded_channel();

        let a = SimLink {
            classical_tx: a_classical_tx,
            classical_rx: Mutex::new(a_classical_rx),
            quantum_tx: a_quantum_tx,
            quantum_rx: Mutex::new(a_quantum_rx),
        };
        let b = SimLink {
            classical_tx: b_classical_tx,
            classical_rx: Mutex::new(b_classical_rx),
            quantum_tx: b_quantum_tx,
            quantum_rx: Mutex::new(b_quantum_rx),
        };
        (a, b)
    }
}

async fn recv_within<T>(rx: &Mutex<mpsc::UnboundedReceiver<T>>, timeout: Duration) -> Result<Option<T>> {
    let mut rx = rx.lock().await;
    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Some(item)) => Ok(Some(item)),
        Ok(None) => Err(QkdNetError::Transport("peer closed the link".into())),
        Err(_) => Ok(None),
    }
}

#[async_trait::async_trait]
impl ClassicalChannel for SimLink {
    async fn send_classical(&self, message: String) -> Result<()> {
        log::trace!("sim: classical -> {}", message);
        self.classical_tx
            .send(message)
            .map_err(|_| QkdNetError::Transport("peer closed the link".into()))
    }

    async fn recv_classical(&self, timeout: Duration) -> Result<Option<String>> {
        recv_within(&self.classical_rx, timeout).await
    }
}

#[async_trait::async_trait]
impl QuantumChannel for SimLink {
    type Qubit = SimQubit;

    async fn send_qubit(&self, id: AttemptId, qubit: SimQubit) -> Result<()> {
        self.quantum_tx
            .send((id, qubit))
            .map_err(|_| QkdNetError::Transport("peer closed the link".into()))
    }

    async fn recv_qubit(&self, timeout: Duration) -> Result<Option<(AttemptId, SimQubit)>> {
        recv_within(&self.quantum_rx, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_and_measure(bit: Bit, sent: Basis, measured: Basis) -> Bit {
        let mut q = SimQubit::prepare(bit);
        q.rotate(sent);
        q.rotate(measured);
        q.measure()
    }

    #[test]
    fn test_matching_basis_is_deterministic() {
        for bit in [false, true] {
            for basis in [Basis::Rectilinear, Basis::Diagonal] {
                for _ in 0..20 {
                    assert_eq!(send_and_measure(bit, basis, basis), bit);
                }
            }
        }
    }

    #[test]
    fn test_mismatched_basis_is_random() {
        let outcomes: Vec<Bit> = (0..200)
            .map(|_| send_and_measure(false, Basis::Diagonal, Basis::Rectilinear))
            .collect();
        assert!(outcomes.contains(&true));
        assert!(outcomes.contains(&false));
    }

    #[tokio::test]
    async fn test_link_delivers_in_order() {
        let (a, b) = SimLink::pair();
        a.send_classical("first".into()).await.unwrap();
        a.send_classical("second".into()).await.unwrap();
        a.send_qubit(AttemptId::new(0, 1), SimQubit::Minus).await.unwrap();

        let wait = Duration::from_millis(100);
        assert_eq!(b.recv_classical(wait).await.unwrap().as_deref(), Some("first"));
        assert_eq!(b.recv_classical(wait).await.unwrap().as_deref(), Some("second"));
        assert_eq!(b.recv_qubit(wait).await.unwrap(), Some((AttemptId::new(0, 1), SimQubit::Minus)));
        assert_eq!(a.recv_classical(Duration::from_millis(10)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropped_peer_is_transport_error() {
        let (a, b) = SimLink::pair();
        drop(b);
        assert!(matches!(
            a.recv_classical(Duration::from_millis(10)).await,
            Err(QkdNetError::Transport(_))
        ));
        assert!(a.send_qubit(AttemptId::new(0, 1), SimQubit::Zero).await.is_err());
    }
}
