//! BB84-style key agreement handshake
//!
//! The initiator owns the secret bits. For every key position it sends a
//! qubit under a fresh random basis; the responder measures under its own
//! random basis and announces `<seq>.<attempt>:<basis>`. Only positions where
//! both bases agree are kept (sifting), and the sequence counter on each side
//! advances only on an accepted attempt.
//!
//! Qubits and messages carry the [`AttemptId`] they belong to. A late
//! announcement for an earlier try at the current position is still judged
//! against the basis that try used, a late confirmation is applied to the
//! measurement it refers to, and anything for a finished position is
//! discarded. Both sides therefore keep the same bit even when a timeout
//! makes them retry out of step.
//!
//! Each position gets at most `max_attempts_per_position` attempts. Timeouts
//! back off exponentially; basis mismatches are ordinary sifting losses and
//! only wait the regular pause.

use std::collections::HashMap;
use tokio::time::Instant;
use crate::cipher;
use crate::codec::Bit;
use crate::config::HandshakeConfig;
use crate::qkd::{AttemptId, Basis, ClassicalChannel, HandshakeMessage, QuantumChannel, QubitOps};
use crate::{QkdNetError, Result};

/// Counters for one run of either role
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub attempts: u64,
    pub accepted: u64,
    pub basis_mismatches: u64,
    pub timeouts: u64,
    /// Stale or unparseable messages and qubits that were discarded
    pub out_of_sync: u64,
}

/// What happened to one attempt at a key position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Accepted(Bit),
    BasisMismatch,
    Timeout,
}

/// Responder bookkeeping for the position being worked on
struct ResponderPosition<L: QuantumChannel> {
    seq: u64,
    /// Bits measured per announced attempt, awaiting confirmation
    measured: HashMap<u32, Bit>,
    /// Qubit already received for a later position
    early: Option<(AttemptId, L::Qubit)>,
}

/// One side of a key agreement over a classical + quantum link
pub struct KeyAgreementSession<L> {
    link: L,
    config: HandshakeConfig,
    stats: SessionStats,
}

impl<L> KeyAgreementSession<L>
where
    L: ClassicalChannel + QuantumChannel,
{
    pub fn new(link: L, config: HandshakeConfig) -> Self {
        Self {
            link,
            config,
            stats: SessionStats::default(),
        }
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Run the initiator role over `secret`, returning the sifted key.
    ///
    /// Under a lossless link every position is eventually accepted, so the
    /// sifted key has the same length as `secret`.
    pub async fn run_initiator(&mut self, secret: &[Bit]) -> Result<Vec<Bit>> {
        log::info!("Initiator: agreeing on {} key bits", secret.len());
        let mut sifted = Vec::with_capacity(secret.len());
        let mut seq: u64 = 0;

        for &bit in secret {
            // Basis used by each attempt at this position, index = attempt - 1
            let mut bases: Vec<Basis> = Vec::new();
            let mut timeouts = 0u32;
            loop {
                if bases.len() as u32 >= self.config.max_attempts_per_position {
                    return Err(QkdNetError::Handshake(format!(
                        "initiator gave up on position {} after {} attempts",
                        seq, self.config.max_attempts_per_position
                    )));
                }
                self.stats.attempts += 1;

                let outcome = self.initiator_attempt(seq, bit, &mut bases).await?;
                self.record(outcome);
                match outcome {
                    AttemptOutcome::Accepted(bit) => {
                        sifted.push(bit);
                        seq += 1;
                        log::debug!("Initiator: position {} accepted ({} bits so far)", seq - 1, sifted.len());
                        tokio::time::sleep(self.config.pause()).await;
                        break;
                    }
                    AttemptOutcome::Timeout => {
                        timeouts += 1;
                        tokio::time::sleep(self.config.backoff(timeouts)).await;
                    }
                    AttemptOutcome::BasisMismatch => {
                        tokio::time::sleep(self.config.pause()).await;
                    }
                }
            }
        }

        log::info!("Initiator: sifted key complete ({} bits, {} attempts)", sifted.len(), self.stats.attempts);
        Ok(sifted)
    }

    async fn initiator_attempt(&mut self, seq: u64, bit: Bit, bases: &mut Vec<Basis>) -> Result<AttemptOutcome> {
        let basis = Basis::random();
        bases.push(basis);
        let id = AttemptId::new(seq, bases.len() as u32);

        let mut qubit = <<L as QuantumChannel>::Qubit as QubitOps>::prepare(bit);
        qubit.rotate(basis);
        self.link.send_qubit(id, qubit).await?;

        let deadline = Instant::now() + self.config.wait_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let text = match self.link.recv_classical(remaining).await? {
                Some(text) => text,
                None => {
                    log::debug!("Initiator: no announcement for {}", id);
                    return Ok(AttemptOutcome::Timeout);
                }
            };

            let (answered, their_basis) = match HandshakeMessage::parse_announcement(&text) {
                Ok(HandshakeMessage::Announce { id: answered, basis }) if answered.seq == seq => (answered, basis),
                Ok(other) => {
                    log::debug!("Initiator: discarding stale {} during {}", other, id);
                    self.stats.out_of_sync += 1;
                    continue;
                }
                Err(e) => {
                    log::warn!("Initiator: discarding message: {}", e);
                    self.stats.out_of_sync += 1;
                    continue;
                }
            };
            let sent_basis = match (answered.attempt as usize).checked_sub(1).and_then(|i| bases.get(i)) {
                Some(&sent_basis) => sent_basis,
                None => {
                    log::warn!("Initiator: announcement for unsent attempt {}", answered);
                    self.stats.out_of_sync += 1;
                    continue;
                }
            };
            if answered != id {
                log::debug!("Initiator: late announcement for {} answered during {}", answered, id);
            }

            let (outcome, reply) = if sent_basis == their_basis {
                let disclosed = self.config.disclose_bits.then_some(bit);
                (AttemptOutcome::Accepted(bit), HandshakeMessage::Match { id: answered, bit: disclosed })
            } else {
                (AttemptOutcome::BasisMismatch, HandshakeMessage::Mismatch { id: answered })
            };
            self.link.send_classical(reply.to_string()).await?;
            return Ok(outcome);
        }
    }

    /// Run the responder role until `key_len` bits have been kept.
    pub async fn run_responder(&mut self, key_len: usize) -> Result<Vec<Bit>> {
        log::info!("Responder: collecting {} key bits", key_len);
        let mut key = Vec::with_capacity(key_len);
        let mut position = ResponderPosition::<L> {
            seq: 0,
            measured: HashMap::new(),
            early: None,
        };

        while key.len() < key_len {
            let mut attempts = 0u32;
            let mut timeouts = 0u32;
            loop {
                attempts += 1;
                if attempts > self.config.max_attempts_per_position {
                    return Err(QkdNetError::Handshake(format!(
                        "responder gave up on position {} after {} attempts",
                        position.seq, self.config.max_attempts_per_position
                    )));
                }
                self.stats.attempts += 1;

                let outcome = self.responder_attempt(&mut position).await?;
                self.record(outcome);
                match outcome {
                    AttemptOutcome::Accepted(bit) => {
                        key.push(bit);
                        log::debug!("Responder: kept bit for position {}", position.seq);
                        position.seq += 1;
                        position.measured.clear();
                        tokio::time::sleep(self.config.pause()).await;
                        break;
                    }
                    AttemptOutcome::Timeout => {
                        timeouts += 1;
                        tokio::time::sleep(self.config.backoff(timeouts)).await;
                    }
                    AttemptOutcome::BasisMismatch => {
                        tokio::time::sleep(self.config.pause()).await;
                    }
                }
            }
        }

        log::info!("Responder: key complete ({} bits, {} attempts)", key.len(), self.stats.attempts);
        Ok(key)
    }

    async fn responder_attempt(&mut self, position: &mut ResponderPosition<L>) -> Result<AttemptOutcome> {
        let seq = position.seq;
        let (id, mut qubit) = match position.early.take() {
            Some(tagged) if tagged.0.seq == seq => tagged,
            Some(tagged) => {
                // The initiator already moved past this position; its confirmation is in flight
                position.early = Some(tagged);
                return self.await_confirmation(position).await;
            }
            None => {
                let deadline = Instant::now() + self.config.wait_timeout();
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match self.link.recv_qubit(remaining).await? {
                        None => {
                            log::trace!("Responder: still waiting for a qubit at position {}", seq);
                            return Ok(AttemptOutcome::Timeout);
                        }
                        Some((stale, _)) if stale.seq < seq => {
                            log::debug!("Responder: discarding qubit for finished {}", stale);
                            self.stats.out_of_sync += 1;
                        }
                        Some(tagged) if tagged.0.seq > seq => {
                            position.early = Some(tagged);
                            return self.await_confirmation(position).await;
                        }
                        Some(tagged) => break tagged,
                    }
                }
            }
        };

        let basis = Basis::random();
        qubit.rotate(basis);
        position.measured.insert(id.attempt, qubit.measure());

        let announce = HandshakeMessage::Announce { id, basis };
        self.link.send_classical(announce.to_string()).await?;
        self.await_confirmation(position).await
    }

    /// Wait for the initiator's verdict on any announced attempt at the
    /// current position
    async fn await_confirmation(&mut self, position: &mut ResponderPosition<L>) -> Result<AttemptOutcome> {
        let deadline = Instant::now() + self.config.wait_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let text = match self.link.recv_classical(remaining).await? {
                Some(text) => text,
                None => {
                    log::debug!("Responder: no confirmation for position {}", position.seq);
                    return Ok(AttemptOutcome::Timeout);
                }
            };

            match HandshakeMessage::parse_confirmation(&text) {
                Ok(HandshakeMessage::Match { id, bit }) if id.seq == position.seq => {
                    if let Some(&measured) = position.measured.get(&id.attempt) {
                        return Ok(AttemptOutcome::Accepted(bit.unwrap_or(measured)));
                    }
                    log::warn!("Responder: match for unannounced attempt {}", id);
                }
                Ok(HandshakeMessage::Mismatch { id }) if id.seq == position.seq => {
                    if position.measured.remove(&id.attempt).is_some() {
                        return Ok(AttemptOutcome::BasisMismatch);
                    }
                    log::warn!("Responder: mismatch for unannounced attempt {}", id);
                }
                Ok(other) => {
                    log::debug!("Responder: out-of-sync message {} at position {}", other, position.seq);
                }
                Err(e) => log::warn!("Responder: discarding message: {}", e),
            }
            self.stats.out_of_sync += 1;
        }
    }

    fn record(&mut self, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Accepted(_) => self.stats.accepted += 1,
            AttemptOutcome::BasisMismatch => self.stats.basis_mismatches += 1,
            AttemptOutcome::Timeout => self.stats.timeouts += 1,
        }
    }

    /// Send `message` encrypted under the agreed key as `-1:<ciphertext>`
    pub async fn send_encrypted(&self, key: &[Bit], message: &str) -> Result<()> {
        let ciphertext = cipher::seal(key, message)?;
        log::info!("Sending encrypted message ({} chars)", message.chars().count());
        self.link
            .send_classical(HandshakeMessage::Encrypted(ciphertext).to_string())
            .await
    }

    /// Wait for an encrypted payload and decrypt it with `key`.
    ///
    /// Other messages still in flight are skipped. Gives up after
    /// `max_attempts_per_position` empty waits.
    pub async fn receive_encrypted(&self, key: &[Bit]) -> Result<String> {
        for _ in 0..self.config.max_attempts_per_position {
            let text = match self.link.recv_classical(self.config.wait_timeout()).await? {
                Some(text) => text,
                None => continue,
            };
            if let Ok(HandshakeMessage::Encrypted(ciphertext)) = HandshakeMessage::parse_confirmation(&text) {
                let plaintext = cipher::open(key, &ciphertext)?;
                log::info!("Received encrypted message ({} chars)", plaintext.chars().count());
                return Ok(plaintext);
            }
            log::debug!("Skipping non-payload message {:?}", text);
        }
        Err(QkdNetError::Timeout("no encrypted payload received".into()))
    }
}
