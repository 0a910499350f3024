//! One-hop key relay
//!
//! A [`RelayRequester`] asks the controller for the key with a broadcast
//! control frame and forwards the reply as a single UDP datagram. The
//! [`RelayConsumer`] on the far side receives exactly one datagram.

use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use crate::codec::is_canonical;
use crate::config::RelayConfig;
use crate::custodian::KEY_PREFIX;
use crate::frame::{EthernetFrame, MacAddr};
use crate::link::FrameLink;
use crate::protocol::{KeyReply, KeyRequest, REQ_KEY};
use crate::{QkdNetError, Result};

/// Largest datagram the consumer accepts
const MAX_DATAGRAM: usize = 65507;

/// Fetches the key over the control channel and relays it downstream
pub struct RelayRequester<L: FrameLink> {
    link: L,
    config: RelayConfig,
}

impl<L: FrameLink> RelayRequester<L> {
    pub fn new(link: L, config: RelayConfig) -> Self {
        Self { link, config }
    }

    /// Broadcast a key request and wait for the controller's answer.
    ///
    /// Returns the canonical key bits. Fails with `Timeout` when nothing
    /// arrives before the reply deadline and with `Protocol` when the reply
    /// carries no key.
    pub async fn request_key(&self, request: &KeyRequest) -> Result<String> {
        let local = self.link.local_mac();
        let frame = EthernetFrame::control(
            MacAddr::BROADCAST,
            local,
            self.config.control_ethertype,
            &request.to_string(),
        );
        self.link.send_frame(&frame).await?;
        log::info!("Sent {} from {}", request, local);

        let deadline = Instant::now() + self.config.reply_deadline();
        let payload = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(QkdNetError::Timeout(format!(
                    "no key reply within {:?}",
                    self.config.reply_deadline()
                )));
            }

            let wait = remaining.min(self.config.poll_interval());
            let frame = match timeout(wait, self.link.recv_frame()).await {
                Ok(frame) => frame?,
                Err(_) => continue,
            };
            if frame.ethertype != self.config.control_ethertype || frame.src == local {
                continue;
            }
            let payload = frame.payload_text();
            if payload.starts_with(REQ_KEY) {
                log::debug!("Ignoring request from {}", frame.src);
                continue;
            }
            break payload;
        };

        match KeyReply::parse(&payload)? {
            KeyReply::Key(bits) => {
                log::info!("Received key reply ({} bits)", bits.len());
                Ok(bits)
            }
            KeyReply::NoKeyAvailable => Err(QkdNetError::Protocol(format!(
                "controller answered {:?}",
                payload
            ))),
        }
    }

    /// Send `KEY:<bits>` to the downstream consumer
    pub async fn forward(&self, bits: &str, downstream: SocketAddr) -> Result<()> {
        let socket = UdpSocket::bind(unspecified_for(&downstream))
            .await
            .map_err(|e| QkdNetError::Transport(format!("bind relay socket: {}", e)))?;
        let datagram = format!("{}{}", KEY_PREFIX, bits);
        socket
            .send_to(datagram.as_bytes(), downstream)
            .await
            .map_err(|e| QkdNetError::Transport(format!("send to {}: {}", downstream, e)))?;
        log::info!("Forwarded {} bits to {}", bits.len(), downstream);
        Ok(())
    }

    /// Request the key and relay it to `downstream_host` on the configured port
    pub async fn relay(&self, request: &KeyRequest, downstream_host: &str) -> Result<usize> {
        let downstream = self.downstream_addr(downstream_host).await?;
        let bits = self.request_key(request).await?;
        self.forward(&bits, downstream).await?;
        Ok(bits.len())
    }

    async fn downstream_addr(&self, host: &str) -> Result<SocketAddr> {
        let target = (host, self.config.downstream_port);
        tokio::net::lookup_host(target)
            .await
            .map_err(|e| QkdNetError::Config(format!("resolve {}: {}", host, e)))?
            .next()
            .ok_or_else(|| QkdNetError::Config(format!("no address for {}", host)))
    }
}

fn unspecified_for(peer: &SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}

/// Single-shot receiver of a relayed key
pub struct RelayConsumer {
    socket: UdpSocket,
}

impl RelayConsumer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| QkdNetError::Transport(format!("bind {}: {}", addr, e)))?;
        log::info!("Relay consumer listening on {}", addr);
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive one datagram. Returns the key bits when it is a well-formed
    /// `KEY:` message and `None` otherwise.
    pub async fn receive(self) -> Result<Option<String>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        let text = String::from_utf8_lossy(&buf[..n]);
        let text = text.trim_end();

        match text.strip_prefix(KEY_PREFIX) {
            Some(bits) if is_canonical(bits) => {
                log::info!("Received {} key bits from {}", bits.len(), from);
                Ok(Some(bits.to_string()))
            }
            _ => {
                log::warn!("Unexpected datagram from {}: {:.80}", from, text);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ethertype;
    use std::time::Duration;
    use tokio::sync::{mpsc, Mutex};

    /// Link that answers every request with a fixed payload
    struct ScriptedLink {
        mac: MacAddr,
        replies: Mutex<mpsc::UnboundedReceiver<EthernetFrame>>,
        sent: mpsc::UnboundedSender<EthernetFrame>,
    }

    #[async_trait::async_trait]
    impl FrameLink for ScriptedLink {
        fn local_mac(&self) -> MacAddr {
            self.mac
        }

        async fn send_frame(&self, frame: &EthernetFrame) -> Result<()> {
            let _ = self.sent.send(frame.clone());
            Ok(())
        }

        async fn recv_frame(&self) -> Result<EthernetFrame> {
            match self.replies.lock().await.recv().await {
                Some(frame) => Ok(frame),
                None => std::future::pending().await,
            }
        }
    }

    fn scripted(replies: Vec<EthernetFrame>) -> (ScriptedLink, mpsc::UnboundedReceiver<EthernetFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        for frame in replies {
            tx.send(frame).unwrap();
        }
        drop(tx);
        let (sent, sent_rx) = mpsc::unbounded_channel();
        let link = ScriptedLink { mac: MacAddr([2, 0, 0, 0, 0, 0x31]), replies: Mutex::new(rx), sent };
        (link, sent_rx)
    }

    fn controller_frame(payload: &str) -> EthernetFrame {
        EthernetFrame::control(MacAddr([2, 0, 0, 0, 0, 0x31]), MacAddr([2, 0, 0, 0, 0, 0xc0]), ethertype::CONTROL, payload)
    }

    fn fast_config() -> RelayConfig {
        RelayConfig { reply_deadline_secs: 1, poll_interval_ms: 50, ..RelayConfig::default() }
    }

    #[tokio::test]
    async fn test_request_receives_key() {
        let (link, mut sent) = scripted(vec![
            EthernetFrame::control(MacAddr::BROADCAST, MacAddr([2, 0, 0, 0, 0, 0x99]), ethertype::CONTROL, "REQ_KEY:x:y:1"),
            EthernetFrame::new(MacAddr::BROADCAST, MacAddr([2, 0, 0, 0, 0, 0x99]), ethertype::IPV4, vec![0; 20]),
            controller_frame("KEY:1100"),
        ]);
        let requester = RelayRequester::new(link, fast_config());

        let bits = requester.request_key(&KeyRequest::new("ogs1", "ogs2", 4)).await.unwrap();
        assert_eq!(bits, "1100");

        let request = sent.recv().await.unwrap();
        assert!(request.dst.is_broadcast());
        assert_eq!(request.payload_text(), "REQ_KEY:ogs1:ogs2:4");
    }

    #[tokio::test]
    async fn test_no_key_reply_is_protocol_error() {
        let (link, _sent) = scripted(vec![controller_frame("ERR:NO_KEY_AVAILABLE")]);
        let requester = RelayRequester::new(link, fast_config());
        let err = requester.request_key(&KeyRequest::default()).await.unwrap_err();
        assert!(matches!(err, QkdNetError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_silence_times_out() {
        let (link, _sent) = scripted(Vec::new());
        let requester = RelayRequester::new(link, fast_config());
        let err = requester.request_key(&KeyRequest::default()).await.unwrap_err();
        assert!(matches!(err, QkdNetError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_timed_out_relay_forwards_nothing() {
        let consumer = RelayConsumer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let port = consumer.local_addr().unwrap().port();
        let receiving = tokio::spawn(consumer.receive());

        let (link, _sent) = scripted(vec![EthernetFrame::new(
            MacAddr([2, 0, 0, 0, 0, 0x31]),
            MacAddr([2, 0, 0, 0, 0, 0x99]),
            ethertype::IPV4,
            vec![0; 20],
        )]);
        let config = RelayConfig { downstream_port: port, ..fast_config() };
        let requester = RelayRequester::new(link, config);

        let err = requester
            .relay(&KeyRequest::new("ogs1", "ogs2", 8), "127.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, QkdNetError::Timeout(_)));

        let arrived = tokio::time::timeout(Duration::from_millis(300), receiving).await;
        assert!(arrived.is_err(), "consumer received a datagram after a timed-out relay");
    }

    #[tokio::test]
    async fn test_forward_reaches_consumer() {
        let consumer = RelayConsumer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = consumer.local_addr().unwrap();
        let receiving = tokio::spawn(consumer.receive());

        let (link, _sent) = scripted(Vec::new());
        let requester = RelayRequester::new(link, fast_config());
        requester.forward("101101", addr).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), receiving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received.as_deref(), Some("101101"));
    }

    #[tokio::test]
    async fn test_consumer_rejects_other_payloads() {
        let consumer = RelayConsumer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = consumer.local_addr().unwrap();
        let receiving = tokio::spawn(consumer.receive());

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"HELLO", addr).await.unwrap();

        assert_eq!(receiving.await.unwrap().unwrap(), None);
    }
}
