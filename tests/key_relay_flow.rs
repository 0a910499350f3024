//! End-to-end key flow: agreement -> push -> custody -> REQ_KEY -> UDP relay

use qkdnet::codec::{pack, to_bitstring};
use qkdnet::config::{ControllerConfig, HandshakeConfig, RelayConfig};
use qkdnet::controller::{Controller, RawPortDatapath};
use qkdnet::frame::{ethertype, EthernetFrame, MacAddr};
use qkdnet::ingest::{push_key, PushIngestListener, PushResponse};
use qkdnet::link::FrameLink;
use qkdnet::protocol::KeyRequest;
use qkdnet::qkd::{KeyAgreementSession, SimLink};
use qkdnet::{KeyCustodian, QkdNetError, RelayConsumer, RelayRequester};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration};

/// One end of a point-to-point in-memory Ethernet wire
struct WireEnd {
    mac: MacAddr,
    tx: mpsc::UnboundedSender<EthernetFrame>,
    rx: Mutex<mpsc::UnboundedReceiver<EthernetFrame>>,
}

fn wire(a: MacAddr, b: MacAddr) -> (WireEnd, WireEnd) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        WireEnd { mac: a, tx: a_tx, rx: Mutex::new(a_rx) },
        WireEnd { mac: b, tx: b_tx, rx: Mutex::new(b_rx) },
    )
}

#[async_trait::async_trait]
impl FrameLink for WireEnd {
    fn local_mac(&self) -> MacAddr {
        self.mac
    }

    async fn send_frame(&self, frame: &EthernetFrame) -> qkdnet::Result<()> {
        self.tx
            .send(frame.clone())
            .map_err(|_| QkdNetError::Transport("wire cut".into()))
    }

    async fn recv_frame(&self) -> qkdnet::Result<EthernetFrame> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| QkdNetError::Transport("wire cut".into()))
    }
}

fn handshake_config() -> HandshakeConfig {
    HandshakeConfig {
        wait_timeout_ms: 500,
        pause_ms: 0,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        ..HandshakeConfig::default()
    }
}

fn controller_config() -> ControllerConfig {
    ControllerConfig { flood_delay_ms: 10, ..ControllerConfig::default() }
}

async fn start_push_listener(custodian: KeyCustodian) -> String {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap().to_string();
    let listener = PushIngestListener::new(custodian, controller_config());
    tokio::spawn(async move { listener.serve(tcp).await });
    addr
}

/// Start a controller behind a raw-port datapath; returns the station's end of the wire
fn start_controller(custodian: KeyCustodian) -> WireEnd {
    let (station, controller_port) = wire(MacAddr([2, 0, 0, 0, 0, 0xa1]), MacAddr([2, 0, 0, 0, 0, 0xc0]));
    let controller = Controller::new(custodian, controller_config());
    let datapath = RawPortDatapath::new(Arc::new(controller_port), ethertype::CONTROL);
    tokio::spawn(async move { datapath.run(&controller).await });
    station
}

#[tokio::test]
async fn test_agreed_key_reaches_consumer() {
    let secret = vec![true, false, true, true, false, false, true, false, true, true, true, false, false, true];
    let (a, b) = SimLink::pair();
    let mut initiator = KeyAgreementSession::new(a, handshake_config());
    let mut responder = KeyAgreementSession::new(b, handshake_config());
    let (initiator_key, responder_key) =
        tokio::join!(initiator.run_initiator(&secret), responder.run_responder(secret.len()));
    let key = initiator_key.unwrap();
    assert_eq!(key.len(), secret.len());
    assert_eq!(key, responder_key.unwrap());

    let custodian = KeyCustodian::new();
    let push_addr = start_push_listener(custodian.clone()).await;
    let payload = format!("KEY:{}", pack(&key));
    let response = push_key(&push_addr, &payload, Duration::from_secs(5)).await.unwrap();
    // Packing pads to whole units
    assert_eq!(response, PushResponse::Ack { n_bits: 16 });

    let mut expected = to_bitstring(&key);
    expected.push_str("00");
    assert_eq!(custodian.current_bits().await.as_deref(), Some(expected.as_str()));

    let consumer = RelayConsumer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let consumer_port = consumer.local_addr().unwrap().port();
    let received = tokio::spawn(consumer.receive());

    let station = start_controller(custodian);
    let relay_config = RelayConfig {
        reply_deadline_secs: 5,
        poll_interval_ms: 100,
        downstream_port: consumer_port,
        ..RelayConfig::default()
    };
    let requester = RelayRequester::new(station, relay_config);
    let n_bits = requester
        .relay(&KeyRequest::new("ogs1", "ogs2", 16), "127.0.0.1")
        .await
        .unwrap();
    assert_eq!(n_bits, 16);

    let bits = timeout(Duration::from_secs(5), received).await.unwrap().unwrap().unwrap();
    assert_eq!(bits, Some(expected));
}

#[tokio::test]
async fn test_truncated_push_is_served() {
    let custodian = KeyCustodian::new();
    let push_addr = start_push_listener(custodian.clone()).await;

    let response = push_key(&push_addr, "KEYLEN:5:1011011100\n", Duration::from_secs(5)).await.unwrap();
    assert_eq!(response, PushResponse::Ack { n_bits: 5 });

    let station = start_controller(custodian);
    let requester = RelayRequester::new(station, RelayConfig { reply_deadline_secs: 5, ..RelayConfig::default() });
    let bits = requester.request_key(&KeyRequest::default()).await.unwrap();
    assert_eq!(bits, "10110");
}

#[tokio::test]
async fn test_rejected_push_leaves_custodian_empty() {
    let custodian = KeyCustodian::new();
    let push_addr = start_push_listener(custodian.clone()).await;

    let response = push_key(&push_addr, "HELLO", Duration::from_secs(5)).await.unwrap();
    assert_eq!(response, PushResponse::BadFormat);

    let station = start_controller(custodian);
    let requester = RelayRequester::new(station, RelayConfig { reply_deadline_secs: 5, ..RelayConfig::default() });
    let err = requester.request_key(&KeyRequest::new("ogs1", "ogs2", 8)).await.unwrap_err();
    assert!(matches!(err, QkdNetError::Protocol(_)));
}
