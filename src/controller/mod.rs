//! SDN controller: key custody on the data plane plus a learning switch
//!
//! Packet-ins are first turned into a list of [`ControllerAction`]s by
//! [`Controller::decide`] and then applied to the originating [`Datapath`].
//! Key-protocol control frames are answered from the [`KeyCustodian`]; every
//! other frame goes through ordinary MAC learning.

use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use crate::config::ControllerConfig;
use crate::custodian::KeyCustodian;
use crate::frame::{ethertype, EthernetFrame, MacAddr};
use crate::protocol::{is_push_command, KeyReply, KeyRequest};
use crate::Result;

pub mod learning;
pub mod raw_port;
pub mod topology;

pub use learning::MacTable;
pub use raw_port::RawPortDatapath;
pub use topology::LinkGraph;

/// Priority of the table-miss rule sending everything to the controller
pub const TABLE_MISS_PRIORITY: u16 = 0;
/// Priority of learned destination rules
pub const LEARNED_FLOW_PRIORITY: u16 = 1;

/// Where a packet-out or flow sends frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutPort {
    Port(u32),
    Flood,
    Controller,
}

/// Forwarding rule installed on a switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRule {
    pub priority: u16,
    /// Destination MAC to match; `None` matches everything
    pub eth_dst: Option<MacAddr>,
    pub output: OutPort,
}

impl FlowRule {
    pub fn table_miss() -> Self {
        Self {
            priority: TABLE_MISS_PRIORITY,
            eth_dst: None,
            output: OutPort::Controller,
        }
    }
}

/// Frame handed to the controller by a switch
#[derive(Debug, Clone)]
pub struct PacketIn {
    pub in_port: u32,
    pub data: Vec<u8>,
}

/// A switch as seen by the controller
#[async_trait::async_trait]
pub trait Datapath: Send + Sync {
    fn id(&self) -> u64;

    /// Unicast MAC used as the source of frames the controller originates
    fn hw_addr(&self) -> MacAddr;

    /// Emit `frame` on `output`. `in_port` is `None` when the controller
    /// originates the frame.
    async fn packet_out(&self, in_port: Option<u32>, output: OutPort, frame: Vec<u8>) -> Result<()>;

    async fn install_flow(&self, rule: FlowRule) -> Result<()>;
}

/// What the controller decided to do with a packet-in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerAction {
    PacketOut {
        in_port: Option<u32>,
        output: OutPort,
        frame: Vec<u8>,
        delay: Duration,
    },
    InstallFlow(FlowRule),
}

pub struct Controller {
    custodian: KeyCustodian,
    config: ControllerConfig,
    mac_table: Mutex<MacTable>,
    graph: RwLock<LinkGraph>,
}

impl Controller {
    pub fn new(custodian: KeyCustodian, config: ControllerConfig) -> Self {
        Self {
            custodian,
            config,
            mac_table: Mutex::new(MacTable::new()),
            graph: RwLock::new(LinkGraph::new()),
        }
    }

    pub fn custodian(&self) -> &KeyCustodian {
        &self.custodian
    }

    /// Register a newly connected switch and send unmatched traffic to us
    pub async fn switch_connected(&self, datapath: &dyn Datapath) -> Result<()> {
        datapath.install_flow(FlowRule::table_miss()).await?;
        self.graph.write().await.add_switch(datapath.id());
        log::info!("Switch {} connected", datapath.id());
        Ok(())
    }

    pub async fn switch_disconnected(&self, dpid: u64) {
        self.mac_table.lock().await.forget_switch(dpid);
        log::info!("Switch {} disconnected", dpid);
    }

    pub async fn link_added(&self, src: u64, src_port: u32, dst: u64, dst_port: u32) {
        self.graph.write().await.add_link(src, src_port, dst, dst_port);
        log::info!("Link added: {} <-> {}", src, dst);
    }

    pub async fn link_removed(&self, src: u64, dst: u64) {
        self.graph.write().await.remove_link(src, dst);
        log::info!("Link removed: {} <-> {}", src, dst);
    }

    /// Snapshot of the link graph
    pub async fn topology(&self) -> LinkGraph {
        self.graph.read().await.clone()
    }

    /// Decide and apply the response to a packet-in
    pub async fn handle_packet_in(&self, datapath: &dyn Datapath, packet: PacketIn) -> Result<()> {
        let actions = self.decide(datapath.id(), datapath.hw_addr(), &packet).await;
        for action in actions {
            match action {
                ControllerAction::PacketOut { in_port, output, frame, delay } => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    datapath.packet_out(in_port, output, frame).await?;
                }
                ControllerAction::InstallFlow(rule) => datapath.install_flow(rule).await?,
            }
        }
        Ok(())
    }

    /// Work out the response to a packet-in without touching the switch.
    ///
    /// `hw_addr` is the switch's own MAC, the source of any reply frame.
    pub async fn decide(&self, dpid: u64, hw_addr: MacAddr, packet: &PacketIn) -> Vec<ControllerAction> {
        let frame = match EthernetFrame::decode(&packet.data) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("dpid={} dropping undecodable frame: {}", dpid, e);
                return Vec::new();
            }
        };

        if frame.ethertype == self.config.control_ethertype {
            return self.handle_control_frame(dpid, hw_addr, packet.in_port, &frame).await;
        }
        self.handle_data_frame(dpid, packet, &frame).await
    }

    /// Key request/serve channel
    async fn handle_control_frame(
        &self,
        dpid: u64,
        hw_addr: MacAddr,
        in_port: u32,
        frame: &EthernetFrame,
    ) -> Vec<ControllerAction> {
        let payload = frame.payload_text();

        // Our own replies come back around the fabric; never treat them as requests
        if is_push_command(&payload) {
            log::debug!("Dropping reflected key payload from {}: {:.120}", frame.src, payload);
            return Vec::new();
        }

        let request = match KeyRequest::parse(&payload) {
            Some(request) => request,
            None => {
                log::warn!("Bad control payload on dpid={} port={}: {:.120}", dpid, in_port, payload);
                return Vec::new();
            }
        };
        log::info!(
            "REQ_KEY on dpid={} port={} from {} (requester={:?} peer={:?} size={:?})",
            dpid, in_port, frame.src, request.requester, request.peer, request.size
        );

        let reply = match self.custodian.current_bits().await {
            Some(bits) => {
                log::info!("Serving key ({} bits) to {} via dpid={}", bits.len(), frame.src, dpid);
                KeyReply::Key(bits)
            }
            None => {
                log::warn!("No key available to serve {}", frame.src);
                KeyReply::NoKeyAvailable
            }
        };

        let reply_frame = EthernetFrame::control(frame.src, hw_addr, frame.ethertype, &reply.to_string());
        vec![ControllerAction::PacketOut {
            in_port: None,
            output: OutPort::Flood,
            frame: reply_frame.encode(),
            delay: self.config.flood_delay(),
        }]
    }

    /// Ordinary learning-switch forwarding
    async fn handle_data_frame(&self, dpid: u64, packet: &PacketIn, frame: &EthernetFrame) -> Vec<ControllerAction> {
        let mut table = self.mac_table.lock().await;
        table.learn(dpid, frame.src, packet.in_port);

        if frame.ethertype == ethertype::ARP || frame.dst.is_multicast() {
            log::trace!("dpid={} flooding {:#06x} from port {}", dpid, frame.ethertype, packet.in_port);
            return vec![ControllerAction::PacketOut {
                in_port: Some(packet.in_port),
                output: OutPort::Flood,
                frame: packet.data.clone(),
                delay: Duration::ZERO,
            }];
        }

        let mut actions = Vec::with_capacity(2);
        let output = match table.lookup(dpid, &frame.dst) {
            Some(port) => {
                actions.push(ControllerAction::InstallFlow(FlowRule {
                    priority: LEARNED_FLOW_PRIORITY,
                    eth_dst: Some(frame.dst),
                    output: OutPort::Port(port),
                }));
                OutPort::Port(port)
            }
            None => OutPort::Flood,
        };
        actions.push(ControllerAction::PacketOut {
            in_port: Some(packet.in_port),
            output,
            frame: packet.data.clone(),
            delay: Duration::ZERO,
        });
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ethertype::CONTROL;

    fn station() -> MacAddr {
        MacAddr([0x02, 0, 0, 0, 0, 0x01])
    }

    fn switch_mac() -> MacAddr {
        MacAddr([0x02, 0, 0, 0, 0, 0xfe])
    }

    fn controller() -> Controller {
        let config = ControllerConfig { flood_delay_ms: 0, ..ControllerConfig::default() };
        Controller::new(KeyCustodian::new(), config)
    }

    fn control_packet(payload: &str) -> PacketIn {
        let frame = EthernetFrame::control(MacAddr::BROADCAST, station(), CONTROL, payload);
        PacketIn { in_port: 2, data: frame.encode() }
    }

    fn reply_payload(actions: &[ControllerAction]) -> (EthernetFrame, OutPort) {
        match actions {
            [ControllerAction::PacketOut { output, frame, in_port: None, .. }] => {
                (EthernetFrame::decode(frame).unwrap(), *output)
            }
            other => panic!("unexpected actions {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_without_key() {
        let ctl = controller();
        let actions = ctl.decide(1, switch_mac(), &control_packet("REQ_KEY:ogs1:ogs2:16")).await;

        let (reply, output) = reply_payload(&actions);
        assert_eq!(output, OutPort::Flood);
        assert_eq!(reply.payload_text(), "ERR:NO_KEY_AVAILABLE");
        assert_eq!(reply.dst, station());
        assert_eq!(reply.src, switch_mac());
        assert!(!reply.src.is_multicast());
        assert_eq!(reply.ethertype, CONTROL);
    }

    #[tokio::test]
    async fn test_request_served_after_ingest() {
        let ctl = controller();
        ctl.custodian().ingest("KEY:1100").await.unwrap();

        let actions = ctl.decide(1, switch_mac(), &control_packet("REQ_KEY")).await;
        let (reply, output) = reply_payload(&actions);
        assert_eq!(output, OutPort::Flood);
        assert_eq!(reply.payload_text(), "KEY:1100");
    }

    #[tokio::test]
    async fn test_reflected_reply_is_dropped() {
        let ctl = controller();
        ctl.custodian().ingest("KEY:1100").await.unwrap();

        assert!(ctl.decide(1, switch_mac(), &control_packet("KEY:1100")).await.is_empty());
        assert!(ctl.decide(1, switch_mac(), &control_packet("KEYLEN:2:11")).await.is_empty());
        assert!(ctl.decide(1, switch_mac(), &control_packet("garbage")).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_unicast_floods_then_learned_installs_flow() {
        let ctl = controller();
        let a = MacAddr([2, 0, 0, 0, 0, 0xa]);
        let b = MacAddr([2, 0, 0, 0, 0, 0xb]);

        let to_b = EthernetFrame::new(b, a, ethertype::IPV4, vec![0x45; 20]);
        let actions = ctl.decide(1, switch_mac(), &PacketIn { in_port: 1, data: to_b.encode() }).await;
        assert!(matches!(
            actions.as_slice(),
            [ControllerAction::PacketOut { output: OutPort::Flood, in_port: Some(1), .. }]
        ));

        let to_a = EthernetFrame::new(a, b, ethertype::IPV4, vec![0x45; 20]);
        let actions = ctl.decide(1, switch_mac(), &PacketIn { in_port: 4, data: to_a.encode() }).await;
        assert_eq!(
            actions[0],
            ControllerAction::InstallFlow(FlowRule {
                priority: LEARNED_FLOW_PRIORITY,
                eth_dst: Some(a),
                output: OutPort::Port(1),
            })
        );
        assert!(matches!(actions[1], ControllerAction::PacketOut { output: OutPort::Port(1), .. }));
    }

    #[tokio::test]
    async fn test_disconnected_switch_forgets_learned_ports() {
        let ctl = controller();
        let a = MacAddr([2, 0, 0, 0, 0, 0xa]);
        let b = MacAddr([2, 0, 0, 0, 0, 0xb]);
        let from_a = EthernetFrame::new(b, a, ethertype::IPV4, vec![0; 20]);
        ctl.decide(1, switch_mac(), &PacketIn { in_port: 1, data: from_a.encode() }).await;

        ctl.switch_disconnected(1).await;

        let to_a = EthernetFrame::new(a, b, ethertype::IPV4, vec![0; 20]);
        let actions = ctl.decide(1, switch_mac(), &PacketIn { in_port: 4, data: to_a.encode() }).await;
        assert!(matches!(actions.as_slice(), [ControllerAction::PacketOut { output: OutPort::Flood, .. }]));
    }

    #[tokio::test]
    async fn test_arp_is_flooded_without_flow() {
        let ctl = controller();
        let arp = EthernetFrame::new(MacAddr::BROADCAST, station(), ethertype::ARP, vec![0; 28]);
        let actions = ctl.decide(3, switch_mac(), &PacketIn { in_port: 7, data: arp.encode() }).await;
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ControllerAction::PacketOut { output: OutPort::Flood, in_port: Some(7), .. }));
    }

    #[tokio::test]
    async fn test_link_events_update_topology() {
        let ctl = controller();
        ctl.link_added(1, 2, 5, 3).await;
        assert_eq!(ctl.topology().await.port_to(5, 1), Some(3));

        ctl.link_removed(1, 5).await;
        assert_eq!(ctl.topology().await.edge_count(), 0);
    }
}
