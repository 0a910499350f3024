//! Single-port datapath over a raw link
//!
//! Lets the controller sit directly on one interface instead of behind an
//! OpenFlow switch. Only key-protocol control frames are handed to the
//! controller; the kernel keeps forwarding everything else.

use std::sync::Arc;
use crate::frame::{EthernetFrame, MacAddr};
use crate::link::FrameLink;
use crate::{QkdNetError, Result};
use super::{Controller, Datapath, FlowRule, OutPort, PacketIn};

/// Port number reported for frames arriving on the link
pub const LOCAL_PORT: u32 = 1;

pub struct RawPortDatapath {
    dpid: u64,
    link: Arc<dyn FrameLink>,
    control_ethertype: u16,
}

impl RawPortDatapath {
    pub fn new(link: Arc<dyn FrameLink>, control_ethertype: u16) -> Self {
        let dpid = u64::from_be_bytes({
            let mut id = [0u8; 8];
            id[2..].copy_from_slice(&link.local_mac().octets());
            id
        });
        Self { dpid, link, control_ethertype }
    }

    /// Feed control frames from the link to `controller` until the link fails
    pub async fn run(&self, controller: &Controller) -> Result<()> {
        controller.switch_connected(self).await?;
        log::info!("Raw datapath {:016x} serving on {}", self.dpid, self.link.local_mac());

        loop {
            let frame = self.link.recv_frame().await?;
            if frame.ethertype != self.control_ethertype {
                continue;
            }
            let packet = PacketIn { in_port: LOCAL_PORT, data: frame.encode() };
            if let Err(e) = controller.handle_packet_in(self, packet).await {
                log::warn!("Failed to handle control frame from {}: {}", frame.src, e);
            }
        }
    }
}

#[async_trait::async_trait]
impl Datapath for RawPortDatapath {
    fn id(&self) -> u64 {
        self.dpid
    }

    fn hw_addr(&self) -> MacAddr {
        self.link.local_mac()
    }

    async fn packet_out(&self, _in_port: Option<u32>, output: OutPort, frame: Vec<u8>) -> Result<()> {
        match output {
            OutPort::Port(LOCAL_PORT) | OutPort::Flood => {
                let frame = EthernetFrame::decode(&frame)?;
                self.link.send_frame(&frame).await
            }
            other => Err(QkdNetError::Transport(format!(
                "raw datapath has no output {:?}",
                other
            ))),
        }
    }

    async fn install_flow(&self, rule: FlowRule) -> Result<()> {
        log::debug!("Raw datapath ignores flow {:?}", rule);
        Ok(())
    }
}
