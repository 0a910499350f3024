//! Per-switch MAC learning table

use std::collections::HashMap;
use crate::frame::MacAddr;

#[derive(Debug, Default)]
pub struct MacTable {
    ports: HashMap<u64, HashMap<MacAddr, u32>>,
}

impl MacTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that `mac` was seen on `port` of switch `dpid`
    pub fn learn(&mut self, dpid: u64, mac: MacAddr, port: u32) {
        let previous = self.ports.entry(dpid).or_default().insert(mac, port);
        if previous != Some(port) {
            log::debug!("dpid={} learned {} on port {}", dpid, mac, port);
        }
    }

    pub fn lookup(&self, dpid: u64, mac: &MacAddr) -> Option<u32> {
        self.ports.get(&dpid)?.get(mac).copied()
    }

    pub fn forget_switch(&mut self, dpid: u64) {
        self.ports.remove(&dpid);
    }
}
