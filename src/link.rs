//! Raw link-layer frame I/O
//!
//! [`RawSocketLink`] is a Linux `AF_PACKET` socket bound to one interface,
//! driven by tokio through `AsyncFd`. Opening it needs `CAP_NET_RAW`.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use crate::frame::{EthernetFrame, MacAddr};
use crate::{QkdNetError, Result};

/// Receive buffer size; large enough for offloaded super-frames
const RECV_BUF_LEN: usize = 65536;

/// Something that sends and receives whole Ethernet frames
#[async_trait::async_trait]
pub trait FrameLink: Send + Sync {
    /// Hardware address of the local end
    fn local_mac(&self) -> MacAddr;

    async fn send_frame(&self, frame: &EthernetFrame) -> Result<()>;

    /// Next inbound frame. Frames the local end transmitted are not returned.
    async fn recv_frame(&self) -> Result<EthernetFrame>;
}

/// `AF_PACKET` raw socket bound to an interface
pub struct RawSocketLink {
    fd: AsyncFd<OwnedFd>,
    interface: String,
    mac: MacAddr,
}

impl RawSocketLink {
    /// Open a raw socket on `interface` receiving every ethertype
    pub fn open(interface: &str) -> Result<Self> {
        let c_name = CString::new(interface)
            .map_err(|_| QkdNetError::Config(format!("bad interface name {:?}", interface)))?;
        let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if ifindex == 0 {
            return Err(QkdNetError::Transport(format!(
                "unknown interface {}: {}",
                interface,
                io::Error::last_os_error()
            )));
        }

        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol as libc::c_int,
            )
        };
        if raw < 0 {
            return Err(QkdNetError::Transport(format!(
                "raw socket on {}: {}",
                interface,
                io::Error::last_os_error()
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = ifindex as libc::c_int;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(QkdNetError::Transport(format!(
                "bind raw socket to {}: {}",
                interface,
                io::Error::last_os_error()
            )));
        }

        let mac = local_hw_addr(&fd)?;
        log::debug!("Raw socket open on {} ({})", interface, mac);

        Ok(Self {
            fd: AsyncFd::new(fd)?,
            interface: interface.to_string(),
            mac,
        })
    }
}

fn local_hw_addr(fd: &OwnedFd) -> Result<MacAddr> {
    let mut bound: libc::sockaddr_ll = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd.as_raw_fd(),
            &mut bound as *mut libc::sockaddr_ll as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    if bound.sll_halen != 6 {
        return Err(QkdNetError::Transport(format!(
            "interface has a {}-byte hardware address",
            bound.sll_halen
        )));
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&bound.sll_addr[..6]);
    Ok(MacAddr(mac))
}

#[async_trait::async_trait]
impl FrameLink for RawSocketLink {
    fn local_mac(&self) -> MacAddr {
        self.mac
    }

    async fn send_frame(&self, frame: &EthernetFrame) -> Result<()> {
        let bytes = frame.encode();
        loop {
            let mut guard = self.fd.writable().await?;
            let sent = guard.try_io(|inner| {
                let n = unsafe {
                    libc::send(
                        inner.as_raw_fd(),
                        bytes.as_ptr() as *const libc::c_void,
                        bytes.len(),
                        0,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match sent {
                Ok(result) => {
                    let n = result?;
                    log::trace!("{}: sent {} byte frame to {}", self.interface, n, frame.dst);
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv_frame(&self) -> Result<EthernetFrame> {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        loop {
            let mut guard = self.fd.readable().await?;
            let received = guard.try_io(|inner| {
                let mut from: libc::sockaddr_ll = unsafe { mem::zeroed() };
                let mut len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
                let n = unsafe {
                    libc::recvfrom(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                        &mut from as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                        &mut len,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok((n as usize, from.sll_pkttype))
                }
            });

            let (n, pkttype) = match received {
                Ok(result) => result?,
                Err(_would_block) => continue,
            };
            if pkttype == libc::PACKET_OUTGOING as u8 {
                continue;
            }
            match EthernetFrame::decode(&buf[..n]) {
                Ok(frame) => return Ok(frame),
                Err(e) => log::trace!("{}: skipping frame: {}", self.interface, e),
            }
        }
    }
}
