//! Process lifecycle events from the kernel's proc connector.
//!
//! A netlink datagram socket subscribed to the `CN_IDX_PROC` multicast
//! group delivers an event for every exec and exit on the system. The
//! kernel drops events under pressure; consumers are expected to
//! resynchronize against procfs periodically instead of relying on a
//! complete stream.

pub mod wire;

use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
};

use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::unix::AsyncFd;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("opening the process-connector socket")]
    Open(#[source] io::Error),
    #[error("binding to the proc multicast group")]
    Bind(#[source] io::Error),
    #[error("updating the proc event subscription")]
    Subscription(#[source] io::Error),
    #[error("registering the socket with the event loop")]
    Register(#[source] io::Error),
    #[error("receiving a proc event")]
    Receive(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcEvent {
    /// Subscription acknowledgement (`PROC_EVENT_NONE`).
    Ack,
    Exec { pid: Pid },
    Exit { pid: Pid },
    /// Fork, uid change, comm change, ...: delivered but not our concern.
    Other,
}

/// Netlink socket subscribed to process events.
///
/// The fd closes on drop; callers that want a clean detach send
/// [`ProcEventSocket::unsubscribe`] first.
pub struct ProcEventSocket {
    fd: AsyncFd<OwnedFd>,
}

impl ProcEventSocket {
    /// Open, bind and subscribe.
    ///
    /// Requires `CAP_NET_ADMIN`. On any failure the socket is dropped and
    /// nothing is left behind in the kernel.
    pub fn open() -> Result<Self, ConnectorError> {
        // CLOEXEC because the daemon spawns helpers (ip, sysctl, iptables)
        // which must not inherit the subscription.
        let raw = unsafe {
            libc::socket(
                libc::PF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                libc::NETLINK_CONNECTOR,
            )
        };
        if raw < 0 {
            return Err(ConnectorError::Open(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut address: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        address.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        address.nl_pid = std::process::id();
        address.nl_groups = wire::CN_IDX_PROC;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&address as *const libc::sockaddr_nl).cast(),
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(ConnectorError::Bind(io::Error::last_os_error()));
        }

        let socket = Self {
            fd: AsyncFd::new(fd).map_err(ConnectorError::Register)?,
        };
        socket.send_mcast_op(wire::PROC_CN_MCAST_LISTEN)?;
        Ok(socket)
    }

    /// Tell the kernel to stop multicasting to us before the fd goes away.
    pub fn unsubscribe(&self) -> Result<(), ConnectorError> {
        self.send_mcast_op(wire::PROC_CN_MCAST_IGNORE)
    }

    fn send_mcast_op(&self, op: u32) -> Result<(), ConnectorError> {
        let request = wire::McastRequest::new(std::process::id(), op);
        let bytes = request.as_bytes();
        let sent = unsafe {
            libc::send(
                self.fd.get_ref().as_raw_fd(),
                bytes.as_ptr().cast(),
                bytes.len(),
                0,
            )
        };
        if sent < 0 {
            return Err(ConnectorError::Subscription(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Wait for the next event. Consumes exactly one datagram per
    /// readiness edge, leaving queued events for the next call.
    pub async fn next_event(&self) -> Result<ProcEvent, ConnectorError> {
        loop {
            let mut guard = self.fd.readable().await.map_err(ConnectorError::Receive)?;

            let mut buffer = [0u8; wire::RECV_BUFFER_LEN];
            let received = unsafe {
                libc::recv(
                    self.fd.get_ref().as_raw_fd(),
                    buffer.as_mut_ptr().cast(),
                    buffer.len(),
                    0,
                )
            };
            if received < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    guard.clear_ready();
                    continue;
                }
                return Err(ConnectorError::Receive(err));
            }

            let datagram = &buffer[..received as usize];
            return Ok(match wire::parse_event(datagram) {
                Some((wire::PROC_EVENT_NONE, _)) => ProcEvent::Ack,
                Some((wire::PROC_EVENT_EXEC, pid)) => ProcEvent::Exec {
                    pid: Pid::from_raw(pid),
                },
                Some((wire::PROC_EVENT_EXIT, pid)) => ProcEvent::Exit {
                    pid: Pid::from_raw(pid),
                },
                _ => ProcEvent::Other,
            });
        }
    }
}
