//! Connection descriptor and its wire codec.

use serde::{Deserialize, Serialize};

use crate::gid::Gid;
use crate::types::*;

/// Everything one side must learn about the other before a connection can
/// be activated: fabric address, queue pair number, initial packet sequence
/// number, and the key and base address of the peer's data region.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConnDescriptor {
    pub lid: Lid,
    pub qpn: Qpn,
    pub psn: Psn,
    pub rkey: RKey,
    pub addr: u64,
    pub gid: Gid,
}

impl ConnDescriptor {
    /// Length of the encoded record: `lid:qpn:psn:rkey:addr:gid` as
    /// fixed-width lowercase hex fields of 4, 6, 6, 8, 16 and 32 characters,
    /// colon-separated.
    pub const WIRE_LEN: usize = 4 + 6 + 6 + 8 + 16 + Gid::WIRE_LEN + 5;

    /// Encode into the fixed-width record. QPN and PSN are 24-bit values
    /// and are masked to fit their fields.
    pub fn to_wire(&self) -> String {
        format!(
            "{:04x}:{:06x}:{:06x}:{:08x}:{:016x}:{}",
            self.lid,
            self.qpn & 0xffffff,
            self.psn & 0xffffff,
            self.rkey,
            self.addr,
            self.gid.to_wire()
        )
    }

    /// Decode a fixed-width record. Returns `None` on a wrong length, a
    /// misplaced separator, or a non-hex field.
    pub fn from_wire(s: &str) -> Option<Self> {
        if s.len() != Self::WIRE_LEN {
            return None;
        }
        let mut fields = s.split(':');
        let lid = field(fields.next()?, 4)?;
        let qpn = field(fields.next()?, 6)?;
        let psn = field(fields.next()?, 6)?;
        let rkey = field(fields.next()?, 8)?;
        let addr = field(fields.next()?, 16)?;
        let gid = Gid::from_wire(fields.next()?)?;
        if fields.next().is_some() {
            return None;
        }
        Some(Self {
            lid: lid as Lid,
            qpn: qpn as Qpn,
            psn: psn as Psn,
            rkey: rkey as RKey,
            addr,
            gid,
        })
    }
}

fn field(s: &str, width: usize) -> Option<u64> {
    // from_str_radix tolerates a leading sign; a canonical record is hex
    // digits only.
    if s.len() != width || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}
