//! Global routing identifier.

use std::fmt;
use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

/// A 128-bit identifier naming a routable port on the fabric.
///
/// An all-zero GID means the peer is reachable through local addressing
/// alone; a connection carrying a non-zero GID must be routed globally.
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Gid([u8; 16]);

impl Gid {
    /// Length of the textual wire form: two hex characters per raw byte.
    pub const WIRE_LEN: usize = 32;

    /// Whether this GID carries no routing information.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Encode into the fixed-width wire form used by the descriptor record:
    /// the 16 raw bytes as 32 lowercase hex characters, most significant
    /// byte first.
    pub fn to_wire(&self) -> String {
        let mut s = String::with_capacity(Self::WIRE_LEN);
        for b in self.0 {
            use fmt::Write as _;
            write!(s, "{:02x}", b).expect("writing to a String cannot fail");
        }
        s
    }

    /// Decode the fixed-width wire form. Returns `None` on a wrong length or
    /// a non-hex character.
    pub fn from_wire(s: &str) -> Option<Self> {
        if s.len() != Self::WIRE_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let mut raw = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let pair = std::str::from_utf8(chunk).ok()?;
            raw[i] = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(Self(raw))
    }
}

impl fmt::Debug for Gid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gid = Ipv6Addr::from(self.0);
        f.debug_tuple("Gid").field(&gid.to_string()).finish()
    }
}

impl From<[u8; 16]> for Gid {
    #[inline]
    fn from(raw: [u8; 16]) -> Self {
        Self(raw)
    }
}

impl From<Gid> for [u8; 16] {
    #[inline]
    fn from(gid: Gid) -> Self {
        gid.0
    }
}

impl From<Ipv6Addr> for Gid {
    #[inline]
    fn from(addr: Ipv6Addr) -> Self {
        Self(addr.octets())
    }
}

impl From<Gid> for Ipv6Addr {
    #[inline]
    fn from(gid: Gid) -> Self {
        Ipv6Addr::from(gid.0)
    }
}
