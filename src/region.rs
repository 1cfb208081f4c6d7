//! Memory region management.
//!
//! A region is a contiguous, page-aligned byte buffer registered with the
//! local fabric port. Registration produces a local key for local access and
//! a remote key that authorizes the peer to access the region directly. The
//! buffer must stay allocated and unmoved for as long as any outstanding
//! operation references it; [`Region`] guarantees this by owning the buffer
//! and sharing it with the port through a reference-counted handle.

use std::alloc::{self, Layout};
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fabric::FabricPort;
use crate::types::*;

/// Region allocation/registration error type.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// A zero-length region cannot be registered.
    #[error("region size must be nonzero")]
    ZeroSize,

    /// The allocator refused the request.
    #[error("cannot allocate {0} bytes")]
    OutOfMemory(usize),

    /// The fabric refused to register the region.
    #[error("registration rejected: {0}")]
    Rejected(&'static str),
}

/// Memory region access permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Permission(u32);

impl Permission {
    pub const EMPTY: Self = Self(0);
    pub const LOCAL_WRITE: Self = Self(1 << 0);
    pub const REMOTE_READ: Self = Self(1 << 1);
    pub const REMOTE_WRITE: Self = Self(1 << 2);

    /// Whether all permissions in `other` are present in `self`.
    #[inline]
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for Permission {
    /// Allow local write and remote read/write.
    fn default() -> Self {
        Self::LOCAL_WRITE | Self::REMOTE_READ | Self::REMOTE_WRITE
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Permission {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for Permission {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

/// An owned, page-aligned heap buffer.
///
/// Alignment matters for registration cost: the fabric pins whole pages, so
/// the data buffer is aligned the way `posix_memalign` would align it.
pub(crate) struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: the buffer is plain bytes; the owner controls all access.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    /// Allocate `len` zeroed bytes aligned to `align`.
    fn zeroed(len: usize, align: usize) -> Result<Self, AllocationError> {
        let layout = Layout::from_size_align(len, align)
            .map_err(|_| AllocationError::Rejected("bad layout"))?;
        // SAFETY: `len` is nonzero (checked by the caller).
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(AllocationError::OutOfMemory(len))?;
        Ok(Self { ptr, len, layout })
    }

    #[inline]
    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation is live and exactly `len` bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the allocation is live and exactly `len` bytes.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub(crate) fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout, deallocated once.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Shared handle to a region's backing memory.
///
/// The port holds a clone so that inbound transfers can land in the buffer
/// when the owning thread drives its progress function. The lock is only
/// ever taken by that one thread; it exists to keep the sharing safe, not
/// to arbitrate concurrent access.
pub(crate) type RegionMem = Arc<Mutex<AlignedBuf>>;

/// The system page size.
pub fn page_size() -> usize {
    // SAFETY: FFI, no side effects.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

/// A local registered memory region.
pub struct Region {
    mem: RegionMem,
    addr: u64,
    len: usize,
    lkey: LKey,
    rkey: RKey,
    perm: Permission,
}

impl Region {
    /// Allocate a page-aligned buffer of `len` bytes filled with `fill` and
    /// register it with `port` under the given permissions.
    pub fn allocate(
        port: &mut FabricPort,
        len: usize,
        perm: Permission,
        fill: u8,
    ) -> Result<Self, AllocationError> {
        if len == 0 {
            return Err(AllocationError::ZeroSize);
        }
        let mut buf = AlignedBuf::zeroed(len, page_size())?;
        buf.as_mut_slice().fill(fill);

        let mem: RegionMem = Arc::new(Mutex::new(buf));
        let (addr, lkey, rkey) = port.register(Arc::clone(&mem), len, perm)?;
        Ok(Self {
            mem,
            addr,
            len,
            lkey,
            rkey,
            perm,
        })
    }

    /// Get the base address of the region.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Get the length of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the local key of the region.
    #[inline]
    pub fn lkey(&self) -> LKey {
        self.lkey
    }

    /// Get the remote key of the region.
    #[inline]
    pub fn rkey(&self) -> RKey {
        self.rkey
    }

    /// Get the permissions the region was registered with.
    #[inline]
    pub fn perm(&self) -> Permission {
        self.perm
    }

    /// Shared handle to the backing memory, for posting operations.
    #[inline]
    pub(crate) fn mem(&self) -> RegionMem {
        Arc::clone(&self.mem)
    }

    /// Copy `src` into the region at `offset`.
    ///
    /// # Panics
    ///
    /// Panic if `offset + src.len()` is out of bounds.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) {
        let mut buf = self.mem.lock().expect("region lock poisoned");
        buf.as_mut_slice()[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Copy `dst.len()` bytes out of the region at `offset`.
    ///
    /// # Panics
    ///
    /// Panic if `offset + dst.len()` is out of bounds.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) {
        let buf = self.mem.lock().expect("region lock poisoned");
        dst.copy_from_slice(&buf.as_slice()[offset..offset + dst.len()]);
    }

    /// View this region as remote memory for the peer's one-sided access.
    #[inline]
    pub fn as_remote(&self) -> RemoteRegion {
        RemoteRegion {
            addr: self.addr,
            len: self.len,
            rkey: self.rkey,
        }
    }
}

/// Remote registered memory.
///
/// Contains the peer-side region information needed to address it over the
/// fabric and holds no local resources. `addr` and `len` may describe only a
/// part of the peer's full region, so the type doubles as its own slice.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RemoteRegion {
    pub addr: u64,
    pub len: usize,
    pub rkey: RKey,
}

impl RemoteRegion {
    /// Create a new piece of remote registered memory data.
    pub fn new(addr: u64, len: usize, rkey: RKey) -> Self {
        Self { addr, len, rkey }
    }

    /// Get the absolute address at the given offset.
    #[inline]
    pub fn at(&self, offset: usize) -> u64 {
        self.addr + offset as u64
    }

    /// Get a slice of the remote region. Return `None` if out of bounds.
    #[inline]
    pub fn slice(&self, offset: usize, len: usize) -> Option<Self> {
        if offset + len <= self.len {
            Some(Self {
                addr: self.addr + offset as u64,
                len,
                rkey: self.rkey,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_ops() {
        let p = Permission::LOCAL_WRITE | Permission::REMOTE_WRITE;
        assert!(p.contains(Permission::LOCAL_WRITE));
        assert!(!p.contains(Permission::REMOTE_READ));
        assert!(Permission::default().contains(p));
        assert_eq!(p & Permission::LOCAL_WRITE, Permission::LOCAL_WRITE);
    }

    #[test]
    fn test_aligned_buf() {
        let buf = AlignedBuf::zeroed(8192, page_size()).unwrap();
        assert_eq!(buf.addr() % page_size() as u64, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_remote_slice() {
        let r = RemoteRegion::new(0x1000, 64, 42);
        assert_eq!(r.at(16), 0x1010);
        let s = r.slice(32, 32).unwrap();
        assert_eq!(s.addr, 0x1020);
        assert!(r.slice(48, 32).is_none());
    }
}
