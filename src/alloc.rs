//! NUMA-aware allocation
//!
//! The allocator produces aligned virtual ranges through a two-function
//! port layer (allocate-with-policy and release), records every live
//! range in the registry, and hands the caller nothing but the base
//! address. Three platform variants exist behind the same trait: an
//! anonymous mapping with a kernel memory policy on Linux, and an
//! aligned heap block where no policy primitive is available. Release
//! always goes through the backing that produced the range.

use std::ptr::NonNull;

use tracing::trace;
#[cfg(target_os = "linux")]
use tracing::warn;

use crate::error::{Error, Result};
use crate::region::{AllocRoutine, Backing, MemPolicy, NodeMask, Region};
use crate::registry::Registry;
use crate::topology::DEFAULT_PAGE_SIZE;
use crate::touch::touch_seq;

/// Allocations round up to this large-page multiple so page-aligned
/// touches stay in-region (2 MiB)
pub const LARGE_PAGE: usize = DEFAULT_PAGE_SIZE;

/// Round `size` up to the next large-page multiple.
pub(crate) fn roundup_large(size: usize) -> usize {
    size.div_ceil(LARGE_PAGE) * LARGE_PAGE
}

/// The platform pair: allocate a bound range, release it on drop of the
/// returned backing
pub trait AllocBackend: Send + Sync {
    /// Allocate `len` bytes placed per `policy` over `mask`
    fn allocate(&self, len: usize, policy: MemPolicy, mask: &NodeMask) -> Result<Backing>;

    /// Routine tag recorded on regions from this backend
    fn routine(&self) -> AllocRoutine;

    /// Human-readable backend name
    fn name(&self) -> &'static str;
}

/// Anonymous mapping plus the kernel `mbind` policy call
#[cfg(target_os = "linux")]
pub struct MbindBackend;

#[cfg(target_os = "linux")]
impl AllocBackend for MbindBackend {
    fn allocate(&self, len: usize, policy: MemPolicy, mask: &NodeMask) -> Result<Backing> {
        let map = memmap2::MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|_| Error::AllocFailed { size: len })?;
        if policy != MemPolicy::Default && mask.count() > 0 {
            apply_mbind(map.as_ptr() as usize, len, policy, mask);
        }
        Ok(Backing::Mmap(map))
    }

    fn routine(&self) -> AllocRoutine {
        AllocRoutine::MmapBind
    }

    fn name(&self) -> &'static str {
        "mmap-mbind"
    }
}

// Memory-policy constants from linux/mempolicy.h; kernel ABI, not
// exported by libc.
#[cfg(target_os = "linux")]
const MPOL_DEFAULT: libc::c_int = 0;
#[cfg(target_os = "linux")]
const MPOL_BIND: libc::c_int = 2;
#[cfg(target_os = "linux")]
const MPOL_INTERLEAVE: libc::c_int = 3;
#[cfg(target_os = "linux")]
const MPOL_MF_MOVE: libc::c_uint = 1 << 1;
#[cfg(target_os = "linux")]
const MPOL_F_STATIC_NODES: libc::c_int = 1 << 15;

/// Bits in the fixed mask buffer handed to the kernel
#[cfg(target_os = "linux")]
const MBIND_MASK_BITS: usize = 256;

#[cfg(target_os = "linux")]
fn apply_mbind(addr: usize, len: usize, policy: MemPolicy, mask: &NodeMask) {
    let mode = match policy {
        MemPolicy::Bind => MPOL_BIND,
        MemPolicy::Interleave => MPOL_INTERLEAVE,
        MemPolicy::Default => MPOL_DEFAULT,
    };
    let mut words = [0u64; MBIND_MASK_BITS / 64];
    for (dst, src) in words.iter_mut().zip(mask.words()) {
        *dst = *src;
    }
    // SAFETY: addr/len name a mapping we own; the mask buffer covers the
    // maxnode bits the kernel will read.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr as *mut libc::c_void,
            len as libc::c_ulong,
            mode | MPOL_F_STATIC_NODES,
            words.as_ptr() as *const libc::c_ulong,
            MBIND_MASK_BITS as libc::c_ulong,
            MPOL_MF_MOVE,
        )
    };
    if rc != 0 {
        // The range still works, just without the requested placement.
        warn!(addr, len, policy = policy.name(), "mbind failed");
    }
}

/// Aligned heap blocks; the portable variant with no policy primitive
pub struct HeapBackend {
    align: usize,
}

impl HeapBackend {
    /// Create a backend allocating at `align`-byte boundaries (raised to
    /// two cache lines at minimum, enough for any padded atomic)
    pub fn new(align: usize) -> Self {
        HeapBackend { align: align.max(128).next_power_of_two() }
    }
}

impl AllocBackend for HeapBackend {
    fn allocate(&self, len: usize, _policy: MemPolicy, _mask: &NodeMask) -> Result<Backing> {
        let layout = std::alloc::Layout::from_size_align(len, self.align)
            .map_err(|_| Error::AllocFailed { size: len })?;
        // SAFETY: len is non-zero (checked by the caller); the backing
        // releases the block with this layout.
        let raw = unsafe { std::alloc::alloc(layout) };
        let ptr = NonNull::new(raw).ok_or(Error::AllocFailed { size: len })?;
        Ok(Backing::Heap { ptr, layout })
    }

    fn routine(&self) -> AllocRoutine {
        AllocRoutine::Aligned
    }

    fn name(&self) -> &'static str {
        "aligned-heap"
    }
}

/// The NUMA-aware allocator: a port backend plus the region registry
pub struct Allocator {
    backend: Box<dyn AllocBackend>,
    registry: Registry,
    maxnode: usize,
    verbose: u8,
}

impl Allocator {
    /// Create an allocator over the given backend.
    ///
    /// `maxnode` bounds every node mask this allocator builds.
    pub fn new(backend: Box<dyn AllocBackend>, maxnode: usize, verbose: u8) -> Self {
        Allocator { backend, registry: Registry::new(), maxnode, verbose }
    }

    /// The region registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Name of the platform backend in use
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Upper bound on platform node ids
    pub fn maxnode(&self) -> usize {
        self.maxnode
    }

    /// Allocate with a caller-supplied policy and mask.
    ///
    /// The size is used as given; zero sizes are rejected before the
    /// platform is involved and register nothing.
    pub fn alloc_explicit(&self, size: usize, policy: MemPolicy, mask: NodeMask) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::InvalidParameter("zero-size allocation"));
        }
        let backing = self.backend.allocate(size, policy, &mask)?;
        let region = Region::new(backing, size, self.backend.routine(), policy, mask);
        let region = self.registry.insert(region);
        if self.verbose >= 3 {
            trace!(region = %region, "allocate");
        }
        // SAFETY: the backend never returns a null base.
        Ok(unsafe { NonNull::new_unchecked(region.addr as *mut u8) })
    }

    /// Allocate `size` bytes bound to one platform node
    pub fn alloc_bind(&self, size: usize, platform_node: usize) -> Result<NonNull<u8>> {
        let mask = NodeMask::single(self.maxnode, platform_node);
        self.alloc_explicit(roundup_large(size), MemPolicy::Bind, mask)
    }

    /// Allocate bound to one node and touch every page immediately, so
    /// the pages are resident before the range is shared
    pub fn alloc_bind_touched(&self, size: usize, platform_node: usize) -> Result<NonNull<u8>> {
        let addr = self.alloc_bind(size, platform_node)?;
        let bytes = roundup_large(size);
        // SAFETY: the range [addr, addr+bytes) was just allocated above.
        unsafe { touch_seq(addr.as_ptr(), bytes) };
        if let Some(region) = self.registry.get(addr.as_ptr() as usize) {
            region.mark_touched();
        }
        Ok(addr)
    }

    /// Allocate interleaved across `nodes`
    pub fn alloc_interleave(&self, size: usize, nodes: impl IntoIterator<Item = usize>) -> Result<NonNull<u8>> {
        let mask = NodeMask::from_nodes(self.maxnode, nodes);
        self.alloc_explicit(roundup_large(size), MemPolicy::Interleave, mask)
    }

    /// Allocate with `policy` over a default mask
    pub fn alloc_mempol(
        &self,
        size: usize,
        policy: MemPolicy,
        nodes: impl IntoIterator<Item = usize>,
    ) -> Result<NonNull<u8>> {
        let mask = NodeMask::from_nodes(self.maxnode, nodes);
        self.alloc_explicit(roundup_large(size), policy, mask)
    }

    /// Release one region. Unknown addresses and null are no-ops.
    pub fn free(&self, addr: *mut u8) {
        if addr.is_null() {
            return;
        }
        if let Some(region) = self.registry.remove(addr as usize) {
            if self.verbose >= 3 {
                trace!(region = %region, "free");
            }
        }
    }

    /// Release every region
    pub fn all_free(&self) {
        for region in self.registry.drain() {
            if self.verbose >= 3 {
                trace!(region = %region, "free");
            }
        }
    }
}
