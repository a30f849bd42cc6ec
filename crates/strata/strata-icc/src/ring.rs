//! Byte ring buffer with a fixed header region.
//!
//! This is the only module that touches raw addresses. Everything above it
//! goes through the wraparound-safe copies below.
//!
//! # Layout
//!
//! ```text
//! base ──► ┌──────────────────────┐
//!          │ header (H bytes)     │  control counters, never wraps
//!          ├──────────────────────┤
//!          │ data   (C bytes)     │  position p lives at p mod C
//!          └──────────────────────┘
//! ```
//!
//! Capacity does not have to be a power of two; offsets are computed with a
//! plain modulo.

use crate::error::IccError;
use crate::shm_layout::HeaderLayout;
use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use strata_shm::{OpenStatus, SegmentSpec, SharedSegment};

/// Alignment of heap-backed rings; matches the header's cache-line layout.
const HEAP_ALIGN: usize = 64;

/// Maps an absolute position to an offset in the data area.
///
/// ```text
/// capacity = 10
/// pos =  3 →  3
/// pos = 10 →  0  (wraps)
/// pos = 27 →  7
/// ```
#[inline(always)]
pub fn position_to_offset(pos: u64, capacity: usize) -> usize {
    (pos % capacity as u64) as usize
}

struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `RingBuffer::heap` with exactly this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

enum Backing {
    Heap(HeapRegion),
    Shared(SharedSegment),
}

pub struct RingBuffer {
    /// Start of the header; the data area follows `header_size` bytes later.
    base: *mut u8,
    header_size: usize,
    capacity: usize,
    writable: bool,
    backing: Backing,
}

// SAFETY: the backing memory is owned by `backing` and lives as long as the
// ring. Concurrent writers only ever copy into disjoint reserved ranges, and
// the header is accessed exclusively through atomics.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Allocates a zeroed process-local ring.
    pub fn heap(capacity: usize, header_size: usize) -> Result<Self, IccError> {
        check_capacity(capacity)?;
        let size = header_size + capacity;
        let layout = Layout::from_size_align(size, HEAP_ALIGN).map_err(|_| {
            IccError::InvalidCapacity {
                capacity,
                reason: "exceeds the address space",
            }
        })?;
        // SAFETY: layout has non-zero size (capacity > 0).
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(IccError::Alloc(size))?;

        Ok(Self {
            base: ptr.as_ptr(),
            header_size,
            capacity,
            writable: true,
            backing: Backing::Heap(HeapRegion { ptr, layout }),
        })
    }

    /// Opens (or, for writers, creates) the named segment sized `header_size
    /// + capacity`.
    pub fn shared(spec: &SegmentSpec, capacity: usize, header_size: usize) -> Result<Self, IccError> {
        check_capacity(capacity)?;
        let segment = SharedSegment::open(spec, (header_size + capacity) as u64)?;
        Ok(Self {
            base: segment.base(),
            header_size,
            capacity,
            writable: segment.is_writable(),
            backing: Backing::Shared(segment),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn header_size(&self) -> usize {
        self.header_size
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::Shared(_))
    }

    /// How the shared segment was opened; `None` for heap rings.
    pub fn open_status(&self) -> Option<OpenStatus> {
        match &self.backing {
            Backing::Heap(_) => None,
            Backing::Shared(segment) => Some(segment.status()),
        }
    }

    #[inline(always)]
    fn data(&self) -> *mut u8 {
        // SAFETY: header_size is within the allocation by construction.
        unsafe { self.base.add(self.header_size) }
    }

    /// Views the header region as `H`.
    ///
    /// # Panics
    /// If `H` does not fit the header region.
    #[inline(always)]
    pub(crate) fn header<H: HeaderLayout>(&self) -> &H {
        assert!(size_of::<H>() <= self.header_size, "header type larger than header region");
        // SAFETY: base is 64-byte aligned (heap layout or page-aligned mmap),
        // H is atomic-only so shared references across threads and
        // processes are sound, and the region is at least size_of::<H>().
        unsafe { &*(self.base as *const H) }
    }

    /// Copies `src` into the ring starting at absolute position `pos`,
    /// splitting the copy in two when it straddles the end of the data area.
    ///
    /// Callers must own the range `[pos, pos + src.len())` (a reservation)
    /// for the duration of the copy.
    ///
    /// # Panics
    /// If the ring is read-only or `src` is longer than the ring.
    #[inline]
    pub fn copy_in(&self, pos: u64, src: &[u8]) {
        assert!(self.writable, "copy_in on a read-only ring");
        assert!(src.len() <= self.capacity, "copy larger than ring");
        let start = position_to_offset(pos, self.capacity);
        let first = src.len().min(self.capacity - start);
        // SAFETY: both destination ranges lie inside the data area and the
        // source is a live slice of the stated length.
        unsafe {
            let data = self.data();
            ptr::copy_nonoverlapping(src.as_ptr(), data.add(start), first);
            ptr::copy_nonoverlapping(src.as_ptr().add(first), data, src.len() - first);
        }
    }

    /// Copies `dst.len()` bytes starting at absolute position `pos` out of the
    /// ring.
    ///
    /// # Panics
    /// If `dst` is longer than the ring.
    #[inline]
    pub fn copy_out(&self, pos: u64, dst: &mut [u8]) {
        assert!(dst.len() <= self.capacity, "copy larger than ring");
        let start = position_to_offset(pos, self.capacity);
        let first = dst.len().min(self.capacity - start);
        // SAFETY: both source ranges lie inside the data area.
        unsafe {
            let data = self.data();
            ptr::copy_nonoverlapping(data.add(start), dst.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(data, dst.as_mut_ptr().add(first), dst.len() - first);
        }
    }

    /// Zero-copy view of `len` bytes at `pos`, or `None` when the range
    /// straddles the end of the data area (use [`copy_out`](Self::copy_out)
    /// then).
    ///
    /// The bytes may be overwritten by a writer that laps the reader; queues
    /// re-validate their counters after the caller is done with the view.
    #[inline]
    pub fn try_borrow(&self, pos: u64, len: usize) -> Option<&[u8]> {
        let start = position_to_offset(pos, self.capacity);
        if len > self.capacity - start {
            return None;
        }
        // SAFETY: the range lies inside the data area, which lives as long
        // as &self.
        Some(unsafe { std::slice::from_raw_parts(self.data().add(start), len) })
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("header_size", &self.header_size)
            .field("writable", &self.writable)
            .field("shared", &self.is_shared())
            .finish()
    }
}

fn check_capacity(capacity: usize) -> Result<(), IccError> {
    if capacity == 0 {
        return Err(IccError::InvalidCapacity {
            capacity,
            reason: "must be non-zero",
        });
    }
    Ok(())
}
