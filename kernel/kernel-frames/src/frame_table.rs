use crate::{POISON_WORD, PageData};
use alloc::vec::Vec;
use core::fmt;
use kernel_addresses::{AddressSpaceId, PAGE_SIZE, VirtualPage};
use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Handle to one physical page frame.
///
/// Only the owning [`FrameTable`] creates these; resolving one back to frame
/// contents goes through [`FrameTable::page`] / [`FrameTable::page_mut`],
/// never through address arithmetic.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct FrameId(u32);

impl FrameId {
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {}", self.0)
    }
}

/// Reverse lookup: the page-table slot a user frame currently backs.
///
/// A logical name, not a pointer: eviction code resolves it through the
/// owning address space when (if) it needs to invalidate the mapping.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PageOwner {
    pub space: AddressSpaceId,
    pub page: VirtualPage,
}

/// Allocation bookkeeping, kept since bootstrap.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct FrameStats {
    /// Total frames handed out over the table's lifetime.
    pub allocations: u64,
    /// Total frames returned over the table's lifetime.
    pub frees: u64,
    /// Frames currently occupied (including reserved metadata frames).
    pub in_use: usize,
    /// Frames currently free.
    pub free: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("out of physical frames")]
pub struct OutOfFrames;

struct FrameEntry {
    free: bool,
    kernel: bool,
    owner: Option<PageOwner>,
}

/// The physical frame table: per-frame metadata plus the frame storage
/// itself.
///
/// All mutation is expected to happen under one exclusive lock owned by the
/// caller; the table itself carries no interior locking.
pub struct FrameTable {
    entries: Vec<FrameEntry>,
    pages: Vec<PageData>,
    stats: FrameStats,
    probe_rng: SmallRng,
}

/// Probe seed for [`FrameTable::new`]; fixed so runs are reproducible.
const DEFAULT_PROBE_SEED: u64 = 0x5eed_0f_f8a3e5;

impl FrameTable {
    /// Model a RAM range of `total_frames` page frames.
    ///
    /// The frames the table's own metadata occupies (entry records, rounded
    /// up to whole pages) are pre-marked occupied + kernel, exactly as they
    /// would be stolen from the head of RAM at boot.
    ///
    /// # Panics
    /// If the metadata does not leave at least one allocatable frame.
    #[must_use]
    pub fn new(total_frames: usize) -> Self {
        Self::with_probe_seed(total_frames, DEFAULT_PROBE_SEED)
    }

    /// Like [`new`](Self::new) with an explicit eviction-probe seed.
    #[must_use]
    pub fn with_probe_seed(total_frames: usize, seed: u64) -> Self {
        let table_bytes = total_frames * size_of::<FrameEntry>();
        let table_pages = table_bytes.div_ceil(PAGE_SIZE);
        assert!(
            table_pages < total_frames,
            "frame table metadata ({table_pages} pages) leaves no allocatable frames"
        );

        let mut entries = Vec::with_capacity(total_frames);
        let mut pages = Vec::with_capacity(total_frames);
        for i in 0..total_frames {
            entries.push(FrameEntry {
                free: i >= table_pages,
                kernel: i < table_pages,
                owner: None,
            });
            pages.push(PageData::zeroed());
        }

        log::info!("{table_pages} pages ({table_bytes} bytes) reserved for the frame table");

        Self {
            entries,
            pages,
            stats: FrameStats {
                allocations: 0,
                frees: 0,
                in_use: table_pages,
                free: total_frames - table_pages,
            },
            probe_rng: SmallRng::seed_from_u64(seed),
        }
    }

    #[inline]
    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Allocate the lowest-indexed free frame, zero-filled.
    ///
    /// New frames start kernel-tagged: every allocation is a kernel
    /// allocation until it is handed to a user mapping via
    /// [`mark_user`](Self::mark_user).
    pub fn allocate(&mut self) -> Result<FrameId, OutOfFrames> {
        let index = self
            .entries
            .iter()
            .position(|e| e.free)
            .ok_or(OutOfFrames)?;
        let entry = &mut self.entries[index];
        entry.free = false;
        entry.kernel = true;
        entry.owner = None;
        self.pages[index].fill_words(0);
        self.stats.allocations += 1;
        self.stats.in_use += 1;
        self.stats.free -= 1;
        Ok(FrameId(index as u32))
    }

    /// Return a frame, overwriting its contents with the poison pattern.
    ///
    /// # Panics
    /// If the frame is already free; a double free is a kernel bug.
    pub fn free(&mut self, frame: FrameId) {
        let entry = self.entry_mut(frame);
        assert!(!entry.free, "{frame} freed twice");
        entry.free = true;
        entry.kernel = false;
        entry.owner = None;
        self.pages[frame.index()].fill_words(POISON_WORD);
        self.stats.frees += 1;
        self.stats.in_use -= 1;
        self.stats.free += 1;
    }

    #[must_use]
    pub fn is_free(&self, frame: FrameId) -> bool {
        self.entry(frame).free
    }

    #[must_use]
    pub fn is_kernel(&self, frame: FrameId) -> bool {
        self.entry(frame).kernel
    }

    /// Tag an occupied frame as kernel-owned (ineligible for eviction).
    pub fn mark_kernel(&mut self, frame: FrameId) {
        let entry = self.entry_mut(frame);
        assert!(!entry.free, "marking free {frame} as kernel");
        entry.kernel = true;
    }

    /// Tag an occupied frame as user-owned (eligible for eviction).
    pub fn mark_user(&mut self, frame: FrameId) {
        let entry = self.entry_mut(frame);
        assert!(!entry.free, "marking free {frame} as user");
        entry.kernel = false;
    }

    /// Record which page-table slot this frame backs.
    pub fn set_owner(&mut self, frame: FrameId, owner: PageOwner) {
        let entry = self.entry_mut(frame);
        assert!(!entry.free, "setting owner of free {frame}");
        entry.owner = Some(owner);
    }

    #[must_use]
    pub fn owner(&self, frame: FrameId) -> Option<PageOwner> {
        self.entry(frame).owner
    }

    /// Pick a frame that could be written to swap: occupied and not
    /// kernel-owned. Probes circularly from a random starting index.
    pub fn pick_evictable(&mut self) -> Option<FrameId> {
        let n = self.entries.len();
        let start = self.probe_rng.gen_range(0..n);
        for k in 0..n {
            let index = (start + k) % n;
            let entry = &self.entries[index];
            if !entry.free && !entry.kernel {
                return Some(FrameId(index as u32));
            }
        }
        None
    }

    /// Contents of a frame. Free frames are readable on purpose: the poison
    /// pattern must be observable.
    #[must_use]
    pub fn page(&self, frame: FrameId) -> &PageData {
        self.check_bounds(frame);
        &self.pages[frame.index()]
    }

    #[must_use]
    pub fn page_mut(&mut self, frame: FrameId) -> &mut PageData {
        self.check_bounds(frame);
        &mut self.pages[frame.index()]
    }

    /// Byte-copy one frame's contents into another.
    ///
    /// # Panics
    /// If `src` and `dst` are the same frame or either is out of range.
    pub fn copy_page(&mut self, src: FrameId, dst: FrameId) {
        self.check_bounds(src);
        self.check_bounds(dst);
        let (a, b) = (src.index(), dst.index());
        assert_ne!(a, b, "copying {src} onto itself");
        if a < b {
            let (lo, hi) = self.pages.split_at_mut(b);
            hi[0].as_bytes_mut().copy_from_slice(lo[a].as_bytes());
        } else {
            let (lo, hi) = self.pages.split_at_mut(a);
            lo[b].as_bytes_mut().copy_from_slice(hi[0].as_bytes());
        }
    }

    fn check_bounds(&self, frame: FrameId) {
        assert!(
            frame.index() < self.entries.len(),
            "{frame} out of range ({} frames)",
            self.entries.len()
        );
    }

    fn entry(&self, frame: FrameId) -> &FrameEntry {
        self.check_bounds(frame);
        &self.entries[frame.index()]
    }

    fn entry_mut(&mut self, frame: FrameId) -> &mut FrameEntry {
        self.check_bounds(frame);
        &mut self.entries[frame.index()]
    }
}
