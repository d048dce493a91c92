use kernel_addresses::VirtualPage;
use kernel_frames::FrameId;
use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Translation-cache slots the machine exposes.
pub const TLB_SLOTS: usize = 64;

bitflags::bitflags! {
    /// Flags carried by an installed translation.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct TlbFlags: u8 {
        /// The translation may be used at all.
        const VALID = 1 << 0;
        /// Writes through the translation are permitted; a write through a
        /// valid-but-clean entry re-faults as a read-only violation.
        const DIRTY = 1 << 1;
    }
}

/// One installed translation: virtual page to physical frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TlbEntry {
    pub page: VirtualPage,
    pub frame: FrameId,
    pub flags: TlbFlags,
}

/// The hardware translation-cache primitives the fault handler programs.
///
/// Mirrors a software-managed TLB: the kernel probes for an entry by
/// virtual page, overwrites a specific slot, asks the hardware to pick a
/// replacement slot, or drops everything.
pub trait TlbControl {
    /// Slot currently holding a translation for `page`, if any.
    fn probe(&self, page: VirtualPage) -> Option<usize>;

    /// Overwrite one slot.
    fn write_indexed(&mut self, slot: usize, entry: TlbEntry);

    /// Install into a slot of the implementation's choosing.
    fn write_random(&mut self, entry: TlbEntry);

    /// Drop every translation.
    fn invalidate_all(&mut self);
}

/// Invalidate a translation on behalf of another core.
///
/// The target is deliberately ignored: the whole TLB is dropped, which is
/// always correct, merely wasteful. Precise single-entry invalidation
/// would be a performance improvement, not a behavioral change.
pub fn shootdown<T: TlbControl>(tlb: &mut T, _page: VirtualPage) {
    tlb.invalidate_all();
}

/// In-memory TLB for host tests and simulated bring-up.
///
/// Replacement picks a free slot when one exists, otherwise a seeded
/// pseudo-random victim, so runs are reproducible.
pub struct SoftTlb {
    slots: [Option<TlbEntry>; TLB_SLOTS],
    rng: SmallRng,
}

const DEFAULT_TLB_SEED: u64 = 0x7ab_5107_5eed;

impl SoftTlb {
    #[must_use]
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_TLB_SEED)
    }

    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            slots: [None; TLB_SLOTS],
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    #[must_use]
    pub fn entry(&self, slot: usize) -> Option<TlbEntry> {
        self.slots[slot]
    }

    /// The installed translation for `page`, if any.
    #[must_use]
    pub fn lookup(&self, page: VirtualPage) -> Option<TlbEntry> {
        self.slots
            .iter()
            .flatten()
            .copied()
            .find(|e| e.page == page)
    }

    #[must_use]
    pub fn occupied(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

impl Default for SoftTlb {
    fn default() -> Self {
        Self::new()
    }
}

impl TlbControl for SoftTlb {
    fn probe(&self, page: VirtualPage) -> Option<usize> {
        self.slots
            .iter()
            .position(|e| e.is_some_and(|e| e.page == page))
    }

    fn write_indexed(&mut self, slot: usize, entry: TlbEntry) {
        assert!(slot < TLB_SLOTS, "TLB slot {slot} out of range");
        self.slots[slot] = Some(entry);
    }

    fn write_random(&mut self, entry: TlbEntry) {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| self.rng.gen_range(0..TLB_SLOTS));
        self.slots[slot] = Some(entry);
    }

    fn invalidate_all(&mut self) {
        self.slots = [None; TLB_SLOTS];
    }
}
