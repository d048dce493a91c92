use alloc::boxed::Box;
use alloc::vec::Vec;
use kernel_addresses::{TABLE_ENTRIES, VirtualPage};
use kernel_frames::FrameId;
use kernel_swap::SlotId;

/// Where a virtual page's contents currently live.
///
/// Residency and swap are mutually exclusive by construction; there is no
/// flag to forget to check before interpreting an index.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PageLocation {
    /// Never faulted in; no backing anywhere.
    Unmapped,
    /// Backed by a physical frame.
    Resident(FrameId),
    /// The only valid copy sits in a swap slot.
    Swapped(SlotId),
}

/// One inner page-table level: the locations of 1024 consecutive pages,
/// plus the frame charged for this table's storage.
pub(crate) struct InnerLevel {
    frame: FrameId,
    slots: Box<[PageLocation; TABLE_ENTRIES]>,
}

impl InnerLevel {
    fn new(frame: FrameId) -> Self {
        Self {
            frame,
            slots: Box::new([PageLocation::Unmapped; TABLE_ENTRIES]),
        }
    }

    pub(crate) fn frame(&self) -> FrameId {
        self.frame
    }

    pub(crate) fn locations(&self) -> impl Iterator<Item = (usize, PageLocation)> + '_ {
        self.slots.iter().copied().enumerate()
    }
}

/// The outer level of an address space's two-level page table.
///
/// Outer entries appear on first fault into their range and persist until
/// the space is destroyed; the walk code never sees a partially installed
/// level.
pub(crate) struct PageTable {
    outer: Vec<Option<InnerLevel>>,
}

impl PageTable {
    pub(crate) fn new() -> Self {
        let mut outer = Vec::with_capacity(TABLE_ENTRIES);
        outer.resize_with(TABLE_ENTRIES, || None);
        Self { outer }
    }

    pub(crate) fn level_present(&self, page: VirtualPage) -> bool {
        self.outer[page.outer_index()].is_some()
    }

    /// Install a fresh inner level for `page`'s outer range, charged to
    /// `frame`.
    ///
    /// # Panics
    /// If the level already exists; the caller failed to check.
    pub(crate) fn install_level(&mut self, page: VirtualPage, frame: FrameId) {
        let slot = &mut self.outer[page.outer_index()];
        assert!(
            slot.is_none(),
            "inner level for outer index {} installed twice",
            page.outer_index()
        );
        *slot = Some(InnerLevel::new(frame));
    }

    /// The page's current location; `Unmapped` when no inner level exists.
    pub(crate) fn get(&self, page: VirtualPage) -> PageLocation {
        self.outer[page.outer_index()]
            .as_ref()
            .map_or(PageLocation::Unmapped, |level| {
                level.slots[page.inner_index()]
            })
    }

    /// # Panics
    /// If no inner level covers `page`.
    pub(crate) fn set(&mut self, page: VirtualPage, location: PageLocation) {
        let level = self.outer[page.outer_index()]
            .as_mut()
            .unwrap_or_else(|| panic!("no inner level covers {page:?}"));
        level.slots[page.inner_index()] = location;
    }

    /// All present inner levels with their outer indices.
    pub(crate) fn levels(&self) -> impl Iterator<Item = (usize, &InnerLevel)> {
        self.outer
            .iter()
            .enumerate()
            .filter_map(|(i, level)| level.as_ref().map(|l| (i, l)))
    }
}
