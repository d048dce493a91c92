use crate::page_table::{PageLocation, PageTable};
use crate::segment::{Protection, RegionError, Segment, SegmentKind, SegmentTable};
use crate::tlb::TlbControl;
use kernel_addresses::{AddressSpaceId, USER_SPACE_TOP, VirtualAddress, VirtualPage};
use kernel_frames::FrameId;

#[derive(Debug, thiserror::Error)]
pub enum BreakError {
    /// No data/bss region has been defined, so there is no heap to grow.
    #[error("heap base not set")]
    HeapUnset,
    /// The requested break would sink below the heap base.
    #[error("break would fall below the heap base")]
    BelowBase,
    /// The requested break would run into the stack segment.
    #[error("break would collide with the stack")]
    StackCollision,
}

/// The heap carved out of the data/bss segment's end.
#[derive(Copy, Clone, Debug)]
struct Heap {
    /// Page-aligned end of the static data; the break can never sink below.
    base: VirtualAddress,
    /// The current break.
    top: VirtualAddress,
}

/// One process's virtual address space: segment table plus a two-level page
/// table, both exclusively owned.
///
/// Lifecycle runs through the [`VmContext`](crate::VmContext): creation and
/// deep copy allocate frames, destruction returns them. Everything here
/// that allocates nothing (regions, the load bracket, lookups) is a plain
/// method.
pub struct AddressSpace {
    id: AddressSpaceId,
    segments: SegmentTable,
    heap: Option<Heap>,
    /// Frame charged for the outer page table.
    root_frame: FrameId,
    table: PageTable,
    /// While set, segment permission checks are suspended so the loader
    /// can write into otherwise read-only segments.
    loading: bool,
}

impl AddressSpace {
    pub(crate) fn new(id: AddressSpaceId, root_frame: FrameId) -> Self {
        Self {
            id,
            segments: SegmentTable::new(),
            heap: None,
            root_frame,
            table: PageTable::new(),
            loading: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// Record a virtual region of `size` bytes at `vaddr`.
    ///
    /// The permission pattern picks the segment slot (see
    /// [`SegmentKind`]); nothing is backed by frames yet, since backing is
    /// fault-driven. Defining the data/bss region also anchors the heap at
    /// the page-aligned end of the region.
    pub fn define_region(
        &mut self,
        vaddr: VirtualAddress,
        size: u32,
        prot: Protection,
    ) -> Result<(), RegionError> {
        let kind = SegmentTable::classify(prot)?;
        let end = vaddr + size;
        self.segments.set(
            kind,
            Segment {
                start: vaddr,
                end,
                prot,
            },
        );
        if matches!(kind, SegmentKind::DataBss) {
            let base = end.page_align_up();
            self.heap = Some(Heap { base, top: base });
        }
        log::debug!("{}: {kind:?} region [{vaddr}, {end})", self.id);
        Ok(())
    }

    /// Install the stack segment: anchored at the top of user space,
    /// initially empty, grown downward by the fault handler. Returns the
    /// initial stack pointer.
    pub fn define_stack(&mut self) -> VirtualAddress {
        self.segments.set(
            SegmentKind::Stack,
            Segment {
                start: USER_SPACE_TOP,
                end: USER_SPACE_TOP,
                prot: Protection::READ | Protection::WRITE,
            },
        );
        USER_SPACE_TOP
    }

    /// Suspend permission enforcement while the loader populates segments.
    pub fn prepare_load(&mut self) {
        self.loading = true;
    }

    /// Restore permission enforcement and drop every translation installed
    /// during the unchecked window.
    pub fn complete_load(&mut self, tlb: &mut impl TlbControl) {
        self.loading = false;
        tlb.invalidate_all();
    }

    /// Make this the running address space: stale translations from the
    /// previous one must not survive the switch.
    pub fn activate(&self, tlb: &mut impl TlbControl) {
        tlb.invalidate_all();
    }

    #[inline]
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    #[must_use]
    pub fn heap_base(&self) -> Option<VirtualAddress> {
        self.heap.map(|h| h.base)
    }

    #[must_use]
    pub fn heap_break(&self) -> Option<VirtualAddress> {
        self.heap.map(|h| h.top)
    }

    #[must_use]
    pub fn segment(&self, kind: SegmentKind) -> Option<Segment> {
        self.segments.get(kind)
    }

    /// The page's current backing. Reports `Unmapped` for pages whose
    /// outer range has no inner table yet.
    #[must_use]
    pub fn page_location(&self, page: VirtualPage) -> PageLocation {
        self.table.get(page)
    }

    /// Overwrite a page's backing record.
    ///
    /// This is the bookkeeping half of eviction and of loaders that place
    /// pages directly; it does not move any data. The page's inner level
    /// must already exist.
    pub fn set_page_location(&mut self, page: VirtualPage, location: PageLocation) {
        self.table.set(page, location);
    }

    /// Classic `sbrk`. Caller must hold the frame-table lock: the break
    /// races with fault-driven page-table writes from sibling threads.
    pub(crate) fn grow_break_locked(&mut self, delta: i64) -> Result<VirtualAddress, BreakError> {
        let heap = self.heap.as_mut().ok_or(BreakError::HeapUnset)?;
        let old = heap.top;
        let new = i64::from(old.as_u32()) + delta;
        if new < i64::from(heap.base.as_u32()) {
            return Err(BreakError::BelowBase);
        }
        let stack_floor = self
            .segments
            .get(SegmentKind::Stack)
            .map_or(u32::MAX, |s| s.start.as_u32());
        if new > i64::from(stack_floor) {
            return Err(BreakError::StackCollision);
        }
        let new = VirtualAddress::new(new as u32);
        heap.top = new;
        if let Some(data) = self.segments.get_mut(SegmentKind::DataBss) {
            data.end = new;
        }
        Ok(old)
    }

    pub(crate) fn find_segment(&self, addr: VirtualAddress) -> Option<(SegmentKind, Segment)> {
        self.segments.find(addr)
    }

    /// Extend the stack segment down to `new_start`.
    pub(crate) fn set_stack_start(&mut self, new_start: VirtualAddress) {
        let stack = self
            .segments
            .get_mut(SegmentKind::Stack)
            .expect("growing a stack that was never defined");
        debug_assert!(new_start < stack.start);
        stack.start = new_start;
    }

    pub(crate) fn table(&self) -> &PageTable {
        &self.table
    }

    pub(crate) fn table_mut(&mut self) -> &mut PageTable {
        &mut self.table
    }

    /// Copy segment layout and heap state from `other` (fork-time setup).
    pub(crate) fn clone_layout_from(&mut self, other: &Self) {
        self.segments = other.segments.clone();
        self.heap = other.heap;
    }

    /// Tear the space apart for destruction.
    pub(crate) fn into_table(self) -> (FrameId, PageTable) {
        (self.root_frame, self.table)
    }
}
