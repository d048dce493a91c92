use crate::address_space::{AddressSpace, BreakError};
use crate::page_table::PageLocation;
use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_addresses::{AddressSpaceId, TABLE_ENTRIES, VirtualAddress, VirtualPage};
use kernel_frames::{FrameId, FrameTable, OutOfFrames, PageData, PageOwner};
use kernel_swap::{BlockDevice, IoError, SlotId, SwapBootstrapError, SwapError, SwapStore};
use kernel_sync::SpinLock;

/// Failure of a context-level operation that may touch frames, swap, and
/// the device.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error(transparent)]
    OutOfFrames(#[from] OutOfFrames),
    #[error(transparent)]
    Swap(#[from] SwapError),
    #[error(transparent)]
    Io(#[from] IoError),
}

/// The machine's VM state, constructed once at bootstrap.
///
/// Owns the frame table and swap store behind separate spin locks; every
/// component reaches them through a `&VmContext` instead of globals, so
/// tests build as many small machines as they like.
///
/// Locking: the two locks guard independent critical sections and are
/// never held at the same time. Paths that also lock an [`AddressSpace`]
/// take the space first, frames second.
pub struct VmContext<D> {
    frames: SpinLock<FrameTable>,
    swap: SpinLock<SwapStore<D>>,
    next_space_id: AtomicU64,
}

impl<D: BlockDevice> VmContext<D> {
    /// Bring up the frame table over `total_frames` of RAM, then the swap
    /// store on `device`.
    pub fn bootstrap(total_frames: usize, device: D) -> Result<Self, SwapBootstrapError> {
        let mut frames = FrameTable::new(total_frames);
        let swap = SwapStore::bootstrap(&mut frames, device)?;
        Ok(Self {
            frames: SpinLock::new(frames),
            swap: SpinLock::new(swap),
            next_space_id: AtomicU64::new(1),
        })
    }

    /// Run `f` under the frame-table lock.
    pub fn with_frames<R>(&self, f: impl FnOnce(&mut FrameTable) -> R) -> R {
        self.frames.with_lock(f)
    }

    /// Run `f` under the swap-store lock.
    pub fn with_swap<R>(&self, f: impl FnOnce(&mut SwapStore<D>) -> R) -> R {
        self.swap.with_lock(f)
    }

    pub fn alloc_frame(&self) -> Result<FrameId, OutOfFrames> {
        self.frames.with_lock(FrameTable::allocate)
    }

    pub fn free_frame(&self, frame: FrameId) {
        self.frames.with_lock(|ft| ft.free(frame));
    }

    /// Load a swapped page into `frame`, freeing the slot.
    ///
    /// The device transfer stages through a buffer so no I/O happens under
    /// the frame-table lock.
    pub fn swap_in(&self, slot: SlotId, frame: FrameId) -> Result<(), IoError> {
        let mut buf = Box::new(PageData::zeroed());
        self.swap.with_lock(|swap| swap.read_page(slot, &mut buf))?;
        self.frames.with_lock(|ft| {
            ft.page_mut(frame)
                .as_bytes_mut()
                .copy_from_slice(buf.as_bytes());
        });
        Ok(())
    }

    /// Write `frame`'s contents to a fresh swap slot.
    pub fn swap_out(&self, frame: FrameId) -> Result<SlotId, SwapError> {
        let buf = self.frames.with_lock(|ft| Box::new(ft.page(frame).clone()));
        self.swap.with_lock(|swap| swap.write_page(&buf))
    }

    /// Create an empty address space, charging one frame for its outer
    /// page table.
    pub fn create_space(&self) -> Result<AddressSpace, OutOfFrames> {
        let root = self.alloc_frame()?;
        let id = AddressSpaceId::new(self.next_space_id.fetch_add(1, Ordering::Relaxed));
        log::debug!("{id}: created");
        Ok(AddressSpace::new(id, root))
    }

    /// Tear a space down: release its swap slots, then every resident
    /// frame, every inner-table frame, and the outer frame.
    ///
    /// Safe against partially populated tables: only valid entries are
    /// walked.
    pub fn destroy_space(&self, space: AddressSpace) {
        let id = space.id();
        let (root, table) = space.into_table();

        self.swap.with_lock(|swap| {
            for (_, level) in table.levels() {
                for (_, location) in level.locations() {
                    if let PageLocation::Swapped(slot) = location {
                        swap.release(slot);
                    }
                }
            }
        });

        self.frames.with_lock(|ft| {
            for (_, level) in table.levels() {
                for (_, location) in level.locations() {
                    if let PageLocation::Resident(frame) = location {
                        ft.free(frame);
                    }
                }
                ft.free(level.frame());
            }
            ft.free(root);
        });
        log::debug!("{id}: destroyed");
    }

    /// Duplicate `src` for a fork: segments and heap verbatim, fresh inner
    /// tables, every page physically copied. A swapped source page is
    /// first brought back into a frame owned by the *source* (the read
    /// consumes its slot), then copied; parent and child never share a
    /// frame or a slot.
    ///
    /// All-or-nothing: on failure the partial child is destroyed. Frames
    /// the source gained by swap-ins stay; the source is strictly more
    /// resident, never damaged.
    pub fn deep_copy(&self, src: &mut AddressSpace) -> Result<AddressSpace, VmError> {
        let mut child = self.create_space()?;
        child.clone_layout_from(src);
        match self.copy_pages(src, &mut child) {
            Ok(()) => Ok(child),
            Err(e) => {
                self.destroy_space(child);
                Err(e)
            }
        }
    }

    fn copy_pages(&self, src: &mut AddressSpace, child: &mut AddressSpace) -> Result<(), VmError> {
        for outer in 0..TABLE_ENTRIES {
            let probe = VirtualPage::from_indices(outer, 0);
            if !src.table().level_present(probe) {
                continue;
            }
            let level_frame = self.alloc_frame()?;
            child.table_mut().install_level(probe, level_frame);

            for inner in 0..TABLE_ENTRIES {
                let page = VirtualPage::from_indices(outer, inner);
                let src_frame = match src.table().get(page) {
                    PageLocation::Unmapped => continue,
                    PageLocation::Resident(f) => f,
                    PageLocation::Swapped(slot) => {
                        let f = self.alloc_frame()?;
                        if let Err(e) = self.swap_in(slot, f) {
                            self.free_frame(f);
                            return Err(e.into());
                        }
                        src.table_mut().set(page, PageLocation::Resident(f));
                        self.adopt(f, src.id(), page);
                        f
                    }
                };
                let copy = self.alloc_frame()?;
                self.frames.with_lock(|ft| ft.copy_page(src_frame, copy));
                child.table_mut().set(page, PageLocation::Resident(copy));
                self.adopt(copy, child.id(), page);
            }
        }
        Ok(())
    }

    /// Hand a freshly filled frame to a user mapping: reverse lookup plus
    /// the user tag that makes it eviction-eligible.
    pub(crate) fn adopt(&self, frame: FrameId, space: AddressSpaceId, page: VirtualPage) {
        self.frames.with_lock(|ft| {
            ft.set_owner(frame, PageOwner { space, page });
            ft.mark_user(frame);
        });
    }

    /// Adjust `space`'s break by `delta` bytes, returning the old break.
    ///
    /// Runs under the frame-table lock even though it allocates nothing:
    /// the break races with fault-driven page-table mutation from sibling
    /// threads, which serialize on the same lock.
    pub fn grow_break(
        &self,
        space: &SpinLock<AddressSpace>,
        delta: i64,
    ) -> Result<VirtualAddress, BreakError> {
        let mut space = space.lock();
        let _frames = self.frames.lock();
        space.grow_break_locked(delta)
    }
}
