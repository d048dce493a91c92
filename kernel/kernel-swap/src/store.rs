use crate::{BlockDevice, IoError, SWAP_RATIO, SlotId, SlotMap};
use alloc::vec::Vec;
use kernel_addresses::PAGE_SIZE;
use kernel_frames::{FrameId, FrameTable, OutOfFrames, PageData};

#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    /// Every slot is occupied; nothing can be written out until a swap-in
    /// frees one.
    #[error("swap store full")]
    Full,
    #[error(transparent)]
    Io(#[from] IoError),
}

#[derive(Debug, thiserror::Error)]
pub enum SwapBootstrapError {
    #[error("swap device holds {actual} blocks, {needed} needed")]
    DeviceTooSmall { needed: u64, actual: u64 },
    #[error(transparent)]
    OutOfFrames(#[from] OutOfFrames),
}

/// The swap store: slot bitmap plus the backing device.
///
/// Slot `n` lives at device block `n` (byte offset `n * PAGE_SIZE`). Callers
/// serialize access with one lock around the whole store; bitmap accounting
/// and the transfer for a given operation form one critical section.
pub struct SwapStore<D> {
    map: SlotMap,
    device: D,
    /// Frames reserved at bootstrap to hold the bitmap and its header.
    /// Held for the life of the kernel; kept for accounting introspection.
    bitmap_frames: Vec<FrameId>,
}

impl<D: BlockDevice> SwapStore<D> {
    /// Size and install the swap store.
    ///
    /// Provisions [`SWAP_RATIO`] slots per physical frame and reserves the
    /// frames that hold the bitmap bits plus its header, taken from the
    /// frame allocator while boot still guarantees contiguity.
    pub fn bootstrap(frames: &mut FrameTable, device: D) -> Result<Self, SwapBootstrapError> {
        let slot_count = frames.total_frames() * SWAP_RATIO;

        let needed = slot_count as u64;
        let actual = device.block_count();
        if actual < needed {
            return Err(SwapBootstrapError::DeviceTooSmall { needed, actual });
        }

        let bitmap_bytes = slot_count.div_ceil(8) + size_of::<SlotMap>();
        let bitmap_pages = bitmap_bytes.div_ceil(PAGE_SIZE);
        let mut bitmap_frames = Vec::with_capacity(bitmap_pages);
        for _ in 0..bitmap_pages {
            bitmap_frames.push(frames.allocate()?);
        }

        log::info!(
            "swap store: {slot_count} slots, {bitmap_pages} pages reserved for the slot bitmap"
        );

        Ok(Self {
            map: SlotMap::new(slot_count),
            device,
            bitmap_frames,
        })
    }

    #[inline]
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.map.slot_count()
    }

    #[must_use]
    pub fn is_free(&self, slot: SlotId) -> bool {
        self.map.is_free(slot)
    }

    /// Frames pinned under the slot bitmap since bootstrap.
    #[must_use]
    pub fn bitmap_frames(&self) -> &[FrameId] {
        &self.bitmap_frames
    }

    /// Give a slot back without reading it.
    ///
    /// For teardown of an address space whose swapped pages will never be
    /// needed again, and for rolling back a mapping that failed partway.
    ///
    /// # Panics
    /// If the slot is already free.
    pub fn release(&mut self, slot: SlotId) {
        self.map.mark_free(slot);
    }

    /// Read a slot's page into `buf` and free the slot.
    ///
    /// Swap-in consumes the backing copy; after success the only copy of
    /// the page is in `buf`. On a device error the slot stays occupied;
    /// the data on disk is still the only copy there is.
    pub fn read_page(&mut self, slot: SlotId, buf: &mut PageData) -> Result<(), IoError> {
        self.device.read_block(slot.index() as u64, buf)?;
        self.map.mark_free(slot);
        Ok(())
    }

    /// Write `buf` to a freshly allocated slot and return it.
    ///
    /// All-or-nothing: a device failure releases the slot again before the
    /// error propagates.
    pub fn write_page(&mut self, buf: &PageData) -> Result<SlotId, SwapError> {
        let slot = self.map.allocate().ok_or(SwapError::Full)?;
        if let Err(e) = self.device.write_block(slot.index() as u64, buf) {
            self.map.mark_free(slot);
            return Err(SwapError::Io(e));
        }
        Ok(slot)
    }
}
