use alloc::vec::Vec;
use kernel_frames::PageData;

/// Failure of a backing-store transfer.
///
/// Retry policy, if any, belongs to the device implementation; the swap
/// store propagates these unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IoError {
    #[error("block {block} out of range (device holds {count})")]
    OutOfRange { block: u64, count: u64 },
    #[error("device transfer failed")]
    Device,
}

/// Synchronous, page-granular block storage.
///
/// The swap store addresses the device in whole-page blocks: block `n`
/// covers byte offsets `[n * PAGE_SIZE, (n + 1) * PAGE_SIZE)`. Transfers
/// either complete fully or fail with an [`IoError`].
pub trait BlockDevice {
    fn read_block(&mut self, block: u64, buf: &mut PageData) -> Result<(), IoError>;

    fn write_block(&mut self, block: u64, buf: &PageData) -> Result<(), IoError>;

    /// Number of page-sized blocks the device holds.
    fn block_count(&self) -> u64;
}

/// Block device backed by kernel memory.
///
/// Serves as the swap device in tests and early bring-up, before a real
/// disk driver is available.
pub struct MemoryBlockDevice {
    blocks: Vec<PageData>,
}

impl MemoryBlockDevice {
    #[must_use]
    pub fn new(block_count: usize) -> Self {
        let mut blocks = Vec::with_capacity(block_count);
        blocks.resize_with(block_count, PageData::zeroed);
        Self { blocks }
    }

    fn check(&self, block: u64) -> Result<usize, IoError> {
        let count = self.blocks.len() as u64;
        if block < count {
            Ok(block as usize)
        } else {
            Err(IoError::OutOfRange { block, count })
        }
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn read_block(&mut self, block: u64, buf: &mut PageData) -> Result<(), IoError> {
        let index = self.check(block)?;
        buf.as_bytes_mut().copy_from_slice(self.blocks[index].as_bytes());
        Ok(())
    }

    fn write_block(&mut self, block: u64, buf: &PageData) -> Result<(), IoError> {
        let index = self.check(block)?;
        self.blocks[index].as_bytes_mut().copy_from_slice(buf.as_bytes());
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.blocks.len() as u64
    }
}
