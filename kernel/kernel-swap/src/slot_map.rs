use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

/// Handle to one swap slot.
///
/// Created only by the owning [`SlotMap`]; a `SlotId` in a page-table entry
/// means "the only valid copy of that page lives in this slot".
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct SlotId(u32);

impl SlotId {
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// Free/occupied bitmap over the swap slots. A set bit means occupied.
///
/// The slot count is fixed at construction. Redundant transitions panic:
/// they mean two code paths both think they own a slot's accounting.
pub struct SlotMap {
    bits: Vec<u64>,
    nbits: usize,
}

const BITS_PER_WORD: usize = u64::BITS as usize;

impl SlotMap {
    #[must_use]
    pub fn new(nbits: usize) -> Self {
        Self {
            bits: vec![0; nbits.div_ceil(BITS_PER_WORD)],
            nbits,
        }
    }

    #[inline]
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.nbits
    }

    #[must_use]
    pub fn is_free(&self, slot: SlotId) -> bool {
        self.check_bounds(slot);
        self.bits[slot.index() / BITS_PER_WORD] & Self::mask(slot) == 0
    }

    /// # Panics
    /// If the slot is already occupied.
    pub fn mark_occupied(&mut self, slot: SlotId) {
        assert!(self.is_free(slot), "{slot} occupied twice");
        self.bits[slot.index() / BITS_PER_WORD] |= Self::mask(slot);
    }

    /// # Panics
    /// If the slot is already free.
    pub fn mark_free(&mut self, slot: SlotId) {
        assert!(!self.is_free(slot), "{slot} freed while free");
        self.bits[slot.index() / BITS_PER_WORD] &= !Self::mask(slot);
    }

    /// First-free scan; the returned slot is already marked occupied.
    /// `None` means the swap region is full.
    pub fn allocate(&mut self) -> Option<SlotId> {
        for index in 0..self.nbits {
            let slot = SlotId(index as u32);
            if self.is_free(slot) {
                self.mark_occupied(slot);
                return Some(slot);
            }
        }
        None
    }

    fn mask(slot: SlotId) -> u64 {
        1 << (slot.index() % BITS_PER_WORD)
    }

    fn check_bounds(&self, slot: SlotId) {
        assert!(
            slot.index() < self.nbits,
            "{slot} out of range ({} slots)",
            self.nbits
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_exclusive() {
        let mut map = SlotMap::new(70); // straddles a word boundary
        let mut seen = std::collections::HashSet::new();
        while let Some(slot) = map.allocate() {
            assert!(seen.insert(slot.index()), "slot {slot} handed out twice");
            assert!(!map.is_free(slot));
        }
        assert_eq!(seen.len(), 70);
    }

    #[test]
    fn free_then_reallocate() {
        let mut map = SlotMap::new(8);
        let a = map.allocate().unwrap();
        map.mark_free(a);
        assert!(map.is_free(a));
        assert_eq!(map.allocate().unwrap(), a);
    }

    #[test]
    #[should_panic(expected = "occupied twice")]
    fn double_occupy_panics() {
        let mut map = SlotMap::new(8);
        let a = map.allocate().unwrap();
        map.mark_occupied(a);
    }

    #[test]
    #[should_panic(expected = "freed while free")]
    fn redundant_free_panics() {
        let mut map = SlotMap::new(8);
        let a = map.allocate().unwrap();
        map.mark_free(a);
        map.mark_free(a);
    }
}
