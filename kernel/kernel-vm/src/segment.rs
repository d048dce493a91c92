use kernel_addresses::VirtualAddress;

bitflags::bitflags! {
    /// Access permissions of a virtual region.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// The four fixed segment slots every address space carries.
///
/// The permission pattern a region is defined with determines its slot;
/// there is no general region list.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SegmentKind {
    /// Read + execute: program text.
    Code,
    /// Read only: constants and other read-only image data.
    RoData,
    /// Read + write: data, bss, and the heap growing out of their end.
    DataBss,
    /// Read + write, fixed top, grows downward on demand.
    Stack,
}

impl SegmentKind {
    pub const ALL: [Self; 4] = [Self::Code, Self::RoData, Self::DataBss, Self::Stack];

    const fn slot(self) -> usize {
        match self {
            Self::Code => 0,
            Self::RoData => 1,
            Self::DataBss => 2,
            Self::Stack => 3,
        }
    }
}

/// One contiguous virtual range with uniform permissions.
///
/// The range is half-open: `start` is mapped, `end` is not.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Segment {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub prot: Protection,
}

impl Segment {
    #[inline]
    #[must_use]
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        self.start <= addr && addr < self.end
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    /// The permission combination maps to none of the fixed segment slots.
    #[error("no segment accepts permissions {0:?}")]
    InvalidPermissions(Protection),
}

/// The per-address-space segment table.
#[derive(Clone, Default)]
pub(crate) struct SegmentTable {
    slots: [Option<Segment>; 4],
}

impl SegmentTable {
    pub(crate) const fn new() -> Self {
        Self { slots: [None; 4] }
    }

    /// Which slot a permission pattern belongs in.
    ///
    /// Read+execute is code, read-only is static data, read+write is
    /// data/bss. Everything else (writable code, exec-only, write-only,
    /// unreadable regions) is rejected.
    pub(crate) fn classify(prot: Protection) -> Result<SegmentKind, RegionError> {
        let (r, w, x) = (
            prot.contains(Protection::READ),
            prot.contains(Protection::WRITE),
            prot.contains(Protection::EXEC),
        );
        match (r, w, x) {
            (true, false, true) => Ok(SegmentKind::Code),
            (true, false, false) => Ok(SegmentKind::RoData),
            (true, true, false) => Ok(SegmentKind::DataBss),
            _ => Err(RegionError::InvalidPermissions(prot)),
        }
    }

    pub(crate) fn get(&self, kind: SegmentKind) -> Option<Segment> {
        self.slots[kind.slot()]
    }

    pub(crate) fn set(&mut self, kind: SegmentKind, segment: Segment) {
        self.slots[kind.slot()] = Some(segment);
    }

    pub(crate) fn get_mut(&mut self, kind: SegmentKind) -> Option<&mut Segment> {
        self.slots[kind.slot()].as_mut()
    }

    /// The segment containing `addr`, if any.
    pub(crate) fn find(&self, addr: VirtualAddress) -> Option<(SegmentKind, Segment)> {
        SegmentKind::ALL.into_iter().find_map(|kind| {
            self.get(kind)
                .filter(|s| s.contains(addr))
                .map(|s| (kind, s))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_the_three_patterns() {
        assert!(matches!(
            SegmentTable::classify(Protection::READ | Protection::EXEC),
            Ok(SegmentKind::Code)
        ));
        assert!(matches!(
            SegmentTable::classify(Protection::READ),
            Ok(SegmentKind::RoData)
        ));
        assert!(matches!(
            SegmentTable::classify(Protection::READ | Protection::WRITE),
            Ok(SegmentKind::DataBss)
        ));
    }

    #[test]
    fn odd_permission_patterns_are_rejected() {
        for prot in [
            Protection::empty(),
            Protection::WRITE,
            Protection::EXEC,
            Protection::WRITE | Protection::EXEC,
            Protection::READ | Protection::WRITE | Protection::EXEC,
        ] {
            assert!(SegmentTable::classify(prot).is_err(), "{prot:?} accepted");
        }
    }

    #[test]
    fn find_respects_half_open_ranges() {
        let mut table = SegmentTable::new();
        table.set(
            SegmentKind::DataBss,
            Segment {
                start: VirtualAddress::new(0x1000),
                end: VirtualAddress::new(0x3000),
                prot: Protection::READ | Protection::WRITE,
            },
        );
        assert!(table.find(VirtualAddress::new(0x0FFF)).is_none());
        assert!(table.find(VirtualAddress::new(0x1000)).is_some());
        assert!(table.find(VirtualAddress::new(0x2FFF)).is_some());
        assert!(table.find(VirtualAddress::new(0x3000)).is_none());
    }
}
