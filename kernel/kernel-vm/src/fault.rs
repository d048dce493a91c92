use crate::address_space::AddressSpace;
use crate::context::VmContext;
use crate::page_table::PageLocation;
use crate::segment::{Protection, SegmentKind};
use crate::tlb::{TlbControl, TlbEntry, TlbFlags};
use crate::{STACK_GAP_PAGES, STACK_GROW_PAGES};
use kernel_addresses::{PAGE_SIZE, VirtualAddress, VirtualPage};
use kernel_frames::FrameId;
use kernel_swap::{BlockDevice, IoError};
use kernel_sync::SpinLock;

/// What the hardware reported about the faulting access.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FaultKind {
    /// Read through a missing translation.
    Read,
    /// Write through a missing translation.
    Write,
    /// Write through a translation installed without the dirty bit: the
    /// page is resident and mapped, the hardware just refused the store.
    ReadOnly,
}

impl FaultKind {
    /// Map the machine's fault codes. Anything unrecognized is the
    /// caller's [`FaultError::InvalidFault`].
    #[must_use]
    pub const fn from_raw(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            2 => Some(Self::ReadOnly),
            _ => None,
        }
    }
}

/// Terminal fault outcomes. Each is fatal to the faulting context, not to
/// the kernel; the process layer decides what dying looks like.
#[derive(Debug, thiserror::Error)]
pub enum FaultError {
    /// Fault before any process context exists (a kernel bring-up bug);
    /// failing fast beats an infinite fault loop.
    #[error("fault taken with no process or address space")]
    NoContext,
    /// The access contradicts the containing segment's permissions.
    #[error("{kind:?} access at {addr} violates segment permissions")]
    Protection { addr: VirtualAddress, kind: FaultKind },
    /// No segment covers the address and it is not a legal stack-growth
    /// candidate.
    #[error("no mapping covers {addr}")]
    Unmapped { addr: VirtualAddress },
    /// The hardware handed over a fault code this kernel does not know.
    #[error("unrecognized fault code {0}")]
    InvalidFault(u32),
    /// No free frame to resolve the fault with.
    #[error("out of physical frames")]
    OutOfMemory,
    /// The swap backing store failed while paging in.
    #[error(transparent)]
    Io(#[from] IoError),
}

/// [`handle_fault`] for callers holding a raw hardware fault code.
pub fn handle_raw_fault<D: BlockDevice, T: TlbControl>(
    ctx: &VmContext<D>,
    current: Option<&SpinLock<AddressSpace>>,
    tlb: &mut T,
    code: u32,
    addr: VirtualAddress,
) -> Result<(), FaultError> {
    let Some(kind) = FaultKind::from_raw(code) else {
        return Err(FaultError::InvalidFault(code));
    };
    handle_fault(ctx, current, tlb, kind, addr)
}

/// Resolve one translation fault, or report why it cannot be resolved.
///
/// `current` is the faulting thread's address space, absent only during
/// early boot. The space stays locked for the entire handler body so the
/// page table and TLB change atomically with respect to sibling threads.
///
/// The walk: classify the address against the segment table (growing the
/// stack when legal), materialize the missing page-table level and page
/// (paging in from swap if that is where the page went), then install or
/// rewrite the TLB entry.
pub fn handle_fault<D: BlockDevice, T: TlbControl>(
    ctx: &VmContext<D>,
    current: Option<&SpinLock<AddressSpace>>,
    tlb: &mut T,
    kind: FaultKind,
    addr: VirtualAddress,
) -> Result<(), FaultError> {
    let Some(space) = current else {
        return Err(FaultError::NoContext);
    };
    let mut space = space.lock();

    match space.find_segment(addr) {
        Some((_, segment)) => {
            if !space.is_loading() && !permits(segment.prot, kind) {
                log::warn!("{}: {kind:?} at {addr} denied by segment", space.id());
                return Err(FaultError::Protection { addr, kind });
            }
        }
        None => grow_stack(&mut space, addr)?,
    }

    let page = addr.page();

    if !space.table().level_present(page) {
        // The inner-table frame stays kernel-tagged: it is table storage,
        // never eviction fodder.
        let frame = ctx.alloc_frame().map_err(|_| FaultError::OutOfMemory)?;
        space.table_mut().install_level(page, frame);
    }

    let frame = match space.table().get(page) {
        PageLocation::Resident(frame) => frame,
        location if kind == FaultKind::ReadOnly => {
            // A read-only violation only occurs through an installed
            // translation, which requires residency.
            panic!("read-only fault on non-resident {page:?} ({location:?})");
        }
        PageLocation::Unmapped => {
            let frame = ctx.alloc_frame().map_err(|_| FaultError::OutOfMemory)?;
            finish_mapping(ctx, &mut space, page, frame);
            frame
        }
        PageLocation::Swapped(slot) => {
            let frame = ctx.alloc_frame().map_err(|_| FaultError::OutOfMemory)?;
            if let Err(e) = ctx.swap_in(slot, frame) {
                ctx.free_frame(frame);
                return Err(e.into());
            }
            finish_mapping(ctx, &mut space, page, frame);
            frame
        }
    };

    program_tlb(tlb, kind, page, frame);
    log::trace!("{}: {kind:?} at {addr} resolved to {frame}", space.id());
    Ok(())
}

fn permits(prot: Protection, kind: FaultKind) -> bool {
    match kind {
        FaultKind::Read => prot.contains(Protection::READ),
        // A read-only violation is a write that the TLB refused; it is
        // legal exactly when the segment is writable.
        FaultKind::Write | FaultKind::ReadOnly => prot.contains(Protection::WRITE),
    }
}

/// The address sits in no segment. Growth is legal when it lands within
/// [`STACK_GROW_PAGES`] below the stack's current start and the grown
/// stack still clears the data/bss end by [`STACK_GAP_PAGES`].
fn grow_stack(space: &mut AddressSpace, addr: VirtualAddress) -> Result<(), FaultError> {
    let unmapped = FaultError::Unmapped { addr };

    let Some(stack) = space.segment(SegmentKind::Stack) else {
        return Err(unmapped);
    };
    let below = match stack.start.checked_sub(addr) {
        Some(d) if d > 0 => d,
        _ => return Err(unmapped), // at or above the stack: not growth
    };
    if below as usize >= STACK_GROW_PAGES * PAGE_SIZE {
        return Err(unmapped);
    }

    let pages = (below as usize).div_ceil(PAGE_SIZE);
    let new_start = stack.start - (pages * PAGE_SIZE) as u32;

    let data_end = space
        .segment(SegmentKind::DataBss)
        .map_or(VirtualAddress::zero(), |s| s.end);
    let gap = new_start.checked_sub(data_end).ok_or(unmapped)?;
    if (gap as usize) < STACK_GAP_PAGES * PAGE_SIZE {
        return Err(FaultError::Unmapped { addr });
    }

    space.set_stack_start(new_start);
    log::debug!("{}: stack grown to {new_start}", space.id());
    Ok(())
}

fn finish_mapping<D: BlockDevice>(
    ctx: &VmContext<D>,
    space: &mut AddressSpace,
    page: VirtualPage,
    frame: FrameId,
) {
    space.table_mut().set(page, PageLocation::Resident(frame));
    ctx.adopt(frame, space.id(), page);
}

fn program_tlb<T: TlbControl>(
    tlb: &mut T,
    kind: FaultKind,
    page: VirtualPage,
    frame: FrameId,
) {
    match kind {
        FaultKind::ReadOnly => {
            // The entry that refused the write must still be installed.
            let slot = tlb
                .probe(page)
                .expect("read-only fault without a TLB entry");
            tlb.write_indexed(
                slot,
                TlbEntry {
                    page,
                    frame,
                    flags: TlbFlags::VALID | TlbFlags::DIRTY,
                },
            );
        }
        FaultKind::Read | FaultKind::Write => {
            let mut flags = TlbFlags::VALID;
            if kind == FaultKind::Write {
                flags |= TlbFlags::DIRTY;
            }
            let entry = TlbEntry { page, frame, flags };
            match tlb.probe(page) {
                Some(slot) => tlb.write_indexed(slot, entry),
                None => tlb.write_random(entry),
            }
        }
    }
}
