//! End-to-end fault scenarios against a small simulated machine.

use kernel_addresses::{PAGE_SIZE, USER_SPACE_TOP, VirtualAddress};
use kernel_swap::{MemoryBlockDevice, SWAP_RATIO, SwapError};
use kernel_sync::SpinLock;
use kernel_vm::{
    AddressSpace, FaultError, FaultKind, PageLocation, Protection, SoftTlb, TlbControl, TlbFlags,
    VmContext, handle_fault, handle_raw_fault,
};

const PS: u32 = PAGE_SIZE as u32;
const RW: Protection = Protection::READ.union(Protection::WRITE);

fn machine(frames: usize) -> VmContext<MemoryBlockDevice> {
    VmContext::bootstrap(frames, MemoryBlockDevice::new(frames * SWAP_RATIO)).unwrap()
}

fn space_with_data_region(
    ctx: &VmContext<MemoryBlockDevice>,
    start: u32,
    size: u32,
) -> SpinLock<AddressSpace> {
    let mut space = ctx.create_space().unwrap();
    space
        .define_region(VirtualAddress::new(start), size, RW)
        .unwrap();
    SpinLock::new(space)
}

fn in_use(ctx: &VmContext<MemoryBlockDevice>) -> usize {
    ctx.with_frames(|ft| ft.stats().in_use)
}

#[test]
fn fault_makes_the_page_resident() {
    let ctx = machine(64);
    let space = space_with_data_region(&ctx, 0x1000, 0x1000);
    let mut tlb = SoftTlb::new();
    let addr = VirtualAddress::new(0x1000);

    handle_fault(&ctx, Some(&space), &mut tlb, FaultKind::Read, addr).unwrap();

    let location = space.with_lock(|s| s.page_location(addr.page()));
    let PageLocation::Resident(frame) = location else {
        panic!("page not resident after fault: {location:?}");
    };
    // fresh pages come in zeroed
    assert!(ctx.with_frames(|ft| ft.page(frame).words().all(|w| w == 0)));
    // the frame is user-tagged with a reverse lookup
    ctx.with_frames(|ft| {
        assert!(!ft.is_kernel(frame));
        let owner = ft.owner(frame).unwrap();
        assert_eq!(owner.page, addr.page());
    });
    let entry = tlb.lookup(addr.page()).unwrap();
    assert_eq!(entry.frame, frame);
    assert!(entry.flags.contains(TlbFlags::VALID));
    assert!(!entry.flags.contains(TlbFlags::DIRTY));
}

#[test]
fn refaulting_allocates_nothing_further() {
    let ctx = machine(64);
    let space = space_with_data_region(&ctx, 0x1000, 0x1000);
    let mut tlb = SoftTlb::new();
    let addr = VirtualAddress::new(0x1000);

    handle_fault(&ctx, Some(&space), &mut tlb, FaultKind::Read, addr).unwrap();
    let first = space.with_lock(|s| s.page_location(addr.page()));
    let used = in_use(&ctx);

    handle_fault(&ctx, Some(&space), &mut tlb, FaultKind::Read, addr).unwrap();
    handle_fault(&ctx, Some(&space), &mut tlb, FaultKind::Write, addr).unwrap();

    assert_eq!(space.with_lock(|s| s.page_location(addr.page())), first);
    assert_eq!(in_use(&ctx), used);
    // the write fault set the dirty bit on the existing entry
    let entry = tlb.lookup(addr.page()).unwrap();
    assert!(entry.flags.contains(TlbFlags::DIRTY));
}

#[test]
fn stack_grows_within_bounds_and_rejects_beyond() {
    let ctx = machine(64);
    let mut tlb = SoftTlb::new();
    let space = {
        let mut s = ctx.create_space().unwrap();
        s.define_stack();
        // data/bss ends 14 pages below the stack anchor
        s.define_region(USER_SPACE_TOP - 16 * PS, 2 * PS, RW).unwrap();
        SpinLock::new(s)
    };

    // three pages below the mark: within the growth bound, gap stays legal
    let grow_addr = USER_SPACE_TOP - 3 * PS;
    handle_fault(&ctx, Some(&space), &mut tlb, FaultKind::Write, grow_addr).unwrap();
    space.with_lock(|s| {
        let stack = s.segment(kernel_vm::SegmentKind::Stack).unwrap();
        assert_eq!(stack.start, grow_addr);
    });
    assert!(matches!(
        space.with_lock(|s| s.page_location(grow_addr.page())),
        PageLocation::Resident(_)
    ));

    // twenty pages below the original mark: far beyond the growth bound
    let too_far = USER_SPACE_TOP - 20 * PS;
    assert!(matches!(
        handle_fault(&ctx, Some(&space), &mut tlb, FaultKind::Write, too_far),
        Err(FaultError::Unmapped { .. })
    ));
    // the failed fault did not move the stack
    space.with_lock(|s| {
        assert_eq!(s.segment(kernel_vm::SegmentKind::Stack).unwrap().start, grow_addr);
    });
}

#[test]
fn stack_growth_keeps_a_gap_above_the_data_segment() {
    let ctx = machine(64);
    let mut tlb = SoftTlb::new();
    let space = {
        let mut s = ctx.create_space().unwrap();
        s.define_stack();
        // data/bss ends only 12 pages below the stack anchor
        s.define_region(USER_SPACE_TOP - 14 * PS, 2 * PS, RW).unwrap();
        SpinLock::new(s)
    };

    // growing three pages would leave a nine-page gap: rejected
    let addr = USER_SPACE_TOP - 3 * PS;
    assert!(matches!(
        handle_fault(&ctx, Some(&space), &mut tlb, FaultKind::Write, addr),
        Err(FaultError::Unmapped { .. })
    ));
}

#[test]
fn faults_without_context_fail_fast() {
    let ctx = machine(16);
    let mut tlb = SoftTlb::new();
    assert!(matches!(
        handle_fault(
            &ctx,
            None,
            &mut tlb,
            FaultKind::Read,
            VirtualAddress::new(0x1000)
        ),
        Err(FaultError::NoContext)
    ));
}

#[test]
fn unknown_fault_codes_are_rejected() {
    let ctx = machine(16);
    let space = space_with_data_region(&ctx, 0x1000, 0x1000);
    let mut tlb = SoftTlb::new();
    assert!(matches!(
        handle_raw_fault(
            &ctx,
            Some(&space),
            &mut tlb,
            9,
            VirtualAddress::new(0x1000)
        ),
        Err(FaultError::InvalidFault(9))
    ));
}

#[test]
fn protection_violations_are_fatal_to_the_process_only() {
    let ctx = machine(64);
    let mut tlb = SoftTlb::new();
    let space = {
        let mut s = ctx.create_space().unwrap();
        s.define_region(
            VirtualAddress::new(0x40_0000),
            PS,
            Protection::READ | Protection::EXEC,
        )
        .unwrap();
        s.define_region(VirtualAddress::new(0x1000), PS, RW).unwrap();
        SpinLock::new(s)
    };

    assert!(matches!(
        handle_fault(
            &ctx,
            Some(&space),
            &mut tlb,
            FaultKind::Write,
            VirtualAddress::new(0x40_0000)
        ),
        Err(FaultError::Protection { .. })
    ));
    // the kernel carries on: a legal fault still resolves
    handle_fault(
        &ctx,
        Some(&space),
        &mut tlb,
        FaultKind::Write,
        VirtualAddress::new(0x1000),
    )
    .unwrap();
}

#[test]
fn load_bracket_suspends_checks_then_flushes() {
    let ctx = machine(64);
    let mut tlb = SoftTlb::new();
    let space = {
        let mut s = ctx.create_space().unwrap();
        s.define_region(
            VirtualAddress::new(0x40_0000),
            PS,
            Protection::READ | Protection::EXEC,
        )
        .unwrap();
        SpinLock::new(s)
    };
    let addr = VirtualAddress::new(0x40_0000);

    space.with_lock(AddressSpace::prepare_load);
    handle_fault(&ctx, Some(&space), &mut tlb, FaultKind::Write, addr).unwrap();
    assert!(tlb.occupied() > 0);

    space.with_lock(|s| s.complete_load(&mut tlb));
    assert_eq!(tlb.occupied(), 0);

    // checks are live again
    assert!(matches!(
        handle_fault(&ctx, Some(&space), &mut tlb, FaultKind::Write, addr),
        Err(FaultError::Protection { .. })
    ));
}

#[test]
fn read_only_refault_dirties_the_existing_entry() {
    let ctx = machine(64);
    let space = space_with_data_region(&ctx, 0x1000, 0x1000);
    let mut tlb = SoftTlb::new();
    let addr = VirtualAddress::new(0x1800);

    handle_fault(&ctx, Some(&space), &mut tlb, FaultKind::Read, addr).unwrap();
    let slot = tlb.probe(addr.page()).unwrap();
    assert!(!tlb.entry(slot).unwrap().flags.contains(TlbFlags::DIRTY));

    handle_fault(&ctx, Some(&space), &mut tlb, FaultKind::ReadOnly, addr).unwrap();
    assert_eq!(tlb.occupied(), 1);
    let entry = tlb.entry(slot).unwrap();
    assert!(entry.flags.contains(TlbFlags::VALID | TlbFlags::DIRTY));
}

#[test]
fn out_of_frames_fails_the_fault() {
    // 4 frames: metadata + swap bitmap eat two, the space root a third,
    // leaving one for the inner table and none for the page itself.
    let ctx = machine(4);
    let space = space_with_data_region(&ctx, 0x1000, 0x1000);
    let mut tlb = SoftTlb::new();
    assert!(matches!(
        handle_fault(
            &ctx,
            Some(&space),
            &mut tlb,
            FaultKind::Read,
            VirtualAddress::new(0x1000)
        ),
        Err(FaultError::OutOfMemory)
    ));
}

#[test]
fn swap_exhaustion_reports_full_and_keeps_accounting() {
    let ctx = machine(4);
    let frame = ctx.alloc_frame().unwrap();
    let mut slots = Vec::new();
    loop {
        match ctx.swap_out(frame) {
            Ok(slot) => slots.push(slot),
            Err(SwapError::Full) => break,
            Err(e) => panic!("unexpected swap error: {e}"),
        }
    }
    assert_eq!(slots.len(), 4 * SWAP_RATIO);
    ctx.with_swap(|swap| {
        for &slot in &slots {
            assert!(!swap.is_free(slot));
        }
    });
}

#[test]
fn deep_copy_isolates_page_contents() {
    let ctx = machine(64);
    let space = space_with_data_region(&ctx, 0x1000, 0x2000);
    let mut tlb = SoftTlb::new();
    let addr = VirtualAddress::new(0x1000);

    handle_fault(&ctx, Some(&space), &mut tlb, FaultKind::Write, addr).unwrap();
    let mut parent = space.lock();
    let PageLocation::Resident(parent_frame) = parent.page_location(addr.page()) else {
        panic!("expected resident page");
    };
    ctx.with_frames(|ft| ft.page_mut(parent_frame).fill_words(0xAAAA_5555));

    let child = ctx.deep_copy(&mut parent).unwrap();
    let PageLocation::Resident(child_frame) = child.page_location(addr.page()) else {
        panic!("copy lost the page");
    };
    assert_ne!(parent_frame, child_frame);
    assert_ne!(parent.id(), child.id());

    // mutate the copy; the original must not move
    ctx.with_frames(|ft| {
        ft.page_mut(child_frame).fill_words(0x1111_2222);
        assert!(ft.page(parent_frame).words().all(|w| w == 0xAAAA_5555));
        // reverse lookups point at the right spaces
        assert_eq!(ft.owner(child_frame).unwrap().space, child.id());
        assert_eq!(ft.owner(parent_frame).unwrap().space, parent.id());
    });

    drop(parent);
    ctx.destroy_space(child);
}

#[test]
fn deep_copy_faults_swapped_pages_back_into_the_source() {
    let ctx = machine(64);
    let space = space_with_data_region(&ctx, 0x1000, 0x1000);
    let mut tlb = SoftTlb::new();
    let addr = VirtualAddress::new(0x1000);

    handle_fault(&ctx, Some(&space), &mut tlb, FaultKind::Write, addr).unwrap();
    let mut parent = space.lock();
    let PageLocation::Resident(frame) = parent.page_location(addr.page()) else {
        panic!("expected resident page");
    };
    ctx.with_frames(|ft| ft.page_mut(frame).fill_words(0xFEED_F00D));

    // push the page out by hand, as an eviction path would
    let slot = ctx.swap_out(frame).unwrap();
    parent.set_page_location(addr.page(), PageLocation::Swapped(slot));
    ctx.free_frame(frame);

    let child = ctx.deep_copy(&mut parent).unwrap();

    // the read consumed the slot; both spaces are resident with the data
    ctx.with_swap(|swap| assert!(swap.is_free(slot)));
    let PageLocation::Resident(pf) = parent.page_location(addr.page()) else {
        panic!("source page still swapped after copy");
    };
    let PageLocation::Resident(cf) = child.page_location(addr.page()) else {
        panic!("copy page missing");
    };
    assert_ne!(pf, cf);
    ctx.with_frames(|ft| {
        assert!(ft.page(pf).words().all(|w| w == 0xFEED_F00D));
        assert!(ft.page(cf).words().all(|w| w == 0xFEED_F00D));
    });
}

#[test]
fn destroy_returns_every_frame_and_slot() {
    let ctx = machine(64);
    let baseline = in_use(&ctx);
    let space = space_with_data_region(&ctx, 0x1000, 0x3000);
    let mut tlb = SoftTlb::new();

    for page in 0..3_u32 {
        let addr = VirtualAddress::new(0x1000 + page * PS);
        handle_fault(&ctx, Some(&space), &mut tlb, FaultKind::Write, addr).unwrap();
    }

    let mut space = space.into_inner();
    // stage one page in swap so teardown has a slot to release
    let addr = VirtualAddress::new(0x1000);
    let PageLocation::Resident(frame) = space.page_location(addr.page()) else {
        panic!("expected resident page");
    };
    let slot = ctx.swap_out(frame).unwrap();
    space.set_page_location(addr.page(), PageLocation::Swapped(slot));
    ctx.free_frame(frame);

    ctx.destroy_space(space);
    assert_eq!(in_use(&ctx), baseline);
    ctx.with_swap(|swap| assert!(swap.is_free(slot)));
}

#[test]
fn grow_break_then_fault_into_the_new_heap() {
    let ctx = machine(64);
    let space = space_with_data_region(&ctx, 0x1000, 0x1000);
    let mut tlb = SoftTlb::new();

    let old = ctx.grow_break(&space, i64::from(PS)).unwrap();
    assert_eq!(old, VirtualAddress::new(0x2000));

    let heap_addr = VirtualAddress::new(0x2800);
    handle_fault(&ctx, Some(&space), &mut tlb, FaultKind::Write, heap_addr).unwrap();
    assert!(matches!(
        space.with_lock(|s| s.page_location(heap_addr.page())),
        PageLocation::Resident(_)
    ));
}

#[test]
fn activate_drops_translations_from_the_previous_space() {
    let ctx = machine(64);
    let space = space_with_data_region(&ctx, 0x1000, 0x1000);
    let mut tlb = SoftTlb::new();
    handle_fault(
        &ctx,
        Some(&space),
        &mut tlb,
        FaultKind::Read,
        VirtualAddress::new(0x1000),
    )
    .unwrap();
    assert!(tlb.occupied() > 0);

    let next = ctx.create_space().unwrap();
    next.activate(&mut tlb);
    assert_eq!(tlb.occupied(), 0);
    ctx.destroy_space(next);
}
