//! # Virtual Memory Core
//!
//! Per-process address translation for a software-managed-TLB machine:
//! segment tables, lazily built two-level page tables, demand paging
//! against a swap store, and the fault handler that ties them to the TLB.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │               Fault Handler / TLB Manager            │
//! │   segment checks · stack growth · lazy tables ·      │
//! │   swap-in · TLB programming ([`handle_fault`])       │
//! └──────────┬────────────────────────────┬──────────────┘
//!            │                            │
//! ┌──────────▼─────────────┐   ┌──────────▼──────────────┐
//! │     Address Space      │   │        VmContext        │
//! │  segments · page table │   │  frame table + swap     │
//! │  heap break · copy     │   │  store behind locks     │
//! └────────────────────────┘   └──────────┬──────────────┘
//!                                         │
//!                     kernel-frames · kernel-swap
//! ```
//!
//! Hardware enters through two seams: [`TlbControl`] (translation cache
//! primitives; [`SoftTlb`] implements it in memory) and the swap store's
//! `BlockDevice`. Everything else is plain data, so each test constructs
//! its own small machine.
//!
//! ## Concurrency
//!
//! The [`VmContext`] owns the frame table and swap store behind separate
//! spin locks whose critical sections never nest. A fault runs with its
//! address space locked for the whole handler body; where an operation
//! additionally needs the frame-table lock (the break, allocation), the
//! order is always address space first, then frames.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod address_space;
mod context;
mod fault;
mod page_table;
mod segment;
mod tlb;

pub use address_space::{AddressSpace, BreakError};
pub use context::{VmContext, VmError};
pub use fault::{FaultError, FaultKind, handle_fault, handle_raw_fault};
pub use page_table::PageLocation;
pub use segment::{Protection, RegionError, Segment, SegmentKind};
pub use tlb::{SoftTlb, TLB_SLOTS, TlbControl, TlbEntry, TlbFlags, shootdown};

/// How far below the stack's current low-water mark a fault may land and
/// still be treated as stack growth, in pages.
pub const STACK_GROW_PAGES: usize = 10;

/// Minimum gap, in pages, that stack growth must leave above the data/bss
/// segment's end.
pub const STACK_GAP_PAGES: usize = 10;
