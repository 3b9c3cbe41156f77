//! End-to-end virtual-memory scenarios driven entirely through
//! `memory::vm`'s public API against a real boot: process registration,
//! zero-page growth, demand-paged file content, and mmap/munmap teardown.
//!
//! Scenarios that depend on forcing eviction under a small, fixed frame pool
//! are not reproduced here: this kernel's frame pool is whatever physical
//! memory the bootloader hands it, not a configurable small number, so there
//! is no way to exhaust it short of faulting in enough pages to cover all of
//! RAM (and swap only holds `SWAP_SLOT_COUNT` slots, so doing so would panic
//! the kernel rather than exercise eviction cleanly). The clock-hand victim
//! selection itself (pin-skip, accessed-clear-then-evict, budget exhaustion)
//! is instead exercised directly against its own private state in
//! `src/memory/frame_table.rs`'s unit tests.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(self_rust_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]

extern crate alloc;

use bootloader::{entry_point, BootInfo};
use core::panic::PanicInfo;
use self_rust_os::{
    allocator,
    memory::{
        self,
        spt::FileOrigin,
        vm::{self, ProcessId},
        BootInfoFrameAllocator, PAGE_SIZE,
    },
    serial_println,
};
use x86_64::VirtAddr;

entry_point!(main);

fn main(boot_info: &'static BootInfo) -> ! {
    self_rust_os::init();

    let phys_mem_offset = VirtAddr::new(boot_info.physical_memory_offset);
    // SAFETY: the bootloader maps all physical memory at this offset.
    let mut mapper = unsafe { memory::init(phys_mem_offset) };
    // SAFETY: the memory map is filled in by the bootloader.
    let mut frame_allocator = unsafe { BootInfoFrameAllocator::new(&boot_info.memory_map) };
    allocator::init_heap(&mut mapper, &mut frame_allocator).expect("heap initialization failed");

    memory::swap::init(memory::swap::SWAP_SLOT_COUNT);
    vm::register_process(vm::USER_PROCESS);
    vm::install_kernel_state(mapper, frame_allocator);

    test_main();
    self_rust_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    self_rust_os::test_panic_handler(info)
}

/// Scenario: from a quiescent VM, a stack-growth style zero page faults in
/// on first touch and reads back as zero.
#[test_case]
fn test_scenario_zero_page_growth_resolves_on_first_touch() {
    let upage = VirtAddr::new(0x6020_0000);
    vm::mmap_install_zero(vm::USER_PROCESS, upage);

    assert!(
        vm::page_fault_entry(vm::USER_PROCESS, upage),
        "growth page must resolve on first fault",
    );

    // SAFETY: the page was just faulted in for this process.
    let first_byte = unsafe { *(upage.as_u64() as *const u8) };
    assert_eq!(first_byte, 0, "freshly grown page must read back as zero");
    serial_println!("[ok] scenario: zero-page growth");
}

/// Scenario: a demand-paged, read-only code page is installed from embedded
/// binary content and faults in with the exact read/zero split described by
/// its origin.
#[test_case]
fn test_scenario_demand_paged_code_page_matches_origin_exactly() {
    let upage = VirtAddr::new(0x6020_3000);
    static CODE: [u8; 3] = [1, 2, 3];

    vm::mmap_install_file(
        vm::USER_PROCESS,
        upage,
        FileOrigin {
            data: &CODE,
            offset: 0,
            read_bytes: 3,
            zero_bytes: PAGE_SIZE - 3,
            writable: false,
        },
    );

    assert!(vm::page_fault_entry(vm::USER_PROCESS, upage));

    // SAFETY: the page is resident and owned by this process.
    let bytes = unsafe { core::slice::from_raw_parts(upage.as_u64() as *const u8, PAGE_SIZE) };
    assert_eq!(&bytes[..3], &[1, 2, 3]);
    assert_eq!(bytes[3], 0, "byte past read_bytes must be zero");
    serial_println!("[ok] scenario: demand-paged code page");
}

/// Scenario: an `mmap`'d writable region is used, then `munmap`'d; a fault on
/// the same address afterward must not resolve, and the address becomes free
/// for a fresh mapping.
#[test_case]
fn test_scenario_mmap_then_munmap_then_refault_is_clean() {
    let upage = VirtAddr::new(0x6020_6000);
    vm::mmap_install_zero(vm::USER_PROCESS, upage);
    assert!(vm::page_fault_entry(vm::USER_PROCESS, upage));

    // SAFETY: page is resident and writable (anonymous mappings are).
    unsafe {
        *(upage.as_u64() as *mut u8) = 0xAA;
    }

    vm::munmap_current(vm::USER_PROCESS, upage).expect("munmap of the mapped region must succeed");

    assert!(
        !vm::page_fault_entry(vm::USER_PROCESS, upage),
        "a fault on an unmapped address must not resolve",
    );

    vm::mmap_install_zero(vm::USER_PROCESS, upage);
    assert!(
        vm::page_fault_entry(vm::USER_PROCESS, upage),
        "the address must be reusable for a fresh mapping after munmap",
    );
    // SAFETY: freshly faulted, zero-filled page.
    let byte = unsafe { *(upage.as_u64() as *const u8) };
    assert_eq!(byte, 0, "the reused address must start from a clean zero page, not stale content");
}

/// Scenario: pinning a buffer (as `sys_write` does) keeps it resident across
/// a second, unrelated fault-in elsewhere, and unpinning releases it again
/// without side effects.
#[test_case]
fn test_scenario_pin_user_range_protects_buffer_across_unrelated_activity() {
    let pinned_page = VirtAddr::new(0x6020_9000);
    let other_page = VirtAddr::new(0x6020_c000);

    vm::mmap_install_zero(vm::USER_PROCESS, pinned_page);
    vm::mmap_install_zero(vm::USER_PROCESS, other_page);

    vm::pin_user_range(vm::USER_PROCESS, pinned_page, PAGE_SIZE as u64)
        .expect("pinning a freshly installed page must succeed");

    assert!(vm::page_fault_entry(vm::USER_PROCESS, other_page));

    assert!(
        vm::page_fault_entry(vm::USER_PROCESS, pinned_page),
        "pinned page must remain resident and resolvable",
    );

    vm::unpin_user_range(vm::USER_PROCESS, pinned_page, PAGE_SIZE as u64);
}
