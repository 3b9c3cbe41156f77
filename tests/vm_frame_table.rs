//! Integration tests for the pin/unpin bracketing that sits between the
//! syscall layer and the frame table's clock-hand eviction policy. The
//! clock algorithm itself (pinned-skip, accessed-clear-then-evict) is
//! exercised directly against its private state in
//! `src/memory/frame_table.rs`'s own unit tests, since a real boot has far
//! more physical memory than the small pools used to reason about eviction;
//! these tests instead cover the public, multi-page `pin_user_range`/
//! `unpin_user_range` contract used by `sys_write`.

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
    memory::{self, vm, BootInfoFrameAllocator, PAGE_SIZE},
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

const PAGE: u64 = PAGE_SIZE as u64;

#[test_case]
fn test_pin_user_range_spans_multiple_pages() {
    let base = VirtAddr::new(0x6000_0000);
    for i in 0..3 {
        vm::mmap_install_zero(vm::USER_PROCESS, base + i * PAGE);
    }

    vm::pin_user_range(vm::USER_PROCESS, base, 3 * PAGE - 1)
        .expect("pinning three freshly installed pages must succeed");

    for i in 0..3 {
        assert!(
            vm::page_fault_entry(vm::USER_PROCESS, base + i * PAGE),
            "every page in the pinned range must already be resident",
        );
    }

    vm::unpin_user_range(vm::USER_PROCESS, base, 3 * PAGE - 1);
    serial_println!("[ok] pin_user_range/unpin_user_range span three pages");
}

#[test_case]
fn test_pin_user_range_fails_fast_on_a_page_with_no_spt_entry() {
    let base = VirtAddr::new(0x6000_3000);
    vm::mmap_install_zero(vm::USER_PROCESS, base);
    // Deliberately leave `base + PAGE` unregistered.

    let result = vm::pin_user_range(vm::USER_PROCESS, base, 2 * PAGE);
    assert!(
        result.is_err(),
        "pinning a range that includes an unregistered page must fail",
    );
}

#[test_case]
fn test_unpin_user_range_is_idempotent() {
    let base = VirtAddr::new(0x6000_6000);
    vm::mmap_install_zero(vm::USER_PROCESS, base);
    assert!(vm::page_fault_entry(vm::USER_PROCESS, base));

    vm::unpin_user_range(vm::USER_PROCESS, base, PAGE);
    vm::unpin_user_range(vm::USER_PROCESS, base, PAGE);
}

#[test_case]
fn test_munmap_makes_a_later_fault_unresolved() {
    let upage = VirtAddr::new(0x6000_9000);
    vm::mmap_install_zero(vm::USER_PROCESS, upage);
    assert!(
        vm::page_fault_entry(vm::USER_PROCESS, upage),
        "zero page must resolve on first fault",
    );

    vm::munmap_current(vm::USER_PROCESS, upage).expect("munmap of a resident page must succeed");

    assert!(
        !vm::page_fault_entry(vm::USER_PROCESS, upage),
        "a fault on an unmapped page must not resolve",
    );
}
