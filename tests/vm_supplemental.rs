//! Integration tests for the supplemental page table's public lifecycle:
//! installing file-backed and zero-filled mappings, faulting them in through
//! `memory::vm`, and tearing them down with `munmap`. Internal residency
//! transitions (`Zero`/`FileBacked`/`Resident`/`Swapped`) are covered as
//! white-box unit tests inside `src/memory/spt.rs` itself; this file only
//! exercises what's reachable through the public API against a real mapper.

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
    let pid = ProcessId(0x5ed0);
    vm::register_process(pid);
    vm::install_kernel_state(mapper, frame_allocator);

    test_main();
    self_rust_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    self_rust_os::test_panic_handler(info)
}

const PAGE: u64 = PAGE_SIZE as u64;

/// Read-only file-backed page: faulting it in must copy the embedded bytes
/// and zero-fill the rest, with the mapping actually readable through its
/// virtual address.
#[test_case]
fn test_file_backed_page_loads_embedded_content_through_the_real_mapping() {
    let pid = ProcessId(0x5ed0);
    let upage = VirtAddr::new(0x6010_0000);

    vm::mmap_install_file(
        pid,
        upage,
        FileOrigin {
            data: b"the quick brown fox jumps",
            offset: 4,
            read_bytes: 5,
            zero_bytes: PAGE_SIZE - 5,
            writable: false,
        },
    );

    assert!(
        vm::page_fault_entry(pid, upage),
        "file-backed page must resolve on first fault",
    );

    // SAFETY: the page was just faulted in and mapped read-only; reading it
    // back is sound from this single-address-space kernel.
    let bytes = unsafe { core::slice::from_raw_parts(upage.as_u64() as *const u8, PAGE_SIZE) };
    assert_eq!(&bytes[..5], b"quick", "copied bytes must match the file origin's slice");
    assert!(
        bytes[5..].iter().all(|&b| b == 0),
        "bytes past read_bytes must be zero-filled",
    );
    serial_println!("[ok] file-backed content materialized through the real mapping");
}

/// A page installed with `writable: true` must actually accept a write
/// through its virtual address once faulted in.
#[test_case]
fn test_writable_file_backed_page_accepts_a_write_after_fault() {
    let pid = ProcessId(0x5ed0);
    let upage = VirtAddr::new(0x6010_3000);

    vm::mmap_install_file(
        pid,
        upage,
        FileOrigin {
            data: b"mutable",
            offset: 0,
            read_bytes: 7,
            zero_bytes: PAGE_SIZE - 7,
            writable: true,
        },
    );

    assert!(vm::page_fault_entry(pid, upage));

    // SAFETY: the page was just mapped writable.
    let ptr = upage.as_u64() as *mut u8;
    unsafe {
        *ptr = 0x42;
        assert_eq!(*ptr, 0x42, "write through a writable mapping must be observable");
    }
}

/// An anonymous zero page reads back as all zero immediately after fault.
#[test_case]
fn test_zero_page_reads_back_as_zero_after_fault() {
    let pid = ProcessId(0x5ed0);
    let upage = VirtAddr::new(0x6010_6000);

    vm::mmap_install_zero(pid, upage);
    assert!(vm::page_fault_entry(pid, upage));

    // SAFETY: the page is freshly mapped and owned by this process.
    let bytes = unsafe { core::slice::from_raw_parts(upage.as_u64() as *const u8, PAGE_SIZE) };
    assert!(bytes.iter().all(|&b| b == 0), "zero page must read back as all zero");
}

/// `munmap` frees the mapping; the address can then be re-installed and
/// faulted in again as a fresh page, proving the SPT entry and frame were
/// actually released rather than merely marked invalid.
#[test_case]
fn test_munmap_then_reinstall_round_trips() {
    let pid = ProcessId(0x5ed0);
    let upage = VirtAddr::new(0x6010_9000);

    vm::mmap_install_zero(pid, upage);
    assert!(vm::page_fault_entry(pid, upage));

    vm::munmap_current(pid, upage).expect("munmap of a resident zero page must succeed");

    vm::mmap_install_zero(pid, upage);
    assert!(
        vm::page_fault_entry(pid, upage),
        "a freshly reinstalled mapping at the same address must fault in cleanly",
    );
}
