//! Main for little self made rust OS.

#![feature(custom_test_frameworks)]
#![test_runner(self_rust_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![no_std]
#![no_main]

use bootloader::{entry_point, BootInfo};
use core::panic::PanicInfo;
use self_rust_os::{
    allocator,
    memory::{self, vm, BootInfoFrameAllocator},
    println,
};
use x86_64::VirtAddr;

entry_point!(kernel_main);

////////////////////////
//     Entry point    //
////////////////////////

/// Brings up the hardware (GDT/IDT/PICs), the paging/heap infrastructure, and
/// the virtual-memory core, registers the kernel's single user process, then
/// idles. Loading and switching to an actual Ring 3 binary is exercised
/// separately in the `userspace` integration test, once a real flat binary is
/// available to embed.
fn kernel_main(boot_info: &'static BootInfo) -> ! {
    self_rust_os::init();

    let phys_mem_offset = VirtAddr::new(boot_info.physical_memory_offset);

    // SAFETY: the bootloader maps all physical memory starting at
    // `phys_mem_offset`, as guaranteed by the `map_physical_memory` feature.
    let mut mapper = unsafe { memory::init(phys_mem_offset) };

    // SAFETY: `boot_info.memory_map` was filled in by the bootloader and is
    // valid for the lifetime of the kernel.
    let mut frame_allocator = unsafe { BootInfoFrameAllocator::new(&boot_info.memory_map) };

    allocator::init_heap(&mut mapper, &mut frame_allocator).expect("heap initialization failed");

    memory::swap::init(memory::swap::SWAP_SLOT_COUNT);
    vm::register_process(vm::USER_PROCESS);
    vm::install_kernel_state(mapper, frame_allocator);

    #[cfg(test)]
    test_main();

    self_rust_os::hlt_loop();
}

////////////////////////
//    Panic handler   //
////////////////////////

/// This function is called on panic.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("{}", info);
    self_rust_os::hlt_loop();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    self_rust_os::test_panic_handler(info)
}

/// Custom test try.
/// # Panics
/// May panic if the test fail
#[expect(clippy::assertions_on_constants)]
#[test_case]
fn trivial_assertion() {
    assert!(true, "Make this test pass.");
}
