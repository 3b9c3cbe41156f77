//! Process loading and user mode execution.
//!
//! This module provides the infrastructure to load a flat binary into
//! user-accessible memory pages and switch the CPU to Ring 3 for execution.
//!
//! The user binary is expected to be a position-dependent flat binary linked
//! at [`USER_CODE_START`](super::USER_CODE_START). Rather than eagerly mapping
//! and copying it, `run` registers one supplemental page table entry per page
//! (file-backed for the binary, zero-filled for the stack) and leaves the
//! hardware mapping to the page-fault handler on first access.

use core::arch::naked_asm;
use core::sync::atomic::AtomicU64;

use x86_64::VirtAddr;

use crate::{
    gdt,
    memory::{spt::FileOrigin, vm, vm::ProcessId, PAGE_SIZE},
    println, serial_println, userspace,
};

/// Saved kernel RSP before entering user mode.
///
/// When [`switch_to_user_mode`] executes `iretq`, the original kernel stack is
/// abandoned. This static stores the kernel RSP so that the `sys_exit` syscall
/// handler can restore it and effectively "return" from `switch_to_user_mode`
/// back to [`run`].
pub(crate) static KERNEL_RSP: AtomicU64 = AtomicU64::new(0);

/// Registers the user binary and stack as demand-paged mappings for `pid`,
/// then switches the CPU to Ring 3 execution.
///
/// This function:
/// 1. Installs one supplemental page table entry per page of `binary` at
///    [`USER_CODE_START`](super::USER_CODE_START). Pages within the first
///    `readonly_size` bytes are registered read-only (W^X) once loaded,
///    while pages beyond that boundary are registered writable for
///    `.data`/`.bss`. No physical frame is touched yet.
/// 2. Installs zero-filled entries for a user-mode stack below
///    [`USER_STACK_TOP`](super::USER_STACK_TOP).
/// 3. Performs an `iretq` to transition the CPU from Ring 0 to Ring 3. The
///    first instruction fetch and the first stack access each take a page
///    fault, resolved by [`crate::memory::vm::page_fault_entry`].
///
/// # Arguments
///
/// * `pid` - The process these pages belong to; must already be registered
///   via [`vm::register_process`].
/// * `binary` - The raw bytes of the flat user binary. `'static` because the
///   supplemental page table entries reference it for as long as the page
///   may need to be reloaded from its origin.
/// * `readonly_size` - Number of bytes from the start of the binary that should
///   be registered read-only (`.text` + `.rodata`). Must be page-aligned (multiple
///   of 4096). Pages beyond this offset are registered writable.
///
/// # Errors
///
/// Returns an error string if `readonly_size` is not page-aligned.
///
/// # Safety Considerations
///
/// This function uses `iretq` to enter user mode and never returns to the caller.
/// The caller must ensure that the GDT, TSS, and IDT (including the syscall
/// handler at `int 0x80` and the page-fault handler) are fully initialized
/// before calling this function.
pub fn run(pid: ProcessId, binary: &'static [u8], readonly_size: usize) -> Result<(), &'static str> {
    serial_println!("[kernel] loading user binary ({} bytes)...", binary.len());
    println!("[kernel] loading user binary ({} bytes)...", binary.len());

    map_user_binary(pid, binary, readonly_size)?;
    map_user_stack(pid);

    serial_println!("[kernel] switching to user mode...");
    println!("[kernel] switching to user mode...");

    let user_cs = gdt::user_code_selector();
    let user_ds = gdt::user_data_selector();

    // SAFETY:
    //
    // The binary has been mapped at USER_CODE_START with USER_ACCESSIBLE pages.
    // The user stack has been mapped below USER_STACK_TOP.
    // The GDT contains valid Ring 3 code and data segments.
    // The TSS has a valid RSP0 for kernel re-entry on interrupts.
    //
    // This call does not return until the user process invokes `sys_exit`,
    // at which point the syscall handler restores the kernel RSP saved by
    // `switch_to_user_mode` and execution resumes here.
    unsafe {
        switch_to_user_mode(
            userspace::USER_CODE_START,
            userspace::USER_STACK_TOP,
            u64::from(user_cs.0),
            u64::from(user_ds.0),
        );
    }

    serial_println!("[kernel] user process exited, returning to kernel_main");
    println!("[kernel] user process exited, returning to kernel_main");

    Ok(())
}

/// Registers one supplemental page table entry per page of `binary`,
/// starting at [`USER_CODE_START`](super::USER_CODE_START). Pages within the
/// first `readonly_size` bytes are registered read-only (`.text`/`.rodata`);
/// pages beyond that boundary are registered writable (`.data`/`.bss`). No
/// frame is allocated and no hardware mapping is installed here — both
/// happen lazily the first time each page faults in.
///
/// # Arguments
///
/// * `pid` - The owning process, already registered with an `Spt`.
/// * `binary` - The raw bytes of the flat user binary.
/// * `readonly_size` - Page-aligned byte count of the read-only region.
///
/// # Errors
///
/// Returns an error if `readonly_size` is not page-aligned.
fn map_user_binary(pid: ProcessId, binary: &'static [u8], readonly_size: usize) -> Result<(), &'static str> {
    if readonly_size % PAGE_SIZE != 0 {
        return Err("readonly_size must be page-aligned");
    }

    let start_addr = VirtAddr::new(userspace::USER_CODE_START);
    let num_pages = (binary.len() as u64).div_ceil(PAGE_SIZE as u64);
    let readonly_pages = (readonly_size as u64) / PAGE_SIZE as u64;

    for i in 0..num_pages {
        let upage = start_addr + i * PAGE_SIZE as u64;
        let page_start = (i * PAGE_SIZE as u64) as usize;
        let page_end = core::cmp::min(page_start + PAGE_SIZE, binary.len());
        let read_bytes = page_end - page_start;

        vm::mmap_install_file(
            pid,
            upage,
            FileOrigin {
                data: binary,
                offset: page_start,
                read_bytes,
                zero_bytes: PAGE_SIZE - read_bytes,
                writable: i >= readonly_pages,
            },
        );
    }

    serial_println!(
        "[kernel] registered {} demand-paged pages for user binary at {:#x} ({} read-only, {} writable)",
        num_pages,
        userspace::USER_CODE_START,
        core::cmp::min(readonly_pages, num_pages),
        num_pages.saturating_sub(readonly_pages),
    );
    println!(
        "[kernel] registered {} demand-paged pages for user binary at {:#x} ({} read-only, {} writable)",
        num_pages,
        userspace::USER_CODE_START,
        core::cmp::min(readonly_pages, num_pages),
        num_pages.saturating_sub(readonly_pages),
    );

    Ok(())
}

/// Registers zero-filled supplemental page table entries spanning
/// [`USER_STACK_BOTTOM`](super::USER_STACK_BOTTOM) to
/// [`USER_STACK_TOP`](super::USER_STACK_TOP). Pages are faulted in lazily,
/// as the stack grows downward.
fn map_user_stack(pid: ProcessId) {
    let num_pages = userspace::USER_STACK_SIZE / PAGE_SIZE as u64;
    let stack_start = VirtAddr::new(userspace::USER_STACK_BOTTOM);

    for i in 0..num_pages {
        vm::mmap_install_zero(pid, stack_start + i * PAGE_SIZE as u64);
    }

    serial_println!(
        "[kernel] registered {} demand-paged stack pages at {:#x}-{:#x}",
        num_pages,
        userspace::USER_STACK_BOTTOM,
        userspace::USER_STACK_TOP,
    );
    println!(
        "[kernel] registered {} demand-paged stack pages at {:#x}-{:#x}",
        num_pages,
        userspace::USER_STACK_BOTTOM,
        userspace::USER_STACK_TOP,
    );
}

/// Unwinds the current user process and returns control to [`run`]'s caller,
/// without going back through user mode. This is the same exit path
/// `sys_exit` takes; the page-fault handler calls it to terminate a process
/// that faulted on an address [`crate::memory::vm::page_fault_entry`] could
/// not resolve, instead of halting the whole kernel.
///
/// # Safety
///
/// May only be called while a user process is currently executing, i.e.
/// [`KERNEL_RSP`] was set by a [`switch_to_user_mode`] call that has not yet
/// returned. Calling this with no process active corrupts the stack.
#[naked]
pub(crate) unsafe extern "C" fn terminate_current_process() -> ! {
    // SAFETY: mirrors the `sys_exit` exit path in `syscall::syscall_entry`
    // exactly, sharing the same `KERNEL_RSP` save slot; the callee-saved
    // registers popped here are the ones `switch_to_user_mode` pushed and
    // never touches again.
    unsafe {
        naked_asm!(
            "mov rsp, [{kernel_rsp}]",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbp",
            "pop rbx",
            "xor ax, ax",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "ret",
            kernel_rsp = sym KERNEL_RSP,
        );
    }
}

/// Performs the actual transition from Ring 0 to Ring 3 via `iretq`.
///
/// Before executing `iretq`, this function saves all callee-saved registers
/// and the kernel RSP into [`KERNEL_RSP`]. When the user process calls
/// `sys_exit`, the syscall handler restores the saved RSP, pops the
/// callee-saved registers, and executes `ret`, causing this function to
/// return normally to its caller.
///
/// # Arguments
///
/// Uses the System V AMD64 calling convention (naked function):
/// * `rdi` - The virtual address of the user binary entry point.
/// * `rsi` - The top of the user-mode stack (initial RSP in Ring 3).
/// * `rdx` - The user code segment selector (with RPL=3).
/// * `rcx` - The user data segment selector (with RPL=3).
///
/// # Safety
///
/// The caller must guarantee that:
/// - `entry_point` points to valid, executable, user-accessible code.
/// - `user_stack` points to a valid, writable, user-accessible stack region.
/// - `user_cs` and `user_ds` are valid Ring 3 segment selectors in the GDT.
/// - The TSS `RSP0` is set to a valid kernel stack for interrupt re-entry.
///
/// This function blocks until the user process calls `sys_exit`.
#[naked]
unsafe extern "C" fn switch_to_user_mode(
    _entry_point: u64,
    _user_stack: u64,
    _user_cs: u64,
    _user_ds: u64,
) {
    // SAFETY:
    //
    // This naked function manually manages the entire stack layout.
    // On entry (System V AMD64 ABI):
    //   rdi = entry_point
    //   rsi = user_stack
    //   rdx = user_cs
    //   rcx = user_ds
    //   [rsp] = return address to caller (process::run)
    //
    // We save all callee-saved registers so the caller's state is preserved
    // when sys_exit restores the kernel RSP and executes `ret`.
    unsafe {
        core::arch::naked_asm!(
            // Save callee-saved registers (System V ABI).
            "push rbx",
            "push rbp",
            "push r12",
            "push r13",
            "push r14",
            "push r15",

            // Save the kernel RSP so sys_exit can restore it later.
            // After this point, KERNEL_RSP points to the saved r15 on
            // the original kernel stack.
            "mov [{kernel_rsp}], rsp",

            // Load user data segment (rcx) into all data segment registers.
            "mov ax, cx",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",

            // Build an iretq frame on the stack:
            //   push SS      (user data segment)
            //   push RSP     (user stack pointer)
            //   push RFLAGS  (with IF set to enable interrupts)
            //   push CS      (user code segment)
            //   push RIP     (user entry point)
            "push rax",       // SS = user data selector
            "push rsi",       // RSP = user stack top
            "pushfq",
            "pop r11",
            "or r11, 0x200",  // set IF (Interrupt Flag) so interrupts work in user mode
            "push r11",       // RFLAGS
            "push rdx",       // CS = user code selector
            "push rdi",       // RIP = entry point

            "iretq",

            // Execution never reaches here via iretq.
            // When sys_exit fires, the syscall handler restores RSP from
            // KERNEL_RSP, pops r15..rbx, restores kernel segments, and
            // executes `ret` â€” which returns to the caller of this function.

            kernel_rsp = sym KERNEL_RSP,
        );
    }
}
