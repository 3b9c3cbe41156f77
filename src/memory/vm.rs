//! Process registry and the externally-visible virtual-memory entry points:
//! the page-fault handler, pin/unpin helpers for syscalls that touch user
//! buffers, and `mmap`/`munmap`.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;
use x86_64::{structures::paging::OffsetPageTable, VirtAddr};

use super::spt::{FileBackend, FileOrigin, Spt};
use super::{swap, BootInfoFrameAllocator, PAGE_SIZE};

/// Identifies a process's address space for frame-table and SPT lookups.
/// Frame entries store `(ProcessId, VirtAddr)` rather than a pointer back
/// into a process's `Spt`, resolved through [`PROCESS_REGISTRY`] — this
/// kernel only ever registers one process (no fork), but the type stays
/// generic rather than assuming a singleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

/// The kernel's single user process, loaded by `userspace::process::run`.
pub const USER_PROCESS: ProcessId = ProcessId(1);

struct ProcessEntry {
    spt: Spt,
}

static PROCESS_REGISTRY: Mutex<BTreeMap<u64, Arc<ProcessEntry>>> = Mutex::new(BTreeMap::new());

/// Mapper and frame allocator live behind one lock so the page-fault
/// handler (which has no caller-supplied state) can reach them, the same
/// way the teacher reaches `PICS`/`WRITER`/`IDT` from interrupt context.
pub struct KernelState {
    /// The kernel's single active page table mapper.
    pub mapper: OffsetPageTable<'static>,
    /// The kernel's single physical frame allocator.
    pub frame_allocator: BootInfoFrameAllocator,
}

static KERNEL_STATE: Mutex<Option<KernelState>> = Mutex::new(None);

/// Installs the mapper and frame allocator obtained during boot so the VM
/// core can reach them from interrupt context. Must be called once.
pub fn install_kernel_state(mapper: OffsetPageTable<'static>, frame_allocator: BootInfoFrameAllocator) {
    *KERNEL_STATE.lock() = Some(KernelState {
        mapper,
        frame_allocator,
    });
}

/// Registers a fresh, empty supplemental page table for `pid`.
pub fn register_process(pid: ProcessId) {
    PROCESS_REGISTRY
        .lock()
        .insert(pid.0, Arc::new(ProcessEntry { spt: Spt::new() }));
}

/// Removes `pid` from the registry after tearing down its address space.
/// `backend` receives any dirty page's write-back; this kernel has no
/// writable filesystem, so real callers pass `None`.
pub fn unregister_process(
    pid: ProcessId,
    mapper: &mut OffsetPageTable<'static>,
    frame_allocator: &mut BootInfoFrameAllocator,
    backend: Option<&mut dyn FileBackend>,
) {
    if let Some(entry) = PROCESS_REGISTRY.lock().remove(&pid.0) {
        entry.spt.destroy(mapper, frame_allocator, backend);
    }
}

fn process(pid: ProcessId) -> Arc<ProcessEntry> {
    PROCESS_REGISTRY
        .lock()
        .get(&pid.0)
        .expect("page fault or syscall for an unregistered process")
        .clone()
}

fn page_aligned(addr: VirtAddr) -> VirtAddr {
    VirtAddr::new(addr.as_u64() & !0xfff)
}

/// Installs a file-backed (demand-paged) mapping spanning one page.
pub fn mmap_install_file(pid: ProcessId, upage: VirtAddr, origin: FileOrigin) {
    process(pid).spt.install_file(page_aligned(upage), origin);
}

/// Installs an anonymous zero-filled mapping spanning one page. Used for
/// `SYS_MMAP` (no user-reachable filesystem exists to back a real file
/// mapping) and for stack growth.
pub fn mmap_install_zero(pid: ProcessId, upage: VirtAddr) {
    process(pid).spt.install_zero(page_aligned(upage));
}

/// Removes a mapping installed by `mmap_install_file`/`mmap_install_zero`.
/// `backend` receives any dirty page's write-back; this kernel has no
/// writable filesystem, so real callers pass `None`.
pub fn munmap(
    pid: ProcessId,
    upage: VirtAddr,
    mapper: &mut OffsetPageTable<'static>,
    frame_allocator: &mut BootInfoFrameAllocator,
    backend: Option<&mut dyn FileBackend>,
) {
    process(pid)
        .spt
        .unmap(page_aligned(upage), mapper, frame_allocator, backend);
}

/// Convenience form of [`munmap`] for callers (like the `sys_munmap` syscall
/// handler) that have no mapper/frame allocator of their own and must reach
/// the ones installed by [`install_kernel_state`].
///
/// # Errors
/// Returns `Err` if the kernel state has not been installed yet.
pub fn munmap_current(pid: ProcessId, upage: VirtAddr) -> Result<(), &'static str> {
    let mut state = KERNEL_STATE.lock();
    let Some(state) = state.as_mut() else {
        return Err("kernel state not initialized");
    };
    munmap(pid, upage, &mut state.mapper, &mut state.frame_allocator, None);
    Ok(())
}

/// Resolves a page fault at `fault_addr` for `pid`. Returns `true` if the
/// fault was resolved (the faulting instruction can be retried), `false`
/// if it should be treated as a genuine segmentation fault.
pub fn page_fault_entry(pid: ProcessId, fault_addr: VirtAddr) -> bool {
    let proc = process(pid);
    let upage = page_aligned(fault_addr);

    let mut state = KERNEL_STATE.lock();
    let Some(state) = state.as_mut() else {
        return false;
    };
    let KernelState {
        mapper,
        frame_allocator,
    } = state;

    load_page(&proc.spt, upage, pid, mapper, frame_allocator)
}

fn load_page(
    spt: &Spt,
    upage: VirtAddr,
    pid: ProcessId,
    mapper: &mut OffsetPageTable<'static>,
    frame_allocator: &mut BootInfoFrameAllocator,
) -> bool {
    // SAFETY: `mapper` is only reborrowed, never aliased, across the three
    // closures below; each call happens sequentially, never concurrently.
    let mapper_ptr: *mut OffsetPageTable<'static> = mapper;

    let evict = |owner: ProcessId, victim_upage: VirtAddr, kaddr: super::KernelAddr| {
        let victim = process(owner);
        // SAFETY: see note above; this closure and the two below are never
        // invoked while another holds the reborrow.
        let mapper = unsafe { &mut *mapper_ptr };
        let hw_dirty = super::is_dirty(mapper, victim_upage)
            || super::is_dirty(mapper, VirtAddr::new(kaddr.0));
        victim.spt.dirty_or(victim_upage, hw_dirty);

        // SAFETY: kaddr is a currently-resident frame about to be unmapped;
        // reading it before unmapping is sound.
        let page = unsafe { core::slice::from_raw_parts(kaddr.as_mut_ptr(), PAGE_SIZE) };
        let slot = swap::allocate_and_write(page)?;
        victim.spt.mark_swapped(victim_upage, slot);
        super::unmap_page(mapper, victim_upage);
        Ok(())
    };
    let is_accessed = |_owner: ProcessId, upage: VirtAddr| {
        // SAFETY: see note above.
        let mapper = unsafe { &mut *mapper_ptr };
        super::is_accessed(mapper, upage)
    };
    let clear_accessed = |_owner: ProcessId, upage: VirtAddr| {
        // SAFETY: see note above.
        let mapper = unsafe { &mut *mapper_ptr };
        super::clear_accessed(mapper, upage);
    };

    spt.load(
        upage,
        pid,
        mapper,
        frame_allocator,
        evict,
        is_accessed,
        clear_accessed,
    )
}

/// Faults in (if absent) and pins every page spanning `[addr, addr+len)` so
/// kernel code can safely dereference a user buffer during a syscall.
///
/// # Errors
/// Returns `Err` if any page in the range cannot be faulted in.
pub fn pin_user_range(pid: ProcessId, addr: VirtAddr, len: u64) -> Result<(), &'static str> {
    let proc = process(pid);
    let start = page_aligned(addr);
    let end = page_aligned(VirtAddr::new(addr.as_u64() + len.saturating_sub(1)));

    let mut page = start;
    loop {
        if proc.spt.lookup(page).is_some() {
            let mut state = KERNEL_STATE.lock();
            let Some(state) = state.as_mut() else {
                return Err("kernel state not initialized");
            };
            let KernelState {
                mapper,
                frame_allocator,
            } = state;
            if !load_page(&proc.spt, page, pid, mapper, frame_allocator) {
                return Err("failed to fault in page for pinning");
            }
        } else {
            return Err("pin target has no supplemental page table entry");
        }
        proc.spt.pin(page);

        if page == end {
            break;
        }
        page = VirtAddr::new(page.as_u64() + PAGE_SIZE as u64);
    }

    Ok(())
}

/// Unpins every page spanning `[addr, addr+len)`, the counterpart to
/// [`pin_user_range`].
pub fn unpin_user_range(pid: ProcessId, addr: VirtAddr, len: u64) {
    let proc = process(pid);
    let start = page_aligned(addr);
    let end = page_aligned(VirtAddr::new(addr.as_u64() + len.saturating_sub(1)));

    let mut page = start;
    loop {
        proc.spt.unpin(page);
        if page == end {
            break;
        }
        page = VirtAddr::new(page.as_u64() + PAGE_SIZE as u64);
    }
}
