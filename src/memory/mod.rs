//! Memory management: boot-time paging setup, the physical frame pool, and
//! the virtual-memory subsystem built on top of it (frame table, swap area,
//! supplemental page table).

pub mod frame_table;
pub mod spt;
pub mod swap;
pub mod vm;

use alloc::vec::Vec;

use bootloader::bootinfo::{MemoryMap, MemoryRegionType};
use spin::Mutex;
use x86_64::{
    registers::control::Cr3,
    structures::paging::{
        mapper::{MapToError, Translate, TranslateResult, UnmapError},
        FrameAllocator, FrameDeallocator, Mapper, OffsetPageTable, Page, PageTable,
        PageTableFlags, PhysFrame, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

/// Size in bytes of a single page / physical frame. Fixed at compile time.
pub const PAGE_SIZE: usize = 4096;

/// Physical-memory offset (HHDM base) established at boot by the bootloader's
/// `map_physical_memory` feature. Set once by [`init`], read by every
/// translation from a physical frame to its kernel-accessible address.
static PHYSICAL_MEMORY_OFFSET: Mutex<u64> = Mutex::new(0);

/// A kernel-accessible (HHDM) virtual address of a physical frame: the
/// address the kernel dereferences to read or write frame contents. This is
/// the same role Pintos's `PHYS_BASE`-relative `kpage` plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelAddr(pub u64);

impl KernelAddr {
    /// Returns a raw pointer to the start of this frame's contents.
    #[must_use]
    pub const fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

/// Converts a physical frame to its kernel-accessible address.
#[must_use]
pub fn kernel_addr_of(frame: PhysFrame) -> KernelAddr {
    let offset = *PHYSICAL_MEMORY_OFFSET.lock();
    KernelAddr(offset + frame.start_address().as_u64())
}

/// Converts a kernel-accessible frame address back to a physical frame.
#[must_use]
pub fn phys_frame_of(kaddr: KernelAddr) -> PhysFrame {
    let offset = *PHYSICAL_MEMORY_OFFSET.lock();
    PhysFrame::containing_address(PhysAddr::new(kaddr.0 - offset))
}

/// Initialize a new `OffsetPageTable`.
///
/// # Safety
/// Unsafe because the caller must guarantee that the physical memory is mapped
/// to virtual memory at the passed `physical_memory_offset`.
/// This function must be only called once to avoid aliasing `&mut` references.
#[must_use]
pub unsafe fn init(physical_memory_offset: VirtAddr) -> OffsetPageTable<'static> {
    *PHYSICAL_MEMORY_OFFSET.lock() = physical_memory_offset.as_u64();

    // SAFETY: forwarded from this function's own safety contract.
    let level_4_table = unsafe { active_level_4_table(physical_memory_offset) };
    OffsetPageTable::new(level_4_table, physical_memory_offset)
}

/// Returns a mutable reference to the active level 4 table.
///
/// # Safety
/// Unsafe because the caller must guarantee that the physical memory is mapped
/// to virtual memory at the passed `physical_memory_offset`.
/// This function must be only called once to avoid aliasing `&mut` references.
#[must_use]
unsafe fn active_level_4_table(physical_memory_offset: VirtAddr) -> &'static mut PageTable {
    // Cr3 register holds the physical address of the level 4 page table.
    let (level_4_table_frame, _) = Cr3::read();

    let phys = level_4_table_frame.start_address();
    let virt = physical_memory_offset + phys.as_u64();
    let page_table_ptr: *mut PageTable = virt.as_mut_ptr();

    // SAFETY: forwarded from this function's own safety contract.
    unsafe { &mut *page_table_ptr }
}

/// A frame allocator that returns usable frames from the bootloader's memory
/// map, with a free-list so frames released by the frame table (on eviction
/// reuse or SPT destruction) are actually recycled instead of leaking.
pub struct BootInfoFrameAllocator {
    memory_map: &'static MemoryMap,
    next: usize,
    freed: Vec<PhysFrame>,
}

impl BootInfoFrameAllocator {
    /// Create a `BootInfoFrameAllocator` from the passed memory map.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the passed memory map is valid.
    #[must_use]
    pub const unsafe fn new(memory_map: &'static MemoryMap) -> Self {
        Self {
            memory_map,
            next: 0,
            freed: Vec::new(),
        }
    }

    fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> {
        let regions = self.memory_map.iter();
        let usable_regions = regions.filter(|r| r.region_type == MemoryRegionType::Usable);
        let addr_ranges = usable_regions.map(|r| r.range.start_addr()..r.range.end_addr());
        let frame_addresses = addr_ranges.flat_map(|r| r.step_by(PAGE_SIZE));
        frame_addresses.map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

/// Implement the `FrameAllocator` trait for `BootInfoFrameAllocator`.
///
/// SAFETY:
///
/// Unsafe because the caller must guarantee that the memory map is valid.
unsafe impl FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if let Some(frame) = self.freed.pop() {
            return Some(frame);
        }

        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }
}

// SAFETY: a frame handed back here was previously handed out by
// `allocate_frame` and is no longer mapped anywhere.
unsafe impl FrameDeallocator<Size4KiB> for BootInfoFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        self.freed.push(frame);
    }
}

/// Maps a single user page to a physical frame tracked by the frame table.
pub fn map_page(
    mapper: &mut OffsetPageTable<'static>,
    frame_allocator: &mut BootInfoFrameAllocator,
    upage: VirtAddr,
    kaddr: KernelAddr,
    writable: bool,
) -> Result<(), &'static str> {
    let page: Page<Size4KiB> = Page::containing_address(upage);
    let frame = phys_frame_of(kaddr);

    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if writable {
        flags |= PageTableFlags::WRITABLE;
    }

    // SAFETY: `frame` was allocated for this exact mapping and `page` is the
    // caller's user page, not already mapped by a different frame.
    let result = unsafe { mapper.map_to(page, frame, flags, frame_allocator) };

    match result {
        Ok(flush) => {
            flush.flush();
            Ok(())
        }
        Err(MapToError::PageAlreadyMapped(_)) => {
            // Already present with the right frame (re-fault on a resident page).
            Ok(())
        }
        Err(_) => Err("failed to map page"),
    }
}

/// Removes the hardware mapping for a user page, if present.
pub fn unmap_page(mapper: &mut OffsetPageTable<'static>, upage: VirtAddr) {
    let page: Page<Size4KiB> = Page::containing_address(upage);
    match mapper.unmap(page) {
        Ok((_, flush)) => flush.flush(),
        Err(UnmapError::PageNotMapped) => {}
        Err(_) => panic!("unexpected failure unmapping user page"),
    }
}

fn translated_flags(mapper: &OffsetPageTable<'static>, upage: VirtAddr) -> Option<PageTableFlags> {
    match mapper.translate(upage) {
        TranslateResult::Mapped { flags, .. } => Some(flags),
        TranslateResult::NotMapped | TranslateResult::InvalidFrameAddress(_) => None,
    }
}

/// Returns whether the hardware accessed bit is set for `upage`.
#[must_use]
pub fn is_accessed(mapper: &mut OffsetPageTable<'static>, upage: VirtAddr) -> bool {
    translated_flags(mapper, upage).is_some_and(|flags| flags.contains(PageTableFlags::ACCESSED))
}

/// Clears the hardware accessed bit for `upage`, giving it a second chance.
pub fn clear_accessed(mapper: &mut OffsetPageTable<'static>, upage: VirtAddr) {
    if let Some(flags) = translated_flags(mapper, upage) {
        let page: Page<Size4KiB> = Page::containing_address(upage);
        // SAFETY: only clearing a status bit on an already-valid mapping.
        if let Ok(flush) = unsafe { mapper.update_flags(page, flags & !PageTableFlags::ACCESSED) }
        {
            flush.flush();
        }
    }
}

/// Returns whether the hardware dirty bit is set for `upage`.
#[must_use]
pub fn is_dirty(mapper: &mut OffsetPageTable<'static>, upage: VirtAddr) -> bool {
    translated_flags(mapper, upage).is_some_and(|flags| flags.contains(PageTableFlags::DIRTY))
}
