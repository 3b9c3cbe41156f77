//! Supplemental page table: per-process metadata for every user page,
//! independent of whether it currently occupies a physical frame. Grounded
//! on `struct page_entry` and the `supplemental_*`/`vm_page_*` operations in
//! `vm/page.h` from the original Pintos virtual memory implementation.

use alloc::collections::BTreeMap;

use spin::Mutex;
use x86_64::{structures::paging::OffsetPageTable, VirtAddr};

use super::swap::SwapSlot;
use super::vm::ProcessId;
use super::{frame_table, swap, BootInfoFrameAllocator, KernelAddr, PAGE_SIZE};

/// A writable destination a dirty page is written back to on unmap, mirroring
/// the `file`/`offset` pair threaded through the original's
/// `supplemental_page_unmap`/`handle_on_frame`/`handle_on_swap`. This kernel
/// has no writable filesystem (an explicit non-goal), so no real caller
/// currently supplies one; the trait exists so the write-back contract
/// itself — not just the embedded-binary read path — is implemented and
/// testable against a fake backend.
pub trait FileBackend {
    /// Writes `bytes` (always `PAGE_SIZE` long) at `offset`. Returns whether
    /// the full write succeeded; a short write is a data-loss condition the
    /// caller must treat as fatal (spec's "short file write on unmap" case).
    fn write_at(&mut self, offset: usize, bytes: &[u8]) -> bool;
}

/// Where a page's initial content comes from, kept outside the residency
/// tag because it must survive `FileBacked -> Resident -> Swapped ->
/// Resident` transitions (needed to reload from the right source and to
/// know whether the page may be written to).
#[derive(Debug, Clone, Copy)]
pub struct FileOrigin {
    /// The embedded binary bytes this page is sourced from. There is no
    /// writable filesystem in this kernel, so this is always read-only data.
    pub data: &'static [u8],
    /// Byte offset into `data` where this page's content starts.
    pub offset: usize,
    /// Bytes to copy from `data` starting at `offset`.
    pub read_bytes: usize,
    /// Bytes to zero-fill after the copied content.
    pub zero_bytes: usize,
    /// Whether the mapped page should be writable.
    pub writable: bool,
}

#[derive(Debug, Clone, Copy)]
enum Residency {
    Zero,
    FileBacked,
    Resident(KernelAddr),
    Swapped(SwapSlot),
}

/// Public view of a page's residency, for diagnostics and tests. Mirrors the
/// `enum page_status` values from the original (`ALL_ZERO`, `ON_FRAME`,
/// `ON_SWAP`, `FROM_FILESYS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeStatus {
    /// Not yet backed by any content; will be zero-filled on first access.
    Zero,
    /// Backed by embedded binary data, not yet loaded.
    FileBacked,
    /// Currently occupies a physical frame.
    Resident,
    /// Currently written out to the swap area.
    Swapped,
}

struct Spe {
    residency: Residency,
    origin: Option<FileOrigin>,
    dirty: bool,
    pinned: bool,
}

/// A process's supplemental page table. Carries its own lock (spec.md's
/// sanctioned stricter alternative to the original's unsynchronized
/// single-word writes); lock order is always frame-table lock first, then
/// an `Spt`'s lock, never the reverse.
pub struct Spt {
    entries: Mutex<BTreeMap<u64, Spe>>,
}

impl Spt {
    /// Creates an empty supplemental page table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registers `upage` as backed by embedded binary content, not yet
    /// loaded into a frame.
    ///
    /// # Panics
    /// Panics if `upage` already has an entry, or if `origin`'s
    /// `read_bytes + zero_bytes` does not equal the page size.
    pub fn install_file(&self, upage: VirtAddr, origin: FileOrigin) {
        assert_eq!(
            origin.read_bytes + origin.zero_bytes,
            PAGE_SIZE,
            "file-backed page must cover exactly one page",
        );
        let mut table = self.entries.lock();
        assert!(
            !table.contains_key(&upage.as_u64()),
            "duplicate SPT install for an already-mapped page",
        );
        table.insert(
            upage.as_u64(),
            Spe {
                residency: Residency::FileBacked,
                origin: Some(origin),
                dirty: false,
                pinned: false,
            },
        );
    }

    /// Registers `upage` as a page that should be zero-filled on first
    /// access (anonymous memory: stack growth, `mmap` with no backing data).
    ///
    /// # Panics
    /// Panics if `upage` already has an entry.
    pub fn install_zero(&self, upage: VirtAddr) {
        let mut table = self.entries.lock();
        assert!(
            !table.contains_key(&upage.as_u64()),
            "duplicate SPT install for an already-mapped page",
        );
        table.insert(
            upage.as_u64(),
            Spe {
                residency: Residency::Zero,
                origin: None,
                dirty: false,
                pinned: false,
            },
        );
    }

    /// Registers `upage` as already resident at `kaddr`, for pages that are
    /// installed directly rather than discovered through a page fault.
    ///
    /// # Panics
    /// Panics if `upage` already has an entry.
    pub fn install_resident(&self, upage: VirtAddr, kaddr: KernelAddr, origin: Option<FileOrigin>) {
        let mut table = self.entries.lock();
        assert!(
            !table.contains_key(&upage.as_u64()),
            "duplicate SPT install for an already-mapped page",
        );
        table.insert(
            upage.as_u64(),
            Spe {
                residency: Residency::Resident(kaddr),
                origin,
                dirty: false,
                pinned: false,
            },
        );
    }

    /// Transitions `upage` from resident to swapped-out at `slot`.
    ///
    /// # Panics
    /// Panics if `upage` has no entry.
    pub fn mark_swapped(&self, upage: VirtAddr, slot: SwapSlot) {
        let mut table = self.entries.lock();
        let spe = table
            .get_mut(&upage.as_u64())
            .expect("mark_swapped on a page with no SPT entry");
        spe.residency = Residency::Swapped(slot);
    }

    /// ORs `bit` into the page's sticky dirty flag, accumulating hardware
    /// dirty bits across eviction cycles so a page dirtied once is never
    /// mistaken for clean later.
    pub fn dirty_or(&self, upage: VirtAddr, bit: bool) {
        if let Some(spe) = self.entries.lock().get_mut(&upage.as_u64()) {
            spe.dirty |= bit;
        }
    }

    /// Returns whether `upage` has an SPT entry at all.
    #[must_use]
    pub fn exists(&self, upage: VirtAddr) -> bool {
        self.entries.lock().contains_key(&upage.as_u64())
    }

    /// Returns the current residency status of `upage`, if tracked.
    #[must_use]
    pub fn lookup(&self, upage: VirtAddr) -> Option<SpeStatus> {
        self.entries.lock().get(&upage.as_u64()).map(|spe| match spe.residency {
            Residency::Zero => SpeStatus::Zero,
            Residency::FileBacked => SpeStatus::FileBacked,
            Residency::Resident(_) => SpeStatus::Resident,
            Residency::Swapped(_) => SpeStatus::Swapped,
        })
    }

    /// Resolves a page fault at `upage`: allocates a frame (evicting a
    /// victim if the pool is full), materializes the page's content, installs
    /// the hardware mapping, and marks the page resident. Returns `false` if
    /// there is no SPT entry for `upage` (a genuine segfault) or if the
    /// operation could not complete (e.g. swap exhausted).
    #[expect(clippy::too_many_arguments, reason = "mirrors the explicit parameter threading used throughout this kernel for mapper/frame_allocator")]
    pub fn load(
        &self,
        upage: VirtAddr,
        owner: ProcessId,
        mapper: &mut OffsetPageTable<'static>,
        frame_allocator: &mut BootInfoFrameAllocator,
        evict: impl FnMut(ProcessId, VirtAddr, KernelAddr) -> Result<(), &'static str>,
        is_accessed: impl FnMut(ProcessId, VirtAddr) -> bool,
        clear_accessed: impl FnMut(ProcessId, VirtAddr),
    ) -> bool {
        let already_resident = {
            let table = self.entries.lock();
            match table.get(&upage.as_u64()) {
                None => return false,
                Some(spe) => matches!(spe.residency, Residency::Resident(_)),
            }
        };

        if already_resident {
            // Spurious fault: the page is already mapped.
            return true;
        }

        let kaddr = match frame_table::allocate(
            owner,
            upage,
            frame_allocator,
            evict,
            is_accessed,
            clear_accessed,
        ) {
            Ok(kaddr) => kaddr,
            Err(_) => return false,
        };

        let (writable, load_ok) = {
            let mut table = self.entries.lock();
            let spe = table
                .get_mut(&upage.as_u64())
                .expect("entry checked present above");

            let load_ok = match spe.residency {
                Residency::Zero => {
                    // SAFETY: kaddr is a freshly allocated frame, exclusively
                    // owned until the mapping below is installed.
                    unsafe {
                        core::ptr::write_bytes(kaddr.as_mut_ptr(), 0, PAGE_SIZE);
                    }
                    true
                }
                Residency::FileBacked => {
                    let origin = spe.origin.expect("file-backed page without origin");
                    load_from_origin(kaddr, &origin);
                    true
                }
                Residency::Swapped(slot) => {
                    // SAFETY: kaddr owns PAGE_SIZE freshly allocated bytes.
                    let page =
                        unsafe { core::slice::from_raw_parts_mut(kaddr.as_mut_ptr(), PAGE_SIZE) };
                    swap::read_and_free(slot, page).is_ok()
                }
                Residency::Resident(_) => unreachable!("checked above"),
            };

            let writable = spe.origin.map_or(true, |o| o.writable);
            if load_ok {
                spe.residency = Residency::Resident(kaddr);
            }
            (writable, load_ok)
        };

        if !load_ok {
            return false;
        }

        if super::map_page(mapper, frame_allocator, upage, kaddr, writable).is_err() {
            return false;
        }

        // Unpin only after the mapping install completes.
        frame_table::set_pinned(kaddr, false);
        true
    }

    /// Unmaps `upage`: removes the hardware mapping if resident, releases
    /// the frame or swap slot, and drops the SPT entry. If the page is
    /// dirty (sticky bit, or the hardware dirty bit on either the user
    /// mapping or, for a resident page, its kernel alias) and `backend` is
    /// supplied, its content is written back before the frame/slot is
    /// reclaimed, per the original's `handle_on_frame`/`handle_on_swap`.
    pub fn unmap(
        &self,
        upage: VirtAddr,
        mapper: &mut OffsetPageTable<'static>,
        frame_allocator: &mut BootInfoFrameAllocator,
        mut backend: Option<&mut dyn FileBackend>,
    ) {
        let Some(spe) = self.entries.lock().remove(&upage.as_u64()) else {
            return;
        };

        match spe.residency {
            Residency::Resident(kaddr) => {
                let dirty = spe.dirty
                    || super::is_dirty(mapper, upage)
                    || super::is_dirty(mapper, VirtAddr::new(kaddr.0));
                if dirty {
                    // SAFETY: kaddr is still resident and exclusively owned
                    // until release below unmaps and frees it.
                    let page = unsafe { core::slice::from_raw_parts(kaddr.as_mut_ptr(), PAGE_SIZE) };
                    write_back(&mut backend, &spe.origin, page);
                }
                super::unmap_page(mapper, upage);
                frame_table::release(kaddr, frame_allocator);
            }
            Residency::Swapped(slot) => {
                let dirty = spe.dirty || super::is_dirty(mapper, upage);
                if dirty {
                    let mut page = [0_u8; PAGE_SIZE];
                    swap::read_and_free(slot, &mut page).expect("swapped slot must be valid");
                    write_back(&mut backend, &spe.origin, &page);
                } else {
                    swap::free(slot);
                }
            }
            Residency::Zero | Residency::FileBacked => {}
        }
    }

    /// Tears down every entry in this table, used when a process exits.
    pub fn destroy(
        &self,
        mapper: &mut OffsetPageTable<'static>,
        frame_allocator: &mut BootInfoFrameAllocator,
        mut backend: Option<&mut dyn FileBackend>,
    ) {
        let pages: alloc::vec::Vec<u64> = self.entries.lock().keys().copied().collect();
        for upage in pages {
            self.unmap(VirtAddr::new(upage), mapper, frame_allocator, backend.as_deref_mut());
        }
    }

    /// Pins `upage` if resident, preventing it from being selected as an
    /// eviction victim. Non-resident pages must be faulted in first; this
    /// is the caller's responsibility (see `memory::vm::pin_user_range`).
    pub fn pin(&self, upage: VirtAddr) {
        let mut table = self.entries.lock();
        if let Some(spe) = table.get_mut(&upage.as_u64()) {
            spe.pinned = true;
            if let Residency::Resident(kaddr) = spe.residency {
                frame_table::set_pinned(kaddr, true);
            }
        }
    }

    /// Unpins `upage`, allowing it to be evicted again.
    pub fn unpin(&self, upage: VirtAddr) {
        let mut table = self.entries.lock();
        if let Some(spe) = table.get_mut(&upage.as_u64()) {
            spe.pinned = false;
            if let Residency::Resident(kaddr) = spe.residency {
                frame_table::set_pinned(kaddr, false);
            }
        }
    }
}

impl Default for Spt {
    fn default() -> Self {
        Self::new()
    }
}

fn write_back(backend: &mut Option<&mut dyn FileBackend>, origin: &Option<FileOrigin>, page: &[u8]) {
    if let (Some(backend), Some(origin)) = (backend, origin) {
        assert!(
            backend.write_at(origin.offset, page),
            "short file write on unmap, data would be lost",
        );
    }
}

fn load_from_origin(kaddr: KernelAddr, origin: &FileOrigin) {
    // SAFETY: kaddr owns PAGE_SIZE freshly allocated bytes, exclusively,
    // until the caller installs the hardware mapping.
    let dest = unsafe { core::slice::from_raw_parts_mut(kaddr.as_mut_ptr(), PAGE_SIZE) };
    let src = &origin.data[origin.offset..origin.offset + origin.read_bytes];
    dest[..origin.read_bytes].copy_from_slice(src);
    dest[origin.read_bytes..].fill(0);
}
