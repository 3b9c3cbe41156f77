//! Physical frame table: tracks which physical frames are in use, owns the
//! clock-hand eviction policy, and arbitrates frame reuse when the pool is
//! exhausted. Grounded on `vm/frame.c`'s `frame_allocate`/
//! `pick_frame_to_evict`/`clock_frame_next` from the original Pintos VM
//! implementation, and on the two-pass clear-and-retry clock scan in
//! `find_clock_victim` from the `gitrustux-kernel` pager reference.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;
use x86_64::{structures::paging::FrameAllocator, VirtAddr};

use super::{kernel_addr_of, BootInfoFrameAllocator, KernelAddr};
use super::vm::ProcessId;
use crate::{println, serial_println};

struct FrameEntry {
    owner: ProcessId,
    upage: u64,
    pinned: bool,
}

struct Inner {
    entries: BTreeMap<u64, FrameEntry>,
    /// Clock ring, insertion order. Holds the same keys as `entries`.
    order: Vec<u64>,
    hand: usize,
}

static FRAME_TABLE: Mutex<Inner> = Mutex::new(Inner {
    entries: BTreeMap::new(),
    order: Vec::new(),
    hand: 0,
});

/// Allocates a frame for `owner`'s page `upage`. If the pool is exhausted,
/// selects a clock victim, evicts it via `evict` exactly once, and reuses
/// its physical frame. Frames are born pinned; the caller must unpin once
/// the hardware mapping is installed.
///
/// # Errors
/// Returns `Err` if eviction fails (e.g. swap exhausted).
///
/// # Panics
/// Panics if the clock scan exhausts its `2*N` budget without finding an
/// unpinned, not-recently-accessed victim.
pub fn allocate(
    owner: ProcessId,
    upage: VirtAddr,
    frame_allocator: &mut BootInfoFrameAllocator,
    mut evict: impl FnMut(ProcessId, VirtAddr, KernelAddr) -> Result<(), &'static str>,
    mut is_accessed: impl FnMut(ProcessId, VirtAddr) -> bool,
    mut clear_accessed: impl FnMut(ProcessId, VirtAddr),
) -> Result<KernelAddr, &'static str> {
    if let Some(frame) = frame_allocator.allocate_frame() {
        let kaddr = kernel_addr_of(frame);
        let mut table = FRAME_TABLE.lock();
        table.order.push(kaddr.0);
        table.entries.insert(
            kaddr.0,
            FrameEntry {
                owner,
                upage: upage.as_u64(),
                pinned: true,
            },
        );
        return Ok(kaddr);
    }

    let mut table = FRAME_TABLE.lock();
    let (victim_owner, victim_upage, victim_kaddr) =
        select_victim(&mut table, &mut is_accessed, &mut clear_accessed)?;

    // Release the table lock while the caller writes the victim back; the
    // write-back touches swap and the victim's SPT, not this table.
    drop(table);
    serial_println!(
        "[kernel] frame pool exhausted, evicting process {} page {:#x}",
        victim_owner.0,
        victim_upage.as_u64()
    );
    println!("[kernel] evicting a page to satisfy an allocation");
    evict(victim_owner, victim_upage, victim_kaddr)?;

    let mut table = FRAME_TABLE.lock();
    table.entries.insert(
        victim_kaddr.0,
        FrameEntry {
            owner,
            upage: upage.as_u64(),
            pinned: true,
        },
    );
    Ok(victim_kaddr)
}

fn select_victim(
    table: &mut Inner,
    is_accessed: &mut impl FnMut(ProcessId, VirtAddr) -> bool,
    clear_accessed: &mut impl FnMut(ProcessId, VirtAddr),
) -> Result<(ProcessId, VirtAddr, KernelAddr), &'static str> {
    let n = table.order.len();
    if n == 0 {
        return Err("frame table is empty, nothing to evict");
    }

    let budget = 2 * n;
    for _ in 0..budget {
        if table.hand >= table.order.len() {
            table.hand = 0;
        }
        let kaddr_u64 = table.order[table.hand];
        table.hand += 1;

        let (owner, upage, pinned) = {
            let entry = table
                .entries
                .get(&kaddr_u64)
                .expect("clock order desynced from frame entries");
            (entry.owner, VirtAddr::new(entry.upage), entry.pinned)
        };

        if pinned {
            continue;
        }

        if is_accessed(owner, upage) {
            clear_accessed(owner, upage);
            continue;
        }

        return Ok((owner, upage, KernelAddr(kaddr_u64)));
    }

    panic!("clock eviction scan exhausted its budget without finding a victim");
}

/// Marks `kaddr` pinned or unpinned. Pinned frames are never selected for
/// eviction.
///
/// # Panics
/// Panics if `kaddr` is not a currently tracked frame, per spec's "unknown
/// frame/SPE in internal API" invariant.
pub fn set_pinned(kaddr: KernelAddr, pinned: bool) {
    let mut table = FRAME_TABLE.lock();
    table
        .entries
        .get_mut(&kaddr.0)
        .expect("set_pinned on unknown frame")
        .pinned = pinned;
}

/// Releases a frame from the table and returns it to the allocator's
/// free-list, without going through eviction (used when a resident page is
/// unmapped/destroyed directly rather than swapped out).
pub fn release(kaddr: KernelAddr, frame_allocator: &mut BootInfoFrameAllocator) {
    let mut table = FRAME_TABLE.lock();
    table.entries.remove(&kaddr.0);
    table.order.retain(|&k| k != kaddr.0);
    drop(table);

    let frame = super::phys_frame_of(kaddr);
    // SAFETY: the frame is being removed from the table; nothing maps it
    // after this call returns (the caller unmaps the hardware entry too).
    unsafe {
        frame_allocator.deallocate_frame(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeSet;

    fn entry(owner: u64, upage: u64, pinned: bool) -> FrameEntry {
        FrameEntry {
            owner: ProcessId(owner),
            upage,
            pinned,
        }
    }

    #[test_case]
    fn test_select_victim_skips_pinned_and_clears_accessed_before_evicting() {
        // Frames in clock order: 0x1000 (pinned), 0x2000 (accessed), 0x3000 (cold).
        let mut table = Inner {
            entries: BTreeMap::new(),
            order: alloc::vec![0x1000, 0x2000, 0x3000],
            hand: 0,
        };
        table.entries.insert(0x1000, entry(1, 0x8000, true));
        table.entries.insert(0x2000, entry(2, 0x9000, false));
        table.entries.insert(0x3000, entry(3, 0xa000, false));

        let mut accessed = BTreeSet::new();
        accessed.insert(0x9000_u64);
        let mut cleared = BTreeSet::new();

        let victim = select_victim(
            &mut table,
            &mut |_owner, upage| accessed.contains(&upage.as_u64()),
            &mut |_owner, upage| {
                cleared.insert(upage.as_u64());
                accessed.remove(&upage.as_u64());
            },
        )
        .expect("a victim must be selected once the pinned/accessed frames are passed over");

        assert_eq!(
            victim.2 .0, 0x3000,
            "the cold, unpinned frame must be selected, not the pinned or just-accessed one",
        );
        assert!(
            cleared.contains(&0x9000),
            "the accessed frame must have its accessed bit cleared for its second chance",
        );
    }

    #[test_case]
    fn test_select_victim_finds_sole_unpinned_frame() {
        let mut table = Inner {
            entries: BTreeMap::new(),
            order: alloc::vec![0x4000],
            hand: 0,
        };
        table.entries.insert(0x4000, entry(1, 0xb000, false));

        let victim = select_victim(&mut table, &mut |_, _| false, &mut |_, _| {})
            .expect("the sole unpinned frame must be selected");
        assert_eq!(victim.2 .0, 0x4000);
    }

    #[test_case]
    fn test_set_pinned_then_unpinned_round_trips() {
        let kaddr = KernelAddr(0x1000);
        let mut table = FRAME_TABLE.lock();
        table.order.push(kaddr.0);
        table.entries.insert(
            kaddr.0,
            FrameEntry {
                owner: ProcessId(7),
                upage: 0x2000,
                pinned: true,
            },
        );
        drop(table);

        set_pinned(kaddr, false);
        let table = FRAME_TABLE.lock();
        assert!(
            !table.entries.get(&kaddr.0).expect("entry present").pinned,
            "frame must be unpinned after set_pinned(false)",
        );
    }
}
