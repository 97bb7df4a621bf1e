//! Platform/Board Constants (QEMU virt machine)
//!
//! All board-specific addresses and sizes live here so they can be
//! changed in one place when targeting a different platform.

use crate::arch::aarch64::defs::BLOCK_SIZE_2MB;

// ── UART (PL011) ─────────────────────────────────────────────────────
pub const UART_BASE: usize = 0x0900_0000;
pub const UART_SIZE: u64 = 0x1000;

// ── GIC ──────────────────────────────────────────────────────────────
pub const GICD_BASE: u64 = 0x0800_0000;
pub const GICD_SIZE: u64 = 0x1_0000;
pub const GICC_BASE: u64 = 0x0801_0000;
/// GICv3 redistributor region, first frame (QEMU virt default).
pub const GICR_BASE: u64 = 0x080A_0000;
pub const GIC_REGION_BASE: u64 = 0x0800_0000;
/// 16MB covers GICD + GICR (8 x 2MB blocks: 0x0800_0000 - 0x0900_0000)
pub const GIC_REGION_SIZE: u64 = 8 * BLOCK_SIZE_2MB;

// ── Guest memory layout ──────────────────────────────────────────────
pub const GUEST_RAM_BASE: u64 = 0x4000_0000;
pub const GUEST_LOAD_ADDR: u64 = 0x4800_0000;
pub const LINUX_DTB_ADDR: u64 = 0x4700_0000;
pub const LINUX_MEM_SIZE: u64 = 1024 * 1024 * 1024;
pub const ZEPHYR_MEM_SIZE: u64 = 128 * 1024 * 1024;
pub const GUEST_STACK_RESERVE: u64 = 0x1000;

// ── SMP ──────────────────────────────────────────────────────────────
/// Maximum CPUs supported (compile-time capacity for array sizing)
pub const MAX_SMP_CPUS: usize = 8;
/// CPU count for the QEMU virt target this crate boots on.
pub const SMP_CPUS: usize = 4;
pub const fn num_cpus() -> usize {
    SMP_CPUS
}

// ── GICR redistributor offsets ───────────────────────────────────────
/// GICv3 redistributor frames are 0x20000 (128KB) apart.
const GICR_FRAME_STRIDE: u64 = 0x20000;
/// SGI frame sits at RD base + 0x10000 within a redistributor frame.
const GICR_SGI_OFFSET: u64 = 0x10000;

/// RD frame base for a given CPU.
pub const fn gicr_rd_base(cpu_id: usize) -> u64 {
    GICR_BASE + (cpu_id as u64) * GICR_FRAME_STRIDE
}

/// SGI frame base for a given CPU.
pub const fn gicr_sgi_base(cpu_id: usize) -> u64 {
    gicr_rd_base(cpu_id) + GICR_SGI_OFFSET
}

/// GICR_WAKER offset from RD base
pub const GICR_WAKER_OFF: u64 = 0x014;
/// GICR_IGROUPR0 offset within SGI frame (interrupt group)
pub const GICR_IGROUPR0_OFF: u64 = 0x080;
/// GICR_ISENABLER0 offset within SGI frame (write-1-to-enable)
pub const GICR_ISENABLER0_OFF: u64 = 0x100;
/// GICR_ISPENDR0 offset within SGI frame
pub const GICR_ISPENDR0_OFF: u64 = 0x200;
/// GICR_ICPENDR0 offset within SGI frame
pub const GICR_ICPENDR0_OFF: u64 = 0x280;

/// SGI frame base for pCPU 0 — the only redistributor this crate programs
/// directly when running single-pCPU (scheduler-based vCPU multiplexing).
pub const GICR0_SGI_BASE: u64 = gicr_sgi_base(0);

/// RD frame base for every pCPU slot up to `MAX_SMP_CPUS`, used to wake a
/// target pCPU's redistributor before sending it a physical SGI.
pub const GICR_RD_BASES: [u64; MAX_SMP_CPUS] = {
    let mut bases = [0u64; MAX_SMP_CPUS];
    let mut i = 0;
    while i < MAX_SMP_CPUS {
        bases[i] = gicr_rd_base(i);
        i += 1;
    }
    bases
};

// ── VM 1 memory layout (multi-VM mode) ──────────────────────────────
pub const VM1_GUEST_LOAD_ADDR: u64 = 0x6800_0000;
pub const VM1_LINUX_DTB_ADDR: u64 = 0x6700_0000;
pub const VM1_LINUX_MEM_SIZE: u64 = 256 * 1024 * 1024;

// ── Heap ─────────────────────────────────────────────────────────────
pub const HEAP_START: u64 = 0x4100_0000;
pub const HEAP_SIZE: u64 = 0x100_0000; // 16MB

// ── Task / sync kernel ────────────────────────────────────────────
/// Capacity of the global pid table (spec: "index into a global table
/// of capacity 512").
pub const MAX_TASKS: usize = 512;

// ── Inter-VM mailbox ──────────────────────────────────────────────
/// Maximum number of inter-VM mailboxes in existence at once.
pub const MAX_MAILBOX_NR: usize = 64;
/// Documented allocator limit for a single mailbox's shared memory
/// region (spec §9: "noted in the source as a current allocator limit
/// rather than a design decision").
pub const MAILBOX_SHMEM_CAP: u64 = 2 * 1024 * 1024;

/// IPA base of the identity-mapped region `vm.rs::init_memory` reserves
/// for mailbox shared memory, right past the heap.
pub const MAILBOX_REGION_BASE: u64 = HEAP_START + HEAP_SIZE;
/// Number of concurrently-addressable shmem slots within that region;
/// `MAX_MAILBOX_NR` mailboxes share these by index modulo, since mapping
/// a slot per possible mailbox index would reserve 128MiB of IPA space
/// up front for a capacity that is rarely exhausted.
pub const MAILBOX_REGION_SLOTS: u64 = 16;
pub const MAILBOX_REGION_SIZE: u64 = MAILBOX_SHMEM_CAP * MAILBOX_REGION_SLOTS;

/// IPA of the shared-memory carve-out for mailbox `index`, within the
/// region `vm.rs` maps at boot.
pub const fn mailbox_shmem_base(index: u8) -> u64 {
    MAILBOX_REGION_BASE + (index as u64 % MAILBOX_REGION_SLOTS) * MAILBOX_SHMEM_CAP
}
