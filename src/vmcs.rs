//! VMCS (VM-control shared page) trap channel to VM0.
//!
//! Grounded on `examples/original_source/os/virt/vmcs.c`'s
//! `__vcpu_trap`/ack-index protocol (spec §4.9): a one-page, in-order
//! queue of depth 1 per vCPU. `host_index` is the hypervisor's publish
//! counter, `guest_index` VM0's ack counter; the difference is the
//! number of outstanding traps and must never exceed 1.

use crate::error::{KernelError, KernelResult};
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

pub const VMCS_DATA_SIZE: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TrapReason {
    Reboot = 0,
    Shutdown = 1,
    WdtTimeout = 2,
    VmSuspend = 3,
    VmResumed = 4,
    GetTime = 5,
}

/// Per-vCPU control page shared with VM0.
pub struct Vmcs {
    pub vcpu_id: u32,
    pub trap_type: AtomicU32,
    pub trap_reason: AtomicU32,
    pub trap_data: AtomicU64,
    pub trap_result: AtomicU64,
    pub trap_ret: AtomicI32,
    pub host_index: AtomicU32,
    pub guest_index: AtomicU32,
    pub data: [u8; VMCS_DATA_SIZE],
}

impl Vmcs {
    pub const fn new(vcpu_id: u32) -> Self {
        Vmcs {
            vcpu_id,
            trap_type: AtomicU32::new(0),
            trap_reason: AtomicU32::new(0),
            trap_data: AtomicU64::new(0),
            trap_result: AtomicU64::new(0),
            trap_ret: AtomicI32::new(0),
            host_index: AtomicU32::new(0),
            guest_index: AtomicU32::new(0),
            data: [0; VMCS_DATA_SIZE],
        }
    }

    /// Invariant (spec §8 #4): `0 <= host_index - guest_index <= 1`.
    pub fn depth(&self) -> u32 {
        self.host_index.load(Ordering::Acquire).wrapping_sub(self.guest_index.load(Ordering::Acquire))
    }
}

/// Blocking strategy for waiting on VM0's ack, chosen by the caller
/// based on whether the trapping vCPU shares a pCPU with VM0's vcpu0
/// (spec §4.9 step 2: busy-spin would deadlock in that case).
pub enum WaitStrategy {
    BusySpin,
    /// Yield to the scheduler instead of spinning; `sched` is called
    /// repeatedly until the predicate is satisfied.
    Scheduled(fn()),
}

/// `__vcpu_trap`: publish a trap to VM0 and (unless `nonblock`) wait
/// for the ack, copying back `trap_result`.
///
/// `send_vmcs_irq` delivers the vmcs_irq to VM0; `wait_for_ack` blocks
/// per `strategy` until `guest_index == host_index` (post-publish) or,
/// on entry, until any prior trap has already been acked.
pub fn vcpu_trap(
    vmcs: &Vmcs,
    trap_type: u32,
    reason: TrapReason,
    data: u64,
    nonblock: bool,
    strategy: &WaitStrategy,
    send_vmcs_irq: impl Fn() -> bool,
) -> KernelResult<i32> {
    wait_until_acked(vmcs, strategy);

    vmcs.trap_type.store(trap_type, Ordering::Relaxed);
    vmcs.trap_reason.store(reason as u32, Ordering::Relaxed);
    vmcs.trap_data.store(data, Ordering::Relaxed);
    let new_host_index = vmcs.host_index.load(Ordering::Relaxed).wrapping_add(1);
    vmcs.host_index.store(new_host_index, Ordering::Release);

    if !send_vmcs_irq() {
        // Roll back: VM0 never learns about this trap.
        vmcs.host_index.store(new_host_index.wrapping_sub(1), Ordering::Release);
        return Err(KernelError::IoError);
    }

    if !nonblock {
        wait_until_acked(vmcs, strategy);
        return Ok(vmcs.trap_ret.load(Ordering::Acquire));
    }
    Ok(0)
}

fn wait_until_acked(vmcs: &Vmcs, strategy: &WaitStrategy) {
    loop {
        if vmcs.guest_index.load(Ordering::Acquire) == vmcs.host_index.load(Ordering::Acquire) {
            return;
        }
        match strategy {
            WaitStrategy::BusySpin => core::hint::spin_loop(),
            WaitStrategy::Scheduled(sched) => sched(),
        }
    }
}

/// VM0's half of the protocol: acknowledge the outstanding trap,
/// publish `trap_result`/`trap_ret`, and advance `guest_index`.
pub fn vm0_ack(vmcs: &Vmcs, trap_result: u64, trap_ret: i32) {
    vmcs.trap_result.store(trap_result, Ordering::Relaxed);
    vmcs.trap_ret.store(trap_ret, Ordering::Relaxed);
    let acked = vmcs.host_index.load(Ordering::Acquire);
    vmcs.guest_index.store(acked, Ordering::Release);
}
