//! Cross-CPU function dispatch over IPIs.
//!
//! Grounded on `examples/original_source/os/core/smp.c`: each CPU owns
//! an N-slot mailbox array indexed by caller CPU id; `smp_function_call`
//! claims the target's slot for this caller, sends an SGI, and the
//! target's IPI handler drains every locked slot. The actual SGI send
//! reuses the `ICC_SGI1R_EL1` mechanism already used for virtual SGI
//! injection in `global.rs`, here aimed at the physical GIC instead of
//! a vCPU's virtual one.

use crate::platform::MAX_SMP_CPUS;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const SMP_FUNCTION_CALL_IRQ: u32 = 6;

pub type SmpFn = fn(data: usize);

struct Slot {
    func: AtomicUsize,
    data: AtomicUsize,
    locked: AtomicBool,
}

impl Slot {
    const fn new() -> Self {
        Slot { func: AtomicUsize::new(0), data: AtomicUsize::new(0), locked: AtomicBool::new(false) }
    }
}

/// `mailboxes[target][caller]`: the slot the caller CPU uses to hand
/// target CPU a call.
static MAILBOXES: [[Slot; MAX_SMP_CPUS]; MAX_SMP_CPUS] = {
    const ROW: [Slot; MAX_SMP_CPUS] = [const { Slot::new() }; MAX_SMP_CPUS];
    [ROW; MAX_SMP_CPUS]
};

/// Hook supplied by the platform layer to actually raise the physical
/// SGI; kept as a swappable function pointer so unit tests can run the
/// slot protocol without touching real GIC registers.
static SGI_SEND: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);

pub fn set_sgi_sender(f: fn(target_cpu: usize, irq: u32)) {
    SGI_SEND.store(f as usize, Ordering::Release);
}

fn send_sgi(target_cpu: usize, irq: u32) {
    let raw = SGI_SEND.load(Ordering::Acquire);
    if raw != 0 {
        let f: fn(usize, u32) = unsafe { core::mem::transmute(raw) };
        f(target_cpu, irq);
    }
}

/// Issue `func(data)` on `target_cpu`. Self-calls bypass the mailbox
/// and run synchronously. If `wait`, busy-waits for the target to
/// drain the slot before returning.
pub fn smp_function_call(caller_cpu: usize, target_cpu: usize, func: SmpFn, data: usize, wait: bool) {
    if target_cpu == caller_cpu {
        func(data);
        return;
    }
    let slot = &MAILBOXES[target_cpu][caller_cpu];
    while slot.locked.load(Ordering::Acquire) {
        core::hint::spin_loop();
    }
    slot.func.store(func as usize, Ordering::Relaxed);
    slot.data.store(data, Ordering::Relaxed);
    slot.locked.store(true, Ordering::Release);
    send_sgi(target_cpu, SMP_FUNCTION_CALL_IRQ);
    if wait {
        while slot.locked.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }
}

/// Run on `this_cpu` in response to `SMP_FUNCTION_CALL_IRQ`: scan every
/// caller's slot addressed to us, invoke it, clear LOCKED.
pub fn smp_function_call_handler(this_cpu: usize) {
    for caller in 0..MAX_SMP_CPUS {
        let slot = &MAILBOXES[this_cpu][caller];
        if slot.locked.load(Ordering::Acquire) {
            let raw = slot.func.load(Ordering::Relaxed);
            let data = slot.data.load(Ordering::Relaxed);
            if raw != 0 {
                let f: SmpFn = unsafe { core::mem::transmute(raw) };
                f(data);
            }
            slot.locked.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize as AU, Ordering as O};

    static SEEN: AU = AU::new(0);
    fn record(data: usize) {
        SEEN.store(data, O::SeqCst);
    }

    #[test]
    fn self_call_runs_synchronously_without_a_slot() {
        SEEN.store(0, O::SeqCst);
        smp_function_call(0, 0, record, 42, false);
        assert_eq!(SEEN.load(O::SeqCst), 42);
    }

    #[test]
    fn cross_cpu_call_is_drained_by_handler() {
        SEEN.store(0, O::SeqCst);
        set_sgi_sender(|_t, _irq| {});
        smp_function_call(0, 1, record, 7, false);
        assert!(MAILBOXES[1][0].locked.load(O::Acquire));
        smp_function_call_handler(1);
        assert_eq!(SEEN.load(O::SeqCst), 7);
        assert!(!MAILBOXES[1][0].locked.load(O::Acquire));
    }
}
