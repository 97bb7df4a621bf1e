//! Guest synchronous-exception descriptor table.
//!
//! Spec §4.5: each descriptor carries `{ec_type, arch filter, handler,
//! ret_addr_adjust, aarch64-only flag}`; spec §9 directs replacing the
//! original's `__sync_desc_start/__sync_desc_end` linker-section
//! registry with an explicit boot-time builder, last-writer-wins on a
//! colliding `ec_type`. `arch/aarch64/hypervisor/exception.rs`'s
//! `handle_exception` match statement is the concrete, working decode
//! path for every EC this crate cares about; this table is consulted
//! first for the ECs registered here (WFI/WFE, HVC, and the two
//! CNTx-trap ECs) so that the registration builder described by the
//! spec is real and exercised, while the fatal/diagnostic paths
//! (instruction aborts, unrecognized traps) stay in `handle_exception`
//! as direct match arms — not worth forcing through a plugin table.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchFilter {
    Aarch32,
    Aarch64,
    Both,
}

pub type TrapHandler = fn(elr: u64) -> bool;

#[derive(Clone, Copy)]
pub struct SyncDesc {
    pub ec_type: u8,
    pub arch: ArchFilter,
    pub handler: TrapHandler,
    /// Added to ELR so the dispatcher skips the trapping instruction.
    pub ret_addr_adjust: u64,
}

const MAX_DESCS: usize = 16;

struct Table {
    entries: [Option<SyncDesc>; MAX_DESCS],
    len: usize,
}

static mut TABLE: Table = Table { entries: [None; MAX_DESCS], len: 0 };

/// Register a descriptor. A later registration for the same `ec_type`
/// overwrites the earlier one (spec §9: "last-writer-wins").
pub fn register(desc: SyncDesc) {
    unsafe {
        let t = &mut *core::ptr::addr_of_mut!(TABLE);
        for e in t.entries[..t.len].iter_mut().flatten() {
            if e.ec_type == desc.ec_type {
                crate::log_warn!(b"trap_table: ec_type collision, last writer wins");
                *e = desc;
                return;
            }
        }
        if t.len < MAX_DESCS {
            t.entries[t.len] = Some(desc);
            t.len += 1;
        }
    }
}

/// Look up and invoke the descriptor for `ec_type`, returning the
/// adjusted ELR and whether a handler ran.
pub fn dispatch(ec_type: u8, is_aarch64: bool, elr: u64) -> Option<(u64, bool)> {
    unsafe {
        let t = &*core::ptr::addr_of!(TABLE);
        for e in t.entries[..t.len].iter().flatten() {
            if e.ec_type == ec_type {
                let arch_ok = match e.arch {
                    ArchFilter::Both => true,
                    ArchFilter::Aarch64 => is_aarch64,
                    ArchFilter::Aarch32 => !is_aarch64,
                };
                if !arch_ok {
                    continue;
                }
                let handled = (e.handler)(elr);
                return Some((elr.wrapping_add(e.ret_addr_adjust), handled));
            }
        }
        None
    }
}
