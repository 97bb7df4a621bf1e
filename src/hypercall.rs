//! Hypercall (HVC) service-type dispatch table.
//!
//! Spec §4.5/§6: the upper 8 bits of the function id select a
//! `svc_desc` covering a `[type_start..type_end]` range, built at boot.
//! Spec §9 directs replacing the original's linker-section table with
//! an explicit registration builder, and states overlapping ranges are
//! "last-writer-wins" — `register` here simply overwrites in place and
//! logs a warning, matching that rule.

use crate::error::KernelError;

pub const SVC_CTYPE_MASK: u32 = 1 << 31;
const MAX_SERVICES: usize = 16;

/// Service type for the inter-VM mailbox hypercalls (spec §4.8).
pub const HVC_TYPE_HVC_MAILBOX: u8 = 0x10;

pub type HvcHandler = fn(calling_vm: u16, id: u32, args: &[u64; 6]) -> i64;

#[derive(Clone, Copy)]
struct SvcDesc {
    type_start: u8,
    type_end: u8,
    handler: HvcHandler,
}

struct Table {
    entries: [Option<SvcDesc>; MAX_SERVICES],
    len: usize,
}

static mut TABLE: Table = Table { entries: [None; MAX_SERVICES], len: 0 };

fn service_type(id: u32) -> u8 {
    ((id >> 24) & 0xff) as u8
}

/// Register a handler for `[type_start, type_end]`. A later call whose
/// range overlaps an earlier one overwrites it (last-writer-wins).
pub fn register(type_start: u8, type_end: u8, handler: HvcHandler) {
    unsafe {
        let t = &mut *core::ptr::addr_of_mut!(TABLE);
        for e in t.entries[..t.len].iter_mut().flatten() {
            if e.type_start <= type_end && type_start <= e.type_end {
                crate::log_warn!(b"hypercall: overlapping svc_desc range, last writer wins");
                e.type_start = type_start;
                e.type_end = type_end;
                e.handler = handler;
                return;
            }
        }
        if t.len < MAX_SERVICES {
            t.entries[t.len] = Some(SvcDesc { type_start, type_end, handler });
            t.len += 1;
        }
    }
}

/// Dispatch a hypercall. `id` is x0 (function id), `args` are x1..x6.
/// The fast-call bit (`SVC_CTYPE_MASK`) is the caller's concern (it
/// governs whether IRQs are re-enabled before this runs, not which
/// handler is chosen).
pub fn dispatch(calling_vm: u16, id: u32, args: &[u64; 6]) -> i64 {
    let ty = service_type(id);
    unsafe {
        let t = &*core::ptr::addr_of!(TABLE);
        for e in t.entries[..t.len].iter().flatten() {
            if ty >= e.type_start && ty <= e.type_end {
                return (e.handler)(calling_vm, id, args);
            }
        }
    }
    KernelError::InvalidArg.as_hvc_code()
}

/// Register the mailbox service handler (spec §4.8). `args[0]` is the
/// cookie; the remaining hypercall id bits select a sub-function.
pub fn register_mailbox_service() {
    register(HVC_TYPE_HVC_MAILBOX, HVC_TYPE_HVC_MAILBOX, mailbox_hypercall);
}

fn mailbox_hypercall(calling_vm: u16, id: u32, args: &[u64; 6]) -> i64 {
    use crate::ivm_mailbox::MAILBOX_TABLE;
    let cookie = args[0];
    let sub_fn = id & 0x00ff_ffff;
    let tbl = MAILBOX_TABLE.lock();
    let (index, _ep) = match tbl.validate(calling_vm, cookie) {
        Ok(v) => v,
        Err(e) => return e.as_hvc_code(),
    };
    match sub_fn {
        0 => index as i64,    // query-instance
        1 => {
            let mb = tbl.get(index).unwrap();
            (mb.status as i64) << 32 | mb.shmem_size as i64 // get-info (packed)
        }
        _ => KernelError::InvalidArg.as_hvc_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(_vm: u16, _id: u32, args: &[u64; 6]) -> i64 {
        args[0] as i64
    }

    #[test]
    fn dispatch_routes_by_service_type_byte() {
        register(0x20, 0x20, echo);
        let id = (0x20u32) << 24;
        assert_eq!(dispatch(0, id, &[42, 0, 0, 0, 0, 0]), 42);
    }

    #[test]
    fn unregistered_type_returns_invalid_arg() {
        let id = (0x7fu32) << 24;
        assert_eq!(dispatch(0, id, &[0; 6]), KernelError::InvalidArg.as_hvc_code());
    }

    #[test]
    fn mailbox_hypercall_rejects_wrong_vm() {
        use crate::ivm_mailbox::MAILBOX_TABLE;
        MAILBOX_TABLE.lock().create_mailbox(1, 5, 6, 0, 0).unwrap();
        register_mailbox_service();
        let cookie = MAILBOX_TABLE.lock().get(1).unwrap().cookie;
        let id = (HVC_TYPE_HVC_MAILBOX as u32) << 24;
        let r = dispatch(9, id, &[cookie, 0, 0, 0, 0, 0]);
        assert_eq!(r, KernelError::NotPermitted.as_hvc_code());
    }
}
