//! Single-slot message-passing primitive over [`crate::event`].
//!
//! This is the `Mbox` task-pend-state from spec §3/§4.2 — a kernel
//! synchronization primitive — not to be confused with the inter-VM
//! shared-memory mailbox service in [`crate::ivm_mailbox`] (spec §4.8),
//! which is a different, hypercall-driven facility that happens to
//! share the English name in the source material.

use crate::error::KernelError;
use crate::event::{self, EventTable, EventType};
use crate::mutex::PendOutcome;
use crate::task::{self, PendStat, TaskId, TaskTable};

pub fn mbox_create(tbl: &mut EventTable) -> Result<usize, KernelError> {
    let id = tbl.alloc(EventType::Mbox)?;
    tbl.get_mut(id).unwrap().data = 0;
    Ok(id)
}

/// Consume the slot if a message is posted (data != 0 is used as the
/// present/absent marker, matching the C original's pointer semantics);
/// otherwise block.
pub fn mbox_pend(
    tbl: &mut EventTable,
    tasks: &mut TaskTable,
    ev_id: usize,
    task_id: TaskId,
    timeout_ticks: u32,
) -> Result<PendOutcome, KernelError> {
    let ev = tbl.get_mut(ev_id).ok_or(KernelError::NotFound)?;
    if ev.ty != EventType::Mbox {
        return Err(KernelError::InvalidArg);
    }
    if ev.data != 0 {
        ev.data = 0;
        return Ok(PendOutcome::Acquired);
    }
    event::event_task_wait(tbl, tasks, ev_id, task_id, task::state::MBOX, timeout_ticks)?;
    Ok(PendOutcome::Blocked)
}

/// Post a message: wakes the waiter directly with `msg` if one is
/// parked, else stores it in the slot for the next `mbox_pend`.
pub fn mbox_post(tbl: &mut EventTable, tasks: &mut TaskTable, ev_id: usize, msg: usize) -> Result<(), KernelError> {
    {
        let ev = tbl.get(ev_id).ok_or(KernelError::NotFound)?;
        if ev.ty != EventType::Mbox {
            return Err(KernelError::InvalidArg);
        }
    }
    if event::event_highest_task_ready(tbl, tasks, ev_id, msg, task::state::MBOX, PendStat::Ok).is_some() {
        return Ok(());
    }
    tbl.get_mut(ev_id).unwrap().data = msg;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Affinity;

    #[test]
    fn post_before_pend_is_delivered_on_pend() {
        let mut tbl = EventTable::new();
        let mut tasks = TaskTable::new();
        let m = mbox_create(&mut tbl).unwrap();
        mbox_post(&mut tbl, &mut tasks, m, 0xdead).unwrap();
        let a = tasks.create_task(10, Affinity::Any).unwrap();
        assert_eq!(mbox_pend(&mut tbl, &mut tasks, m, a, 0).unwrap(), PendOutcome::Acquired);
    }

    #[test]
    fn pend_before_post_delivers_msg_directly() {
        let mut tbl = EventTable::new();
        let mut tasks = TaskTable::new();
        let m = mbox_create(&mut tbl).unwrap();
        let a = tasks.create_task(10, Affinity::Any).unwrap();
        assert_eq!(mbox_pend(&mut tbl, &mut tasks, m, a, 100).unwrap(), PendOutcome::Blocked);
        mbox_post(&mut tbl, &mut tasks, m, 0xbeef).unwrap();
        assert_eq!(tasks.get(a).unwrap().msg, 0xbeef);
        assert_eq!(tasks.get(a).unwrap().pend_stat, PendStat::Ok);
    }
}
