//! Priority-ceiling-free mutex over [`crate::event`].
//!
//! Grounded on `examples/original_source/os/core/mutex.c`. `pend`/`post`
//! here do not themselves context-switch: a blocked caller is a vCPU
//! task that the scheduler simply stops picking (see
//! `scheduler::sched`/`task::TaskTable::get_highest_task`) until
//! `mutex_post` or the timeout path calls `event_highest_task_ready`;
//! there is no separate kernel-task stack to save, only vCPU register
//! state, which the existing `vcpu`/`vmodule` machinery already owns.

use crate::error::KernelError;
use crate::event::{self, EventTable, EventType};
use crate::task::{self, PendStat, TaskId, TaskTable};

/// Sentinel `cnt` value meaning "unlocked".
pub const AVAILABLE: u32 = u32::MAX;

pub fn mutex_create(tbl: &mut EventTable) -> Result<usize, KernelError> {
    let id = tbl.alloc(EventType::Mutex)?;
    tbl.get_mut(id).unwrap().cnt = AVAILABLE;
    Ok(id)
}

/// Outcome of a pend call: `Acquired` means the caller now owns the
/// mutex and may proceed; `Blocked` means the caller's task has been
/// parked and will observe `pend_stat` once woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendOutcome {
    Acquired,
    Blocked,
}

pub fn mutex_pend(
    tbl: &mut EventTable,
    tasks: &mut TaskTable,
    ev_id: usize,
    task_id: TaskId,
    timeout_ticks: u32,
) -> Result<PendOutcome, KernelError> {
    let ev = tbl.get_mut(ev_id).ok_or(KernelError::NotFound)?;
    if ev.ty != EventType::Mutex {
        return Err(KernelError::InvalidArg);
    }
    if ev.cnt == AVAILABLE {
        let prio = tasks.get(task_id).ok_or(KernelError::NotFound)?.priority;
        ev.owner = Some(task_id);
        ev.data = task_id;
        ev.cnt = prio as u32;
        let t = tasks.get_mut(task_id).unwrap();
        t.lock_event = Some(ev_id);
        return Ok(PendOutcome::Acquired);
    }
    event::event_task_wait(tbl, tasks, ev_id, task_id, task::state::MUTEX, timeout_ticks)?;
    Ok(PendOutcome::Blocked)
}

/// Caller must be the current owner. Wakes the highest-priority waiter
/// (who becomes the new owner) or releases the mutex if none remain.
pub fn mutex_post(tbl: &mut EventTable, tasks: &mut TaskTable, ev_id: usize, task_id: TaskId) -> Result<(), KernelError> {
    let ev = tbl.get_mut(ev_id).ok_or(KernelError::NotFound)?;
    if ev.ty != EventType::Mutex {
        return Err(KernelError::InvalidArg);
    }
    if ev.owner != Some(task_id) {
        return Err(KernelError::NotPermitted);
    }
    if let Some(t) = tasks.get_mut(task_id) {
        t.lock_event = None;
    }
    match event::event_highest_task_ready(tbl, tasks, ev_id, 0, task::state::MUTEX, PendStat::Ok) {
        Some(new_owner) => {
            let prio = tasks.get(new_owner).unwrap().priority;
            let ev = tbl.get_mut(ev_id).unwrap();
            ev.owner = Some(new_owner);
            ev.data = new_owner;
            ev.cnt = prio as u32;
            tasks.get_mut(new_owner).unwrap().lock_event = Some(ev_id);
        }
        None => {
            let ev = tbl.get_mut(ev_id).unwrap();
            ev.owner = None;
            ev.cnt = AVAILABLE;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Affinity;

    #[test]
    fn uncontended_pend_acquires_immediately() {
        let mut tbl = EventTable::new();
        let mut tasks = TaskTable::new();
        let m = mutex_create(&mut tbl).unwrap();
        let a = tasks.create_task(10, Affinity::Any).unwrap();
        assert_eq!(mutex_pend(&mut tbl, &mut tasks, m, a, 0).unwrap(), PendOutcome::Acquired);
        assert_eq!(tbl.get(m).unwrap().owner, Some(a));
    }

    #[test]
    fn contended_waiter_becomes_owner_on_post() {
        let mut tbl = EventTable::new();
        let mut tasks = TaskTable::new();
        let m = mutex_create(&mut tbl).unwrap();
        let a = tasks.create_task(10, Affinity::Any).unwrap();
        let b = tasks.create_task(20, Affinity::Any).unwrap();
        assert_eq!(mutex_pend(&mut tbl, &mut tasks, m, a, 0).unwrap(), PendOutcome::Acquired);
        assert_eq!(mutex_pend(&mut tbl, &mut tasks, m, b, 100).unwrap(), PendOutcome::Blocked);
        mutex_post(&mut tbl, &mut tasks, m, a).unwrap();
        assert_eq!(tbl.get(m).unwrap().owner, Some(b));
        assert_eq!(tasks.get(b).unwrap().pend_stat, PendStat::Ok);
        assert!(!event::event_get_waiter(tbl.get(m).unwrap(), &tasks).is_some());
    }

    #[test]
    fn pend_post_roundtrip_is_noop_on_cnt() {
        let mut tbl = EventTable::new();
        let mut tasks = TaskTable::new();
        let m = mutex_create(&mut tbl).unwrap();
        let a = tasks.create_task(10, Affinity::Any).unwrap();
        mutex_pend(&mut tbl, &mut tasks, m, a, 0).unwrap();
        mutex_post(&mut tbl, &mut tasks, m, a).unwrap();
        assert_eq!(tbl.get(m).unwrap().cnt, AVAILABLE);
    }

    #[test]
    fn blocked_waiter_times_out_and_leaves_the_wait_set() {
        let mut tbl = EventTable::new();
        let mut tasks = TaskTable::new();
        let m = mutex_create(&mut tbl).unwrap();
        let a = tasks.create_task(10, Affinity::Any).unwrap();
        let b = tasks.create_task(20, Affinity::Any).unwrap();
        mutex_pend(&mut tbl, &mut tasks, m, a, 0).unwrap();
        assert_eq!(mutex_pend(&mut tbl, &mut tasks, m, b, 100).unwrap(), PendOutcome::Blocked);
        for _ in 0..100 {
            event::event_tick(&mut tbl, &mut tasks);
        }
        assert_eq!(tasks.get(b).unwrap().pend_stat, PendStat::Timeout);
        assert!(!event::event_get_waiter(tbl.get(m).unwrap(), &tasks).is_some());
        // A is unaffected and still owns the mutex.
        assert_eq!(tbl.get(m).unwrap().owner, Some(a));
    }

    #[test]
    fn non_owner_post_is_rejected() {
        let mut tbl = EventTable::new();
        let mut tasks = TaskTable::new();
        let m = mutex_create(&mut tbl).unwrap();
        let a = tasks.create_task(10, Affinity::Any).unwrap();
        let b = tasks.create_task(20, Affinity::Any).unwrap();
        mutex_pend(&mut tbl, &mut tasks, m, a, 0).unwrap();
        assert_eq!(mutex_post(&mut tbl, &mut tasks, m, b), Err(KernelError::NotPermitted));
    }
}
