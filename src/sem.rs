//! Counting semaphore over [`crate::event`].
//!
//! Grounded on `examples/original_source/os/core/sem.c`. Per spec §9's
//! bug list, the type check used by the original's `invalid_sem` helper
//! compared against `OS_EVENT_TYPE_MBOX`; here `sem_pend`/`sem_post`
//! validate against [`EventType::Sem`] as the spec requires.

use crate::error::KernelError;
use crate::event::{self, EventTable, EventType};
use crate::task::{self, PendStat, TaskId, TaskTable};
use crate::mutex::PendOutcome;

pub const SEM_CNT_MAX: u32 = 65535;

pub fn sem_create(tbl: &mut EventTable, initial: u32) -> Result<usize, KernelError> {
    let id = tbl.alloc(EventType::Sem)?;
    tbl.get_mut(id).unwrap().cnt = initial.min(SEM_CNT_MAX);
    Ok(id)
}

fn check_sem(ev: &event::Event) -> Result<(), KernelError> {
    if ev.ty != EventType::Sem {
        Err(KernelError::InvalidArg)
    } else {
        Ok(())
    }
}

pub fn sem_pend(
    tbl: &mut EventTable,
    tasks: &mut TaskTable,
    ev_id: usize,
    task_id: TaskId,
    timeout_ticks: u32,
) -> Result<PendOutcome, KernelError> {
    let ev = tbl.get_mut(ev_id).ok_or(KernelError::NotFound)?;
    check_sem(ev)?;
    if ev.cnt > 0 {
        ev.cnt -= 1;
        return Ok(PendOutcome::Acquired);
    }
    event::event_task_wait(tbl, tasks, ev_id, task_id, task::state::SEM, timeout_ticks)?;
    Ok(PendOutcome::Blocked)
}

/// Wake the highest-priority waiter, or increment `cnt` (saturating)
/// if none are waiting.
pub fn sem_post(tbl: &mut EventTable, tasks: &mut TaskTable, ev_id: usize) -> Result<(), KernelError> {
    {
        let ev = tbl.get(ev_id).ok_or(KernelError::NotFound)?;
        check_sem(ev)?;
    }
    if event::event_highest_task_ready(tbl, tasks, ev_id, 0, task::state::SEM, PendStat::Ok).is_some() {
        return Ok(());
    }
    let ev = tbl.get_mut(ev_id).unwrap();
    ev.cnt = (ev.cnt + 1).min(SEM_CNT_MAX);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOpt {
    /// Wake exactly one (the highest-priority) waiter.
    One,
    /// Wake every waiter.
    Broadcast,
}

/// Release waiters with `pend_stat = Aborted` without touching `cnt`.
/// Returns the number of tasks woken.
pub fn sem_pend_abort(tbl: &mut EventTable, tasks: &mut TaskTable, ev_id: usize, opt: AbortOpt) -> Result<usize, KernelError> {
    {
        let ev = tbl.get(ev_id).ok_or(KernelError::NotFound)?;
        check_sem(ev)?;
    }
    let mut n = 0;
    loop {
        match event::event_highest_task_ready(tbl, tasks, ev_id, 0, task::state::SEM, PendStat::Aborted) {
            Some(_) => {
                n += 1;
                if opt == AbortOpt::One {
                    break;
                }
            }
            None => break,
        }
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Affinity;

    #[test]
    fn post_then_pend_restores_cnt() {
        let mut tbl = EventTable::new();
        let mut tasks = TaskTable::new();
        let s = sem_create(&mut tbl, 1).unwrap();
        sem_post(&mut tbl, &mut tasks, s).unwrap();
        assert_eq!(tbl.get(s).unwrap().cnt, 2);
        let a = tasks.create_task(10, Affinity::Any).unwrap();
        assert_eq!(sem_pend(&mut tbl, &mut tasks, s, a, 0).unwrap(), PendOutcome::Acquired);
        assert_eq!(tbl.get(s).unwrap().cnt, 1);
    }

    #[test]
    fn cnt_saturates_at_65535() {
        let mut tbl = EventTable::new();
        let mut tasks = TaskTable::new();
        let s = sem_create(&mut tbl, SEM_CNT_MAX).unwrap();
        sem_post(&mut tbl, &mut tasks, s).unwrap();
        assert_eq!(tbl.get(s).unwrap().cnt, SEM_CNT_MAX);
    }

    #[test]
    fn wrong_event_type_is_rejected() {
        let mut tbl = EventTable::new();
        let mut tasks = TaskTable::new();
        let m = tbl.alloc(EventType::Mutex).unwrap();
        assert_eq!(sem_post(&mut tbl, &mut tasks, m), Err(KernelError::InvalidArg));
    }

    #[test]
    fn broadcast_abort_wakes_all_waiters() {
        let mut tbl = EventTable::new();
        let mut tasks = TaskTable::new();
        let s = sem_create(&mut tbl, 0).unwrap();
        let a = tasks.create_task(10, Affinity::Any).unwrap();
        let b = tasks.create_task(20, Affinity::Any).unwrap();
        sem_pend(&mut tbl, &mut tasks, s, a, 50).unwrap();
        sem_pend(&mut tbl, &mut tasks, s, b, 50).unwrap();
        let n = sem_pend_abort(&mut tbl, &mut tasks, s, AbortOpt::Broadcast).unwrap();
        assert_eq!(n, 2);
        assert_eq!(tasks.get(a).unwrap().pend_stat, PendStat::Aborted);
        assert_eq!(tasks.get(b).unwrap().pend_stat, PendStat::Aborted);
    }
}
