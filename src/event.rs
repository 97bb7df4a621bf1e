//! Uniform wait-queue abstraction shared by mutex, semaphore, mailbox
//! and flag primitives.
//!
//! Grounded on `examples/original_source/os/core/event.c`: realtime
//! waiters are tracked by the same row/column bitmap used for the
//! scheduler's ready bitmap (`wait_tbl`/`wait_grp`), non-realtime
//! waiters by a doubly linked list represented here as a fixed-capacity
//! index array (no `alloc`, so "linked list" becomes an intrusive
//! position table rather than boxed nodes).

use crate::error::KernelError;
use crate::sync::SpinLock;
use crate::task::{self, Affinity, PendStat, TaskId};

pub const MAX_EVENTS: usize = 256;
const MAX_WAIT_LIST: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Sem,
    Mbox,
    Mutex,
    Flag,
    Q,
}

/// Generic wait object. `cnt`/`owner`/`data` carry type-specific payload
/// (semaphore count, mutex owner+ceiling, mailbox message pointer) —
/// the sync-primitive modules built on top of `Event` interpret them.
pub struct Event {
    pub ty: EventType,
    pub in_use: bool,
    pub wait_grp: u8,
    pub wait_tbl: [u8; 8],
    /// Non-realtime waiters, in FIFO wait order.
    wait_list: [Option<TaskId>; MAX_WAIT_LIST],
    wait_list_len: usize,
    pub cnt: u32,
    pub owner: Option<TaskId>,
    pub data: usize,
}

impl Event {
    const fn empty() -> Self {
        Event {
            ty: EventType::Q,
            in_use: false,
            wait_grp: 0,
            wait_tbl: [0; 8],
            wait_list: [None; MAX_WAIT_LIST],
            wait_list_len: 0,
            cnt: 0,
            owner: None,
            data: 0,
        }
    }

    fn wait_list_push(&mut self, id: TaskId) -> Result<(), KernelError> {
        if self.wait_list_len >= MAX_WAIT_LIST {
            return Err(KernelError::NoMemory);
        }
        self.wait_list[self.wait_list_len] = Some(id);
        self.wait_list_len += 1;
        Ok(())
    }

    fn wait_list_remove(&mut self, id: TaskId) -> bool {
        if let Some(pos) = self.wait_list[..self.wait_list_len].iter().position(|s| *s == Some(id)) {
            for i in pos..self.wait_list_len - 1 {
                self.wait_list[i] = self.wait_list[i + 1];
            }
            self.wait_list_len -= 1;
            self.wait_list[self.wait_list_len] = None;
            true
        } else {
            false
        }
    }

    fn wait_list_head(&self) -> Option<TaskId> {
        self.wait_list[0]
    }

    /// Invariant I-2: membership in wait_list is exclusive-or with
    /// membership in wait_tbl for any given task.
    pub fn contains(&self, t: &task::Task) -> bool {
        if t.is_realtime() {
            (self.wait_tbl[t.by as usize] >> t.bx) & 1 != 0
        } else {
            self.wait_list[..self.wait_list_len].contains(&Some(t.id))
        }
    }
}

pub struct EventTable {
    events: [Event; MAX_EVENTS],
}

unsafe impl Sync for EventTable {}

impl EventTable {
    const fn new() -> Self {
        EventTable { events: [const { Event::empty() }; MAX_EVENTS] }
    }

    pub fn alloc(&mut self, ty: EventType) -> Result<usize, KernelError> {
        for (i, ev) in self.events.iter_mut().enumerate() {
            if !ev.in_use {
                *ev = Event::empty();
                ev.ty = ty;
                ev.in_use = true;
                return Ok(i);
            }
        }
        Err(KernelError::NoMemory)
    }

    pub fn get(&self, id: usize) -> Option<&Event> {
        self.events.get(id).filter(|e| e.in_use)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Event> {
        self.events.get_mut(id).filter(|e| e.in_use)
    }
}

pub static EVENT_TABLE: SpinLock<EventTable> = SpinLock::new(EventTable::new());

/// Delete policy for [`event_del_always`]/`OS_DEL_NO_PEND` callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelOpt {
    NoPend,
    Always,
}

/// Park `task` on `ev`: realtime tasks set their bitmap bit, others
/// append to the FIFO wait list. Caller holds both the event and task
/// locks conceptually (here: the single `EVENT_TABLE`/`TASK_TABLE`
/// locks, acquired event-then-task per spec's ordering rule).
pub fn event_task_wait(
    tbl: &mut EventTable,
    tasks: &mut task::TaskTable,
    ev_id: usize,
    task_id: TaskId,
    pend_bit: u16,
    timeout_ticks: u32,
) -> Result<(), KernelError> {
    let ev = tbl.get_mut(ev_id).ok_or(KernelError::NotFound)?;
    let t = tasks.get_mut(task_id).ok_or(KernelError::NotFound)?;
    if t.is_realtime() {
        ev.wait_tbl[t.by as usize] |= t.bitx;
        ev.wait_grp |= t.bity;
    } else {
        ev.wait_list_push(task_id)?;
    }
    t.state |= pend_bit;
    t.wait_event = Some(ev_id);
    t.delay = timeout_ticks;
    t.pend_stat = PendStat::Ok;
    tasks.clear_task_ready(task_id);
    Ok(())
}

/// Remove `task` from `ev`'s wait set without waking it (used by the
/// timeout path and by `mutex`/`sem` abort paths).
pub fn event_task_remove(ev: &mut Event, t: &task::Task) -> bool {
    if t.is_realtime() {
        let was_set = ev.wait_tbl[t.by as usize] & t.bitx != 0;
        ev.wait_tbl[t.by as usize] &= !t.bitx;
        if ev.wait_tbl[t.by as usize] == 0 {
            ev.wait_grp &= !t.bity;
        }
        was_set
    } else {
        ev.wait_list_remove(t.id)
    }
}

/// Pick (without removing) the task that would be woken next: the
/// highest-priority realtime waiter if any, else the head of the FIFO
/// list.
pub fn event_get_waiter(ev: &Event, tasks: &task::TaskTable) -> Option<TaskId> {
    if ev.wait_grp != 0 {
        let mut grp = ev.wait_grp;
        while grp != 0 {
            let by = grp.trailing_zeros() as u8;
            let row = ev.wait_tbl[by as usize];
            if row != 0 {
                let bx = row.trailing_zeros() as u8;
                let prio = by * 8 + bx;
                for i in 0..task::MAX_TASKS {
                    if let Some(t) = tasks.get(i) {
                        if t.priority == prio && ev.contains(t) {
                            return Some(i);
                        }
                    }
                }
            }
            grp &= !(1 << by);
        }
        None
    } else {
        ev.wait_list_head()
    }
}

/// Dequeue one waiter, deliver `msg`, clear `pend_bit`, set `pend_stat`,
/// and re-arm it as Ready. Retries if the selected waiter was already
/// removed by a concurrent timeout (the ABA race spec.md §5 describes).
pub fn event_highest_task_ready(
    tbl: &mut EventTable,
    tasks: &mut task::TaskTable,
    ev_id: usize,
    msg: usize,
    pend_bit: u16,
    pend_stat: PendStat,
) -> Option<TaskId> {
    loop {
        let candidate = {
            let ev = tbl.get(ev_id)?;
            event_get_waiter(ev, tasks)?
        };
        let ev = tbl.get_mut(ev_id)?;
        let t = match tasks.get_mut(candidate) {
            Some(t) => t,
            None => continue, // task vanished, retry
        };
        if !event_task_remove(ev, t) {
            // Already removed by a racing timeout; retry with the
            // (now updated) wait set.
            continue;
        }
        t.msg = msg;
        t.state &= !pend_bit;
        t.pend_stat = pend_stat;
        t.wait_event = None;
        let _ = tasks.set_task_ready(candidate);
        return Some(candidate);
    }
}

/// Release every waiter on `ev` with `pend_stat = Aborted` (used by
/// `sem_pend_abort(BROADCAST)` and `OS_DEL_ALWAYS`).
pub fn event_del_always(tbl: &mut EventTable, tasks: &mut task::TaskTable, ev_id: usize) -> usize {
    let mut n = 0;
    while event_highest_task_ready(tbl, tasks, ev_id, 0, task::state::PEND_MASK, PendStat::Aborted).is_some() {
        n += 1;
    }
    if let Some(ev) = tbl.get_mut(ev_id) {
        ev.in_use = false;
    }
    n
}

/// Delete `ev` honoring `opt`: `NoPend` refuses while waiters remain.
pub fn event_delete(tbl: &mut EventTable, tasks: &mut task::TaskTable, ev_id: usize, opt: DelOpt) -> Result<(), KernelError> {
    let has_waiters = {
        let ev = tbl.get(ev_id).ok_or(KernelError::NotFound)?;
        ev.wait_grp != 0 || ev.wait_list_head().is_some()
    };
    match opt {
        DelOpt::NoPend if has_waiters => Err(KernelError::NotPermitted),
        DelOpt::NoPend => {
            tbl.get_mut(ev_id).unwrap().in_use = false;
            Ok(())
        }
        DelOpt::Always => {
            event_del_always(tbl, tasks, ev_id);
            Ok(())
        }
    }
}

/// Per-tick delay decrement: any task blocked on an event with a
/// nonzero `delay` has it decremented; reaching zero times the wait
/// out (`pend_stat = Timeout`, removed from the event, re-armed Ready).
/// Grounded on the classic RTOS `OSTimeTick` sweep the original's
/// task table implies (spec §4.2's timeout field on a pending wait).
pub fn event_tick(tbl: &mut EventTable, tasks: &mut task::TaskTable) {
    for id in 0..task::MAX_TASKS {
        let (ev_id, expired) = match tasks.get_mut(id) {
            Some(t) if t.state & task::state::PEND_MASK != 0 && t.delay > 0 => {
                t.delay -= 1;
                (t.wait_event, t.delay == 0)
            }
            _ => continue,
        };
        if !expired {
            continue;
        }
        if let Some(ev_id) = ev_id {
            if let (Some(ev), Some(t)) = (tbl.get_mut(ev_id), tasks.get_mut(id)) {
                event_task_remove(ev, t);
                t.pend_stat = PendStat::Timeout;
                t.wait_event = None;
                t.state &= !task::state::PEND_MASK;
            }
            let _ = tasks.set_task_ready(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_rt_task(tasks: &mut task::TaskTable, prio: u8) -> TaskId {
        let id = tasks.create_task(prio, Affinity::Any).unwrap();
        id
    }

    #[test]
    fn membership_is_exclusive_or() {
        let mut tbl = EventTable::new();
        let mut tasks = task::TaskTable::new();
        let ev = tbl.alloc(EventType::Sem).unwrap();
        let rt = fresh_rt_task(&mut tasks, 9);
        event_task_wait(&mut tbl, &mut tasks, ev, rt, task::state::SEM, 0).unwrap();
        let t = *tasks.get(rt).unwrap();
        assert!(tbl.get(ev).unwrap().contains(&t));
        let removed = event_task_remove(tbl.get_mut(ev).unwrap(), &t);
        assert!(removed);
        let t = *tasks.get(rt).unwrap();
        assert!(!tbl.get(ev).unwrap().contains(&t));
    }

    #[test]
    fn wait_grp_summarizes_wait_tbl() {
        let mut tbl = EventTable::new();
        let mut tasks = task::TaskTable::new();
        let ev = tbl.alloc(EventType::Sem).unwrap();
        let rt = fresh_rt_task(&mut tasks, 20);
        event_task_wait(&mut tbl, &mut tasks, ev, rt, task::state::SEM, 0).unwrap();
        let e = tbl.get(ev).unwrap();
        for k in 0..8u8 {
            assert_eq!((e.wait_grp >> k) & 1 != 0, e.wait_tbl[k as usize] != 0);
        }
    }

    #[test]
    fn highest_priority_waiter_wakes_first() {
        let mut tbl = EventTable::new();
        let mut tasks = task::TaskTable::new();
        let ev = tbl.alloc(EventType::Sem).unwrap();
        let low = fresh_rt_task(&mut tasks, 30);
        let high = fresh_rt_task(&mut tasks, 4);
        event_task_wait(&mut tbl, &mut tasks, ev, low, task::state::SEM, 0).unwrap();
        event_task_wait(&mut tbl, &mut tasks, ev, high, task::state::SEM, 0).unwrap();
        let woken = event_highest_task_ready(&mut tbl, &mut tasks, ev, 0, task::state::SEM, PendStat::Ok);
        assert_eq!(woken, Some(high));
    }

    #[test]
    fn del_always_aborts_all_waiters() {
        let mut tbl = EventTable::new();
        let mut tasks = task::TaskTable::new();
        let ev = tbl.alloc(EventType::Mbox).unwrap();
        let a = tasks.create_task(task::PRIO_PERCPU, Affinity::Cpu(0)).unwrap();
        event_task_wait(&mut tbl, &mut tasks, ev, a, task::state::MBOX, 0).unwrap();
        let n = event_del_always(&mut tbl, &mut tasks, ev);
        assert_eq!(n, 1);
        assert_eq!(tasks.get(a).unwrap().pend_stat, PendStat::Aborted);
    }
}
