//! Simple round-robin vCPU scheduler

use crate::vm::MAX_VCPUS;

/// Run state for a vCPU in the scheduler
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum RunState {
    /// vCPU is not registered
    None,
    /// vCPU is ready to run
    Ready,
    /// vCPU is currently running
    Running,
    /// vCPU is blocked (e.g., waiting for I/O)
    Blocked,
}

/// Simple round-robin scheduler for vCPUs
pub struct Scheduler {
    /// Run state for each vCPU slot
    states: [RunState; MAX_VCPUS],
    /// Currently running vCPU (if any)
    current: Option<usize>,
    /// Next index to check in round-robin
    next_idx: usize,
}

impl Scheduler {
    /// Create a new scheduler
    pub const fn new() -> Self {
        Self {
            states: [RunState::None; MAX_VCPUS],
            current: None,
            next_idx: 0,
        }
    }

    /// Add a vCPU to the scheduler
    pub fn add_vcpu(&mut self, vcpu_id: usize) {
        if vcpu_id < MAX_VCPUS {
            self.states[vcpu_id] = RunState::Ready;
        }
    }

    /// Remove a vCPU from the scheduler
    pub fn remove_vcpu(&mut self, vcpu_id: usize) {
        if vcpu_id < MAX_VCPUS {
            self.states[vcpu_id] = RunState::None;
            if self.current == Some(vcpu_id) {
                self.current = None;
            }
        }
    }

    /// Pick the next vCPU to run (round-robin)
    ///
    /// If a vCPU is already running, returns it.
    /// Otherwise, finds the next ready vCPU starting from next_idx.
    pub fn pick_next(&mut self) -> Option<usize> {
        // If current is still running, return it
        if let Some(id) = self.current {
            if self.states[id] == RunState::Running {
                return self.current;
            }
        }

        // Find next ready vCPU
        for i in 0..MAX_VCPUS {
            let idx = (self.next_idx + i) % MAX_VCPUS;
            if self.states[idx] == RunState::Ready {
                self.current = Some(idx);
                self.states[idx] = RunState::Running;
                return Some(idx);
            }
        }

        None
    }

    /// Yield the current vCPU (put back in ready queue)
    pub fn yield_current(&mut self) {
        if let Some(id) = self.current {
            self.states[id] = RunState::Ready;
            self.current = None;
            self.next_idx = (id + 1) % MAX_VCPUS;
        }
    }

    /// Block the current vCPU (e.g., waiting for I/O)
    pub fn block_current(&mut self) {
        if let Some(id) = self.current {
            self.states[id] = RunState::Blocked;
            self.current = None;
            self.next_idx = (id + 1) % MAX_VCPUS;
        }
    }

    /// Unblock a vCPU (make it ready again)
    pub fn unblock(&mut self, vcpu_id: usize) {
        if vcpu_id < MAX_VCPUS && self.states[vcpu_id] == RunState::Blocked {
            self.states[vcpu_id] = RunState::Ready;
        }
    }

    /// Get the currently running vCPU (if any)
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Get the run state of a vCPU
    pub fn state(&self, vcpu_id: usize) -> RunState {
        if vcpu_id < MAX_VCPUS {
            self.states[vcpu_id]
        } else {
            RunState::None
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ── Realtime + per-CPU task scheduling ─────────────────────────────
//
// The round-robin `Scheduler` above multiplexes a single VM's vCPUs.
// The functions below implement the kernel-wide scheduling decision
// over `task::TASK_TABLE`: realtime tasks (priority-indexed, any CPU)
// take precedence over each physical CPU's own per-CPU round-robin
// list, which takes precedence over idling. This is what internal
// kernel tasks (synchronization waiters, the SMP-call drain path, the
// VMCS ack wait) block and wake through; it is independent of, and
// sits below, the vCPU-level `Scheduler` above.

use crate::task::{self, Affinity, TaskId};

/// Run the scheduling decision for `cpu`: highest-priority ready
/// realtime task whose affinity matches this CPU, else the head of the
/// CPU's per-CPU ready list, else `None` (idle).
pub fn sched(cpu: usize) -> Option<TaskId> {
    let mut tbl = task::TASK_TABLE.lock();
    if let Some(id) = tbl.get_highest_task(cpu) {
        return Some(id);
    }
    tbl.pick_percpu(cpu)
}

/// Wake a task: mark it Ready and clear the pend bits the caller
/// specifies (the synchronization primitive has already validated that
/// the wait actually completed).
pub fn set_task_ready(id: TaskId) -> crate::error::KernelResult<()> {
    task::TASK_TABLE.lock().set_task_ready(id)
}

/// Register a new kernel task with the given priority/affinity and
/// leave it not-ready (caller arms it with `set_task_ready`).
pub fn spawn_task(priority: u8, affinity: Affinity) -> crate::error::KernelResult<TaskId> {
    task::TASK_TABLE.lock().create_task(priority, affinity)
}

#[cfg(test)]
mod rt_sched_tests {
    use super::*;
    use crate::task::PRIO_PERCPU;

    #[test]
    fn realtime_beats_percpu_on_matching_cpu() {
        let rt = spawn_task(2, Affinity::Any).unwrap();
        let pc = spawn_task(PRIO_PERCPU, Affinity::Cpu(0)).unwrap();
        set_task_ready(pc).unwrap();
        set_task_ready(rt).unwrap();
        assert_eq!(sched(0), Some(rt));
        task::TASK_TABLE.lock().destroy_task(rt);
        task::TASK_TABLE.lock().destroy_task(pc);
    }

    /// A task parked waiting for an event (the kernel-task analogue of
    /// a vCPU in WFI) is invisible to the scheduler until something
    /// wakes it, at which point it becomes the next thing picked for
    /// its CPU — same shape as a virq pulling a vCPU out of WFI.
    #[test]
    fn parked_task_is_unscheduled_until_woken() {
        use crate::event::EventTable;
        use crate::sem;
        use crate::task::{Affinity as A, TaskTable};

        let mut tbl = EventTable::new();
        let mut tasks = TaskTable::new();
        let s = sem::sem_create(&mut tbl, 0).unwrap();
        let waiter = tasks.create_task(5, A::Cpu(1)).unwrap();

        assert_eq!(
            sem::sem_pend(&mut tbl, &mut tasks, s, waiter, 0).unwrap(),
            crate::mutex::PendOutcome::Blocked,
        );
        assert_eq!(tasks.get_highest_task(1), None);

        sem::sem_post(&mut tbl, &mut tasks, s).unwrap();
        assert_eq!(tasks.get_highest_task(1), Some(waiter));
    }
}
