//! FIFO dispatch loop matching a queue of tasks against idle, eligible nodes
//! (spec.md §4.8).
//!
//! Grounded on `examples/original_source/tubular/scheduler.py` for the
//! queue/condvar/`tasksWaiting` shape, and `gofer/src/scheduler/mod.rs`'s
//! `Scheduler` trait for the "one management loop over external workers" pattern.

use crate::node_connection::NodeConnection;
use crate::run_engine::TaskInstance;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tubular_core::models::NodeStatus;

pub const NODE_UPDATE_PERIOD: Duration = Duration::from_secs(2);
const STARVED_BACKOFF: Duration = Duration::from_secs(1);

pub struct QueuedTask {
    pub instance: Arc<TaskInstance>,
    /// Node names in declaration order (spec.md §4.8 step 4: "scan its
    /// eligibleNodes ... in declaration order").
    pub eligible_nodes: Vec<String>,
}

struct State {
    queue: VecDeque<QueuedTask>,
    tasks_waiting: usize,
    should_run: bool,
}

pub struct Scheduler {
    state: Mutex<State>,
    cv: Condvar,
    nodes: RwLock<HashMap<String, Arc<NodeConnection>>>,
    last_node_refresh: Mutex<Option<Instant>>,
}

impl Scheduler {
    pub fn new(nodes: HashMap<String, Arc<NodeConnection>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                tasks_waiting: 0,
                should_run: true,
            }),
            cv: Condvar::new(),
            nodes: RwLock::new(nodes),
            last_node_refresh: Mutex::new(None),
        })
    }

    pub fn nodes(&self) -> HashMap<String, Arc<NodeConnection>> {
        self.nodes.read().expect("node table poisoned").clone()
    }

    /// Swaps in a new node table wholesale (spec.md §4.11 "new node table").
    pub fn set_nodes(&self, nodes: HashMap<String, Arc<NodeConnection>>) {
        *self.nodes.write().expect("node table poisoned") = nodes;
    }

    /// Enqueues `task`, increments `tasksWaiting`, and wakes the dispatch loop
    /// (spec.md §4.9 step 9a).
    pub fn push(&self, task: QueuedTask) {
        let mut state = self.state.lock().expect("scheduler state poisoned");
        state.queue.push_back(task);
        state.tasks_waiting += 1;
        drop(state);
        self.cv.notify_all();
    }

    /// Decrements `tasksWaiting` when a dispatched task finishes, and wakes the
    /// dispatch loop so it can re-evaluate idleness (spec.md §4.8 "notify() is
    /// signalled after push() and after a task completes").
    pub fn task_completed(&self) {
        let mut state = self.state.lock().expect("scheduler state poisoned");
        state.tasks_waiting = state.tasks_waiting.saturating_sub(1);
        drop(state);
        self.cv.notify_all();
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("scheduler state poisoned");
        state.should_run = false;
        drop(state);
        self.cv.notify_all();
    }

    /// The single management thread's loop body (spec.md §4.8).
    pub fn run_loop(self: Arc<Self>) {
        loop {
            let mut state = self.state.lock().expect("scheduler state poisoned");
            while state.queue.is_empty() && state.tasks_waiting == 0 && state.should_run {
                state = self.cv.wait(state).expect("scheduler state poisoned");
            }
            if !state.should_run {
                info!("scheduler shutting down");
                return;
            }

            if state.queue.is_empty() {
                // A task is in flight but there is nothing to dispatch: wait for a
                // wakeup (push/task_completed) or the next node-status poll instead
                // of busy-spinning for the duration of every in-flight task.
                let (_state, _timeout) = self
                    .cv
                    .wait_timeout(state, NODE_UPDATE_PERIOD)
                    .expect("scheduler state poisoned");
            } else {
                drop(state);
            }

            self.maybe_refresh_nodes();
            self.dispatch_pass();

            let queue_nonempty = {
                let state = self.state.lock().expect("scheduler state poisoned");
                !state.queue.is_empty()
            };
            if queue_nonempty {
                std::thread::sleep(STARVED_BACKOFF);
            }
        }
    }

    fn maybe_refresh_nodes(&self) {
        let mut last = self.last_node_refresh.lock().expect("refresh timer poisoned");
        let due = last.map(|t| t.elapsed() >= NODE_UPDATE_PERIOD).unwrap_or(true);
        if !due {
            return;
        }
        *last = Some(Instant::now());
        drop(last);

        for node in self.nodes.read().expect("node table poisoned").values() {
            node.update_status(false);
        }
    }

    /// Walks the queue head to tail once, dispatching every task whose eligible
    /// set currently has an idle node (spec.md §4.8 step 4).
    fn dispatch_pass(&self) {
        let nodes = self.nodes.read().expect("node table poisoned").clone();
        let mut state = self.state.lock().expect("scheduler state poisoned");
        let mut remaining = VecDeque::with_capacity(state.queue.len());

        while let Some(task) = state.queue.pop_front() {
            let idle_node = task
                .eligible_nodes
                .iter()
                .find_map(|name| nodes.get(name).filter(|n| n.status() == NodeStatus::Idle));

            match idle_node {
                Some(node) => match node.send_task(Arc::clone(&task.instance)) {
                    Ok(()) => debug!(node = %node.name, "dispatched task"),
                    Err(err) => {
                        warn!(node = %node.name, error = %err, "dispatch failed, leaving task queued");
                        remaining.push_back(task);
                    }
                },
                None => remaining.push_back(task),
            }
        }

        state.queue = remaining;
    }
}
