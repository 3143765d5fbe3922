//! Per-family task queues. A queue is a capacity-bounded, key-unique multiset
//! guarded by one mutex. Behavior is customized with two function values: the
//! retire strategy decides whether a resident task may be evicted to make
//! room (and may mutate it instead, e.g. resetting a gc task), the filter
//! strategy decides whether a resident task is eligible to be handed out.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::rcmgr::ScopeStat;
use crate::task::{Task, TaskKey};

pub type RetireStrategy = Box<dyn Fn(&mut Task) -> bool + Send + Sync>;
pub type FilterStrategy = Box<dyn Fn(&Task) -> bool + Send + Sync>;

struct Inner {
    tasks: VecDeque<Task>,
    retire: Option<RetireStrategy>,
    filter: Option<FilterStrategy>,
}

pub struct TaskQueue {
    name: String,
    cap: usize,
    inner: Mutex<Inner>,
}

impl TaskQueue {
    pub fn new(name: &str, cap: usize) -> Self {
        TaskQueue {
            name: name.to_string(),
            cap,
            inner: Mutex::new(Inner {
                tasks: VecDeque::new(),
                retire: None,
                filter: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_retire_task_strategy(&self, strategy: RetireStrategy) {
        self.inner.lock().unwrap().retire = Some(strategy);
    }

    pub fn set_filter_task_strategy(&self, strategy: FilterStrategy) {
        self.inner.lock().unwrap().filter = Some(strategy);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .iter()
            .any(|t| t.key() == key)
    }

    /// Inserts the task. A resident task with the same key blocks the push
    /// unless the retire strategy evicts it (an expired instance makes way
    /// for its replacement). When the queue is full, the retire strategy is
    /// offered every resident task until one evicts; if none does, the push
    /// fails with `QueueFull`.
    pub fn push(&self, task: Task) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = task.key();
        if let Some(idx) = inner.tasks.iter().position(|t| t.key() == key) {
            let Some(retire) = inner.retire.take() else {
                return Err(Error::TaskRepeated);
            };
            let evict = retire(&mut inner.tasks[idx]);
            inner.retire = Some(retire);
            if !evict {
                return Err(Error::TaskRepeated);
            }
            inner.tasks.remove(idx);
        }
        if inner.tasks.len() >= self.cap {
            let Some(retire) = inner.retire.take() else {
                return Err(Error::QueueFull);
            };
            let mut victim = None;
            for (idx, resident) in inner.tasks.iter_mut().enumerate() {
                if retire(resident) {
                    victim = Some(idx);
                    break;
                }
            }
            inner.retire = Some(retire);
            match victim {
                Some(idx) => {
                    inner.tasks.remove(idx);
                }
                None => return Err(Error::QueueFull),
            }
        }
        inner.tasks.push_back(task);
        Ok(())
    }

    pub fn pop(&self) -> Option<Task> {
        self.inner.lock().unwrap().tasks.pop_front()
    }

    pub fn pop_by_key(&self, key: &str) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.tasks.iter().position(|t| t.key() == key)?;
        inner.tasks.remove(idx)
    }

    /// Removes and returns the first task that fits the limit and passes the
    /// filter, in FIFO order.
    pub fn pop_by_limit(&self, limit: &ScopeStat) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        let idx = Self::position_by_limit(&inner, limit)?;
        inner.tasks.remove(idx)
    }

    /// Like `pop_by_limit` but returns a clone and leaves the task queued;
    /// the scheduler uses it to gather pick candidates across queues.
    pub fn top_by_limit(&self, limit: &ScopeStat) -> Option<Task> {
        let inner = self.inner.lock().unwrap();
        let idx = Self::position_by_limit(&inner, limit)?;
        Some(inner.tasks[idx].clone())
    }

    /// Applies `mutate` to the queued task with this key and returns the
    /// updated clone.
    pub fn update_by_key(&self, key: &str, mutate: impl FnOnce(&mut Task)) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner.tasks.iter_mut().find(|t| t.key() == key)?;
        mutate(task);
        Some(task.clone())
    }

    fn position_by_limit(inner: &Inner, limit: &ScopeStat) -> Option<usize> {
        inner.tasks.iter().position(|t| {
            if !t.estimate_limit().fits_in(limit) {
                return false;
            }
            match &inner.filter {
                Some(filter) => filter(t),
                None => true,
            }
        })
    }
}
