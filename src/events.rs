//! Change notification and background work.
//!
//! [`Emitter`] is a subscription registry. Dropping the returned
//! [`Subscription`] detaches the listener, and `has_observers` lets an owner
//! skip optional work nobody would see.
//!
//! [`TaskQueue`] is a priority-ordered task list drained by one worker.
//! Background tasks only run when no higher-priority task is waiting.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

pub struct Emitter<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().expect("emitter lock poisoned");
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.push((id, Arc::new(listener)));
        drop(registry);

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry
                        .lock()
                        .expect("emitter lock poisoned")
                        .listeners
                        .retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Call every listener. Listeners run outside the registry lock, so they
    /// may subscribe or unsubscribe.
    pub fn emit(&self, event: &T) {
        let listeners: Vec<Listener<T>> = self
            .registry
            .lock()
            .expect("emitter lock poisoned")
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn has_observers(&self) -> bool {
        !self
            .registry
            .lock()
            .expect("emitter lock poisoned")
            .listeners
            .is_empty()
    }

    pub fn clear(&self) {
        self.registry
            .lock()
            .expect("emitter lock poisoned")
            .listeners
            .clear();
    }
}

/// Handle that detaches its listener on drop.
#[must_use = "dropping a Subscription detaches the listener"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Keep the listener attached for the emitter's lifetime.
    pub fn forget(mut self) {
        self.detach = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Background = 0,
    Normal = 1,
    High = 2,
}

type Task = Box<dyn FnOnce() + Send>;

struct QueuedTask {
    priority: Priority,
    seq: u64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // Max-heap: higher priority first, then FIFO.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub struct TaskQueue {
    heap: Mutex<(u64, BinaryHeap<QueuedTask>)>,
    wake: Notify,
}

impl TaskQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push<F>(&self, priority: Priority, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut guard = self.heap.lock().expect("task queue lock poisoned");
            let seq = guard.0;
            guard.0 += 1;
            guard.1.push(QueuedTask {
                priority,
                seq,
                task: Box::new(task),
            });
        }
        self.wake.notify_one();
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("task queue lock poisoned").1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the highest-priority task. Returns false if the queue was empty.
    pub fn run_next(&self) -> bool {
        let next = self.heap.lock().expect("task queue lock poisoned").1.pop();
        match next {
            Some(queued) => {
                (queued.task)();
                true
            }
            None => false,
        }
    }

    /// Run tasks until the queue is empty, including tasks queued meanwhile.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }

    /// Drain the queue on a tokio task until `cancel` fires.
    ///
    /// Wakes on every push, and at least every `idle_tick`.
    pub fn spawn_worker(
        self: &Arc<Self>,
        idle_tick: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                queue.run_until_idle();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = queue.wake.notified() => {}
                    _ = tokio::time::sleep(idle_tick) => {}
                }
            }
            queue.run_until_idle();
        })
    }
}
