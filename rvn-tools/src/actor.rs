//! A single threaded task actor.
//!
//! The actor processes tasks against one resource in FIFO order on a
//! dedicated worker thread. Callers get a [`TaskHandle`] future per task;
//! task failures resolve the handle and never terminate the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use anyhow::Error;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use futures::channel::oneshot;

/// Default bound used by [`Actor::send_blocking`].
const DEFAULT_QUEUE_LIMIT: usize = 1024;

/// Error resolved into a [`TaskHandle`] whose task was cancelled before it
/// ran, or whose actor went away.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("task cancelled")]
pub struct Cancelled;

/// Lifecycle notifications fired in the worker thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActorEvent<K: Clone> {
    /// The worker picked up a task.
    TaskReceived(K),
    /// A task finished (successfully, with an error, or cancelled).
    TaskCompleted(K),
    /// First task after idle.
    Busy(K),
    /// Transition back to idle, carrying the key of the last task.
    Waiting(K),
}

type BoxedTask = Box<dyn FnOnce() + Send + 'static>;
type EventHandler<K> = Box<dyn Fn(&ActorEvent<K>) + Send + 'static>;

enum Envelope<K> {
    Task { key: K, run: BoxedTask },
    Flush { done: oneshot::Sender<()> },
}

struct Shared<K: Clone> {
    pending: Mutex<usize>,
    drained: Condvar,
    queue_limit: usize,
    handlers: Mutex<Vec<EventHandler<K>>>,
}

impl<K: Clone> Shared<K> {
    fn fire(&self, event: ActorEvent<K>) {
        for handler in self.handlers.lock().unwrap().iter() {
            handler(&event);
        }
    }
}

/// Future-like result of [`Actor::send`].
pub struct TaskHandle<T> {
    receiver: oneshot::Receiver<Result<T, Error>>,
    cancelled: Arc<AtomicBool>,
}

impl<T> TaskHandle<T> {
    /// Request cancellation. If the task has not started yet it will resolve
    /// with [`Cancelled`]; a task that already ran is unaffected.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Block until the task has run and return its result.
    pub fn wait(self) -> Result<T, Error> {
        match futures::executor::block_on(self.receiver) {
            Ok(result) => result,
            Err(oneshot::Canceled) => Err(Cancelled.into()),
        }
    }
}

impl<T> std::future::Future for TaskHandle<T> {
    type Output = Result<T, Error>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.receiver)
            .poll(cx)
            .map(|res| match res {
                Ok(result) => result,
                Err(oneshot::Canceled) => Err(Cancelled.into()),
            })
    }
}

/// Single threaded per-resource task queue.
pub struct Actor<K: Clone + Send + 'static> {
    sender: Sender<Envelope<K>>,
    shared: Arc<Shared<K>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl<K: Clone + Send + 'static> Actor<K> {
    pub fn new() -> Self {
        Self::with_queue_limit(DEFAULT_QUEUE_LIMIT)
    }

    /// Create an actor whose `send_blocking` blocks once `queue_limit` tasks
    /// are outstanding.
    pub fn with_queue_limit(queue_limit: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            pending: Mutex::new(0),
            drained: Condvar::new(),
            queue_limit,
            handlers: Mutex::new(Vec::new()),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::spawn(move || worker_main(receiver, worker_shared));

        Self {
            sender,
            shared,
            worker: Some(worker),
        }
    }

    /// Register an event handler. Handlers run in the worker thread.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&ActorEvent<K>) + Send + 'static,
    {
        self.shared.handlers.lock().unwrap().push(Box::new(handler));
    }

    /// Enqueue `task` and return a handle resolving to its result.
    pub fn send<T, F>(&self, key: K, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&cancelled);
        let run: BoxedTask = Box::new(move || {
            let result = if flag.load(Ordering::Acquire) {
                Err(Cancelled.into())
            } else {
                task()
            };
            let _ = result_tx.send(result);
        });

        *self.shared.pending.lock().unwrap() += 1;
        if self.sender.send(Envelope::Task { key, run }).is_err() {
            // worker gone, handle resolves with Cancelled
            let mut pending = self.shared.pending.lock().unwrap();
            *pending = pending.saturating_sub(1);
        }

        TaskHandle {
            receiver: result_rx,
            cancelled,
        }
    }

    /// Back-pressured variant of [`send`](Self::send): blocks while the
    /// number of outstanding tasks is at the queue limit.
    pub fn send_blocking<T, F>(&self, key: K, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        let mut pending = self.shared.pending.lock().unwrap();
        while *pending >= self.shared.queue_limit {
            pending = self.shared.drained.wait(pending).unwrap();
        }
        drop(pending);

        self.send(key, task)
    }

    /// Block until every previously enqueued task has finished.
    pub fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.sender.send(Envelope::Flush { done: done_tx }).is_err() {
            return;
        }
        let _ = futures::executor::block_on(done_rx);
    }
}

impl<K: Clone + Send + 'static> Default for Actor<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Send + 'static> Drop for Actor<K> {
    fn drop(&mut self) {
        // closing the channel lets the worker run the remaining queue and exit
        let (closed_tx, _closed_rx) = crossbeam_channel::unbounded();
        let _ = std::mem::replace(&mut self.sender, closed_tx);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_main<K: Clone + Send + 'static>(receiver: Receiver<Envelope<K>>, shared: Arc<Shared<K>>) {
    let mut idle = true;
    let mut last_key: Option<K> = None;

    loop {
        let envelope = if idle {
            match receiver.recv() {
                Ok(envelope) => envelope,
                Err(_) => break,
            }
        } else {
            match receiver.try_recv() {
                Ok(envelope) => envelope,
                Err(TryRecvError::Empty) => {
                    if let Some(key) = last_key.clone() {
                        shared.fire(ActorEvent::Waiting(key));
                    }
                    idle = true;
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
            }
        };

        match envelope {
            Envelope::Task { key, run } => {
                if idle {
                    shared.fire(ActorEvent::Busy(key.clone()));
                    idle = false;
                }
                shared.fire(ActorEvent::TaskReceived(key.clone()));

                run();

                shared.fire(ActorEvent::TaskCompleted(key.clone()));
                last_key = Some(key);

                let mut pending = shared.pending.lock().unwrap();
                *pending = pending.saturating_sub(1);
                shared.drained.notify_all();
            }
            Envelope::Flush { done } => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tasks_run_in_fifo_order() {
        let actor: Actor<&'static str> = Actor::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..16 {
            let order = Arc::clone(&order);
            handles.push(actor.send("res", move || {
                order.lock().unwrap().push(i);
                Ok(())
            }));
        }
        actor.flush();

        assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
        for handle in handles {
            handle.wait().unwrap();
        }
    }

    #[test]
    fn failures_do_not_kill_the_worker() {
        let actor: Actor<u32> = Actor::new();

        let failed = actor.send(1, || -> Result<(), Error> {
            anyhow::bail!("boom");
        });
        let ok = actor.send(1, || Ok(42u32));

        assert!(failed.wait().is_err());
        assert_eq!(ok.wait().unwrap(), 42);
    }

    #[test]
    fn cancelled_task_resolves_with_cancelled() {
        let actor: Actor<u32> = Actor::new();

        // hold the worker so the second task is still queued when cancelled
        let gate = Arc::new(Mutex::new(()));
        let guard = gate.lock().unwrap();
        let gate2 = Arc::clone(&gate);
        let _blocker = actor.send(1, move || {
            drop(gate2.lock().unwrap());
            Ok(())
        });

        let victim = actor.send(1, || Ok(7u32));
        victim.cancel();
        drop(guard);

        let err = victim.wait().unwrap_err();
        assert!(err.downcast_ref::<Cancelled>().is_some());
    }

    #[test]
    fn send_blocking_applies_backpressure() {
        let actor: Actor<u32> = Actor::with_queue_limit(2);

        // park the worker so the queue can fill up
        let gate = Arc::new(Mutex::new(()));
        let guard = gate.lock().unwrap();
        let gate2 = Arc::clone(&gate);
        let _blocker = actor.send(0, move || {
            drop(gate2.lock().unwrap());
            Ok(())
        });
        let _queued = actor.send(0, || Ok(()));

        // the queue is at its limit; a blocking send must wait for a slot
        let actor = Arc::new(actor);
        let sender = Arc::clone(&actor);
        let waiter = std::thread::spawn(move || sender.send_blocking(0, || Ok(7u32)).wait());

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!waiter.is_finished());

        drop(guard);
        assert_eq!(waiter.join().unwrap().unwrap(), 7);
    }

    #[test]
    fn events_fire_busy_and_waiting() {
        let actor: Actor<&'static str> = Actor::new();
        let counts = Arc::new((
            AtomicUsize::new(0), // received
            AtomicUsize::new(0), // completed
            AtomicUsize::new(0), // busy
        ));
        let seen = Arc::clone(&counts);
        actor.subscribe(move |event| match event {
            ActorEvent::TaskReceived(_) => {
                seen.0.fetch_add(1, Ordering::SeqCst);
            }
            ActorEvent::TaskCompleted(_) => {
                seen.1.fetch_add(1, Ordering::SeqCst);
            }
            ActorEvent::Busy(_) => {
                seen.2.fetch_add(1, Ordering::SeqCst);
            }
            ActorEvent::Waiting(_) => {}
        });

        actor.send("k", || Ok(())).wait().unwrap();
        actor.flush();

        assert_eq!(counts.0.load(Ordering::SeqCst), 1);
        assert_eq!(counts.1.load(Ordering::SeqCst), 1);
        assert_eq!(counts.2.load(Ordering::SeqCst), 1);
    }
}
