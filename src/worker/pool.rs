//! Worker Pool: a bounded set of OS threads draining a FIFO
//! run-queue of `(user, connection, runnable)` triples.
//!
//! Workers are spawned lazily, up to `max_workers`, as work arrives;
//! once spawned they stay parked on the queue for the life of the pool.
//! `execute` never blocks the caller — it always queues and returns.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Work submitted to the pool: who asked, which connection it's on, and
/// the runnable itself.
pub struct Command {
    pub user: String,
    pub connection: u64,
    pub runnable: Box<dyn FnOnce() + Send + 'static>,
}

struct Shared {
    accepting: AtomicBool,
    spawned: AtomicUsize,
    active: AtomicUsize,
    quiet: Condvar,
    quiet_lock: Mutex<()>,
    /// Parks workers while `accepting` is false, so a paused pool never
    /// pulls a command off the channel just to sit on it — the command
    /// stays queued until dispatch resumes.
    paused: Condvar,
    paused_lock: Mutex<()>,
    /// Set only by `shutdown`, to wake a paused worker so it can exit
    /// instead of waiting on `accepting` forever.
    closing: AtomicBool,
}

/// Bounded thread pool draining an unbounded FIFO queue.
pub struct WorkerPool {
    max_workers: usize,
    sender: Mutex<Option<Sender<Command>>>,
    receiver: Receiver<Command>,
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Arc<Self> {
        let (sender, receiver) = channel::unbounded();
        Arc::new(Self {
            max_workers: max_workers.max(1),
            sender: Mutex::new(Some(sender)),
            receiver,
            shared: Arc::new(Shared {
                accepting: AtomicBool::new(true),
                spawned: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                quiet: Condvar::new(),
                quiet_lock: Mutex::new(()),
                paused: Condvar::new(),
                paused_lock: Mutex::new(()),
                closing: AtomicBool::new(false),
            }),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Dispatches `runnable` for `user` on `connection`. Spawns a new
    /// worker thread if fewer than `max_workers` exist yet; otherwise the
    /// command waits in queue for an existing worker. A no-op once the
    /// pool has been shut down.
    pub fn execute(self: &Arc<Self>, user: impl Into<String>, connection: u64, runnable: impl FnOnce() + Send + 'static) {
        let command = Command {
            user: user.into(),
            connection,
            runnable: Box::new(runnable),
        };
        tracing::trace!(connection, queue_depth = self.receiver.len(), "worker dispatch");
        self.maybe_spawn_worker();
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(command);
        }
    }

    fn maybe_spawn_worker(self: &Arc<Self>) {
        loop {
            let current = self.shared.spawned.load(Ordering::SeqCst);
            if current >= self.max_workers {
                return;
            }
            if self
                .shared
                .spawned
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.spawn_worker();
                return;
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let receiver = self.receiver.clone();
        let shared = self.shared.clone();
        let handle = std::thread::spawn(move || {
            loop {
                if shared.closing.load(Ordering::SeqCst) {
                    break;
                }
                if !shared.accepting.load(Ordering::SeqCst) {
                    let mut guard = shared.paused_lock.lock();
                    while !shared.accepting.load(Ordering::SeqCst) && !shared.closing.load(Ordering::SeqCst) {
                        shared.paused.wait(&mut guard);
                    }
                    continue;
                }
                let command = match receiver.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                };
                shared.active.fetch_add(1, Ordering::SeqCst);
                (command.runnable)();
                shared.active.fetch_sub(1, Ordering::SeqCst);
                if shared.active.load(Ordering::SeqCst) == 0 {
                    let _guard = shared.quiet_lock.lock();
                    shared.quiet.notify_all();
                }
            }
        });
        self.handles.lock().push(handle);
    }

    /// Gates dispatch without discarding what's already queued: `false`
    /// stops workers from picking up new commands; `true` resumes them.
    pub fn set_is_executing_commands(&self, executing: bool) {
        self.shared.accepting.store(executing, Ordering::SeqCst);
        if executing {
            let _guard = self.shared.paused_lock.lock();
            self.shared.paused.notify_all();
        }
    }

    /// Blocks until no worker is mid-runnable. Must not be called from a
    /// worker thread of this same pool — it would never return.
    pub fn wait_until_all_workers_quiet(&self) {
        let mut guard = self.shared.quiet_lock.lock();
        while self.shared.active.load(Ordering::SeqCst) != 0 {
            self.shared.quiet.wait(&mut guard);
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.receiver.len()
    }

    pub fn worker_count(&self) -> usize {
        self.shared.spawned.load(Ordering::SeqCst)
    }

    /// Stops accepting new work and joins every spawned worker. Dropping
    /// the pool's sender closes the channel once every worker's `recv`
    /// drains the backlog, which is what actually lets them exit.
    /// Commands still in the queue when this runs are never executed.
    pub fn shutdown(&self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.shared.closing.store(true, Ordering::SeqCst);
        self.sender.lock().take();
        {
            let _guard = self.shared.paused_lock.lock();
            self.shared.paused.notify_all();
        }
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
        tracing::debug!("worker pool shutdown complete");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn execute_runs_the_runnable() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(Counter::new(0));
        let c = counter.clone();
        pool.execute("alice", 1, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        pool.wait_until_all_workers_quiet();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn never_spawns_more_than_max_workers() {
        let pool = WorkerPool::new(2);
        let barrier = Arc::new(Barrier::new(3));
        for _ in 0..5 {
            let b = barrier.clone();
            pool.execute("u", 1, move || {
                if b.wait().is_leader() {
                    std::thread::sleep(Duration::from_millis(10));
                }
            });
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(pool.worker_count() <= 2);
        pool.wait_until_all_workers_quiet();
    }

    #[test]
    fn set_is_executing_commands_false_pauses_dispatch() {
        let pool = WorkerPool::new(1);
        pool.set_is_executing_commands(false);
        let counter = Arc::new(Counter::new(0));
        let c = counter.clone();
        pool.execute("u", 1, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 0, "still queued, not executed");
        assert_eq!(pool.queue_depth(), 1);

        pool.set_is_executing_commands(true);
        pool.execute("u", 1, || {});
        pool.wait_until_all_workers_quiet();
    }

    #[test]
    fn shutdown_joins_workers() {
        let pool = WorkerPool::new(2);
        pool.execute("u", 1, || {});
        pool.wait_until_all_workers_quiet();
        pool.shutdown();
        assert!(pool.handles.lock().is_empty());
    }
}
