//! Task queue consumed by a fixed pool of worker threads.
//!
//! Work is organised in waves. [`TaskScheduler::run`] starts `num_threads`
//! scoped workers, hands the caller a [`TaskScope`] to submit closures into,
//! and returns once every submitted task (including tasks submitted by other
//! tasks) has finished. Because workers are scoped to the wave, tasks may
//! borrow data owned by the caller, for example disjoint `&mut` subtrees.
//!
//! Tasks never wait on other tasks. Ordering between tasks is expressed by
//! submission order only: a task that must run after some work is submitted
//! by that work.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::errors::{MdError, MdResult};

type Job<'scope> = Box<dyn FnOnce(&TaskScope<'scope>) -> MdResult<()> + Send + 'scope>;

enum Message<'scope> {
    Run(Job<'scope>),
    Shutdown,
}

/// Fixed-size worker pool configuration.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    num_threads: usize,
}

impl TaskScheduler {
    /// A scheduler running `num_threads` workers per wave (at least one).
    pub fn new(num_threads: usize) -> Self {
        Self {
            num_threads: num_threads.max(1),
        }
    }

    /// A scheduler sized by the controller's `num_threads` setting.
    pub fn from_controller(controller: &crate::controller::BoxController) -> Self {
        Self::new(controller.num_threads())
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Runs one wave of tasks.
    ///
    /// `seed` submits the initial tasks. The call blocks until the task graph
    /// drains, then returns the seed's error or else the first task error.
    /// A panicking task is re-raised on the calling thread after the wave.
    pub fn run<'scope, F>(&self, seed: F) -> MdResult<()>
    where
        F: FnOnce(&TaskScope<'scope>) -> MdResult<()>,
    {
        let (sender, receiver) = unbounded();
        let scope = TaskScope {
            sender,
            pending: Mutex::new(0),
            idle: Condvar::new(),
            first_error: Mutex::new(None),
            panic: Mutex::new(None),
            completed: AtomicU64::new(0),
        };

        let seeded = std::thread::scope(|threads| {
            for _ in 0..self.num_threads {
                let receiver = receiver.clone();
                let scope = &scope;
                threads.spawn(move || scope.worker_loop(receiver));
            }

            let seeded = panic::catch_unwind(AssertUnwindSafe(|| seed(&scope)));
            scope.join_all();
            for _ in 0..self.num_threads {
                let _ = scope.sender.send(Message::Shutdown);
            }
            seeded
        });
        let seeded = match seeded {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        };

        let panicked = scope.panic.lock().take();
        if let Some(payload) = panicked {
            panic::resume_unwind(payload);
        }
        log::trace!(
            "Task wave finished: {} tasks on {} workers",
            scope.completed.load(Ordering::Relaxed),
            self.num_threads
        );
        seeded?;
        let first_error = scope.first_error.lock().take();
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        )
    }
}

/// Handle for submitting tasks into a running wave.
pub struct TaskScope<'scope> {
    sender: Sender<Message<'scope>>,
    pending: Mutex<usize>,
    idle: Condvar,
    first_error: Mutex<Option<MdError>>,
    panic: Mutex<Option<Box<dyn Any + Send + 'static>>>,
    completed: AtomicU64,
}

/// Decrements the pending count when a task ends, even by unwinding.
struct PendingGuard<'a, 'scope>(&'a TaskScope<'scope>);

impl Drop for PendingGuard<'_, '_> {
    fn drop(&mut self) {
        let mut pending = self.0.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.0.idle.notify_all();
        }
    }
}

impl<'scope> TaskScope<'scope> {
    /// Queues a task. Tasks may submit further tasks through the scope they
    /// are handed.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce(&TaskScope<'scope>) -> MdResult<()> + Send + 'scope,
    {
        *self.pending.lock() += 1;
        if self.sender.send(Message::Run(Box::new(task))).is_err() {
            log::error!("Task queue closed; dropping submitted task");
            let _guard = PendingGuard(self);
        }
    }

    /// Blocks until no submitted task is queued or running.
    pub fn join_all(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.idle.wait(&mut pending);
        }
    }

    /// Tasks finished so far in this wave.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    fn record_error(&self, err: MdError) {
        log::error!("Task failed: {}", err);
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some(err);
        }
    }

    fn worker_loop(&self, receiver: Receiver<Message<'scope>>) {
        while let Ok(message) = receiver.recv() {
            let job = match message {
                Message::Run(job) => job,
                Message::Shutdown => break,
            };
            let _guard = PendingGuard(self);
            match panic::catch_unwind(AssertUnwindSafe(|| job(self))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => self.record_error(err),
                Err(payload) => {
                    let mut slot = self.panic.lock();
                    if slot.is_none() {
                        *slot = Some(payload);
                    }
                }
            }
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_run_executes_all_tasks() {
        let scheduler = TaskScheduler::new(4);
        let counter = AtomicUsize::new(0);
        scheduler
            .run(|scope| {
                for _ in 0..100 {
                    scope.submit(|_| {
                        counter.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    });
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_tasks_submit_tasks() {
        fn fan_out<'s>(scope: &TaskScope<'s>, depth: u32, counter: &'s AtomicUsize) {
            counter.fetch_add(1, Ordering::Relaxed);
            if depth == 0 {
                return;
            }
            for _ in 0..3 {
                scope.submit(move |scope| {
                    fan_out(scope, depth - 1, counter);
                    Ok(())
                });
            }
        }

        let scheduler = TaskScheduler::new(3);
        let counter = AtomicUsize::new(0);
        scheduler
            .run(|scope| {
                fan_out(scope, 4, &counter);
                Ok(())
            })
            .unwrap();
        // 1 + 3 + 9 + 27 + 81
        assert_eq!(counter.load(Ordering::Relaxed), 121);
    }

    #[test]
    fn test_tasks_borrow_disjoint_slices() {
        let scheduler = TaskScheduler::new(2);
        let mut data = vec![0u64; 64];
        let chunks: Vec<&mut [u64]> = data.chunks_mut(8).collect();
        scheduler
            .run(move |scope| {
                for (i, chunk) in chunks.into_iter().enumerate() {
                    scope.submit(move |_| {
                        chunk.iter_mut().for_each(|v| *v = i as u64);
                        Ok(())
                    });
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(data[0], 0);
        assert_eq!(data[63], 7);
    }

    #[test]
    fn test_first_error_is_returned() {
        let scheduler = TaskScheduler::new(2);
        let counter = AtomicUsize::new(0);
        let result = scheduler.run(|scope| {
            for i in 0..10 {
                let counter = &counter;
                scope.submit(move |_| {
                    counter.fetch_add(1, Ordering::Relaxed);
                    if i == 5 {
                        Err(MdError::Resource("task five".into()))
                    } else {
                        Ok(())
                    }
                });
            }
            Ok(())
        });
        assert!(matches!(result, Err(MdError::Resource(_))));
        // Remaining tasks still ran to completion.
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_seed_error_waits_for_tasks() {
        let scheduler = TaskScheduler::new(2);
        let counter = AtomicUsize::new(0);
        let result = scheduler.run(|scope| {
            scope.submit(|_| {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            });
            Err(MdError::InvalidConfiguration("seed".into()))
        });
        assert!(matches!(result, Err(MdError::InvalidConfiguration(_))));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn test_task_panic_is_propagated() {
        let scheduler = TaskScheduler::new(2);
        let _ = scheduler.run(|scope| {
            scope.submit(|_| panic!("boom"));
            Ok(())
        });
    }

    #[test]
    fn test_zero_threads_clamped() {
        assert_eq!(TaskScheduler::new(0).num_threads(), 1);
    }
}
