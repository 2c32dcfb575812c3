//! Fixed-size pool for the parallel phases of a pause.
//!
//! Each call partitions its task list evenly across the workers, runs the
//! parts on scoped threads and blocks until every worker has drained its
//! share. Nothing persists between calls.

use std::panic;

/// Partitions work across a fixed number of scoped threads.
#[derive(Debug, Clone, Copy)]
pub struct StaticThreadPool {
    threads: usize,
}

impl StaticThreadPool {
    /// Creates a pool running at most `threads` workers (at least one).
    #[must_use]
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    /// Number of workers.
    #[must_use]
    pub const fn threads(&self) -> usize {
        self.threads
    }

    /// Runs `f` on every task and returns the results in task order.
    ///
    /// A panic on any worker is re-raised on the calling thread once every
    /// worker has stopped.
    pub fn run<T, R, F>(&self, tasks: Vec<T>, f: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync,
    {
        if self.threads == 1 || tasks.len() <= 1 {
            return tasks.into_iter().map(f).collect();
        }

        let per_worker = tasks.len().div_ceil(self.threads);
        let mut parts = Vec::with_capacity(self.threads);
        let mut tasks = tasks.into_iter().peekable();
        while tasks.peek().is_some() {
            parts.push(tasks.by_ref().take(per_worker).collect::<Vec<_>>());
        }

        let f = &f;
        let outcome = crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = parts
                .into_iter()
                .map(|part| scope.spawn(move |_| part.into_iter().map(f).collect::<Vec<_>>()))
                .collect();
            let mut results = Vec::new();
            let mut failure = None;
            for handle in handles {
                match handle.join() {
                    Ok(part) => results.extend(part),
                    Err(payload) => failure = failure.or(Some(payload)),
                }
            }
            failure.map_or(Ok(results), Err)
        });
        match outcome {
            Ok(Ok(results)) => results,
            Ok(Err(payload)) | Err(payload) => panic::resume_unwind(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StaticThreadPool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_results_keep_task_order() {
        let pool = StaticThreadPool::new(3);
        let out = pool.run((0..10).collect(), |i: usize| i * 2);
        assert_eq!(out, (0..10).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_every_task_runs_once() {
        let pool = StaticThreadPool::new(4);
        let counter = AtomicUsize::new(0);
        pool.run(vec![(); 101], |()| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 101);
    }

    #[test]
    fn test_zero_threads_means_inline() {
        let pool = StaticThreadPool::new(0);
        assert_eq!(pool.threads(), 1);
        let caller = std::thread::current().id();
        let ids = pool.run(vec![(), ()], |()| std::thread::current().id());
        assert!(ids.iter().all(|&id| id == caller));
    }

    #[test]
    #[should_panic(expected = "task 3 failed")]
    fn test_worker_panic_propagates() {
        let pool = StaticThreadPool::new(2);
        pool.run((0..6).collect(), |i: usize| {
            assert!(i != 3, "task {i} failed");
        });
    }
}
