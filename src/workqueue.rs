use std::sync::{Arc, Condvar, Mutex};

use crossbeam_channel::{bounded, Sender};
use log::error;
use threadpool::ThreadPool;

/// A bounded worker pool.
///
/// Work items travel through a bounded channel into a fixed set of pool
/// workers, so `enqueue` blocks once the backlog is full. `wait_completion`
/// blocks until everything enqueued so far has been worked.
pub struct WorkQueue<T: Send + 'static> {
    name: &'static str,
    sender: Mutex<Option<Sender<T>>>,
    pool: ThreadPool,
    pending: Arc<(Mutex<usize>, Condvar)>,
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn new<F>(name: &'static str, threads: usize, depth: usize, handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let threads = threads.max(1);
        let (tx, rx) = bounded::<T>(depth.max(1));
        let pool = ThreadPool::with_name(name.to_string(), threads);
        let pending = Arc::new((Mutex::new(0usize), Condvar::new()));
        let handler = Arc::new(handler);

        for _ in 0..threads {
            let rx = rx.clone();
            let handler = Arc::clone(&handler);
            let pending = Arc::clone(&pending);
            pool.execute(move || {
                while let Ok(item) = rx.recv() {
                    handler(item);

                    let (count, cv) = &*pending;
                    let mut count = count.lock().expect("work queue counter poisoned");
                    *count -= 1;
                    cv.notify_all();
                }
            });
        }

        WorkQueue {
            name,
            sender: Mutex::new(Some(tx)),
            pool,
            pending,
        }
    }

    /// Hands an item to the pool; blocks while the backlog is full.
    pub fn enqueue(&self, item: T) {
        {
            let (count, _) = &*self.pending;
            *count.lock().expect("work queue counter poisoned") += 1;
        }

        let sender = self.sender.lock().expect("work queue sender poisoned");
        let sent = match sender.as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        };

        if !sent {
            error!("{}: dropped item, worker queue already shut down", self.name);
            let (count, cv) = &*self.pending;
            *count.lock().expect("work queue counter poisoned") -= 1;
            cv.notify_all();
        }
    }

    /// Blocks until all enqueued items have been worked.
    pub fn wait_completion(&self) {
        let (count, cv) = &*self.pending;
        let mut count = count.lock().expect("work queue counter poisoned");
        while *count > 0 {
            count = cv.wait(count).expect("work queue counter poisoned");
        }
    }

    /// Stops accepting work and joins the workers.
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .expect("work queue sender poisoned")
            .take();
        self.pool.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_all_items_are_worked() {
        let worked = Arc::new(AtomicUsize::new(0));
        let worked_clone = Arc::clone(&worked);

        let queue = WorkQueue::new("test-wq", 4, 8, move |_item: usize| {
            worked_clone.fetch_add(1, Ordering::SeqCst);
        });

        for item in 0..100 {
            queue.enqueue(item);
        }
        queue.wait_completion();

        assert_eq!(worked.load(Ordering::SeqCst), 100);
        queue.shutdown();
    }

    #[test]
    fn test_wait_completion_waits_for_slow_work() {
        let worked = Arc::new(AtomicUsize::new(0));
        let worked_clone = Arc::clone(&worked);

        let queue = WorkQueue::new("slow-wq", 2, 2, move |_item: usize| {
            std::thread::sleep(Duration::from_millis(20));
            worked_clone.fetch_add(1, Ordering::SeqCst);
        });

        for item in 0..10 {
            queue.enqueue(item);
        }
        queue.wait_completion();
        assert_eq!(worked.load(Ordering::SeqCst), 10);

        queue.shutdown();
    }

    #[test]
    fn test_enqueue_after_shutdown_is_dropped() {
        let queue = WorkQueue::new("closed-wq", 1, 1, move |_item: usize| {});
        queue.shutdown();

        queue.enqueue(1);
        // the dropped item must not leave the pending counter hanging
        queue.wait_completion();
    }
}
