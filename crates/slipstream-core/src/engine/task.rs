//! Shared FIFO of worker tasks.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::identifiers::PipelineId;
use crate::memory::TupleBuffer;
use crate::pipeline::QueryTerminationType;

/// Unit of work for a worker thread.
#[derive(Debug)]
pub(crate) enum Task {
    /// Run `pipeline` on `buffer`.
    Execute {
        pipeline: PipelineId,
        buffer: TupleBuffer,
    },
    /// All producers of `pipeline` finished.
    EndOfStream {
        pipeline: PipelineId,
        termination: QueryTerminationType,
    },
}

#[derive(Debug, Default)]
struct QueueState {
    tasks: VecDeque<Task>,
    closed: bool,
}

/// Blocking multi-producer, multi-consumer task queue.
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a task. Returns the task back if the queue is closed.
    pub(crate) fn push(&self, task: Task) -> Result<(), Task> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(task);
        }
        state.tasks.push_back(task);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Waits for the next task. Returns `None` once the queue is closed.
    pub(crate) fn pop_blocking(&self) -> Option<Task> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(task) = state.tasks.pop_front() {
                return Some(task);
            }
            self.available.wait(&mut state);
        }
    }

    /// Rejects further pushes, wakes all waiters and drops queued tasks.
    ///
    /// Returns the number of dropped tasks.
    pub(crate) fn close(&self) -> usize {
        let dropped = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.tasks)
        };
        self.available.notify_all();
        dropped.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn eos(id: u64) -> Task {
        Task::EndOfStream {
            pipeline: PipelineId(id),
            termination: QueryTerminationType::Graceful,
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = TaskQueue::new();
        queue.push(eos(1)).unwrap();
        queue.push(eos(2)).unwrap();
        assert_eq!(queue.len(), 2);
        assert!(matches!(
            queue.pop_blocking(),
            Some(Task::EndOfStream { pipeline: PipelineId(1), .. })
        ));
        assert!(matches!(
            queue.pop_blocking(),
            Some(Task::EndOfStream { pipeline: PipelineId(2), .. })
        ));
    }

    #[test]
    fn test_close_wakes_waiters() {
        let queue = Arc::new(TaskQueue::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.pop_blocking().is_none())
            })
            .collect();
        thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(queue.close(), 0);
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
        assert!(queue.is_closed());
        assert!(queue.push(eos(3)).is_err());
    }
}
