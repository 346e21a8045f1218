//! Cross-task handoff into the publisher run loop.
//!
//! Any task may schedule work through a `TaskSender`; only the run loop holds
//! the `TaskReceiver`, so scheduled work runs exactly once, on that loop, in
//! submission order. The receiver doubles as the loop's wake-up source.

use tokio::sync::mpsc;

use crate::utils::{BridgeError, Result};

pub fn task_queue<T>() -> (TaskSender<T>, TaskReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TaskSender { tx }, TaskReceiver { rx })
}

#[derive(Debug)]
pub struct TaskSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

// Manual impl: cloning the sender must not require `T: Clone`.
impl<T> Clone for TaskSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> TaskSender<T> {
    /// Never blocks. Fails once the run loop has dropped its receiver.
    pub fn schedule(&self, task: T) -> Result<()> {
        self.tx.send(task).map_err(|_| BridgeError::PublisherStopped)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct TaskReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> TaskReceiver<T> {
    /// Waits for the next task. `None` once every sender is gone.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Takes a task that is already queued, without waiting.
    pub fn try_next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tasks_come_out_in_submission_order() {
        let (tx, mut rx) = task_queue();
        let other = tx.clone();
        tx.schedule(1).unwrap();
        other.schedule(2).unwrap();
        tx.schedule(3).unwrap();

        assert_eq!(rx.next().await, Some(1));
        assert_eq!(rx.try_next(), Some(2));
        assert_eq!(rx.try_next(), Some(3));
        assert_eq!(rx.try_next(), None);
    }

    #[tokio::test]
    async fn schedule_fails_after_receiver_is_dropped() {
        let (tx, rx) = task_queue::<&str>();
        drop(rx);

        assert!(tx.is_closed());
        assert!(matches!(
            tx.schedule("late"),
            Err(BridgeError::PublisherStopped)
        ));
    }

    #[tokio::test]
    async fn tasks_scheduled_from_other_tasks_arrive() {
        let (tx, mut rx) = task_queue();
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let tx = tx.clone();
                tokio::spawn(async move { tx.schedule(n) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut seen = Vec::new();
        while let Some(n) = rx.try_next() {
            seen.push(n);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
