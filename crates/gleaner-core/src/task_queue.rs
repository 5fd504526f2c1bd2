use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use crate::task::Task;

/// A message travelling on the task channel.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueMessage {
    Task(Task),
    /// Sentinel telling the worker that receives it to exit.
    Shutdown,
}

/// In-process task channel shared by the orchestrator and every worker.
///
/// Any clone may push (the orchestrator initially, workers when they
/// resubmit) and any clone may pop; each message is delivered to exactly
/// one consumer.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<QueueMessage>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<QueueMessage>>>,
    pending: Arc<AtomicUsize>,
}

impl TaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn push(&self, task: Task) {
        self.send(QueueMessage::Task(task));
    }

    pub fn push_shutdown(&self) {
        self.send(QueueMessage::Shutdown);
    }

    fn send(&self, message: QueueMessage) {
        // Count before sending so a fast consumer never decrements below zero.
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(message).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `None` on timeout so callers can re-check their stop flag.
    pub async fn pop(&self, timeout: Duration) -> Option<QueueMessage> {
        let received = tokio::time::timeout(timeout, async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        })
        .await
        .ok()
        .flatten();

        if received.is_some() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        received
    }

    /// Messages currently waiting, sentinels included.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove everything still queued and return the tasks among it.
    pub async fn drain_tasks(&self) -> Vec<Task> {
        let mut rx = self.rx.lock().await;
        let mut tasks = Vec::new();
        while let Ok(message) = rx.try_recv() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            if let QueueMessage::Task(task) = message {
                tasks.push(task);
            }
        }
        tasks
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
