//! FIFO queue of job ids awaiting assignment.
//!
//! The queue is a scheduling hint, not a source of truth: the dispatcher
//! re-validates every dequeued id against the job store and tolerates stale
//! entries. Durable queue services can implement [`PendingQueue`] behind the
//! same contract.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::QueueError;

#[async_trait]
pub trait PendingQueue: Send + Sync {
    async fn enqueue(&self, job_id: &str) -> Result<(), QueueError>;

    /// Removes and returns the head of the queue, or None when empty.
    async fn dequeue(&self) -> Result<Option<String>, QueueError>;

    /// Returns the head without removing it.
    async fn peek(&self) -> Result<Option<String>, QueueError>;

    async fn size(&self) -> Result<usize, QueueError>;

    /// Removes a specific job id wherever it sits in the queue.
    async fn remove(&self, job_id: &str) -> Result<(), QueueError>;
}

#[derive(Default)]
pub struct InMemoryQueue {
    items: Mutex<VecDeque<String>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingQueue for InMemoryQueue {
    async fn enqueue(&self, job_id: &str) -> Result<(), QueueError> {
        if job_id.is_empty() {
            return Err(QueueError::EmptyJobId);
        }
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.push_back(job_id.to_string());
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<String>, QueueError> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        Ok(items.pop_front())
    }

    async fn peek(&self) -> Result<Option<String>, QueueError> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        Ok(items.front().cloned())
    }

    async fn size(&self) -> Result<usize, QueueError> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        Ok(items.len())
    }

    async fn remove(&self, job_id: &str) -> Result<(), QueueError> {
        if job_id.is_empty() {
            return Err(QueueError::EmptyJobId);
        }
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        match items.iter().position(|item| item == job_id) {
            Some(idx) => {
                items.remove(idx);
                Ok(())
            }
            None => Err(QueueError::NotInQueue),
        }
    }
}
