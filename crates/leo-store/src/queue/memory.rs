//! In-memory queue transport with visibility-timeout redelivery.
//!
//! Primarily useful for testing; it implements the full leased-message
//! contract, including redelivery of expired leases in original order. Each
//! lease carries a token (the moral equivalent of a pop receipt) so a holder
//! whose lease already expired cannot settle a redelivered message.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{LeasedMessage, QueueClient};
use crate::Result;

const DEFAULT_VISIBILITY: Duration = Duration::from_secs(60);

struct Lease {
    body: String,
    deadline: Instant,
    token: u64,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    next_token: u64,
    /// Visible messages keyed by enqueue sequence, so delivery preserves
    /// queue order even across redeliveries.
    visible: BTreeMap<u64, String>,
    leased: HashMap<u64, Lease>,
}

impl Inner {
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            if let Some(lease) = self.leased.remove(&seq) {
                self.visible.insert(seq, lease.body);
            }
        }
    }

    fn holds(&self, seq: u64, token: u64) -> bool {
        self.leased.get(&seq).is_some_and(|lease| lease.token == token)
    }
}

/// In-memory queue with lease semantics.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Mutex<Inner>>,
    visibility: Duration,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_visibility(DEFAULT_VISIBILITY)
    }

    /// Shorter visibility timeouts make redelivery tests fast.
    pub fn with_visibility(visibility: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            visibility,
        }
    }

    /// Messages currently waiting or leased.
    pub fn depth(&self) -> usize {
        let inner = self.inner.lock();
        inner.visible.len() + inner.leased.len()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn send_message(&self, body: String) -> Result<()> {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.visible.insert(seq, body);
        Ok(())
    }

    async fn listen_for_next_message(&self, max: usize) -> Result<Vec<Box<dyn LeasedMessage>>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.requeue_expired(now);

        let taken: Vec<u64> = inner.visible.keys().take(max).copied().collect();
        let mut messages: Vec<Box<dyn LeasedMessage>> = Vec::with_capacity(taken.len());
        for seq in taken {
            let body = inner.visible.remove(&seq).expect("key just listed");
            let token = inner.next_token;
            inner.next_token += 1;
            inner.leased.insert(
                seq,
                Lease {
                    body: body.clone(),
                    deadline: now + self.visibility,
                    token,
                },
            );
            messages.push(Box::new(MemoryMessage {
                seq,
                token,
                body,
                inner: Arc::clone(&self.inner),
                settled: AtomicBool::new(false),
            }));
        }
        Ok(messages)
    }

    async fn create_queue_if_not_exists(&self) -> Result<()> {
        Ok(())
    }

    async fn delete_queue_if_exists(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.visible.clear();
        inner.leased.clear();
        Ok(())
    }
}

struct MemoryMessage {
    seq: u64,
    token: u64,
    body: String,
    inner: Arc<Mutex<Inner>>,
    settled: AtomicBool,
}

impl MemoryMessage {
    fn give_back(&self) {
        if !self.settled.swap(true, Ordering::SeqCst) {
            let mut inner = self.inner.lock();
            if inner.holds(self.seq, self.token) {
                if let Some(lease) = inner.leased.remove(&self.seq) {
                    inner.visible.insert(self.seq, lease.body);
                }
            }
        }
    }
}

#[async_trait]
impl LeasedMessage for MemoryMessage {
    fn body(&self) -> &str {
        &self.body
    }

    async fn complete(&self) -> Result<()> {
        if !self.settled.swap(true, Ordering::SeqCst) {
            let mut inner = self.inner.lock();
            if inner.holds(self.seq, self.token) {
                inner.leased.remove(&self.seq);
            }
        }
        Ok(())
    }

    async fn abandon(&self) -> Result<()> {
        self.give_back();
        Ok(())
    }
}

impl Drop for MemoryMessage {
    fn drop(&mut self) {
        self.give_back();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completed_messages_are_gone() {
        let queue = MemoryQueue::new();
        queue.send_message("one".to_string()).await.unwrap();

        let messages = queue.listen_for_next_message(10).await.unwrap();
        assert_eq!(messages.len(), 1);
        messages[0].complete().await.unwrap();
        drop(messages);

        assert_eq!(queue.depth(), 0);
        assert!(queue.listen_for_next_message(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropped_messages_are_redelivered_in_order() {
        let queue = MemoryQueue::new();
        for body in ["a", "b", "c"] {
            queue.send_message(body.to_string()).await.unwrap();
        }

        let messages = queue.listen_for_next_message(2).await.unwrap();
        assert_eq!(messages.len(), 2);
        drop(messages); // abandoned, back to visible

        let bodies: Vec<String> = queue
            .listen_for_next_message(10)
            .await
            .unwrap()
            .iter()
            .map(|m| m.body().to_string())
            .collect();
        assert_eq!(bodies, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn expired_leases_become_visible_again() {
        let queue = MemoryQueue::with_visibility(Duration::from_millis(10));
        queue.send_message("flaky".to_string()).await.unwrap();

        let first = queue.listen_for_next_message(1).await.unwrap();
        assert_eq!(first.len(), 1);
        // Hold the lease past its deadline without settling.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = queue.listen_for_next_message(1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].body(), "flaky");

        // The original holder's lease is gone; settling it must not disturb
        // the redelivered one.
        first[0].complete().await.unwrap();
        assert_eq!(queue.depth(), 1);
    }
}
