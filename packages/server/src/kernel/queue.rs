//! Durable work queue for crawl tasks.
//!
//! Production runs on a NATS JetStream work-queue stream (`CRAWLER_TASKS`,
//! durable pull consumer `crawler-workers`): publish-side dedup via
//! `Nats-Msg-Id`, per-message ack deadlines with redelivery, nak with
//! delay, and best-effort delete of pending messages for pre-start
//! cancellation. The in-memory implementation mirrors those semantics for
//! tests and single-process runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use async_nats::jetstream::{
    self,
    consumer::PullConsumer,
    stream::{DiscardPolicy, RetentionPolicy},
};
use seed_crawler::types::{JobId, WebsiteId};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("queue is full")]
    Full,

    #[error("message encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Queue message payload: the job id plus routing hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub job_id: JobId,
    #[serde(default)]
    pub website_id: Option<WebsiteId>,
    #[serde(default)]
    pub priority: i16,
}

/// One leased message. Ownership of the queue entry stays with the holder
/// until ack/nak or lease expiry.
pub struct Delivery {
    pub job_id: JobId,
    pub payload: TaskPayload,
    /// How many times this message has been delivered (1 = first).
    pub deliveries: i64,
    token: AckToken,
}

enum AckToken {
    Jetstream(Box<jetstream::Message>),
    Memory(u64),
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Persist a message. The sliding dedup window is keyed on
    /// `dedup_key`; a duplicate publish within the window is silently
    /// dropped. A full queue rejects new work.
    async fn publish(&self, payload: &TaskPayload, dedup_key: &str) -> Result<(), QueueError>;

    /// Lease up to `max` messages.
    async fn pull(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError>;

    /// Delete a processed message.
    async fn ack(&self, delivery: Delivery) -> Result<(), QueueError>;

    /// Requeue, immediately or after a delay.
    async fn nak(&self, delivery: Delivery, retry_after: Option<Duration>)
        -> Result<(), QueueError>;

    /// Extend the ack deadline of an in-flight message.
    async fn touch(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Best-effort removal of a pending (unleased) message by job id.
    /// Returns false when no such message exists.
    async fn delete(&self, job_id: JobId) -> Result<bool, QueueError>;
}

// ============================================================================
// JetStream implementation
// ============================================================================

#[derive(Debug, Clone)]
pub struct JetStreamQueueConfig {
    pub stream_name: String,
    pub subject_prefix: String,
    pub consumer_name: String,
    pub max_messages: i64,
    pub max_age: Duration,
    pub duplicate_window: Duration,
    pub ack_wait: Duration,
    pub max_deliver: i64,
}

impl Default for JetStreamQueueConfig {
    fn default() -> Self {
        Self {
            stream_name: "CRAWLER_TASKS".to_string(),
            subject_prefix: "crawler.tasks".to_string(),
            consumer_name: "crawler-workers".to_string(),
            max_messages: 100_000,
            max_age: Duration::from_secs(24 * 3600),
            duplicate_window: Duration::from_secs(300),
            ack_wait: Duration::from_secs(300),
            max_deliver: 3,
        }
    }
}

pub struct JetStreamWorkQueue {
    context: jetstream::Context,
    stream: jetstream::stream::Stream,
    consumer: PullConsumer,
    subject_prefix: String,
}

impl JetStreamWorkQueue {
    /// Ensure the stream and durable consumer exist, creating them with
    /// work-queue retention and reject-when-full discard policy.
    pub async fn connect(
        client: async_nats::Client,
        config: JetStreamQueueConfig,
    ) -> Result<Self, QueueError> {
        let context = jetstream::new(client);

        let stream = context
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream_name.clone(),
                subjects: vec![format!("{}.>", config.subject_prefix)],
                retention: RetentionPolicy::WorkQueue,
                discard: DiscardPolicy::New,
                max_messages: config.max_messages,
                max_age: config.max_age,
                duplicate_window: config.duplicate_window,
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                &config.consumer_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(config.consumer_name.clone()),
                    ack_wait: config.ack_wait,
                    max_deliver: config.max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        Ok(Self {
            context,
            stream,
            consumer,
            subject_prefix: config.subject_prefix,
        })
    }

    fn subject_for(&self, job_id: JobId) -> String {
        format!("{}.{}", self.subject_prefix, job_id)
    }
}

#[async_trait]
impl WorkQueue for JetStreamWorkQueue {
    async fn publish(&self, payload: &TaskPayload, dedup_key: &str) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec(payload)?;
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", dedup_key);

        self.context
            .publish_with_headers(self.subject_for(payload.job_id), headers, bytes.into())
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn pull(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let mut deliveries = Vec::new();
        while let Some(message) = batch.next().await {
            let message = message.map_err(|e| QueueError::Unavailable(e.to_string()))?;
            let payload: TaskPayload = serde_json::from_slice(&message.payload)?;
            let delivered = message
                .info()
                .map(|info| info.delivered)
                .unwrap_or(1);
            deliveries.push(Delivery {
                job_id: payload.job_id,
                payload,
                deliveries: delivered,
                token: AckToken::Jetstream(Box::new(message)),
            });
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: Delivery) -> Result<(), QueueError> {
        match delivery.token {
            AckToken::Jetstream(message) => message
                .ack()
                .await
                .map_err(|e| QueueError::Unavailable(e.to_string())),
            AckToken::Memory(_) => Err(QueueError::Unavailable(
                "delivery token belongs to another queue".to_string(),
            )),
        }
    }

    async fn nak(
        &self,
        delivery: Delivery,
        retry_after: Option<Duration>,
    ) -> Result<(), QueueError> {
        match delivery.token {
            AckToken::Jetstream(message) => message
                .ack_with(jetstream::AckKind::Nak(retry_after))
                .await
                .map_err(|e| QueueError::Unavailable(e.to_string())),
            AckToken::Memory(_) => Err(QueueError::Unavailable(
                "delivery token belongs to another queue".to_string(),
            )),
        }
    }

    async fn touch(&self, delivery: &Delivery) -> Result<(), QueueError> {
        match &delivery.token {
            AckToken::Jetstream(message) => message
                .ack_with(jetstream::AckKind::Progress)
                .await
                .map_err(|e| QueueError::Unavailable(e.to_string())),
            AckToken::Memory(_) => Err(QueueError::Unavailable(
                "delivery token belongs to another queue".to_string(),
            )),
        }
    }

    async fn delete(&self, job_id: JobId) -> Result<bool, QueueError> {
        let subject = self.subject_for(job_id);
        match self.stream.get_last_raw_message_by_subject(&subject).await {
            Ok(raw) => self
                .stream
                .delete_message(raw.sequence)
                .await
                .map_err(|e| QueueError::Unavailable(e.to_string())),
            Err(_) => Ok(false),
        }
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Debug, Clone)]
pub struct MemoryQueueConfig {
    pub capacity: usize,
    pub dedup_window: Duration,
    pub ack_wait: Duration,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            dedup_window: Duration::from_secs(300),
            ack_wait: Duration::from_secs(300),
        }
    }
}

struct MemMessage {
    seq: u64,
    payload: TaskPayload,
    deliveries: i64,
    not_before: Option<Instant>,
}

#[derive(Default)]
struct MemState {
    ready: VecDeque<MemMessage>,
    leased: HashMap<u64, (MemMessage, Instant)>,
    dedup: HashMap<String, Instant>,
    next_seq: u64,
}

/// In-memory [`WorkQueue`] with JetStream-like semantics.
pub struct MemoryWorkQueue {
    state: Mutex<MemState>,
    config: MemoryQueueConfig,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::with_config(MemoryQueueConfig::default())
    }

    pub fn with_config(config: MemoryQueueConfig) -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            config,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ready
            .len()
    }

    pub fn leased_len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .leased
            .len()
    }

    fn requeue_expired(state: &mut MemState, now: Instant) {
        let expired: Vec<u64> = state
            .leased
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            if let Some((message, _)) = state.leased.remove(&seq) {
                state.ready.push_back(message);
            }
        }
    }
}

impl Default for MemoryWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn publish(&self, payload: &TaskPayload, dedup_key: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        state.dedup.retain(|_, seen| now.duration_since(*seen) < self.config.dedup_window);

        if state.dedup.contains_key(dedup_key) {
            // Duplicate within the window: dropped, publish still succeeds.
            return Ok(());
        }
        if state.ready.len() + state.leased.len() >= self.config.capacity {
            return Err(QueueError::Full);
        }

        state.dedup.insert(dedup_key.to_string(), now);
        state.next_seq += 1;
        let seq = state.next_seq;
        state.ready.push_back(MemMessage {
            seq,
            payload: payload.clone(),
            deliveries: 0,
            not_before: None,
        });
        Ok(())
    }

    async fn pull(&self, max: usize, _wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        Self::requeue_expired(&mut state, now);

        let mut out = Vec::new();
        let mut skipped = VecDeque::new();
        while out.len() < max {
            let Some(mut message) = state.ready.pop_front() else {
                break;
            };
            if message.not_before.map(|t| t > now).unwrap_or(false) {
                skipped.push_back(message);
                continue;
            }
            message.deliveries += 1;
            message.not_before = None;
            let delivery = Delivery {
                job_id: message.payload.job_id,
                payload: message.payload.clone(),
                deliveries: message.deliveries,
                token: AckToken::Memory(message.seq),
            };
            state
                .leased
                .insert(message.seq, (message, now + self.config.ack_wait));
            out.push(delivery);
        }
        // Delayed messages go back in order.
        while let Some(message) = skipped.pop_back() {
            state.ready.push_front(message);
        }
        Ok(out)
    }

    async fn ack(&self, delivery: Delivery) -> Result<(), QueueError> {
        let AckToken::Memory(seq) = delivery.token else {
            return Err(QueueError::Unavailable(
                "delivery token belongs to another queue".to_string(),
            ));
        };
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.leased.remove(&seq);
        state.ready.retain(|m| m.seq != seq);
        Ok(())
    }

    async fn nak(
        &self,
        delivery: Delivery,
        retry_after: Option<Duration>,
    ) -> Result<(), QueueError> {
        let AckToken::Memory(seq) = delivery.token else {
            return Err(QueueError::Unavailable(
                "delivery token belongs to another queue".to_string(),
            ));
        };
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((mut message, _)) = state.leased.remove(&seq) {
            message.not_before = retry_after.map(|d| Instant::now() + d);
            state.ready.push_back(message);
        }
        Ok(())
    }

    async fn touch(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let AckToken::Memory(seq) = &delivery.token else {
            return Err(QueueError::Unavailable(
                "delivery token belongs to another queue".to_string(),
            ));
        };
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, deadline)) = state.leased.get_mut(seq) {
            *deadline = Instant::now() + self.config.ack_wait;
        }
        Ok(())
    }

    async fn delete(&self, job_id: JobId) -> Result<bool, QueueError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let before = state.ready.len();
        state.ready.retain(|m| m.payload.job_id != job_id);
        Ok(state.ready.len() < before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(job_id: JobId) -> TaskPayload {
        TaskPayload {
            job_id,
            website_id: None,
            priority: 5,
        }
    }

    #[tokio::test]
    async fn publish_pull_ack_round_trip() {
        let queue = MemoryWorkQueue::new();
        let job = JobId::new();
        queue.publish(&payload(job), &job.to_string()).await.unwrap();

        let mut deliveries = queue.pull(10, Duration::ZERO).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        let delivery = deliveries.pop().unwrap();
        assert_eq!(delivery.job_id, job);
        assert_eq!(delivery.deliveries, 1);

        queue.ack(delivery).await.unwrap();
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.leased_len(), 0);
    }

    #[tokio::test]
    async fn duplicate_publish_within_window_is_dropped() {
        let queue = MemoryWorkQueue::new();
        let job = JobId::new();
        queue.publish(&payload(job), &job.to_string()).await.unwrap();
        queue.publish(&payload(job), &job.to_string()).await.unwrap();
        assert_eq!(queue.pending_len(), 1);
    }

    #[tokio::test]
    async fn distinct_dedup_keys_both_enqueue() {
        let queue = MemoryWorkQueue::new();
        let job = JobId::new();
        queue.publish(&payload(job), "a").await.unwrap();
        queue.publish(&payload(job), "b").await.unwrap();
        assert_eq!(queue.pending_len(), 2);
    }

    #[tokio::test]
    async fn full_queue_rejects_new_work() {
        let queue = MemoryWorkQueue::with_config(MemoryQueueConfig {
            capacity: 1,
            ..Default::default()
        });
        queue
            .publish(&payload(JobId::new()), "a")
            .await
            .unwrap();
        let err = queue.publish(&payload(JobId::new()), "b").await.unwrap_err();
        assert!(matches!(err, QueueError::Full));
    }

    #[tokio::test]
    async fn delete_removes_pending_but_not_leased() {
        let queue = MemoryWorkQueue::new();
        let pending = JobId::new();
        let leased = JobId::new();
        queue
            .publish(&payload(leased), &leased.to_string())
            .await
            .unwrap();
        let deliveries = queue.pull(1, Duration::ZERO).await.unwrap();
        assert_eq!(deliveries[0].job_id, leased);

        queue
            .publish(&payload(pending), &pending.to_string())
            .await
            .unwrap();

        assert!(queue.delete(pending).await.unwrap());
        assert!(!queue.delete(leased).await.unwrap());
        assert!(!queue.delete(JobId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn nak_requeues_for_redelivery() {
        let queue = MemoryWorkQueue::new();
        let job = JobId::new();
        queue.publish(&payload(job), &job.to_string()).await.unwrap();

        let mut deliveries = queue.pull(1, Duration::ZERO).await.unwrap();
        queue.nak(deliveries.pop().unwrap(), None).await.unwrap();

        let redelivered = queue.pull(1, Duration::ZERO).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].deliveries, 2);
    }

    #[tokio::test]
    async fn nak_with_delay_defers_redelivery() {
        let queue = MemoryWorkQueue::new();
        let job = JobId::new();
        queue.publish(&payload(job), &job.to_string()).await.unwrap();

        let mut deliveries = queue.pull(1, Duration::ZERO).await.unwrap();
        queue
            .nak(deliveries.pop().unwrap(), Some(Duration::from_millis(50)))
            .await
            .unwrap();

        assert!(queue.pull(1, Duration::ZERO).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(queue.pull(1, Duration::ZERO).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let queue = MemoryWorkQueue::with_config(MemoryQueueConfig {
            ack_wait: Duration::from_millis(30),
            ..Default::default()
        });
        let job = JobId::new();
        queue.publish(&payload(job), &job.to_string()).await.unwrap();

        let first = queue.pull(1, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        drop(first);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = queue.pull(1, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].deliveries, 2);
    }

    #[tokio::test]
    async fn touch_extends_the_lease() {
        let queue = MemoryWorkQueue::with_config(MemoryQueueConfig {
            ack_wait: Duration::from_millis(60),
            ..Default::default()
        });
        let job = JobId::new();
        queue.publish(&payload(job), &job.to_string()).await.unwrap();

        let deliveries = queue.pull(1, Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        queue.touch(&deliveries[0]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Lease was extended past the original deadline, so nothing is
        // redelivered yet.
        assert!(queue.pull(1, Duration::ZERO).await.unwrap().is_empty());
    }
}
