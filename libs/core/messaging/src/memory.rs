//! In-process message bus with JetStream-like work queue semantics.
//!
//! Plain subjects fan out to every matching subscriber. Streams persist messages
//! whose subject matches the stream's subjects, and durable consumers track
//! pending, in-flight and settled sequences independently, honouring
//! `max_deliver`, delayed naks and ack-wait expiry.

use crate::bus::{
    AckKind, Acker, ConsumerSpec, Delivery, MessageBus, MessageStream, ReceivedMessage,
    StreamSpec, WorkStream,
};
use crate::error::BusError;
use crate::subject::subject_matches;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

/// Settled sequences remembered per consumer for inspection.
const SETTLED_HISTORY: usize = 1024;

/// Cheaply cloneable handle to a shared in-process bus.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BusState>,
    work_available: Notify,
}

/// A message persisted in a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub sequence: u64,
    pub subject: String,
    pub payload: Vec<u8>,
    pub message_id: Option<String>,
}

/// Snapshot of a durable consumer's bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Waiting for (re)delivery, including delayed naks.
    pub pending: u64,
    pub in_flight: u64,
    pub acked: u64,
    pub terminated: u64,
    /// Dropped after reaching `max_deliver`.
    pub exhausted: u64,
    /// Sequences with per-message bookkeeping still held, live or recently settled.
    pub tracked: u64,
    pub bound: bool,
}

#[derive(Default)]
struct BusState {
    closed: bool,
    next_subscriber_id: u64,
    subscribers: Vec<Subscriber>,
    streams: HashMap<String, StreamState>,
}

struct Subscriber {
    id: u64,
    pattern: String,
    tx: mpsc::UnboundedSender<ReceivedMessage>,
}

struct StreamState {
    spec: StreamSpec,
    last_sequence: u64,
    messages: BTreeMap<u64, StoredMessage>,
    message_ids: HashMap<String, u64>,
    consumers: HashMap<String, ConsumerState>,
}

struct ConsumerState {
    spec: ConsumerSpec,
    bindings: usize,
    ready: VecDeque<u64>,
    delayed: Vec<(Instant, u64)>,
    in_flight: HashMap<u64, Instant>,
    /// Delivery counts of sequences that are not settled yet.
    delivered: HashMap<u64, u32>,
    /// Final delivery counts of the most recently settled sequences.
    settled: BTreeMap<u64, u32>,
    acked: u64,
    terminated: u64,
    exhausted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Acked,
    Terminated,
    Exhausted,
}

impl BusState {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    fn add_subscriber(
        &mut self,
        pattern: impl Into<String>,
        tx: mpsc::UnboundedSender<ReceivedMessage>,
    ) -> u64 {
        self.next_subscriber_id += 1;
        let id = self.next_subscriber_id;
        self.subscribers.push(Subscriber {
            id,
            pattern: pattern.into(),
            tx,
        });
        id
    }

    fn remove_subscriber(&mut self, id: u64) {
        self.subscribers.retain(|s| s.id != id);
    }

    /// Fan out to matching subscribers; returns how many received it.
    fn deliver(&mut self, message: &ReceivedMessage) -> usize {
        self.subscribers.retain(|s| !s.tx.is_closed());
        self.subscribers
            .iter()
            .filter(|s| subject_matches(&s.pattern, &message.subject))
            .filter(|s| s.tx.send(message.clone()).is_ok())
            .count()
    }

    /// Persist into every stream accepting the subject; returns the first sequence.
    fn store(&mut self, subject: &str, payload: &[u8], message_id: Option<&str>) -> Option<u64> {
        let mut first = None;
        for stream in self.streams.values_mut().filter(|s| s.accepts(subject)) {
            let sequence = stream.append(subject, payload, message_id);
            first.get_or_insert(sequence);
        }
        first
    }

    fn consumer_mut(&mut self, stream: &str, durable: &str) -> Result<&mut ConsumerState, BusError> {
        self.streams
            .get_mut(stream)
            .ok_or_else(|| BusError::StreamNotFound(stream.to_string()))?
            .consumers
            .get_mut(durable)
            .ok_or_else(|| BusError::consumer(format!("consumer '{durable}' not found")))
    }
}

impl StreamState {
    fn new(spec: StreamSpec) -> Self {
        Self {
            spec,
            last_sequence: 0,
            messages: BTreeMap::new(),
            message_ids: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    fn accepts(&self, subject: &str) -> bool {
        self.spec.subjects.iter().any(|p| subject_matches(p, subject))
    }

    fn append(&mut self, subject: &str, payload: &[u8], message_id: Option<&str>) -> u64 {
        if let Some(sequence) = message_id.and_then(|id| self.message_ids.get(id)) {
            return *sequence;
        }

        self.last_sequence += 1;
        let sequence = self.last_sequence;
        self.messages.insert(
            sequence,
            StoredMessage {
                sequence,
                subject: subject.to_string(),
                payload: payload.to_vec(),
                message_id: message_id.map(str::to_string),
            },
        );
        if let Some(id) = message_id {
            self.message_ids.insert(id.to_string(), sequence);
        }

        for consumer in self.consumers.values_mut() {
            if subject_matches(&consumer.spec.filter_subject, subject) {
                consumer.ready.push_back(sequence);
            }
        }

        // Discard-old retention
        if self.spec.max_messages > 0 {
            while self.messages.len() as i64 > self.spec.max_messages {
                if let Some((_, oldest)) = self.messages.pop_first() {
                    if let Some(id) = oldest.message_id {
                        self.message_ids.remove(&id);
                    }
                }
            }
        }

        sequence
    }

    /// Hand out up to `max` deliveries for a consumer.
    fn take_batch(
        &mut self,
        durable: &str,
        max: usize,
        now: Instant,
    ) -> Result<Vec<(StoredMessage, u32)>, BusError> {
        let StreamState {
            messages,
            consumers,
            ..
        } = self;
        let consumer = consumers
            .get_mut(durable)
            .ok_or_else(|| BusError::consumer(format!("consumer '{durable}' not found")))?;

        consumer.promote_due(now);

        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(sequence) = consumer.ready.pop_front() else {
                break;
            };
            if consumer.is_settled(sequence) || consumer.in_flight.contains_key(&sequence) {
                continue;
            }
            let Some(message) = messages.get(&sequence) else {
                continue;
            };
            if consumer.max_deliver_reached(sequence) {
                consumer.settle(sequence, Settlement::Exhausted);
                continue;
            }

            let count = consumer.delivered.entry(sequence).or_insert(0);
            *count += 1;
            let count = *count;
            consumer
                .in_flight
                .insert(sequence, now + consumer.spec.ack_wait);
            batch.push((message.clone(), count));
        }
        Ok(batch)
    }
}

impl ConsumerState {
    fn new(spec: ConsumerSpec, backlog: impl IntoIterator<Item = u64>) -> Self {
        Self {
            spec,
            bindings: 0,
            ready: backlog.into_iter().collect(),
            delayed: Vec::new(),
            in_flight: HashMap::new(),
            delivered: HashMap::new(),
            settled: BTreeMap::new(),
            acked: 0,
            terminated: 0,
            exhausted: 0,
        }
    }

    fn is_settled(&self, sequence: u64) -> bool {
        self.settled.contains_key(&sequence)
    }

    /// Move a sequence out of the live bookkeeping. Settling twice is a no-op.
    fn settle(&mut self, sequence: u64, settlement: Settlement) -> bool {
        self.forget(sequence);
        let Some(count) = self.delivered.remove(&sequence) else {
            return false;
        };
        match settlement {
            Settlement::Acked => self.acked += 1,
            Settlement::Terminated => self.terminated += 1,
            Settlement::Exhausted => self.exhausted += 1,
        }
        self.settled.insert(sequence, count);
        while self.settled.len() > SETTLED_HISTORY {
            self.settled.pop_first();
        }
        true
    }

    fn delivery_count(&self, sequence: u64) -> u32 {
        self.delivered
            .get(&sequence)
            .or_else(|| self.settled.get(&sequence))
            .copied()
            .unwrap_or(0)
    }

    fn max_deliver_reached(&self, sequence: u64) -> bool {
        let delivered = self.delivered.get(&sequence).copied().unwrap_or(0);
        self.spec.max_deliver > 0 && i64::from(delivered) >= self.spec.max_deliver
    }

    fn promote_due(&mut self, now: Instant) {
        let mut due = Vec::new();
        self.delayed.retain(|(at, sequence)| {
            if *at <= now {
                due.push(*sequence);
                false
            } else {
                true
            }
        });
        due.sort_unstable();
        self.ready.extend(due);

        let mut expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(sequence, _)| *sequence)
            .collect();
        expired.sort_unstable();
        for sequence in expired {
            self.in_flight.remove(&sequence);
            trace!(sequence, "Ack wait expired, redelivering");
            self.requeue(sequence, None, now);
        }
    }

    fn requeue(&mut self, sequence: u64, delay: Option<Duration>, now: Instant) {
        if self.max_deliver_reached(sequence) {
            self.settle(sequence, Settlement::Exhausted);
            return;
        }
        match delay {
            Some(delay) if !delay.is_zero() => self.delayed.push((now + delay, sequence)),
            _ => self.ready.push_back(sequence),
        }
    }

    fn forget(&mut self, sequence: u64) {
        self.in_flight.remove(&sequence);
        self.ready.retain(|s| *s != sequence);
        self.delayed.retain(|(_, s)| *s != sequence);
    }

    fn next_wake(&self) -> Option<Instant> {
        self.delayed
            .iter()
            .map(|(at, _)| *at)
            .chain(self.in_flight.values().copied())
            .min()
    }

    fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            pending: (self.ready.len() + self.delayed.len()) as u64,
            in_flight: self.in_flight.len() as u64,
            acked: self.acked,
            terminated: self.terminated,
            exhausted: self.exhausted,
            tracked: (self.delivered.len() + self.settled.len()) as u64,
            bound: self.bindings > 0,
        }
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bookkeeping snapshot for a durable consumer.
    pub async fn consumer_stats(&self, stream: &str, durable: &str) -> Option<ConsumerStats> {
        let state = self.inner.state.lock().await;
        state
            .streams
            .get(stream)?
            .consumers
            .get(durable)
            .map(ConsumerState::stats)
    }

    /// How many times a stream message has been delivered to a consumer.
    pub async fn delivery_count(&self, stream: &str, durable: &str, sequence: u64) -> u32 {
        let state = self.inner.state.lock().await;
        state
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(durable))
            .map_or(0, |c| c.delivery_count(sequence))
    }

    /// All messages currently retained by a stream, oldest first.
    pub async fn stream_messages(&self, stream: &str) -> Vec<StoredMessage> {
        let state = self.inner.state.lock().await;
        state
            .streams
            .get(stream)
            .map(|s| s.messages.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Simulate losing the connection: subscriptions end and every later call fails.
    pub async fn disconnect(&self) {
        let mut state = self.inner.state.lock().await;
        state.closed = true;
        state.subscribers.clear();
        drop(state);
        self.inner.work_available.notify_waiters();
        debug!("In-memory bus disconnected");
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_open()?;
        let stored = state.store(subject, &payload, None);
        state.deliver(&ReceivedMessage {
            subject: subject.to_string(),
            payload,
            reply: None,
        });
        drop(state);

        if stored.is_some() {
            self.inner.work_available.notify_waiters();
        }
        Ok(())
    }

    async fn publish_work(
        &self,
        subject: &str,
        message_id: &str,
        payload: Vec<u8>,
    ) -> Result<u64, BusError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_open()?;
        let sequence = state
            .store(subject, &payload, Some(message_id))
            .ok_or_else(|| BusError::StreamNotFound(format!("no stream accepts '{subject}'")))?;
        state.deliver(&ReceivedMessage {
            subject: subject.to_string(),
            payload,
            reply: None,
        });
        drop(state);

        self.inner.work_available.notify_waiters();
        Ok(sequence)
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<ReceivedMessage, BusError> {
        let inbox = format!("_INBOX.{}", Uuid::new_v4().simple());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscriber_id = {
            let mut state = self.inner.state.lock().await;
            state.ensure_open()?;
            let id = state.add_subscriber(inbox.clone(), tx);
            let receivers = state.deliver(&ReceivedMessage {
                subject: subject.to_string(),
                payload,
                reply: Some(inbox),
            });
            if receivers == 0 {
                state.remove_subscriber(id);
                return Err(BusError::NoResponders(subject.to_string()));
            }
            id
        };

        let reply = tokio::time::timeout(timeout, rx.recv()).await;
        self.inner
            .state
            .lock()
            .await
            .remove_subscriber(subscriber_id);

        match reply {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout {
                subject: subject.to_string(),
                timeout,
            }),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn MessageStream>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock().await;
        state.ensure_open()?;
        state.add_subscriber(subject, tx);
        Ok(Box::new(InMemorySubscription { rx }))
    }

    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<(), BusError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_open()?;
        if !state.streams.contains_key(&spec.name) {
            debug!(stream = %spec.name, subjects = ?spec.subjects, "Creating stream");
            state
                .streams
                .insert(spec.name.clone(), StreamState::new(spec.clone()));
        }
        Ok(())
    }

    async fn bind_work_stream(&self, spec: &ConsumerSpec) -> Result<Box<dyn WorkStream>, BusError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_open()?;
        let stream = state
            .streams
            .get_mut(&spec.stream)
            .ok_or_else(|| BusError::StreamNotFound(spec.stream.clone()))?;

        let backlog: Vec<u64> = stream
            .messages
            .values()
            .filter(|m| subject_matches(&spec.filter_subject, &m.subject))
            .map(|m| m.sequence)
            .collect();
        let consumer = stream
            .consumers
            .entry(spec.durable_name.clone())
            .or_insert_with(|| {
                debug!(consumer = %spec.durable_name, stream = %spec.stream, "Creating consumer");
                ConsumerState::new(spec.clone(), backlog)
            });
        consumer.spec = spec.clone();
        consumer.bindings += 1;

        Ok(Box::new(InMemoryWorkStream {
            inner: self.inner.clone(),
            stream: spec.stream.clone(),
            durable: spec.durable_name.clone(),
        }))
    }
}

struct InMemorySubscription {
    rx: mpsc::UnboundedReceiver<ReceivedMessage>,
}

#[async_trait]
impl MessageStream for InMemorySubscription {
    async fn next(&mut self) -> Option<ReceivedMessage> {
        self.rx.recv().await
    }
}

struct InMemoryWorkStream {
    inner: Arc<Inner>,
    stream: String,
    durable: String,
}

#[async_trait]
impl WorkStream for InMemoryWorkStream {
    async fn fetch(
        &mut self,
        max_messages: usize,
        expires: Duration,
    ) -> Result<Vec<Delivery>, BusError> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + expires;

        loop {
            // Register interest before inspecting state so a concurrent publish is not missed.
            let notified = self.inner.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = {
                let mut state = self.inner.state.lock().await;
                state.ensure_open()?;
                let now = Instant::now();
                let stream = state
                    .streams
                    .get_mut(&self.stream)
                    .ok_or_else(|| BusError::StreamNotFound(self.stream.clone()))?;
                let batch = stream.take_batch(&self.durable, max_messages, now)?;

                if !batch.is_empty() {
                    return Ok(batch
                        .into_iter()
                        .map(|(message, count)| {
                            let acker = InMemoryAcker {
                                inner: self.inner.clone(),
                                stream: self.stream.clone(),
                                durable: self.durable.clone(),
                                sequence: message.sequence,
                            };
                            Delivery::new(
                                message.subject,
                                message.payload,
                                message.sequence,
                                count,
                                message.message_id,
                                Box::new(acker),
                            )
                        })
                        .collect());
                }

                state
                    .consumer_mut(&self.stream, &self.durable)?
                    .next_wake()
            };

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = next_wake.map_or(deadline, |at| at.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn pending(&mut self) -> Result<u64, BusError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_open()?;
        Ok(state.consumer_mut(&self.stream, &self.durable)?.stats().pending)
    }

    async fn close(self: Box<Self>) -> Result<(), BusError> {
        let mut state = self.inner.state.lock().await;
        let consumer = state.consumer_mut(&self.stream, &self.durable)?;
        consumer.bindings = consumer.bindings.saturating_sub(1);

        if consumer.bindings == 0 && !consumer.in_flight.is_empty() {
            let mut abandoned: Vec<u64> = consumer.in_flight.drain().map(|(s, _)| s).collect();
            abandoned.sort_unstable();
            debug!(
                consumer = %self.durable,
                count = abandoned.len(),
                "Returning unsettled deliveries to the consumer"
            );
            for sequence in abandoned.into_iter().rev() {
                consumer.ready.push_front(sequence);
            }
            drop(state);
            self.inner.work_available.notify_waiters();
        }
        Ok(())
    }
}

struct InMemoryAcker {
    inner: Arc<Inner>,
    stream: String,
    durable: String,
    sequence: u64,
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn settle(&self, kind: AckKind) -> Result<(), BusError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_open()?;
        let consumer = state.consumer_mut(&self.stream, &self.durable)?;
        let sequence = self.sequence;

        match kind {
            AckKind::Ack => {
                if !consumer.settle(sequence, Settlement::Acked) {
                    trace!(sequence, "Ack for an already settled message");
                }
            }
            AckKind::Term => {
                if !consumer.settle(sequence, Settlement::Terminated) {
                    trace!(sequence, "Term for an already settled message");
                }
            }
            AckKind::Nak(delay) => {
                if consumer.in_flight.remove(&sequence).is_none() {
                    return Err(BusError::ack(format!(
                        "message {sequence} is not in flight"
                    )));
                }
                consumer.requeue(sequence, delay, Instant::now());
                drop(state);
                self.inner.work_available.notify_waiters();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "work";

    fn consumer_spec(max_deliver: i64) -> ConsumerSpec {
        ConsumerSpec {
            stream: STREAM.into(),
            durable_name: "sample-consumer".into(),
            filter_subject: "work.sample".into(),
            max_deliver,
            ack_wait: Duration::from_secs(30),
        }
    }

    async fn bus_with_stream() -> InMemoryBus {
        let bus = InMemoryBus::new();
        bus.ensure_stream(&StreamSpec::new(STREAM, vec!["work.>".into()]))
            .await
            .unwrap();
        bus
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers_only() {
        let bus = InMemoryBus::new();
        let mut system = bus.subscribe("sample.system").await.unwrap();
        let mut all = bus.subscribe("*.system").await.unwrap();

        bus.publish("sample.system", b"hello".to_vec()).await.unwrap();
        bus.publish("other.progress", b"ignored".to_vec())
            .await
            .unwrap();

        assert_eq!(system.next().await.unwrap().payload, b"hello");
        assert_eq!(all.next().await.unwrap().subject, "sample.system");
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("sample.system").await.unwrap();

        let responder = bus.clone();
        tokio::spawn(async move {
            let msg = sub.next().await.unwrap();
            let reply = msg.reply.unwrap();
            assert!(reply.starts_with("_INBOX."));
            responder.publish(&reply, b"pong".to_vec()).await.unwrap();
        });

        let reply = bus
            .request("sample.system", b"ping".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload, b"pong");
    }

    #[tokio::test]
    async fn test_request_without_subscribers() {
        let bus = InMemoryBus::new();
        let err = bus
            .request("nobody.system", Vec::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoResponders(s) if s == "nobody.system"));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let bus = InMemoryBus::new();
        let _silent = bus.subscribe("slow.system").await.unwrap();
        let err = bus
            .request("slow.system", Vec::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_publish_work_requires_stream() {
        let bus = InMemoryBus::new();
        let err = bus
            .publish_work("work.sample", "id-1", b"{}".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::StreamNotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_message_id_is_stored_once() {
        let bus = bus_with_stream().await;
        let first = bus
            .publish_work("work.sample", "same", b"a".to_vec())
            .await
            .unwrap();
        let second = bus
            .publish_work("work.sample", "same", b"a".to_vec())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(bus.stream_messages(STREAM).await.len(), 1);
    }

    #[tokio::test]
    async fn test_consumer_sees_backlog_and_filters() {
        let bus = bus_with_stream().await;
        bus.publish_work("work.sample", "1", b"one".to_vec())
            .await
            .unwrap();
        bus.publish_work("work.other", "2", b"two".to_vec())
            .await
            .unwrap();

        let mut stream = bus.bind_work_stream(&consumer_spec(5)).await.unwrap();
        assert_eq!(stream.pending().await.unwrap(), 1);

        let batch = stream.fetch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload(), b"one");
        assert_eq!(batch[0].delivery_count(), 1);
        assert_eq!(batch[0].message_id(), Some("1"));
    }

    #[tokio::test]
    async fn test_fetch_waits_for_publish() {
        let bus = bus_with_stream().await;
        let mut stream = bus.bind_work_stream(&consumer_spec(5)).await.unwrap();

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish_work("work.sample", "late", b"late".to_vec())
                .await
                .unwrap();
        });

        let batch = stream.fetch(1, Duration::from_secs(2)).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_expires_empty() {
        let bus = bus_with_stream().await;
        let mut stream = bus.bind_work_stream(&consumer_spec(5)).await.unwrap();
        let batch = stream.fetch(1, Duration::from_millis(20)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_ack_settles_for_good() {
        let bus = bus_with_stream().await;
        bus.publish_work("work.sample", "1", b"x".to_vec())
            .await
            .unwrap();
        let mut stream = bus.bind_work_stream(&consumer_spec(5)).await.unwrap();

        let delivery = stream
            .fetch(1, Duration::from_millis(10))
            .await
            .unwrap()
            .remove(0);
        delivery.ack().await.unwrap();

        assert!(stream
            .fetch(1, Duration::from_millis(20))
            .await
            .unwrap()
            .is_empty());
        let stats = bus.consumer_stats(STREAM, "sample-consumer").await.unwrap();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_nak_redelivers_until_max_deliver() {
        let bus = bus_with_stream().await;
        let sequence = bus
            .publish_work("work.sample", "1", b"x".to_vec())
            .await
            .unwrap();
        let mut stream = bus.bind_work_stream(&consumer_spec(3)).await.unwrap();

        for expected in 1..=3 {
            let delivery = stream
                .fetch(1, Duration::from_millis(50))
                .await
                .unwrap()
                .remove(0);
            assert_eq!(delivery.delivery_count(), expected);
            delivery.nak(None).await.unwrap();
        }

        assert!(stream
            .fetch(1, Duration::from_millis(20))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            bus.delivery_count(STREAM, "sample-consumer", sequence).await,
            3
        );
        let stats = bus.consumer_stats(STREAM, "sample-consumer").await.unwrap();
        assert_eq!(stats.exhausted, 1);
    }

    #[tokio::test]
    async fn test_delayed_nak() {
        let bus = bus_with_stream().await;
        bus.publish_work("work.sample", "1", b"x".to_vec())
            .await
            .unwrap();
        let mut stream = bus.bind_work_stream(&consumer_spec(5)).await.unwrap();

        let delivery = stream
            .fetch(1, Duration::from_millis(10))
            .await
            .unwrap()
            .remove(0);
        delivery
            .nak(Some(Duration::from_millis(80)))
            .await
            .unwrap();

        assert!(stream
            .fetch(1, Duration::from_millis(10))
            .await
            .unwrap()
            .is_empty());
        let again = stream.fetch(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(again[0].delivery_count(), 2);
    }

    #[tokio::test]
    async fn test_term_stops_redelivery() {
        let bus = bus_with_stream().await;
        bus.publish_work("work.sample", "1", b"x".to_vec())
            .await
            .unwrap();
        let mut stream = bus.bind_work_stream(&consumer_spec(5)).await.unwrap();

        let delivery = stream
            .fetch(1, Duration::from_millis(10))
            .await
            .unwrap()
            .remove(0);
        delivery.term().await.unwrap();

        assert!(stream
            .fetch(1, Duration::from_millis(20))
            .await
            .unwrap()
            .is_empty());
        let stats = bus.consumer_stats(STREAM, "sample-consumer").await.unwrap();
        assert_eq!(stats.terminated, 1);
    }

    #[tokio::test]
    async fn test_ack_wait_expiry_redelivers() {
        let bus = bus_with_stream().await;
        bus.publish_work("work.sample", "1", b"x".to_vec())
            .await
            .unwrap();
        let spec = ConsumerSpec {
            ack_wait: Duration::from_millis(30),
            ..consumer_spec(5)
        };
        let mut stream = bus.bind_work_stream(&spec).await.unwrap();

        let first = stream.fetch(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 1);
        drop(first);

        let second = stream.fetch(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(second[0].delivery_count(), 2);
    }

    #[tokio::test]
    async fn test_close_requeues_unsettled() {
        let bus = bus_with_stream().await;
        bus.publish_work("work.sample", "1", b"x".to_vec())
            .await
            .unwrap();
        let mut stream = bus.bind_work_stream(&consumer_spec(5)).await.unwrap();
        let held = stream.fetch(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(held.len(), 1);

        stream.close().await.unwrap();
        let stats = bus.consumer_stats(STREAM, "sample-consumer").await.unwrap();
        assert!(!stats.bound);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_flight, 0);

        let mut rebound = bus.bind_work_stream(&consumer_spec(5)).await.unwrap();
        let batch = rebound.fetch(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch[0].delivery_count(), 2);
    }

    #[tokio::test]
    async fn test_settled_bookkeeping_is_bounded() {
        let bus = bus_with_stream().await;
        let mut stream = bus.bind_work_stream(&consumer_spec(5)).await.unwrap();
        let total = SETTLED_HISTORY as u64 + 50;

        for i in 0..total {
            bus.publish_work("work.sample", &i.to_string(), b"x".to_vec())
                .await
                .unwrap();
            let delivery = stream
                .fetch(1, Duration::from_millis(10))
                .await
                .unwrap()
                .remove(0);
            if i % 2 == 0 {
                delivery.ack().await.unwrap();
            } else {
                delivery.term().await.unwrap();
            }
        }

        let stats = bus.consumer_stats(STREAM, "sample-consumer").await.unwrap();
        assert_eq!(stats.acked + stats.terminated, total);
        assert_eq!(stats.tracked, SETTLED_HISTORY as u64);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.pending, 0);

        // Oldest settlements are forgotten, recent ones stay inspectable.
        assert_eq!(bus.delivery_count(STREAM, "sample-consumer", 1).await, 0);
        assert_eq!(bus.delivery_count(STREAM, "sample-consumer", total).await, 1);
    }

    #[tokio::test]
    async fn test_late_ack_after_redelivery_counts_once() {
        let bus = bus_with_stream().await;
        bus.publish_work("work.sample", "1", b"x".to_vec())
            .await
            .unwrap();
        let spec = ConsumerSpec {
            ack_wait: Duration::from_millis(30),
            ..consumer_spec(5)
        };
        let mut stream = bus.bind_work_stream(&spec).await.unwrap();

        let stale = stream
            .fetch(1, Duration::from_millis(10))
            .await
            .unwrap()
            .remove(0);
        let fresh = stream
            .fetch(1, Duration::from_secs(1))
            .await
            .unwrap()
            .remove(0);
        assert_eq!(fresh.delivery_count(), 2);

        fresh.ack().await.unwrap();
        stale.ack().await.unwrap();

        let stats = bus.consumer_stats(STREAM, "sample-consumer").await.unwrap();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.tracked, 1);
    }

    #[tokio::test]
    async fn test_disconnect_fails_operations() {
        let bus = bus_with_stream().await;
        let mut stream = bus.bind_work_stream(&consumer_spec(5)).await.unwrap();
        let mut sub = bus.subscribe("sample.system").await.unwrap();

        bus.disconnect().await;

        assert!(matches!(
            stream.fetch(1, Duration::from_millis(10)).await,
            Err(BusError::Closed)
        ));
        assert!(sub.next().await.is_none());
        assert!(bus.publish("x", Vec::new()).await.is_err());
    }
}
