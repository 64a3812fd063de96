//! Request/reply correlation over a reply topic
//!
//! Requests carry a `correlation-id` header and name the topic replies go to
//! in `reply-to-topic`. A [`CorrelationMatcher`] is fed every record of the
//! reply stream and hands each one to the waiter registered for its id. Any
//! number of ids can be awaited concurrently against one reply stream.

use crate::error::{CorrelationError, SourceError};
use crate::monitoring::{EventEmitter, ProcessingEvent};
use crate::record::{ProducerRecord, Record};
use crate::shutdown;
use crate::source::{Fetched, RecordSource};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub const CORRELATION_ID_HEADER: &str = "correlation-id";
pub const REPLY_TO_HEADER: &str = "reply-to-topic";

const DEFAULT_CAPACITY: usize = 1024;

impl ProducerRecord {
    /// A request whose reply should be sent to `reply_topic`
    pub fn request(
        topic: impl Into<String>,
        reply_topic: &str,
        correlation_id: &str,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        ProducerRecord::new(topic, key, value)
            .with_header(CORRELATION_ID_HEADER, correlation_id.to_string())
            .with_header(REPLY_TO_HEADER, reply_topic.to_string())
    }
}

/// Build the reply to `request`, or `None` if it is not a request
pub fn reply_to(request: &Record, value: impl Into<Bytes>) -> Option<ProducerRecord> {
    let correlation_id = request.header_str(CORRELATION_ID_HEADER)?;
    let reply_topic = request.header_str(REPLY_TO_HEADER)?;
    Some(
        ProducerRecord::new(reply_topic, request.key.clone(), value)
            .with_header(CORRELATION_ID_HEADER, correlation_id.to_string()),
    )
}

#[derive(Default)]
struct MatcherState {
    waiters: HashMap<String, oneshot::Sender<Record>>,
    /// Replies that arrived before anyone awaited them
    unclaimed: VecDeque<(String, Record)>,
    expired: HashSet<String>,
    expired_order: VecDeque<String>,
}

impl MatcherState {
    fn take_unclaimed(&mut self, correlation_id: &str) -> Option<Record> {
        let index = self
            .unclaimed
            .iter()
            .position(|(id, _)| id == correlation_id)?;
        self.unclaimed.remove(index).map(|(_, record)| record)
    }

    fn mark_expired(&mut self, correlation_id: &str, capacity: usize) {
        if self.expired.insert(correlation_id.to_string()) {
            self.expired_order.push_back(correlation_id.to_string());
        }
        while self.expired_order.len() > capacity {
            if let Some(oldest) = self.expired_order.pop_front() {
                self.expired.remove(&oldest);
            }
        }
    }

    fn forget_expired(&mut self, correlation_id: &str) -> bool {
        if self.expired.remove(correlation_id) {
            self.expired_order.retain(|id| id != correlation_id);
            true
        } else {
            false
        }
    }
}

enum Offered {
    Delivered,
    Late,
    Buffered,
}

/// Pairs reply records with the callers awaiting them
#[derive(Clone)]
pub struct CorrelationMatcher {
    state: Arc<Mutex<MatcherState>>,
    emitter: EventEmitter,
    capacity: usize,
}

impl Default for CorrelationMatcher {
    fn default() -> Self {
        Self::new(EventEmitter::disabled())
    }
}

impl CorrelationMatcher {
    pub fn new(emitter: EventEmitter) -> Self {
        Self::with_capacity(emitter, DEFAULT_CAPACITY)
    }

    /// `capacity` bounds both buffered unclaimed replies and remembered expired ids
    pub fn with_capacity(emitter: EventEmitter, capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MatcherState::default())),
            emitter,
            capacity: capacity.max(1),
        }
    }

    /// Number of callers currently waiting
    pub fn pending(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Wait up to `timeout` for the reply carrying `correlation_id`
    ///
    /// On timeout the waiter is removed; a reply arriving later is dropped
    /// and reported as an observability event.
    pub async fn await_reply(
        &self,
        correlation_id: &str,
        timeout: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Record, CorrelationError> {
        let mut rx = {
            let mut state = self.state.lock();
            if state.waiters.contains_key(correlation_id) {
                return Err(CorrelationError::AlreadyWaiting(correlation_id.to_string()));
            }
            state.forget_expired(correlation_id);
            if let Some(record) = state.take_unclaimed(correlation_id) {
                trace!(correlation_id = %correlation_id, "Reply was already buffered");
                return Ok(record);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(correlation_id.to_string(), tx);
            rx
        };

        tokio::select! {
            reply = &mut rx => {
                reply.map_err(|_| CorrelationError::Shutdown)
            }
            _ = tokio::time::sleep(timeout) => {
                let mut state = self.state.lock();
                if state.waiters.remove(correlation_id).is_none() {
                    // A reply claimed the waiter just before the deadline
                    if let Ok(record) = rx.try_recv() {
                        return Ok(record);
                    }
                }
                state.mark_expired(correlation_id, self.capacity);
                debug!(correlation_id = %correlation_id, ?timeout, "Reply timed out");
                Err(CorrelationError::Timeout(timeout))
            }
            _ = shutdown::requested(shutdown) => {
                self.state.lock().waiters.remove(correlation_id);
                Err(CorrelationError::Shutdown)
            }
        }
    }

    /// Feed one record of the reply stream
    ///
    /// Returns true if the record was delivered to a waiter. Records without
    /// a correlation id are ignored.
    pub async fn offer(&self, record: Record) -> bool {
        let correlation_id = match record.header_str(CORRELATION_ID_HEADER) {
            Some(id) => id.to_string(),
            None => {
                trace!(offset = record.offset, "Ignoring record without correlation id");
                return false;
            }
        };

        let outcome = {
            let mut state = self.state.lock();
            match state.waiters.remove(&correlation_id) {
                Some(tx) => match tx.send(record) {
                    Ok(()) => Offered::Delivered,
                    Err(_) => Offered::Late,
                },
                None if state.forget_expired(&correlation_id) => Offered::Late,
                None => {
                    state.unclaimed.push_back((correlation_id.clone(), record));
                    if state.unclaimed.len() > self.capacity {
                        if let Some((evicted, _)) = state.unclaimed.pop_front() {
                            warn!(correlation_id = %evicted, "Evicting unclaimed reply");
                        }
                    }
                    Offered::Buffered
                }
            }
        };

        match outcome {
            Offered::Delivered => {
                trace!(correlation_id = %correlation_id, "Reply delivered");
                true
            }
            Offered::Late => {
                debug!(correlation_id = %correlation_id, "Dropping reply for expired request");
                self.emitter
                    .emit(ProcessingEvent::late_reply_dropped(correlation_id))
                    .await;
                false
            }
            Offered::Buffered => false,
        }
    }

    /// Feed every record of `source` into the matcher until it closes or
    /// shutdown is requested
    pub fn spawn_listener<S>(
        &self,
        mut source: S,
        poll_timeout: Duration,
    ) -> JoinHandle<Result<(), SourceError>>
    where
        S: RecordSource + 'static,
    {
        let matcher = self.clone();
        tokio::spawn(async move {
            debug!(partition = %source.topic_partition(), "Reply listener started");
            loop {
                match source.fetch(poll_timeout).await {
                    Ok(Fetched::Record(record)) => {
                        matcher.offer(record).await;
                    }
                    Ok(Fetched::Empty) => {}
                    Ok(Fetched::Closed) | Err(SourceError::Shutdown) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerClient, InMemoryBroker};
    use crate::config::StreamConfig;
    use crate::monitoring::ProcessingEventType;
    use crate::record::TopicPartition;
    use crate::source::{PartitionSource, SourceConfig};
    use crate::test::TestUtils;
    use tokio::sync::mpsc;

    fn reply(correlation_id: &str, offset: i64) -> Record {
        let mut record = TestUtils::create_test_record("replies", 0, offset, "k", "done");
        record
            .headers
            .push(crate::record::Header::new(CORRELATION_ID_HEADER, correlation_id.to_string()));
        record
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_waiter() -> anyhow::Result<()> {
        let matcher = CorrelationMatcher::default();
        let (_tx, mut rx) = watch::channel(false);

        let result = matcher
            .await_reply("req-1", Duration::from_millis(20), &mut rx)
            .await;
        assert_eq!(result, Err(CorrelationError::Timeout(Duration::from_millis(20))));
        assert_eq!(matcher.pending(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_waiters_each_get_their_reply() -> anyhow::Result<()> {
        let matcher = CorrelationMatcher::default();
        let mut waiters = Vec::new();
        for id in ["a", "b", "c"] {
            let matcher = matcher.clone();
            waiters.push(tokio::spawn(async move {
                let (_tx, mut rx) = watch::channel(false);
                matcher.await_reply(id, Duration::from_secs(2), &mut rx).await
            }));
        }
        while matcher.pending() < 3 {
            tokio::task::yield_now().await;
        }

        assert!(matcher.offer(reply("c", 0)).await);
        assert!(!matcher.offer(TestUtils::create_test_record("replies", 0, 1, "k", "noise")).await);
        assert!(matcher.offer(reply("a", 2)).await);
        assert!(matcher.offer(reply("b", 3)).await);

        let offsets: Vec<i64> = futures::future::try_join_all(waiters)
            .await?
            .into_iter()
            .map(|result| result.map(|record| record.offset))
            .collect::<Result<_, _>>()?;
        assert_eq!(offsets, vec![2, 3, 0]);
        assert_eq!(matcher.pending(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_reply_before_waiter_is_kept() -> anyhow::Result<()> {
        let matcher = CorrelationMatcher::default();
        let (_tx, mut rx) = watch::channel(false);

        assert!(!matcher.offer(reply("early", 5)).await);
        let record = matcher
            .await_reply("early", Duration::from_millis(10), &mut rx)
            .await?;
        assert_eq!(record.offset, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_late_reply_is_reported() -> anyhow::Result<()> {
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let matcher = CorrelationMatcher::new(EventEmitter::new(Some(events_tx)));
        let (_tx, mut rx) = watch::channel(false);

        let _ = matcher
            .await_reply("slow", Duration::from_millis(5), &mut rx)
            .await;
        assert!(!matcher.offer(reply("slow", 9)).await);

        let event = events_rx.recv().await.expect("late reply event");
        assert_eq!(
            event.event_type,
            ProcessingEventType::LateReplyDropped {
                correlation_id: "slow".to_string()
            }
        );
        // The late reply is neither delivered nor kept
        assert!(matcher
            .await_reply("slow", Duration::from_millis(5), &mut rx)
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_waiter_is_rejected() -> anyhow::Result<()> {
        let matcher = CorrelationMatcher::default();
        let first = {
            let matcher = matcher.clone();
            tokio::spawn(async move {
                let (_tx, mut rx) = watch::channel(false);
                matcher.await_reply("dup", Duration::from_millis(200), &mut rx).await
            })
        };
        while matcher.pending() < 1 {
            tokio::task::yield_now().await;
        }

        let (_tx, mut rx) = watch::channel(false);
        let second = matcher.await_reply("dup", Duration::from_millis(10), &mut rx).await;
        assert_eq!(second, Err(CorrelationError::AlreadyWaiting("dup".to_string())));

        matcher.offer(reply("dup", 1)).await;
        assert_eq!(first.await??.offset, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_listener_routes_reply_topic_to_waiters() -> anyhow::Result<()> {
        let broker = InMemoryBroker::new();
        broker.create_topic("quote-replies", 1);
        let tp = TopicPartition::new("quote-replies", 0);

        let matcher = CorrelationMatcher::default();
        let mut waiters = Vec::new();
        for id in ["q-1", "q-2"] {
            let matcher = matcher.clone();
            waiters.push(tokio::spawn(async move {
                let (_tx, mut rx) = watch::channel(false);
                matcher.await_reply(id, Duration::from_secs(2), &mut rx).await
            }));
        }
        while matcher.pending() < 2 {
            tokio::task::yield_now().await;
        }

        for (id, value) in [("q-2", "101.5"), ("", "heartbeat"), ("q-1", "99.0")] {
            let mut record = ProducerRecord::new("quote-replies", "AAPL", value).with_partition(0);
            if !id.is_empty() {
                record = record.with_header(CORRELATION_ID_HEADER, id.to_string());
            }
            broker.produce(record).await?;
        }
        broker.seal(&tp)?;

        let config = StreamConfig {
            group_id: "quote-client".to_string(),
            ..Default::default()
        };
        let (_tx, rx) = watch::channel(false);
        let source =
            PartitionSource::open(broker, tp, SourceConfig::from_stream_config(&config), rx).await?;
        let listener = matcher.spawn_listener(source, Duration::from_millis(20));

        tokio::time::timeout(Duration::from_secs(2), listener).await???;
        let values: Vec<String> = futures::future::try_join_all(waiters)
            .await?
            .into_iter()
            .map(|result| result.map(|record| String::from_utf8_lossy(&record.value).into_owned()))
            .collect::<Result<_, _>>()?;
        assert_eq!(values, vec!["99.0".to_string(), "101.5".to_string()]);
        assert_eq!(matcher.pending(), 0);
        Ok(())
    }

    #[test]
    fn test_reply_helpers() {
        let request = ProducerRecord::request("prices", "prices-replies", "r-1", "AAPL", "quote?");
        let received = Record {
            key: request.key.clone(),
            value: request.value.clone(),
            headers: request.headers.clone(),
            topic: "prices".to_string(),
            partition: 0,
            offset: 0,
            timestamp: chrono::Utc::now(),
        };

        let response = reply_to(&received, "187.20").expect("is a request");
        assert_eq!(response.topic, "prices-replies");
        assert_eq!(
            response.header(CORRELATION_ID_HEADER).map(|v| v.as_ref()),
            Some(&b"r-1"[..])
        );
        let plain = TestUtils::create_test_record("prices", 0, 1, "k", "v");
        assert!(reply_to(&plain, "x").is_none());
    }
}
