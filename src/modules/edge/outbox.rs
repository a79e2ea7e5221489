use backoff::{backoff::Backoff, ExponentialBackoff};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

use super::journal;
use crate::modules::mqtt::envelope::Envelope;
use crate::modules::mqtt::mqtt_client::{DeliveryOptions, Transport};
use crate::shared::errors::OutboxError;
use crate::shared::retry::{build_exponential_backoff, next_delay, RetryPolicy};

/// One pending publish, stored as a line of the queue file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub topic: String,
    /// Serialized JSON text, published as is.
    pub payload: String,
    #[serde(default)]
    pub options: DeliveryOptions,
}

impl OutboxMessage {
    pub fn new(topic: impl Into<String>, envelope: &Envelope, options: DeliveryOptions) -> Result<Self, OutboxError> {
        Ok(Self {
            topic: topic.into(),
            payload: serde_json::to_string(envelope)?,
            options,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the client as the head of the queue; popped once the broker acks it.
    Sent,
    /// Waiting behind other messages, or the client is offline.
    Queued,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Messages handed to the client by this call (at most one).
    pub sent: usize,
    pub remaining: usize,
    /// A publish failed and the flush stopped there.
    pub failed: bool,
}

/// The queue head, handed to the client and not yet acknowledged by the broker.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    /// Packet id, known once the event loop has written the publish.
    pkid: Option<u16>,
    since: Instant,
}

/// Bounded FIFO of messages waiting for the broker, mirrored to a JSON-lines file.
///
/// Only the head is ever in flight. It leaves the queue (and the file) when the
/// broker acknowledges it, so a crash loses nothing the broker has not taken and
/// replays at most that one message. When full, the oldest message that is not
/// in flight is dropped.
pub struct Outbox {
    path: PathBuf,
    max_queue: usize,
    queue: VecDeque<OutboxMessage>,
    in_flight: Option<InFlight>,
    ack_timeout: Duration,
    retry: RetryPolicy,
    backoff: ExponentialBackoff,
    next_attempt: Option<Instant>,
    dropped: u64,
}

impl Outbox {
    pub async fn load(path: impl AsRef<Path>, max_queue: usize, retry: RetryPolicy) -> Self {
        let path = path.as_ref().to_path_buf();
        let max_queue = max_queue.max(1);

        let stored: Vec<OutboxMessage> = match journal::load(&path).await {
            Ok(stored) => stored,
            Err(e) => {
                log::error!("Failed to load outbox, starting empty: {}", e);
                Vec::new()
            }
        };

        let mut outbox = Outbox {
            path,
            max_queue,
            queue: stored.into(),
            in_flight: None,
            ack_timeout: Duration::from_secs(30),
            backoff: build_exponential_backoff(&retry),
            retry,
            next_attempt: None,
            dropped: 0,
        };
        if outbox.trim() > 0 {
            outbox.persist().await;
        }
        if !outbox.queue.is_empty() {
            log::info!(
                "Recovered {} queued messages from {}",
                outbox.queue.len(),
                outbox.path.display()
            );
        }
        outbox
    }

    /// How long the head may wait for its acknowledgement before it is published again.
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn messages(&self) -> impl Iterator<Item = &OutboxMessage> {
        self.queue.iter()
    }

    /// Whether the head has been published and is waiting for the broker.
    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Messages dropped to overflow since this outbox was loaded.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn enqueue(&mut self, message: OutboxMessage) {
        self.queue.push_back(message);
        self.trim();
        self.persist().await;
    }

    /// Persists the message, then publishes it right away when connected and
    /// nothing is ahead of it. Otherwise it waits its turn, so it cannot overtake
    /// older messages.
    pub async fn enqueue_or_send(&mut self, transport: &dyn Transport, message: OutboxMessage) -> Delivery {
        self.enqueue(message).await;

        if self.queue.len() == 1 && self.in_flight.is_none() && transport.is_connected() {
            let report = self.publish_head(transport, Instant::now()).await;
            if report.sent == 1 {
                return Delivery::Sent;
            }
        }
        Delivery::Queued
    }

    /// Publishes the head unless one is already waiting for its ack. Later
    /// messages follow one at a time as acknowledgements arrive.
    pub async fn flush(&mut self, transport: &dyn Transport) -> FlushReport {
        if self.in_flight.is_some() || self.queue.is_empty() {
            return FlushReport {
                remaining: self.queue.len(),
                ..FlushReport::default()
            };
        }
        self.publish_head(transport, Instant::now()).await
    }

    /// Flushes when connected, non-empty and past any backoff delay. A head that
    /// has waited longer than the ack timeout is published again.
    pub async fn flush_due(&mut self, transport: &dyn Transport, now: Instant) -> Option<FlushReport> {
        if self.queue.is_empty() || !transport.is_connected() {
            return None;
        }
        if let Some(in_flight) = self.in_flight {
            if now.saturating_duration_since(in_flight.since) < self.ack_timeout {
                return None;
            }
            log::warn!(
                "No acknowledgement for '{}' after {:?}, publishing again",
                self.queue.front().map(|m| m.topic.as_str()).unwrap_or_default(),
                self.ack_timeout
            );
            self.in_flight = None;
            return Some(self.publish_head(transport, now).await);
        }
        if matches!(self.next_attempt, Some(at) if at > now) {
            return None;
        }
        Some(self.publish_head(transport, now).await)
    }

    /// The client replays unacknowledged publishes after a reconnect, so the ack
    /// timeout restarts from there.
    pub fn on_reconnected(&mut self, now: Instant) {
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.since = now;
        }
    }

    /// The event loop wrote a publish with `pkid` to the connection. Binds the id
    /// to the head; QoS 0 heads are complete at this point. Returns true when the
    /// head left the queue.
    pub async fn on_written(&mut self, pkid: u16) -> bool {
        let in_flight = match self.in_flight.as_mut() {
            Some(in_flight) if in_flight.pkid.is_none() => in_flight,
            _ => return false,
        };
        let at_most_once = self
            .queue
            .front()
            .map(|message| message.options.qos == 0)
            .unwrap_or(false);
        if at_most_once {
            self.complete_head().await;
            return true;
        }
        in_flight.pkid = Some(pkid);
        false
    }

    /// The broker acknowledged `pkid`. Returns true when that was the head, which
    /// is then popped and the shortened queue persisted.
    pub async fn on_acked(&mut self, pkid: u16) -> bool {
        match self.in_flight {
            Some(InFlight {
                pkid: Some(head), ..
            }) if head == pkid => {
                self.complete_head().await;
                true
            }
            _ => false,
        }
    }

    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    async fn publish_head(&mut self, transport: &dyn Transport, now: Instant) -> FlushReport {
        let mut report = FlushReport {
            remaining: self.queue.len(),
            ..FlushReport::default()
        };
        let Some(message) = self.queue.front() else {
            return report;
        };

        match transport
            .publish(&message.topic, &message.payload, message.options)
            .await
        {
            Ok(()) => {
                self.in_flight = Some(InFlight { pkid: None, since: now });
                report.sent = 1;
            }
            Err(e) => {
                log::warn!("Flush stopped at '{}': {}", message.topic, e);
                report.failed = true;
                self.schedule_retry(now);
            }
        }
        report
    }

    async fn complete_head(&mut self) {
        self.in_flight = None;
        if let Some(message) = self.queue.pop_front() {
            log::debug!("Broker took message for '{}'", message.topic);
        }
        self.backoff.reset();
        self.next_attempt = None;
        self.persist().await;
    }

    fn schedule_retry(&mut self, now: Instant) {
        let delay = next_delay(&mut self.backoff, &self.retry);
        self.next_attempt = Some(now + delay);
        log::debug!("Next outbox flush in {:?}", delay);
    }

    /// Drops the oldest messages beyond capacity and returns how many went. The
    /// in-flight head stays so its acknowledgement still matches.
    fn trim(&mut self) -> usize {
        let keep = usize::from(self.in_flight.is_some());
        let mut dropped = 0;
        while self.queue.len() > self.max_queue {
            if let Some(old) = self.queue.remove(keep) {
                log::warn!("Outbox full, dropping oldest message for '{}'", old.topic);
            }
            dropped += 1;
        }
        self.dropped += dropped as u64;
        dropped
    }

    /// Failures are logged; the in-memory queue stays authoritative.
    async fn persist(&self) {
        if let Err(e) = journal::rewrite(&self.path, &self.queue).await {
            log::error!("Failed to persist outbox, the file is behind the queue: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::modules::edge::journal::tmp_path;
    use crate::shared::errors::TransportError;
    use async_trait::async_trait;
    use rumqttc::QoS;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    };

    /// Records publishes; can be disconnected or told to fail after N publishes.
    /// The n-th recorded publish stands for packet id n.
    pub struct FakeTransport {
        pub connected: AtomicBool,
        pub fail_after: AtomicUsize,
        pub published: Mutex<Vec<(String, String, DeliveryOptions)>>,
        pub subscriptions: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        pub fn connected() -> Self {
            Self {
                connected: AtomicBool::new(true),
                fail_after: AtomicUsize::new(usize::MAX),
                published: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
            }
        }

        pub fn disconnected() -> Self {
            let transport = Self::connected();
            transport.connected.store(false, Ordering::SeqCst);
            transport
        }

        pub fn last_pkid(&self) -> u16 {
            self.published.lock().unwrap().len() as u16
        }

        pub fn topics(&self) -> Vec<String> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|(topic, _, _)| topic.clone())
                .collect()
        }

        pub fn payloads(&self) -> Vec<serde_json::Value> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|(_, payload, _)| serde_json::from_str(payload).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn publish(
            &self,
            topic: &str,
            payload: &str,
            options: DeliveryOptions,
        ) -> Result<(), TransportError> {
            if !self.is_connected() {
                return Err(TransportError::Disconnected);
            }
            let mut published = self.published.lock().unwrap();
            if published.len() >= self.fail_after.load(Ordering::SeqCst) {
                return Err(TransportError::Timeout {
                    topic: topic.to_string(),
                });
            }
            published.push((topic.to_string(), payload.to_string(), options));
            Ok(())
        }

        async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<(), TransportError> {
            self.subscriptions.lock().unwrap().push(filter.to_string());
            Ok(())
        }
    }

    /// Acts as event loop and broker: writes and acks each head until the queue
    /// is empty or a publish fails.
    async fn deliver_all(outbox: &mut Outbox, transport: &FakeTransport) {
        loop {
            if !outbox.in_flight() {
                outbox.flush(transport).await;
                if !outbox.in_flight() {
                    return;
                }
            }
            let pkid = transport.last_pkid();
            outbox.on_written(pkid).await;
            assert!(outbox.on_acked(pkid).await);
        }
    }

    fn message(n: usize) -> OutboxMessage {
        OutboxMessage {
            topic: format!("rentio/v1/t/b/gw/g/evt/n{}", n),
            payload: format!("{{\"n\":{}}}", n),
            options: DeliveryOptions::at_least_once(),
        }
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            initial_interval_ms: 1_000,
            max_interval_ms: 4_000,
            randomization_factor: 0.0,
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_offline_messages_survive_restart_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");
        let offline = FakeTransport::disconnected();

        let mut outbox = Outbox::load(&path, 100, retry()).await;
        for n in 0..3 {
            assert_eq!(outbox.enqueue_or_send(&offline, message(n)).await, Delivery::Queued);
        }
        assert!(!tmp_path(&path).exists());
        drop(outbox);

        let online = FakeTransport::connected();
        let mut outbox = Outbox::load(&path, 100, retry()).await;
        assert_eq!(outbox.len(), 3);

        deliver_all(&mut outbox, &online).await;
        assert!(outbox.is_empty());
        assert_eq!(
            online.topics(),
            vec![
                "rentio/v1/t/b/gw/g/evt/n0",
                "rentio/v1/t/b/gw/g/evt/n1",
                "rentio/v1/t/b/gw/g/evt/n2",
            ]
        );

        let reloaded = Outbox::load(&path, 100, retry()).await;
        assert!(reloaded.is_empty());
    }

    #[tokio::test]
    async fn test_unacknowledged_messages_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");
        let online = FakeTransport::connected();

        let mut outbox = Outbox::load(&path, 100, retry()).await;
        for n in 0..3 {
            outbox.enqueue(message(n)).await;
        }

        // Accepted by the client and written out, but the broker never answers.
        let report = outbox.flush(&online).await;
        assert_eq!(report, FlushReport { sent: 1, remaining: 3, failed: false });
        assert!(!outbox.on_written(online.last_pkid()).await);
        assert_eq!(outbox.flush(&online).await.sent, 0);
        assert_eq!(online.topics().len(), 1);
        drop(outbox);

        let reloaded = Outbox::load(&path, 100, retry()).await;
        let kept: Vec<&str> = reloaded.messages().map(|m| m.payload.as_str()).collect();
        assert_eq!(kept, vec!["{\"n\":0}", "{\"n\":1}", "{\"n\":2}"]);
    }

    /// Counts the lines of the queue file every time something is published.
    struct FileWatchingTransport {
        inner: FakeTransport,
        path: PathBuf,
        lines_at_publish: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Transport for FileWatchingTransport {
        fn is_connected(&self) -> bool {
            true
        }

        async fn publish(
            &self,
            topic: &str,
            payload: &str,
            options: DeliveryOptions,
        ) -> Result<(), TransportError> {
            let lines = std::fs::read_to_string(&self.path)
                .map(|text| text.lines().count())
                .unwrap_or(0);
            self.lines_at_publish.lock().unwrap().push(lines);
            self.inner.publish(topic, payload, options).await
        }

        async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
            self.inner.subscribe(filter, qos).await
        }
    }

    #[tokio::test]
    async fn test_queue_file_shrinks_before_each_publish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");
        let watcher = FileWatchingTransport {
            inner: FakeTransport::connected(),
            path: path.clone(),
            lines_at_publish: Mutex::new(Vec::new()),
        };

        let mut outbox = Outbox::load(&path, 100, retry()).await;
        for n in 0..4 {
            outbox.enqueue(message(n)).await;
        }

        let mut pkid = 0;
        while outbox.flush(&watcher).await.sent == 1 {
            pkid += 1;
            outbox.on_written(pkid).await;
            outbox.on_acked(pkid).await;
        }

        assert_eq!(*watcher.lines_at_publish.lock().unwrap(), vec![4, 3, 2, 1]);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 0);
    }

    #[tokio::test]
    async fn test_ack_for_another_packet_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let online = FakeTransport::connected();

        let mut outbox = Outbox::load(dir.path().join("queue.jsonl"), 10, retry()).await;
        outbox.enqueue(message(0)).await;

        // An ack before the head was written cannot be for it.
        outbox.flush(&online).await;
        assert!(!outbox.on_acked(1).await);

        outbox.on_written(7).await;
        assert!(!outbox.on_acked(8).await);
        assert_eq!(outbox.len(), 1);
        assert!(outbox.on_acked(7).await);
        assert!(outbox.is_empty());
        assert!(!outbox.in_flight());
    }

    #[tokio::test]
    async fn test_at_most_once_head_completes_when_written() {
        let dir = tempfile::tempdir().unwrap();
        let online = FakeTransport::connected();

        let mut outbox = Outbox::load(dir.path().join("queue.jsonl"), 10, retry()).await;
        let mut fire_and_forget = message(0);
        fire_and_forget.options = DeliveryOptions { qos: 0, retain: false };

        assert_eq!(outbox.enqueue_or_send(&online, fire_and_forget).await, Delivery::Sent);
        assert!(outbox.on_written(0).await);
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");
        let offline = FakeTransport::disconnected();

        let mut outbox = Outbox::load(&path, 2, retry()).await;
        for n in 0..3 {
            outbox.enqueue_or_send(&offline, message(n)).await;
        }

        assert_eq!(outbox.dropped(), 1);
        let kept: Vec<&str> = outbox.messages().map(|m| m.payload.as_str()).collect();
        assert_eq!(kept, vec!["{\"n\":1}", "{\"n\":2}"]);

        let reloaded = Outbox::load(&path, 2, retry()).await;
        assert_eq!(reloaded.len(), 2);
    }

    #[tokio::test]
    async fn test_overflow_keeps_in_flight_head() {
        let dir = tempfile::tempdir().unwrap();
        let online = FakeTransport::connected();

        let mut outbox = Outbox::load(dir.path().join("queue.jsonl"), 2, retry()).await;
        assert_eq!(outbox.enqueue_or_send(&online, message(0)).await, Delivery::Sent);
        outbox.on_written(1).await;
        outbox.enqueue_or_send(&online, message(1)).await;
        outbox.enqueue_or_send(&online, message(2)).await;

        let kept: Vec<&str> = outbox.messages().map(|m| m.payload.as_str()).collect();
        assert_eq!(kept, vec!["{\"n\":0}", "{\"n\":2}"]);

        assert!(outbox.on_acked(1).await);
        let kept: Vec<&str> = outbox.messages().map(|m| m.payload.as_str()).collect();
        assert_eq!(kept, vec!["{\"n\":2}"]);
    }

    #[tokio::test]
    async fn test_reload_with_smaller_capacity_trims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");

        let mut outbox = Outbox::load(&path, 10, retry()).await;
        for n in 0..5 {
            outbox.enqueue(message(n)).await;
        }

        let outbox = Outbox::load(&path, 3, retry()).await;
        assert_eq!(outbox.len(), 3);
        assert_eq!(outbox.messages().next().unwrap().payload, "{\"n\":2}");
    }

    #[tokio::test]
    async fn test_connected_with_empty_queue_sends_directly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");
        let online = FakeTransport::connected();

        let mut outbox = Outbox::load(&path, 10, retry()).await;
        assert_eq!(outbox.enqueue_or_send(&online, message(0)).await, Delivery::Sent);
        assert_eq!(online.topics().len(), 1);

        // On file until the broker has it.
        assert_eq!(Outbox::load(&path, 10, retry()).await.len(), 1);
        outbox.on_written(1).await;
        outbox.on_acked(1).await;
        assert!(outbox.is_empty());
        assert!(Outbox::load(&path, 10, retry()).await.is_empty());
    }

    #[tokio::test]
    async fn test_new_message_waits_behind_queue() {
        let dir = tempfile::tempdir().unwrap();
        let online = FakeTransport::connected();

        let mut outbox = Outbox::load(dir.path().join("queue.jsonl"), 10, retry()).await;
        outbox.enqueue(message(0)).await;

        assert_eq!(outbox.enqueue_or_send(&online, message(1)).await, Delivery::Queued);
        assert!(online.topics().is_empty());

        deliver_all(&mut outbox, &online).await;
        assert_eq!(
            online.topics(),
            vec!["rentio/v1/t/b/gw/g/evt/n0", "rentio/v1/t/b/gw/g/evt/n1"]
        );
    }

    #[tokio::test]
    async fn test_failed_publish_is_queued() {
        let dir = tempfile::tempdir().unwrap();
        let flaky = FakeTransport::connected();
        flaky.fail_after.store(0, Ordering::SeqCst);

        let mut outbox = Outbox::load(dir.path().join("queue.jsonl"), 10, retry()).await;
        assert_eq!(outbox.enqueue_or_send(&flaky, message(0)).await, Delivery::Queued);
        assert_eq!(outbox.len(), 1);
        assert!(!outbox.in_flight());
        assert!(outbox.next_attempt().is_some());
    }

    #[tokio::test]
    async fn test_flush_stops_at_first_failure_and_backs_off() {
        let dir = tempfile::tempdir().unwrap();
        let flaky = FakeTransport::connected();
        flaky.fail_after.store(2, Ordering::SeqCst);

        let mut outbox = Outbox::load(dir.path().join("queue.jsonl"), 10, retry()).await;
        for n in 0..4 {
            outbox.enqueue(message(n)).await;
        }

        deliver_all(&mut outbox, &flaky).await;
        assert_eq!(outbox.len(), 2);
        assert_eq!(flaky.topics().len(), 2);

        // Backing off: the next tick inside the delay does nothing.
        let start = Instant::now();
        assert!(outbox.flush_due(&flaky, start).await.is_none());

        flaky.fail_after.store(usize::MAX, Ordering::SeqCst);
        let later = start + Duration::from_secs(2);
        let report = outbox.flush_due(&flaky, later).await.unwrap();
        assert_eq!(report, FlushReport { sent: 1, remaining: 2, failed: false });

        deliver_all(&mut outbox, &flaky).await;
        assert!(outbox.is_empty());
        assert!(outbox.next_attempt().is_none());
        assert_eq!(
            flaky.topics(),
            vec![
                "rentio/v1/t/b/gw/g/evt/n0",
                "rentio/v1/t/b/gw/g/evt/n1",
                "rentio/v1/t/b/gw/g/evt/n2",
                "rentio/v1/t/b/gw/g/evt/n3",
            ]
        );
    }

    #[tokio::test]
    async fn test_head_is_published_again_after_ack_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let online = FakeTransport::connected();

        let mut outbox = Outbox::load(dir.path().join("queue.jsonl"), 10, retry())
            .await
            .with_ack_timeout(Duration::from_secs(5));
        outbox.enqueue(message(0)).await;
        outbox.flush(&online).await;
        outbox.on_written(1).await;

        let start = Instant::now();
        assert!(outbox.flush_due(&online, start).await.is_none());

        let report = outbox
            .flush_due(&online, start + Duration::from_secs(6))
            .await
            .unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(online.topics().len(), 2);

        // The first packet id no longer belongs to the head.
        assert!(!outbox.on_acked(1).await);
        outbox.on_written(2).await;
        assert!(outbox.on_acked(2).await);
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_restarts_ack_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let online = FakeTransport::connected();

        let mut outbox = Outbox::load(dir.path().join("queue.jsonl"), 10, retry())
            .await
            .with_ack_timeout(Duration::from_secs(5));
        outbox.enqueue(message(0)).await;
        outbox.flush(&online).await;

        let reconnected = Instant::now() + Duration::from_secs(60);
        outbox.on_reconnected(reconnected);
        assert!(outbox
            .flush_due(&online, reconnected + Duration::from_secs(1))
            .await
            .is_none());
        assert_eq!(online.topics().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_due_skips_when_disconnected_or_empty() {
        let dir = tempfile::tempdir().unwrap();
        let offline = FakeTransport::disconnected();
        let online = FakeTransport::connected();

        let mut outbox = Outbox::load(dir.path().join("queue.jsonl"), 10, retry()).await;
        assert!(outbox.flush_due(&online, Instant::now()).await.is_none());

        outbox.enqueue(message(0)).await;
        assert!(outbox.flush_due(&offline, Instant::now()).await.is_none());
        assert_eq!(outbox.len(), 1);
    }

    #[tokio::test]
    async fn test_unwritable_path_keeps_message_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where a directory is needed.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let mut outbox = Outbox::load(blocker.join("queue.jsonl"), 10, retry()).await;
        outbox.enqueue(message(0)).await;
        assert_eq!(outbox.len(), 1);
    }
}
