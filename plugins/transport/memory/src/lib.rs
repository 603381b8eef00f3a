use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use offer_api::{
    subject_matches, ConsumerSpec, Delivery, OfferSubscription, ProvisionOutcome,
    StreamError, StreamProvisioner, StreamSpec, StreamSubscriber,
};

// ═══════════════════════════════════════════════════════════════
//  Broker state
// ═══════════════════════════════════════════════════════════════

struct StoredMessage {
    seq: u64,
    subject: String,
    payload: Arc<[u8]>,
}

struct Pending {
    deadline: Instant,
    attempts: u64,
}

/// Позиция durable consumer'а. Общая для всех подписок с одним именем.
struct ConsumerState {
    filter: String,
    ack_wait: Duration,
    /// Следующий seq для первой доставки.
    cursor: u64,
    /// Доставлено, но не подтверждено.
    pending: BTreeMap<u64, Pending>,
}

struct StreamState {
    spec: StreamSpec,
    messages: VecDeque<StoredMessage>,
    first_seq: u64,
    next_seq: u64,
    bytes: i64,
    consumers: HashMap<String, ConsumerState>,
}

struct Ready {
    seq: u64,
    subject: String,
    payload: Arc<[u8]>,
    attempt: u64,
}

enum Next {
    Ready(Ready),
    /// Ничего не готово; ближайший дедлайн redelivery, если есть.
    Wait(Option<Instant>),
}

impl StreamState {
    fn new(spec: StreamSpec) -> Self {
        Self {
            spec,
            messages: VecDeque::new(),
            first_seq: 1,
            next_seq: 1,
            bytes: 0,
            consumers: HashMap::new(),
        }
    }

    fn message(&self, seq: u64) -> Option<&StoredMessage> {
        if seq < self.first_seq {
            return None;
        }
        self.messages.get((seq - self.first_seq) as usize)
    }

    fn append(&mut self, subject: &str, payload: &[u8]) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.bytes += payload.len() as i64;
        self.messages.push_back(StoredMessage {
            seq,
            subject: subject.to_string(),
            payload: Arc::from(payload),
        });
        self.enforce_limits();
        seq
    }

    /// Discard-old: при превышении лимитов выбрасываются самые старые.
    fn enforce_limits(&mut self) {
        let limits = self.spec.limits;
        loop {
            let over_count = limits.max_messages > 0 && self.messages.len() as i64 > limits.max_messages;
            let over_bytes = limits.max_bytes > 0 && self.bytes > limits.max_bytes;
            if !(over_count || over_bytes) {
                break;
            }
            match self.messages.pop_front() {
                Some(old) => {
                    self.bytes -= old.payload.len() as i64;
                    self.first_seq = old.seq + 1;
                }
                None => break,
            }
        }
    }

    fn take_next(&mut self, durable: &str, now: Instant) -> Next {
        let first_seq = self.first_seq;
        let next_seq = self.next_seq;
        let Some(consumer) = self.consumers.get_mut(durable) else {
            return Next::Wait(None);
        };

        // Сообщения, вытесненные лимитами, больше не доставляются.
        consumer.pending.retain(|seq, _| *seq >= first_seq);

        let expired = consumer
            .pending
            .iter()
            .find(|(_, p)| p.deadline <= now)
            .map(|(seq, _)| *seq);
        if let Some(seq) = expired {
            let ack_wait = consumer.ack_wait;
            let attempt = match consumer.pending.get_mut(&seq) {
                Some(p) => {
                    p.attempts += 1;
                    p.deadline = now + ack_wait;
                    p.attempts
                }
                None => 1,
            };
            if let Some(msg) = self.message(seq) {
                return Next::Ready(Ready {
                    seq,
                    subject: msg.subject.clone(),
                    payload: msg.payload.clone(),
                    attempt,
                });
            }
        }

        let Some(consumer) = self.consumers.get_mut(durable) else {
            return Next::Wait(None);
        };
        while consumer.cursor < next_seq {
            let seq = consumer.cursor.max(first_seq);
            if seq >= next_seq {
                consumer.cursor = seq;
                break;
            }
            consumer.cursor = seq + 1;
            let idx = (seq - first_seq) as usize;
            let Some(msg) = self.messages.get(idx) else {
                continue;
            };
            if !subject_matches(&consumer.filter, &msg.subject) {
                continue;
            }
            consumer.pending.insert(
                seq,
                Pending {
                    deadline: now + consumer.ack_wait,
                    attempts: 1,
                },
            );
            return Next::Ready(Ready {
                seq,
                subject: msg.subject.clone(),
                payload: msg.payload.clone(),
                attempt: 1,
            });
        }

        Next::Wait(consumer.pending.values().map(|p| p.deadline).min())
    }
}

#[derive(Default)]
struct BrokerState {
    streams: HashMap<String, StreamState>,
    closed: bool,
}

// ═══════════════════════════════════════════════════════════════
//  MemoryBroker
// ═══════════════════════════════════════════════════════════════

/// In-process брокер с семантикой JetStream, которая нужна consumer'у:
/// streams с лимитами, durable курсоры, explicit ack и redelivery
/// неподтверждённых сообщений по истечении ack_wait.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Опубликовать сообщение в stream, чей subject pattern совпадает.
    pub async fn publish(&self, subject: &str, payload: &[u8]) -> Result<u64, StreamError> {
        let seq = {
            let mut state = self.state.lock().await;
            let stream = state
                .streams
                .values_mut()
                .find(|s| subject_matches(&s.spec.subject, subject))
                .ok_or_else(|| StreamError::Publish {
                    subject: subject.to_string(),
                    detail: "no stream matches subject".into(),
                })?;
            stream.append(subject, payload)
        };
        self.notify.notify_waiters();
        Ok(seq)
    }

    /// Закрыть брокер: все подписки получат `None`.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn has_stream(&self, name: &str) -> bool {
        self.state.lock().await.streams.contains_key(name)
    }

    /// Количество сообщений, хранимых в stream'е.
    pub async fn message_count(&self, stream: &str) -> usize {
        self.state
            .lock()
            .await
            .streams
            .get(stream)
            .map_or(0, |s| s.messages.len())
    }

    /// Количество доставленных, но не подтверждённых сообщений.
    pub async fn pending(&self, stream: &str, durable: &str) -> usize {
        self.state
            .lock()
            .await
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(durable))
            .map_or(0, |c| c.pending.len())
    }
}

impl StreamProvisioner for MemoryBroker {
    fn ensure_stream<'a>(
        &'a self,
        spec: &'a StreamSpec,
    ) -> Pin<Box<dyn Future<Output = Result<ProvisionOutcome, StreamError>> + Send + 'a>> {
        Box::pin(async move {
            if spec.name.is_empty() {
                return Err(StreamError::Provision {
                    stream: spec.name.clone(),
                    detail: "empty stream name".into(),
                });
            }
            let mut state = self.state.lock().await;
            if state.streams.contains_key(&spec.name) {
                return Ok(ProvisionOutcome::Existing);
            }
            state
                .streams
                .insert(spec.name.clone(), StreamState::new(spec.clone()));
            Ok(ProvisionOutcome::Created)
        })
    }
}

impl StreamSubscriber for MemoryBroker {
    fn subscribe<'a>(
        &'a self,
        spec: &'a ConsumerSpec,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn OfferSubscription>, StreamError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let stream = state
                .streams
                .get_mut(&spec.stream)
                .ok_or_else(|| StreamError::Subscribe {
                    stream: spec.stream.clone(),
                    durable: spec.durable.clone(),
                    detail: "stream not found".into(),
                })?;
            let first_seq = stream.first_seq;
            stream
                .consumers
                .entry(spec.durable.clone())
                .or_insert_with(|| ConsumerState {
                    filter: spec.filter_subject.clone(),
                    ack_wait: spec.ack_wait,
                    cursor: first_seq,
                    pending: BTreeMap::new(),
                });
            Ok(Box::new(MemorySubscription {
                state: self.state.clone(),
                notify: self.notify.clone(),
                stream: spec.stream.clone(),
                durable: spec.durable.clone(),
            }) as Box<dyn OfferSubscription>)
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemorySubscription / MemoryDelivery
// ═══════════════════════════════════════════════════════════════

pub struct MemorySubscription {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    stream: String,
    durable: String,
}

impl OfferSubscription for MemorySubscription {
    fn next(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<Box<dyn Delivery>, StreamError>>> + Send + '_>> {
        Box::pin(async move {
            loop {
                // Регистрируемся до проверки состояния, чтобы не пропустить notify.
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let wait = {
                    let mut state = self.state.lock().await;
                    if state.closed {
                        return None;
                    }
                    let stream = state.streams.get_mut(&self.stream)?;
                    match stream.take_next(&self.durable, Instant::now()) {
                        Next::Ready(ready) => {
                            return Some(Ok(Box::new(MemoryDelivery {
                                state: self.state.clone(),
                                stream: self.stream.clone(),
                                durable: self.durable.clone(),
                                seq: ready.seq,
                                subject: ready.subject,
                                payload: ready.payload,
                                attempt: ready.attempt,
                            }) as Box<dyn Delivery>));
                        }
                        Next::Wait(deadline) => deadline,
                    }
                };

                match wait {
                    Some(deadline) => {
                        tokio::select! {
                            _ = &mut notified => {}
                            _ = tokio::time::sleep_until(deadline) => {}
                        }
                    }
                    None => notified.await,
                }
            }
        })
    }
}

pub struct MemoryDelivery {
    state: Arc<Mutex<BrokerState>>,
    stream: String,
    durable: String,
    seq: u64,
    subject: String,
    payload: Arc<[u8]>,
    attempt: u64,
}

impl MemoryDelivery {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Delivery for MemoryDelivery {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn attempt(&self) -> u64 {
        self.attempt
    }

    fn ack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let consumer = state
                .streams
                .get_mut(&self.stream)
                .and_then(|s| s.consumers.get_mut(&self.durable))
                .ok_or_else(|| StreamError::Ack(format!("consumer '{}' is gone", self.durable)))?;
            consumer.pending.remove(&self.seq);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offer_api::StreamLimits;

    fn stream_spec(max_messages: i64, max_bytes: i64) -> StreamSpec {
        StreamSpec {
            name: "OFFERS".into(),
            subject: "publish-offers.*".into(),
            limits: StreamLimits { max_messages, max_bytes },
        }
    }

    fn consumer_spec(durable: &str, ack_wait: Duration) -> ConsumerSpec {
        ConsumerSpec {
            stream: "OFFERS".into(),
            durable: durable.into(),
            filter_subject: "publish-offers.*".into(),
            ack_wait,
        }
    }

    async fn next(sub: &mut Box<dyn OfferSubscription>) -> Box<dyn Delivery> {
        tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("delivery timed out")
            .expect("subscription closed")
            .expect("receive error")
    }

    #[tokio::test]
    async fn ensure_stream_is_idempotent_under_races() {
        let broker = MemoryBroker::new();
        let spec = stream_spec(10, 0);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let broker = broker.clone();
            let spec = spec.clone();
            handles.push(tokio::spawn(async move { broker.ensure_stream(&spec).await }));
        }
        let mut created = 0;
        for h in handles {
            if h.await.unwrap().unwrap() == ProvisionOutcome::Created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(
            broker.ensure_stream(&spec).await.unwrap(),
            ProvisionOutcome::Existing
        );
    }

    #[tokio::test]
    async fn publish_without_matching_stream_fails() {
        let broker = MemoryBroker::new();
        broker.ensure_stream(&stream_spec(0, 0)).await.unwrap();
        assert!(broker.publish("other.subject", b"{}").await.is_err());
        assert!(broker.publish("publish-offers.eu", b"{}").await.is_ok());
    }

    #[tokio::test]
    async fn limits_discard_oldest() {
        let broker = MemoryBroker::new();
        broker.ensure_stream(&stream_spec(3, 0)).await.unwrap();
        for i in 0..5 {
            broker
                .publish("publish-offers.x", format!("{i}").as_bytes())
                .await
                .unwrap();
        }
        assert_eq!(broker.message_count("OFFERS").await, 3);

        let mut sub = broker
            .subscribe(&consumer_spec("c", Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(next(&mut sub).await.payload(), b"2");

        let broker = MemoryBroker::new();
        broker.ensure_stream(&stream_spec(0, 4)).await.unwrap();
        for payload in [&b"aa"[..], b"bb", b"cc"] {
            broker.publish("publish-offers.x", payload).await.unwrap();
        }
        assert_eq!(broker.message_count("OFFERS").await, 2);
    }

    #[tokio::test]
    async fn unacked_message_is_redelivered_after_ack_wait() {
        let broker = MemoryBroker::new();
        broker.ensure_stream(&stream_spec(0, 0)).await.unwrap();
        broker.publish("publish-offers.a", b"first").await.unwrap();

        let mut sub = broker
            .subscribe(&consumer_spec("c", Duration::from_millis(50)))
            .await
            .unwrap();

        let d = next(&mut sub).await;
        assert_eq!(d.payload(), b"first");
        assert_eq!(d.attempt(), 1);
        drop(d);

        let d = next(&mut sub).await;
        assert_eq!(d.payload(), b"first");
        assert_eq!(d.attempt(), 2);
        d.ack().await.unwrap();
        assert_eq!(broker.pending("OFFERS", "c").await, 0);

        broker.publish("publish-offers.a", b"second").await.unwrap();
        let d = next(&mut sub).await;
        assert_eq!(d.payload(), b"second");
        assert_eq!(d.attempt(), 1);
    }

    #[tokio::test]
    async fn durable_cursor_survives_resubscribe() {
        let broker = MemoryBroker::new();
        broker.ensure_stream(&stream_spec(0, 0)).await.unwrap();
        broker.publish("publish-offers.a", b"1").await.unwrap();
        broker.publish("publish-offers.a", b"2").await.unwrap();

        let spec = consumer_spec("pod-a", Duration::from_secs(10));
        let mut sub = broker.subscribe(&spec).await.unwrap();
        let d = next(&mut sub).await;
        d.ack().await.unwrap();
        drop(sub);

        let mut sub = broker.subscribe(&spec).await.unwrap();
        assert_eq!(next(&mut sub).await.payload(), b"2");

        // Новое имя даёт независимый курсор с начала stream'а.
        let mut fresh = broker
            .subscribe(&consumer_spec("pod-b", Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(next(&mut fresh).await.payload(), b"1");
    }

    #[tokio::test]
    async fn filter_skips_foreign_subjects() {
        let broker = MemoryBroker::new();
        broker
            .ensure_stream(&StreamSpec {
                name: "OFFERS".into(),
                subject: "publish-offers.>".into(),
                limits: StreamLimits { max_messages: 0, max_bytes: 0 },
            })
            .await
            .unwrap();
        broker.publish("publish-offers.eu.de", b"deep").await.unwrap();
        broker.publish("publish-offers.eu", b"flat").await.unwrap();

        let mut sub = broker
            .subscribe(&consumer_spec("c", Duration::from_secs(10)))
            .await
            .unwrap();
        let d = next(&mut sub).await;
        assert_eq!(d.subject(), "publish-offers.eu");
        assert_eq!(d.payload(), b"flat");
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let broker = MemoryBroker::new();
        broker.ensure_stream(&stream_spec(0, 0)).await.unwrap();
        let mut sub = broker
            .subscribe(&consumer_spec("c", Duration::from_secs(10)))
            .await
            .unwrap();

        let waiter = tokio::spawn(async move { sub.next().await.is_none() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.close().await;
        assert!(waiter.await.unwrap());
    }
}
