use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use serde_json::json;

use crate::logging::{LogLevel, Logger};

pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 16;
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

pub type Filter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

type SubscriberMap<T> = RwLock<HashMap<u64, SubscriberEntry<T>>>;

struct SubscriberEntry<T> {
    sender: Sender<T>,
    filter: Option<Filter<T>>,
}

impl<T> SubscriberEntry<T> {
    fn accepts(&self, value: &T) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter(value))
    }
}

pub struct Subscription<T> {
    id: u64,
    receiver: Receiver<T>,
    subscribers: Weak<SubscriberMap<T>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn recv(&self) -> Option<T> {
        self.receiver.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let Some(subscribers) = self.subscribers.upgrade() else {
            return;
        };
        if let Ok(mut subscribers) = subscribers.write() {
            subscribers.remove(&self.id);
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pending", &self.receiver.len())
            .finish()
    }
}

// Full subscriber queues get their own delivery thread bounded by `send_timeout`.
pub struct Publisher<T> {
    topic: String,
    subscribers: Arc<SubscriberMap<T>>,
    next_id: AtomicU64,
    buffer: usize,
    send_timeout: Duration,
    logger: Arc<Logger>,
}

impl<T> Publisher<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(topic: impl Into<String>, logger: Arc<Logger>) -> Self {
        Self::with_limits(
            topic,
            logger,
            DEFAULT_SUBSCRIPTION_BUFFER,
            DEFAULT_PUBLISH_TIMEOUT,
        )
    }

    pub fn with_limits(
        topic: impl Into<String>,
        logger: Arc<Logger>,
        buffer: usize,
        send_timeout: Duration,
    ) -> Self {
        Self {
            topic: topic.into(),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            send_timeout,
            logger,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscribe_all(&self) -> Subscription<T> {
        self.subscribe(None)
    }

    pub fn subscribe_matching<F>(&self, filter: F) -> Subscription<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.subscribe(Some(Arc::new(filter)))
    }

    pub fn subscribe(&self, filter: Option<Filter<T>>) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = bounded(self.buffer);
        self.subscribers
            .write()
            .expect("subscriber map lock poisoned")
            .insert(id, SubscriberEntry { sender, filter });
        Subscription {
            id,
            receiver,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn evict(&self, subscription: &Subscription<T>) {
        self.evict_id(subscription.id);
    }

    pub fn evict_id(&self, id: u64) -> bool {
        self.subscribers
            .write()
            .expect("subscriber map lock poisoned")
            .remove(&id)
            .is_some()
    }

    pub fn num_matching(&self, value: &T) -> usize {
        self.subscribers
            .read()
            .expect("subscriber map lock poisoned")
            .values()
            .filter(|entry| entry.accepts(value))
            .count()
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .expect("subscriber map lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn publish(&self, value: T) -> usize {
        let subscribers = self
            .subscribers
            .read()
            .expect("subscriber map lock poisoned");

        let mut matched = 0;
        for (id, entry) in subscribers.iter() {
            if !entry.accepts(&value) {
                continue;
            }
            matched += 1;

            match entry.sender.try_send(value.clone()) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(pending)) => {
                    self.deliver_later(*id, entry.sender.clone(), pending);
                }
            }
        }

        matched
    }

    fn deliver_later(&self, id: u64, sender: Sender<T>, value: T) {
        let logger = Arc::clone(&self.logger);
        let topic = self.topic.clone();
        let timeout = self.send_timeout;
        thread::spawn(move || {
            if sender.send_timeout(value, timeout).is_err() {
                logger.log(
                    LogLevel::Warn,
                    Some("pubsub"),
                    "dropped delivery to slow subscriber",
                    Some(json!({
                        "topic": topic,
                        "subscriber": id,
                        "timeout_ms": timeout.as_millis() as u64,
                    })),
                );
            }
        });
    }
}

impl<T> fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers = self
            .subscribers
            .read()
            .map(|subscribers| subscribers.len())
            .unwrap_or_default();
        f.debug_struct("Publisher")
            .field("topic", &self.topic)
            .field("subscribers", &subscribers)
            .field("buffer", &self.buffer)
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}
