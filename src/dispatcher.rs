//! Topic-per-session message dispatcher
//!
//! Process-local publish/subscribe bus. A topic is a `(session_id,
//! message_type)` pair; every publish fans out to the topic's current
//! subscribers. Subscriptions are scoped: dropping one unregisters it and
//! releases its queue. Queues are bounded and drop the oldest event when
//! full, so a slow subscriber is penalized with lost events instead of
//! stalling upstream producers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::usage::models::{AbuseEventType, LimitKind};

/// Default bounded capacity of one subscription's queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// The closed set of message types routed by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    InboundFrame,
    InterimTranscript,
    FinalTranscript,
    LlmToken,
    LlmToolCall,
    TurnEnd,
    TtsBufferFlush,
    OutboundAudio,
    OutboundText,
    ClearBuffer,
    UsageWarning,
    UsageLimitReached,
    VoiceDisabled,
    AbuseDetected,
    CrisisDetected,
    SessionClose,
}

/// A raw frame received from the client socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FrameData {
    Text(String),
    Binary(Vec<u8>),
}

/// Typed message payloads, one variant per [`MessageType`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionMessage {
    InboundFrame {
        data: FrameData,
    },
    InterimTranscript {
        text: String,
    },
    FinalTranscript {
        text: String,
    },
    LlmToken {
        text: String,
    },
    LlmToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    TurnEnd {
        full_text: String,
        error: Option<String>,
    },
    TtsBufferFlush,
    OutboundAudio {
        /// Base64-encoded PCM16 mono 16 kHz
        audio: String,
    },
    OutboundText {
        msg: Option<String>,
        is_transcription: bool,
        is_end: bool,
    },
    ClearBuffer {
        source: String,
    },
    UsageWarning {
        period: LimitKind,
        limit_minutes: f64,
        used_minutes: f64,
        remaining_minutes: f64,
        message: String,
    },
    UsageLimitReached {
        kind: LimitKind,
        limit_minutes: f64,
        used_minutes: f64,
        message: String,
    },
    VoiceDisabled {
        reason: String,
    },
    AbuseDetected {
        event_type: AbuseEventType,
        details: serde_json::Value,
    },
    CrisisDetected {
        is_critical: bool,
    },
    SessionClose {
        reason: String,
    },
}

impl SessionMessage {
    /// The topic type this payload is routed under
    pub fn message_type(&self) -> MessageType {
        match self {
            SessionMessage::InboundFrame { .. } => MessageType::InboundFrame,
            SessionMessage::InterimTranscript { .. } => MessageType::InterimTranscript,
            SessionMessage::FinalTranscript { .. } => MessageType::FinalTranscript,
            SessionMessage::LlmToken { .. } => MessageType::LlmToken,
            SessionMessage::LlmToolCall { .. } => MessageType::LlmToolCall,
            SessionMessage::TurnEnd { .. } => MessageType::TurnEnd,
            SessionMessage::TtsBufferFlush => MessageType::TtsBufferFlush,
            SessionMessage::OutboundAudio { .. } => MessageType::OutboundAudio,
            SessionMessage::OutboundText { .. } => MessageType::OutboundText,
            SessionMessage::ClearBuffer { .. } => MessageType::ClearBuffer,
            SessionMessage::UsageWarning { .. } => MessageType::UsageWarning,
            SessionMessage::UsageLimitReached { .. } => MessageType::UsageLimitReached,
            SessionMessage::VoiceDisabled { .. } => MessageType::VoiceDisabled,
            SessionMessage::AbuseDetected { .. } => MessageType::AbuseDetected,
            SessionMessage::CrisisDetected { .. } => MessageType::CrisisDetected,
            SessionMessage::SessionClose { .. } => MessageType::SessionClose,
        }
    }
}

/// An event as delivered to a subscriber
#[derive(Debug, Clone)]
pub struct Event {
    pub message: SessionMessage,
    pub published_at: DateTime<Utc>,
}

type TopicKey = (String, MessageType);

struct SubscriptionShared {
    id: u64,
    capacity: usize,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriptionShared {
    /// Enqueue with drop-oldest; never blocks the publisher
    fn push(&self, event: Event) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// A scoped handle onto one `(session_id, message_type)` topic
///
/// Events published after the handle is dropped are not delivered; events
/// published before the subscription existed are never replayed.
pub struct Subscription {
    session_id: String,
    message_type: MessageType,
    shared: Arc<SubscriptionShared>,
    dispatcher: Weak<DispatcherInner>,
}

impl Subscription {
    /// Wait for the next event; `None` once the subscription is closed and drained
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(event) = self.pop() {
                return Some(event);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return self.pop();
            }
            notified.await;
        }
    }

    /// Non-blocking poll
    pub fn try_recv(&mut self) -> Option<Event> {
        self.pop()
    }

    fn pop(&self) -> Option<Event> {
        self.shared.queue.lock().unwrap().pop_front()
    }

    /// How many events this subscription has lost to the drop-oldest policy
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Close without dropping the handle; remaining queued events stay readable
    pub fn close(&self) {
        self.unregister();
        self.shared.close();
    }

    fn unregister(&self) {
        if let Some(inner) = self.dispatcher.upgrade() {
            let key = (self.session_id.clone(), self.message_type);
            let mut topics = inner.topics.lock().unwrap();
            if let Some(subs) = topics.get_mut(&key) {
                subs.retain(|s| s.id != self.shared.id);
                if subs.is_empty() {
                    topics.remove(&key);
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unregister();
        self.shared.close();
    }
}

struct DispatcherInner {
    topics: Mutex<HashMap<TopicKey, Vec<Arc<SubscriptionShared>>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Process-wide dispatcher, shared by all sessions
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
    queue_capacity: usize,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a subscriber for a topic
    ///
    /// After [`Dispatcher::disconnect`] the returned subscription is already
    /// closed and will yield no events.
    pub fn subscribe(&self, session_id: &str, message_type: MessageType) -> Subscription {
        self.subscribe_with_capacity(session_id, message_type, self.queue_capacity)
    }

    /// Register a subscriber with an explicit queue capacity
    pub fn subscribe_with_capacity(
        &self,
        session_id: &str,
        message_type: MessageType,
        capacity: usize,
    ) -> Subscription {
        let shared = Arc::new(SubscriptionShared {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });

        if self.inner.closed.load(Ordering::Acquire) {
            shared.close();
        } else {
            let key = (session_id.to_string(), message_type);
            let mut topics = self.inner.topics.lock().unwrap();
            topics.entry(key).or_default().push(shared.clone());
        }

        trace!(session_id, ?message_type, "subscription registered");
        Subscription {
            session_id: session_id.to_string(),
            message_type,
            shared,
            dispatcher: Arc::downgrade(&self.inner),
        }
    }

    /// Fan a message out to every current subscriber of its topic
    ///
    /// Broadcasting to a topic with no subscribers is a no-op success.
    /// The topic lock is held only to snapshot the subscriber set; the
    /// per-subscriber enqueue happens outside it and never blocks.
    pub fn broadcast(&self, session_id: &str, message: SessionMessage) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let message_type = message.message_type();
        let subscribers: Vec<Arc<SubscriptionShared>> = {
            let topics = self.inner.topics.lock().unwrap();
            match topics.get(&(session_id.to_string(), message_type)) {
                Some(subs) => subs.clone(),
                None => return,
            }
        };
        let event = Event {
            message,
            published_at: Utc::now(),
        };
        for sub in &subscribers {
            sub.push(event.clone());
        }
    }

    /// Non-blocking poll of a subscription; used to interleave topics
    pub fn try_get(subscription: &mut Subscription) -> Option<Event> {
        subscription.try_recv()
    }

    /// Close every subscription and discard all further publishes; idempotent
    pub fn disconnect(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let topics: Vec<Arc<SubscriptionShared>> = {
            let mut map = self.inner.topics.lock().unwrap();
            map.drain().flat_map(|(_, subs)| subs).collect()
        };
        debug!(subscriptions = topics.len(), "dispatcher disconnected");
        for sub in topics {
            sub.close();
        }
    }

    /// Current subscriber count for a topic (diagnostics and tests)
    pub fn subscriber_count(&self, session_id: &str, message_type: MessageType) -> usize {
        let topics = self.inner.topics.lock().unwrap();
        topics
            .get(&(session_id.to_string(), message_type))
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
