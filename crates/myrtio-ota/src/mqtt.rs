//! MQTT binding of [`OtaTransport`].
//!
//! Topics for a device prefix `dev`:
//!
//! | Topic                  | Direction | Payload                     |
//! |------------------------|-----------|-----------------------------|
//! | `sub/dev/version`      | inbound   | update request              |
//! | `sub/dev/version/data` | inbound   | chunk, while transferring   |
//! | `dev/version`          | outbound  | running version report      |
//! | `dev/version/data`     | outbound  | chunk request               |

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use heapless::String;
use log::error;

use crate::error::TransportError;
use crate::inbox::OtaInbox;
use crate::transport::OtaTransport;

pub const TOPIC_MAX_LEN: usize = 64;

pub type Topic = String<TOPIC_MAX_LEN>;

/// Publish/subscribe surface of the MQTT client
#[allow(async_fn_in_trait)]
pub trait MqttClient {
    type Error: fmt::Debug;

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), Self::Error>;
    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaTopics {
    /// Update requests from the controller
    pub command: Topic,
    /// Chunks from the controller
    pub data: Topic,
    /// Version reports to the controller
    pub report: Topic,
    /// Chunk requests to the controller
    pub request: Topic,
}

impl OtaTopics {
    /// Topics under `prefix`, `None` if they do not fit [`TOPIC_MAX_LEN`]
    pub fn new(prefix: &str) -> Option<Self> {
        Some(Self {
            command: topic(format_args!("sub/{}/version", prefix))?,
            data: topic(format_args!("sub/{}/version/data", prefix))?,
            report: topic(format_args!("{}/version", prefix))?,
            request: topic(format_args!("{}/version/data", prefix))?,
        })
    }
}

fn topic(args: fmt::Arguments<'_>) -> Option<Topic> {
    let mut topic = Topic::new();
    topic.write_fmt(args).ok()?;
    Some(topic)
}

pub struct MqttOtaTransport<'a, C> {
    client: &'a C,
    topics: OtaTopics,
    inbox: &'a OtaInbox,
    receiving: AtomicBool,
}

impl<'a, C: MqttClient> MqttOtaTransport<'a, C> {
    pub fn new(client: &'a C, topics: OtaTopics, inbox: &'a OtaInbox) -> Self {
        Self {
            client,
            topics,
            inbox,
            receiving: AtomicBool::new(false),
        }
    }

    pub fn topics(&self) -> &OtaTopics {
        &self.topics
    }

    /// Route an inbound publish. Returns `true` if it was a chunk taken
    /// into the inbox.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) -> bool {
        if topic != self.topics.data.as_str() || !self.receiving.load(Ordering::Acquire) {
            return false;
        }
        self.inbox.deliver(payload)
    }
}

impl<C: MqttClient> OtaTransport for MqttOtaTransport<'_, C> {
    async fn prepare(&self) -> Result<(), TransportError> {
        self.client
            .subscribe(&self.topics.data)
            .await
            .map_err(|e| {
                error!("ota: cannot subscribe to {}: {:?}", self.topics.data, e);
                TransportError::Prepare
            })?;
        self.receiving.store(true, Ordering::Release);
        Ok(())
    }

    async fn finish(&self) -> Result<(), TransportError> {
        self.receiving.store(false, Ordering::Release);
        self.client
            .unsubscribe(&self.topics.data)
            .await
            .map_err(|e| {
                error!("ota: cannot unsubscribe from {}: {:?}", self.topics.data, e);
                TransportError::Finish
            })
    }

    async fn request(&self, data: &[u8]) -> Result<(), TransportError> {
        self.client
            .publish(&self.topics.request, data)
            .await
            .map_err(|e| {
                error!("ota: cannot publish chunk request: {:?}", e);
                TransportError::Publish
            })
    }

    async fn report(&self, data: &[u8]) -> Result<(), TransportError> {
        self.client
            .publish(&self.topics.report, data)
            .await
            .map_err(|e| {
                error!("ota: cannot publish version report: {:?}", e);
                TransportError::Publish
            })
    }
}
