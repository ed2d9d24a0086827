use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use heapless::Vec;
use log::warn;

use crate::config::MAX_MESSAGE_LEN;

const INBOX_DEPTH: usize = 2;

pub type InboxMessage = Vec<u8, MAX_MESSAGE_LEN>;

/// Hand-off of raw chunk messages from the transport to the transfer worker.
///
/// Usually a `static`, shared by the transport binding and [`crate::Ota`].
pub struct OtaInbox {
    channel: Channel<CriticalSectionRawMutex, InboxMessage, INBOX_DEPTH>,
}

impl OtaInbox {
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
        }
    }

    /// Queue a message for the worker. Returns `false` if it was dropped.
    pub fn deliver(&self, payload: &[u8]) -> bool {
        let Ok(message) = InboxMessage::from_slice(payload) else {
            warn!("ota: dropping {} byte message, too long", payload.len());
            return false;
        };
        if self.channel.try_send(message).is_err() {
            warn!("ota: inbox full, dropping message");
            return false;
        }
        true
    }

    pub(crate) async fn receive(&self) -> InboxMessage {
        self.channel.receive().await
    }

    pub(crate) fn clear(&self) {
        while self.channel.try_receive().is_ok() {}
    }
}

impl Default for OtaInbox {
    fn default() -> Self {
        Self::new()
    }
}
