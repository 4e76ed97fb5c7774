#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Event system for async communication in the zipline loader
//!
//! This crate provides the event types and channel aliases used for
//! communication between crates. All telemetry goes through events - no
//! direct logging or printing is allowed outside the embedding binary.

use serde::{Deserialize, Serialize};

/// Type alias for event sender
pub type EventSender = tokio::sync::mpsc::UnboundedSender<Event>;

/// Type alias for event receiver
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<Event>;

/// Create a new event channel
#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

/// Core event enum for all async communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Application load lifecycle
    ApplicationLoadStarted {
        app_name: String,
        manifest_url: Option<String>,
    },
    ApplicationLoadEnded {
        app_name: String,
        manifest_url: Option<String>,
    },
    ApplicationLoadFailed {
        app_name: String,
        manifest_url: Option<String>,
        error: String,
    },

    // Manifest events
    ManifestVerified {
        app_name: String,
        key_name: String,
    },

    // Download events
    DownloadStarted {
        url: String,
    },
    DownloadCompleted {
        url: String,
        size: u64,
    },
    DownloadFailed {
        url: String,
        error: String,
    },

    // Cache events
    CacheHit {
        hash: String,
    },
    CacheMiss {
        hash: String,
    },
    CacheEvicted {
        hash: String,
        size: u64,
    },

    // Receive engine events
    ModuleReceived {
        app_name: String,
        id: String,
    },
}

/// Event emitter that silently drops events when no listener is attached
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    sender: Option<EventSender>,
}

impl EventEmitter {
    /// Create a new emitter with no listener
    #[must_use]
    pub fn new() -> Self {
        Self { sender: None }
    }

    /// Attach an event sender
    #[must_use]
    pub fn with_sender(mut self, sender: EventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Send an event if a listener is attached
    pub fn emit(&self, event: Event) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}
