//! Event emission.
//!
//! Ledger and payout changes are pushed to subscribed RPC connections as
//! JSON-RPC notifications. Each subscriber has an independent buffer; a
//! subscriber that falls behind by more than the capacity skips events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use creatorpay_types::unix_now;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// An event emitted by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event type name (e.g. "RevenuePosted", "PayoutCompleted").
    pub event_type: String,
    /// Unix timestamp.
    pub timestamp: u64,
    /// Type-specific payload.
    pub payload: serde_json::Value,
}

impl Event {
    pub fn now(event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            timestamp: unix_now(),
            payload,
        }
    }
}

/// Filter for event subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Category filter: "ledger", "payout", "referral", "system".
    #[serde(default)]
    pub categories: Option<Vec<String>>,
    /// Only events whose payload names one of these creators.
    #[serde(default)]
    pub creator_ids: Option<Vec<String>>,
}

/// Event bus for broadcasting events to subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: Event) {
        self.sequence.fetch_add(1, Ordering::SeqCst);
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Number of events emitted so far.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl EventFilter {
    /// Check if an event matches this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref categories) = self.categories {
            let category = categorize_event(&event.event_type);
            if !categories.iter().any(|c| c == category) {
                return false;
            }
        }

        if let Some(ref creator_ids) = self.creator_ids {
            match event.payload.get("creator_id").and_then(|v| v.as_str()) {
                Some(creator) if creator_ids.iter().any(|id| id == creator) => {}
                _ => return false,
            }
        }

        true
    }
}

fn categorize_event(event_type: &str) -> &'static str {
    match event_type {
        s if s.starts_with("Revenue") || s.starts_with("Ledger") || s.starts_with("Creator") => {
            "ledger"
        }
        s if s.starts_with("Payout") => "payout",
        s if s.starts_with("Referral") => "referral",
        _ => "system",
    }
}
