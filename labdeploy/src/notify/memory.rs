//! In-memory notification sink

use std::sync::Mutex;

use crate::notify::{Notification, NotificationSink};

/// Keeps every notification, in publish order
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<Notification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far
    pub fn messages(&self) -> Vec<Notification> {
        match self.messages.lock() {
            Ok(messages) => messages.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Notifications for one host
    pub fn for_host(&self, host: &str) -> Vec<Notification> {
        self.messages()
            .into_iter()
            .filter(|n| n.host() == host)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NotificationSink for MemorySink {
    fn publish(&self, notification: &Notification) {
        let mut messages = match self.messages.lock() {
            Ok(messages) => messages,
            Err(poisoned) => poisoned.into_inner(),
        };
        messages.push(notification.clone());
    }
}
