// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message dispatching.
//!
//! Trigger bodies and result messages leave the core through a [`Dispatcher`]. The queue
//! client itself lives outside the crate; two in-process implementations are provided.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::CoreError;

/// Per-message routing options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Queue-prefix routing hint carried forward from the trigger.
    pub prefix: Option<String>,
}

impl SendOptions {
    /// Options carrying `prefix`.
    pub fn with_prefix(prefix: Option<String>) -> Self {
        Self { prefix }
    }
}

/// Sends JSON bodies to named topics.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Enqueue `body` on `topic`.
    async fn send_to_queue(
        &self,
        topic: &str,
        body: &Value,
        options: &SendOptions,
    ) -> Result<(), CoreError>;
}

/// One message handed to a dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedMessage {
    /// Destination topic.
    pub topic: String,
    /// Message body.
    pub body: Value,
    /// Routing options.
    pub options: SendOptions,
}

/// Dispatcher that records messages in memory.
#[derive(Default)]
pub struct MemoryDispatcher {
    messages: Mutex<Vec<DispatchedMessage>>,
}

impl MemoryDispatcher {
    /// Empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message sent so far.
    pub fn messages(&self) -> Vec<DispatchedMessage> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Messages sent to `topic`.
    pub fn to_topic(&self, topic: &str) -> Vec<DispatchedMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    /// Remove and return every recorded message.
    pub fn take(&self) -> Vec<DispatchedMessage> {
        self.messages
            .lock()
            .map(|mut m| std::mem::take(&mut *m))
            .unwrap_or_default()
    }
}

#[async_trait]
impl Dispatcher for MemoryDispatcher {
    async fn send_to_queue(
        &self,
        topic: &str,
        body: &Value,
        options: &SendOptions,
    ) -> Result<(), CoreError> {
        let mut messages = self.messages.lock().map_err(|_| CoreError::DispatchFailed {
            topic: topic.to_string(),
            reason: "dispatcher mutex poisoned".to_string(),
        })?;
        messages.push(DispatchedMessage {
            topic: topic.to_string(),
            body: body.clone(),
            options: options.clone(),
        });
        Ok(())
    }
}

/// Dispatcher feeding an unbounded tokio channel.
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<DispatchedMessage>,
}

impl ChannelDispatcher {
    /// Dispatcher plus the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DispatchedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn send_to_queue(
        &self,
        topic: &str,
        body: &Value,
        options: &SendOptions,
    ) -> Result<(), CoreError> {
        self.tx
            .send(DispatchedMessage {
                topic: topic.to_string(),
                body: body.clone(),
                options: options.clone(),
            })
            .map_err(|e| CoreError::DispatchFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_dispatcher_records_and_filters() {
        let dispatcher = MemoryDispatcher::new();
        dispatcher
            .send_to_queue("m0/workflow", &json!({"a": 1}), &SendOptions::default())
            .await
            .unwrap();
        dispatcher
            .send_to_queue(
                "m1/load",
                &json!({"b": 2}),
                &SendOptions::with_prefix(Some("eu".to_string())),
            )
            .await
            .unwrap();

        assert_eq!(dispatcher.messages().len(), 2);
        let load = dispatcher.to_topic("m1/load");
        assert_eq!(load.len(), 1);
        assert_eq!(load[0].options.prefix.as_deref(), Some("eu"));

        assert_eq!(dispatcher.take().len(), 2);
        assert!(dispatcher.messages().is_empty());
    }

    #[tokio::test]
    async fn test_channel_dispatcher_fails_when_receiver_dropped() {
        let (dispatcher, mut rx) = ChannelDispatcher::channel();
        dispatcher
            .send_to_queue("m0/workflow", &json!({}), &SendOptions::default())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().topic, "m0/workflow");

        drop(rx);
        let err = dispatcher
            .send_to_queue("m0/workflow", &json!({}), &SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "DISPATCH_FAILED");
    }
}
