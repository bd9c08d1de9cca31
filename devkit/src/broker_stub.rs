/*!
Broker doubles

`MockPublisher` stands in for `AmqpPublisher`: it records every task message
and answers from a script. `ScriptedProbe` answers reachability per address
and remembers who was probed.
*/

use anyhow::Result;
use async_trait::async_trait;
use fd_device_agent::{Probe, PublishError, TaskMessage, TaskPublisher};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub task: String,
    pub payload: Vec<u8>,
    pub wait_for_ack: bool,
}

/// Records published tasks; clones share the same log and script
#[derive(Clone, Default)]
pub struct MockPublisher {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    script: Arc<Mutex<VecDeque<Result<(), PublishError>>>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next publish; unscripted publishes succeed
    pub fn push_result(&self, result: Result<(), PublishError>) -> &Self {
        self.script.lock().push_back(result);
        self
    }

    /// Hold every publish for `delay` before answering; a delay past the
    /// publish timeout answers `Timeout`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn find_messages_by_task(&self, task: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.task == task)
            .cloned()
            .collect()
    }

    /// Parse the last message of a task as JSON
    pub fn get_last_json_message<T>(&self, task: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_task(task).last() {
            Some(last) => Ok(Some(serde_json::from_slice(&last.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().clear();
        self.script.lock().clear();
    }
}

#[async_trait]
impl TaskPublisher for MockPublisher {
    async fn publish(&self, message: &TaskMessage, wait_for_ack: bool, timeout: Duration) -> Result<(), PublishError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            if tokio::time::timeout(timeout, tokio::time::sleep(delay)).await.is_err() {
                return Err(PublishError::Timeout);
            }
        }

        let payload = message.to_bytes()?;
        self.published_messages.lock().push(MockMessage {
            task: message.task.clone(),
            payload,
            wait_for_ack,
        });
        info!("[MOCK] Published {} (ack: {})", message.task, wait_for_ack);

        self.script.lock().pop_front().unwrap_or(Ok(()))
    }

    fn target(&self) -> String {
        "mock-broker".to_string()
    }
}

/// Reachability by address; unknown addresses are unreachable
#[derive(Clone, Default)]
pub struct ScriptedProbe {
    reachable: Arc<Mutex<HashMap<String, bool>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reachable(self, address: &str) -> Self {
        self.reachable.lock().insert(address.to_string(), true);
        self
    }

    pub fn set_reachable(&self, address: &str, reachable: bool) {
        self.reachable.lock().insert(address.to_string(), reachable);
    }

    /// Every probed address, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn was_probed(&self, address: &str) -> bool {
        self.calls.lock().iter().any(|a| a == address)
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self, address: &str) -> bool {
        self.calls.lock().push(address.to_string());
        self.reachable.lock().get(address).copied().unwrap_or(false)
    }
}
