//! Test-double executor that records commands and returns preset results.
//!
//! Makes it easy to write deterministic tests for the scheduler layers and the
//! orchestrator without a cluster.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{CommandOutput, Credentials, RemoteExecutor};
use crate::error::Result;

/// Replays queued results in order. Once the queue is empty every command
/// succeeds with empty output.
pub struct MockExecutor {
    responses: Mutex<VecDeque<Result<CommandOutput>>>,
    commands: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockExecutor {
    pub fn new() -> Self {
        MockExecutor {
            responses: Mutex::new(VecDeque::new()),
            commands: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_responses(responses: Vec<Result<CommandOutput>>) -> Self {
        MockExecutor {
            responses: Mutex::new(responses.into()),
            commands: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Make every call take `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue one more result.
    pub fn push(&self, response: Result<CommandOutput>) {
        lock(&self.responses).push_back(response);
    }

    pub fn executed_commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    /// Number of recorded commands containing `needle`.
    pub fn count_matching(&self, needle: &str) -> usize {
        lock(&self.commands)
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn execute_command(
        &self,
        _credentials: &Credentials,
        command: &str,
    ) -> Result<CommandOutput> {
        lock(&self.commands).push(command.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = lock(&self.responses).pop_front();
        next.unwrap_or_else(|| Ok(CommandOutput::default()))
    }
}
