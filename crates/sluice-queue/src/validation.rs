//! Enqueue-time payload validation

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::job::EnqueueOptions;
use crate::store::QueueError;

/// Required top-level payload keys per known queue.
///
/// Queues without rules accept any non-null payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadRules {
    required: HashMap<String, Vec<String>>,
}

impl PayloadRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `keys` on every payload enqueued to `queue`
    pub fn require(mut self, queue: &str, keys: &[&str]) -> Self {
        self.required
            .insert(queue.to_string(), keys.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn is_known(&self, queue: &str) -> bool {
        self.required.contains_key(queue)
    }

    /// Validate an enqueue request before it touches the store
    pub fn check(
        &self,
        queue: &str,
        payload: &serde_json::Value,
        opts: &EnqueueOptions,
    ) -> Result<(), QueueError> {
        if queue.trim().is_empty() {
            return Err(QueueError::Validation("queue name must not be empty".to_string()));
        }
        if payload.is_null() {
            return Err(QueueError::Validation("payload is required".to_string()));
        }
        if opts.max_attempts == 0 {
            return Err(QueueError::Validation("max_attempts must be at least 1".to_string()));
        }

        let Some(keys) = self.required.get(queue) else {
            return Ok(());
        };

        let object = payload.as_object().ok_or_else(|| {
            QueueError::Validation(format!("payload for queue '{}' must be a JSON object", queue))
        })?;

        let missing: Vec<&str> = keys
            .iter()
            .filter(|k| !matches!(object.get(k.as_str()), Some(v) if !v.is_null()))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(QueueError::Validation(format!(
                "payload for queue '{}' is missing: {}",
                queue,
                missing.join(", ")
            )))
        }
    }
}
