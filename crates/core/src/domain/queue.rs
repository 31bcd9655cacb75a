// Queue Domain Model

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Queue path (opaque name of a durable FIFO inside the queue store)
pub type QueuePath = String;

/// Correlation identifier shared by every message descending from one received association
pub type CorrelationId = String;

/// Suffix appended to a primary queue path to derive its dead-letter queue
pub const DEAD_LETTER_SUFFIX: &str = "DeadLetter";

/// Derive the dead-letter queue path owned by a primary queue
pub fn dead_letter_path(primary: &str) -> QueuePath {
    format!("{}{}", primary, DEAD_LETTER_SUFFIX)
}

/// Message envelope stored on every queue.
///
/// The stage payload is kept as a JSON value so the stage engine can move,
/// retry and dead-letter messages without knowing the payload type. Handlers
/// decode it with [`QueueMessage::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub correlation_id: CorrelationId,

    /// Epoch ms when the correlation began (not when this message was enqueued)
    pub created_at: i64,

    /// Number of processing dequeues of this message instance
    #[serde(default)]
    pub dequeue_count: u32,

    pub payload: serde_json::Value,
}

impl QueueMessage {
    /// Create the first message of a new correlation
    pub fn new<T: Serialize>(
        correlation_id: impl Into<String>,
        created_at: i64,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            correlation_id: correlation_id.into(),
            created_at,
            dequeue_count: 0,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Create the next-stage message for the same correlation.
    ///
    /// Correlation id and `created_at` carry over; the dequeue count restarts at 0.
    pub fn derive<T: Serialize>(&self, payload: &T) -> Result<Self, serde_json::Error> {
        Self::new(self.correlation_id.clone(), self.created_at, payload)
    }

    /// Decode the payload into a stage item type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Age of the correlation at `now_millis`
    pub fn age_millis(&self, now_millis: i64) -> i64 {
        now_millis - self.created_at
    }

    /// Serialize the envelope for storage
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize an envelope read from storage
    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}
