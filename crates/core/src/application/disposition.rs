// Disposition policy for messages whose processing failed
use crate::domain::{QueueMessage, StageConfig};
use crate::port::TimeProvider;
use std::sync::Arc;

/// What happens to a message after a processing failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Re-enqueue at the back of the primary queue
    Retry,
    /// Move to the stage's dead-letter queue
    DeadLetter,
    /// Discard for good and run the stage's cleanup action
    Drop,
}

/// Decides retry / dead-letter / drop from message age and dequeue count
///
/// The dequeue count has already been incremented for the current attempt
/// when `decide` runs. With the default `max_dequeue_count` of 1 the Retry
/// branch is therefore unreachable: a first failure goes straight to the
/// dead-letter queue.
pub struct DispositionPolicy {
    time_provider: Arc<dyn TimeProvider>,
    max_dequeue_count: u32,
    maximum_message_age_ms: i64,
}

impl DispositionPolicy {
    pub fn new(time_provider: Arc<dyn TimeProvider>, config: &StageConfig) -> Self {
        Self {
            time_provider,
            max_dequeue_count: config.max_dequeue_count,
            maximum_message_age_ms: config.maximum_message_age().as_millis() as i64,
        }
    }

    /// Age check wins over the dequeue count
    pub fn decide(&self, message: &QueueMessage) -> Disposition {
        if self.is_expired(message) {
            Disposition::Drop
        } else if message.dequeue_count < self.max_dequeue_count {
            Disposition::Retry
        } else {
            Disposition::DeadLetter
        }
    }

    /// True once the correlation is at least `maximum_message_age` old
    pub fn is_expired(&self, message: &QueueMessage) -> bool {
        message.age_millis(self.time_provider.now_millis()) >= self.maximum_message_age_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::time_provider::mocks::ManualTimeProvider;
    use serde_json::json;
    use std::time::Duration;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn policy(clock: &Arc<ManualTimeProvider>, max_dequeue_count: u32) -> DispositionPolicy {
        let config = StageConfig {
            max_dequeue_count,
            ..Default::default()
        };
        DispositionPolicy::new(clock.clone(), &config)
    }

    fn message(created_at: i64, dequeue_count: u32) -> QueueMessage {
        let mut m = QueueMessage::new("corr", created_at, &json!({})).unwrap();
        m.dequeue_count = dequeue_count;
        m
    }

    #[test]
    fn test_default_max_count_skips_retry() {
        // Count is 1 after the first dequeue; 1 < 1 is false
        let clock = Arc::new(ManualTimeProvider::new(1_000));
        let policy = policy(&clock, 1);
        assert_eq!(policy.decide(&message(1_000, 1)), Disposition::DeadLetter);
    }

    #[test]
    fn test_retry_until_count_reaches_max() {
        let clock = Arc::new(ManualTimeProvider::new(1_000));
        let policy = policy(&clock, 3);
        assert_eq!(policy.decide(&message(0, 1)), Disposition::Retry);
        assert_eq!(policy.decide(&message(0, 2)), Disposition::Retry);
        assert_eq!(policy.decide(&message(0, 3)), Disposition::DeadLetter);
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let clock = Arc::new(ManualTimeProvider::new(0));
        let policy = policy(&clock, 5);
        let m = message(0, 1);

        clock.set(7 * DAY_MS - 1);
        assert_eq!(policy.decide(&m), Disposition::Retry);

        clock.advance(Duration::from_millis(1));
        assert_eq!(policy.decide(&m), Disposition::Drop);
    }

    #[test]
    fn test_age_wins_over_count() {
        let clock = Arc::new(ManualTimeProvider::new(8 * DAY_MS));
        let policy = policy(&clock, 1);
        assert_eq!(policy.decide(&message(0, 1)), Disposition::Drop);
        assert_eq!(policy.decide(&message(0, 0)), Disposition::Drop);
    }
}
