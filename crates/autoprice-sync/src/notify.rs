use std::sync::Arc;

use autoprice_storage::{NotificationChannel, ServiceError};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
#[error("delivering {subject:?} via {channel} failed: {source}")]
pub struct NotifyError {
    pub channel: String,
    pub subject: String,
    #[source]
    pub source: ServiceError,
}

/// Logs every notification and forwards it to each configured channel.
#[derive(Clone, Default)]
pub struct Notifier {
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl Notifier {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self { channels }
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Tries every channel and reports the first failure.
    pub async fn publish(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        info!(subject, body, channels = self.channels.len(), "notification");

        let mut first_error = None;
        for channel in &self.channels {
            if let Err(source) = channel.publish(subject, body).await {
                error!(channel = channel.name(), subject, error = %source, "notification delivery failed");
                first_error.get_or_insert(NotifyError {
                    channel: channel.name().to_string(),
                    subject: subject.to_string(),
                    source,
                });
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use autoprice_adapters::RecordingChannel;

    use super::*;

    #[tokio::test]
    async fn log_only_notifier_always_succeeds() {
        let notifier = Notifier::default();
        notifier.publish("subject", "body").await.unwrap();
        assert!(notifier.channel_names().is_empty());
    }

    #[tokio::test]
    async fn every_channel_receives_the_message_even_after_a_failure() {
        let failing = RecordingChannel::new();
        failing.set_failing(true).await;
        let healthy = RecordingChannel::new();
        let channels: Vec<Arc<dyn NotificationChannel>> = vec![failing.clone(), healthy.clone()];
        let notifier = Notifier::new(channels);

        let err = notifier.publish("[AutoPrice] test", "hello").await.unwrap_err();
        assert_eq!(err.channel, "recording");
        assert_eq!(
            healthy.published().await,
            vec![("[AutoPrice] test".to_string(), "hello".to_string())]
        );
    }
}
