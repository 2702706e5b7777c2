//! Plugin that only logs

use super::Plugin;
use async_trait::async_trait;
use iris_core::{ChannelError, Message, Mode};

/// Writes each message to the log and reports success
#[derive(Debug, Clone)]
pub struct LogPlugin {
    mode: Mode,
}

impl LogPlugin {
    /// Create for a mode
    #[must_use]
    pub fn new(mode: Mode) -> Self {
        Self { mode }
    }
}

#[async_trait]
impl Plugin for LogPlugin {
    fn mode(&self) -> &Mode {
        &self.mode
    }

    async fn send(&self, message: &Message) -> Result<(), ChannelError> {
        let destination = message
            .contact()
            .map(|c| c.destination.as_str())
            .ok_or_else(|| ChannelError::Permanent("message has no contact".into()))?;
        tracing::info!(
            mode = %self.mode,
            message_id = %message.id,
            destination,
            subject = %message.subject,
            "delivered message"
        );
        Ok(())
    }
}
