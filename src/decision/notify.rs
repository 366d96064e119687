//! Human escalation channel sender (§4.7 step 4; §7's "try next channel
//! on send failure; if all fail, record and retry on the next timeout
//! tick").

use async_trait::async_trait;
use tracing::warn;

use crate::error::{AgencyError, Result};

const MAX_CHANNEL_ATTEMPTS: usize = 3;

#[async_trait]
pub trait HumanNotifier: Send + Sync {
    async fn send(&self, channel: &str, decision_id: &str, reason: &str) -> Result<()>;
}

/// Sends escalations to a Telegram chat. Any channel name other than
/// `"telegram"` is accepted and treated as a no-op — email/dashboard
/// delivery has no outbound transport wired up; dashboard visibility
/// comes from the escalation row itself via `/status`.
pub struct TelegramNotifier {
    bot: teloxide::Bot,
    chat_id: teloxide::types::ChatId,
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>, chat_id: i64) -> Self {
        Self { bot: teloxide::Bot::new(token.into()), chat_id: teloxide::types::ChatId(chat_id) }
    }
}

#[async_trait]
impl HumanNotifier for TelegramNotifier {
    async fn send(&self, channel: &str, decision_id: &str, reason: &str) -> Result<()> {
        if channel != "telegram" {
            return Ok(());
        }
        use teloxide::prelude::Requester;
        self.bot
            .send_message(self.chat_id, format!("decision {decision_id} escalated: {reason}"))
            .await
            .map_err(|e| AgencyError::Transient(e.to_string()))?;
        Ok(())
    }
}

/// Tries each channel in turn, capped at [`MAX_CHANNEL_ATTEMPTS`] total
/// send calls, and returns the channels that accepted the message.
pub async fn notify_all(notifier: &dyn HumanNotifier, channels: &[&str], decision_id: &str, reason: &str) -> Vec<String> {
    let mut sent = Vec::new();
    for (attempts, channel) in channels.iter().enumerate() {
        if attempts >= MAX_CHANNEL_ATTEMPTS {
            break;
        }
        match notifier.send(channel, decision_id, reason).await {
            Ok(()) => sent.push(channel.to_string()),
            Err(e) => warn!(channel, error = %e, "escalation channel send failed"),
        }
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FailingNotifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HumanNotifier for FailingNotifier {
        async fn send(&self, _channel: &str, _decision_id: &str, _reason: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AgencyError::Transient("channel down".to_string()))
        }
    }

    #[tokio::test]
    async fn all_channels_failing_returns_empty_and_caps_attempts() {
        let notifier = FailingNotifier { calls: AtomicUsize::new(0) };
        let sent = notify_all(&notifier, &["telegram", "email", "dashboard"], "dec-1", "timeout").await;
        assert!(sent.is_empty());
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 3);
    }

    struct SucceedOnSecond {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HumanNotifier for SucceedOnSecond {
        async fn send(&self, _channel: &str, _decision_id: &str, _reason: &str) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(AgencyError::Transient("channel down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn falls_through_to_next_channel_on_failure() {
        let notifier = SucceedOnSecond { calls: AtomicUsize::new(0) };
        let sent = notify_all(&notifier, &["telegram", "email"], "dec-1", "timeout").await;
        assert_eq!(sent, vec!["email".to_string()]);
    }

    #[allow(dead_code)]
    fn assert_send_sync<T: Send + Sync>() {}
    #[allow(dead_code)]
    fn _compile_check(_n: Arc<dyn HumanNotifier>) {
        assert_send_sync::<Arc<dyn HumanNotifier>>();
    }
}
