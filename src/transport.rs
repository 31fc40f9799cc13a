//! Contracts with the chat platform
//!
//! The engine never talks to a platform directly. Rendering goes through a
//! [`RenderTransport`], pings and session invites through a
//! [`SessionNotifier`]. Both are implemented by the hosting bot.

use crate::error::Result;
use crate::queue::{ParticipantId, QueueId, QueueSnapshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Channel identifier on the chat platform
pub type ChannelId = String;

/// Message identifier on the chat platform
pub type MessageId = String;

/// Opaque content of a display panel
pub type RenderPayload = serde_json::Value;

/// A message as returned by [`RenderTransport::fetch_recent_messages`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentMessage {
    pub message_id: MessageId,
    pub author_id: String,
}

/// Message-level access to a channel
#[async_trait]
pub trait RenderTransport: Send + Sync {
    /// Id the platform reports as author of messages this system sends
    fn system_author(&self) -> &str;

    /// Post a new message and return its id
    async fn send_message(&self, channel_id: &str, payload: &RenderPayload) -> Result<MessageId>;

    /// Replace the content of an existing message
    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        payload: &RenderPayload,
    ) -> Result<()>;

    /// The last `n` messages of the channel, oldest first
    async fn fetch_recent_messages(&self, channel_id: &str, n: usize)
        -> Result<Vec<RecentMessage>>;

    /// Remove every message in the channel
    async fn delete_all_messages(&self, channel_id: &str) -> Result<()>;
}

/// A matched participant that should be invited to a helper's session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInvite {
    pub participant_id: ParticipantId,
    pub helper_id: ParticipantId,
    pub queue_id: QueueId,
    pub queue_name: String,
}

/// Outbound pings and invites
#[async_trait]
pub trait SessionNotifier: Send + Sync {
    /// Invite a matched participant to the helper's session
    async fn invite_to_session(&self, invite: &SessionInvite) -> Result<()>;

    /// Someone joined an empty queue
    async fn notify_queue_ready(
        &self,
        queue: &QueueSnapshot,
        recipients: &[ParticipantId],
    ) -> Result<()>;

    /// A helper started hosting the queue
    async fn notify_queue_opened(
        &self,
        queue: &QueueSnapshot,
        recipients: &[ParticipantId],
    ) -> Result<()>;
}

/// Notifier that drops every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl SessionNotifier for NoopNotifier {
    async fn invite_to_session(&self, _invite: &SessionInvite) -> Result<()> {
        Ok(())
    }

    async fn notify_queue_ready(
        &self,
        _queue: &QueueSnapshot,
        _recipients: &[ParticipantId],
    ) -> Result<()> {
        Ok(())
    }

    async fn notify_queue_opened(
        &self,
        _queue: &QueueSnapshot,
        _recipients: &[ParticipantId],
    ) -> Result<()> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_recent_messages_oldest_first() {
        let transport = MockTransport::new();
        let a = transport
            .send_message("c1", &serde_json::json!({"n": 1}))
            .await
            .unwrap();
        let b = transport.post_as("c1", "alice");

        let recent = transport.fetch_recent_messages("c1", 5).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message_id, a);
        assert_eq!(recent[1].message_id, b);
        assert_eq!(recent[1].author_id, "alice");

        let last = transport.fetch_recent_messages("c1", 1).await.unwrap();
        assert_eq!(last[0].message_id, b);
    }

    #[tokio::test]
    async fn test_noop_notifier() {
        let notifier = NoopNotifier;
        let invite = SessionInvite {
            participant_id: "p1".into(),
            helper_id: "h1".into(),
            queue_id: "q".into(),
            queue_name: "Math".into(),
        };
        assert!(notifier.invite_to_session(&invite).await.is_ok());
    }

    #[test]
    fn test_session_invite_serialization() {
        let invite = SessionInvite {
            participant_id: "p1".into(),
            helper_id: "h1".into(),
            queue_id: "q".into(),
            queue_name: "Math".into(),
        };
        let json = serde_json::to_string(&invite).unwrap();
        let parsed: SessionInvite = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, invite);
    }
}
