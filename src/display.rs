//! Render-safety tracking for queue channels
//!
//! A queue channel shows one or more panels (panel 0 is the queue itself,
//! further panels are auxiliary such as an upcoming-hours schedule). The
//! [`DisplayGuard`] decides whether a panel may be edited in place or has to
//! be sent as a fresh message, and refuses to edit anything it did not write.
//!
//! Panels that have been sent are expected to be the last messages of the
//! channel, in panel order. When someone else posts in the channel that no longer
//! holds and [`DisplayGuard::render`] fails with
//! [`QueueError::UnsafeRender`]; [`DisplayGuard::cleanup`] purges the channel
//! and re-sends every panel that has content.

use crate::error::{QueueError, Result};
use crate::transport::{ChannelId, MessageId, RenderPayload, RenderTransport};

/// What a successful render did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    /// A new message was posted
    Sent(MessageId),
    /// An existing message was edited in place
    Edited(MessageId),
}

#[derive(Debug, Clone, Default)]
struct PanelSlot {
    /// Freshly sent and known to sit at its expected position
    ready: bool,
    message_id: Option<MessageId>,
    /// Last rendered content, re-sent on cleanup
    content: RenderPayload,
}

/// Per-channel render-safety state
#[derive(Debug, Clone)]
pub struct DisplayGuard {
    channel_id: ChannelId,
    panels: Vec<PanelSlot>,
    needs_cleanup: bool,
}

impl DisplayGuard {
    pub fn new(channel_id: impl Into<String>, panel_count: usize) -> Self {
        Self {
            channel_id: channel_id.into(),
            panels: vec![PanelSlot::default(); panel_count.max(1)],
            needs_cleanup: false,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn panel_count(&self) -> usize {
        self.panels.len()
    }

    pub fn is_ready(&self, panel: usize) -> bool {
        self.panels.get(panel).map(|p| p.ready).unwrap_or(false)
    }

    /// Message currently holding the panel, if any was sent
    pub fn message_id(&self, panel: usize) -> Option<&str> {
        self.panels.get(panel).and_then(|p| p.message_id.as_deref())
    }

    /// A previous render hit an unsafe channel and nothing cleaned it up yet
    pub fn needs_cleanup(&self) -> bool {
        self.needs_cleanup
    }

    /// Store panel content without touching the channel
    pub fn set_content(&mut self, panel: usize, payload: RenderPayload) -> Result<()> {
        let slot = self
            .panels
            .get_mut(panel)
            .ok_or(QueueError::PanelOutOfRange(panel))?;
        slot.content = payload;
        Ok(())
    }

    /// Show `payload` in `panel`
    ///
    /// A panel is edited in place only while the channel tail is exactly the
    /// ready panels' messages, in panel order, all written by this system.
    pub async fn render(
        &mut self,
        transport: &dyn RenderTransport,
        payload: RenderPayload,
        panel: usize,
        force_fresh: bool,
    ) -> Result<RenderOutcome> {
        let slot = self
            .panels
            .get(panel)
            .ok_or(QueueError::PanelOutOfRange(panel))?;

        if force_fresh || !slot.ready {
            let message_id = transport.send_message(&self.channel_id, &payload).await?;
            // later panels now sit above this one
            for later in self.panels.iter_mut().skip(panel + 1) {
                later.ready = false;
            }
            let slot = &mut self.panels[panel];
            slot.ready = true;
            slot.message_id = Some(message_id.clone());
            slot.content = payload;
            return Ok(RenderOutcome::Sent(message_id));
        }

        let expected: Vec<&str> = self
            .panels
            .iter()
            .filter(|p| p.ready)
            .filter_map(|p| p.message_id.as_deref())
            .collect();
        let recent = transport
            .fetch_recent_messages(&self.channel_id, expected.len())
            .await?;
        let system_author = transport.system_author();
        let in_place = recent.len() == expected.len()
            && recent
                .iter()
                .zip(&expected)
                .all(|(msg, id)| msg.author_id == system_author && msg.message_id == *id);
        let target = match (&self.panels[panel].message_id, in_place) {
            (Some(id), true) => id.clone(),
            _ => {
                self.needs_cleanup = true;
                return Err(QueueError::UnsafeRender {
                    channel_id: self.channel_id.clone(),
                    panel,
                });
            }
        };

        transport
            .edit_message(&self.channel_id, &target, &payload)
            .await?;
        self.panels[panel].content = payload;
        Ok(RenderOutcome::Edited(target))
    }

    /// Purge the channel and re-send every panel that has content
    pub async fn cleanup(&mut self, transport: &dyn RenderTransport) -> Result<()> {
        transport.delete_all_messages(&self.channel_id).await?;
        for slot in self.panels.iter_mut() {
            slot.ready = false;
            slot.message_id = None;
        }
        for index in 0..self.panels.len() {
            let content = self.panels[index].content.clone();
            if content.is_null() {
                continue;
            }
            let message_id = transport.send_message(&self.channel_id, &content).await?;
            let slot = &mut self.panels[index];
            slot.ready = true;
            slot.message_id = Some(message_id);
        }
        self.needs_cleanup = false;
        tracing::debug!(channel_id = %self.channel_id, "display cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{MockTransport, BOT};
    use serde_json::json;

    #[tokio::test]
    async fn test_first_render_sends_fresh() {
        let transport = MockTransport::new();
        let mut guard = DisplayGuard::new("c1", 1);
        assert!(!guard.is_ready(0));

        let outcome = guard.render(&transport, json!({"v": 1}), 0, false).await.unwrap();
        assert!(matches!(outcome, RenderOutcome::Sent(_)));
        assert!(guard.is_ready(0));
        assert_eq!(transport.messages("c1").len(), 1);
    }

    #[tokio::test]
    async fn test_second_render_edits_in_place() {
        let transport = MockTransport::new();
        let mut guard = DisplayGuard::new("c1", 1);
        guard.render(&transport, json!({"v": 1}), 0, false).await.unwrap();

        let outcome = guard.render(&transport, json!({"v": 2}), 0, false).await.unwrap();
        let msgs = transport.messages("c1");
        assert_eq!(msgs.len(), 1);
        assert_eq!(outcome, RenderOutcome::Edited(msgs[0].message_id.clone()));
        assert_eq!(msgs[0].payload, json!({"v": 2}));
        assert_eq!(transport.edit_count(), 1);
    }

    #[tokio::test]
    async fn test_foreign_message_makes_render_unsafe() {
        let transport = MockTransport::new();
        let mut guard = DisplayGuard::new("c1", 1);
        guard.render(&transport, json!({"v": 1}), 0, false).await.unwrap();
        transport.post_as("c1", "alice");
        let before: Vec<_> = transport
            .messages("c1")
            .iter()
            .map(|m| (m.message_id.clone(), m.payload.clone()))
            .collect();

        let err = guard
            .render(&transport, json!({"v": 2}), 0, false)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            QueueError::UnsafeRender {
                channel_id: "c1".into(),
                panel: 0
            }
        );
        assert!(guard.is_ready(0));
        assert!(guard.needs_cleanup());

        let after: Vec<_> = transport
            .messages("c1")
            .iter()
            .map(|m| (m.message_id.clone(), m.payload.clone()))
            .collect();
        assert_eq!(before, after);
        assert_eq!(transport.edit_count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_then_render_succeeds() {
        let transport = MockTransport::new();
        let mut guard = DisplayGuard::new("c1", 1);
        guard.render(&transport, json!({"v": 1}), 0, false).await.unwrap();
        transport.post_as("c1", "alice");
        assert!(guard.render(&transport, json!({"v": 2}), 0, false).await.is_err());

        guard.cleanup(&transport).await.unwrap();
        assert!(!guard.needs_cleanup());
        let msgs = transport.messages("c1");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].author_id, BOT);
        assert_eq!(msgs[0].payload, json!({"v": 1}));

        let outcome = guard.render(&transport, json!({"v": 3}), 0, false).await.unwrap();
        assert!(matches!(outcome, RenderOutcome::Edited(_)));
    }

    #[tokio::test]
    async fn test_force_fresh_always_sends() {
        let transport = MockTransport::new();
        let mut guard = DisplayGuard::new("c1", 1);
        guard.render(&transport, json!(1), 0, false).await.unwrap();
        transport.post_as("c1", "alice");

        let outcome = guard.render(&transport, json!(2), 0, true).await.unwrap();
        assert!(matches!(outcome, RenderOutcome::Sent(_)));
        assert_eq!(transport.send_count(), 2);
    }

    #[tokio::test]
    async fn test_multi_panel_positions() {
        let transport = MockTransport::new();
        let mut guard = DisplayGuard::new("c1", 2);
        guard.render(&transport, json!("queue"), 0, false).await.unwrap();
        guard.render(&transport, json!("schedule"), 1, false).await.unwrap();

        guard.render(&transport, json!("queue v2"), 0, false).await.unwrap();
        guard.render(&transport, json!("schedule v2"), 1, false).await.unwrap();
        let msgs = transport.messages("c1");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].payload, json!("queue v2"));
        assert_eq!(msgs[1].payload, json!("schedule v2"));
    }

    #[tokio::test]
    async fn test_deleted_messages_are_unsafe() {
        let transport = MockTransport::new();
        let mut guard = DisplayGuard::new("c1", 2);
        guard.render(&transport, json!("queue"), 0, false).await.unwrap();
        guard.render(&transport, json!("schedule"), 1, false).await.unwrap();
        transport.delete_all_messages("c1").await.unwrap();

        assert!(guard.render(&transport, json!("x"), 1, false).await.is_err());
    }

    #[tokio::test]
    async fn test_panel_out_of_range() {
        let transport = MockTransport::new();
        let mut guard = DisplayGuard::new("c1", 1);
        assert_eq!(
            guard.render(&transport, json!(1), 3, false).await.unwrap_err(),
            QueueError::PanelOutOfRange(3)
        );
        assert!(guard.set_content(2, json!(1)).is_err());
    }

    #[tokio::test]
    async fn test_failed_send_leaves_panel_not_ready() {
        let transport = MockTransport::new();
        *transport.fail_sends.lock().unwrap() = true;
        let mut guard = DisplayGuard::new("c1", 1);
        assert!(guard.render(&transport, json!(1), 0, false).await.is_err());
        assert!(!guard.is_ready(0));
    }

    #[tokio::test]
    async fn test_only_first_panel_sent_edits_in_place() {
        let transport = MockTransport::new();
        let mut guard = DisplayGuard::new("c1", 2);
        guard.render(&transport, json!("queue"), 0, false).await.unwrap();

        let outcome = guard.render(&transport, json!("queue v2"), 0, false).await.unwrap();
        assert!(matches!(outcome, RenderOutcome::Edited(_)));
        assert!(!guard.needs_cleanup());
        let msgs = transport.messages("c1");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload, json!("queue v2"));
    }

    #[tokio::test]
    async fn test_fresh_first_panel_never_edits_schedule() {
        let transport = MockTransport::new();
        let mut guard = DisplayGuard::new("c1", 2);
        guard.render(&transport, json!("queue"), 0, false).await.unwrap();
        guard.render(&transport, json!("schedule"), 1, false).await.unwrap();

        guard.render(&transport, json!("queue v2"), 0, true).await.unwrap();
        assert!(!guard.is_ready(1));
        guard.render(&transport, json!("queue v3"), 0, false).await.unwrap();

        let msgs = transport.messages("c1");
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1].payload, json!("schedule"));
        assert_eq!(msgs[2].payload, json!("queue v3"));
        assert_eq!(guard.message_id(0), Some(msgs[2].message_id.as_str()));
    }
}
