//! Helper registry
//!
//! Tracks which participants are currently running a helping session, when
//! the session started, whether it is paused, and who they served.

use crate::error::{QueueError, Result};
use crate::queue::{ParticipantId, WaitingEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Whether a helper is taking new participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperState {
    Active,
    Paused,
}

/// A participant currently helping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Helper {
    pub id: ParticipantId,
    pub help_start: DateTime<Utc>,
    pub help_end: Option<DateTime<Utc>>,
    /// Participants served this session, in the order they were matched
    pub helped: Vec<WaitingEntry>,
    pub state: HelperState,
}

impl Helper {
    pub fn new(id: impl Into<String>, help_start: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            help_start,
            help_end: None,
            helped: Vec::new(),
            state: HelperState::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == HelperState::Active
    }

    /// True if `participant_id` was matched to this helper this session
    pub fn has_served(&self, participant_id: &str) -> bool {
        self.helped.iter().any(|e| e.participant_id == participant_id)
    }

    /// Ids of everyone served, first match first
    pub fn served_ids(&self) -> Vec<ParticipantId> {
        self.helped.iter().map(|e| e.participant_id.clone()).collect()
    }
}

/// Active helpers of one workspace
#[derive(Debug, Default)]
pub struct HelperRegistry {
    helpers: HashMap<ParticipantId, Helper>,
}

impl HelperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.helpers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.helpers.is_empty()
    }

    pub fn is_helping(&self, helper_id: &str) -> bool {
        self.helpers.contains_key(helper_id)
    }

    pub fn get(&self, helper_id: &str) -> Option<&Helper> {
        self.helpers.get(helper_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Helper> {
        self.helpers.values()
    }

    /// Begin a session
    pub fn start(&mut self, helper_id: &str, now: DateTime<Utc>) -> Result<&Helper> {
        if self.helpers.contains_key(helper_id) {
            return Err(QueueError::AlreadyHosting);
        }
        let helper = self
            .helpers
            .entry(helper_id.to_string())
            .or_insert_with(|| Helper::new(helper_id, now));
        Ok(&*helper)
    }

    /// End a session and hand back the finished record
    pub fn stop(&mut self, helper_id: &str, now: DateTime<Utc>) -> Result<Helper> {
        let mut helper = self
            .helpers
            .remove(helper_id)
            .ok_or(QueueError::NotHosting)?;
        helper.help_end = Some(now);
        Ok(helper)
    }

    pub fn pause(&mut self, helper_id: &str) -> Result<()> {
        let helper = self
            .helpers
            .get_mut(helper_id)
            .ok_or(QueueError::NotHosting)?;
        if helper.state == HelperState::Paused {
            return Err(QueueError::HelperPaused);
        }
        helper.state = HelperState::Paused;
        Ok(())
    }

    pub fn resume(&mut self, helper_id: &str) -> Result<()> {
        let helper = self
            .helpers
            .get_mut(helper_id)
            .ok_or(QueueError::NotHosting)?;
        if helper.state == HelperState::Active {
            return Err(QueueError::HelperNotPaused);
        }
        helper.state = HelperState::Active;
        Ok(())
    }

    /// Append a matched entry to the helper's served list
    pub fn record_served(&mut self, helper_id: &str, entry: WaitingEntry) -> Result<()> {
        let helper = self
            .helpers
            .get_mut(helper_id)
            .ok_or(QueueError::NotHosting)?;
        helper.helped.push(entry);
        Ok(())
    }

    /// Clear the up-next flag once the participant reached the session
    pub fn mark_arrived(&mut self, helper_id: &str, participant_id: &str) {
        if let Some(helper) = self.helpers.get_mut(helper_id) {
            for entry in helper
                .helped
                .iter_mut()
                .filter(|e| e.participant_id == participant_id)
            {
                entry.up_next = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    #[test]
    fn test_start_and_stop() {
        let mut registry = HelperRegistry::new();
        let helper = registry.start("h1", t(0)).unwrap();
        assert_eq!(helper.help_start, t(0));
        assert!(helper.is_active());
        assert!(registry.is_helping("h1"));

        let finished = registry.stop("h1", t(60)).unwrap();
        assert_eq!(finished.help_end, Some(t(60)));
        assert!(!registry.is_helping("h1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cannot_start_twice() {
        let mut registry = HelperRegistry::new();
        registry.start("h1", t(0)).unwrap();
        assert_eq!(
            registry.start("h1", t(5)).unwrap_err(),
            QueueError::AlreadyHosting
        );
        assert_eq!(registry.get("h1").unwrap().help_start, t(0));
    }

    #[test]
    fn test_stop_without_start() {
        let mut registry = HelperRegistry::new();
        assert_eq!(registry.stop("h1", t(0)).unwrap_err(), QueueError::NotHosting);
    }

    #[test]
    fn test_pause_and_resume() {
        let mut registry = HelperRegistry::new();
        assert_eq!(registry.pause("h1").unwrap_err(), QueueError::NotHosting);

        registry.start("h1", t(0)).unwrap();
        assert_eq!(registry.resume("h1").unwrap_err(), QueueError::HelperNotPaused);
        registry.pause("h1").unwrap();
        assert_eq!(registry.get("h1").unwrap().state, HelperState::Paused);
        assert_eq!(registry.pause("h1").unwrap_err(), QueueError::HelperPaused);
        registry.resume("h1").unwrap();
        assert!(registry.get("h1").unwrap().is_active());
    }

    #[test]
    fn test_record_served_and_arrival() {
        let mut registry = HelperRegistry::new();
        registry.start("h1", t(0)).unwrap();
        let mut entry = WaitingEntry::new("p1", "q", t(1));
        entry.up_next = true;
        registry.record_served("h1", entry).unwrap();

        let helper = registry.get("h1").unwrap();
        assert!(helper.has_served("p1"));
        assert!(helper.helped[0].up_next);
        assert_eq!(helper.served_ids(), vec!["p1"]);

        registry.mark_arrived("h1", "p1");
        assert!(!registry.get("h1").unwrap().helped[0].up_next);
        assert_eq!(
            registry
                .record_served("h2", WaitingEntry::new("p2", "q", t(2)))
                .unwrap_err(),
            QueueError::NotHosting
        );
    }

    #[test]
    fn test_helper_serialization() {
        let helper = Helper::new("h1", t(0));
        let json = serde_json::to_string(&helper).unwrap();
        assert!(json.contains("\"state\":\"active\""));
        let parsed: Helper = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, helper);
    }
}
