//! Attendance and help-session accounting
//!
//! An [`AttendanceEntry`] is opened when a helper starts a session and
//! accumulates the time during which at least one served participant was
//! present in the helper's session channel. A [`HelpSessionEntry`] records a
//! single served participant's visit to a helper's session.
//!
//! Finished attendance is handed out exactly once by
//! [`StatsCollector::finish_attendance`]; closed help sessions are handed out
//! exactly once by [`StatsCollector::take_help_sessions`].

use crate::error::{QueueError, Result};
use crate::queue::{ParticipantId, QueueId, WaitingEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One helper session's attendance record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEntry {
    pub helper_id: ParticipantId,
    pub help_start: DateTime<Utc>,
    pub help_end: Option<DateTime<Utc>>,
    /// Milliseconds during which at least one served participant was with the helper
    pub active_time_ms: u64,
    pub served: Vec<ParticipantId>,
}

impl AttendanceEntry {
    pub fn new(helper_id: impl Into<String>, help_start: DateTime<Utc>) -> Self {
        Self {
            helper_id: helper_id.into(),
            help_start,
            help_end: None,
            active_time_ms: 0,
            served: Vec::new(),
        }
    }

    /// Total session length, if the session ended
    pub fn session_ms(&self) -> Option<u64> {
        self.help_end
            .map(|end| elapsed_ms(self.help_start, end))
    }
}

/// One served participant's time in a helper's session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpSessionEntry {
    pub id: Uuid,
    pub participant_id: ParticipantId,
    pub helper_id: ParticipantId,
    pub queue_id: QueueId,
    pub wait_start: DateTime<Utc>,
    pub session_start: DateTime<Utc>,
    pub session_end: Option<DateTime<Utc>>,
}

impl HelpSessionEntry {
    /// Time from joining the queue until reaching the helper
    pub fn wait_ms(&self) -> u64 {
        elapsed_ms(self.wait_start, self.session_start)
    }

    /// Time spent with the helper, if the session closed
    pub fn session_ms(&self) -> Option<u64> {
        self.session_end
            .map(|end| elapsed_ms(self.session_start, end))
    }
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

/// Per-workspace stats state
#[derive(Debug, Default)]
pub struct StatsCollector {
    attendance: HashMap<ParticipantId, AttendanceEntry>,
    /// Helper id → first join while no served participant was present
    latest_join: HashMap<ParticipantId, DateTime<Utc>>,
    open_sessions: Vec<HelpSessionEntry>,
    closed_sessions: Vec<HelpSessionEntry>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a helper session
    pub fn open_attendance(&mut self, helper_id: &str, help_start: DateTime<Utc>) {
        self.attendance
            .insert(helper_id.to_string(), AttendanceEntry::new(helper_id, help_start));
        self.latest_join.remove(helper_id);
    }

    /// Live view of a helper's running attendance
    pub fn attendance(&self, helper_id: &str) -> Option<&AttendanceEntry> {
        self.attendance.get(helper_id)
    }

    pub fn latest_join(&self, helper_id: &str) -> Option<DateTime<Utc>> {
        self.latest_join.get(helper_id).copied()
    }

    pub fn open_sessions(&self) -> &[HelpSessionEntry] {
        &self.open_sessions
    }

    /// A served participant joined a session channel where `helpers` are
    /// present. Each pair is (helper id, the entry that matched them).
    /// Returns the sessions opened.
    pub fn on_participant_join(
        &mut self,
        participant_id: &str,
        helpers: &[(ParticipantId, WaitingEntry)],
        now: DateTime<Utc>,
    ) -> Vec<HelpSessionEntry> {
        let mut opened = Vec::new();
        for (helper_id, entry) in helpers {
            let already_open = self
                .open_sessions
                .iter()
                .any(|s| s.participant_id == participant_id && &s.helper_id == helper_id);
            if already_open {
                continue;
            }
            let session = HelpSessionEntry {
                id: Uuid::new_v4(),
                participant_id: participant_id.to_string(),
                helper_id: helper_id.clone(),
                queue_id: entry.queue_id.clone(),
                wait_start: entry.wait_start,
                session_start: now,
                session_end: None,
            };
            self.latest_join.entry(helper_id.clone()).or_insert(now);
            self.open_sessions.push(session.clone());
            opened.push(session);
        }
        opened
    }

    /// A participant left their session channel. Returns the sessions closed.
    pub fn on_participant_leave(
        &mut self,
        participant_id: &str,
        now: DateTime<Utc>,
    ) -> Vec<HelpSessionEntry> {
        let (closing, remaining): (Vec<_>, Vec<_>) = self
            .open_sessions
            .drain(..)
            .partition(|s| s.participant_id == participant_id);
        self.open_sessions = remaining;
        self.close_sessions(closing, now)
    }

    /// A helper left their session channel. Returns the sessions closed.
    pub fn on_helper_leave(&mut self, helper_id: &str, now: DateTime<Utc>) -> Vec<HelpSessionEntry> {
        let (closing, remaining): (Vec<_>, Vec<_>) = self
            .open_sessions
            .drain(..)
            .partition(|s| s.helper_id == helper_id);
        self.open_sessions = remaining;
        self.close_sessions(closing, now)
    }

    fn close_sessions(
        &mut self,
        sessions: Vec<HelpSessionEntry>,
        now: DateTime<Utc>,
    ) -> Vec<HelpSessionEntry> {
        let mut closed = Vec::with_capacity(sessions.len());
        for mut session in sessions {
            session.session_end = Some(now);
            let helper_id = session.helper_id.clone();
            let still_busy = self.open_sessions.iter().any(|s| s.helper_id == helper_id);
            if !still_busy {
                self.accumulate_active(&helper_id, now);
            }
            self.closed_sessions.push(session.clone());
            closed.push(session);
        }
        closed
    }

    fn accumulate_active(&mut self, helper_id: &str, now: DateTime<Utc>) {
        if let Some(joined) = self.latest_join.remove(helper_id) {
            if let Some(attendance) = self.attendance.get_mut(helper_id) {
                attendance.active_time_ms += elapsed_ms(joined, now);
            }
        }
    }

    /// Finalize and hand out a helper's attendance. Open sessions of that
    /// helper are closed at `help_end`. Fails if already handed out.
    pub fn finish_attendance(
        &mut self,
        helper_id: &str,
        help_end: DateTime<Utc>,
        served: Vec<ParticipantId>,
    ) -> Result<AttendanceEntry> {
        if !self.attendance.contains_key(helper_id) {
            return Err(QueueError::AttendanceAlreadyExported(helper_id.to_string()));
        }
        let (closing, remaining): (Vec<_>, Vec<_>) = self
            .open_sessions
            .drain(..)
            .partition(|s| s.helper_id == helper_id);
        self.open_sessions = remaining;
        self.close_sessions(closing, help_end);
        self.accumulate_active(helper_id, help_end);

        let mut entry = self
            .attendance
            .remove(helper_id)
            .ok_or_else(|| QueueError::AttendanceAlreadyExported(helper_id.to_string()))?;
        entry.help_end = Some(help_end);
        entry.served = served;
        Ok(entry)
    }

    /// Drain closed help sessions
    pub fn take_help_sessions(&mut self) -> Vec<HelpSessionEntry> {
        std::mem::take(&mut self.closed_sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn served(helper: &str, participant: &str) -> (ParticipantId, WaitingEntry) {
        (helper.to_string(), WaitingEntry::new(participant, "q1", t(0)))
    }

    #[test]
    fn test_attendance_opens_with_zero_active_time() {
        let mut stats = StatsCollector::new();
        stats.open_attendance("h1", t(0));
        let entry = stats.attendance("h1").unwrap();
        assert_eq!(entry.active_time_ms, 0);
        assert!(entry.help_end.is_none());
    }

    #[test]
    fn test_join_opens_session_and_stamps_helper() {
        let mut stats = StatsCollector::new();
        stats.open_attendance("h1", t(0));

        let opened = stats.on_participant_join("p1", &[served("h1", "p1")], t(10));
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].wait_ms(), 10_000);
        assert_eq!(stats.latest_join("h1"), Some(t(10)));

        let again = stats.on_participant_join("p1", &[served("h1", "p1")], t(12));
        assert!(again.is_empty());
        assert_eq!(stats.open_sessions().len(), 1);
    }

    #[test]
    fn test_leave_closes_and_accumulates() {
        let mut stats = StatsCollector::new();
        stats.open_attendance("h1", t(0));
        stats.on_participant_join("p1", &[served("h1", "p1")], t(10));

        let closed = stats.on_participant_leave("p1", t(70));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].session_ms(), Some(60_000));
        assert_eq!(stats.attendance("h1").unwrap().active_time_ms, 60_000);
        assert!(stats.latest_join("h1").is_none());
    }

    #[test]
    fn test_overlapping_participants_count_once() {
        let mut stats = StatsCollector::new();
        stats.open_attendance("h1", t(0));
        stats.on_participant_join("p1", &[served("h1", "p1")], t(10));
        stats.on_participant_join("p2", &[served("h1", "p2")], t(20));
        stats.on_participant_leave("p1", t(30));
        assert_eq!(stats.attendance("h1").unwrap().active_time_ms, 0);
        stats.on_participant_leave("p2", t(50));
        assert_eq!(stats.attendance("h1").unwrap().active_time_ms, 40_000);
    }

    #[test]
    fn test_attendance_conservation_over_cycles() {
        let mut stats = StatsCollector::new();
        stats.open_attendance("h1", t(0));
        let cycles = [(10, 25), (40, 41), (100, 400)];
        for (i, (join, leave)) in cycles.iter().enumerate() {
            let p = format!("p{}", i);
            stats.on_participant_join(&p, &[served("h1", &p)], t(*join));
            stats.on_participant_leave(&p, t(*leave));
        }

        let entry = stats
            .finish_attendance("h1", t(500), vec!["p0".into(), "p1".into(), "p2".into()])
            .unwrap();
        assert_eq!(entry.active_time_ms, (15 + 1 + 300) * 1000);
        assert_eq!(entry.session_ms(), Some(500_000));
        assert_eq!(entry.served.len(), 3);

        assert_eq!(
            stats.finish_attendance("h1", t(501), vec![]).unwrap_err(),
            QueueError::AttendanceAlreadyExported("h1".into())
        );
    }

    #[test]
    fn test_finish_closes_running_sessions() {
        let mut stats = StatsCollector::new();
        stats.open_attendance("h1", t(0));
        stats.on_participant_join("p1", &[served("h1", "p1")], t(10));

        let entry = stats.finish_attendance("h1", t(30), vec!["p1".into()]).unwrap();
        assert_eq!(entry.active_time_ms, 20_000);
        assert!(stats.open_sessions().is_empty());

        let sessions = stats.take_help_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_end, Some(t(30)));
        assert!(stats.take_help_sessions().is_empty());
    }

    #[test]
    fn test_helper_leave_closes_their_sessions() {
        let mut stats = StatsCollector::new();
        stats.open_attendance("h1", t(0));
        stats.open_attendance("h2", t(0));
        stats.on_participant_join("p1", &[served("h1", "p1")], t(10));
        stats.on_participant_join("p2", &[served("h2", "p2")], t(10));

        let closed = stats.on_helper_leave("h1", t(25));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].participant_id, "p1");
        assert_eq!(stats.attendance("h1").unwrap().active_time_ms, 15_000);
        assert_eq!(stats.open_sessions().len(), 1);
    }

    #[test]
    fn test_leave_without_sessions_is_noop() {
        let mut stats = StatsCollector::new();
        stats.open_attendance("h1", t(0));
        assert!(stats.on_participant_leave("nobody", t(5)).is_empty());
        assert_eq!(stats.attendance("h1").unwrap().active_time_ms, 0);
    }

    #[test]
    fn test_two_helpers_in_one_session() {
        let mut stats = StatsCollector::new();
        stats.open_attendance("h1", t(0));
        stats.open_attendance("h2", t(0));
        let opened =
            stats.on_participant_join("p1", &[served("h1", "p1"), served("h2", "p1")], t(5));
        assert_eq!(opened.len(), 2);
        stats.on_participant_leave("p1", t(15));
        assert_eq!(stats.attendance("h1").unwrap().active_time_ms, 10_000);
        assert_eq!(stats.attendance("h2").unwrap().active_time_ms, 10_000);
    }

    #[test]
    fn test_entries_serialize() {
        let entry = AttendanceEntry::new("h1", t(0));
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"active_time_ms\":0"));
        let parsed: AttendanceEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }
}
