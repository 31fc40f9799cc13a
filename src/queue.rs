//! A single office-hours waiting line
//!
//! [`HelpQueue`] holds the open/closed state, the FIFO list of waiting
//! participants, the helpers authorized to serve it, the helpers currently
//! hosting it and the participants subscribed to "queue is open" pings.
//!
//! Every method is synchronous: precondition checks and the mutation they
//! guard happen without a suspension point in between. The owning
//! [`Workspace`](crate::workspace::Workspace) calls them while holding its
//! state lock and performs rendering and notification afterwards.

use crate::error::{QueueError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Queue identifier (equal to the id of the backing channel)
pub type QueueId = String;

/// Participant identifier (students and helpers alike)
pub type ParticipantId = String;

/// One participant's place in a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingEntry {
    pub participant_id: ParticipantId,
    pub queue_id: QueueId,
    pub wait_start: DateTime<Utc>,
    /// Set once a helper picked this entry, cleared when the participant
    /// shows up in the session channel
    #[serde(default)]
    pub up_next: bool,
}

impl WaitingEntry {
    pub fn new(
        participant_id: impl Into<String>,
        queue_id: impl Into<String>,
        wait_start: DateTime<Utc>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            queue_id: queue_id.into(),
            wait_start,
            up_next: false,
        }
    }
}

/// Result of a successful [`HelpQueue::enqueue`]
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub entry: WaitingEntry,
    /// The queue was empty before this entry; helpers and subscribers should be pinged
    pub first_in_line: bool,
    /// Position in line, starting at 1
    pub position: usize,
}

/// Read-only view of a queue handed to renderers and extensions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub id: QueueId,
    pub name: String,
    pub is_open: bool,
    pub waiting: Vec<WaitingEntry>,
    pub authorized_helpers: Vec<ParticipantId>,
    pub hosts: Vec<ParticipantId>,
    pub notify_subscribers: Vec<ParticipantId>,
}

/// Office-hours queue
#[derive(Debug, Clone)]
pub struct HelpQueue {
    id: QueueId,
    name: String,
    is_open: bool,
    waiting: VecDeque<WaitingEntry>,
    authorized_helpers: BTreeSet<ParticipantId>,
    notify_subscribers: BTreeSet<ParticipantId>,
    /// Helpers hosting this queue, with the time they started hosting it
    hosts: BTreeMap<ParticipantId, DateTime<Utc>>,
}

impl HelpQueue {
    /// Create a closed, empty queue
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_open: false,
            waiting: VecDeque::new(),
            authorized_helpers: BTreeSet::new(),
            notify_subscribers: BTreeSet::new(),
            hosts: BTreeMap::new(),
        }
    }

    /// Rebuild a queue from persisted parts. Restored queues are always closed.
    pub(crate) fn restore(
        id: QueueId,
        name: String,
        waiting: Vec<WaitingEntry>,
        authorized_helpers: BTreeSet<ParticipantId>,
        notify_subscribers: BTreeSet<ParticipantId>,
    ) -> Self {
        let mut seen = BTreeSet::new();
        let waiting = waiting
            .into_iter()
            .filter(|e| seen.insert(e.participant_id.clone()))
            .map(|mut e| {
                e.queue_id = id.clone();
                e.up_next = false;
                e
            })
            .collect();
        Self {
            id,
            name,
            is_open: false,
            waiting,
            authorized_helpers,
            notify_subscribers,
            hosts: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// The longest-waiting entry
    pub fn head(&self) -> Option<&WaitingEntry> {
        self.waiting.front()
    }

    pub fn waiting(&self) -> impl Iterator<Item = &WaitingEntry> {
        self.waiting.iter()
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.waiting.iter().any(|e| e.participant_id == participant_id)
    }

    /// 1-based position of a participant in line
    pub fn position_of(&self, participant_id: &str) -> Option<usize> {
        self.waiting
            .iter()
            .position(|e| e.participant_id == participant_id)
            .map(|i| i + 1)
    }

    pub fn is_authorized(&self, helper_id: &str) -> bool {
        self.authorized_helpers.contains(helper_id)
    }

    pub fn authorized_helpers(&self) -> impl Iterator<Item = &ParticipantId> {
        self.authorized_helpers.iter()
    }

    pub fn is_hosted_by(&self, helper_id: &str) -> bool {
        self.hosts.contains_key(helper_id)
    }

    /// When `helper_id` started hosting this queue
    pub fn host_start(&self, helper_id: &str) -> Option<DateTime<Utc>> {
        self.hosts.get(helper_id).copied()
    }

    pub fn hosts(&self) -> impl Iterator<Item = &ParticipantId> {
        self.hosts.keys()
    }

    pub fn is_subscribed(&self, participant_id: &str) -> bool {
        self.notify_subscribers.contains(participant_id)
    }

    pub fn notify_subscribers(&self) -> impl Iterator<Item = &ParticipantId> {
        self.notify_subscribers.iter()
    }

    /// Grant a helper permission to serve this queue. Returns false if already granted.
    pub fn authorize_helper(&mut self, helper_id: impl Into<String>) -> bool {
        self.authorized_helpers.insert(helper_id.into())
    }

    /// Revoke a helper's permission. A hosting helper is detached, which
    /// closes the queue when they were its last host. Returns true if the
    /// queue closed as a result.
    pub fn revoke_helper(&mut self, helper_id: &str) -> bool {
        self.authorized_helpers.remove(helper_id);
        self.detach_host(helper_id)
    }

    /// Open the queue with `helper_id` as its first host
    pub fn open(&mut self, helper_id: &str, now: DateTime<Utc>) -> Result<()> {
        if !self.is_authorized(helper_id) {
            return Err(QueueError::NoPermission(self.name.clone()));
        }
        if self.is_open {
            return Err(QueueError::AlreadyOpen(self.name.clone()));
        }
        self.is_open = true;
        self.hosts.insert(helper_id.to_string(), now);
        Ok(())
    }

    /// Add a host to a queue another helper already opened
    pub fn attach_host(&mut self, helper_id: &str, now: DateTime<Utc>) -> Result<()> {
        if !self.is_authorized(helper_id) {
            return Err(QueueError::NoPermission(self.name.clone()));
        }
        if !self.is_open {
            return Err(QueueError::QueueNotOpen(self.name.clone()));
        }
        self.hosts.entry(helper_id.to_string()).or_insert(now);
        Ok(())
    }

    /// Close the queue for every host. Waiting participants stay in line.
    pub fn close(&mut self) -> Result<()> {
        if !self.is_open {
            return Err(QueueError::AlreadyClosed(self.name.clone()));
        }
        self.is_open = false;
        self.hosts.clear();
        Ok(())
    }

    /// Remove one host. Returns true if that left the queue without hosts
    /// and it was closed.
    pub fn detach_host(&mut self, helper_id: &str) -> bool {
        if self.hosts.remove(helper_id).is_none() {
            return false;
        }
        if self.hosts.is_empty() && self.is_open {
            self.is_open = false;
            return true;
        }
        false
    }

    /// Append a participant to the back of the line
    pub fn enqueue(
        &mut self,
        participant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        if !self.is_open {
            return Err(QueueError::QueueNotOpen(self.name.clone()));
        }
        if self.contains(participant_id) {
            return Err(QueueError::AlreadyInQueue(self.name.clone()));
        }
        let first_in_line = self.waiting.is_empty();
        let entry = WaitingEntry::new(participant_id, self.id.clone(), now);
        self.waiting.push_back(entry.clone());
        Ok(EnqueueOutcome {
            entry,
            first_in_line,
            position: self.waiting.len(),
        })
    }

    /// Remove the head entry, or `target` anywhere in line, on behalf of a helper
    pub fn dequeue_with_helper(
        &mut self,
        helper_id: &str,
        target: Option<&str>,
    ) -> Result<WaitingEntry> {
        if !self.is_authorized(helper_id) {
            return Err(QueueError::NoPermission(self.name.clone()));
        }
        let index = match target {
            Some(participant_id) => self
                .waiting
                .iter()
                .position(|e| e.participant_id == participant_id),
            None if self.waiting.is_empty() => None,
            None => Some(0),
        };
        let mut entry = index
            .and_then(|i| self.waiting.remove(i))
            .ok_or_else(|| QueueError::EmptyQueue(self.name.clone()))?;
        entry.up_next = true;
        Ok(entry)
    }

    /// Remove a participant who left voluntarily. No-op if absent.
    pub fn remove_participant(&mut self, participant_id: &str) -> Option<WaitingEntry> {
        let index = self
            .waiting
            .iter()
            .position(|e| e.participant_id == participant_id)?;
        self.waiting.remove(index)
    }

    /// Empty the line
    pub fn remove_all(&mut self) -> Vec<WaitingEntry> {
        self.waiting.drain(..).collect()
    }

    pub fn add_to_notif_group(&mut self, participant_id: &str) -> Result<()> {
        if !self.notify_subscribers.insert(participant_id.to_string()) {
            return Err(QueueError::AlreadySubscribed(self.name.clone()));
        }
        Ok(())
    }

    pub fn remove_from_notif_group(&mut self, participant_id: &str) -> Result<()> {
        if !self.notify_subscribers.remove(participant_id) {
            return Err(QueueError::NotSubscribed(self.name.clone()));
        }
        Ok(())
    }

    /// Current hosts and subscribers, each listed once
    pub fn notification_recipients(&self) -> Vec<ParticipantId> {
        let mut recipients: BTreeSet<ParticipantId> = self.hosts.keys().cloned().collect();
        recipients.extend(self.notify_subscribers.iter().cloned());
        recipients.into_iter().collect()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            is_open: self.is_open,
            waiting: self.waiting.iter().cloned().collect(),
            authorized_helpers: self.authorized_helpers.iter().cloned().collect(),
            hosts: self.hosts.keys().cloned().collect(),
            notify_subscribers: self.notify_subscribers.iter().cloned().collect(),
        }
    }
}
