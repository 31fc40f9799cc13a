//! Workspace aggregate
//!
//! A [`Workspace`] owns every queue of one community, the helpers currently
//! hosting, and the attendance/session statistics. All state sits behind one
//! lock: an operation takes it, checks its preconditions and mutates without
//! awaiting anything else, then releases it before any I/O. Rendering,
//! notifications, extension fan-out and backups run on snapshots afterwards
//! and can never undo the mutation that produced them.

use crate::backup::{BackupStore, QueueBackup, WorkspaceBackup};
use crate::clock::{Clock, SystemClock};
use crate::config::WorkspaceConfig;
use crate::display::{DisplayGuard, RenderOutcome};
use crate::error::{QueueError, Result};
use crate::event::{events, EventEmitter, EventStream};
use crate::extension::{Extension, ExtensionEvent, ExtensionSet, FanOutReport};
use crate::helper::{Helper, HelperRegistry};
use crate::queue::{EnqueueOutcome, HelpQueue, ParticipantId, QueueId, QueueSnapshot, WaitingEntry};
use crate::stats::{AttendanceEntry, HelpSessionEntry, StatsCollector};
use crate::transport::{
    ChannelId, NoopNotifier, RenderPayload, RenderTransport, SessionInvite, SessionNotifier,
};
use crate::{QueueStatus, WorkspaceStats};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Workspace identifier (the community/server id)
pub type WorkspaceId = String;

/// Read-only view of a whole workspace
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceSnapshot {
    pub workspace_id: WorkspaceId,
    pub taken_at: DateTime<Utc>,
    /// Queues in creation order
    pub queues: Vec<QueueSnapshot>,
    /// Active helpers, sorted by id
    pub helpers: Vec<Helper>,
}

/// Result of a successful match
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServedParticipant {
    pub entry: WaitingEntry,
    pub queue_id: QueueId,
    pub queue_name: String,
    pub helper_id: ParticipantId,
}

/// Result of starting a helping session
#[derive(Debug, Clone, Serialize)]
pub struct HelpingStarted {
    pub helper: Helper,
    /// Queues this helper opened
    pub opened: Vec<QueueSnapshot>,
    /// Queues that were already open and now list this helper as a host
    pub joined: Vec<QueueSnapshot>,
}

/// Result of ending a helping session
#[derive(Debug, Clone, Serialize)]
pub struct HelpingStopped {
    pub helper: Helper,
    pub attendance: AttendanceEntry,
    /// Queues that closed because this helper was their last host
    pub closed: Vec<QueueSnapshot>,
}

#[derive(Default)]
struct WorkspaceState {
    queues: HashMap<QueueId, HelpQueue>,
    /// Queue ids in creation order
    queue_order: Vec<QueueId>,
    helpers: HelperRegistry,
    stats: StatsCollector,
    /// Session channel each present participant is in
    presence: HashMap<ParticipantId, ChannelId>,
}

impl WorkspaceState {
    fn queue(&self, queue_id: &str) -> Result<&HelpQueue> {
        self.queues
            .get(queue_id)
            .ok_or_else(|| QueueError::QueueNotFound(queue_id.to_string()))
    }

    fn queue_mut(&mut self, queue_id: &str) -> Result<&mut HelpQueue> {
        self.queues
            .get_mut(queue_id)
            .ok_or_else(|| QueueError::QueueNotFound(queue_id.to_string()))
    }

    fn insert_queue(&mut self, queue: HelpQueue) {
        self.queue_order.push(queue.id().to_string());
        self.queues.insert(queue.id().to_string(), queue);
    }

    fn ordered_queues(&self) -> impl Iterator<Item = &HelpQueue> {
        self.queue_order
            .iter()
            .filter_map(move |id| self.queues.get(id))
    }

    fn authorized_queue_ids(&self, helper_id: &str) -> Vec<QueueId> {
        self.ordered_queues()
            .filter(|q| q.is_authorized(helper_id))
            .map(|q| q.id().to_string())
            .collect()
    }

    /// Pick the queue to serve from when the helper named no queue
    fn select_queue(&self, helper_id: &str, target: Option<&str>) -> Result<QueueId> {
        let helper = self.helpers.get(helper_id).ok_or(QueueError::NotHosting)?;
        if !helper.is_active() {
            return Err(QueueError::HelperPaused);
        }

        if let Some(participant_id) = target {
            return self
                .ordered_queues()
                .filter(|q| q.is_authorized(helper_id))
                .find(|q| q.contains(participant_id))
                .map(|q| q.id().to_string())
                .ok_or(QueueError::NoOneToHelp);
        }

        // min_by_key keeps the first of equal keys, so ties go to the
        // earliest-created queue
        self.ordered_queues()
            .filter(|q| q.is_authorized(helper_id) && q.is_open())
            .filter_map(|q| q.head().map(|head| (head.wait_start, q)))
            .min_by_key(|(wait_start, _)| *wait_start)
            .map(|(_, q)| q.id().to_string())
            .ok_or(QueueError::NoOneToHelp)
    }

    fn snapshot(&self, workspace_id: &str, now: DateTime<Utc>) -> WorkspaceSnapshot {
        let mut helpers: Vec<Helper> = self.helpers.iter().cloned().collect();
        helpers.sort_by(|a, b| a.id.cmp(&b.id));
        WorkspaceSnapshot {
            workspace_id: workspace_id.to_string(),
            taken_at: now,
            queues: self.ordered_queues().map(HelpQueue::snapshot).collect(),
            helpers,
        }
    }
}

/// One community's queues, helpers and statistics
pub struct Workspace {
    id: WorkspaceId,
    config: WorkspaceConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<WorkspaceState>,
    displays: Mutex<HashMap<QueueId, Arc<Mutex<DisplayGuard>>>>,
    transport: Arc<dyn RenderTransport>,
    notifier: Arc<dyn SessionNotifier>,
    backup_store: Option<Arc<dyn BackupStore>>,
    extensions: ExtensionSet,
    event_emitter: EventEmitter,
    last_backup: Mutex<DateTime<Utc>>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("extensions", &self.extensions.len())
            .finish_non_exhaustive()
    }
}

impl Workspace {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn event_emitter(&self) -> &EventEmitter {
        &self.event_emitter
    }

    /// Stream of every lifecycle event of this workspace
    pub fn subscribe_events(&self) -> EventStream {
        self.event_emitter.subscribe_stream()
    }

    // ------------------------------------------------------------------
    // Queue administration
    // ------------------------------------------------------------------

    /// Provision a queue backed by channel `queue_id`
    pub async fn create_queue(&self, queue_id: &str, name: &str) -> Result<QueueSnapshot> {
        let snapshot = {
            let mut state = self.state.lock().await;
            if let Some(existing) = state
                .queues
                .values()
                .find(|q| q.name().eq_ignore_ascii_case(name))
            {
                return Err(QueueError::QueueNameTaken(existing.name().to_string()));
            }
            if state.queues.contains_key(queue_id) {
                return Err(QueueError::QueueNameTaken(name.to_string()));
            }
            let queue = HelpQueue::new(queue_id, name);
            let snapshot = queue.snapshot();
            state.insert_queue(queue);
            snapshot
        };

        self.displays.lock().await.insert(
            queue_id.to_string(),
            Arc::new(Mutex::new(DisplayGuard::new(
                queue_id,
                self.config.panel_count,
            ))),
        );

        tracing::info!(workspace_id = %self.id, queue_id, name, "queue created");
        self.event_emitter.emit(
            self.event_emitter
                .event(events::QUEUE_CREATED)
                .with("queue_id", queue_id)
                .with("name", name),
        );
        self.refresh_display(queue_id).await;
        self.fan_out(ExtensionEvent::QueueCreate(snapshot.clone())).await;
        Ok(snapshot)
    }

    /// Remove a queue; its waiting list is discarded
    pub async fn delete_queue(&self, queue_id: &str) -> Result<QueueSnapshot> {
        let snapshot = {
            let mut state = self.state.lock().await;
            let queue = state
                .queues
                .remove(queue_id)
                .ok_or_else(|| QueueError::QueueNotFound(queue_id.to_string()))?;
            state.queue_order.retain(|id| id != queue_id);
            queue.snapshot()
        };
        self.displays.lock().await.remove(queue_id);

        tracing::info!(
            workspace_id = %self.id,
            queue_id,
            discarded = snapshot.waiting.len(),
            "queue deleted"
        );
        self.event_emitter.emit(
            self.event_emitter
                .event(events::QUEUE_DELETED)
                .with("queue_id", queue_id)
                .with("discarded", snapshot.waiting.len()),
        );
        self.fan_out(ExtensionEvent::QueueDelete(snapshot.clone())).await;
        Ok(snapshot)
    }

    /// Grant `helper_id` the right to open and serve `queue_id`.
    /// Returns false if they already had it.
    pub async fn authorize_helper(&self, queue_id: &str, helper_id: &str) -> Result<bool> {
        let added = {
            let mut state = self.state.lock().await;
            state.queue_mut(queue_id)?.authorize_helper(helper_id)
        };
        if added {
            tracing::debug!(workspace_id = %self.id, queue_id, helper_id, "helper authorized");
            self.refresh_display(queue_id).await;
        }
        Ok(added)
    }

    /// Take away `helper_id`'s rights on `queue_id`. If they were its last
    /// host the queue closes. Returns false if they had no rights.
    pub async fn revoke_helper(&self, queue_id: &str, helper_id: &str) -> Result<bool> {
        let (removed, closed) = {
            let mut state = self.state.lock().await;
            let queue = state.queue_mut(queue_id)?;
            if !queue.is_authorized(helper_id) {
                return Ok(false);
            }
            let closed = queue.revoke_helper(helper_id);
            (true, closed.then(|| queue.snapshot()))
        };

        tracing::debug!(workspace_id = %self.id, queue_id, helper_id, "helper revoked");
        self.refresh_display(queue_id).await;
        if let Some(snapshot) = closed {
            self.announce_closed(snapshot).await;
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Single-queue lifecycle
    // ------------------------------------------------------------------

    /// Open one queue on behalf of a hosting helper
    pub async fn open_queue(&self, queue_id: &str, helper_id: &str) -> Result<QueueSnapshot> {
        let now = self.clock.now();
        let (snapshot, recipients) = {
            let mut state = self.state.lock().await;
            let hosting = state.helpers.is_helping(helper_id);
            let helping: Vec<ParticipantId> = state.helpers.iter().map(|h| h.id.clone()).collect();
            let queue = state.queue_mut(queue_id)?;
            if !queue.is_authorized(helper_id) {
                return Err(QueueError::NoPermission(queue.name().to_string()));
            }
            if !hosting {
                return Err(QueueError::NotHosting);
            }
            queue.open(helper_id, now)?;
            // every authorized helper on duty hosts the reopened queue
            let authorized: Vec<&ParticipantId> =
                helping.iter().filter(|h| queue.is_authorized(h)).collect();
            for other in authorized {
                queue.attach_host(other, now)?;
            }
            let recipients: Vec<ParticipantId> = queue.notify_subscribers().cloned().collect();
            (queue.snapshot(), recipients)
        };

        if self.config.notify_on_open {
            self.notify_opened(&snapshot, &recipients).await;
        }
        self.announce_opened(snapshot.clone(), helper_id).await;
        Ok(snapshot)
    }

    /// Close one queue. Waiting participants stay in line.
    pub async fn close_queue(&self, queue_id: &str, helper_id: &str) -> Result<QueueSnapshot> {
        let snapshot = {
            let mut state = self.state.lock().await;
            let queue = state.queue_mut(queue_id)?;
            if !queue.is_authorized(helper_id) {
                return Err(QueueError::NoPermission(queue.name().to_string()));
            }
            queue.close()?;
            queue.snapshot()
        };

        tracing::info!(workspace_id = %self.id, queue_id, helper_id, "queue closed");
        self.announce_closed(snapshot.clone()).await;
        Ok(snapshot)
    }

    // ------------------------------------------------------------------
    // Waiting participants
    // ------------------------------------------------------------------

    /// Put a participant at the back of a queue
    pub async fn enqueue(&self, queue_id: &str, participant_id: &str) -> Result<EnqueueOutcome> {
        let now = self.clock.now();
        let (outcome, snapshot, ready_recipients) = {
            let mut state = self.state.lock().await;
            if state.helpers.is_helping(participant_id) {
                return Err(QueueError::HelperCannotEnqueue);
            }
            let queue = state.queue_mut(queue_id)?;
            let outcome = queue.enqueue(participant_id, now)?;
            let recipients = outcome
                .first_in_line
                .then(|| queue.notification_recipients());
            (outcome, queue.snapshot(), recipients)
        };

        tracing::debug!(
            workspace_id = %self.id,
            queue_id,
            participant_id,
            position = outcome.position,
            "participant enqueued"
        );

        if let Some(recipients) = ready_recipients {
            if let Err(e) = self.notifier.notify_queue_ready(&snapshot, &recipients).await {
                tracing::warn!(queue_id, error = %e, "queue-ready notification failed");
            }
        }

        self.event_emitter.emit(
            self.event_emitter
                .event(events::PARTICIPANT_ENQUEUED)
                .with("queue_id", queue_id)
                .with("participant_id", participant_id)
                .with("position", outcome.position),
        );
        self.refresh_display(queue_id).await;
        self.fan_out(ExtensionEvent::Enqueue {
            queue: snapshot,
            entry: outcome.entry.clone(),
        })
        .await;
        Ok(outcome)
    }

    /// A participant leaves a queue voluntarily. Absent participants are a no-op.
    pub async fn leave_queue(
        &self,
        queue_id: &str,
        participant_id: &str,
    ) -> Result<Option<WaitingEntry>> {
        let removed = {
            let mut state = self.state.lock().await;
            state.queue_mut(queue_id)?.remove_participant(participant_id)
        };

        if removed.is_some() {
            self.event_emitter.emit(
                self.event_emitter
                    .event(events::PARTICIPANT_LEFT)
                    .with("queue_id", queue_id)
                    .with("participant_id", participant_id),
            );
        }
        self.refresh_display(queue_id).await;
        Ok(removed)
    }

    /// Empty a queue on behalf of an authorized helper
    pub async fn clear_queue(&self, queue_id: &str, helper_id: &str) -> Result<Vec<WaitingEntry>> {
        let removed = {
            let mut state = self.state.lock().await;
            let queue = state.queue_mut(queue_id)?;
            if !queue.is_authorized(helper_id) {
                return Err(QueueError::NoPermission(queue.name().to_string()));
            }
            queue.remove_all()
        };

        tracing::info!(
            workspace_id = %self.id,
            queue_id,
            helper_id,
            removed = removed.len(),
            "queue cleared"
        );
        self.event_emitter.emit(
            self.event_emitter
                .event(events::QUEUE_CLEARED)
                .with("queue_id", queue_id)
                .with("removed", removed.len()),
        );
        self.refresh_display(queue_id).await;
        Ok(removed)
    }

    /// Ask to be pinged when the queue opens
    pub async fn subscribe(&self, queue_id: &str, participant_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let queue = state.queue_mut(queue_id)?;
        queue.add_to_notif_group(participant_id)
    }

    pub async fn unsubscribe(&self, queue_id: &str, participant_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let queue = state.queue_mut(queue_id)?;
        queue.remove_from_notif_group(participant_id)
    }

    // ------------------------------------------------------------------
    // Matching
    // ------------------------------------------------------------------

    /// Match a helper with the next participant.
    ///
    /// With `target_queue` only authorization on that queue is required.
    /// Otherwise the helper must be hosting and not paused, and the
    /// participant who has waited longest across every open queue the
    /// helper may serve is picked. `target_participant` picks a specific
    /// participant instead of the head.
    pub async fn serve_next(
        &self,
        helper_id: &str,
        target_queue: Option<&str>,
        target_participant: Option<&str>,
    ) -> Result<ServedParticipant> {
        let (served, snapshot) = {
            let mut state = self.state.lock().await;
            let queue_id = match target_queue {
                Some(queue_id) => {
                    let queue = state.queue(queue_id)?;
                    if !queue.is_authorized(helper_id) {
                        return Err(QueueError::NoPermission(queue.name().to_string()));
                    }
                    queue_id.to_string()
                }
                None => state.select_queue(helper_id, target_participant)?,
            };

            let queue = state.queue_mut(&queue_id)?;
            let entry = queue.dequeue_with_helper(helper_id, target_participant)?;
            let snapshot = queue.snapshot();
            if state.helpers.is_helping(helper_id) {
                state.helpers.record_served(helper_id, entry.clone())?;
            }
            let served = ServedParticipant {
                entry,
                queue_id,
                queue_name: snapshot.name.clone(),
                helper_id: helper_id.to_string(),
            };
            (served, snapshot)
        };

        tracing::info!(
            workspace_id = %self.id,
            queue_id = %served.queue_id,
            participant_id = %served.entry.participant_id,
            helper_id,
            "participant matched"
        );

        let invite = SessionInvite {
            participant_id: served.entry.participant_id.clone(),
            helper_id: helper_id.to_string(),
            queue_id: served.queue_id.clone(),
            queue_name: served.queue_name.clone(),
        };
        if let Err(e) = self.notifier.invite_to_session(&invite).await {
            tracing::warn!(
                participant_id = %invite.participant_id,
                error = %e,
                "session invite failed"
            );
        }

        self.event_emitter.emit(
            self.event_emitter
                .event(events::PARTICIPANT_DEQUEUED)
                .with("queue_id", served.queue_id.as_str())
                .with("participant_id", served.entry.participant_id.as_str())
                .with("helper_id", helper_id),
        );
        self.refresh_display(&served.queue_id).await;
        self.fan_out(ExtensionEvent::Dequeue {
            queue: snapshot,
            entry: served.entry.clone(),
            helper_id: helper_id.to_string(),
        })
        .await;
        Ok(served)
    }

    // ------------------------------------------------------------------
    // Helping sessions
    // ------------------------------------------------------------------

    /// Start helping, notifying subscribers per the workspace default
    pub async fn start_helping(&self, helper_id: &str) -> Result<HelpingStarted> {
        self.open_all_openable_queues(helper_id, self.config.notify_on_open)
            .await
    }

    /// Start helping: open every queue the helper is authorized for and
    /// attach them as a host to queues a colleague already opened
    pub async fn open_all_openable_queues(
        &self,
        helper_id: &str,
        notify: bool,
    ) -> Result<HelpingStarted> {
        let now = self.clock.now();
        let started = {
            let mut state = self.state.lock().await;
            let authorized = state.authorized_queue_ids(helper_id);
            if authorized.is_empty() {
                return Err(QueueError::NoAuthorizedQueues);
            }
            if state.helpers.is_helping(helper_id) {
                return Err(QueueError::AlreadyHosting);
            }
            if let Some(queue) = state.ordered_queues().find(|q| q.contains(helper_id)) {
                return Err(QueueError::HelperInQueue(queue.name().to_string()));
            }

            let mut opened = Vec::new();
            let mut joined = Vec::new();
            for queue_id in &authorized {
                let queue = state.queue_mut(queue_id)?;
                if queue.is_open() {
                    queue.attach_host(helper_id, now)?;
                    joined.push(queue.snapshot());
                } else {
                    queue.open(helper_id, now)?;
                    opened.push(queue.snapshot());
                }
            }

            let helper = state.helpers.start(helper_id, now)?.clone();
            state.stats.open_attendance(helper_id, now);
            HelpingStarted {
                helper,
                opened,
                joined,
            }
        };

        tracing::info!(
            workspace_id = %self.id,
            helper_id,
            opened = started.opened.len(),
            joined = started.joined.len(),
            "helper started"
        );
        self.event_emitter.emit(
            self.event_emitter
                .event(events::HELPER_STARTED)
                .with("helper_id", helper_id)
                .with("opened", started.opened.len())
                .with("joined", started.joined.len()),
        );

        if notify {
            for queue in &started.opened {
                self.notify_opened(queue, &queue.notify_subscribers).await;
            }
        }
        for queue in &started.joined {
            self.refresh_display(&queue.id).await;
        }
        for queue in &started.opened {
            self.announce_opened(queue.clone(), helper_id).await;
        }
        self.fan_out(ExtensionEvent::HelperStart(started.helper.clone()))
            .await;
        Ok(started)
    }

    /// Stop helping, closing queues the helper was the last host of
    pub async fn stop_helping(&self, helper_id: &str) -> Result<HelpingStopped> {
        self.close_all_closable_queues(helper_id).await
    }

    /// End the helper's session and export their attendance
    pub async fn close_all_closable_queues(&self, helper_id: &str) -> Result<HelpingStopped> {
        let now = self.clock.now();
        let (stopped, touched) = {
            let mut state = self.state.lock().await;
            let served = match state.helpers.get(helper_id) {
                Some(helper) => helper.served_ids(),
                None => return Err(QueueError::NotHosting),
            };
            let attendance = state.stats.finish_attendance(helper_id, now, served)?;
            let helper = state.helpers.stop(helper_id, now)?;

            let hosted: Vec<QueueId> = state
                .ordered_queues()
                .filter(|q| q.is_hosted_by(helper_id))
                .map(|q| q.id().to_string())
                .collect();
            let mut closed = Vec::new();
            let mut touched = Vec::new();
            for queue_id in hosted {
                let queue = state.queue_mut(&queue_id)?;
                if queue.detach_host(helper_id) {
                    closed.push(queue.snapshot());
                } else {
                    touched.push(queue_id);
                }
            }
            (
                HelpingStopped {
                    helper,
                    attendance,
                    closed,
                },
                touched,
            )
        };

        tracing::info!(
            workspace_id = %self.id,
            helper_id,
            served = stopped.attendance.served.len(),
            active_time_ms = stopped.attendance.active_time_ms,
            closed = stopped.closed.len(),
            "helper stopped"
        );
        self.event_emitter.emit(
            self.event_emitter
                .event(events::HELPER_STOPPED)
                .with("helper_id", helper_id)
                .with("served", stopped.attendance.served.len())
                .with("active_time_ms", stopped.attendance.active_time_ms),
        );

        for queue_id in &touched {
            self.refresh_display(queue_id).await;
        }
        for queue in &stopped.closed {
            self.announce_closed(queue.clone()).await;
        }
        self.fan_out(ExtensionEvent::HelperStop {
            helper: stopped.helper.clone(),
            attendance: stopped.attendance.clone(),
        })
        .await;
        Ok(stopped)
    }

    /// Stop taking new participants without ending the session
    pub async fn pause_helping(&self, helper_id: &str) -> Result<()> {
        self.state.lock().await.helpers.pause(helper_id)?;
        tracing::debug!(workspace_id = %self.id, helper_id, "helper paused");
        self.event_emitter.emit(
            self.event_emitter
                .event(events::HELPER_PAUSED)
                .with("helper_id", helper_id),
        );
        Ok(())
    }

    pub async fn resume_helping(&self, helper_id: &str) -> Result<()> {
        self.state.lock().await.helpers.resume(helper_id)?;
        tracing::debug!(workspace_id = %self.id, helper_id, "helper resumed");
        self.event_emitter.emit(
            self.event_emitter
                .event(events::HELPER_RESUMED)
                .with("helper_id", helper_id),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Someone entered session channel `channel_id`.
    ///
    /// A participant served by any helper on duty opens a help session with
    /// every helper on duty present there. A helper entering opens sessions
    /// with the served participants already present.
    pub async fn on_participant_join_session(
        &self,
        participant_id: &str,
        channel_id: &str,
    ) -> Result<Vec<HelpSessionEntry>> {
        let now = self.clock.now();
        let sessions = {
            let mut state = self.state.lock().await;
            state
                .presence
                .insert(participant_id.to_string(), channel_id.to_string());

            let present: Vec<ParticipantId> = state
                .presence
                .iter()
                .filter(|(id, channel)| *channel == channel_id && *id != participant_id)
                .map(|(id, _)| id.clone())
                .collect();

            // (participant, helper, matching entry)
            let mut pairs: Vec<(ParticipantId, ParticipantId, WaitingEntry)> = Vec::new();
            if let Some(entry) = served_entry(&state.helpers, participant_id) {
                for helper in present.iter().filter(|p| state.helpers.is_helping(p)) {
                    let entry = last_served(&state.helpers, helper, participant_id)
                        .unwrap_or_else(|| entry.clone());
                    pairs.push((participant_id.to_string(), helper.clone(), entry));
                }
            }
            if state.helpers.is_helping(participant_id) {
                for other in &present {
                    let entry = last_served(&state.helpers, participant_id, other)
                        .or_else(|| served_entry(&state.helpers, other));
                    if let Some(entry) = entry {
                        pairs.push((other.clone(), participant_id.to_string(), entry));
                    }
                }
            }

            let mut sessions = Vec::new();
            for (participant, helper, entry) in pairs {
                state.helpers.mark_arrived(&helper, &participant);
                sessions.extend(state.stats.on_participant_join(
                    &participant,
                    &[(helper, entry)],
                    now,
                ));
            }
            sessions
        };

        if !sessions.is_empty() {
            tracing::debug!(
                workspace_id = %self.id,
                participant_id,
                channel_id,
                sessions = sessions.len(),
                "help sessions opened"
            );
            self.event_emitter.emit(
                self.event_emitter
                    .event(events::SESSION_JOINED)
                    .with("participant_id", participant_id)
                    .with("channel_id", channel_id)
                    .with("sessions", sessions.len()),
            );
            self.fan_out(ExtensionEvent::StudentJoinSession(sessions.clone()))
                .await;
        }
        Ok(sessions)
    }

    /// Someone left their session channel; their open help sessions close
    pub async fn on_participant_leave_session(
        &self,
        participant_id: &str,
    ) -> Result<Vec<HelpSessionEntry>> {
        let now = self.clock.now();
        let sessions = {
            let mut state = self.state.lock().await;
            state.presence.remove(participant_id);
            let mut closed = state.stats.on_participant_leave(participant_id, now);
            if state.helpers.is_helping(participant_id) {
                closed.extend(state.stats.on_helper_leave(participant_id, now));
            }
            closed
        };

        if !sessions.is_empty() {
            tracing::debug!(
                workspace_id = %self.id,
                participant_id,
                sessions = sessions.len(),
                "help sessions closed"
            );
            self.event_emitter.emit(
                self.event_emitter
                    .event(events::SESSION_LEFT)
                    .with("participant_id", participant_id)
                    .with("sessions", sessions.len()),
            );
            self.fan_out(ExtensionEvent::StudentLeaveSession(sessions.clone()))
                .await;
        }
        Ok(sessions)
    }

    /// Hand out the help sessions closed since the last call
    pub async fn take_help_sessions(&self) -> Vec<HelpSessionEntry> {
        self.state.lock().await.stats.take_help_sessions()
    }

    /// Running attendance of a hosting helper
    pub async fn attendance(&self, helper_id: &str) -> Option<AttendanceEntry> {
        self.state.lock().await.stats.attendance(helper_id).cloned()
    }

    // ------------------------------------------------------------------
    // Display
    // ------------------------------------------------------------------

    /// Render the queue panel now; unsafe renders are returned to the caller
    pub async fn render_queue(&self, queue_id: &str, force_fresh: bool) -> Result<RenderOutcome> {
        let guard = self.display_for(queue_id).await?;
        let mut guard = guard.lock().await;
        let snapshot = self.state.lock().await.queue(queue_id)?.snapshot();
        let result = guard
            .render(self.transport.as_ref(), queue_payload(&snapshot), 0, force_fresh)
            .await;
        drop(guard);
        self.report_unsafe(&result, snapshot).await;
        result
    }

    /// Render an auxiliary panel of a queue's channel
    pub async fn render_panel(
        &self,
        queue_id: &str,
        panel: usize,
        payload: RenderPayload,
        force_fresh: bool,
    ) -> Result<RenderOutcome> {
        let guard = self.display_for(queue_id).await?;
        let result = guard
            .lock()
            .await
            .render(self.transport.as_ref(), payload, panel, force_fresh)
            .await;
        if matches!(result, Err(QueueError::UnsafeRender { .. })) {
            let snapshot = self.state.lock().await.queue(queue_id)?.snapshot();
            self.report_unsafe(&result, snapshot).await;
        }
        result
    }

    /// Purge the queue channel and re-send every panel
    pub async fn cleanup_display(&self, queue_id: &str) -> Result<()> {
        let guard = self.display_for(queue_id).await?;
        let mut guard = guard.lock().await;
        let snapshot = self.state.lock().await.queue(queue_id)?.snapshot();
        guard.set_content(0, queue_payload(&snapshot))?;
        guard.cleanup(self.transport.as_ref()).await?;

        tracing::info!(workspace_id = %self.id, queue_id, "display cleaned up");
        self.event_emitter.emit(
            self.event_emitter
                .event(events::DISPLAY_CLEANED)
                .with("queue_id", queue_id),
        );
        Ok(())
    }

    /// True if the last render of the queue found foreign messages
    pub async fn needs_cleanup(&self, queue_id: &str) -> Result<bool> {
        let guard = self.display_for(queue_id).await?;
        let needs_cleanup = guard.lock().await.needs_cleanup();
        Ok(needs_cleanup)
    }

    async fn display_for(&self, queue_id: &str) -> Result<Arc<Mutex<DisplayGuard>>> {
        self.displays
            .lock()
            .await
            .get(queue_id)
            .cloned()
            .ok_or_else(|| QueueError::QueueNotFound(queue_id.to_string()))
    }

    /// Re-render panel 0 after a mutation. Failures are logged and flagged,
    /// never returned.
    async fn refresh_display(&self, queue_id: &str) {
        let Ok(guard) = self.display_for(queue_id).await else {
            return;
        };
        // Snapshot under the guard lock so the last render wins with the
        // latest state
        let mut guard = guard.lock().await;
        let snapshot = match self.state.lock().await.queues.get(queue_id) {
            Some(queue) => queue.snapshot(),
            None => return,
        };
        let result = guard
            .render(self.transport.as_ref(), queue_payload(&snapshot), 0, false)
            .await;
        drop(guard);

        if let Err(e) = &result {
            if !matches!(e, QueueError::UnsafeRender { .. }) {
                tracing::warn!(workspace_id = %self.id, queue_id, error = %e, "render failed");
            }
        }
        self.report_unsafe(&result, snapshot).await;
    }

    async fn report_unsafe(&self, result: &Result<RenderOutcome>, snapshot: QueueSnapshot) {
        if let Err(QueueError::UnsafeRender { channel_id, panel }) = result {
            tracing::warn!(
                workspace_id = %self.id,
                channel_id = %channel_id,
                panel,
                "unsafe render, channel needs cleanup"
            );
            self.event_emitter.emit(
                self.event_emitter
                    .event(events::DISPLAY_CLEANUP_REQUIRED)
                    .with("queue_id", snapshot.id.as_str())
                    .with("panel", *panel),
            );
            self.fan_out(ExtensionEvent::DisplayUnsafe(snapshot)).await;
        }
    }

    // ------------------------------------------------------------------
    // Observation, backup and housekeeping
    // ------------------------------------------------------------------

    pub async fn snapshot(&self) -> WorkspaceSnapshot {
        let now = self.clock.now();
        self.state.lock().await.snapshot(&self.id, now)
    }

    /// Snapshot of a single queue
    pub async fn queue(&self, queue_id: &str) -> Result<QueueSnapshot> {
        Ok(self.state.lock().await.queue(queue_id)?.snapshot())
    }

    pub async fn stats(&self) -> WorkspaceStats {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let mut stats = WorkspaceStats {
            active_helpers: state.helpers.len(),
            open_sessions: state.stats.open_sessions().len(),
            ..Default::default()
        };
        for queue in state.ordered_queues() {
            stats.total_waiting += queue.len();
            if queue.is_open() {
                stats.open_queues += 1;
            }
            let longest_wait_ms = queue
                .head()
                .map(|head| (now - head.wait_start).num_milliseconds().max(0) as u64);
            stats.queues.insert(
                queue.id().to_string(),
                QueueStatus {
                    name: queue.name().to_string(),
                    is_open: queue.is_open(),
                    waiting: queue.len(),
                    hosts: queue.hosts().count(),
                    longest_wait_ms,
                },
            );
        }
        stats
    }

    /// Serializable form of the current state
    pub async fn to_backup(&self) -> WorkspaceBackup {
        let now = self.clock.now();
        let queues = self
            .state
            .lock()
            .await
            .ordered_queues()
            .map(QueueBackup::from_queue)
            .collect();
        WorkspaceBackup {
            workspace_id: self.id.clone(),
            saved_at: now,
            queues,
            settings: Some(self.config.clone()),
        }
    }

    /// Save a backup now. Returns false when no backup store is configured.
    pub async fn backup_now(&self) -> Result<bool> {
        let Some(store) = &self.backup_store else {
            return Ok(false);
        };
        let backup = self.to_backup().await;
        let saved_at = backup.saved_at;
        match store.save_backup(&backup).await {
            Ok(()) => {
                *self.last_backup.lock().await = saved_at;
                tracing::debug!(workspace_id = %self.id, queues = backup.queues.len(), "backup saved");
                self.event_emitter.emit(
                    self.event_emitter
                        .event(events::BACKUP_SAVED)
                        .with("queues", backup.queues.len()),
                );
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(workspace_id = %self.id, error = %e, "backup failed");
                self.event_emitter.emit(
                    self.event_emitter
                        .event(events::BACKUP_FAILED)
                        .with("error", e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// Participants whose wait exceeds `threshold`
    pub async fn long_waiting(&self, threshold: std::time::Duration) -> Vec<WaitingEntry> {
        let now = self.clock.now();
        self.state
            .lock()
            .await
            .ordered_queues()
            .flat_map(|q| q.waiting())
            .filter(|entry| {
                (now - entry.wait_start)
                    .to_std()
                    .map_or(false, |waited| waited > threshold)
            })
            .cloned()
            .collect()
    }

    /// Periodic housekeeping: backup when due, long-wait warnings and the
    /// `on_tick` fan-out. Safe to call at any rate.
    pub async fn tick(&self) -> FanOutReport {
        let now = self.clock.now();

        if let Some(interval) = self.config.backup_interval {
            let due = {
                let last = *self.last_backup.lock().await;
                chrono::Duration::from_std(interval)
                    .map(|interval| now - last >= interval)
                    .unwrap_or(false)
            };
            if due {
                // failures are already logged and emitted
                let _ = self.backup_now().await;
            }
        }

        if let Some(threshold) = self.config.long_wait_threshold {
            for entry in self.long_waiting(threshold).await {
                tracing::warn!(
                    workspace_id = %self.id,
                    queue_id = %entry.queue_id,
                    participant_id = %entry.participant_id,
                    waiting_ms = (now - entry.wait_start).num_milliseconds(),
                    "participant waiting longer than threshold"
                );
            }
        }

        let snapshot = Arc::new(self.state.lock().await.snapshot(&self.id, now));
        self.fan_out(ExtensionEvent::Tick(snapshot)).await
    }

    // ------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------

    async fn fan_out(&self, event: ExtensionEvent) -> FanOutReport {
        if self.extensions.is_empty() {
            return FanOutReport::default();
        }
        let report = self.extensions.broadcast(&event).await;
        for failure in &report.failures {
            self.event_emitter.emit(
                self.event_emitter
                    .event(events::EXTENSION_FAILED)
                    .with("extension", failure.extension.as_str())
                    .with("hook", failure.event)
                    .with("error", failure.error.to_string()),
            );
        }
        report
    }

    async fn notify_opened(&self, queue: &QueueSnapshot, recipients: &[ParticipantId]) {
        if recipients.is_empty() {
            return;
        }
        if let Err(e) = self.notifier.notify_queue_opened(queue, recipients).await {
            tracing::warn!(queue_id = %queue.id, error = %e, "queue-open notification failed");
        }
    }

    async fn announce_opened(&self, snapshot: QueueSnapshot, helper_id: &str) {
        tracing::info!(workspace_id = %self.id, queue_id = %snapshot.id, helper_id, "queue opened");
        self.event_emitter.emit(
            self.event_emitter
                .event(events::QUEUE_OPENED)
                .with("queue_id", snapshot.id.as_str())
                .with("helper_id", helper_id),
        );
        self.refresh_display(&snapshot.id).await;
        self.fan_out(ExtensionEvent::QueueOpen {
            queue: snapshot,
            helper_id: helper_id.to_string(),
        })
        .await;
    }

    async fn announce_closed(&self, snapshot: QueueSnapshot) {
        self.event_emitter.emit(
            self.event_emitter
                .event(events::QUEUE_CLOSED)
                .with("queue_id", snapshot.id.as_str())
                .with("waiting", snapshot.waiting.len()),
        );
        self.refresh_display(&snapshot.id).await;
        self.fan_out(ExtensionEvent::QueueClose(snapshot)).await;
    }
}

/// Most recent entry `helper_id` served for `participant_id`, if the helper
/// is hosting
fn last_served(
    helpers: &HelperRegistry,
    helper_id: &str,
    participant_id: &str,
) -> Option<WaitingEntry> {
    helpers
        .get(helper_id)?
        .helped
        .iter()
        .rev()
        .find(|e| e.participant_id == participant_id)
        .cloned()
}

/// Most recent entry any helper on duty served for `participant_id`
fn served_entry(helpers: &HelperRegistry, participant_id: &str) -> Option<WaitingEntry> {
    helpers
        .iter()
        .filter_map(|h| last_served(helpers, &h.id, participant_id))
        .max_by_key(|e| e.wait_start)
}

fn queue_payload(snapshot: &QueueSnapshot) -> RenderPayload {
    serde_json::to_value(snapshot).unwrap_or_default()
}

/// Builder for [`Workspace`]
pub struct WorkspaceBuilder {
    id: WorkspaceId,
    transport: Arc<dyn RenderTransport>,
    config: Option<WorkspaceConfig>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn SessionNotifier>,
    backup_store: Option<Arc<dyn BackupStore>>,
    extensions: ExtensionSet,
}

impl WorkspaceBuilder {
    pub fn new(id: impl Into<String>, transport: Arc<dyn RenderTransport>) -> Self {
        Self {
            id: id.into(),
            transport,
            config: None,
            clock: Arc::new(SystemClock),
            notifier: Arc::new(NoopNotifier),
            backup_store: None,
            extensions: ExtensionSet::new(),
        }
    }

    /// Workspace id this builder creates
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Use `config` instead of the settings saved in the last backup
    pub fn with_config(mut self, config: WorkspaceConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn SessionNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Restore from and save backups to `store`
    pub fn with_backup_store(mut self, store: Arc<dyn BackupStore>) -> Self {
        self.backup_store = Some(store);
        self
    }

    pub fn with_extension(mut self, extension: Arc<dyn Extension>) -> Self {
        self.extensions.register(extension);
        self
    }

    /// Build the workspace, restoring queues from the last backup if any
    pub async fn build(self) -> anyhow::Result<Workspace> {
        use anyhow::Context;

        let backup = match &self.backup_store {
            Some(store) => match store.load_backup(&self.id).await {
                Ok(backup) => backup,
                Err(e) => {
                    tracing::warn!(workspace_id = %self.id, error = %e, "backup unreadable, starting empty");
                    None
                }
            },
            None => None,
        };

        let config = self
            .config
            .or_else(|| backup.as_ref().and_then(|b| b.settings.clone()))
            .unwrap_or_default();
        config
            .validate()
            .with_context(|| format!("invalid configuration for workspace {}", self.id))?;

        let mut state = WorkspaceState::default();
        let mut displays = HashMap::new();
        if let Some(backup) = backup {
            for queue in backup.queues {
                if state.queues.contains_key(&queue.id) {
                    tracing::warn!(queue_id = %queue.id, "duplicate queue in backup, skipped");
                    continue;
                }
                displays.insert(
                    queue.id.clone(),
                    Arc::new(Mutex::new(DisplayGuard::new(
                        queue.id.clone(),
                        config.panel_count,
                    ))),
                );
                state.insert_queue(queue.into_queue());
            }
            tracing::info!(
                workspace_id = %self.id,
                queues = state.queues.len(),
                saved_at = %backup.saved_at,
                "workspace restored from backup"
            );
        }

        let now = self.clock.now();
        let event_emitter = EventEmitter::new(self.id.clone(), config.event_capacity);
        Ok(Workspace {
            id: self.id,
            config,
            clock: self.clock,
            state: Mutex::new(state),
            displays: Mutex::new(displays),
            transport: self.transport,
            notifier: self.notifier,
            backup_store: self.backup_store,
            extensions: self.extensions,
            event_emitter,
            last_backup: Mutex::new(now),
        })
    }
}
