//! # Activity Queue
//!
//! Orders activities arriving from local callers, from the data provider and
//! from other nodes, and executes each one exactly once.
//!
//! Arrivals are serialised by an async arrival lock. An arrival whose id
//! skips ahead of the highest arrived id first pulls the skipped ids from the
//! data provider, so activities enter the wait graph in id order even when
//! the network reorders them. Inside the graph an activity waits for every
//! older pending activity it conflicts with; activities with disjoint
//! affected sets run concurrently.
//!
//! Execution runs the Store phase (local activities only), the Apply phase
//! under the cache write lock, marks the activity processed, sends it to the
//! peers (local activities only), records completion and finally releases
//! the dependents. A failed activity still releases its dependents but stays
//! a gap in the completion state so the health check can retry it.
//!
//! A local activity whose caller goes away before it is dispatched, or whose
//! Store phase fails, is abandoned: its saved row is deleted and its id is
//! closed, so neither this node nor a peer ever replays it. Once dispatched,
//! an activity runs to completion in a task of its own.

pub mod completion;
pub mod dependency;
pub mod history;

pub use completion::CompletionState;
pub use dependency::{ExecutionState, NodeKey};
pub use history::HistoryEntry;

use crate::activities::SecurityActivity;
use crate::cache::SecurityCache;
use crate::config::SecurityConfig;
use crate::data::{load_activity_range, SecurityDataProvider};
use crate::error::{SecurityError, SecurityResult};
use crate::messaging::{outgoing_message, MessageProvider};
use crate::model::{require_id, ActivityId};
use completion::CompletionTracker;
use dependency::DependencyGraph;
use history::ActivityHistory;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};

/// Tunables of the queue, taken from [`SecurityConfig`]
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub gap_retention: Duration,
    pub max_open_gaps: usize,
    pub load_batch: usize,
    pub history_capacity: usize,
    pub activity_lifetime_minutes: u64,
    pub big_activity_threshold_bytes: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&SecurityConfig::default())
    }
}

impl QueueSettings {
    pub fn from_config(config: &SecurityConfig) -> Self {
        Self {
            gap_retention: config.gap_retention(),
            max_open_gaps: config.max_open_gaps,
            load_batch: config.activity_load_batch,
            history_capacity: config.history_capacity,
            activity_lifetime_minutes: config.activity_lifetime_minutes,
            big_activity_threshold_bytes: config.big_activity_threshold_bytes,
        }
    }
}

/// Pending activities by state, for introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub waiting: Vec<ActivityId>,
    pub ready: Vec<ActivityId>,
    pub executing: Vec<ActivityId>,
    pub completion: CompletionState,
    pub last_arrived_id: ActivityId,
    pub ignored_duplicates: u64,
}

/// Outcome of a health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Activities pulled from the store and enqueued
    pub loaded: usize,
    /// Gaps given up as permanently lost
    pub lost_gaps: Vec<ActivityId>,
    /// Gaps still open afterwards, not counting the ones this check
    /// reloaded and enqueued
    pub open_gaps: Vec<ActivityId>,
    /// Old activities removed from the store
    pub cleaned_up: usize,
}

struct QueueState {
    graph: DependencyGraph,
    completion: CompletionTracker,
    last_arrived_id: ActivityId,
    history: ActivityHistory,
    /// Wake-up signal of every `Waiting` node
    ready_signals: HashMap<NodeKey, oneshot::Sender<()>>,
    /// Duplicates that completes together with the node they duplicate
    attached: HashMap<NodeKey, Vec<oneshot::Sender<SecurityResult<()>>>>,
}

impl QueueState {
    /// Remove a finished or abandoned node, wake its released dependents
    /// and answer attached duplicates. Returns whether the graph is empty.
    fn release_node(&mut self, key: NodeKey, outcome: &SecurityResult<()>) -> bool {
        for ready in self.graph.remove(key) {
            if let Some(signal) = self.ready_signals.remove(&ready) {
                let _ = signal.send(());
            }
        }
        self.ready_signals.remove(&key);
        if let Some(waiters) = self.attached.remove(&key) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
        self.graph.is_empty()
    }
}

struct QueueInner {
    cache: Arc<SecurityCache>,
    data: Arc<dyn SecurityDataProvider>,
    messaging: Arc<dyn MessageProvider>,
    settings: QueueSettings,
    state: Mutex<QueueState>,
    arrival_lock: tokio::sync::Mutex<()>,
    operational: AtomicBool,
    ignored_duplicates: AtomicU64,
    idle: Notify,
}

impl QueueInner {
    fn lock_state(&self) -> SecurityResult<MutexGuard<'_, QueueState>> {
        self.state.lock().map_err(|e| {
            error!("❌ Failed to acquire activity queue lock: {}", e);
            SecurityError::LockPoisoned("activity queue".to_string())
        })
    }

    /// Delete the saved row of a local activity that will never execute
    async fn delete_abandoned(&self, id: ActivityId) {
        match self.data.delete_activity(id).await {
            Ok(_) => debug!("🗑️ Deleted abandoned activity {}", id),
            Err(e) => error!("❌ Failed to delete abandoned activity {}: {}", id, e),
        }
    }
}

enum Arrival {
    Enqueued(Ticket),
    Attached(oneshot::Receiver<SecurityResult<()>>),
    Ignored,
}

struct Ticket {
    ready: Option<oneshot::Receiver<()>>,
    activity: SecurityActivity,
    guard: NodeGuard,
}

/// Releases a node whose ticket is dropped before dispatch, e.g. when the
/// caller's future is cancelled while the activity is still waiting. A
/// cancelled local activity is abandoned.
struct NodeGuard {
    inner: Arc<QueueInner>,
    key: NodeKey,
    activity_id: ActivityId,
    local: bool,
    armed: bool,
}

impl NodeGuard {
    /// The node is dispatched; its execution releases it
    fn disarm(&mut self) -> NodeKey {
        self.armed = false;
        self.key
    }
}

impl Drop for NodeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(mut state) = self.inner.state.lock() else {
            return;
        };
        warn!("⚠️ Activity {} cancelled before dispatch", self.activity_id);
        state
            .history
            .finished(self.activity_id, ExecutionState::Cancelled, None);
        if self.local {
            state
                .completion
                .record_abandoned(self.activity_id, Instant::now());
        }
        let empty = state.release_node(self.key, &Err(SecurityError::Cancelled(self.activity_id)));
        drop(state);
        if self.local {
            let inner = Arc::clone(&self.inner);
            let id = self.activity_id;
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { inner.delete_abandoned(id).await });
                }
                Err(_) => error!("❌ No runtime left to delete abandoned activity {}", id),
            }
        }
        if empty {
            self.inner.idle.notify_waiters();
        }
    }
}

/// How the phases of an activity ended without success
enum PhaseError {
    /// The Store phase failed and nothing was applied
    NotStored(SecurityError),
    /// A later phase failed
    Failed(SecurityError),
}

/// Clonable handle to the queue
#[derive(Clone)]
pub struct ActivityQueue {
    inner: Arc<QueueInner>,
}

impl ActivityQueue {
    pub fn new(
        cache: Arc<SecurityCache>,
        data: Arc<dyn SecurityDataProvider>,
        messaging: Arc<dyn MessageProvider>,
        settings: QueueSettings,
    ) -> Self {
        let history = ActivityHistory::new(settings.history_capacity);
        Self {
            inner: Arc::new(QueueInner {
                cache,
                data,
                messaging,
                settings,
                state: Mutex::new(QueueState {
                    graph: DependencyGraph::default(),
                    completion: CompletionTracker::default(),
                    last_arrived_id: 0,
                    history,
                    ready_signals: HashMap::new(),
                    attached: HashMap::new(),
                }),
                arrival_lock: tokio::sync::Mutex::new(()),
                operational: AtomicBool::new(false),
                ignored_duplicates: AtomicU64::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn is_operational(&self) -> bool {
        self.inner.operational.load(Ordering::SeqCst)
    }

    fn ensure_operational(&self) -> SecurityResult<()> {
        if self.is_operational() {
            Ok(())
        } else {
            Err(SecurityError::NotOperational)
        }
    }

    /// Resume from a checkpoint: re-run the open gaps and everything saved
    /// after the watermark, then wait until they are done.
    pub async fn startup(&self, completion: CompletionState, last_saved: ActivityId) -> SecurityResult<usize> {
        let order = self.inner.arrival_lock.lock().await;
        {
            let mut state = self.inner.lock_state()?;
            state.completion = CompletionTracker::from_state(&completion, Instant::now());
            state.last_arrived_id = completion.last_activity_id;
        }
        self.inner.operational.store(true, Ordering::SeqCst);
        info!("🚀 Activity queue starting from {}", completion);

        let mut pending = self.load_unprocessed_gaps(&completion.gaps).await?;
        if last_saved > completion.last_activity_id {
            pending.extend(
                load_activity_range(
                    self.inner.data.as_ref(),
                    completion.last_activity_id + 1,
                    last_saved,
                    self.inner.settings.load_batch,
                )
                .await?,
            );
        }
        let count = pending.len();
        for activity in pending {
            self.enqueue_from_database(activity)?;
        }
        drop(order);

        self.wait_idle().await;
        info!("✅ Activity queue started, {} activities recovered", count);
        Ok(count)
    }

    /// Save, order and execute an activity created on this node.
    /// Returns the assigned id once the activity has executed.
    pub async fn execute_local(&self, mut activity: SecurityActivity) -> SecurityResult<ActivityId> {
        activity.from_receiver = false;
        activity.from_database = false;
        if activity.sender.is_none() {
            activity.sender = Some(self.inner.messaging.node_id().to_string());
        }
        let queue = self.clone();
        let (id, arrival) = tokio::spawn(async move { queue.save_and_arrive(activity).await })
            .await
            .map_err(|e| SecurityError::Internal(format!("arrival of a local activity aborted: {}", e)))??;
        match arrival {
            Arrival::Enqueued(ticket) => self.run(ticket).await.map(|_| id),
            Arrival::Attached(done) => done.await.map_err(|_| SecurityError::Cancelled(id))?.map(|_| id),
            Arrival::Ignored => Ok(id),
        }
    }

    /// Save a local activity and register it. Runs as a task of its own so
    /// a saved activity always reaches the wait graph, where a dropped
    /// ticket abandons it.
    async fn save_and_arrive(&self, mut activity: SecurityActivity) -> SecurityResult<(ActivityId, Arrival)> {
        let _order = self.inner.arrival_lock.lock().await;
        self.ensure_operational()?;
        let id = self.inner.data.save_activity(&activity).await?;
        activity.id = id;
        debug!("💾 Saved activity {} ({})", id, activity.name());
        match self.arrive_in_order(activity).await {
            Ok(arrival) => Ok((id, arrival)),
            Err(e) => {
                self.inner.delete_abandoned(id).await;
                Err(e)
            }
        }
    }

    /// Accept an activity delivered by another node. It executes in the
    /// background; arrival problems are returned.
    pub async fn receive(&self, mut activity: SecurityActivity) -> SecurityResult<()> {
        require_id(activity.id, "activity id")?;
        activity.from_receiver = true;
        activity.from_database = false;
        let _order = self.inner.arrival_lock.lock().await;
        self.ensure_operational()?;
        if let Arrival::Enqueued(ticket) = self.arrive_in_order(activity).await? {
            self.spawn(ticket);
        }
        Ok(())
    }

    /// Pull missing activities from the store, give up stale gaps and
    /// clean up old activities.
    pub async fn health_check(&self) -> SecurityResult<HealthReport> {
        let order = self.inner.arrival_lock.lock().await;
        self.ensure_operational()?;
        let retention = self.inner.settings.gap_retention;
        let last_saved = self.inner.data.get_last_activity_id().await?;
        let (last_arrived, gaps) = {
            let state = self.inner.lock_state()?;
            let in_flight = state.graph.activity_ids();
            (
                state.last_arrived_id,
                state
                    .completion
                    .reloadable_gaps(Instant::now(), retention, &in_flight),
            )
        };

        let mut pending = self.load_unprocessed_gaps(&gaps).await?;
        if last_saved > last_arrived {
            pending.extend(
                load_activity_range(
                    self.inner.data.as_ref(),
                    last_arrived + 1,
                    last_saved,
                    self.inner.settings.load_batch,
                )
                .await?,
            );
        }
        let loaded = pending.len();
        for activity in pending {
            self.enqueue_from_database(activity)?;
        }

        let (lost_gaps, open_gaps) = {
            let mut state = self.inner.lock_state()?;
            let in_flight = state.graph.activity_ids();
            let lost = state.completion.drop_stale_gaps(
                Instant::now(),
                retention,
                self.inner.settings.max_open_gaps,
                &in_flight,
            );
            let open = state
                .completion
                .gaps()
                .filter(|g| !in_flight.contains(g))
                .collect::<Vec<_>>();
            (lost, open)
        };
        drop(order);

        if !lost_gaps.is_empty() {
            warn!(
                "⚠️ Giving up {} missing activities as permanently lost: {:?}",
                lost_gaps.len(),
                lost_gaps
            );
        }
        let cleaned_up = self
            .inner
            .data
            .cleanup_activities(self.inner.settings.activity_lifetime_minutes)
            .await?;
        info!(
            "🩺 Health check: {} loaded, {} lost, {} open gaps, {} cleaned up",
            loaded,
            lost_gaps.len(),
            open_gaps.len(),
            cleaned_up
        );
        Ok(HealthReport {
            loaded,
            lost_gaps,
            open_gaps,
            cleaned_up,
        })
    }

    /// Wait until no activity is pending
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = std::pin::pin!(self.inner.idle.notified());
            notified.as_mut().enable();
            match self.inner.lock_state() {
                Ok(state) if !state.graph.is_empty() => {}
                _ => return,
            }
            notified.await;
        }
    }

    /// Refuse new arrivals and drain the pending ones
    pub async fn shutdown(&self) {
        {
            let _order = self.inner.arrival_lock.lock().await;
            self.inner.operational.store(false, Ordering::SeqCst);
        }
        self.wait_idle().await;
        info!("🛑 Activity queue drained and stopped");
    }

    pub fn completion_state(&self) -> SecurityResult<CompletionState> {
        Ok(self.inner.lock_state()?.completion.state())
    }

    pub fn snapshot(&self) -> SecurityResult<QueueSnapshot> {
        let state = self.inner.lock_state()?;
        let mut snapshot = QueueSnapshot {
            waiting: Vec::new(),
            ready: Vec::new(),
            executing: Vec::new(),
            completion: state.completion.state(),
            last_arrived_id: state.last_arrived_id,
            ignored_duplicates: self.inner.ignored_duplicates.load(Ordering::SeqCst),
        };
        for (id, node_state) in state.graph.snapshot() {
            match node_state {
                ExecutionState::Waiting => snapshot.waiting.push(id),
                ExecutionState::Ready => snapshot.ready.push(id),
                ExecutionState::Executing => snapshot.executing.push(id),
                _ => {}
            }
        }
        Ok(snapshot)
    }

    pub fn history(&self) -> SecurityResult<Vec<HistoryEntry>> {
        Ok(self.inner.lock_state()?.history.entries())
    }

    /// Load the gaps the store still holds as unprocessed. Any other gap
    /// was executed elsewhere or never saved; it stays open until it
    /// arrives or the gap policy gives it up.
    async fn load_unprocessed_gaps(&self, gaps: &[ActivityId]) -> SecurityResult<Vec<SecurityActivity>> {
        if gaps.is_empty() {
            return Ok(Vec::new());
        }
        let unprocessed: HashSet<ActivityId> = self
            .inner
            .data
            .get_unprocessed_activity_ids()
            .await?
            .into_iter()
            .collect();
        let mut loaded = Vec::new();
        for gap in gaps {
            if !unprocessed.contains(gap) {
                debug!("Gap {} is not pending in the store, leaving it open", gap);
                continue;
            }
            if let Some(activity) = self.inner.data.load_activity(*gap).await? {
                loaded.push(activity);
            }
        }
        Ok(loaded)
    }

    /// Enqueue a reloaded activity and execute it in the background.
    /// Callers hold the arrival lock.
    fn enqueue_from_database(&self, mut activity: SecurityActivity) -> SecurityResult<()> {
        activity.from_database = true;
        activity.from_receiver = false;
        if let Arrival::Enqueued(ticket) = self.arrive(activity)? {
            self.spawn(ticket);
        }
        Ok(())
    }

    /// Arrival that first pulls every skipped id from the store.
    /// Callers hold the arrival lock.
    async fn arrive_in_order(&self, activity: SecurityActivity) -> SecurityResult<Arrival> {
        let last_arrived = self.inner.lock_state()?.last_arrived_id;
        if activity.id > last_arrived + 1 {
            match load_activity_range(
                self.inner.data.as_ref(),
                last_arrived + 1,
                activity.id - 1,
                self.inner.settings.load_batch,
            )
            .await
            {
                Ok(skipped) => {
                    if !skipped.is_empty() {
                        info!(
                            "📥 Loaded {} skipped activities before {}",
                            skipped.len(),
                            activity.id
                        );
                    }
                    for earlier in skipped {
                        self.enqueue_from_database(earlier)?;
                    }
                }
                Err(e) => warn!(
                    "⚠️ Could not load activities skipped before {}: {}",
                    activity.id, e
                ),
            }
        }
        self.arrive(activity)
    }

    /// Register an arrival in the wait graph or classify it as duplicate
    fn arrive(&self, activity: SecurityActivity) -> SecurityResult<Arrival> {
        let cache = self.inner.cache.read()?;
        let mut state = self.inner.lock_state()?;
        let id = activity.id;

        if let Some(existing) = state.graph.find(id, activity.uuid) {
            let existing_state = state.graph.get(existing).map(|n| n.state);
            self.inner.ignored_duplicates.fetch_add(1, Ordering::SeqCst);
            state
                .history
                .arrived(id, activity.name(), ExecutionState::IgnoredDuplicate, Vec::new());
            if matches!(
                existing_state,
                Some(ExecutionState::Waiting) | Some(ExecutionState::Ready)
            ) {
                debug!("🔁 Activity {} is already queued, attaching duplicate", id);
                let (done, wait) = oneshot::channel();
                state.attached.entry(existing).or_default().push(done);
                return Ok(Arrival::Attached(wait));
            }
            debug!("🔁 Activity {} is already executing, ignoring duplicate", id);
            return Ok(Arrival::Ignored);
        }
        if id != 0 && state.completion.is_completed(id) {
            self.inner.ignored_duplicates.fetch_add(1, Ordering::SeqCst);
            state
                .history
                .arrived(id, activity.name(), ExecutionState::IgnoredDuplicate, Vec::new());
            debug!("🔁 Activity {} was already executed, ignoring duplicate", id);
            return Ok(Arrival::Ignored);
        }

        let affected = activity.affected_ids(&cache);
        drop(cache);
        let key = state
            .graph
            .insert(id, activity.uuid, activity.name(), affected)?;
        let waited_for = state.graph.blockers_of(key);
        let guard = NodeGuard {
            inner: Arc::clone(&self.inner),
            key,
            activity_id: id,
            local: activity.is_local(),
            armed: true,
        };
        let ready = if waited_for.is_empty() {
            None
        } else {
            let (signal, wait) = oneshot::channel();
            state.ready_signals.insert(key, signal);
            Some(wait)
        };
        let node_state = if ready.is_some() {
            ExecutionState::Waiting
        } else {
            ExecutionState::Ready
        };
        if id > state.last_arrived_id {
            state.last_arrived_id = id;
        }
        debug!(
            "📨 Activity {} ({}) arrived {:?}, waiting for {:?}",
            id,
            activity.name(),
            node_state,
            waited_for
        );
        state
            .history
            .arrived(id, activity.name(), node_state, waited_for);
        Ok(Arrival::Enqueued(Ticket {
            ready,
            activity,
            guard,
        }))
    }

    fn spawn(&self, ticket: Ticket) {
        let queue = self.clone();
        tokio::spawn(async move {
            let id = ticket.activity.id;
            if let Err(e) = queue.run(ticket).await {
                error!("❌ Activity {} failed: {}", id, e);
            }
        });
    }

    /// Wait for the dependencies, then execute in a task of its own so a
    /// caller that goes away after dispatch cannot interrupt the phases
    async fn run(&self, ticket: Ticket) -> SecurityResult<()> {
        let Ticket {
            ready,
            activity,
            mut guard,
        } = ticket;
        if let Some(ready) = ready {
            if ready.await.is_err() {
                return Err(SecurityError::Cancelled(activity.id));
            }
        }
        let key = guard.disarm();
        let id = activity.id;
        let queue = self.clone();
        tokio::spawn(async move { queue.execute(key, activity).await })
            .await
            .map_err(|e| SecurityError::Internal(format!("execution of activity {} aborted: {}", id, e)))?
    }

    async fn execute(&self, key: NodeKey, activity: SecurityActivity) -> SecurityResult<()> {
        {
            let mut state = self.inner.lock_state()?;
            state.graph.set_state(key, ExecutionState::Executing);
            state.history.started(activity.id);
        }

        let phases = self.execute_phases(&activity).await;

        let now = Instant::now();
        let (outcome, empty) = {
            let mut state = self.inner.lock_state()?;
            let outcome = match phases {
                Ok(()) => {
                    state.completion.record_executed(activity.id, now);
                    state
                        .history
                        .finished(activity.id, ExecutionState::Released, None);
                    Ok(())
                }
                Err(PhaseError::NotStored(e)) => {
                    state.completion.record_abandoned(activity.id, now);
                    state
                        .history
                        .finished(activity.id, ExecutionState::Failed, Some(e.to_string()));
                    Err(e)
                }
                Err(PhaseError::Failed(e)) => {
                    state.completion.record_failed(activity.id, now);
                    state
                        .history
                        .finished(activity.id, ExecutionState::Failed, Some(e.to_string()));
                    Err(e)
                }
            };
            let empty = state.release_node(key, &outcome);
            (outcome, empty)
        };
        if empty {
            self.inner.idle.notify_waiters();
        }
        match &outcome {
            Ok(()) => debug!("✅ Activity {} ({}) executed", activity.id, activity.name()),
            Err(e) => warn!(
                "⚠️ Activity {} ({}) failed: {}",
                activity.id,
                activity.name(),
                e
            ),
        }
        outcome
    }

    async fn execute_phases(&self, activity: &SecurityActivity) -> Result<(), PhaseError> {
        if activity.is_local() {
            if let Err(e) = activity.store(self.inner.data.as_ref()).await {
                error!(
                    "❌ Store phase of activity {} failed, abandoning it: {}",
                    activity.id, e
                );
                self.inner.delete_abandoned(activity.id).await;
                return Err(PhaseError::NotStored(e));
            }
        }
        {
            let mut cache = self.inner.cache.write().map_err(PhaseError::Failed)?;
            activity.apply(&mut cache).map_err(PhaseError::Failed)?;
        }
        if !activity.from_receiver {
            self.inner
                .data
                .mark_activity_processed(activity.id)
                .await
                .map_err(PhaseError::Failed)?;
        }
        if activity.is_local() {
            let sent = match outgoing_message(activity, self.inner.settings.big_activity_threshold_bytes) {
                Ok(message) => self.inner.messaging.send(message).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!("⚠️ Activity {} was not distributed: {}", activity.id, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activities::ActivityKind;
    use crate::cache::test_support::state_with;
    use crate::data::test_support::FailingDataProvider;
    use crate::data::MemoryDataProvider;
    use crate::messaging::NullMessageProvider;
    use futures::FutureExt;

    fn create(id: i32, parent: i32) -> SecurityActivity {
        SecurityActivity::new(ActivityKind::CreateEntity {
            entity_id: id,
            parent_id: parent,
            owner_id: 1,
        })
    }

    fn queue_on(data: Arc<dyn SecurityDataProvider>, cache: &Arc<SecurityCache>) -> ActivityQueue {
        ActivityQueue::new(
            Arc::clone(cache),
            data,
            Arc::new(NullMessageProvider::new("test")),
            QueueSettings::default(),
        )
    }

    async fn started_queue(data: Arc<dyn SecurityDataProvider>) -> (ActivityQueue, Arc<SecurityCache>) {
        let cache = Arc::new(SecurityCache::empty());
        let queue = queue_on(data, &cache);
        queue.startup(CompletionState::default(), 0).await.unwrap();
        (queue, cache)
    }

    #[tokio::test]
    async fn test_local_activity_runs_all_phases() {
        let data = Arc::new(MemoryDataProvider::new());
        let (queue, cache) = started_queue(Arc::clone(&data) as Arc<dyn SecurityDataProvider>).await;

        let id = queue.execute_local(create(1, 0)).await.unwrap();
        assert_eq!(id, 1);
        assert!(cache.read().unwrap().contains_entity(1));
        assert!(data.load_stored_entity(1).await.unwrap().is_some());
        assert!(data.get_unprocessed_activity_ids().await.unwrap().is_empty());
        assert_eq!(queue.completion_state().unwrap(), CompletionState::new(1, Vec::new()));
    }

    #[tokio::test]
    async fn test_failed_activity_is_reported_and_stays_open() {
        let data = Arc::new(MemoryDataProvider::new());
        let (queue, _cache) = started_queue(Arc::clone(&data) as Arc<dyn SecurityDataProvider>).await;
        queue.execute_local(create(1, 0)).await.unwrap();

        let moving = SecurityActivity::new(ActivityKind::MoveEntity {
            source_id: 1,
            target_id: 42,
        });
        let result = queue.execute_local(moving).await;
        assert_eq!(result, Err(SecurityError::EntityNotFound(42)));
        assert_eq!(queue.completion_state().unwrap().gaps, vec![2]);

        queue.execute_local(create(3, 1)).await.unwrap();
        let history = queue.history().unwrap();
        assert_eq!(history[1].state, ExecutionState::Failed);
        assert_eq!(history[2].state, ExecutionState::Released);

        // the retried gap is in flight, not open
        let report = queue.health_check().await.unwrap();
        assert_eq!(report.loaded, 1);
        assert!(report.open_gaps.is_empty());
        queue.wait_idle().await;
        assert_eq!(queue.completion_state().unwrap().gaps, vec![2]);
    }

    #[tokio::test]
    async fn test_cancelled_activity_never_executes() {
        let data = Arc::new(MemoryDataProvider::new());
        let (queue, cache) = started_queue(Arc::clone(&data) as Arc<dyn SecurityDataProvider>).await;
        queue.execute_local(create(1, 0)).await.unwrap();

        // a change from a peer keeps entity 1 busy
        let mut busy = SecurityActivity::new(ActivityKind::ModifyOwner {
            entity_id: 1,
            owner_id: 7,
        })
        .with_sender("peer");
        busy.id = data.save_activity(&busy).await.unwrap();
        queue.receive(busy).await.unwrap();

        assert!(queue.execute_local(create(2, 1)).now_or_never().is_none());
        assert_eq!(queue.execute_local(create(4, 1)).await.unwrap(), 4);
        queue.wait_idle().await;
        tokio::task::yield_now().await;
        assert!(data.load_activity(3).await.unwrap().is_none());

        let report = queue.health_check().await.unwrap();
        assert_eq!(report.loaded, 0);
        assert!(report.open_gaps.is_empty());
        queue.wait_idle().await;

        assert!(!cache.read().unwrap().contains_entity(2));
        assert!(data.load_stored_entity(2).await.unwrap().is_none());
        assert_eq!(queue.completion_state().unwrap(), CompletionState::new(4, Vec::new()));
        assert!(queue
            .history()
            .unwrap()
            .iter()
            .any(|e| e.activity_id == 3 && e.state == ExecutionState::Cancelled));
    }

    #[tokio::test]
    async fn test_store_failure_abandons_the_activity() {
        let data = Arc::new(FailingDataProvider::new());
        let (queue, cache) = started_queue(Arc::clone(&data) as Arc<dyn SecurityDataProvider>).await;
        queue.execute_local(create(1, 0)).await.unwrap();

        data.fail_entity_writes(true);
        let result = queue.execute_local(create(2, 1)).await;
        assert!(matches!(result, Err(SecurityError::Database(_))));
        assert!(!cache.read().unwrap().contains_entity(2));
        assert!(data.load_activity(2).await.unwrap().is_none());

        data.fail_entity_writes(false);
        let report = queue.health_check().await.unwrap();
        assert_eq!(report.loaded, 0);
        queue.wait_idle().await;
        assert!(!cache.read().unwrap().contains_entity(2));
        assert!(data.load_stored_entity(2).await.unwrap().is_none());
        assert_eq!(queue.completion_state().unwrap(), CompletionState::new(2, Vec::new()));

        queue.execute_local(create(2, 1)).await.unwrap();
        assert!(cache.read().unwrap().contains_entity(2));
    }

    #[tokio::test]
    async fn test_save_failure_reaches_the_caller() {
        let data = Arc::new(FailingDataProvider::new());
        let (queue, cache) = started_queue(Arc::clone(&data) as Arc<dyn SecurityDataProvider>).await;

        data.fail_saves(true);
        let result = queue.execute_local(create(1, 0)).await;
        assert!(matches!(result, Err(SecurityError::Database(_))));
        assert!(!cache.read().unwrap().contains_entity(1));
        assert_eq!(queue.completion_state().unwrap(), CompletionState::default());
        assert!(queue.snapshot().unwrap().ready.is_empty());

        data.fail_saves(false);
        assert_eq!(queue.execute_local(create(1, 0)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_only_unprocessed_gaps_are_reloaded() {
        let data = Arc::new(MemoryDataProvider::new());
        for (id, parent) in [(1, 0), (2, 1), (3, 1), (4, 1)] {
            data.save_activity(&create(id, parent)).await.unwrap();
        }
        // 2 was executed by the node that saved it, 3 is still pending
        for id in [1, 2, 4] {
            data.mark_activity_processed(id).await.unwrap();
        }
        let cache = Arc::new(SecurityCache::new(state_with(&[(1, 0, 1), (4, 1, 1)])));
        let queue = queue_on(Arc::clone(&data) as Arc<dyn SecurityDataProvider>, &cache);

        let recovered = queue
            .startup(CompletionState::new(4, vec![2, 3]), 4)
            .await
            .unwrap();
        assert_eq!(recovered, 1);
        assert!(cache.read().unwrap().contains_entity(3));
        assert!(!cache.read().unwrap().contains_entity(2));
        assert_eq!(queue.completion_state().unwrap(), CompletionState::new(4, vec![2]));

        let report = queue.health_check().await.unwrap();
        assert_eq!(report.loaded, 0);
        assert_eq!(report.open_gaps, vec![2]);
        assert!(report.lost_gaps.is_empty());
        assert!(!cache.read().unwrap().contains_entity(2));
    }

    #[tokio::test]
    async fn test_received_duplicate_is_ignored() {
        let data = Arc::new(MemoryDataProvider::new());
        let (queue, _cache) = started_queue(Arc::clone(&data) as Arc<dyn SecurityDataProvider>).await;
        let activity = create(1, 0);
        queue.execute_local(activity).await.unwrap();

        let stored = data.load_activity(1).await.unwrap().unwrap();
        queue.receive(stored).await.unwrap();
        queue.wait_idle().await;
        let snapshot = queue.snapshot().unwrap();
        assert_eq!(snapshot.ignored_duplicates, 1);
        assert!(snapshot.waiting.is_empty() && snapshot.executing.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let data = Arc::new(MemoryDataProvider::new());
        let (queue, _cache) = started_queue(data).await;
        queue.shutdown().await;
        assert!(!queue.is_operational());
        assert_eq!(
            queue.execute_local(create(1, 0)).await,
            Err(SecurityError::NotOperational)
        );
    }
}
