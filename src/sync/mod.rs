//! State Synchronization Engine
//!
//! Owns the reconciled [`Dataset`]. Every mutation enters through
//! [`SyncEngine::dispatch`] (or the admin-only [`SyncEngine::stage`]), is
//! applied optimistically, pushed through the [`RemoteStore`], and then
//! reconciled against a fresh snapshot.
//!
//! Ordering is kept with a generation counter: every accepted change to the
//! in-memory dataset bumps it, and a fetch that started under an older
//! generation is discarded when it lands.

pub mod guard;
mod role;
mod scheduler;

pub use role::Role;
pub use scheduler::TaskSlot;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify, RwLock};

use crate::cache::LocalCache;
use crate::config::SyncConfig;
use crate::error::{PortalError, Result};
use crate::model::{Action, CollectionCounts, Dataset, StudentStatus};
use crate::remote::{RemoteStore, WriteOutcome};

/// Freshness of the served dataset, as shown to UI collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// No snapshot accepted yet.
    Loading,
    /// The last read succeeded.
    Online,
    /// The last read failed or was rejected; serving last-known-good data.
    Stale,
}

/// Result of one reconciliation attempt. Never an error: read failures only
/// degrade the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Accepted,
    /// A newer local change or pending staged edit made this snapshot obsolete.
    Superseded,
    Stale(String),
}

/// Surfaces that need a fresh dataset while they are open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Exam,
    Dashboard,
}

struct EngineState {
    dataset: Dataset,
    known_counts: CollectionCounts,
    students_seen: bool,
    generation: u64,
    loaded: bool,
    stage_pending: bool,
}

impl EngineState {
    fn accept(&mut self, dataset: Dataset) {
        self.known_counts = dataset.counts();
        self.students_seen |= !dataset.students.is_empty();
        self.dataset = dataset;
        self.generation += 1;
        self.loaded = true;
    }
}

struct Inner<R, C> {
    remote: R,
    cache: C,
    config: SyncConfig,
    state: RwLock<EngineState>,
    dataset_tx: watch::Sender<Arc<Dataset>>,
    status_tx: watch::Sender<SyncStatus>,
    in_flight: AtomicUsize,
    contexts: Arc<AtomicUsize>,
    cadence_changed: Arc<Notify>,
    cached_generation: Mutex<u64>,
    poller: TaskSlot,
    debounce: TaskSlot,
}

/// Cheaply cloneable handle to the engine.
pub struct SyncEngine<R, C> {
    inner: Arc<Inner<R, C>>,
}

impl<R, C> Clone for SyncEngine<R, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Keeps the poll loop on the fast cadence while alive.
pub struct SyncContext {
    kind: ContextKind,
    contexts: Arc<AtomicUsize>,
    cadence_changed: Arc<Notify>,
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        let remaining = self.contexts.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::debug!(kind = ?self.kind, remaining, "Sync context closed");
        if remaining == 0 {
            self.cadence_changed.notify_one();
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<R: RemoteStore, C: LocalCache> SyncEngine<R, C> {
    pub fn new(remote: R, cache: C, config: SyncConfig) -> Self {
        let (dataset_tx, _) = watch::channel(Arc::new(Dataset::default()));
        let (status_tx, _) = watch::channel(SyncStatus::Loading);

        Self {
            inner: Arc::new(Inner {
                remote,
                cache,
                config,
                state: RwLock::new(EngineState {
                    dataset: Dataset::default(),
                    known_counts: CollectionCounts::default(),
                    students_seen: false,
                    generation: 0,
                    loaded: false,
                    stage_pending: false,
                }),
                dataset_tx,
                status_tx,
                in_flight: AtomicUsize::new(0),
                contexts: Arc::new(AtomicUsize::new(0)),
                cadence_changed: Arc::new(Notify::new()),
                cached_generation: Mutex::new(0),
                poller: TaskSlot::new(),
                debounce: TaskSlot::new(),
            }),
        }
    }

    pub fn remote(&self) -> &R {
        &self.inner.remote
    }

    pub fn cache(&self) -> &C {
        &self.inner.cache
    }

    /// The reconciled dataset as of now.
    pub fn current_dataset(&self) -> Arc<Dataset> {
        self.inner.dataset_tx.borrow().clone()
    }

    /// Notified on every change to the served dataset.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Dataset>> {
        self.inner.dataset_tx.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status_tx.subscribe()
    }

    /// True while any read or write is talking to the remote store.
    pub fn is_syncing(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn student_status(&self, student_id: &str) -> Option<StudentStatus> {
        self.current_dataset().student(student_id).map(|s| s.status)
    }

    /// Loads the local cache, then performs the first remote read.
    pub async fn bootstrap(&self) -> RefreshOutcome {
        self.restore_from_cache().await;
        self.refresh().await
    }

    async fn restore_from_cache(&self) -> bool {
        let cached = match self.inner.cache.load().await {
            Ok(Some(dataset)) => dataset,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(error = %e, "Local cache unavailable");
                return false;
            }
        };

        let mut state = self.inner.state.write().await;
        if state.loaded {
            return false;
        }
        state.accept(cached);
        self.publish(&state.dataset);
        tracing::info!(
            students = state.known_counts.students,
            sessions = state.known_counts.sessions,
            rooms = state.known_counts.rooms,
            "Serving cached dataset until the remote store answers"
        );
        true
    }

    /// Pulls a snapshot and, if it passes the data-loss guard and nothing
    /// newer happened locally meanwhile, makes it the served dataset.
    pub async fn refresh(&self) -> RefreshOutcome {
        let started = self.inner.state.read().await.generation;
        let _in_flight = InFlight::enter(&self.inner.in_flight);

        let mut fetched = match self.inner.remote.fetch_snapshot().await {
            Ok(dataset) => dataset,
            Err(e) => {
                tracing::warn!(error = %e, "Snapshot unavailable, serving last-known-good dataset");
                let loaded = self.inner.state.read().await.loaded;
                if !loaded {
                    self.restore_from_cache().await;
                }
                self.set_status(SyncStatus::Stale);
                return RefreshOutcome::Stale(e.to_string());
            }
        };

        let cleared = fetched.clear_dangling_room_refs();
        if cleared > 0 {
            tracing::warn!(cleared, "Snapshot carried dangling room references");
        }

        let (snapshot, generation) = {
            let mut state = self.inner.state.write().await;

            if state.generation != started || state.stage_pending {
                tracing::debug!(
                    started,
                    current = state.generation,
                    stage_pending = state.stage_pending,
                    "Discarding snapshot superseded by local changes"
                );
                return RefreshOutcome::Superseded;
            }

            if let Err(e) = guard::check_snapshot(&fetched, &state.known_counts, &state.dataset) {
                tracing::warn!(error = %e, "Data-loss guard rejected snapshot");
                drop(state);
                self.set_status(SyncStatus::Stale);
                return RefreshOutcome::Stale(e.to_string());
            }

            state.accept(fetched);
            self.publish(&state.dataset);
            (state.dataset.clone(), state.generation)
        };

        self.set_status(SyncStatus::Online);
        tracing::debug!(
            generation,
            students = snapshot.students.len(),
            sessions = snapshot.sessions.len(),
            rooms = snapshot.rooms.len(),
            "Snapshot accepted"
        );

        self.persist(&snapshot, generation).await;
        RefreshOutcome::Accepted
    }

    async fn persist(&self, snapshot: &Dataset, generation: u64) {
        let mut cached = self.inner.cached_generation.lock().await;
        if generation <= *cached {
            return;
        }
        match self.inner.cache.store(snapshot).await {
            Ok(()) => *cached = generation,
            Err(e) => tracing::warn!(error = %e, "Failed to write local cache"),
        }
    }

    /// Applies `action` locally, pushes it, and reconciles.
    ///
    /// Resolves `Ok(false)` when the write is known to have failed; the
    /// optimistic change is then rolled back (if nothing newer replaced it)
    /// and a fresh snapshot is pulled. Authorization and validation errors
    /// are returned before anything is written anywhere.
    pub async fn dispatch(&self, role: &Role, mut action: Action) -> Result<bool> {
        action.normalize();

        let (previous, generation) = {
            let mut state = self.inner.state.write().await;
            role.authorize(&action, &state.dataset)?;
            action.keep_secrets(&state.dataset);
            if action.is_full_overwrite() {
                guard::check_full_overwrite(&action, state.students_seen)?;
            }

            let previous = state.dataset.clone();
            action.apply(&mut state.dataset)?;
            state.generation += 1;
            self.publish(&state.dataset);
            (previous, state.generation)
        };

        tracing::info!(action = %action.name(), role = %role, generation, "Dispatching action");

        let outcome = {
            let _in_flight = InFlight::enter(&self.inner.in_flight);
            self.inner.remote.apply_action(&action).await
        };

        match outcome {
            WriteOutcome::Confirmed => {
                self.refresh().await;
                Ok(true)
            }
            WriteOutcome::Ambiguous => {
                tracing::debug!(
                    action = %action.name(),
                    "Write outcome unknown, optimistic state stands until next poll"
                );
                Ok(true)
            }
            WriteOutcome::Failed(reason) => {
                tracing::error!(action = %action.name(), reason = %reason, "Remote write failed");
                self.roll_back(previous, generation).await;
                self.refresh().await;
                Ok(false)
            }
        }
    }

    async fn roll_back(&self, previous: Dataset, generation: u64) {
        let mut state = self.inner.state.write().await;
        if state.generation != generation {
            tracing::debug!(
                generation,
                current = state.generation,
                "Newer changes landed, leaving rollback to reconciliation"
            );
            return;
        }
        state.dataset = previous;
        state.generation += 1;
        self.publish(&state.dataset);
    }

    /// Admin edit applied locally now and pushed as one debounced `SYNC_ALL`.
    /// Each new edit restarts the quiet period.
    pub async fn stage(&self, role: &Role, mut action: Action) -> Result<()> {
        if *role != Role::Admin {
            return Err(PortalError::Forbidden {
                role: role.to_string(),
                action: action.name().to_string(),
            });
        }
        action.normalize();

        {
            let mut state = self.inner.state.write().await;
            action.keep_secrets(&state.dataset);
            action.apply(&mut state.dataset)?;
            state.generation += 1;
            state.stage_pending = true;
            self.publish(&state.dataset);
        }

        tracing::debug!(
            action = %action.name(),
            debounce_ms = self.inner.config.debounce.as_millis() as u64,
            "Staged admin edit"
        );

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .debounce
            .schedule_after(self.inner.config.debounce, async move {
                if let Some(engine) = Self::upgrade(&weak) {
                    // Detached so a later edit cannot abort a push mid-flight.
                    tokio::spawn(async move {
                        if let Err(e) = engine.push_full_sync().await {
                            tracing::error!(error = %e, "Debounced full sync refused");
                        }
                    });
                }
            });
        Ok(())
    }

    /// Pushes the whole local dataset as the administrator.
    pub async fn push_full_sync(&self) -> Result<bool> {
        let snapshot = {
            let mut state = self.inner.state.write().await;
            state.stage_pending = false;
            state.dataset.clone()
        };
        self.dispatch(&Role::Admin, Action::SyncAll(snapshot)).await
    }

    /// True while staged edits wait for their debounced push.
    pub fn has_pending_stage(&self) -> bool {
        self.inner.debounce.is_pending()
    }

    pub fn enter_context(&self, kind: ContextKind) -> SyncContext {
        let previous = self.inner.contexts.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(kind = ?kind, open = previous + 1, "Sync context opened");
        if previous == 0 {
            self.inner.cadence_changed.notify_one();
        }
        SyncContext {
            kind,
            contexts: Arc::clone(&self.inner.contexts),
            cadence_changed: Arc::clone(&self.inner.cadence_changed),
        }
    }

    /// Poll interval for the next cycle.
    pub fn current_interval(&self) -> Duration {
        if self.inner.contexts.load(Ordering::SeqCst) > 0 {
            self.inner.config.fast_interval
        } else {
            self.inner.config.slow_interval
        }
    }

    /// Starts the background poll loop, replacing any loop already running.
    pub fn start_polling(&self) {
        let weak = Arc::downgrade(&self.inner);
        let cadence_changed = Arc::clone(&self.inner.cadence_changed);

        self.inner.poller.schedule(async move {
            loop {
                let Some(engine) = Self::upgrade(&weak) else {
                    break;
                };
                let interval = engine.current_interval();
                drop(engine);

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cadence_changed.notified() => {
                        tracing::debug!("Poll cadence changed");
                        continue;
                    }
                }

                let Some(engine) = Self::upgrade(&weak) else {
                    break;
                };
                let outcome = engine.refresh().await;
                tracing::debug!(outcome = ?outcome, "Poll cycle finished");
            }
        });

        tracing::info!(
            fast_secs = self.inner.config.fast_interval.as_secs(),
            slow_secs = self.inner.config.slow_interval.as_secs(),
            "Poll loop started"
        );
    }

    pub fn stop_polling(&self) {
        if self.inner.poller.cancel() {
            tracing::info!("Poll loop stopped");
        }
    }

    fn upgrade(weak: &Weak<Inner<R, C>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn publish(&self, dataset: &Dataset) {
        self.inner.dataset_tx.send_replace(Arc::new(dataset.clone()));
    }

    fn set_status(&self, status: SyncStatus) {
        self.inner.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                tracing::info!(from = ?*current, to = ?status, "Sync status changed");
                *current = status;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::model::fixtures::{room, session, student};
    use crate::remote::{FetchFault, InMemoryRemote, WriteBehavior};

    fn seed() -> Dataset {
        let mut in_room = student("1001", "7", StudentStatus::NotStarted);
        in_room.room_ref = Some("r-1".to_string());
        Dataset {
            students: vec![in_room, student("1002", "7", StudentStatus::NotStarted)],
            sessions: vec![session("s-1", "7", "ABCD", true)],
            rooms: vec![room("r-1")],
        }
    }

    fn engine_with(dataset: Dataset) -> SyncEngine<InMemoryRemote, MemoryCache> {
        SyncEngine::new(
            InMemoryRemote::new(dataset),
            MemoryCache::default(),
            SyncConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_bootstrap_accepts_and_caches() {
        let engine = engine_with(seed());
        assert_eq!(engine.status(), SyncStatus::Loading);

        assert_eq!(engine.bootstrap().await, RefreshOutcome::Accepted);
        assert_eq!(engine.status(), SyncStatus::Online);
        assert_eq!(engine.current_dataset().students.len(), 2);
        assert_eq!(engine.inner.cache.snapshot(), Some(seed()));
    }

    #[tokio::test]
    async fn test_cold_start_falls_back_to_cache() {
        let remote = InMemoryRemote::new(seed());
        remote.push_fetch_fault(FetchFault::Fail);
        let engine = SyncEngine::new(remote, MemoryCache::with(seed()), SyncConfig::default());

        assert!(matches!(engine.bootstrap().await, RefreshOutcome::Stale(_)));
        assert_eq!(engine.status(), SyncStatus::Stale);
        assert_eq!(engine.current_dataset().students.len(), 2);
    }

    #[tokio::test]
    async fn test_guard_keeps_dataset_and_cache() {
        let engine = engine_with(seed());
        engine.bootstrap().await;

        engine.remote().push_fetch_fault(FetchFault::Empty);
        assert!(matches!(engine.refresh().await, RefreshOutcome::Stale(_)));
        assert_eq!(engine.current_dataset().students.len(), 2);
        assert_eq!(engine.inner.cache.snapshot().map(|d| d.students.len()), Some(2));
    }

    #[tokio::test]
    async fn test_dispatch_forbidden_has_no_effect() {
        let engine = engine_with(seed());
        engine.bootstrap().await;

        let proctor = Role::Proctor {
            room_id: "r-1".to_string(),
        };
        let err = engine
            .dispatch(&proctor, Action::DeleteStudent { id: "1001".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::Forbidden { .. }));
        assert!(engine.remote().writes().is_empty());
        assert_eq!(engine.current_dataset().students.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back() {
        let engine = engine_with(seed());
        engine.bootstrap().await;
        engine
            .remote()
            .set_write_behavior(WriteBehavior::Reject("sheet locked".to_string()));

        let ok = engine
            .dispatch(
                &Role::Admin,
                Action::UpdateStudentStatus {
                    id: "1002".to_string(),
                    status: StudentStatus::Blocked,
                },
            )
            .await
            .unwrap();

        assert!(!ok);
        assert_eq!(engine.student_status("1002"), Some(StudentStatus::NotStarted));
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_empty_full_overwrite_refused() {
        let engine = engine_with(seed());
        engine.bootstrap().await;

        let err = engine
            .dispatch(&Role::Admin, Action::SyncAll(Dataset::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::EmptyOverwrite));
        assert!(engine.remote().writes().is_empty());
    }

    #[tokio::test]
    async fn test_stale_fetch_discarded_after_local_change() {
        let engine = engine_with(seed());
        engine.bootstrap().await;
        engine.remote().set_latency(Duration::from_millis(50));

        // Snapshot taken before the status change lands after it.
        let background = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.remote().set_latency(Duration::ZERO);
        engine
            .dispatch(
                &Role::Admin,
                Action::UpdateStudentStatus {
                    id: "1001".to_string(),
                    status: StudentStatus::InProgress,
                },
            )
            .await
            .unwrap();

        assert_eq!(background.await.unwrap(), RefreshOutcome::Superseded);
        assert_eq!(engine.student_status("1001"), Some(StudentStatus::InProgress));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence_follows_contexts() {
        let engine = engine_with(seed());
        assert_eq!(engine.current_interval(), SyncConfig::default().slow_interval);

        let exam = engine.enter_context(ContextKind::Exam);
        let dashboard = engine.enter_context(ContextKind::Dashboard);
        assert_eq!(engine.current_interval(), SyncConfig::default().fast_interval);

        drop(exam);
        assert_eq!(engine.current_interval(), SyncConfig::default().fast_interval);
        drop(dashboard);
        assert_eq!(engine.current_interval(), SyncConfig::default().slow_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_is_not_doubled() {
        let engine = engine_with(seed());
        engine.start_polling();
        engine.start_polling();

        tokio::time::sleep(SyncConfig::default().slow_interval + Duration::from_millis(10)).await;
        assert_eq!(engine.remote().fetch_count(), 1);
        engine.stop_polling();
    }
}
