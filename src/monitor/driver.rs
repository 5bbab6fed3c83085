use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{
    CapabilityKind, CapabilitySet, IntegrityMonitor, MonitorPolicy, MonitorState, Signal,
    SignalOutcome, TerminationReason,
};
use crate::cache::LocalCache;
use crate::error::{PortalError, Result};
use crate::model::{Action, Dataset, StudentStatus};
use crate::remote::RemoteStore;
use crate::sync::{ContextKind, Role, SyncContext, SyncEngine};

/// The monitor's view of the synchronization engine.
pub trait StatusReporter: Clone + Send + Sync + 'static {
    fn observe(&self) -> watch::Receiver<Arc<Dataset>>;

    /// Writes the student's own status through the normal dispatch path.
    fn report_status(
        &self,
        student_id: &str,
        status: StudentStatus,
    ) -> impl Future<Output = bool> + Send;

    fn request_refresh(&self) -> impl Future<Output = ()> + Send;

    /// Held for the whole attempt to keep polling on the fast cadence.
    fn exam_context(&self) -> SyncContext;
}

impl<R: RemoteStore, C: LocalCache> StatusReporter for SyncEngine<R, C> {
    fn observe(&self) -> watch::Receiver<Arc<Dataset>> {
        self.subscribe()
    }

    async fn report_status(&self, student_id: &str, status: StudentStatus) -> bool {
        let role = Role::Student {
            id: student_id.to_string(),
        };
        let action = Action::UpdateStudentStatus {
            id: student_id.to_string(),
            status,
        };
        match self.dispatch(&role, action).await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                tracing::error!(student_id = %student_id, status = %status, error = %e, "Status report refused");
                false
            }
        }
    }

    async fn request_refresh(&self) {
        self.refresh().await;
    }

    fn exam_context(&self) -> SyncContext {
        self.enter_context(ContextKind::Exam)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityStatus {
    pub kind: CapabilityKind,
    pub held: bool,
}

/// Published after every change, and on every countdown tick.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    pub student_id: String,
    pub session_id: String,
    #[serde(flatten)]
    pub state: MonitorState,
    pub violations: u32,
    pub max_violations: u32,
    pub remaining_secs: u64,
    pub capabilities: Vec<CapabilityStatus>,
}

#[derive(Debug)]
enum Command {
    Consent,
    Signal(Signal),
    Resume,
    Finish,
    Abandon,
}

struct Request {
    command: Command,
    reply: oneshot::Sender<Result<MonitorSnapshot>>,
}

/// Handle to a running monitor task. Dropping it abandons the attempt.
pub struct MonitorHandle {
    commands: mpsc::UnboundedSender<Request>,
    snapshots: watch::Receiver<MonitorSnapshot>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    async fn request(&self, command: Command) -> Result<MonitorSnapshot> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Request { command, reply })
            .map_err(|_| PortalError::MonitorClosed)?;
        response.await.map_err(|_| PortalError::MonitorClosed)?
    }

    /// Student acknowledged the lockdown notice; acquire and arm.
    pub async fn consent(&self) -> Result<MonitorSnapshot> {
        self.request(Command::Consent).await
    }

    pub async fn signal(&self, signal: Signal) -> Result<MonitorSnapshot> {
        self.request(Command::Signal(signal)).await
    }

    pub async fn resume(&self) -> Result<MonitorSnapshot> {
        self.request(Command::Resume).await
    }

    pub async fn finish(&self) -> Result<MonitorSnapshot> {
        self.request(Command::Finish).await
    }

    pub async fn abandon(&self) -> Result<MonitorSnapshot> {
        self.request(Command::Abandon).await
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorSnapshot> {
        self.snapshots.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the monitor task to end.
    pub async fn join(self) {
        let MonitorHandle { commands, task, .. } = self;
        // Keep the sender alive so joining never abandons a live attempt.
        let _commands = commands;
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Monitor task failed");
        }
    }
}

/// Starts a monitor for one attempt in `AwaitingConsent`.
pub fn spawn_monitor<S: StatusReporter>(
    student_id: impl Into<String>,
    session_id: impl Into<String>,
    policy: MonitorPolicy,
    capabilities: CapabilitySet,
    reporter: S,
) -> MonitorHandle {
    let monitor = IntegrityMonitor::new(student_id, policy);
    let session_id = session_id.into();
    let (commands, command_rx) = mpsc::unbounded_channel();
    let initial = snapshot_of(&monitor, &session_id, &capabilities, Instant::now());
    let (snapshot_tx, snapshots) = watch::channel(initial);

    tracing::info!(
        student_id = %monitor.student_id(),
        session_id = %session_id,
        duration_secs = monitor.policy().duration.as_secs(),
        "Integrity monitor started"
    );

    let driver = Driver {
        monitor,
        session_id,
        capabilities,
        reporter,
        snapshots: snapshot_tx,
    };
    let task = tokio::spawn(driver.run(command_rx));

    MonitorHandle {
        commands,
        snapshots,
        task,
    }
}

fn snapshot_of(
    monitor: &IntegrityMonitor,
    session_id: &str,
    capabilities: &CapabilitySet,
    now: Instant,
) -> MonitorSnapshot {
    MonitorSnapshot {
        student_id: monitor.student_id().to_string(),
        session_id: session_id.to_string(),
        state: monitor.state(),
        violations: monitor.violations().count,
        max_violations: monitor.policy().max_violations,
        remaining_secs: monitor.remaining(now).as_secs(),
        capabilities: capabilities
            .held()
            .into_iter()
            .map(|(kind, held)| CapabilityStatus { kind, held })
            .collect(),
    }
}

struct Driver<S> {
    monitor: IntegrityMonitor,
    session_id: String,
    capabilities: CapabilitySet,
    reporter: S,
    snapshots: watch::Sender<MonitorSnapshot>,
}

impl<S: StatusReporter> Driver<S> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Request>) {
        let _context = self.reporter.exam_context();
        let mut datasets = self.reporter.observe();

        // A block may already be in place before the student consents.
        let current = datasets.borrow_and_update().clone();
        self.observe(&current).await;

        let block_check = self.monitor.policy().block_check_interval;
        let mut countdown = tokio::time::interval(Duration::from_secs(1));
        countdown.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut freshness = tokio::time::interval(block_check);
        freshness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_observed = Instant::now();
        let mut watching = true;

        while !self.monitor.state().is_terminated() {
            tokio::select! {
                request = commands.recv() => match request {
                    Some(Request { command, reply }) => {
                        let result = self.handle(command).await;
                        let _ = reply.send(result);
                    }
                    None => {
                        let reason = self.monitor.abandon();
                        self.conclude(reason).await;
                    }
                },
                _ = countdown.tick() => {
                    let reason = self.monitor.tick(Instant::now());
                    self.conclude(reason).await;
                }
                changed = datasets.changed(), if watching => match changed {
                    Ok(()) => {
                        last_observed = Instant::now();
                        let current = datasets.borrow_and_update().clone();
                        self.observe(&current).await;
                    }
                    Err(_) => {
                        tracing::warn!(student_id = %self.monitor.student_id(), "Dataset feed closed");
                        watching = false;
                    }
                },
                _ = freshness.tick() => {
                    if self.monitor.state().is_active() && last_observed.elapsed() >= block_check {
                        let reporter = self.reporter.clone();
                        tokio::spawn(async move { reporter.request_refresh().await });
                    }
                }
            }
            self.publish();
        }

        // Replies to requests queued behind the terminating one.
        commands.close();
        while let Some(Request { reply, .. }) = commands.recv().await {
            let _ = reply.send(Ok(self.current_snapshot()));
        }
    }

    async fn handle(&mut self, command: Command) -> Result<MonitorSnapshot> {
        let now = Instant::now();
        match command {
            Command::Consent => {
                if self.monitor.state() == MonitorState::AwaitingConsent {
                    // A denied mandatory capability leaves us awaiting consent: retryable.
                    let acquired = self.capabilities.acquire_all().await?;
                    tracing::info!(
                        student_id = %self.monitor.student_id(),
                        capabilities = ?acquired,
                        "Lockdown acknowledged"
                    );
                    self.monitor.arm(now);
                }
            }
            Command::Signal(signal) => {
                if signal == Signal::FullscreenExited {
                    self.capabilities.mark_lost(CapabilityKind::Fullscreen);
                }
                if let SignalOutcome::Terminated(reason) = self.monitor.record_signal(signal, now) {
                    self.conclude(Some(reason)).await;
                }
            }
            Command::Resume => {
                if self.monitor.resume() {
                    let back = self.capabilities.reacquire(CapabilityKind::Fullscreen).await?;
                    tracing::debug!(fullscreen = back, "Resumed after violation");
                }
            }
            Command::Finish => {
                let reason = self.monitor.finish();
                self.conclude(reason).await;
            }
            Command::Abandon => {
                let reason = self.monitor.abandon();
                self.conclude(reason).await;
            }
        }
        self.publish();
        Ok(self.current_snapshot())
    }

    async fn observe(&mut self, dataset: &Dataset) {
        if let Some(student) = dataset.student(self.monitor.student_id()) {
            let reason = self.monitor.observe_status(student.status);
            self.conclude(reason).await;
        }
    }

    /// Cleanup for a fresh termination: release first, then report.
    async fn conclude(&mut self, reason: Option<TerminationReason>) {
        let Some(reason) = reason else {
            return;
        };

        let released = self.capabilities.release_all();
        tracing::info!(
            student_id = %self.monitor.student_id(),
            reason = %reason,
            released,
            "Lockdown released"
        );
        self.publish();

        if let Some(status) = reason.reported_status() {
            let student_id = self.monitor.student_id().to_string();
            if !self.reporter.report_status(&student_id, status).await {
                tracing::warn!(
                    student_id = %student_id,
                    status = %status,
                    "Final status not confirmed, next poll reconciles"
                );
            }
        }
    }

    fn current_snapshot(&self) -> MonitorSnapshot {
        snapshot_of(&self.monitor, &self.session_id, &self.capabilities, Instant::now())
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.current_snapshot());
    }
}
