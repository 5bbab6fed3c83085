use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{RemoteStore, WriteOutcome};
use crate::error::{PortalError, Result};
use crate::model::{Action, Dataset};

/// A scripted misbehaviour for the next snapshot read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFault {
    /// The read fails with a network error.
    Fail,
    /// The read succeeds but every collection is empty.
    Empty,
}

/// How the store answers writes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WriteBehavior {
    #[default]
    Confirm,
    /// Refuse with the given message and leave the dataset untouched.
    Reject(String),
    /// Apply the write but report nothing readable.
    AmbiguousApplied,
    /// Report nothing readable and silently drop the write.
    AmbiguousDropped,
}

#[derive(Debug, Default)]
struct MemoryState {
    dataset: Dataset,
    fetch_faults: VecDeque<FetchFault>,
    write_behavior: WriteBehavior,
    writes: Vec<Action>,
    fetches: usize,
}

/// In-process remote store.
///
/// Applies actions with the same rules the local engine uses, which makes it
/// a faithful stand-in for a well-behaved backend. Faults are scripted per
/// call so tests can reproduce flaky reads and lost writes.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    state: Mutex<MemoryState>,
    latency: Mutex<Duration>,
}

impl InMemoryRemote {
    pub fn new(dataset: Dataset) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                dataset,
                ..MemoryState::default()
            }),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn dataset(&self) -> Dataset {
        self.lock().dataset.clone()
    }

    /// Replaces the remote dataset, as if another client had written it.
    pub fn set_dataset(&self, dataset: Dataset) {
        self.lock().dataset = dataset;
    }

    /// Applies an action directly, bypassing write behaviour.
    pub fn apply_external(&self, action: &Action) -> Result<()> {
        action.apply(&mut self.lock().dataset)
    }

    pub fn push_fetch_fault(&self, fault: FetchFault) {
        self.lock().fetch_faults.push_back(fault);
    }

    pub fn set_write_behavior(&self, behavior: WriteBehavior) {
        self.lock().write_behavior = behavior;
    }

    /// Delay added to every call, to widen race windows in tests.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|p| p.into_inner()) = latency;
    }

    /// Every action received, in arrival order.
    pub fn writes(&self) -> Vec<Action> {
        self.lock().writes.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.lock().fetches
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap_or_else(|p| p.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl RemoteStore for InMemoryRemote {
    async fn fetch_snapshot(&self) -> Result<Dataset> {
        // Snapshot taken at request time, delivered after the latency.
        let result = {
            let mut state = self.lock();
            state.fetches += 1;
            match state.fetch_faults.pop_front() {
                Some(FetchFault::Fail) => Err(PortalError::network("scripted fetch failure")),
                Some(FetchFault::Empty) => Ok(Dataset::default()),
                None => Ok(state.dataset.clone()),
            }
        };
        self.simulate_latency().await;
        result
    }

    async fn apply_action(&self, action: &Action) -> WriteOutcome {
        self.simulate_latency().await;

        let mut state = self.lock();
        state.writes.push(action.clone());

        match state.write_behavior.clone() {
            WriteBehavior::Confirm => match action.apply(&mut state.dataset) {
                Ok(()) => WriteOutcome::Confirmed,
                Err(e) => WriteOutcome::Failed(e.to_string()),
            },
            WriteBehavior::Reject(message) => WriteOutcome::Failed(message),
            WriteBehavior::AmbiguousApplied => {
                if let Err(e) = action.apply(&mut state.dataset) {
                    tracing::debug!(error = %e, "Ambiguous write did not apply");
                }
                WriteOutcome::Ambiguous
            }
            WriteBehavior::AmbiguousDropped => WriteOutcome::Ambiguous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::student;
    use crate::model::StudentStatus;

    fn seeded() -> InMemoryRemote {
        InMemoryRemote::new(Dataset {
            students: vec![student("1001", "XII-A", StudentStatus::NotStarted)],
            ..Dataset::default()
        })
    }

    #[tokio::test]
    async fn test_scripted_fetch_faults_are_consumed_in_order() {
        let remote = seeded();
        remote.push_fetch_fault(FetchFault::Fail);
        remote.push_fetch_fault(FetchFault::Empty);

        assert!(remote.fetch_snapshot().await.is_err());
        assert!(remote.fetch_snapshot().await.unwrap().is_empty());
        assert_eq!(remote.fetch_snapshot().await.unwrap().students.len(), 1);
        assert_eq!(remote.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_write_behaviors() {
        let remote = seeded();
        let action = Action::UpdateStudentStatus {
            id: "1001".to_string(),
            status: StudentStatus::InProgress,
        };

        remote.set_write_behavior(WriteBehavior::AmbiguousDropped);
        assert_eq!(remote.apply_action(&action).await, WriteOutcome::Ambiguous);
        assert_eq!(remote.dataset().students[0].status, StudentStatus::NotStarted);

        remote.set_write_behavior(WriteBehavior::Confirm);
        assert_eq!(remote.apply_action(&action).await, WriteOutcome::Confirmed);
        assert_eq!(remote.dataset().students[0].status, StudentStatus::InProgress);

        assert_eq!(remote.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_confirm_reports_apply_failures() {
        let remote = seeded();
        let action = Action::DeleteStudent {
            id: "missing".to_string(),
        };
        assert!(remote.apply_action(&action).await.is_failed());
    }
}
