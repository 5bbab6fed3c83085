//! Session Integrity Monitor
//!
//! One monitor per exam attempt. [`IntegrityMonitor`] is the lockdown state
//! machine itself and never touches a clock or a network: callers pass the
//! current instant in. [`driver`] runs it as a task wired to the
//! synchronization engine and the client's capabilities.
//!
//! ```text
//! AwaitingConsent --arm--> Armed <--resume-- Violated
//!                            |  ---signal-->    |
//!                            +------+-----------+
//!                                   v
//!                              Terminated
//! ```

pub mod capability;
pub mod driver;

pub use capability::{
    client_capabilities, Capability, CapabilityHandle, CapabilityKind, CapabilitySet,
    ClientCapability, ClientGrants,
};
pub use driver::{spawn_monitor, MonitorHandle, MonitorSnapshot, StatusReporter};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::MonitorConfig;
use crate::model::StudentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum MonitorState {
    AwaitingConsent,
    Armed,
    Violated,
    Terminated(TerminationReason),
}

impl MonitorState {
    pub fn is_active(&self) -> bool {
        matches!(self, MonitorState::Armed | MonitorState::Violated)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, MonitorState::Terminated(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminationReason {
    MaxViolations,
    TimeExpired,
    Finished,
    RemoteBlock,
    /// The surface went away (socket closed, page unloaded) without finishing.
    Abandoned,
}

impl TerminationReason {
    /// Status to report upstream, if any.
    pub fn reported_status(&self) -> Option<StudentStatus> {
        match self {
            TerminationReason::MaxViolations => Some(StudentStatus::Blocked),
            TerminationReason::TimeExpired | TerminationReason::Finished => {
                Some(StudentStatus::Completed)
            }
            // Already BLOCKED upstream; nothing left to write.
            TerminationReason::RemoteBlock => None,
            TerminationReason::Abandoned => None,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TerminationReason::MaxViolations => "violation limit reached",
            TerminationReason::TimeExpired => "time expired",
            TerminationReason::Finished => "finished by student",
            TerminationReason::RemoteBlock => "blocked by proctor",
            TerminationReason::Abandoned => "abandoned",
        };
        f.write_str(text)
    }
}

/// Browser lifecycle signals that count as integrity violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Signal {
    VisibilityLost,
    FocusLost,
    FullscreenExited,
    /// Copy, print, devtools and similar.
    ForbiddenInput,
}

impl FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "visibilitylost" | "visibility" | "hidden" => Ok(Signal::VisibilityLost),
            "focuslost" | "blur" => Ok(Signal::FocusLost),
            "fullscreenexited" | "fullscreen" => Ok(Signal::FullscreenExited),
            "forbiddeninput" | "copy" | "print" | "devtools" => Ok(Signal::ForbiddenInput),
            other => Err(format!("unknown signal {:?}", other)),
        }
    }
}

/// Violations recorded during one attempt. Reset only by a new attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViolationRecord {
    pub count: u32,
    pub last: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct MonitorPolicy {
    pub max_violations: u32,
    pub cooldown: Duration,
    pub duration: Duration,
    pub camera_required: bool,
    /// Longest the monitor waits for fresh data before asking for a refresh.
    pub block_check_interval: Duration,
}

impl MonitorPolicy {
    pub fn new(config: &MonitorConfig, duration: Duration) -> Self {
        Self {
            max_violations: config.max_violations.max(1),
            cooldown: config.cooldown,
            duration,
            camera_required: config.camera_required,
            block_check_interval: config.block_check_interval,
        }
    }
}

/// What a signal did to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Not armed; signals are not watched.
    Ignored,
    /// Inside the cooldown of the previous violation.
    Throttled,
    Recorded { count: u32 },
    Terminated(TerminationReason),
}

#[derive(Debug, Clone)]
pub struct IntegrityMonitor {
    student_id: String,
    policy: MonitorPolicy,
    state: MonitorState,
    violations: ViolationRecord,
    deadline: Option<Instant>,
}

impl IntegrityMonitor {
    pub fn new(student_id: impl Into<String>, policy: MonitorPolicy) -> Self {
        Self {
            student_id: student_id.into(),
            policy,
            state: MonitorState::AwaitingConsent,
            violations: ViolationRecord::default(),
            deadline: None,
        }
    }

    pub fn student_id(&self) -> &str {
        &self.student_id
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn policy(&self) -> &MonitorPolicy {
        &self.policy
    }

    pub fn violations(&self) -> ViolationRecord {
        self.violations
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        match (self.state, self.deadline) {
            (MonitorState::Terminated(_), _) => Duration::ZERO,
            (_, Some(deadline)) => deadline.saturating_duration_since(now),
            (_, None) => self.policy.duration,
        }
    }

    /// Enters `Armed` and starts the countdown. Capabilities are acquired
    /// by the caller beforehand. Returns false outside `AwaitingConsent`.
    pub fn arm(&mut self, now: Instant) -> bool {
        if self.state != MonitorState::AwaitingConsent {
            return false;
        }
        self.state = MonitorState::Armed;
        self.deadline = Some(now + self.policy.duration);
        true
    }

    pub fn record_signal(&mut self, signal: Signal, now: Instant) -> SignalOutcome {
        if !self.state.is_active() {
            return SignalOutcome::Ignored;
        }

        if let Some(last) = self.violations.last {
            if now.saturating_duration_since(last) < self.policy.cooldown {
                tracing::debug!(
                    student_id = %self.student_id,
                    signal = ?signal,
                    "Violation within cooldown, not counted"
                );
                return SignalOutcome::Throttled;
            }
        }

        self.violations.count += 1;
        self.violations.last = Some(now);
        tracing::warn!(
            student_id = %self.student_id,
            signal = ?signal,
            count = self.violations.count,
            max = self.policy.max_violations,
            "Integrity violation recorded"
        );

        if self.violations.count >= self.policy.max_violations {
            return match self.terminate(TerminationReason::MaxViolations) {
                Some(reason) => SignalOutcome::Terminated(reason),
                None => SignalOutcome::Ignored,
            };
        }

        self.state = MonitorState::Violated;
        SignalOutcome::Recorded {
            count: self.violations.count,
        }
    }

    /// Student acknowledged the violation notice.
    pub fn resume(&mut self) -> bool {
        if self.state != MonitorState::Violated {
            return false;
        }
        self.state = MonitorState::Armed;
        true
    }

    /// Countdown check.
    pub fn tick(&mut self, now: Instant) -> Option<TerminationReason> {
        match self.deadline {
            Some(deadline) if self.state.is_active() && now >= deadline => {
                self.terminate(TerminationReason::TimeExpired)
            }
            _ => None,
        }
    }

    pub fn finish(&mut self) -> Option<TerminationReason> {
        if !self.state.is_active() {
            return None;
        }
        self.terminate(TerminationReason::Finished)
    }

    /// Reacts to this student's status as seen in the reconciled dataset.
    pub fn observe_status(&mut self, status: StudentStatus) -> Option<TerminationReason> {
        if status == StudentStatus::Blocked {
            self.terminate(TerminationReason::RemoteBlock)
        } else {
            None
        }
    }

    pub fn abandon(&mut self) -> Option<TerminationReason> {
        self.terminate(TerminationReason::Abandoned)
    }

    /// Returns the reason only on the transition into `Terminated`.
    fn terminate(&mut self, reason: TerminationReason) -> Option<TerminationReason> {
        if self.state.is_terminated() {
            return None;
        }
        tracing::info!(student_id = %self.student_id, reason = %reason, "Exam attempt terminated");
        self.state = MonitorState::Terminated(reason);
        Some(reason)
    }
}
