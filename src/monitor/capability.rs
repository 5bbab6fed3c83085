//! Lockdown capabilities: full-screen presentation, display-sleep lock and
//! camera. Each is an independent handle with its own mandatory flag, and
//! each is released at most once per acquisition.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{PortalError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CapabilityKind {
    Fullscreen,
    WakeLock,
    Camera,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityKind::Fullscreen => f.write_str("fullscreen"),
            CapabilityKind::WakeLock => f.write_str("wakeLock"),
            CapabilityKind::Camera => f.write_str("camera"),
        }
    }
}

/// A platform resource the monitor holds while armed.
pub trait Capability: Send + Sync {
    fn kind(&self) -> CapabilityKind;

    fn acquire(&self) -> BoxFuture<'_, Result<()>>;

    fn release(&self);
}

pub struct CapabilityHandle {
    capability: Box<dyn Capability>,
    mandatory: bool,
    held: AtomicBool,
}

impl CapabilityHandle {
    pub fn new(capability: Box<dyn Capability>, mandatory: bool) -> Self {
        Self {
            capability,
            mandatory,
            held: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> CapabilityKind {
        self.capability.kind()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// `Ok(false)` when an optional capability was denied.
    pub async fn acquire(&self) -> Result<bool> {
        if self.is_held() {
            return Ok(true);
        }

        match self.capability.acquire().await {
            Ok(()) => {
                self.held.store(true, Ordering::SeqCst);
                Ok(true)
            }
            Err(e) if self.mandatory => {
                tracing::warn!(capability = %self.kind(), error = %e, "Mandatory capability denied");
                Err(PortalError::CapabilityDenied(self.kind().to_string()))
            }
            Err(e) => {
                tracing::warn!(
                    capability = %self.kind(),
                    error = %e,
                    "Capability unavailable, continuing without it"
                );
                Ok(false)
            }
        }
    }

    /// Releases if held. Returns whether a release actually happened.
    pub fn release(&self) -> bool {
        if self.held.swap(false, Ordering::SeqCst) {
            self.capability.release();
            tracing::debug!(capability = %self.kind(), "Capability released");
            true
        } else {
            false
        }
    }

    /// The platform took the capability away (e.g. the user left full-screen).
    pub fn mark_lost(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            tracing::debug!(capability = %self.kind(), "Capability lost");
        }
    }
}

/// Capabilities owned by one monitor. Dropping the set releases whatever
/// is still held, so no exit path can leak a lock.
#[derive(Default)]
pub struct CapabilitySet {
    handles: Vec<CapabilityHandle>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, capability: Box<dyn Capability>, mandatory: bool) -> Self {
        self.handles.push(CapabilityHandle::new(capability, mandatory));
        self
    }

    /// Acquires every capability. If a mandatory one is denied, everything
    /// acquired so far is released again and arming can be retried.
    pub async fn acquire_all(&self) -> Result<Vec<(CapabilityKind, bool)>> {
        let mut acquired = Vec::with_capacity(self.handles.len());
        for handle in &self.handles {
            match handle.acquire().await {
                Ok(held) => acquired.push((handle.kind(), held)),
                Err(e) => {
                    self.release_all();
                    return Err(e);
                }
            }
        }
        Ok(acquired)
    }

    pub async fn reacquire(&self, kind: CapabilityKind) -> Result<bool> {
        match self.get(kind) {
            Some(handle) => handle.acquire().await,
            None => Ok(false),
        }
    }

    pub fn mark_lost(&self, kind: CapabilityKind) {
        if let Some(handle) = self.get(kind) {
            handle.mark_lost();
        }
    }

    pub fn release_all(&self) -> usize {
        self.handles.iter().filter(|h| h.release()).count()
    }

    pub fn held(&self) -> Vec<(CapabilityKind, bool)> {
        self.handles.iter().map(|h| (h.kind(), h.is_held())).collect()
    }

    fn get(&self, kind: CapabilityKind) -> Option<&CapabilityHandle> {
        self.handles.iter().find(|h| h.kind() == kind)
    }
}

impl Drop for CapabilitySet {
    fn drop(&mut self) {
        let released = self.release_all();
        if released > 0 {
            tracing::debug!(released, "Released capabilities on teardown");
        }
    }
}

/// What the exam client last reported about each capability.
#[derive(Debug, Default)]
pub struct ClientGrants {
    fullscreen: AtomicBool,
    wake_lock: AtomicBool,
    camera: AtomicBool,
}

impl ClientGrants {
    pub fn set(&self, kind: CapabilityKind, granted: bool) {
        self.flag(kind).store(granted, Ordering::SeqCst);
    }

    pub fn get(&self, kind: CapabilityKind) -> bool {
        self.flag(kind).load(Ordering::SeqCst)
    }

    fn flag(&self, kind: CapabilityKind) -> &AtomicBool {
        match kind {
            CapabilityKind::Fullscreen => &self.fullscreen,
            CapabilityKind::WakeLock => &self.wake_lock,
            CapabilityKind::Camera => &self.camera,
        }
    }
}

type ReleaseFn = Box<dyn Fn(CapabilityKind) + Send + Sync>;

/// A capability living in the remote browser. Acquisition succeeds if the
/// client reported it granted; release is an instruction sent back.
pub struct ClientCapability {
    kind: CapabilityKind,
    grants: Arc<ClientGrants>,
    on_release: ReleaseFn,
}

impl ClientCapability {
    pub fn new(
        kind: CapabilityKind,
        grants: Arc<ClientGrants>,
        on_release: impl Fn(CapabilityKind) + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            grants,
            on_release: Box::new(on_release),
        }
    }
}

impl Capability for ClientCapability {
    fn kind(&self) -> CapabilityKind {
        self.kind
    }

    fn acquire(&self) -> BoxFuture<'_, Result<()>> {
        let granted = self.grants.get(self.kind);
        let kind = self.kind;
        Box::pin(async move {
            if granted {
                Ok(())
            } else {
                Err(PortalError::CapabilityDenied(kind.to_string()))
            }
        })
    }

    fn release(&self) {
        (self.on_release)(self.kind);
    }
}

/// The standard lockdown set backed by client reports.
pub fn client_capabilities(
    grants: Arc<ClientGrants>,
    camera_required: bool,
    on_release: impl Fn(CapabilityKind) + Clone + Send + Sync + 'static,
) -> CapabilitySet {
    CapabilitySet::new()
        .with(
            Box::new(ClientCapability::new(
                CapabilityKind::Fullscreen,
                grants.clone(),
                on_release.clone(),
            )),
            false,
        )
        .with(
            Box::new(ClientCapability::new(
                CapabilityKind::WakeLock,
                grants.clone(),
                on_release.clone(),
            )),
            false,
        )
        .with(
            Box::new(ClientCapability::new(CapabilityKind::Camera, grants, on_release)),
            camera_required,
        )
}
