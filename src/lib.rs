//! Examsy exam portal: a synchronization engine that keeps a shared
//! student/session/room dataset reconciled against a slow, non-transactional
//! remote store, and a per-attempt integrity monitor that locks the exam
//! surface down and reacts to remote blocks.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod monitor;
pub mod portal;
pub mod remote;
pub mod sync;

pub use error::{PortalError, Result};
pub use model::{Action, Dataset, ExamSession, Room, Student, StudentStatus};
pub use sync::{Role, SyncEngine, SyncStatus};
