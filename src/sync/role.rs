use std::fmt;

use serde::Serialize;

use crate::error::{PortalError, Result};
use crate::model::{Action, Dataset, StudentStatus};

/// Who is dispatching. Decides which actions reach the dataset at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum Role {
    Admin,
    Proctor {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    Student {
        id: String,
    },
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Proctor { .. } => "proctor",
            Role::Student { .. } => "student",
        }
    }

    /// Rejects anything outside the role's write scope.
    ///
    /// Only the administrator may issue full overwrites. Proctors and students
    /// are limited to single-student status changes so that concurrent
    /// operators never clobber each other's unrelated edits.
    pub fn authorize(&self, action: &Action, dataset: &Dataset) -> Result<()> {
        let permitted = match (self, action) {
            (Role::Admin, _) => true,
            (Role::Proctor { room_id }, Action::UpdateStudentStatus { id, .. }) => dataset
                .student(id)
                .map(|s| s.room_ref.as_deref() == Some(room_id.as_str()))
                .unwrap_or(false),
            (Role::Student { id: own }, Action::UpdateStudentStatus { id, status }) => {
                own.trim() == id.trim()
                    && dataset
                        .student(id)
                        .map(|s| student_may_move(s.status, *status))
                        .unwrap_or(false)
            }
            _ => false,
        };

        if permitted {
            Ok(())
        } else {
            Err(PortalError::Forbidden {
                role: self.to_string(),
                action: action.name().to_string(),
            })
        }
    }
}

/// Students only move their own status forward; a block is final.
fn student_may_move(from: StudentStatus, to: StudentStatus) -> bool {
    use StudentStatus::*;
    match (from, to) {
        (Blocked, Blocked) => true,
        (Blocked, _) => false,
        (_, Blocked) => true,
        (Completed, Completed) => true,
        (Completed, _) => false,
        (_, NotStarted) => false,
        _ => true,
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Proctor { room_id } => write!(f, "proctor of {}", room_id),
            Role::Student { id } => write!(f, "student {}", id),
        }
    }
}
