//! Login collaborators: students entering an exam room, and staff resolving
//! to an administrator or a room proctor.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::LocalCache;
use crate::config::AdminConfig;
use crate::error::{PortalError, Result};
use crate::model::{Action, Dataset, ExamSession, Room, Student, StudentStatus};
use crate::remote::RemoteStore;
use crate::sync::{Role, SyncEngine};

/// Why a student may not enter. Each check short-circuits the ones after it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoginError {
    #[error("Student id or password is incorrect")]
    WrongCredentials,

    #[error("Account {0} is blocked, contact the administrator")]
    Blocked(String),

    #[error("Student {0} has already completed this exam")]
    AlreadyCompleted(String),

    #[error("Student is registered in class {registered}, not {requested}")]
    StudentClassMismatch { registered: String, requested: String },

    #[error("No active session with access code {0}")]
    SessionNotFound(String),

    #[error("Session {session} is for class {session_class}, not {requested}")]
    SessionClassMismatch {
        session: String,
        session_class: String,
        requested: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentLogin {
    #[serde(alias = "nis")]
    pub student_id: String,
    #[serde(alias = "password")]
    pub secret: String,
    #[serde(alias = "studentClass")]
    pub class_label: String,
    #[serde(alias = "pin")]
    pub access_code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaffLogin {
    pub username: String,
    pub password: String,
}

/// Everything the exam surface needs once a student is let in.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamTicket {
    pub student: Student,
    pub session: ExamSession,
    /// Whether the IN_PROGRESS write was accepted (or at least not refused).
    pub confirmed: bool,
}

/// Runs the login checks against `dataset` without changing anything.
pub fn authenticate_student(
    dataset: &Dataset,
    login: &StudentLogin,
) -> std::result::Result<(Student, ExamSession), LoginError> {
    let student = dataset
        .student(&login.student_id)
        .filter(|s| s.credential_secret == login.secret)
        .ok_or(LoginError::WrongCredentials)?;

    match student.status {
        StudentStatus::Blocked => return Err(LoginError::Blocked(student.id.clone())),
        StudentStatus::Completed => return Err(LoginError::AlreadyCompleted(student.id.clone())),
        StudentStatus::NotStarted | StudentStatus::InProgress => {}
    }

    let requested = login.class_label.trim();
    if student.class_label.trim() != requested {
        return Err(LoginError::StudentClassMismatch {
            registered: student.class_label.clone(),
            requested: requested.to_string(),
        });
    }

    let session = dataset
        .active_session_by_code(&login.access_code)
        .ok_or_else(|| LoginError::SessionNotFound(login.access_code.trim().to_string()))?;

    if !session.admits_class(requested) {
        return Err(LoginError::SessionClassMismatch {
            session: session.label.clone(),
            session_class: session.class_label.clone(),
            requested: requested.to_string(),
        });
    }

    Ok((student.clone(), session.clone()))
}

/// Authenticates and marks the student IN_PROGRESS through the engine.
pub async fn start_session<R: RemoteStore, C: LocalCache>(
    engine: &SyncEngine<R, C>,
    login: &StudentLogin,
) -> Result<ExamTicket> {
    let dataset = engine.current_dataset();
    let (student, session) = authenticate_student(&dataset, login).map_err(|e| {
        tracing::info!(student_id = %login.student_id.trim(), reason = %e, "Student login refused");
        e
    })?;

    let role = Role::Student {
        id: student.id.clone(),
    };
    let confirmed = engine
        .dispatch(
            &role,
            Action::UpdateStudentStatus {
                id: student.id.clone(),
                status: StudentStatus::InProgress,
            },
        )
        .await?;

    tracing::info!(
        student_id = %student.id,
        session_id = %session.id,
        confirmed,
        "Exam session started"
    );

    let mut student = student;
    student.credential_secret.clear();
    // A refused write has already been rolled back and reconciled.
    student.status = engine
        .student_status(&student.id)
        .unwrap_or(student.status);

    Ok(ExamTicket {
        student,
        session,
        confirmed,
    })
}

/// Resolves staff credentials: the configured administrator first, then any
/// room whose proctor credentials match.
pub fn resolve_staff(admin: &AdminConfig, dataset: &Dataset, login: &StaffLogin) -> Result<Role> {
    if login.username == admin.username && login.password == admin.password {
        return Ok(Role::Admin);
    }

    dataset
        .rooms
        .iter()
        .find(|room| proctor_matches(room, login))
        .map(|room| Role::Proctor {
            room_id: room.id.clone(),
        })
        .ok_or(PortalError::InvalidCredentials)
}

fn proctor_matches(room: &Room, login: &StaffLogin) -> bool {
    room.proctor_username.as_deref() == Some(login.username.as_str())
        && room.proctor_secret.as_deref() == Some(login.password.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{room, session, student};

    fn dataset() -> Dataset {
        Dataset {
            students: vec![
                student("1234", "7", StudentStatus::NotStarted),
                student("2000", "7", StudentStatus::Blocked),
                student("3000", "7", StudentStatus::Completed),
            ],
            sessions: vec![
                session("s-1", "7", "ABCD", true),
                session("s-2", "8", "WXYZ", true),
                session("s-3", "7", "OLD1", false),
            ],
            rooms: vec![room("r-1")],
        }
    }

    fn login(id: &str, class_label: &str, code: &str) -> StudentLogin {
        StudentLogin {
            student_id: id.to_string(),
            secret: "secret".to_string(),
            class_label: class_label.to_string(),
            access_code: code.to_string(),
        }
    }

    #[test]
    fn test_successful_login() {
        let (student, session) = authenticate_student(&dataset(), &login(" 1234 ", "7", "abcd")).unwrap();
        assert_eq!(student.id, "1234");
        assert_eq!(session.id, "s-1");
    }

    #[test]
    fn test_checks_run_in_order() {
        let data = dataset();

        let mut wrong = login("1234", "7", "ABCD");
        wrong.secret = "nope".to_string();
        assert_eq!(authenticate_student(&data, &wrong).unwrap_err(), LoginError::WrongCredentials);

        // Blocked wins over a class mismatch.
        assert_eq!(
            authenticate_student(&data, &login("2000", "9", "ABCD")).unwrap_err(),
            LoginError::Blocked("2000".to_string())
        );
        assert_eq!(
            authenticate_student(&data, &login("3000", "7", "ABCD")).unwrap_err(),
            LoginError::AlreadyCompleted("3000".to_string())
        );
        assert!(matches!(
            authenticate_student(&data, &login("1234", "8", "WXYZ")).unwrap_err(),
            LoginError::StudentClassMismatch { .. }
        ));
        assert_eq!(
            authenticate_student(&data, &login("1234", "7", "OLD1")).unwrap_err(),
            LoginError::SessionNotFound("OLD1".to_string())
        );
        assert!(matches!(
            authenticate_student(&data, &login("1234", "7", "WXYZ")).unwrap_err(),
            LoginError::SessionClassMismatch { .. }
        ));
    }

    #[test]
    fn test_resolve_staff() {
        let data = dataset();
        let admin = AdminConfig::default();

        let role = resolve_staff(
            &admin,
            &data,
            &StaffLogin {
                username: "admin".to_string(),
                password: "admin123".to_string(),
            },
        )
        .unwrap();
        assert_eq!(role, Role::Admin);

        let role = resolve_staff(
            &admin,
            &data,
            &StaffLogin {
                username: "proctor_r-1".to_string(),
                password: "proctor123".to_string(),
            },
        )
        .unwrap();
        assert_eq!(
            role,
            Role::Proctor {
                room_id: "r-1".to_string()
            }
        );

        let err = resolve_staff(
            &admin,
            &data,
            &StaffLogin {
                username: "proctor_r-1".to_string(),
                password: "wrong".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, PortalError::InvalidCredentials));
    }
}
