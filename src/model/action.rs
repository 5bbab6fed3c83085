use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{generate_id, Dataset, ExamSession, Room, Student, StudentStatus};
use crate::error::{PortalError, Result};

/// Room assignment change carried by a bulk update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "roomRef", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomChange {
    Assign(String),
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkStudentUpdate {
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StudentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomChange>,
}

/// A mutation of the shared dataset, in the shape the remote store accepts:
/// `{ "action": "UPDATE_STUDENT", "payload": { ... } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    AddStudent(Student),
    UpdateStudent(Student),
    DeleteStudent { id: String },
    BulkUpdateStudents(BulkStudentUpdate),
    AddSession(ExamSession),
    UpdateSession(ExamSession),
    DeleteSession { id: String },
    AddRoom(Room),
    UpdateRoom(Room),
    DeleteRoom { id: String },
    UpdateStudentStatus { id: String, status: StudentStatus },
    SyncAll(Dataset),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::AddStudent(_) => "ADD_STUDENT",
            Action::UpdateStudent(_) => "UPDATE_STUDENT",
            Action::DeleteStudent { .. } => "DELETE_STUDENT",
            Action::BulkUpdateStudents(_) => "BULK_UPDATE_STUDENTS",
            Action::AddSession(_) => "ADD_SESSION",
            Action::UpdateSession(_) => "UPDATE_SESSION",
            Action::DeleteSession { .. } => "DELETE_SESSION",
            Action::AddRoom(_) => "ADD_ROOM",
            Action::UpdateRoom(_) => "UPDATE_ROOM",
            Action::DeleteRoom { .. } => "DELETE_ROOM",
            Action::UpdateStudentStatus { .. } => "UPDATE_STUDENT_STATUS",
            Action::SyncAll(_) => "SYNC_ALL",
        }
    }

    /// Only `SYNC_ALL` replaces whole collections on the remote side.
    pub fn is_full_overwrite(&self) -> bool {
        matches!(self, Action::SyncAll(_))
    }

    /// Trims identifiers and assigns ids to new sessions and rooms that lack one.
    pub fn normalize(&mut self) {
        match self {
            Action::AddStudent(s) | Action::UpdateStudent(s) => {
                s.id = s.id.trim().to_string();
                s.room_ref = s
                    .room_ref
                    .take()
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty());
            }
            Action::DeleteStudent { id }
            | Action::DeleteSession { id }
            | Action::DeleteRoom { id }
            | Action::UpdateStudentStatus { id, .. } => *id = id.trim().to_string(),
            Action::BulkUpdateStudents(bulk) => {
                for id in &mut bulk.ids {
                    *id = id.trim().to_string();
                }
                bulk.ids.retain(|id| !id.is_empty());
            }
            Action::AddSession(session) => {
                if session.id.trim().is_empty() {
                    session.id = generate_id("s");
                }
            }
            Action::AddRoom(room) | Action::UpdateRoom(room) => {
                if room.id.trim().is_empty() {
                    room.id = generate_id("r");
                }
                room.label = room.label.trim().to_uppercase();
            }
            Action::UpdateSession(_) | Action::SyncAll(_) => {}
        }
    }

    /// Applies the mutation to `dataset`. The same function backs optimistic
    /// local updates and the in-memory remote store, so both sides agree.
    pub fn apply(&self, dataset: &mut Dataset) -> Result<()> {
        match self {
            Action::AddStudent(student) => {
                if dataset.student(&student.id).is_some() {
                    return Err(PortalError::DuplicateStudent(student.id.clone()));
                }
                let mut student = student.clone();
                drop_dangling_ref(dataset, &mut student);
                dataset.students.push(student);
            }
            Action::UpdateStudent(update) => {
                let mut update = update.clone();
                drop_dangling_ref(dataset, &mut update);
                let existing = dataset
                    .student_mut(&update.id)
                    .ok_or_else(|| PortalError::StudentNotFound(update.id.clone()))?;
                inherit_student_secret(&mut update, existing);
                *existing = update;
            }
            Action::DeleteStudent { id } => {
                let before = dataset.students.len();
                dataset.students.retain(|s| s.id != id.trim());
                if dataset.students.len() == before {
                    return Err(PortalError::StudentNotFound(id.clone()));
                }
            }
            Action::BulkUpdateStudents(bulk) => {
                if let Some(RoomChange::Assign(room_id)) = &bulk.room {
                    if dataset.room(room_id).is_none() {
                        return Err(PortalError::RoomNotFound(room_id.clone()));
                    }
                }
                for student in dataset
                    .students
                    .iter_mut()
                    .filter(|s| bulk.ids.iter().any(|id| id.trim() == s.id))
                {
                    if let Some(status) = bulk.status {
                        student.status = status;
                    }
                    match &bulk.room {
                        Some(RoomChange::Assign(room_id)) => {
                            student.room_ref = Some(room_id.trim().to_string())
                        }
                        Some(RoomChange::Clear) => student.room_ref = None,
                        None => {}
                    }
                }
            }
            Action::AddSession(session) => {
                if dataset.session(&session.id).is_some() {
                    return Err(PortalError::DuplicateSession(session.id.clone()));
                }
                dataset.sessions.push(session.clone());
            }
            Action::UpdateSession(session) => {
                let existing = dataset
                    .sessions
                    .iter_mut()
                    .find(|s| s.id == session.id)
                    .ok_or_else(|| PortalError::SessionNotFound(session.id.clone()))?;
                *existing = session.clone();
            }
            Action::DeleteSession { id } => {
                let before = dataset.sessions.len();
                dataset.sessions.retain(|s| s.id != *id);
                if dataset.sessions.len() == before {
                    return Err(PortalError::SessionNotFound(id.clone()));
                }
            }
            Action::AddRoom(room) => {
                if dataset.room(&room.id).is_some() {
                    return Err(PortalError::DuplicateRoom(room.id.clone()));
                }
                dataset.rooms.push(room.clone());
            }
            Action::UpdateRoom(room) => {
                let existing = dataset
                    .rooms
                    .iter_mut()
                    .find(|r| r.id == room.id)
                    .ok_or_else(|| PortalError::RoomNotFound(room.id.clone()))?;
                let mut room = room.clone();
                inherit_proctor(&mut room, existing);
                *existing = room;
            }
            Action::DeleteRoom { id } => {
                let before = dataset.rooms.len();
                dataset.rooms.retain(|r| r.id != id.trim());
                if dataset.rooms.len() == before {
                    return Err(PortalError::RoomNotFound(id.clone()));
                }
                // No student may keep pointing at the deleted room.
                dataset.clear_dangling_room_refs();
            }
            Action::UpdateStudentStatus { id, status } => {
                let student = dataset
                    .student_mut(id)
                    .ok_or_else(|| PortalError::StudentNotFound(id.clone()))?;
                student.status = *status;
            }
            Action::SyncAll(full) => {
                let mut full = full.clone();
                keep_dataset_secrets(&mut full, dataset);
                *dataset = full;
                dataset.clear_dangling_room_refs();
            }
        }
        Ok(())
    }

    /// Fills credentials left blank by an edit built from a redacted view with
    /// the stored ones, so the write sent upstream carries them too.
    pub fn keep_secrets(&mut self, dataset: &Dataset) {
        match self {
            Action::UpdateStudent(update) => {
                if let Some(existing) = dataset.student(&update.id) {
                    inherit_student_secret(update, existing);
                }
            }
            Action::UpdateRoom(room) => {
                if let Some(existing) = dataset.room(&room.id) {
                    inherit_proctor(room, existing);
                }
            }
            Action::SyncAll(full) => keep_dataset_secrets(full, dataset),
            _ => {}
        }
    }

    /// `{ action, payload }` body for backends that accept the envelope form.
    pub fn to_envelope(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// `{ action, ...payload }` body for the compatibility mode. Student-keyed
    /// payloads also carry `nis`, which older backends look rows up by.
    pub fn to_flattened(&self) -> Result<Value> {
        let envelope = self.to_envelope()?;
        let mut body = Map::new();
        body.insert("action".to_string(), Value::String(self.name().to_string()));
        if let Some(Value::Object(payload)) = envelope.get("payload") {
            for (key, value) in payload {
                body.insert(key.clone(), value.clone());
            }
        }
        if let Some(id) = self.student_key() {
            body.entry("nis".to_string())
                .or_insert_with(|| Value::String(id.to_string()));
        }
        Ok(Value::Object(body))
    }

    fn student_key(&self) -> Option<&str> {
        match self {
            Action::AddStudent(s) | Action::UpdateStudent(s) => Some(&s.id),
            Action::DeleteStudent { id } | Action::UpdateStudentStatus { id, .. } => Some(id),
            _ => None,
        }
    }
}

fn drop_dangling_ref(dataset: &Dataset, student: &mut Student) {
    if let Some(room_id) = &student.room_ref {
        if dataset.room(room_id).is_none() {
            tracing::warn!(
                student_id = %student.id,
                room_id = %room_id,
                "Room reference does not exist, clearing"
            );
            student.room_ref = None;
        }
    }
}

fn inherit_student_secret(update: &mut Student, existing: &Student) {
    if update.credential_secret.is_empty() {
        update.credential_secret = existing.credential_secret.clone();
    }
}

fn inherit_proctor(update: &mut Room, existing: &Room) {
    if update.proctor_username.is_none() {
        update.proctor_username = existing.proctor_username.clone();
    }
    if update.proctor_secret.is_none() {
        update.proctor_secret = existing.proctor_secret.clone();
    }
}

fn keep_dataset_secrets(full: &mut Dataset, current: &Dataset) {
    for student in &mut full.students {
        if let Some(existing) = current.student(&student.id) {
            inherit_student_secret(student, existing);
        }
    }
    for room in &mut full.rooms {
        if let Some(existing) = current.room(&room.id) {
            inherit_proctor(room, existing);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;

    fn dataset() -> Dataset {
        let mut a = student("1234", "7", StudentStatus::NotStarted);
        a.room_ref = Some("r-1".to_string());
        let b = student("5678", "8", StudentStatus::NotStarted);
        Dataset {
            students: vec![a, b],
            sessions: vec![session("s-1", "7", "ABCD", true)],
            rooms: vec![room("r-1"), room("r-2")],
        }
    }

    #[test]
    fn test_envelope_shape() {
        let action = Action::UpdateStudentStatus {
            id: "1234".to_string(),
            status: StudentStatus::Blocked,
        };
        let value = action.to_envelope().unwrap();
        assert_eq!(value["action"], "UPDATE_STUDENT_STATUS");
        assert_eq!(value["payload"]["id"], "1234");
        assert_eq!(value["payload"]["status"], "BLOCKED");
    }

    #[test]
    fn test_flattened_shape_carries_nis() {
        let action = Action::UpdateStudentStatus {
            id: "1234".to_string(),
            status: StudentStatus::Completed,
        };
        let value = action.to_flattened().unwrap();
        assert_eq!(value["action"], "UPDATE_STUDENT_STATUS");
        assert_eq!(value["nis"], "1234");
        assert_eq!(value["status"], "COMPLETED");
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_envelope_parses_back() {
        let json = r#"{"action": "DELETE_ROOM", "payload": {"id": "r-1"}}"#;
        let action: Action = serde_json::from_str(json).unwrap();
        assert_eq!(action, Action::DeleteRoom { id: "r-1".to_string() });
    }

    #[test]
    fn test_update_student_is_idempotent() {
        let mut update = dataset().students[0].clone();
        update.display_name = "Renamed".to_string();
        update.status = StudentStatus::InProgress;
        let action = Action::UpdateStudent(update);

        let mut once = dataset();
        action.apply(&mut once).unwrap();
        let mut twice = dataset();
        action.apply(&mut twice).unwrap();
        action.apply(&mut twice).unwrap();

        assert_eq!(once, twice);
        assert_eq!(once.students[0].display_name, "Renamed");
    }

    #[test]
    fn test_update_student_keeps_secret_when_blank() {
        let mut update = dataset().students[0].clone();
        update.credential_secret.clear();
        let mut ds = dataset();
        Action::UpdateStudent(update).apply(&mut ds).unwrap();
        assert_eq!(ds.students[0].credential_secret, "secret");
    }

    #[test]
    fn test_room_edit_from_redacted_view_keeps_proctor() {
        let mut ds = dataset();
        let mut edited = ds.redacted().rooms[0].clone();
        edited.capacity = 40;

        Action::UpdateRoom(edited).apply(&mut ds).unwrap();

        assert_eq!(ds.rooms[0].capacity, 40);
        assert_eq!(ds.rooms[0].proctor_secret.as_deref(), Some("proctor123"));
        assert_eq!(ds.rooms[0].proctor_username.as_deref(), Some("proctor_r-1"));
    }

    #[test]
    fn test_full_overwrite_from_redacted_view_keeps_secrets() {
        let mut ds = dataset();
        let mut edited = ds.redacted();
        edited.rooms[1].label = "ROOM B".to_string();
        let mut action = Action::SyncAll(edited);

        action.keep_secrets(&ds);
        match &action {
            Action::SyncAll(full) => {
                assert_eq!(full.students[0].credential_secret, "secret");
                assert_eq!(full.rooms[1].proctor_secret.as_deref(), Some("proctor123"));
            }
            other => panic!("unexpected action {:?}", other),
        }

        action.apply(&mut ds).unwrap();
        assert_eq!(ds.rooms[1].label, "ROOM B");
        assert!(ds.students.iter().all(|s| s.credential_secret == "secret"));
        assert!(ds.rooms.iter().all(|r| r.proctor_secret.is_some()));
    }

    #[test]
    fn test_add_duplicate_student_rejected() {
        let mut ds = dataset();
        let dup = ds.students[0].clone();
        let err = Action::AddStudent(dup).apply(&mut ds).unwrap_err();
        assert!(matches!(err, PortalError::DuplicateStudent(_)));
        assert_eq!(ds.students.len(), 2);
    }

    #[test]
    fn test_add_student_with_unknown_room_clears_ref() {
        let mut ds = dataset();
        let mut s = student("9999", "9", StudentStatus::NotStarted);
        s.room_ref = Some("r-missing".to_string());
        Action::AddStudent(s).apply(&mut ds).unwrap();
        assert_eq!(ds.student("9999").unwrap().room_ref, None);
    }

    #[test]
    fn test_delete_room_clears_student_refs() {
        let mut ds = dataset();
        Action::DeleteRoom { id: "r-1".to_string() }.apply(&mut ds).unwrap();
        assert!(ds.room("r-1").is_none());
        assert!(ds.students.iter().all(|s| s.room_ref.is_none()));
    }

    #[test]
    fn test_bulk_update_assigns_room_and_status() {
        let mut ds = dataset();
        let action = Action::BulkUpdateStudents(BulkStudentUpdate {
            ids: vec!["1234".to_string(), "5678".to_string()],
            status: Some(StudentStatus::NotStarted),
            room: Some(RoomChange::Assign("r-2".to_string())),
        });
        action.apply(&mut ds).unwrap();
        assert!(ds.students.iter().all(|s| s.room_ref.as_deref() == Some("r-2")));

        let clear = Action::BulkUpdateStudents(BulkStudentUpdate {
            ids: vec!["1234".to_string()],
            status: None,
            room: Some(RoomChange::Clear),
        });
        clear.apply(&mut ds).unwrap();
        assert_eq!(ds.student("1234").unwrap().room_ref, None);
        assert_eq!(ds.student("5678").unwrap().room_ref.as_deref(), Some("r-2"));
    }

    #[test]
    fn test_bulk_update_rejects_unknown_room() {
        let mut ds = dataset();
        let action = Action::BulkUpdateStudents(BulkStudentUpdate {
            ids: vec!["1234".to_string()],
            status: None,
            room: Some(RoomChange::Assign("r-nope".to_string())),
        });
        assert!(matches!(action.apply(&mut ds), Err(PortalError::RoomNotFound(_))));
    }

    #[test]
    fn test_status_update_on_missing_student() {
        let mut ds = dataset();
        let action = Action::UpdateStudentStatus {
            id: "0000".to_string(),
            status: StudentStatus::Blocked,
        };
        assert!(matches!(action.apply(&mut ds), Err(PortalError::StudentNotFound(_))));
    }

    #[test]
    fn test_normalize_assigns_ids_and_upcases_room_label() {
        let mut r = room("");
        r.label = "  ruang 01 ".to_string();
        let mut action = Action::AddRoom(r);
        action.normalize();
        match action {
            Action::AddRoom(room) => {
                assert!(room.id.starts_with("r-"));
                assert_eq!(room.label, "RUANG 01");
            }
            _ => panic!("Wrong action type"),
        }
    }

    #[test]
    fn test_only_sync_all_is_full_overwrite() {
        assert!(Action::SyncAll(dataset()).is_full_overwrite());
        assert!(!Action::DeleteStudent { id: "1".to_string() }.is_full_overwrite());
    }
}
