//! Shared dataset: students, exam sessions and rooms.
//!
//! The whole [`Dataset`] is the unit of snapshot, cache and synchronization.
//! Field names serialize in camelCase; the legacy spreadsheet headers
//! (`nis`, `kelas`, `pin`, `pdfUrl`, ...) are accepted on the way in.

mod action;
pub mod lenient;

pub use action::{Action, BulkStudentUpdate, RoomChange};

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StudentStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Blocked,
}

impl StudentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StudentStatus::NotStarted => "NOT_STARTED",
            StudentStatus::InProgress => "IN_PROGRESS",
            StudentStatus::Completed => "COMPLETED",
            StudentStatus::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for StudentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StudentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
            "NOT_STARTED" | "BELUM_MASUK" => Ok(StudentStatus::NotStarted),
            "IN_PROGRESS" | "SEDANG_UJIAN" => Ok(StudentStatus::InProgress),
            "COMPLETED" | "SELESAI" => Ok(StudentStatus::Completed),
            "BLOCKED" | "BLOKIR" => Ok(StudentStatus::Blocked),
            other => Err(format!("unknown student status {:?}", other)),
        }
    }
}

impl<'de> Deserialize<'de> for StudentStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = lenient::string(deserializer)?;
        if raw.is_empty() {
            return Ok(StudentStatus::NotStarted);
        }
        Ok(raw.parse().unwrap_or_else(|e: String| {
            tracing::warn!(status = %raw, error = %e, "Unrecognised status, treating as NOT_STARTED");
            StudentStatus::NotStarted
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    #[serde(alias = "nis", deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(alias = "name", alias = "nama", default, deserialize_with = "lenient::string")]
    pub display_name: String,
    #[serde(alias = "class", alias = "kelas", default, deserialize_with = "lenient::string")]
    pub class_label: String,
    #[serde(alias = "password", default, deserialize_with = "lenient::string")]
    pub credential_secret: String,
    #[serde(default)]
    pub status: StudentStatus,
    #[serde(
        alias = "roomId",
        alias = "ruangid",
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub room_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamSession {
    #[serde(deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(alias = "name", alias = "nama", default, deserialize_with = "lenient::string")]
    pub label: String,
    #[serde(alias = "class", alias = "kelas", default, deserialize_with = "lenient::string")]
    pub class_label: String,
    #[serde(alias = "pin", default, deserialize_with = "lenient::string")]
    pub access_code: String,
    #[serde(alias = "durasi", default, deserialize_with = "lenient::number")]
    pub duration_minutes: u32,
    #[serde(alias = "aktif", default, deserialize_with = "lenient::flag")]
    pub is_active: bool,
    #[serde(
        alias = "pdfUrl",
        alias = "pdfurl",
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub external_document_ref: Option<String>,
}

impl ExamSession {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.duration_minutes) * 60)
    }

    pub fn admits_class(&self, class_label: &str) -> bool {
        self.class_label.trim() == class_label.trim()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    #[serde(deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(alias = "name", alias = "nama", default, deserialize_with = "lenient::string")]
    pub label: String,
    #[serde(alias = "kapasitas", default, deserialize_with = "lenient::number")]
    pub capacity: u32,
    #[serde(
        alias = "username",
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub proctor_username: Option<String>,
    #[serde(
        alias = "password",
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub proctor_secret: Option<String>,
}

/// Sizes of each collection, used by the data-loss guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CollectionCounts {
    pub students: usize,
    pub sessions: usize,
    pub rooms: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub students: Vec<Student>,
    #[serde(default)]
    pub sessions: Vec<ExamSession>,
    #[serde(default)]
    pub rooms: Vec<Room>,
}

impl Dataset {
    pub fn counts(&self) -> CollectionCounts {
        CollectionCounts {
            students: self.students.len(),
            sessions: self.sessions.len(),
            rooms: self.rooms.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.students.is_empty() && self.sessions.is_empty() && self.rooms.is_empty()
    }

    pub fn student(&self, id: &str) -> Option<&Student> {
        let id = id.trim();
        self.students.iter().find(|s| s.id == id)
    }

    pub(crate) fn student_mut(&mut self, id: &str) -> Option<&mut Student> {
        let id = id.trim();
        self.students.iter_mut().find(|s| s.id == id)
    }

    pub fn session(&self, id: &str) -> Option<&ExamSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// Active session whose access code matches, ignoring case.
    pub fn active_session_by_code(&self, code: &str) -> Option<&ExamSession> {
        let code = code.trim();
        self.sessions
            .iter()
            .find(|s| s.is_active && s.access_code.trim().eq_ignore_ascii_case(code))
    }

    pub fn room(&self, id: &str) -> Option<&Room> {
        let id = id.trim();
        self.rooms.iter().find(|r| r.id == id)
    }

    pub fn students_in_room<'a>(&'a self, room_id: &'a str) -> impl Iterator<Item = &'a Student> {
        self.students
            .iter()
            .filter(move |s| s.room_ref.as_deref() == Some(room_id))
    }

    /// Clears every `room_ref` that points at a room not in the dataset.
    pub(crate) fn clear_dangling_room_refs(&mut self) -> usize {
        let room_ids: Vec<String> = self.rooms.iter().map(|r| r.id.clone()).collect();
        let mut cleared = 0;
        for student in &mut self.students {
            if let Some(room) = &student.room_ref {
                if !room_ids.iter().any(|id| id == room) {
                    student.room_ref = None;
                    cleared += 1;
                }
            }
        }
        cleared
    }

    /// Copy safe to hand to UI collaborators: no student or proctor secrets.
    pub fn redacted(&self) -> Dataset {
        let mut copy = self.clone();
        for student in &mut copy.students {
            student.credential_secret.clear();
        }
        for room in &mut copy.rooms {
            room.proctor_secret = None;
        }
        copy
    }
}

/// Generates ids such as `s-1718000000000-4821` for new sessions and rooms.
pub fn generate_id(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let suffix: u16 = rand::thread_rng().gen_range(1000..10000);
    format!("{}-{}-{}", prefix, millis, suffix)
}
