//! Data-loss guard.
//!
//! A backend hiccup can answer with a perfectly well-formed, perfectly empty
//! dataset. Accepting it would wipe every collaborator's view, and the next
//! full push would make the loss permanent.

use crate::error::{PortalError, Result};
use crate::model::{Action, CollectionCounts, Dataset};

/// Checks a fetched snapshot against the last accepted counts.
///
/// A collection that was non-empty and now comes back empty is accepted only
/// when the local copy is empty too, i.e. the delete-all was observed here.
pub fn check_snapshot(
    fetched: &Dataset,
    last_known: &CollectionCounts,
    local: &Dataset,
) -> Result<()> {
    let fetched_counts = fetched.counts();
    let local_counts = local.counts();

    let collections = [
        ("students", fetched_counts.students, last_known.students, local_counts.students),
        ("sessions", fetched_counts.sessions, last_known.sessions, local_counts.sessions),
        ("rooms", fetched_counts.rooms, last_known.rooms, local_counts.rooms),
    ];

    for (collection, fetched, known, local) in collections {
        if fetched == 0 && known > 0 && local > 0 {
            return Err(PortalError::DataLossGuard { collection, known });
        }
    }

    Ok(())
}

/// A full overwrite may only carry zero students if students were never seen.
pub fn check_full_overwrite(action: &Action, students_seen: bool) -> Result<()> {
    match action {
        Action::SyncAll(dataset) if dataset.students.is_empty() && students_seen => {
            Err(PortalError::EmptyOverwrite)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{room, session, student};
    use crate::model::StudentStatus;

    fn populated() -> Dataset {
        Dataset {
            students: vec![
                student("1", "7", StudentStatus::NotStarted),
                student("2", "7", StudentStatus::NotStarted),
            ],
            sessions: vec![session("s-1", "7", "ABCD", true)],
            rooms: vec![room("r-1")],
        }
    }

    #[test]
    fn test_rejects_empty_students_when_known() {
        let local = populated();
        let fetched = Dataset {
            students: vec![],
            ..populated()
        };
        let err = check_snapshot(&fetched, &local.counts(), &local).unwrap_err();
        assert!(matches!(
            err,
            PortalError::DataLossGuard {
                collection: "students",
                known: 2
            }
        ));
    }

    #[test]
    fn test_rejects_fully_empty_snapshot() {
        let local = populated();
        assert!(check_snapshot(&Dataset::default(), &local.counts(), &local).is_err());
    }

    #[test]
    fn test_accepts_first_snapshot() {
        let empty = Dataset::default();
        assert!(check_snapshot(&populated(), &empty.counts(), &empty).is_ok());
        assert!(check_snapshot(&empty, &empty.counts(), &empty).is_ok());
    }

    #[test]
    fn test_accepts_delete_all_observed_locally() {
        let before = populated();
        let local = Dataset {
            rooms: vec![],
            ..populated()
        };
        let fetched = local.clone();
        assert!(check_snapshot(&fetched, &before.counts(), &local).is_ok());
    }

    #[test]
    fn test_full_overwrite_guard() {
        let empty_push = Action::SyncAll(Dataset::default());
        assert!(matches!(
            check_full_overwrite(&empty_push, true),
            Err(PortalError::EmptyOverwrite)
        ));
        assert!(check_full_overwrite(&empty_push, false).is_ok());
        assert!(check_full_overwrite(&Action::SyncAll(populated()), true).is_ok());

        let narrow = Action::DeleteStudent { id: "1".to_string() };
        assert!(check_full_overwrite(&narrow, true).is_ok());
    }
}
