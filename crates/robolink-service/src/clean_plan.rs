//! Deciding what a "start cleaning" request turns into.

use std::collections::BTreeSet;
use tracing::warn;

/// The action a start request resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanPlan {
    /// Whole-home clean
    Global,
    /// Clean restricted to these room segments, in selection order
    Rooms(Vec<u32>),
    /// Run a cloud routine instead of cleaning
    Scene(u64),
    /// Nothing to do; the selection is inconsistent
    Conflict(String),
}

/// Resolve a selection into a [`CleanPlan`].
///
/// Selected routines the account does not offer are ignored. A single
/// remaining routine wins over any room selection; several are a conflict.
/// Otherwise a room clean is issued unless the selection is empty, covers
/// every supported room, or the device reports no rooms at all.
pub fn plan(
    selected_rooms: &[u32],
    supported_rooms: &[u32],
    selected_routines: &[u64],
    supported_routines: &[u64],
) -> CleanPlan {
    let routines: BTreeSet<u64> = selected_routines
        .iter()
        .copied()
        .filter(|id| {
            let supported = supported_routines.contains(id);
            if !supported {
                warn!(routine = *id, "Ignoring unknown routine");
            }
            supported
        })
        .collect();
    match routines.len() {
        0 => {}
        1 => {
            if let Some(&id) = routines.iter().next() {
                return CleanPlan::Scene(id);
            }
        }
        n => {
            return CleanPlan::Conflict(format!(
                "{} routines selected, only one can run at a time",
                n
            ))
        }
    }

    if selected_rooms.is_empty() || supported_rooms.is_empty() {
        return CleanPlan::Global;
    }

    let selected: BTreeSet<u32> = selected_rooms.iter().copied().collect();
    let supported: BTreeSet<u32> = supported_rooms.iter().copied().collect();
    if selected == supported {
        return CleanPlan::Global;
    }

    let mut seen = BTreeSet::new();
    let rooms = selected_rooms
        .iter()
        .copied()
        .filter(|room| seen.insert(*room))
        .collect();
    CleanPlan::Rooms(rooms)
}
