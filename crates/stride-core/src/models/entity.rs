//! Entity collections known to the sync engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A synchronized entity collection.
///
/// The string form doubles as the local and remote table name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Goals,
    Milestones,
    Habits,
    HabitCompletions,
    Routines,
    RoutineCompletions,
    Tasks,
}

impl EntityType {
    /// Sync order: every parent comes before its dependents.
    pub const SYNC_ORDER: [Self; 7] = [
        Self::Goals,
        Self::Milestones,
        Self::Habits,
        Self::HabitCompletions,
        Self::Routines,
        Self::RoutineCompletions,
        Self::Tasks,
    ];

    /// Collection name used locally and on the wire
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Goals => "goals",
            Self::Milestones => "milestones",
            Self::Habits => "habits",
            Self::HabitCompletions => "habit_completions",
            Self::Routines => "routines",
            Self::RoutineCompletions => "routine_completions",
            Self::Tasks => "tasks",
        }
    }

    /// The collection this one references, if any
    pub const fn parent(self) -> Option<Self> {
        match self {
            Self::Milestones | Self::Tasks => Some(Self::Goals),
            Self::HabitCompletions => Some(Self::Habits),
            Self::RoutineCompletions => Some(Self::Routines),
            Self::Goals | Self::Habits | Self::Routines => None,
        }
    }

    /// Payload field holding the parent id
    pub const fn parent_key(self) -> Option<&'static str> {
        match self {
            Self::Milestones | Self::Tasks => Some("goal_id"),
            Self::HabitCompletions => Some("habit_id"),
            Self::RoutineCompletions => Some("routine_id"),
            Self::Goals | Self::Habits | Self::Routines => None,
        }
    }

    /// Position in [`Self::SYNC_ORDER`]
    pub fn sync_rank(self) -> usize {
        Self::SYNC_ORDER
            .iter()
            .position(|entity| *entity == self)
            .unwrap_or(Self::SYNC_ORDER.len())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::SYNC_ORDER
            .into_iter()
            .find(|entity| entity.as_str() == normalized)
            .ok_or_else(|| format!("unknown entity type '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parents_sync_before_dependents() {
        for entity in EntityType::SYNC_ORDER {
            if let Some(parent) = entity.parent() {
                assert!(
                    parent.sync_rank() < entity.sync_rank(),
                    "{parent} must sync before {entity}"
                );
            }
        }
    }

    #[test]
    fn parent_key_matches_parent() {
        for entity in EntityType::SYNC_ORDER {
            assert_eq!(entity.parent().is_some(), entity.parent_key().is_some());
        }
    }

    #[test]
    fn parse_accepts_table_names_and_dashes() {
        assert_eq!("goals".parse::<EntityType>(), Ok(EntityType::Goals));
        assert_eq!(
            "habit-completions".parse::<EntityType>(),
            Ok(EntityType::HabitCompletions)
        );
        assert!("notes".parse::<EntityType>().is_err());
    }

    #[test]
    fn serde_uses_table_names() {
        let json = serde_json::to_string(&EntityType::RoutineCompletions).unwrap();
        assert_eq!(json, "\"routine_completions\"");
    }
}
