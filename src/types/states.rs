use std::fmt;

use serde::{Deserialize, Serialize};

/// Declares a state enum stored as text, with `as_str`/`parse` conversions.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(
    /// Placement state of an index on a node.
    IndexState {
        Pending => "pending",
        Ready => "ready",
        Reallocating => "reallocating",
        Orphaned => "orphaned",
        PendingDeletion => "pending_deletion",
        Failed => "failed",
    }
);

impl IndexState {
    /// States whose repositories count towards the "one project per replica" rule.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }

    /// States the cleanup pass may delete once no repositories remain.
    #[must_use]
    pub const fn is_deletable(self) -> bool {
        matches!(self, Self::Orphaned | Self::PendingDeletion)
    }
}

text_enum!(
    /// Storage utilisation level of an index, ordered by severity.
    WatermarkLevel {
        Healthy => "healthy",
        LowWatermarkExceeded => "low_watermark_exceeded",
        HighWatermarkExceeded => "high_watermark_exceeded",
        CriticalWatermarkExceeded => "critical_watermark_exceeded",
    }
);

impl WatermarkLevel {
    #[must_use]
    pub const fn severity(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::LowWatermarkExceeded => 1,
            Self::HighWatermarkExceeded => 2,
            Self::CriticalWatermarkExceeded => 3,
        }
    }
}

text_enum!(
    ReplicaState {
        Pending => "pending",
        Ready => "ready",
    }
);

text_enum!(
    /// Indexing state of one project inside one index.
    RepositoryState {
        Pending => "pending",
        Ready => "ready",
        Failed => "failed",
        Orphaned => "orphaned",
    }
);

impl RepositoryState {
    /// Legal transitions. Any state may become `Orphaned` once its project is gone.
    #[must_use]
    pub const fn can_transition_to(self, to: RepositoryState) -> bool {
        match (self, to) {
            (_, Self::Orphaned) => true,
            (Self::Pending, Self::Ready | Self::Failed) => true,
            (Self::Failed, Self::Pending) => true,
            _ => false,
        }
    }
}

text_enum!(
    TaskType {
        IndexRepo => "index_repo",
        DeleteRepo => "delete_repo",
    }
);

text_enum!(
    TaskState {
        Pending => "pending",
        Processing => "processing",
        Done => "done",
        Skipped => "skipped",
        Failed => "failed",
        Orphaned => "orphaned",
    }
);

impl TaskState {
    /// States that still represent outstanding work.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

text_enum!(
    /// Out-of-band namespace-level work produced by index creation and retirement.
    IndexJobKind {
        IndexNamespace => "index_namespace",
        DeleteNamespace => "delete_namespace",
    }
);

text_enum!(
    IndexJobState {
        Pending => "pending",
        Done => "done",
    }
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_roundtrip_for_every_state() {
        for state in IndexState::ALL {
            assert_eq!(IndexState::parse(state.as_str()), Some(*state));
        }
        for state in TaskState::ALL {
            assert_eq!(TaskState::parse(state.as_str()), Some(*state));
        }
        assert_eq!(TaskType::parse("index_repo"), Some(TaskType::IndexRepo));
        assert_eq!(TaskType::parse("reindex"), None);
    }

    #[test]
    fn test_repository_transitions() {
        use RepositoryState::*;

        assert!(Pending.can_transition_to(Ready));
        assert!(Pending.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Ready.can_transition_to(Orphaned));
        assert!(Failed.can_transition_to(Orphaned));

        assert!(!Failed.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Pending));
        assert!(!Orphaned.can_transition_to(Pending));
        assert!(!Orphaned.can_transition_to(Ready));
    }

    #[test]
    fn test_watermark_severity_is_ordered() {
        let severities: Vec<u8> = WatermarkLevel::ALL.iter().map(|l| l.severity()).collect();
        let mut sorted = severities.clone();
        sorted.sort_unstable();
        assert_eq!(severities, sorted);
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&IndexState::PendingDeletion).unwrap();
        assert_eq!(json, "\"pending_deletion\"");
    }
}
