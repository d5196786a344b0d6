use serde::Serialize;

/// States of one run. Linear up to `Tested`, then `Published` or `Failed`,
/// then `Finalized`. Any state may short-circuit to `Finalized` on error or
/// cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    WorkspaceAcquired,
    Cloned,
    Planned,
    EditsApplied,
    Branched,
    Pushed,
    Tested,
    Published,
    Failed,
    Finalized,
}

impl Stage {
    pub fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (Finalized, _) => false,
            (_, Finalized) => true,
            (Created, WorkspaceAcquired)
            | (WorkspaceAcquired, Cloned)
            | (Cloned, Planned)
            | (Planned, EditsApplied)
            | (EditsApplied, Branched)
            | (Branched, Pushed)
            | (Pushed, Tested)
            | (Tested, Published)
            | (Tested, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::WorkspaceAcquired => "workspace_acquired",
            Stage::Cloned => "cloned",
            Stage::Planned => "planned",
            Stage::EditsApplied => "edits_applied",
            Stage::Branched => "branched",
            Stage::Pushed => "pushed",
            Stage::Tested => "tested",
            Stage::Published => "published",
            Stage::Failed => "failed",
            Stage::Finalized => "finalized",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_path() {
        let path = [
            Stage::Created,
            Stage::WorkspaceAcquired,
            Stage::Cloned,
            Stage::Planned,
            Stage::EditsApplied,
            Stage::Branched,
            Stage::Pushed,
            Stage::Tested,
            Stage::Published,
            Stage::Finalized,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(Stage::Tested.can_advance_to(Stage::Failed));
    }

    #[test]
    fn test_no_skipping_or_leaving_finalized() {
        assert!(!Stage::Cloned.can_advance_to(Stage::Tested));
        assert!(!Stage::Pushed.can_advance_to(Stage::Published));
        assert!(!Stage::Failed.can_advance_to(Stage::Published));
        assert!(!Stage::Finalized.can_advance_to(Stage::Finalized));
        assert!(!Stage::Finalized.can_advance_to(Stage::Created));
    }

    #[test]
    fn test_short_circuit_to_finalized() {
        assert!(Stage::Cloned.can_advance_to(Stage::Finalized));
        assert!(Stage::Created.can_advance_to(Stage::Finalized));
    }

    #[test]
    fn test_display() {
        assert_eq!(Stage::EditsApplied.to_string(), "edits_applied");
        assert_eq!(format!("{:<8}|", Stage::Tested), "tested  |");
    }
}
