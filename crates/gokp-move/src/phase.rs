//! Pivot phases and their persistence seam

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MoveError;

/// Where a pivot stands with respect to which side holds the objects.
///
/// Phases only move forward. Each one is recorded before its side effects
/// begin, so an interrupted run leaves the last phase it entered on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PivotPhase {
    /// Source Cluster is paused; nothing exists on the destination yet
    Paused,
    /// Objects are being created on the destination while the source is paused
    DualExistence,
    /// Destination adopted the cluster; source objects are being deleted
    SourceClearing,
    /// Source holds nothing; the destination is authoritative
    SourceCleared,
}

impl PivotPhase {
    /// Whether the source cluster may already be missing objects
    pub fn source_touched(&self) -> bool {
        *self >= PivotPhase::SourceClearing
    }
}

impl fmt::Display for PivotPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PivotPhase::Paused => "Paused",
            PivotPhase::DualExistence => "DualExistence",
            PivotPhase::SourceClearing => "SourceClearing",
            PivotPhase::SourceCleared => "SourceCleared",
        };
        f.write_str(s)
    }
}

/// Durable record of pivot progress
#[async_trait]
pub trait PhaseRecorder: Send + Sync {
    /// Persist that the pivot has entered `phase`
    async fn record(&self, phase: PivotPhase) -> Result<(), MoveError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_ordered() {
        assert!(PivotPhase::Paused < PivotPhase::DualExistence);
        assert!(PivotPhase::DualExistence < PivotPhase::SourceClearing);
        assert!(PivotPhase::SourceClearing < PivotPhase::SourceCleared);
    }

    #[test]
    fn only_late_phases_touch_the_source() {
        assert!(!PivotPhase::Paused.source_touched());
        assert!(!PivotPhase::DualExistence.source_touched());
        assert!(PivotPhase::SourceClearing.source_touched());
        assert!(PivotPhase::SourceCleared.source_touched());
    }

    #[test]
    fn phase_serializes_as_name() {
        let json = serde_json::to_string(&PivotPhase::DualExistence).unwrap();
        assert_eq!(json, "\"DualExistence\"");
        let back: PivotPhase = serde_json::from_str("\"SourceCleared\"").unwrap();
        assert_eq!(back, PivotPhase::SourceCleared);
    }
}
