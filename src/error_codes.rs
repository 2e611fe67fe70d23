//! Structured view over the numeric `error_id` carried by
//! [`MatchFailure`](crate::protocol::MatchFailure).
//!
//! The matcher assigns a couple of ids itself when it cannot talk to the
//! stage service. Every other id is relayed verbatim from the stage service
//! and is opaque to this client.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Id the matcher uses when the stage service answered with something that
/// was not a valid stage response.
pub const INVALID_STAGE_RESPONSE_ID: u64 = 9000;

/// Id the matcher uses when the stage service could not be reached.
pub const STAGE_SERVICE_UNREACHABLE_ID: u64 = 9001;

/// Why a formed match could not be turned into a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchFailureCode {
    /// The stage service replied, but not with a stage response.
    InvalidStageResponse,
    /// The stage service could not be reached at all.
    StageServiceUnreachable,
    /// Error id reported by the stage service itself.
    Stage(u64),
}

impl MatchFailureCode {
    pub fn from_id(id: u64) -> Self {
        match id {
            INVALID_STAGE_RESPONSE_ID => Self::InvalidStageResponse,
            STAGE_SERVICE_UNREACHABLE_ID => Self::StageServiceUnreachable,
            other => Self::Stage(other),
        }
    }

    /// The numeric id as sent on the wire.
    pub fn id(&self) -> u64 {
        match self {
            Self::InvalidStageResponse => INVALID_STAGE_RESPONSE_ID,
            Self::StageServiceUnreachable => STAGE_SERVICE_UNREACHABLE_ID,
            Self::Stage(id) => *id,
        }
    }

    /// Returns `true` when the failure originated in the matcher's link to
    /// the stage service rather than in the stage service's own logic.
    ///
    /// Such failures are usually transient; re-queueing the players is a
    /// reasonable response.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::InvalidStageResponse | Self::StageServiceUnreachable
        )
    }

    /// Returns a human-readable description of this code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::InvalidStageResponse => {
                "The stage service returned a reply the matcher could not understand."
            }
            Self::StageServiceUnreachable => {
                "The matcher could not connect to the stage service."
            }
            Self::Stage(_) => "The stage service rejected the stage request.",
        }
    }
}

impl From<u64> for MatchFailureCode {
    fn from(id: u64) -> Self {
        Self::from_id(id)
    }
}

impl fmt::Display for MatchFailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (id {})", self.description(), self.id())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn known_ids_map_to_named_codes() {
        assert_eq!(
            MatchFailureCode::from_id(9000),
            MatchFailureCode::InvalidStageResponse
        );
        assert_eq!(
            MatchFailureCode::from_id(9001),
            MatchFailureCode::StageServiceUnreachable
        );
        assert_eq!(MatchFailureCode::from_id(17), MatchFailureCode::Stage(17));
    }

    #[test]
    fn id_round_trips() {
        for id in [0, 17, 9000, 9001, u64::MAX] {
            assert_eq!(MatchFailureCode::from(id).id(), id);
        }
    }

    #[test]
    fn infrastructure_classification() {
        assert!(MatchFailureCode::StageServiceUnreachable.is_infrastructure());
        assert!(!MatchFailureCode::Stage(3).is_infrastructure());
    }

    #[test]
    fn display_includes_id() {
        let text = MatchFailureCode::Stage(42).to_string();
        assert!(text.contains("42"));
    }
}
