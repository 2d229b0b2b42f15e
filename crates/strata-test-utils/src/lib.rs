//! Mocks and fixtures shared by Strata's test suites.

pub mod executor;
pub mod fixtures;
pub mod vcs;

pub use executor::{ConcurrencyProbe, MockRoleExecutor};
pub use fixtures::*;
pub use vcs::RecordingBranchCreator;

use strata_core::types::{NodeError, NodeErrorKind, RoleResult};

/// Failed result with the given error kind.
pub fn failure(kind: NodeErrorKind, message: &str) -> RoleResult {
    RoleResult::failure(NodeError::new(kind, message))
}

/// Successful result carrying one quality score.
pub fn scored(metric: &str, score: f64) -> RoleResult {
    RoleResult::success().with_score(metric, score)
}
