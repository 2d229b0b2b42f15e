use std::sync::Mutex;

use futures::future::BoxFuture;

use strata_core::error::{Result, StrataError};
use strata_core::traits::BranchCreator;

/// Records every branch request. Optionally fails them all.
#[derive(Default)]
pub struct RecordingBranchCreator {
    created: Mutex<Vec<(String, String)>>,
    fail: bool,
}

impl RecordingBranchCreator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// `(branch, base_ref)` pairs in request order.
    pub fn created(&self) -> Vec<(String, String)> {
        self.created.lock().unwrap().clone()
    }
}

impl BranchCreator for RecordingBranchCreator {
    fn create_branch(&self, name: String, base_ref: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.created.lock().unwrap().push((name.clone(), base_ref));
            if self.fail {
                return Err(StrataError::Branch(format!("refusing to create {}", name)));
            }
            Ok(())
        })
    }
}
