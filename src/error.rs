use crate::builders::BuildError;
use crate::runner::client;

use std::fmt::{self, Display};

/// Everything that can make a reconcile fail. Every variant is retried by the scheduler, so there's
/// no distinction between fatal and transient errors here. A resource that's gone is not an error
/// at all, and shows up as `Outcome::Deleted` instead.
#[derive(Debug)]
pub enum ReconcileError {
    /// A request to the api server failed. This includes optimistic concurrency conflicts and
    /// admission rejections.
    Api(client::Error),
    /// The application can't be turned into valid child resources until its spec is changed
    Build(BuildError),
}

impl ReconcileError {
    /// true if the api server rejected a write because the `resourceVersion` was stale
    pub fn is_conflict(&self) -> bool {
        match self {
            ReconcileError::Api(err) => err.is_http_status(409),
            _ => false,
        }
    }

    pub fn is_build_error(&self) -> bool {
        matches!(self, ReconcileError::Build(_))
    }
}

impl Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReconcileError::Api(err) => write!(f, "Api Error: {}", err),
            ReconcileError::Build(err) => write!(f, "Invalid application: {}", err),
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconcileError::Api(err) => Some(err),
            ReconcileError::Build(err) => Some(err),
        }
    }
}

impl From<client::Error> for ReconcileError {
    fn from(err: client::Error) -> ReconcileError {
        ReconcileError::Api(err)
    }
}

impl From<BuildError> for ReconcileError {
    fn from(err: BuildError) -> ReconcileError {
        ReconcileError::Build(err)
    }
}
