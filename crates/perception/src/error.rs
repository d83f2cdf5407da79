use compute::ComputeError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PerceptionError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("accelerated result rejected: {0}")]
    ResultCorruption(String),
    #[error(transparent)]
    Compute(#[from] ComputeError),
}

impl PerceptionError {
    /// Errors after which device resources must be rebuilt.
    #[must_use]
    pub fn invalidates_resources(&self) -> bool {
        matches!(self, Self::Compute(err) if err.invalidates_resources())
    }

    /// Errors that end acceleration for the rest of the session.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Compute(ComputeError::PipelineBuild { .. }))
    }
}
