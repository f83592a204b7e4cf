use crate::config::ConfigError;
use crate::dedup::DedupError;
use crate::partition::PartitionError;
use crate::plan::PlanError;
use crate::producer::ClientError;
use crate::rating::RatingError;
use crate::store::StoreError;
use thiserror::Error;

/// Any failure while processing usage.
#[derive(Error, Debug)]
pub enum UsageError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Rating(#[from] RatingError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dedup(#[from] DedupError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl UsageError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            UsageError::Store(e) => e.is_transient(),
            UsageError::Client(ClientError::SendFailed(_)) => true,
            _ => false,
        }
    }

    /// Whether the failure comes from the plans or engine configuration
    /// rather than from the event or the infrastructure.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            UsageError::Plan(_) | UsageError::Rating(_) | UsageError::Config(_)
        )
    }
}
