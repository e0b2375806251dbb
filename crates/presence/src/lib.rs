pub mod roster;
pub mod summary;

pub use roster::{nick_for, roster_segment};
pub use summary::{PresenceSummary, presence_degree, presence_summary};

use perch_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("unrecognised presence show value {show:?}")]
    InvalidShowValue { show: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<PresenceError> for perch_core::PerchError {
    fn from(error: PresenceError) -> Self {
        perch_core::PerchError::Presence(error.to_string())
    }
}
