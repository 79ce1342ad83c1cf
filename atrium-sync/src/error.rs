//! Engine-wide error type.
//!
//! | Error                | Handling                                      |
//! |----------------------|-----------------------------------------------|
//! | `RoomUnavailable`    | terminal for the join                         |
//! | `StaleSequence`      | recovered by a full snapshot                  |
//! | `OperationRejected`  | reported to the submitter, not retried        |
//! | `PersistenceFailure` | reported to the submitter, may be retried     |
//! | `TransientDisconnect`| client reconnect loop with backoff            |

use serde::{Deserialize, Serialize};

use crate::protocol::{ProtocolError, Seq};
use crate::storage::StoreError;
use crate::tree::TreeError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum SyncError {
    #[error("room unavailable: {0}")]
    RoomUnavailable(String),
    #[error("sequence {requested} is outside the retained window (horizon {horizon})")]
    StaleSequence { requested: Seq, horizon: Seq },
    #[error("operation rejected: {0}")]
    OperationRejected(String),
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
    #[error("transient disconnect: {0}")]
    TransientDisconnect(String),
}

impl SyncError {
    /// The same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::PersistenceFailure(_) | SyncError::TransientDisconnect(_)
        )
    }

    /// Retrying the same join will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncError::RoomUnavailable(_))
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::ConnectionClosed | ProtocolError::Timeout => {
                SyncError::TransientDisconnect(e.to_string())
            }
            other => SyncError::OperationRejected(other.to_string()),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::PersistenceFailure(e.to_string())
    }
}

impl From<TreeError> for SyncError {
    fn from(e: TreeError) -> Self {
        SyncError::OperationRejected(e.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
