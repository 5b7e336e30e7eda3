//! Error taxonomy for the sync engine.
//!
//! Two families of failure exist and they are handled very differently:
//!
//! ```text
//! ┌────────────────────────────┐      ┌─────────────────────────────┐
//! │ fatal (connection is dead) │      │ recoverable (per request)   │
//! │  Transport                 │      │  Server { code }            │
//! │  ConnectionClosed          │      │  StaleRevision  (code 302)  │
//! │  Malformed                 │      │  TransactionAlreadyInProg.  │
//! │  Protocol                  │      │  UnsavedChanges, ...        │
//! └────────────────────────────┘      └─────────────────────────────┘
//! ```
//!
//! Fatal errors require a new `Connection` and a revision check of any
//! open document. Recoverable errors are returned to the caller of the
//! request that produced them.

use std::fmt;

/// Grammar violation found while decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed message at byte {position}: {reason}")]
pub struct MalformedMessage {
    /// Byte offset into the frame where decoding stopped
    pub position: usize,
    pub reason: String,
}

impl MalformedMessage {
    pub fn new(position: usize, reason: impl Into<String>) -> Self {
        Self {
            position,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the client engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Transport failed to connect, errored or was closed underneath us
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Malformed(#[from] MalformedMessage),

    /// A second request was issued while one is still pending
    #[error("a transaction is already in progress on this connection")]
    TransactionAlreadyInProgress,

    /// Well-formed frame that does not fit the conversation
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server responded with error code {code} ({})", ErrorCode::name_of(*code))]
    Server { code: u64 },

    /// The mutation targeted an outdated revision; reload before retrying
    #[error("revision is too old, document must be reloaded")]
    StaleRevision,

    /// A remote edit does not fit the local mirror
    #[error("replica out of sync: {0}")]
    ReplicaOutOfSync(String),

    #[error("document has unsaved changes")]
    UnsavedChanges,

    #[error("invalid document state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Map a non-zero response code to an error.
    pub fn from_code(code: u64) -> Self {
        if code == ErrorCode::RevisionTooOld.code() {
            ClientError::StaleRevision
        } else {
            ClientError::Server { code }
        }
    }

    /// Whether the connection must be torn down after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_)
                | ClientError::ConnectionClosed
                | ClientError::Malformed(_)
                | ClientError::Protocol(_)
        )
    }

    /// Numeric server code, if this error came from a response.
    pub fn server_code(&self) -> Option<u64> {
        match self {
            ClientError::Server { code } => Some(*code),
            ClientError::StaleRevision => Some(ErrorCode::RevisionTooOld.code()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Catalog of error codes a server may put in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum ErrorCode {
    NoError = 0,
    MalformedMessage = 1,
    InternalCommunicationError = 2,
    FileIsNotOpen = 3,
    FileOpenedInReadMode = 4,
    OperationNotPermittedForFileType = 5,
    BlockSizeIsTooLarge = 6,
    InvalidEdit = 7,
    FailedToReceiveData = 8,
    TooManyFilesOpen = 9,
    InvalidBatchOperation = 10,
    BatchEditOperationNotSequential = 11,
    InvalidBlockSize = 12,

    InvalidUsernamePassword = 100,
    ParentIsNotDirectory = 101,
    UnauthorizedOperation = 102,
    NodeInternalCommunicationError = 103,
    NodeInternalError = 104,
    UnknownFile = 105,
    UnknownAuthority = 106,
    AuthorityError = 107,
    InvalidPageSize = 108,
    FailedToResolveAuthority = 109,
    FailedToAllocateAuthenticationToken = 110,
    FailedToConsumeAuthenticationToken = 111,

    InvalidNodeId = 200,
    DirectoryIsNotEmpty = 201,
    InvalidPathSize = 202,
    InvalidPath = 203,
    HostFilesystemError = 204,
    AllNodesInUse = 205,
    FsParentIsNotDirectory = 206,
    NodeIsNotFile = 207,
    NodeIsNotDirectory = 208,
    ElementWithNameAlreadyExists = 209,

    FileInternalCommunicationError = 300,
    FileInternalError = 301,
    RevisionTooOld = 302,
    OffsetAndSizeDoNotMapToPartOfFile = 303,
    DeleteIsOnlyAllowedForLastPart = 304,
    FileLockedByOtherUser = 305,
    FileNotLocked = 306,
    InvalidOffsets = 307,
}

const ALL_CODES: &[ErrorCode] = &[
    ErrorCode::NoError,
    ErrorCode::MalformedMessage,
    ErrorCode::InternalCommunicationError,
    ErrorCode::FileIsNotOpen,
    ErrorCode::FileOpenedInReadMode,
    ErrorCode::OperationNotPermittedForFileType,
    ErrorCode::BlockSizeIsTooLarge,
    ErrorCode::InvalidEdit,
    ErrorCode::FailedToReceiveData,
    ErrorCode::TooManyFilesOpen,
    ErrorCode::InvalidBatchOperation,
    ErrorCode::BatchEditOperationNotSequential,
    ErrorCode::InvalidBlockSize,
    ErrorCode::InvalidUsernamePassword,
    ErrorCode::ParentIsNotDirectory,
    ErrorCode::UnauthorizedOperation,
    ErrorCode::NodeInternalCommunicationError,
    ErrorCode::NodeInternalError,
    ErrorCode::UnknownFile,
    ErrorCode::UnknownAuthority,
    ErrorCode::AuthorityError,
    ErrorCode::InvalidPageSize,
    ErrorCode::FailedToResolveAuthority,
    ErrorCode::FailedToAllocateAuthenticationToken,
    ErrorCode::FailedToConsumeAuthenticationToken,
    ErrorCode::InvalidNodeId,
    ErrorCode::DirectoryIsNotEmpty,
    ErrorCode::InvalidPathSize,
    ErrorCode::InvalidPath,
    ErrorCode::HostFilesystemError,
    ErrorCode::AllNodesInUse,
    ErrorCode::FsParentIsNotDirectory,
    ErrorCode::NodeIsNotFile,
    ErrorCode::NodeIsNotDirectory,
    ErrorCode::ElementWithNameAlreadyExists,
    ErrorCode::FileInternalCommunicationError,
    ErrorCode::FileInternalError,
    ErrorCode::RevisionTooOld,
    ErrorCode::OffsetAndSizeDoNotMapToPartOfFile,
    ErrorCode::DeleteIsOnlyAllowedForLastPart,
    ErrorCode::FileLockedByOtherUser,
    ErrorCode::FileNotLocked,
    ErrorCode::InvalidOffsets,
];

impl ErrorCode {
    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn from_code(code: u64) -> Option<Self> {
        ALL_CODES.iter().copied().find(|c| c.code() == code)
    }

    /// Human readable name, "Unknown" for codes outside the catalog.
    pub fn name_of(code: u64) -> String {
        match Self::from_code(code) {
            Some(c) => format!("{c:?}"),
            None => "Unknown".to_string(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_revision_mapping() {
        assert_eq!(ClientError::from_code(302), ClientError::StaleRevision);
        assert_eq!(ClientError::from_code(3), ClientError::Server { code: 3 });
        assert_eq!(ClientError::StaleRevision.server_code(), Some(302));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ClientError::ConnectionClosed.is_fatal());
        assert!(ClientError::Malformed(MalformedMessage::new(0, "x")).is_fatal());
        assert!(!ClientError::Server { code: 105 }.is_fatal());
        assert!(!ClientError::TransactionAlreadyInProgress.is_fatal());
    }

    #[test]
    fn test_catalog_lookup() {
        assert_eq!(ErrorCode::from_code(209), Some(ErrorCode::ElementWithNameAlreadyExists));
        assert_eq!(ErrorCode::from_code(9999), None);
        assert_eq!(ErrorCode::name_of(9999), "Unknown");
        for code in ALL_CODES {
            assert_eq!(ErrorCode::from_code(code.code()), Some(*code));
        }
    }

    #[test]
    fn test_server_error_message() {
        let msg = ClientError::Server { code: 105 }.to_string();
        assert_eq!(msg, "server responded with error code 105 (UnknownFile)");
    }
}
