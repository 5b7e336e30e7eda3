//! Wire codec for the document-storage protocol.
//!
//! Every frame is ASCII tagged text with `;`-terminated fields:
//! ```text
//! request       V:1;<OPCODE>:T:U:<id>;;<fields>E:;
//! response      V:1;RSP:T:U:<id>;;U:<code>;;<body>E:;[payload]
//! notification  V:1;NOTIFICATION:;<TYPE>:<fields>E:;
//! ```
//!
//! Response bodies are not self-describing: decoding needs the
//! [`ResponseKind`] of the request that is waiting for them.

pub mod notification;
pub mod request;
pub mod response;
pub mod wire;

pub use notification::{EditKind, Notification};
pub use request::{BatchOpKind, BatchOperation, Request};
pub use response::{Response, ResponseBody, ResponseKind};

/// Server-side identifier of a file or directory.
pub type NodeId = u64;

/// Per-node content version, advanced by the server on every mutation.
pub type Revision = u64;

/// Client-chosen correlation number for one request/response pair.
pub type TransactionId = u64;

/// Byte range inside a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Block {
    pub offset: u64,
    pub size: u64,
}

impl Block {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Mode requested when opening a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum OpenMode {
    Read = 0,
    Edit = 1,
}

impl OpenMode {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(OpenMode::Read),
            1 => Some(OpenMode::Edit),
            _ => None,
        }
    }
}

/// Storage type of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum FileKind {
    RandomAccess = 0,
    Blob = 1,
}

impl FileKind {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(FileKind::RandomAccess),
            1 => Some(FileKind::Blob),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum AuthorityKind {
    User = 0,
    Group = 1,
}

/// Access-control principal attached to directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub kind: AuthorityKind,
    pub name: String,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsElement {
    File {
        name: String,
        node_id: NodeId,
        revision: Revision,
        kind: FileKind,
        size: u64,
        is_open: bool,
    },
    Directory {
        name: String,
        node_id: NodeId,
        read: Authority,
        write: Authority,
    },
}

impl FsElement {
    pub fn name(&self) -> &str {
        match self {
            FsElement::File { name, .. } | FsElement::Directory { name, .. } => name,
        }
    }

    pub fn node_id(&self) -> NodeId {
        match self {
            FsElement::File { node_id, .. } | FsElement::Directory { node_id, .. } => *node_id,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, FsElement::File { .. })
    }
}

/// Value of a system-info key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemValue {
    Unsigned(u64),
    /// Seconds since the unix epoch
    Timestamp(u64),
}

/// Result of a successful open exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedFile {
    pub node_id: NodeId,
    pub revision: Revision,
    pub size: u64,
    pub page_size: u64,
    pub kind: FileKind,
}
