//! Request frames sent by the client.

use crate::error::MalformedMessage;

use super::wire::{Reader, Writer, VERSION};
use super::{Block, FileKind, NodeId, OpenMode, ResponseKind, Revision, TransactionId};

/// A request the client can issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Authenticate { token: String },
    QueryChildren { path: String },
    OpenFile { node_id: NodeId, mode: OpenMode },
    CloseFile { node_id: NodeId },
    Read { node_id: NodeId, block: Block },
    CreateFile { parent: String, name: String, kind: FileKind },
    CreateDirectory { parent: String, name: String },
    DeleteElement { node_id: NodeId },
    QuerySystem,
    /// Announces `block.size` bytes to be inserted at `block.offset`
    InsertPreamble { node_id: NodeId, revision: Revision, block: Block },
    DeleteRange { node_id: NodeId, revision: Revision, block: Block },
    /// Announces `block.size` bytes overwriting `block`
    WritePreamble { node_id: NodeId, revision: Revision, block: Block },
    BatchEditPreamble { node_id: NodeId, revision: Revision, count: u64 },
}

impl Request {
    pub fn opcode(&self) -> &'static str {
        match self {
            Request::Authenticate { .. } => "A",
            Request::QueryChildren { .. } => "Q-FS-C",
            Request::OpenFile { .. } => "O",
            Request::CloseFile { .. } => "CLOSE",
            Request::Read { .. } => "R",
            Request::CreateFile { .. } => "CREATE-FILE",
            Request::CreateDirectory { .. } => "CREATE-DIRECTORY",
            Request::DeleteElement { .. } => "DELETE",
            Request::QuerySystem => "Q-SYSTEM",
            Request::InsertPreamble { .. } => "RA-I",
            Request::DeleteRange { .. } => "RA-D",
            Request::WritePreamble { .. } => "RA-W",
            Request::BatchEditPreamble { .. } => "RA-BATCH-EDIT",
        }
    }

    /// Kind of the response this request is answered with.
    pub fn response_kind(&self) -> ResponseKind {
        match self {
            Request::Authenticate { .. }
            | Request::CloseFile { .. }
            | Request::DeleteElement { .. }
            | Request::InsertPreamble { .. }
            | Request::WritePreamble { .. }
            | Request::BatchEditPreamble { .. } => ResponseKind::Ack,
            Request::QueryChildren { .. } => ResponseKind::ListChildren,
            Request::OpenFile { .. } => ResponseKind::OpenFile,
            Request::Read { .. } => ResponseKind::Read,
            Request::CreateFile { .. } => ResponseKind::CreateFile,
            Request::CreateDirectory { .. } => ResponseKind::CreateDirectory,
            Request::QuerySystem => ResponseKind::QuerySystem,
            Request::DeleteRange { .. } => ResponseKind::Edit,
        }
    }

    pub fn encode(&self, transaction_id: TransactionId) -> Vec<u8> {
        let mut w = Writer::new();
        w.version().tag(self.opcode()).transaction_id(transaction_id);

        match self {
            Request::Authenticate { token } => {
                w.raw(b"TOKEN:").string(token.as_bytes()).raw(b";;");
            }
            Request::QueryChildren { path } => {
                w.path_descriptor(path).raw(b";");
            }
            Request::OpenFile { node_id, mode } => {
                w.node_descriptor(*node_id).unsigned(*mode as u64).raw(b";");
            }
            Request::CloseFile { node_id } => {
                w.node_id(*node_id).raw(b";");
            }
            Request::Read { node_id, block } => {
                w.node_id(*node_id).block(*block).raw(b";");
            }
            Request::CreateFile { parent, name, kind } => {
                w.path_descriptor(parent)
                    .string(name.as_bytes())
                    .unsigned(*kind as u64)
                    .raw(b";");
            }
            Request::CreateDirectory { parent, name } => {
                w.path_descriptor(parent).string(name.as_bytes()).raw(b";");
            }
            Request::DeleteElement { node_id } => {
                w.node_descriptor(*node_id).raw(b";");
            }
            Request::QuerySystem => {
                w.raw(b";");
            }
            Request::InsertPreamble { node_id, revision, block }
            | Request::DeleteRange { node_id, revision, block }
            | Request::WritePreamble { node_id, revision, block } => {
                w.node_id(*node_id).unsigned(*revision).block(*block).raw(b";");
            }
            Request::BatchEditPreamble { node_id, revision, count } => {
                w.node_id(*node_id).unsigned(*revision).unsigned(*count).raw(b";");
            }
        }
        w.end().finish()
    }

    /// Decode a request frame.
    pub fn decode(frame: &[u8]) -> Result<(TransactionId, Request), MalformedMessage> {
        let mut r = Reader::new(frame);
        r.expect(VERSION)?;
        let opcode = r.tag()?;
        let transaction_id = r.transaction_id()?;

        let request = match opcode {
            "A" => {
                r.expect(b"TOKEN:")?;
                let token = r.utf8_string()?;
                r.expect(b";;")?;
                Request::Authenticate { token }
            }
            "Q-FS-C" => {
                let path = r.path_descriptor()?;
                r.expect(b";")?;
                Request::QueryChildren { path }
            }
            "O" => {
                let node_id = r.node_descriptor()?;
                let code = r.unsigned()?;
                let mode = OpenMode::from_code(code)
                    .ok_or_else(|| r.error(format!("unknown open mode {code}")))?;
                r.expect(b";")?;
                Request::OpenFile { node_id, mode }
            }
            "CLOSE" => {
                let node_id = r.node_id()?;
                r.expect(b";")?;
                Request::CloseFile { node_id }
            }
            "R" => {
                let node_id = r.node_id()?;
                let block = r.block()?;
                r.expect(b";")?;
                Request::Read { node_id, block }
            }
            "CREATE-FILE" => {
                let parent = r.path_descriptor()?;
                let name = r.utf8_string()?;
                let code = r.unsigned()?;
                let kind = FileKind::from_code(code)
                    .ok_or_else(|| r.error(format!("unknown file type {code}")))?;
                r.expect(b";")?;
                Request::CreateFile { parent, name, kind }
            }
            "CREATE-DIRECTORY" => {
                let parent = r.path_descriptor()?;
                let name = r.utf8_string()?;
                r.expect(b";")?;
                Request::CreateDirectory { parent, name }
            }
            "DELETE" => {
                let node_id = r.node_descriptor()?;
                r.expect(b";")?;
                Request::DeleteElement { node_id }
            }
            "Q-SYSTEM" => {
                r.expect(b";")?;
                Request::QuerySystem
            }
            "RA-I" | "RA-D" | "RA-W" => {
                let node_id = r.node_id()?;
                let revision = r.unsigned()?;
                let block = r.block()?;
                r.expect(b";")?;
                match opcode {
                    "RA-I" => Request::InsertPreamble { node_id, revision, block },
                    "RA-D" => Request::DeleteRange { node_id, revision, block },
                    _ => Request::WritePreamble { node_id, revision, block },
                }
            }
            "RA-BATCH-EDIT" => {
                let node_id = r.node_id()?;
                let revision = r.unsigned()?;
                let count = r.unsigned()?;
                r.expect(b";")?;
                Request::BatchEditPreamble { node_id, revision, count }
            }
            other => return Err(MalformedMessage::new(0, format!("unknown opcode \"{other}\""))),
        };
        r.end()?;
        Ok((transaction_id, request))
    }
}

/// Operation code inside a batch edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum BatchOpKind {
    Delete = 1,
    Insert = 2,
    Write = 3,
}

/// One operation descriptor streamed after a batch preamble.
///
/// ```text
/// U:<op>;BL:U:<offset>;U:<size>;;E:;   followed by <size> bytes for insert/write
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOperation {
    pub kind: BatchOpKind,
    pub block: Block,
}

impl BatchOperation {
    pub fn encode(&self) -> Vec<u8> {
        Writer::new()
            .unsigned(self.kind as u64)
            .block(self.block)
            .end()
            .finish()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, MalformedMessage> {
        let mut r = Reader::new(frame);
        let code = r.unsigned()?;
        let kind = match code {
            1 => BatchOpKind::Delete,
            2 => BatchOpKind::Insert,
            3 => BatchOpKind::Write,
            other => return Err(r.error(format!("unknown batch operation {other}"))),
        };
        let block = r.block()?;
        r.end()?;
        Ok(Self { kind, block })
    }

    /// Whether the descriptor is followed by payload bytes.
    pub fn carries_payload(&self) -> bool {
        !matches!(self.kind, BatchOpKind::Delete)
    }
}
