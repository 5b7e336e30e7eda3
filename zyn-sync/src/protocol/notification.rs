//! Server push frames. They carry no transaction id and may arrive at any
//! time, including while a request is pending.

use crate::error::MalformedMessage;

use super::wire::{Reader, Writer, VERSION};
use super::{Block, NodeId, Revision};

const PREFIX: &[u8] = b"V:1;NOTIFICATION:;";

/// Kind of remote edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditKind {
    Insert,
    Modify,
    Delete,
}

impl EditKind {
    fn tag(self) -> &'static str {
        match self {
            EditKind::Insert => "F-INS",
            EditKind::Modify => "F-MOD",
            EditKind::Delete => "F-DEL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// An edit already committed by another client
    Edit {
        kind: EditKind,
        node_id: NodeId,
        revision: Revision,
        block: Block,
    },
    /// The server is closing the session
    Disconnected { reason: String },
}

impl Notification {
    /// Whether `frame` is a notification rather than a response.
    pub fn is_notification(frame: &[u8]) -> bool {
        frame.starts_with(PREFIX)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.raw(PREFIX);
        match self {
            Notification::Edit { kind, node_id, revision, block } => {
                w.tag(kind.tag()).node_id(*node_id).unsigned(*revision).block(*block);
            }
            Notification::Disconnected { reason } => {
                w.tag("DISCONNECTED").string(reason.as_bytes());
            }
        }
        w.end().finish()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, MalformedMessage> {
        let mut r = Reader::new(frame);
        r.expect(VERSION)?;
        r.expect(b"NOTIFICATION:;")?;
        let tag_start = r.position();
        let kind = match r.tag()? {
            "F-INS" => EditKind::Insert,
            "F-MOD" => EditKind::Modify,
            "F-DEL" => EditKind::Delete,
            "DISCONNECTED" => {
                let reason = String::from_utf8_lossy(&r.string()?).into_owned();
                r.end()?;
                return Ok(Notification::Disconnected { reason });
            }
            other => {
                return Err(MalformedMessage::new(
                    tag_start,
                    format!("unknown notification \"{other}\""),
                ))
            }
        };
        let node_id = r.node_id()?;
        let revision = r.unsigned()?;
        let block = r.block()?;
        r.end()?;
        Ok(Notification::Edit { kind, node_id, revision, block })
    }
}
