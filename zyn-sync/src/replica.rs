//! Local mirror of an open document and reconciliation of remote edits.
//!
//! ```text
//! F-INS(off, n)  fetch n bytes at off ──► mirror[..off] ++ fetched ++ mirror[off..]
//! F-MOD(off, n)  fetch n bytes at off ──► mirror[off..off+n] = fetched
//! F-DEL(off, n)  local only           ──► mirror[..off] ++ mirror[off+n..]
//! ```
//!
//! After any splice the mirror takes the notification's revision. A
//! notification that arrives while the mirror holds unsaved edits is a
//! conflict and is never merged automatically.

use crate::error::ClientError;
use crate::protocol::{Block, EditKind, NodeId, Notification, Revision};

fn out_of_sync(what: &str, offset: u64, size: u64, len: usize) -> ClientError {
    ClientError::ReplicaOutOfSync(format!(
        "{what} of {size} bytes at {offset} does not fit a mirror of {len} bytes"
    ))
}

fn checked_index(offset: u64, len: usize) -> Option<usize> {
    usize::try_from(offset).ok().filter(|o| *o <= len)
}

/// `content[..offset] ++ bytes ++ content[offset..]`
pub fn splice_insert(content: &[u8], offset: u64, bytes: &[u8]) -> Result<Vec<u8>, ClientError> {
    let at = checked_index(offset, content.len())
        .ok_or_else(|| out_of_sync("insert", offset, bytes.len() as u64, content.len()))?;
    let mut out = Vec::with_capacity(content.len() + bytes.len());
    out.extend_from_slice(&content[..at]);
    out.extend_from_slice(bytes);
    out.extend_from_slice(&content[at..]);
    Ok(out)
}

/// `content[..offset] ++ content[offset + size..]`
pub fn splice_delete(content: &[u8], offset: u64, size: u64) -> Result<Vec<u8>, ClientError> {
    let (at, end) = offset
        .checked_add(size)
        .and_then(|end| checked_index(end, content.len()))
        .and_then(|end| Some((checked_index(offset, end)?, end)))
        .ok_or_else(|| out_of_sync("delete", offset, size, content.len()))?;
    let mut out = Vec::with_capacity(content.len() - (end - at));
    out.extend_from_slice(&content[..at]);
    out.extend_from_slice(&content[end..]);
    Ok(out)
}

/// Replace `content[offset..offset + bytes.len()]` with `bytes`.
pub fn splice_modify(content: &[u8], offset: u64, bytes: &[u8]) -> Result<Vec<u8>, ClientError> {
    let end = offset
        .checked_add(bytes.len() as u64)
        .and_then(|end| checked_index(end, content.len()))
        .ok_or_else(|| out_of_sync("modify", offset, bytes.len() as u64, content.len()))?;
    let mut out = content.to_vec();
    out[end - bytes.len()..end].copy_from_slice(bytes);
    Ok(out)
}

/// What to do about a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// Not about this mirror, or already reflected in it
    Ignore,
    /// The mirror has unsaved edits; the application must decide
    Conflict { revision: Revision },
    /// Remove bytes locally
    Delete { block: Block, revision: Revision },
    /// Fetch `block` and splice it in with [`Replica::apply_fetched`]
    Fetch { kind: EditKind, block: Block, revision: Revision },
}

/// Byte mirror of one open document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    node_id: NodeId,
    revision: Revision,
    content: Vec<u8>,
    unsaved: bool,
}

impl Replica {
    pub fn new(node_id: NodeId, revision: Revision, content: Vec<u8>) -> Self {
        Self { node_id, revision, content, unsaved: false }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn has_unsaved_edits(&self) -> bool {
        self.unsaved
    }

    pub fn set_unsaved(&mut self, unsaved: bool) {
        self.unsaved = unsaved;
    }

    /// Replace the whole mirror, e.g. after a save or a reload.
    pub fn replace(&mut self, revision: Revision, content: Vec<u8>) {
        self.revision = revision;
        self.content = content;
        self.unsaved = false;
    }

    /// Decide how `notification` affects this mirror.
    pub fn plan(&self, notification: &Notification) -> Reconcile {
        let Notification::Edit { kind, node_id, revision, block } = notification else {
            return Reconcile::Ignore;
        };
        if *node_id != self.node_id || *revision <= self.revision {
            return Reconcile::Ignore;
        }
        if self.unsaved {
            return Reconcile::Conflict { revision: *revision };
        }
        match kind {
            EditKind::Delete => Reconcile::Delete { block: *block, revision: *revision },
            EditKind::Insert | EditKind::Modify => Reconcile::Fetch {
                kind: *kind,
                block: *block,
                revision: *revision,
            },
        }
    }

    pub fn apply_delete(&mut self, block: Block, revision: Revision) -> Result<(), ClientError> {
        self.content = splice_delete(&self.content, block.offset, block.size)?;
        self.revision = revision;
        Ok(())
    }

    /// Splice bytes fetched for an insert or modify notification.
    pub fn apply_fetched(
        &mut self,
        kind: EditKind,
        offset: u64,
        bytes: &[u8],
        revision: Revision,
    ) -> Result<(), ClientError> {
        self.content = match kind {
            EditKind::Insert => splice_insert(&self.content, offset, bytes)?,
            EditKind::Modify => splice_modify(&self.content, offset, bytes)?,
            EditKind::Delete => {
                return Err(ClientError::ReplicaOutOfSync("deletes carry no bytes".to_string()))
            }
        };
        self.revision = revision;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(kind: EditKind, node_id: NodeId, revision: Revision, offset: u64, size: u64) -> Notification {
        Notification::Edit { kind, node_id, revision, block: Block::new(offset, size) }
    }

    #[test]
    fn test_insert_splice() {
        assert_eq!(splice_insert(b"data", 2, b"12").unwrap(), b"da12ta");
        assert_eq!(splice_insert(b"data", 4, b"!").unwrap(), b"data!");
        assert!(splice_insert(b"data", 5, b"!").is_err());
    }

    #[test]
    fn test_delete_splice() {
        assert_eq!(splice_delete(b"data1234", 2, 2).unwrap(), b"da1234");
        assert!(splice_delete(b"data", 3, 2).is_err());
        assert_eq!(splice_delete(b"data", 4, 0).unwrap(), b"data");
        assert!(splice_delete(b"data", u64::MAX, 2).is_err());
    }

    #[test]
    fn test_modify_splice() {
        assert_eq!(splice_modify(b"data", 1, b"12").unwrap(), b"d12a");
        assert!(splice_modify(b"data", 3, b"12").is_err());
    }

    #[test]
    fn test_notification_flow() {
        let mut replica = Replica::new(7, 1, b"data".to_vec());

        let plan = replica.plan(&edit(EditKind::Insert, 7, 2, 2, 2));
        let Reconcile::Fetch { kind, block, revision } = plan else { panic!("{plan:?}") };
        replica.apply_fetched(kind, block.offset, b"12", revision).unwrap();
        assert_eq!(replica.content(), b"da12ta");
        assert_eq!(replica.revision(), 2);

        let plan = replica.plan(&edit(EditKind::Delete, 7, 3, 0, 2));
        let Reconcile::Delete { block, revision } = plan else { panic!("{plan:?}") };
        replica.apply_delete(block, revision).unwrap();
        assert_eq!(replica.content(), b"12ta");
        assert_eq!(replica.revision(), 3);
    }

    #[test]
    fn test_other_node_and_stale_revisions_ignored() {
        let replica = Replica::new(7, 5, b"data".to_vec());
        assert_eq!(replica.plan(&edit(EditKind::Delete, 8, 6, 0, 1)), Reconcile::Ignore);
        assert_eq!(replica.plan(&edit(EditKind::Delete, 7, 5, 0, 1)), Reconcile::Ignore);
        let disconnected = Notification::Disconnected { reason: "bye".into() };
        assert_eq!(replica.plan(&disconnected), Reconcile::Ignore);
    }

    #[test]
    fn test_unsaved_edits_conflict() {
        let mut replica = Replica::new(7, 5, b"data".to_vec());
        replica.set_unsaved(true);
        assert_eq!(
            replica.plan(&edit(EditKind::Modify, 7, 6, 0, 1)),
            Reconcile::Conflict { revision: 6 }
        );
        replica.replace(6, b"fresh".to_vec());
        assert!(!replica.has_unsaved_edits());
    }

    #[test]
    fn test_out_of_range_notification() {
        let mut replica = Replica::new(7, 1, b"data".to_vec());
        let err = replica.apply_delete(Block::new(3, 4), 2).unwrap_err();
        assert!(matches!(err, ClientError::ReplicaOutOfSync(_)));
        // Mirror untouched on failure
        assert_eq!(replica.content(), b"data");
        assert_eq!(replica.revision(), 1);
    }
}
