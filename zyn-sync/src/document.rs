//! Lifecycle of one open document.
//!
//! ```text
//! Closed ──open──► Opening ──► Open(Read) ◄──enter_edit / leave_edit──► Open(Edit)
//!    ▲                              │                                       │
//!    └────────────── Closing ◄──────┴────────────── close ──────────────────┘
//! ```
//!
//! Entering edit mode reopens the file server-side unless it is already
//! held in edit mode. Leaving edit mode is local, and refused while there
//! are unsaved edits.

use crate::connection::Connection;
use crate::edit::{diff_operations, EditStrategy};
use crate::error::{ClientError, Result};
use crate::protocol::{NodeId, Notification, OpenMode, OpenedFile, Revision};
use crate::replica::{Reconcile, Replica};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    Closed,
    Opening,
    Open(OpenMode),
    Closing,
}

/// Result of feeding a notification to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    Ignored,
    Applied { revision: Revision },
    /// Remote edit while local edits are unsaved; nothing was merged
    Conflict { revision: Revision },
}

/// Result of replaying the open exchange on a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncOutcome {
    UpToDate,
    Reloaded { revision: Revision },
    /// The server moved on while local edits are unsaved
    Conflict { revision: Revision },
}

/// One document: server-side open state, the mirror and unsaved edits.
#[derive(Debug)]
pub struct DocumentSession {
    node_id: NodeId,
    state: DocumentState,
    /// Mode the server holds the file in, which may be Edit while the
    /// session is back in Open(Read)
    server_mode: Option<OpenMode>,
    opened: Option<OpenedFile>,
    replica: Option<Replica>,
    edited: Option<Vec<u8>>,
}

impl DocumentSession {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: DocumentState::Closed,
            server_mode: None,
            opened: None,
            replica: None,
            edited: None,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, DocumentState::Open(_))
    }

    pub fn opened_file(&self) -> Option<&OpenedFile> {
        self.opened.as_ref()
    }

    pub fn revision(&self) -> Option<Revision> {
        self.replica.as_ref().map(Replica::revision)
    }

    /// Mirror of the server content.
    pub fn content(&self) -> Option<&[u8]> {
        self.replica.as_ref().map(Replica::content)
    }

    /// What the user sees: unsaved edits if any, the mirror otherwise.
    pub fn working_content(&self) -> Option<&[u8]> {
        self.edited.as_deref().or_else(|| self.content())
    }

    pub fn has_unsaved_edits(&self) -> bool {
        self.replica.as_ref().is_some_and(Replica::has_unsaved_edits)
    }

    fn replica_mut(&mut self) -> Result<&mut Replica> {
        self.replica
            .as_mut()
            .ok_or_else(|| ClientError::InvalidState("document has no content".to_string()))
    }

    fn require_open(&self, action: &str) -> Result<OpenMode> {
        match self.state {
            DocumentState::Open(mode) => Ok(mode),
            state => Err(ClientError::InvalidState(format!("cannot {action} a document in state {state:?}"))),
        }
    }

    fn page_size(&self) -> Result<u64> {
        self.opened
            .as_ref()
            .map(|o| o.page_size)
            .ok_or_else(|| ClientError::InvalidState("document was never opened".to_string()))
    }

    /// Open the file and load its full content.
    pub async fn open(&mut self, conn: &Connection, mode: OpenMode) -> Result<()> {
        if self.state != DocumentState::Closed {
            return Err(ClientError::InvalidState(format!("cannot open a document in state {:?}", self.state)));
        }
        self.state = DocumentState::Opening;
        match self.load(conn, mode).await {
            Ok(()) => {
                self.state = DocumentState::Open(mode);
                log::info!("Opened document {} at revision {:?}", self.node_id, self.revision());
                Ok(())
            }
            Err(e) => {
                self.state = DocumentState::Closed;
                Err(e)
            }
        }
    }

    async fn load(&mut self, conn: &Connection, mode: OpenMode) -> Result<()> {
        let opened = conn.open_file(self.node_id, mode).await?;
        self.server_mode = Some(mode);
        let read = conn.read_file(&opened).await?;
        let revision = read.revision.unwrap_or(opened.revision);
        self.replica = Some(Replica::new(self.node_id, revision, read.data));
        self.opened = Some(opened);
        self.edited = None;
        Ok(())
    }

    /// Switch to edit mode, reopening server-side if needed.
    pub async fn enter_edit(&mut self, conn: &Connection) -> Result<()> {
        match self.require_open("edit")? {
            OpenMode::Edit => return Ok(()),
            OpenMode::Read if self.server_mode == Some(OpenMode::Edit) => {
                self.state = DocumentState::Open(OpenMode::Edit);
                return Ok(());
            }
            OpenMode::Read => {}
        }

        self.state = DocumentState::Closing;
        if let Err(e) = conn.close_file(self.node_id).await {
            self.state = DocumentState::Open(OpenMode::Read);
            return Err(e);
        }
        self.server_mode = None;
        self.state = DocumentState::Opening;

        let reopened = async {
            let opened = conn.open_file(self.node_id, OpenMode::Edit).await?;
            let known = self.revision();
            if known != Some(opened.revision) {
                log::debug!(
                    "Document {} moved from {known:?} to {} while reopening",
                    self.node_id,
                    opened.revision
                );
                let read = conn.read_file(&opened).await?;
                Ok::<_, ClientError>((opened, Some(read)))
            } else {
                Ok((opened, None))
            }
        }
        .await;

        match reopened {
            Ok((opened, read)) => {
                if let Some(read) = read {
                    let revision = read.revision.unwrap_or(opened.revision);
                    self.replica = Some(Replica::new(self.node_id, revision, read.data));
                }
                self.opened = Some(opened);
                self.server_mode = Some(OpenMode::Edit);
                self.state = DocumentState::Open(OpenMode::Edit);
                Ok(())
            }
            Err(e) => {
                self.state = DocumentState::Closed;
                Err(e)
            }
        }
    }

    /// Back to read mode; refused with unsaved edits.
    pub fn leave_edit(&mut self) -> Result<()> {
        match self.require_open("leave edit mode of")? {
            OpenMode::Read => Ok(()),
            OpenMode::Edit if self.has_unsaved_edits() => Err(ClientError::UnsavedChanges),
            OpenMode::Edit => {
                self.state = DocumentState::Open(OpenMode::Read);
                Ok(())
            }
        }
    }

    /// Record the user's current content.
    pub fn mark_edited(&mut self, content: Vec<u8>) -> Result<()> {
        if self.require_open("edit")? != OpenMode::Edit {
            return Err(ClientError::InvalidState("document is not in edit mode".to_string()));
        }
        let replica = self.replica_mut()?;
        let dirty = replica.content() != content.as_slice();
        replica.set_unsaved(dirty);
        self.edited = dirty.then_some(content);
        Ok(())
    }

    pub fn revert_edits(&mut self) {
        self.edited = None;
        if let Some(replica) = self.replica.as_mut() {
            replica.set_unsaved(false);
        }
    }

    /// Send unsaved edits and adopt the resulting revision.
    pub async fn save(&mut self, conn: &Connection) -> Result<Revision> {
        self.save_with_progress(conn, |_, _| {}).await
    }

    pub async fn save_with_progress<F>(&mut self, conn: &Connection, on_progress: F) -> Result<Revision>
    where
        F: FnMut(usize, usize),
    {
        if self.require_open("save")? != OpenMode::Edit {
            return Err(ClientError::InvalidState("document is not in edit mode".to_string()));
        }
        let replica = self
            .replica
            .as_ref()
            .ok_or_else(|| ClientError::InvalidState("document has no content".to_string()))?;
        let Some(edited) = self.edited.as_ref() else {
            return Ok(replica.revision());
        };

        let operations = diff_operations(replica.content(), edited);
        let revision = conn
            .apply_modifications_with(self.node_id, replica.revision(), operations, EditStrategy::Auto, on_progress)
            .await?;

        let content = self.edited.take().unwrap_or_default();
        self.replica_mut()?.replace(revision, content);
        log::info!("Saved document {} at revision {revision}", self.node_id);
        Ok(revision)
    }

    /// Close server-side. Refused with unsaved edits.
    pub async fn close(&mut self, conn: &Connection) -> Result<()> {
        self.require_open("close")?;
        if self.has_unsaved_edits() {
            return Err(ClientError::UnsavedChanges);
        }
        self.state = DocumentState::Closing;
        let result = conn.close_file(self.node_id).await;
        self.state = DocumentState::Closed;
        self.server_mode = None;
        self.opened = None;
        self.replica = None;
        self.edited = None;
        result
    }

    /// Reconcile the mirror with a remote edit.
    pub async fn handle_notification(
        &mut self,
        conn: &Connection,
        notification: &Notification,
    ) -> Result<NotificationOutcome> {
        if !self.is_open() {
            return Ok(NotificationOutcome::Ignored);
        }
        let page_size = self.page_size()?;
        let plan = self.replica_mut()?.plan(notification);
        log::debug!("Document {}: {plan:?}", self.node_id);

        match plan {
            Reconcile::Ignore => Ok(NotificationOutcome::Ignored),
            Reconcile::Conflict { revision } => {
                log::warn!(
                    "Document {} changed remotely (revision {revision}) while edits are unsaved",
                    self.node_id
                );
                Ok(NotificationOutcome::Conflict { revision })
            }
            Reconcile::Delete { block, revision } => {
                self.replica_mut()?.apply_delete(block, revision)?;
                Ok(NotificationOutcome::Applied { revision })
            }
            Reconcile::Fetch { kind, block, revision } => {
                let fetched = conn.read_range(self.node_id, block.offset, block.size, page_size).await?;
                self.replica_mut()?
                    .apply_fetched(kind, block.offset, &fetched.data, revision)?;
                Ok(NotificationOutcome::Applied { revision })
            }
        }
    }

    /// Replay the open exchange on `conn` after a reconnect.
    pub async fn resync(&mut self, conn: &Connection) -> Result<ResyncOutcome> {
        self.require_open("resync")?;
        let mode = self.server_mode.unwrap_or(OpenMode::Read);
        let opened = conn.open_file(self.node_id, mode).await?;
        let known = self.revision();
        self.opened = Some(opened);

        if known == Some(opened.revision) {
            return Ok(ResyncOutcome::UpToDate);
        }
        if self.has_unsaved_edits() {
            log::warn!(
                "Document {} is at revision {} on the server, local edits are based on {known:?}",
                self.node_id,
                opened.revision
            );
            return Ok(ResyncOutcome::Conflict { revision: opened.revision });
        }
        let read = conn.read_file(&opened).await?;
        let revision = read.revision.unwrap_or(opened.revision);
        self.replica_mut()?.replace(revision, read.data);
        log::info!("Reloaded document {} at revision {revision}", self.node_id);
        Ok(ResyncOutcome::Reloaded { revision })
    }

    /// Discard unsaved edits and reload from the server.
    pub async fn reload(&mut self, conn: &Connection) -> Result<Revision> {
        self.require_open("reload")?;
        // Opening again reports the current size and revision
        let mode = self.server_mode.unwrap_or(OpenMode::Read);
        let opened = conn.open_file(self.node_id, mode).await?;
        let read = conn.read_file(&opened).await?;
        let revision = read.revision.unwrap_or(opened.revision);
        self.revert_edits();
        self.replica_mut()?.replace(revision, read.data);
        self.opened = Some(opened);
        Ok(revision)
    }
}
