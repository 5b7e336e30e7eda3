//! Client facade: one connection, its events and at most one open document.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect with resync, disconnect)
//! - Authentication that is replayed on reconnect
//! - Routing of server notifications into the open document
//! - Periodic local health check when configured

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionEvent};
use crate::document::{DocumentSession, NotificationOutcome, ResyncOutcome};
use crate::error::{ClientError, Result};
use crate::protocol::{NodeId, Notification, OpenMode, Revision};

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// An edit notification and what it did to the open document
    Document {
        notification: Notification,
        outcome: NotificationOutcome,
    },
    /// The mirror no longer fit a notification and was reloaded
    Reloaded { revision: Revision },
    /// Server announced it is about to close the session
    Disconnected { reason: String },
    Closed { reason: Option<String> },
    Failed(ClientError),
}

pub struct Client {
    config: ClientConfig,
    connection: Connection,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    health_check: Option<JoinHandle<()>>,
    token: Option<String>,
    document: Option<DocumentSession>,
}

impl Client {
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let (connection, events, health_check) = Self::establish(&config).await?;
        Ok(Self {
            config,
            connection,
            events,
            health_check,
            token: None,
            document: None,
        })
    }

    async fn establish(
        config: &ClientConfig,
    ) -> Result<(Connection, mpsc::UnboundedReceiver<ConnectionEvent>, Option<JoinHandle<()>>)> {
        let mut connection = Connection::connect(config).await?;
        let events = connection
            .take_events()
            .ok_or_else(|| ClientError::InvalidState("connection events already taken".to_string()))?;
        let health_check = config
            .health_check_interval()
            .map(|interval| connection.spawn_health_check(interval));
        Ok((connection, events, health_check))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn document(&self) -> Option<&DocumentSession> {
        self.document.as_ref()
    }

    pub async fn authenticate(&mut self, token: &str) -> Result<()> {
        self.connection.authenticate(token).await?;
        self.token = Some(token.to_string());
        Ok(())
    }

    /// Open `node_id`, discarding any previously open document.
    pub async fn open_document(&mut self, node_id: NodeId, mode: OpenMode) -> Result<&DocumentSession> {
        if let Some(mut previous) = self.document.take() {
            previous.revert_edits();
            if previous.is_open() {
                if let Err(e) = previous.close(&self.connection).await {
                    log::warn!("Closing document {} failed: {e}", previous.node_id());
                }
            }
        }
        let mut document = DocumentSession::new(node_id);
        document.open(&self.connection, mode).await?;
        Ok(self.document.insert(document))
    }

    fn open_document_mut(&mut self) -> Result<&mut DocumentSession> {
        self.document
            .as_mut()
            .ok_or_else(|| ClientError::InvalidState("no document is open".to_string()))
    }

    pub async fn enter_edit(&mut self) -> Result<()> {
        let connection = &self.connection;
        let document = self
            .document
            .as_mut()
            .ok_or_else(|| ClientError::InvalidState("no document is open".to_string()))?;
        document.enter_edit(connection).await
    }

    pub fn leave_edit(&mut self) -> Result<()> {
        self.open_document_mut()?.leave_edit()
    }

    pub fn mark_edited(&mut self, content: Vec<u8>) -> Result<()> {
        self.open_document_mut()?.mark_edited(content)
    }

    pub async fn save(&mut self) -> Result<Revision> {
        let connection = &self.connection;
        let document = self
            .document
            .as_mut()
            .ok_or_else(|| ClientError::InvalidState("no document is open".to_string()))?;
        document.save(connection).await
    }

    /// Discard unsaved edits and reload, e.g. after a conflict.
    pub async fn reload_document(&mut self) -> Result<Revision> {
        let connection = &self.connection;
        let document = self
            .document
            .as_mut()
            .ok_or_else(|| ClientError::InvalidState("no document is open".to_string()))?;
        document.reload(connection).await
    }

    pub async fn close_document(&mut self) -> Result<()> {
        match self.document.as_mut() {
            Some(document) => {
                document.close(&self.connection).await?;
                self.document = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Wait for the next event and apply it to the open document.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        let event = self.events.recv().await?;
        Some(self.handle_event(event).await)
    }

    /// Handle every event that has already arrived.
    pub async fn process_events(&mut self) -> Vec<ClientEvent> {
        let mut handled = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            handled.push(self.handle_event(event).await);
        }
        handled
    }

    async fn handle_event(&mut self, event: ConnectionEvent) -> ClientEvent {
        match event {
            ConnectionEvent::Notification(Notification::Disconnected { reason }) => {
                log::info!("Server is closing the session: {reason}");
                ClientEvent::Disconnected { reason }
            }
            ConnectionEvent::Notification(notification) => {
                let Some(document) = self.document.as_mut() else {
                    return ClientEvent::Document { notification, outcome: NotificationOutcome::Ignored };
                };
                match document.handle_notification(&self.connection, &notification).await {
                    Ok(outcome) => ClientEvent::Document { notification, outcome },
                    Err(ClientError::ReplicaOutOfSync(detail)) => {
                        log::warn!("Mirror of document {} out of sync ({detail}), reloading", document.node_id());
                        match document.reload(&self.connection).await {
                            Ok(revision) => ClientEvent::Reloaded { revision },
                            Err(e) => ClientEvent::Failed(e),
                        }
                    }
                    Err(e) => ClientEvent::Failed(e),
                }
            }
            ConnectionEvent::Closed { reason } => ClientEvent::Closed { reason },
            ConnectionEvent::Failed(e) => ClientEvent::Failed(e),
        }
    }

    /// Replace the connection and bring the open document up to date.
    pub async fn reconnect(&mut self) -> Result<Option<ResyncOutcome>> {
        if let Some(health_check) = self.health_check.take() {
            health_check.abort();
        }
        self.connection.close().await;

        let (connection, events, health_check) = Self::establish(&self.config).await?;
        self.connection = connection;
        self.events = events;
        self.health_check = health_check;
        log::info!("Reconnected to {}", self.config.server_url);

        if let Some(token) = self.token.clone() {
            self.connection.authenticate(&token).await?;
        }
        match self.document.as_mut() {
            Some(document) if document.is_open() => Ok(Some(document.resync(&self.connection).await?)),
            _ => Ok(None),
        }
    }

    pub async fn disconnect(&mut self) {
        if let Some(health_check) = self.health_check.take() {
            health_check.abort();
        }
        self.connection.close().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(health_check) = self.health_check.take() {
            health_check.abort();
        }
    }
}
