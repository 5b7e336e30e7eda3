//! Loopback document server speaking the same wire protocol as the client.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── FileTree (RwLock)
//!            ├── Session per socket ─┤
//! Client B ──┘         │            └── NotificationHub ──► other sessions
//!                      │                                   with the node open
//!                      └── buffer ─► Request | payload | batch operation
//! ```
//!
//! Each session keeps:
//! - the files it has open and in which mode
//! - what the next inbound bytes are (request, edit payload, batch step)
//! - whether it has authenticated
//!
//! It exists so the client can be exercised end to end; content lives in
//! memory only.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastStats, NotificationHub};
use crate::config::ServerConfig;
use crate::edit::EditOperation;
use crate::error::{ErrorCode, MalformedMessage};
use crate::filesystem::FileTree;
use crate::protocol::wire::find_end_of_message;
use crate::protocol::{
    BatchOpKind, BatchOperation, Block, EditKind, FileKind, NodeId, Notification, OpenMode,
    OpenedFile, Request, Response, ResponseBody, Revision, SystemValue, TransactionId,
};

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub total_bytes: u64,
    pub notifications_forwarded: u64,
}

struct Shared {
    config: ServerConfig,
    tree: RwLock<FileTree>,
    hub: NotificationHub,
    stats: RwLock<ServerStats>,
    started_at: u64,
    shutdown: watch::Sender<Option<String>>,
}

/// The document server. Clones share the same state.
#[derive(Clone)]
pub struct DocumentServer {
    shared: Arc<Shared>,
}

impl DocumentServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = NotificationHub::new(config.broadcast_capacity);
        let (shutdown, _) = watch::channel(None);
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            shared: Arc::new(Shared {
                config,
                tree: RwLock::new(FileTree::new()),
                hub,
                stats: RwLock::new(ServerStats::default()),
                started_at,
                shutdown,
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    /// Fan-out counters of the notification hub.
    pub async fn broadcast_stats(&self) -> BroadcastStats {
        self.shared.hub.stats().await
    }

    /// Create a file with initial content, e.g. to seed a test.
    pub async fn seed_file(&self, parent: &str, name: &str, content: &[u8]) -> Result<NodeId, ErrorCode> {
        let mut tree = self.shared.tree.write().await;
        let (id, revision) = tree.create_file(parent, name, FileKind::RandomAccess)?;
        if !content.is_empty() {
            tree.apply(id, revision, &EditOperation::Insert { offset: 0, bytes: content.to_vec() })?;
        }
        Ok(id)
    }

    /// Current content and revision of a file.
    pub async fn file_content(&self, id: NodeId) -> Result<(Revision, Vec<u8>), ErrorCode> {
        let tree = self.shared.tree.read().await;
        let file = tree.file(id)?;
        Ok((file.revision, file.content.clone()))
    }

    /// Bind `config.bind_addr` and serve until shutdown.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Document server listening on {}", listener.local_addr()?);
        self.serve(listener).await;
        Ok(())
    }

    /// Bind and serve in the background; returns the bound address.
    pub async fn start(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        log::info!("Document server listening on {addr}");
        let server = self.clone();
        let handle = tokio::spawn(async move { server.serve(listener).await });
        Ok((addr, handle))
    }

    /// Tell every session `reason` and close it; stop accepting.
    pub fn shutdown(&self, reason: impl Into<String>) {
        let _ = self.shared.shutdown.send(Some(reason.into()));
    }

    async fn serve(&self, listener: TcpListener) {
        let mut shutdown = self.shared.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::error!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    log::info!("Document server stopped accepting connections");
                    return;
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<Shared>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let peer_id = Uuid::new_v4();
        let mut fanout_rx = shared.hub.add_peer(peer_id, addr).await;
        let mut shutdown = shared.shutdown.subscribe();
        let mut session = Session::new(peer_id);
        log::info!("WebSocket connection established from {addr} ({peer_id})");

        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let bytes: Vec<u8> = match msg {
                            Some(Ok(Message::Binary(data))) => data.into(),
                            Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => return Err(e.into()),
                        };
                        shared.stats.write().await.total_bytes += bytes.len() as u64;
                        match session.on_bytes(&shared, &bytes).await {
                            Ok(replies) => {
                                for reply in replies {
                                    ws_sender.send(Message::Binary(reply.into())).await?;
                                }
                            }
                            Err(e) => {
                                log::warn!("Malformed request from {addr}: {e}");
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                    fanout = fanout_rx.recv() => {
                        match fanout {
                            Ok(fanout) => {
                                if fanout.origin != peer_id && session.has_open(fanout.node_id) {
                                    ws_sender.send(Message::Binary(fanout.frame.clone().into())).await?;
                                    shared.stats.write().await.notifications_forwarded += 1;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                log::warn!("Session {peer_id} lagged, {skipped} notifications lost");
                                shared.hub.record_dropped(skipped);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = shutdown.changed() => {
                        let reason = shutdown.borrow().clone().unwrap_or_default();
                        let notice = Notification::Disconnected { reason };
                        ws_sender.send(Message::Binary(notice.encode().into())).await?;
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        session.close_all(&shared).await;
        shared.hub.remove_peer(&peer_id).await;
        shared.stats.write().await.active_connections -= 1;
        let hub = shared.hub.stats().await;
        log::info!(
            "Connection from {addr} closed ({} peers left, {} fan-outs sent, {} dropped)",
            hub.active_peers,
            hub.messages_sent,
            hub.messages_dropped
        );
        result
    }
}

/// What the next inbound bytes are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Request,
    /// Raw bytes of a single-step insert or write
    Payload {
        transaction_id: TransactionId,
        node_id: NodeId,
        revision: Revision,
        block: Block,
        overwrite: bool,
    },
    /// `U:<op>;BL..;E:;` descriptor of the next batch operation
    BatchOperation(BatchState),
    /// Raw bytes of the current batch operation
    BatchPayload(BatchState, BatchOperation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BatchState {
    transaction_id: TransactionId,
    node_id: NodeId,
    revision: Revision,
    index: u64,
    count: u64,
}

/// Protocol state of one connection.
struct Session {
    peer_id: Uuid,
    authenticated: bool,
    open: HashMap<NodeId, OpenMode>,
    buffer: Vec<u8>,
    expect: Expect,
}

impl Session {
    fn new(peer_id: Uuid) -> Self {
        Self {
            peer_id,
            authenticated: false,
            open: HashMap::new(),
            buffer: Vec::new(),
            expect: Expect::Request,
        }
    }

    fn has_open(&self, node_id: NodeId) -> bool {
        self.open.contains_key(&node_id)
    }

    fn require_edit(&self, node_id: NodeId) -> Result<(), ErrorCode> {
        match self.open.get(&node_id) {
            None => Err(ErrorCode::FileIsNotOpen),
            Some(OpenMode::Read) => Err(ErrorCode::FileOpenedInReadMode),
            Some(OpenMode::Edit) => Ok(()),
        }
    }

    /// Consume one delivery; returns the frames to send back.
    async fn on_bytes(&mut self, shared: &Shared, bytes: &[u8]) -> Result<Vec<Vec<u8>>, MalformedMessage> {
        self.buffer.extend_from_slice(bytes);
        let mut replies = Vec::new();

        loop {
            match self.expect {
                Expect::Request => {
                    let Some(end) = find_end_of_message(&self.buffer) else { break };
                    let frame: Vec<u8> = self.buffer.drain(..end).collect();
                    let (transaction_id, request) = Request::decode(&frame)?;
                    shared.stats.write().await.total_requests += 1;
                    let reply = self.handle_request(shared, transaction_id, request).await;
                    replies.push(reply.encode());
                }
                Expect::Payload { transaction_id, node_id, revision, block, overwrite } => {
                    let Some(bytes) = self.take(block.size) else { break };
                    self.expect = Expect::Request;
                    let operation = if overwrite {
                        EditOperation::Write { offset: block.offset, bytes }
                    } else {
                        EditOperation::Insert { offset: block.offset, bytes }
                    };
                    let reply = match self.apply(shared, node_id, revision, &operation).await {
                        Ok(revision) => Response::ok(transaction_id, ResponseBody::Edited { revision }),
                        Err(code) => Response::error(transaction_id, code.code()),
                    };
                    replies.push(reply.encode());
                }
                Expect::BatchOperation(batch) => {
                    let Some(end) = find_end_of_message(&self.buffer) else { break };
                    let frame: Vec<u8> = self.buffer.drain(..end).collect();
                    let operation = BatchOperation::decode(&frame)?;
                    if operation.block.size == 0 {
                        replies.push(self.batch_failed(batch, ErrorCode::InvalidBlockSize).encode());
                    } else if operation.carries_payload() {
                        self.expect = Expect::BatchPayload(batch, operation);
                    } else {
                        let edit = EditOperation::Delete { offset: operation.block.offset, size: operation.block.size };
                        replies.push(self.batch_step(shared, batch, &edit).await.encode());
                    }
                }
                Expect::BatchPayload(batch, operation) => {
                    let Some(bytes) = self.take(operation.block.size) else { break };
                    let offset = operation.block.offset;
                    let edit = match operation.kind {
                        BatchOpKind::Write => EditOperation::Write { offset, bytes },
                        _ => EditOperation::Insert { offset, bytes },
                    };
                    replies.push(self.batch_step(shared, batch, &edit).await.encode());
                }
            }
        }
        Ok(replies)
    }

    fn take(&mut self, size: u64) -> Option<Vec<u8>> {
        let size = usize::try_from(size).ok()?;
        (self.buffer.len() >= size).then(|| self.buffer.drain(..size).collect())
    }

    async fn apply(
        &self,
        shared: &Shared,
        node_id: NodeId,
        revision: Revision,
        operation: &EditOperation,
    ) -> Result<Revision, ErrorCode> {
        let revision = shared.tree.write().await.apply(node_id, revision, operation)?;
        let kind = match operation {
            EditOperation::Insert { .. } => EditKind::Insert,
            EditOperation::Write { .. } => EditKind::Modify,
            EditOperation::Delete { .. } => EditKind::Delete,
        };
        let notification = Notification::Edit { kind, node_id, revision, block: operation.block() };
        shared.hub.publish(self.peer_id, &notification);
        Ok(revision)
    }

    async fn batch_step(&mut self, shared: &Shared, batch: BatchState, operation: &EditOperation) -> Response {
        match self.apply(shared, batch.node_id, batch.revision, operation).await {
            Ok(revision) => {
                let next = BatchState { revision, index: batch.index + 1, ..batch };
                self.expect = if next.index < next.count {
                    Expect::BatchOperation(next)
                } else {
                    Expect::Request
                };
                Response::ok(
                    batch.transaction_id,
                    ResponseBody::BatchEdited { operation_index: batch.index, revision },
                )
            }
            Err(code) => self.batch_failed(batch, code),
        }
    }

    /// Abort the batch; the acknowledgement still carries index and revision.
    fn batch_failed(&mut self, batch: BatchState, code: ErrorCode) -> Response {
        self.expect = Expect::Request;
        Response {
            transaction_id: batch.transaction_id,
            error_code: code.code(),
            body: ResponseBody::BatchEdited { operation_index: batch.index, revision: batch.revision },
        }
    }

    async fn handle_request(&mut self, shared: &Shared, tid: TransactionId, request: Request) -> Response {
        let requires_token = shared.config.token.is_some();
        if requires_token && !self.authenticated && !matches!(request, Request::Authenticate { .. }) {
            return Response::error(tid, ErrorCode::UnauthorizedOperation.code());
        }
        match self.dispatch(shared, tid, request).await {
            Ok(body) => Response::ok(tid, body),
            Err(code) => Response::error(tid, code.code()),
        }
    }

    async fn dispatch(&mut self, shared: &Shared, tid: TransactionId, request: Request) -> Result<ResponseBody, ErrorCode> {
        let page_size = shared.config.page_size;
        match request {
            Request::Authenticate { token } => match &shared.config.token {
                Some(expected) if *expected != token => Err(ErrorCode::InvalidUsernamePassword),
                _ => {
                    self.authenticated = true;
                    Ok(ResponseBody::Empty)
                }
            },
            Request::QueryChildren { path } => {
                Ok(ResponseBody::Children(shared.tree.read().await.children(&path)?))
            }
            Request::OpenFile { node_id, mode } => {
                let mut tree = shared.tree.write().await;
                let file = tree.file_mut(node_id)?;
                if !self.open.contains_key(&node_id) {
                    if self.open.len() >= shared.config.max_open_files {
                        return Err(ErrorCode::TooManyFilesOpen);
                    }
                    file.open_count += 1;
                }
                self.open.insert(node_id, mode);
                log::debug!("Session {} opened node {node_id} in {mode:?} mode", self.peer_id);
                Ok(ResponseBody::Opened(OpenedFile {
                    node_id,
                    revision: file.revision,
                    size: file.content.len() as u64,
                    page_size,
                    kind: file.kind,
                }))
            }
            Request::CloseFile { node_id } => {
                if self.open.remove(&node_id).is_none() {
                    return Err(ErrorCode::FileIsNotOpen);
                }
                if let Ok(file) = shared.tree.write().await.file_mut(node_id) {
                    file.open_count = file.open_count.saturating_sub(1);
                }
                Ok(ResponseBody::Empty)
            }
            Request::Read { node_id, block } => {
                if !self.has_open(node_id) {
                    return Err(ErrorCode::FileIsNotOpen);
                }
                if block.size > page_size {
                    return Err(ErrorCode::BlockSizeIsTooLarge);
                }
                let (revision, data) = shared.tree.read().await.read(node_id, block)?;
                Ok(ResponseBody::Read { revision, block, data })
            }
            Request::CreateFile { parent, name, kind } => {
                let (node_id, revision) = shared.tree.write().await.create_file(&parent, &name, kind)?;
                Ok(ResponseBody::FileCreated { node_id, revision })
            }
            Request::CreateDirectory { parent, name } => {
                let node_id = shared.tree.write().await.create_directory(&parent, &name)?;
                Ok(ResponseBody::DirectoryCreated { node_id })
            }
            Request::DeleteElement { node_id } => {
                shared.tree.write().await.delete(node_id)?;
                Ok(ResponseBody::Empty)
            }
            Request::QuerySystem => {
                let (nodes, bytes) = {
                    let tree = shared.tree.read().await;
                    (tree.node_count() as u64, tree.total_bytes())
                };
                let connections = shared.hub.peer_count().await as u64;
                Ok(ResponseBody::System(vec![
                    ("started".to_string(), SystemValue::Timestamp(shared.started_at)),
                    ("nodes".to_string(), SystemValue::Unsigned(nodes)),
                    ("bytes".to_string(), SystemValue::Unsigned(bytes)),
                    ("connections".to_string(), SystemValue::Unsigned(connections)),
                    ("page-size".to_string(), SystemValue::Unsigned(page_size)),
                ]))
            }
            Request::InsertPreamble { node_id, revision, block } | Request::WritePreamble { node_id, revision, block } => {
                let overwrite = matches!(request, Request::WritePreamble { .. });
                self.require_edit(node_id)?;
                if block.size == 0 {
                    return Err(ErrorCode::InvalidBlockSize);
                }
                shared.tree.read().await.check_revision(node_id, revision)?;
                self.expect = Expect::Payload { transaction_id: tid, node_id, revision, block, overwrite };
                Ok(ResponseBody::Empty)
            }
            Request::DeleteRange { node_id, revision, block } => {
                self.require_edit(node_id)?;
                let operation = EditOperation::Delete { offset: block.offset, size: block.size };
                let revision = self.apply(shared, node_id, revision, &operation).await?;
                Ok(ResponseBody::Edited { revision })
            }
            Request::BatchEditPreamble { node_id, revision, count } => {
                self.require_edit(node_id)?;
                shared.tree.read().await.check_revision(node_id, revision)?;
                if count > 0 {
                    self.expect = Expect::BatchOperation(BatchState {
                        transaction_id: tid,
                        node_id,
                        revision,
                        index: 0,
                        count,
                    });
                }
                Ok(ResponseBody::Empty)
            }
        }
    }

    /// Release every file this session still holds.
    async fn close_all(&mut self, shared: &Shared) {
        let mut tree = shared.tree.write().await;
        for (node_id, _) in self.open.drain() {
            if let Ok(file) = tree.file_mut(node_id) {
                file.open_count = file.open_count.saturating_sub(1);
            }
        }
    }
}
