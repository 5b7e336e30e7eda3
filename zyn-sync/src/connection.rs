//! A live session with the document server.
//!
//! ```text
//!  caller ──► Connection::open_file ──► Correlator::begin ──► outbound
//!                    ▲                                            │
//!                    │ oneshot                                    ▼
//!              Correlator::complete ◄── Framer ◄── dispatch task ◄── inbound
//!                                                      │
//!                                                      └──► events (notifications, closure)
//! ```
//!
//! At most one exchange runs at a time. Multi-step exchanges (paged reads,
//! edit transactions) hold the connection for their whole duration, and a
//! call made meanwhile fails with `TransactionAlreadyInProgress`.
//!
//! Transport and decode failures are fatal: the pending request fails, the
//! transport is closed and a `ConnectionEvent::Failed` is emitted. A new
//! `Connection` must be created afterwards.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::correlator::Correlator;
use crate::edit::{EditOperation, EditStep, EditStrategy, EditTransaction};
use crate::error::{ClientError, Result};
use crate::framer::Framer;
use crate::protocol::{
    FileKind, FsElement, NodeId, Notification, OpenMode, OpenedFile, Request, Response,
    ResponseBody, ResponseKind, Revision, SystemValue,
};
use crate::reader::{PagedRead, ReadResult};
use crate::transport::{Outbound, Transport, TransportEvent};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Closed by either side
    Closed,
    /// Torn down after a transport or decode error
    Failed,
}

/// Events emitted outside of request/response traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Notification(Notification),
    /// Transport closed; `reason` comes from a preceding DISCONNECTED notification
    Closed { reason: Option<String> },
    Failed(ClientError),
}

struct Core {
    framer: Framer,
    correlator: Correlator,
    state: ConnectionState,
    disconnect_reason: Option<String>,
    /// A `Closed` event has gone out already
    closed_reported: bool,
}

impl Core {
    fn ensure_connected(&self) -> Result<()> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            _ => Err(ClientError::ConnectionClosed),
        }
    }
}

/// Handle to one session.
pub struct Connection {
    outbound: mpsc::Sender<Outbound>,
    core: Arc<Mutex<Core>>,
    /// Held for the duration of one exchange, including multi-step ones
    busy: Arc<Mutex<()>>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
}

impl Connection {
    /// Connect to `config.server_url`.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = Transport::connect(&config.server_url, config.outbound_capacity).await?;
        Ok(Self::new(transport, config.max_header_bytes))
    }

    /// Run a session over an already open transport.
    pub fn new(transport: Transport, max_header_bytes: usize) -> Self {
        let Transport { outbound, inbound } = transport;
        let core = Arc::new(Mutex::new(Core {
            framer: Framer::new(max_header_bytes),
            correlator: Correlator::new(),
            state: ConnectionState::Connected,
            disconnect_reason: None,
            closed_reported: false,
        }));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(dispatch(inbound, core.clone(), event_tx.clone(), outbound.clone()));

        Self {
            outbound,
            core,
            busy: Arc::new(Mutex::new(())),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.event_rx.take()
    }

    pub async fn state(&self) -> ConnectionState {
        self.core.lock().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Close the transport. Pending work fails with `ConnectionClosed`.
    pub async fn close(&self) {
        {
            let mut core = self.core.lock().await;
            if core.state == ConnectionState::Connected {
                core.state = ConnectionState::Closed;
            }
            core.correlator.fail(ClientError::ConnectionClosed);
        }
        let _ = self.outbound.send(Outbound::Close).await;
    }

    fn begin_exchange(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        self.busy
            .try_lock()
            .map_err(|_| ClientError::TransactionAlreadyInProgress)
    }

    async fn send_frames(&self, frames: Vec<Vec<u8>>) -> Result<()> {
        for frame in frames {
            if self.outbound.send(Outbound::Frame(frame)).await.is_err() {
                mark_lost(&mut *self.core.lock().await, &self.event_tx);
                return Err(ClientError::ConnectionClosed);
            }
        }
        Ok(())
    }

    /// Tear the session down if `error` leaves the stream out of step
    /// with the server, then hand the error back.
    async fn escalate(&self, error: ClientError) -> ClientError {
        if error.is_fatal() {
            let mut core = self.core.lock().await;
            if core.state == ConnectionState::Connected {
                fail(&mut core, &self.event_tx, &self.outbound, error.clone());
            }
        }
        error
    }

    async fn await_response(
        rx: oneshot::Receiver<std::result::Result<Response, ClientError>>,
    ) -> Result<Response> {
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Send `request` as a new transaction and wait for its response.
    async fn exchange(&self, request: Request) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        let bytes = {
            let mut core = self.core.lock().await;
            core.ensure_connected()?;
            core.correlator.begin(&request, tx)?
        };
        self.send_frames(vec![bytes]).await?;
        Self::await_response(rx).await
    }

    /// Send raw frames under the current transaction and wait for `kind`.
    async fn continue_exchange(&self, frames: Vec<Vec<u8>>, kind: ResponseKind) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        {
            let mut core = self.core.lock().await;
            core.ensure_connected()?;
            core.correlator.resume(kind, tx)?;
        }
        self.send_frames(frames).await?;
        Self::await_response(rx).await
    }

    /// One request/response exchange. The response is returned as is,
    /// including a non-zero error code.
    pub async fn transact(&self, request: Request) -> Result<Response> {
        let _guard = self.begin_exchange()?;
        self.exchange(request).await
    }

    pub async fn authenticate(&self, token: &str) -> Result<()> {
        self.transact(Request::Authenticate { token: token.to_string() })
            .await?
            .into_result()?;
        log::info!("Authenticated");
        Ok(())
    }

    pub async fn query_element_children(&self, path: &str) -> Result<Vec<FsElement>> {
        let rsp = self
            .transact(Request::QueryChildren { path: path.to_string() })
            .await?
            .into_result()?;
        match rsp.body {
            ResponseBody::Children(elements) => Ok(elements),
            other => Err(self.escalate(unexpected_body("list children", &other)).await),
        }
    }

    pub async fn open_file(&self, node_id: NodeId, mode: OpenMode) -> Result<OpenedFile> {
        let rsp = self
            .transact(Request::OpenFile { node_id, mode })
            .await?
            .into_result()?;
        match rsp.body {
            ResponseBody::Opened(opened) => {
                log::debug!(
                    "Opened node {node_id} in {mode:?} mode at revision {}",
                    opened.revision
                );
                Ok(opened)
            }
            other => Err(self.escalate(unexpected_body("open", &other)).await),
        }
    }

    pub async fn close_file(&self, node_id: NodeId) -> Result<()> {
        self.transact(Request::CloseFile { node_id }).await?.into_result()?;
        Ok(())
    }

    /// Read `[offset, offset + size)` in page-bounded blocks.
    pub async fn read_range(
        &self,
        node_id: NodeId,
        offset: u64,
        size: u64,
        page_size: u64,
    ) -> Result<ReadResult> {
        let _guard = self.begin_exchange()?;
        let mut read = PagedRead::new(node_id, offset, size, page_size)?;
        while let Some(request) = read.next_request() {
            let rsp = self.exchange(request).await?;
            if let Err(e) = read.accept(rsp) {
                return Err(self.escalate(e).await);
            }
        }
        Ok(read.finish())
    }

    /// Read the whole content of an open file.
    pub async fn read_file(&self, opened: &OpenedFile) -> Result<ReadResult> {
        let mut result = self
            .read_range(opened.node_id, 0, opened.size, opened.page_size)
            .await?;
        result.revision.get_or_insert(opened.revision);
        Ok(result)
    }

    /// Create a file under `parent`, returning its node id and revision.
    pub async fn create_file(&self, parent: &str, name: &str, kind: FileKind) -> Result<(NodeId, Revision)> {
        let rsp = self
            .transact(Request::CreateFile {
                parent: parent.to_string(),
                name: name.to_string(),
                kind,
            })
            .await?
            .into_result()?;
        match rsp.body {
            ResponseBody::FileCreated { node_id, revision } => Ok((node_id, revision)),
            other => Err(self.escalate(unexpected_body("create file", &other)).await),
        }
    }

    pub async fn create_directory(&self, parent: &str, name: &str) -> Result<NodeId> {
        let rsp = self
            .transact(Request::CreateDirectory {
                parent: parent.to_string(),
                name: name.to_string(),
            })
            .await?
            .into_result()?;
        match rsp.body {
            ResponseBody::DirectoryCreated { node_id } => Ok(node_id),
            other => Err(self.escalate(unexpected_body("create directory", &other)).await),
        }
    }

    pub async fn delete_element(&self, node_id: NodeId) -> Result<()> {
        self.transact(Request::DeleteElement { node_id }).await?.into_result()?;
        Ok(())
    }

    pub async fn query_system(&self) -> Result<Vec<(String, SystemValue)>> {
        let rsp = self.transact(Request::QuerySystem).await?.into_result()?;
        match rsp.body {
            ResponseBody::System(pairs) => Ok(pairs),
            other => Err(self.escalate(unexpected_body("query system", &other)).await),
        }
    }

    /// Apply `operations` starting at `revision`; batched for more than one
    /// operation. Returns the revision after the last operation.
    pub async fn apply_modifications(
        &self,
        node_id: NodeId,
        revision: Revision,
        operations: Vec<EditOperation>,
    ) -> Result<Revision> {
        self.apply_modifications_with(node_id, revision, operations, EditStrategy::Auto, |_, _| {})
            .await
    }

    /// Like [`Connection::apply_modifications`] with an explicit strategy
    /// and a `(completed, total)` progress callback.
    pub async fn apply_modifications_with<F>(
        &self,
        node_id: NodeId,
        revision: Revision,
        operations: Vec<EditOperation>,
        strategy: EditStrategy,
        mut on_progress: F,
    ) -> Result<Revision>
    where
        F: FnMut(usize, usize),
    {
        let _guard = self.begin_exchange()?;
        let mut transaction = EditTransaction::new(node_id, revision, operations, strategy)?;
        log::debug!(
            "Applying {} operations to node {node_id} at revision {revision} (batched: {})",
            transaction.progress().1,
            transaction.is_batched()
        );

        let mut step = transaction.start()?;
        loop {
            let rsp = match step {
                EditStep::Finished(revision) => return Ok(revision),
                EditStep::Send(request) => self.exchange(request).await?,
                EditStep::Continue { frames, expect } => self.continue_exchange(frames, expect).await?,
            };
            let before = transaction.progress().0;
            step = match transaction.on_response(rsp) {
                Ok(step) => step,
                // Mid-batch the server still expects operations; only a
                // fresh connection gets the stream back in step
                Err(e) => return Err(self.escalate(e).await),
            };
            let (completed, total) = transaction.progress();
            if completed > before {
                on_progress(completed, total);
            }
        }
    }

    /// Local liveness check: the session is up and its writer task still
    /// accepts frames. Nothing is sent to the server.
    pub async fn check_health(&self) -> Result<()> {
        check_transport(&self.core, &self.outbound, &self.event_tx).await
    }

    /// Run [`Connection::check_health`] every `interval` until it fails.
    pub fn spawn_health_check(&self, interval: Duration) -> JoinHandle<()> {
        let outbound = self.outbound.clone();
        let core = self.core.clone();
        let events = self.event_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = check_transport(&core, &outbound, &events).await {
                    log::warn!("Health check failed: {e}");
                    break;
                }
            }
        })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.outbound.try_send(Outbound::Close);
    }
}

fn unexpected_body(what: &str, body: &ResponseBody) -> ClientError {
    ClientError::Protocol(format!("unexpected {what} response body {body:?}"))
}

/// Route inbound deliveries: responses to the correlator, notifications to
/// the event channel.
async fn dispatch(
    mut inbound: mpsc::Receiver<TransportEvent>,
    core: Arc<Mutex<Core>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    outbound: mpsc::Sender<Outbound>,
) {
    while let Some(event) = inbound.recv().await {
        let mut core = core.lock().await;
        if core.state == ConnectionState::Failed {
            return;
        }
        match event {
            TransportEvent::Message(bytes) => {
                core.framer.push(&bytes);
                if let Err(e) = drain_frames(&mut core, &events) {
                    fail(&mut core, &events, &outbound, e);
                    return;
                }
            }
            TransportEvent::Error(e) => {
                fail(&mut core, &events, &outbound, ClientError::Transport(e));
                return;
            }
            TransportEvent::Closed => break,
        }
    }

    let mut core = core.lock().await;
    if core.state != ConnectionState::Failed && !core.closed_reported {
        core.state = ConnectionState::Closed;
        core.correlator.fail(ClientError::ConnectionClosed);
        let reason = core.disconnect_reason.take();
        log::info!("Connection closed ({})", reason.as_deref().unwrap_or("no reason given"));
        let _ = events.send(ConnectionEvent::Closed { reason });
    }
}

async fn check_transport(
    core: &Mutex<Core>,
    outbound: &mpsc::Sender<Outbound>,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) -> Result<()> {
    let mut core = core.lock().await;
    core.ensure_connected()?;
    if outbound.is_closed() {
        mark_lost(&mut core, events);
        return Err(ClientError::ConnectionClosed);
    }
    Ok(())
}

/// The transport went away underneath a connected session.
fn mark_lost(core: &mut Core, events: &mpsc::UnboundedSender<ConnectionEvent>) {
    core.correlator.fail(ClientError::ConnectionClosed);
    if core.state == ConnectionState::Connected {
        log::warn!("Transport is gone");
        core.state = ConnectionState::Closed;
        core.closed_reported = true;
        let _ = events.send(ConnectionEvent::Closed { reason: core.disconnect_reason.take() });
    }
}

fn drain_frames(core: &mut Core, events: &mpsc::UnboundedSender<ConnectionEvent>) -> Result<()> {
    loop {
        let expecting = core.correlator.expecting();
        let Some(frame) = core.framer.next_frame(expecting)? else {
            return Ok(());
        };
        if frame.is_notification() {
            let notification = Notification::decode(&frame.header)?;
            log::debug!("Notification: {notification:?}");
            if let Notification::Disconnected { reason } = &notification {
                core.disconnect_reason = Some(reason.clone());
            }
            let _ = events.send(ConnectionEvent::Notification(notification));
        } else {
            core.correlator.complete(frame)?;
        }
    }
}

fn fail(
    core: &mut Core,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
    outbound: &mpsc::Sender<Outbound>,
    error: ClientError,
) {
    log::error!("Connection failed: {error}");
    core.state = ConnectionState::Failed;
    core.correlator.fail(error.clone());
    core.framer.reset();
    let _ = outbound.try_send(Outbound::Close);
    let _ = events.send(ConnectionEvent::Failed(error));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Block, EditKind};
    use crate::transport::MemoryPeer;

    fn connection() -> (Connection, MemoryPeer) {
        let (transport, peer) = Transport::memory(16);
        (Connection::new(transport, 4096), peer)
    }

    #[tokio::test]
    async fn test_authenticate_exchange() {
        let (conn, mut peer) = connection();
        let (result, _) = tokio::join!(conn.authenticate("secret"), async {
            let frame = peer.next_frame().await.unwrap();
            assert_eq!(frame, b"V:1;A:T:U:1;;TOKEN:S:U:6;B:secret;;;;E:;");
            peer.send(&b"V:1;RSP:T:U:1;;U:0;;E:;"[..]).await;
        });
        result.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_keeps_connection_healthy() {
        let (conn, mut peer) = connection();
        let (result, _) = tokio::join!(conn.open_file(5, OpenMode::Read), async {
            peer.next_frame().await.unwrap();
            peer.send(&b"V:1;RSP:T:U:1;;U:105;;E:;"[..]).await;
        });
        assert_eq!(result.unwrap_err(), ClientError::Server { code: 105 });
        assert!(conn.is_connected().await);
    }

    #[tokio::test]
    async fn test_paged_read_with_split_payload_and_notification() {
        let (mut conn, mut peer) = connection();
        let mut events = conn.take_events().unwrap();
        let (result, _) = tokio::join!(conn.read_range(3, 0, 12, 8), async {
            let frame = peer.next_frame().await.unwrap();
            assert!(frame.ends_with(b"BL:U:0;U:8;;;E:;"));
            peer.send(&b"V:1;NOTIFICATION:;F-DEL:N:U:9;;U:4;BL:U:0;U:1;;E:;"[..]).await;
            peer.send(&b"V:1;RSP:T:U:1;;U:0;;U:2;BL:U:0;U:8;;E:;abcE"[..]).await;
            peer.send(&b":;fg"[..]).await;

            let frame = peer.next_frame().await.unwrap();
            assert!(frame.ends_with(b"BL:U:8;U:4;;;E:;"));
            peer.send(&b"V:1;RSP:T:U:2;;U:0;;U:3;BL:U:8;U:4;;E:;ijkl"[..]).await;
        });
        let result = result.unwrap();
        assert_eq!(result.data, b"abcE:;fgijkl");
        assert_eq!(result.revision, Some(3));

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            ConnectionEvent::Notification(Notification::Edit {
                kind: EditKind::Delete,
                node_id: 9,
                revision: 4,
                block: Block::new(0, 1),
            })
        );
    }

    #[tokio::test]
    async fn test_concurrent_request_rejected() {
        let (conn, mut peer) = connection();
        let first = conn.query_system();
        let second = async {
            tokio::task::yield_now().await;
            conn.close_file(1).await
        };
        let (first, second, _) = tokio::join!(first, second, async {
            peer.next_frame().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            peer.send(&b"V:1;RSP:T:U:1;;U:0;;L:U:0;;E:;"[..]).await;
        });
        assert!(first.unwrap().is_empty());
        assert_eq!(second.unwrap_err(), ClientError::TransactionAlreadyInProgress);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_fatal() {
        let (mut conn, mut peer) = connection();
        let mut events = conn.take_events().unwrap();
        let (result, _) = tokio::join!(conn.close_file(1), async {
            peer.next_frame().await.unwrap();
            peer.send(&b"V:1;RSP:T:U:1;;U:zero;;E:;"[..]).await;
        });
        assert!(matches!(result, Err(ClientError::Malformed(_))));
        assert!(matches!(events.recv().await, Some(ConnectionEvent::Failed(_))));
        assert_eq!(conn.state().await, ConnectionState::Failed);
        // The transport is told to close
        assert_eq!(peer.received.recv().await, Some(Outbound::Close));
        assert_eq!(conn.close_file(1).await.unwrap_err(), ClientError::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_closed_transport_fails_pending_request() {
        let (mut conn, mut peer) = connection();
        let mut events = conn.take_events().unwrap();
        let (result, _) = tokio::join!(conn.query_system(), async {
            peer.next_frame().await.unwrap();
            peer.send(&b"V:1;NOTIFICATION:;DISCONNECTED:S:U:8;B:shutdown;;E:;"[..]).await;
            peer.close().await;
        });
        assert_eq!(result.unwrap_err(), ClientError::ConnectionClosed);
        assert!(matches!(events.recv().await, Some(ConnectionEvent::Notification(_))));
        assert_eq!(
            events.recv().await,
            Some(ConnectionEvent::Closed { reason: Some("shutdown".to_string()) })
        );
    }

    #[tokio::test]
    async fn test_batched_modifications_with_progress() {
        let (conn, mut peer) = connection();
        let ops = vec![
            EditOperation::Delete { offset: 0, size: 1 },
            EditOperation::Insert { offset: 0, bytes: b"xy".to_vec() },
        ];
        let mut progress = Vec::new();
        let (result, _) = tokio::join!(
            conn.apply_modifications_with(4, 10, ops, EditStrategy::Auto, |n, total| progress.push((n, total))),
            async {
                let frame = peer.next_frame().await.unwrap();
                assert_eq!(frame, b"V:1;RA-BATCH-EDIT:T:U:1;;N:U:4;;U:10;U:2;;E:;");
                peer.send(&b"V:1;RSP:T:U:1;;U:0;;E:;"[..]).await;

                assert_eq!(peer.next_frame().await.unwrap(), b"U:1;BL:U:0;U:1;;E:;");
                peer.send(&b"V:1;RSP-BATCH:T:U:1;;U:0;;U:0;U:11;E:;"[..]).await;

                assert_eq!(peer.next_frame().await.unwrap(), b"U:2;BL:U:0;U:2;;E:;");
                assert_eq!(peer.next_frame().await.unwrap(), b"xy");
                peer.send(&b"V:1;RSP-BATCH:T:U:1;;U:0;;U:1;U:12;E:;"[..]).await;
            }
        );
        assert_eq!(result.unwrap(), 12);
        assert_eq!(progress, vec![(1, 2), (2, 2)]);
    }

    #[tokio::test]
    async fn test_single_insert_streams_payload() {
        let (conn, mut peer) = connection();
        let ops = vec![EditOperation::Insert { offset: 2, bytes: b"12".to_vec() }];
        let (result, _) = tokio::join!(conn.apply_modifications(4, 1, ops), async {
            let frame = peer.next_frame().await.unwrap();
            assert_eq!(frame, b"V:1;RA-I:T:U:1;;N:U:4;;U:1;BL:U:2;U:2;;;E:;");
            peer.send(&b"V:1;RSP:T:U:1;;U:0;;E:;"[..]).await;
            assert_eq!(peer.next_frame().await.unwrap(), b"12");
            peer.send(&b"V:1;RSP:T:U:1;;U:0;;U:2;E:;"[..]).await;
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_bad_batch_acknowledgement_tears_down() {
        let (mut conn, mut peer) = connection();
        let mut events = conn.take_events().unwrap();
        let ops = vec![
            EditOperation::Delete { offset: 0, size: 1 },
            EditOperation::Delete { offset: 0, size: 1 },
        ];
        let (result, _) = tokio::join!(conn.apply_modifications(4, 10, ops), async {
            peer.next_frame().await.unwrap();
            peer.send(&b"V:1;RSP:T:U:1;;U:0;;E:;"[..]).await;
            peer.next_frame().await.unwrap();
            // Acknowledges operation 5 while operation 0 is outstanding
            peer.send(&b"V:1;RSP-BATCH:T:U:1;;U:0;;U:5;U:11;E:;"[..]).await;
        });
        assert!(matches!(result, Err(ClientError::Protocol(_))));
        assert_eq!(conn.state().await, ConnectionState::Failed);
        assert!(matches!(events.recv().await, Some(ConnectionEvent::Failed(ClientError::Protocol(_)))));
        assert_eq!(peer.received.recv().await, Some(Outbound::Close));
        assert_eq!(conn.query_system().await.unwrap_err(), ClientError::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_short_read_tears_down() {
        let (conn, mut peer) = connection();
        let (result, _) = tokio::join!(conn.read_range(3, 0, 4, 8), async {
            peer.next_frame().await.unwrap();
            peer.send(&b"V:1;RSP:T:U:1;;U:0;;U:2;BL:U:0;U:2;;E:;ab"[..]).await;
        });
        assert!(matches!(result, Err(ClientError::Protocol(_))));
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn test_health_check_sends_nothing() {
        let (conn, mut peer) = connection();
        conn.check_health().await.unwrap();
        assert!(peer.received.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_health_check_detects_lost_transport() {
        let (mut conn, peer) = connection();
        let mut events = conn.take_events().unwrap();
        let MemoryPeer { received, deliver: _deliver } = peer;
        drop(received);

        assert_eq!(conn.check_health().await.unwrap_err(), ClientError::ConnectionClosed);
        assert_eq!(conn.state().await, ConnectionState::Closed);
        assert_eq!(events.recv().await, Some(ConnectionEvent::Closed { reason: None }));
    }

    #[tokio::test]
    async fn test_spawned_health_check_stops_on_lost_transport() {
        let (mut conn, peer) = connection();
        let mut events = conn.take_events().unwrap();
        let task = conn.spawn_health_check(Duration::from_millis(10));
        let MemoryPeer { received, deliver: _deliver } = peer;
        drop(received);

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        assert_eq!(event, Some(ConnectionEvent::Closed { reason: None }));
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
