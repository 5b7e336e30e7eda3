//! Single-outstanding-request correlation.
//!
//! The protocol has no multiplexing: a response is matched to the one
//! request that is waiting for it. The correlator owns the transaction id
//! counter and that single pending slot.
//!
//! ```text
//!  begin(req) ──► [pending: kind, tid, completion] ──► complete(frame)
//!       │                                                   │
//!       └── TransactionAlreadyInProgress if occupied        └── decode(kind) ─► completion
//! ```

use tokio::sync::oneshot;

use crate::error::ClientError;
use crate::framer::RawFrame;
use crate::protocol::{Request, Response, ResponseKind, TransactionId};

/// Receives the decoded response (or the error) of one exchange.
pub type Completion = oneshot::Sender<Result<Response, ClientError>>;

struct Pending {
    kind: ResponseKind,
    transaction_id: TransactionId,
    completion: Completion,
}

/// Transaction id counter plus the pending expectation.
pub struct Correlator {
    next_transaction_id: TransactionId,
    pending: Option<Pending>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_transaction_id: 1,
            pending: None,
        }
    }

    /// Register `request` as pending and return its encoded frame.
    pub fn begin(&mut self, request: &Request, completion: Completion) -> Result<Vec<u8>, ClientError> {
        if self.pending.is_some() {
            return Err(ClientError::TransactionAlreadyInProgress);
        }
        let kind = request.response_kind();
        let transaction_id = self.next_transaction_id;
        self.next_transaction_id += 1;
        self.pending = Some(Pending { kind, transaction_id, completion });
        log::trace!("-> {} T:{transaction_id}", request.opcode());
        Ok(request.encode(transaction_id))
    }

    /// Expect another response under the most recent transaction id.
    ///
    /// Used by exchanges with more than one round trip: the payload of an
    /// insert, or each operation of a batch edit.
    pub fn resume(&mut self, kind: ResponseKind, completion: Completion) -> Result<TransactionId, ClientError> {
        if self.pending.is_some() {
            return Err(ClientError::TransactionAlreadyInProgress);
        }
        let transaction_id = self.last_transaction_id().ok_or_else(|| {
            ClientError::Protocol("no transaction to continue".to_string())
        })?;
        self.pending = Some(Pending { kind, transaction_id, completion });
        Ok(transaction_id)
    }

    /// Response kind of the pending request.
    pub fn expecting(&self) -> Option<ResponseKind> {
        self.pending.as_ref().map(|p| p.kind)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn last_transaction_id(&self) -> Option<TransactionId> {
        (self.next_transaction_id > 1).then(|| self.next_transaction_id - 1)
    }

    /// Decode a response frame against the pending expectation and hand it
    /// to the waiting completion.
    ///
    /// An `Err` return means the stream can no longer be trusted; the
    /// completion has already been told.
    pub fn complete(&mut self, frame: RawFrame) -> Result<(), ClientError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| ClientError::Protocol("response without a pending request".to_string()))?;

        let outcome = match Response::decode(&frame.header, pending.kind) {
            Ok(rsp) if rsp.transaction_id != pending.transaction_id => Err(ClientError::Protocol(format!(
                "response for transaction {} while waiting for {}",
                rsp.transaction_id, pending.transaction_id
            ))),
            Ok(mut rsp) => {
                rsp.attach_payload(frame.payload);
                Ok(rsp)
            }
            Err(e) => Err(ClientError::from(e)),
        };

        match outcome {
            Ok(rsp) => {
                log::trace!("<- T:{} code {}", rsp.transaction_id, rsp.error_code);
                let _ = pending.completion.send(Ok(rsp));
                Ok(())
            }
            Err(e) => {
                let _ = pending.completion.send(Err(e.clone()));
                Err(e)
            }
        }
    }

    /// Fail the pending request, if any.
    pub fn fail(&mut self, error: ClientError) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.completion.send(Err(error));
        }
    }
}
