//! Edit transactions.
//!
//! An ordered list of [`EditOperation`]s is applied against a known
//! revision as a sequence of round trips. Offsets of operation `k` refer to
//! the document after operations `0..k` have been applied.
//!
//! ```text
//! single-step, per operation:
//!   insert/write:  RA-I|RA-W ──ack──► <bytes> ──► U:<rev>
//!   delete:        RA-D ──────────────────────► U:<rev>
//!
//! batched:
//!   RA-BATCH-EDIT(count) ──ack──► [U:<op>;BL;E:; <bytes>] ──► (index, rev)  × count
//! ```
//!
//! The revision sent with operation `k + 1` is the one returned for
//! operation `k`. A failed operation ends the transaction; nothing that
//! was already accepted is rolled back.

use crate::error::ClientError;
use crate::protocol::{
    BatchOpKind, BatchOperation, Block, NodeId, Request, Response, ResponseBody, ResponseKind,
    Revision,
};
use crate::replica;

/// One edit against a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOperation {
    Insert { offset: u64, bytes: Vec<u8> },
    Delete { offset: u64, size: u64 },
    /// Overwrite existing bytes in place
    Write { offset: u64, bytes: Vec<u8> },
}

impl EditOperation {
    pub fn block(&self) -> Block {
        match self {
            EditOperation::Insert { offset, bytes } | EditOperation::Write { offset, bytes } => {
                Block::new(*offset, bytes.len() as u64)
            }
            EditOperation::Delete { offset, size } => Block::new(*offset, *size),
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            EditOperation::Insert { bytes, .. } | EditOperation::Write { bytes, .. } => Some(bytes),
            EditOperation::Delete { .. } => None,
        }
    }

    fn batch_kind(&self) -> BatchOpKind {
        match self {
            EditOperation::Insert { .. } => BatchOpKind::Insert,
            EditOperation::Delete { .. } => BatchOpKind::Delete,
            EditOperation::Write { .. } => BatchOpKind::Write,
        }
    }

    /// Apply to a local buffer with the same bounds rules the server uses.
    pub fn apply(&self, content: &mut Vec<u8>) -> Result<(), ClientError> {
        let updated = match self {
            EditOperation::Insert { offset, bytes } => replica::splice_insert(content, *offset, bytes)?,
            EditOperation::Delete { offset, size } => replica::splice_delete(content, *offset, *size)?,
            EditOperation::Write { offset, bytes } => replica::splice_modify(content, *offset, bytes)?,
        };
        *content = updated;
        Ok(())
    }
}

/// Turn `old` into `new` with at most one delete followed by one insert,
/// trimming the common prefix and suffix.
pub fn diff_operations(old: &[u8], new: &[u8]) -> Vec<EditOperation> {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let removed = old.len() - prefix - suffix;
    let added = &new[prefix..new.len() - suffix];

    let mut ops = Vec::new();
    if removed > 0 {
        ops.push(EditOperation::Delete { offset: prefix as u64, size: removed as u64 });
    }
    if !added.is_empty() {
        ops.push(EditOperation::Insert { offset: prefix as u64, bytes: added.to_vec() });
    }
    ops
}

/// How an operation list is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EditStrategy {
    /// One exchange per operation
    SingleStep,
    /// One batch exchange for the whole list
    Batched,
    /// Batched for more than one operation
    #[default]
    Auto,
}

/// Next thing the driver must do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditStep {
    /// Open a new transaction with this request
    Send(Request),
    /// Send raw frames under the current transaction and wait for `expect`
    Continue { frames: Vec<Vec<u8>>, expect: ResponseKind },
    /// All operations accepted, final revision
    Finished(Revision),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitPreamble,
    AwaitEdit,
    AwaitBatchPreamble,
    AwaitBatchAck,
    Finished,
    Failed,
}

/// State machine driving one edit transaction.
#[derive(Debug)]
pub struct EditTransaction {
    node_id: NodeId,
    revision: Revision,
    operations: Vec<EditOperation>,
    batched: bool,
    completed: usize,
    phase: Phase,
}

impl EditTransaction {
    pub fn new(
        node_id: NodeId,
        revision: Revision,
        operations: Vec<EditOperation>,
        strategy: EditStrategy,
    ) -> Result<Self, ClientError> {
        if let Some(i) = operations.iter().position(|op| op.block().size == 0) {
            return Err(ClientError::InvalidState(format!("edit operation {i} is empty")));
        }
        let batched = match strategy {
            EditStrategy::SingleStep => false,
            EditStrategy::Batched => true,
            EditStrategy::Auto => operations.len() > 1,
        };
        Ok(Self {
            node_id,
            revision,
            operations,
            batched,
            completed: 0,
            phase: Phase::Idle,
        })
    }

    pub fn is_batched(&self) -> bool {
        self.batched
    }

    /// Revision after the last accepted operation.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// `(operations completed, total operations)`
    pub fn progress(&self) -> (usize, usize) {
        (self.completed, self.operations.len())
    }

    pub fn start(&mut self) -> Result<EditStep, ClientError> {
        if self.phase != Phase::Idle {
            return Err(ClientError::InvalidState("edit transaction already started".to_string()));
        }
        if self.operations.is_empty() {
            self.phase = Phase::Finished;
            return Ok(EditStep::Finished(self.revision));
        }
        if self.batched {
            self.phase = Phase::AwaitBatchPreamble;
            return Ok(EditStep::Send(Request::BatchEditPreamble {
                node_id: self.node_id,
                revision: self.revision,
                count: self.operations.len() as u64,
            }));
        }
        Ok(self.single_step())
    }

    /// Advance with the response to the last step.
    pub fn on_response(&mut self, response: Response) -> Result<EditStep, ClientError> {
        let result = self.advance(response);
        if result.is_err() {
            self.phase = Phase::Failed;
        }
        result
    }

    fn advance(&mut self, response: Response) -> Result<EditStep, ClientError> {
        match self.phase {
            Phase::AwaitPreamble => {
                response.into_result()?;
                self.phase = Phase::AwaitEdit;
                let bytes = self.current().payload().unwrap_or_default().to_vec();
                Ok(EditStep::Continue { frames: vec![bytes], expect: ResponseKind::Edit })
            }
            Phase::AwaitEdit => {
                let response = response.into_result()?;
                let ResponseBody::Edited { revision } = response.body else {
                    return Err(ClientError::Protocol("edit acknowledgement without revision".to_string()));
                };
                self.accept(revision);
                if self.completed == self.operations.len() {
                    self.phase = Phase::Finished;
                    return Ok(EditStep::Finished(self.revision));
                }
                Ok(self.single_step())
            }
            Phase::AwaitBatchPreamble => {
                response.into_result()?;
                self.phase = Phase::AwaitBatchAck;
                Ok(self.batch_step())
            }
            Phase::AwaitBatchAck => {
                let response = response.into_result()?;
                let ResponseBody::BatchEdited { operation_index, revision } = response.body else {
                    return Err(ClientError::Protocol("batch acknowledgement without index".to_string()));
                };
                if operation_index != self.completed as u64 {
                    return Err(ClientError::Protocol(format!(
                        "batch acknowledged operation {operation_index}, expected {}",
                        self.completed
                    )));
                }
                self.accept(revision);
                if self.completed == self.operations.len() {
                    self.phase = Phase::Finished;
                    return Ok(EditStep::Finished(self.revision));
                }
                Ok(self.batch_step())
            }
            Phase::Idle | Phase::Finished | Phase::Failed => Err(ClientError::InvalidState(format!(
                "edit transaction is not waiting for a response ({:?})",
                self.phase
            ))),
        }
    }

    fn current(&self) -> &EditOperation {
        &self.operations[self.completed]
    }

    fn accept(&mut self, revision: Revision) {
        self.revision = revision;
        self.completed += 1;
        log::debug!(
            "Edit {}/{} accepted at revision {revision}",
            self.completed,
            self.operations.len()
        );
    }

    fn single_step(&mut self) -> EditStep {
        let (node_id, revision) = (self.node_id, self.revision);
        let op = self.current();
        let block = op.block();
        let (request, phase) = match op {
            EditOperation::Insert { .. } => {
                (Request::InsertPreamble { node_id, revision, block }, Phase::AwaitPreamble)
            }
            EditOperation::Write { .. } => {
                (Request::WritePreamble { node_id, revision, block }, Phase::AwaitPreamble)
            }
            EditOperation::Delete { .. } => {
                (Request::DeleteRange { node_id, revision, block }, Phase::AwaitEdit)
            }
        };
        self.phase = phase;
        EditStep::Send(request)
    }

    fn batch_step(&self) -> EditStep {
        let op = self.current();
        let descriptor = BatchOperation { kind: op.batch_kind(), block: op.block() };
        let mut frames = vec![descriptor.encode()];
        if let Some(bytes) = op.payload() {
            frames.push(bytes.to_vec());
        }
        EditStep::Continue { frames, expect: ResponseKind::BatchEdit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal server-side model: validates revisions and applies edits.
    struct FakeFile {
        content: Vec<u8>,
        revision: Revision,
        pending: Option<Request>,
        batch_left: u64,
        batch_index: u64,
        fail_at: Option<usize>,
        applied: usize,
    }

    impl FakeFile {
        fn new(content: &[u8], revision: Revision) -> Self {
            Self {
                content: content.to_vec(),
                revision,
                pending: None,
                batch_left: 0,
                batch_index: 0,
                fail_at: None,
                applied: 0,
            }
        }

        fn apply(&mut self, op: EditOperation) -> Result<Revision, u64> {
            if self.fail_at == Some(self.applied) {
                return Err(303);
            }
            op.apply(&mut self.content).map_err(|_| 303u64)?;
            self.applied += 1;
            self.revision += 1;
            Ok(self.revision)
        }

        fn handle_request(&mut self, req: Request) -> Response {
            match req {
                Request::InsertPreamble { revision, .. } | Request::WritePreamble { revision, .. } => {
                    if revision != self.revision {
                        return Response::error(1, 302);
                    }
                    self.pending = Some(req);
                    Response::ok(1, ResponseBody::Empty)
                }
                Request::DeleteRange { revision, block, .. } => {
                    if revision != self.revision {
                        return Response::error(1, 302);
                    }
                    match self.apply(EditOperation::Delete { offset: block.offset, size: block.size }) {
                        Ok(revision) => Response::ok(1, ResponseBody::Edited { revision }),
                        Err(code) => Response::error(1, code),
                    }
                }
                Request::BatchEditPreamble { revision, count, .. } => {
                    if revision != self.revision {
                        return Response::error(1, 302);
                    }
                    self.batch_left = count;
                    self.batch_index = 0;
                    Response::ok(1, ResponseBody::Empty)
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        fn handle_frames(&mut self, frames: Vec<Vec<u8>>) -> Response {
            if let Some(preamble) = self.pending.take() {
                let bytes = frames.concat();
                let op = match preamble {
                    Request::InsertPreamble { block, .. } => EditOperation::Insert { offset: block.offset, bytes },
                    Request::WritePreamble { block, .. } => EditOperation::Write { offset: block.offset, bytes },
                    _ => unreachable!(),
                };
                return match self.apply(op) {
                    Ok(revision) => Response::ok(1, ResponseBody::Edited { revision }),
                    Err(code) => Response::error(1, code),
                };
            }
            assert!(self.batch_left > 0, "batch frames without preamble");
            let descriptor = BatchOperation::decode(&frames[0]).unwrap();
            let bytes = frames.get(1).cloned().unwrap_or_default();
            let op = match descriptor.kind {
                BatchOpKind::Delete => EditOperation::Delete { offset: descriptor.block.offset, size: descriptor.block.size },
                BatchOpKind::Insert => EditOperation::Insert { offset: descriptor.block.offset, bytes },
                BatchOpKind::Write => EditOperation::Write { offset: descriptor.block.offset, bytes },
            };
            let index = self.batch_index;
            self.batch_left -= 1;
            self.batch_index += 1;
            match self.apply(op) {
                Ok(revision) => Response::ok(1, ResponseBody::BatchEdited { operation_index: index, revision }),
                Err(code) => Response {
                    transaction_id: 1,
                    error_code: code,
                    body: ResponseBody::BatchEdited { operation_index: index, revision: self.revision },
                },
            }
        }
    }

    /// Drive a transaction against the fake, counting round trips.
    fn run(
        file: &mut FakeFile,
        tx: &mut EditTransaction,
        progress: &mut Vec<(usize, usize)>,
    ) -> (Result<Revision, ClientError>, usize) {
        let mut exchanges = 0;
        let mut step = match tx.start() {
            Ok(step) => step,
            Err(e) => return (Err(e), exchanges),
        };
        loop {
            let response = match step {
                EditStep::Finished(revision) => return (Ok(revision), exchanges),
                EditStep::Send(req) => file.handle_request(req),
                EditStep::Continue { frames, .. } => file.handle_frames(frames),
            };
            exchanges += 1;
            let before = tx.progress().0;
            step = match tx.on_response(response) {
                Ok(step) => step,
                Err(e) => return (Err(e), exchanges),
            };
            if tx.progress().0 > before {
                progress.push(tx.progress());
            }
        }
    }

    fn ops() -> Vec<EditOperation> {
        vec![
            EditOperation::Insert { offset: 0, bytes: b"# ".to_vec() },
            EditOperation::Delete { offset: 6, size: 2 },
            EditOperation::Write { offset: 2, bytes: b"DA".to_vec() },
            EditOperation::Insert { offset: 6, bytes: b"!".to_vec() },
        ]
    }

    #[test]
    fn test_single_and_batched_are_equivalent() {
        let mut single_file = FakeFile::new(b"data1234", 10);
        let mut tx = EditTransaction::new(1, 10, ops(), EditStrategy::SingleStep).unwrap();
        let (single, _) = run(&mut single_file, &mut tx, &mut Vec::new());

        let mut batch_file = FakeFile::new(b"data1234", 10);
        let mut tx = EditTransaction::new(1, 10, ops(), EditStrategy::Batched).unwrap();
        let (batched, _) = run(&mut batch_file, &mut tx, &mut Vec::new());

        assert_eq!(single.unwrap(), 14);
        assert_eq!(batched.unwrap(), 14);
        assert_eq!(single_file.content, batch_file.content);
        assert_eq!(single_file.content, b"# DAta!34");

        let mut local = b"data1234".to_vec();
        for op in ops() {
            op.apply(&mut local).unwrap();
        }
        assert_eq!(local, single_file.content);
    }

    #[test]
    fn test_revision_threads_through_operations() {
        let mut file = FakeFile::new(b"abc", 3);
        let mut tx = EditTransaction::new(
            9,
            3,
            vec![
                EditOperation::Insert { offset: 3, bytes: b"d".to_vec() },
                EditOperation::Insert { offset: 4, bytes: b"e".to_vec() },
            ],
            EditStrategy::SingleStep,
        )
        .unwrap();
        // Each preamble after the first must carry the revision returned
        // by the previous acknowledgement, otherwise the fake answers 302.
        let (result, exchanges) = run(&mut file, &mut tx, &mut Vec::new());
        assert_eq!(result.unwrap(), 5);
        assert_eq!(exchanges, 4);
        assert_eq!(file.content, b"abcde");
    }

    #[test]
    fn test_batch_failure_stops_later_operations() {
        let mut file = FakeFile::new(b"data1234", 1);
        file.fail_at = Some(1);
        let mut tx = EditTransaction::new(1, 1, ops(), EditStrategy::Batched).unwrap();
        let mut progress = Vec::new();
        let (result, exchanges) = run(&mut file, &mut tx, &mut progress);

        assert_eq!(result.unwrap_err(), ClientError::Server { code: 303 });
        // preamble + two operations, nothing after the failing one
        assert_eq!(exchanges, 3);
        assert_eq!(file.applied, 1);
        assert_eq!(progress, vec![(1, 4)]);
        assert!(tx.on_response(Response::ok(1, ResponseBody::Empty)).is_err());
    }

    #[test]
    fn test_single_failure_is_returned_unchanged() {
        let mut file = FakeFile::new(b"data", 7);
        let mut tx = EditTransaction::new(
            1,
            6,
            vec![EditOperation::Delete { offset: 0, size: 1 }],
            EditStrategy::SingleStep,
        )
        .unwrap();
        let (result, _) = run(&mut file, &mut tx, &mut Vec::new());
        assert_eq!(result.unwrap_err(), ClientError::StaleRevision);
        assert_eq!(file.content, b"data");
    }

    #[test]
    fn test_batch_progress_reported_per_operation() {
        let mut file = FakeFile::new(b"data1234", 1);
        let mut tx = EditTransaction::new(1, 1, ops(), EditStrategy::Auto).unwrap();
        assert!(tx.is_batched());
        let mut progress = Vec::new();
        run(&mut file, &mut tx, &mut progress).0.unwrap();
        assert_eq!(progress, vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
    }

    #[test]
    fn test_out_of_order_batch_index_is_protocol_error() {
        let mut tx = EditTransaction::new(1, 1, ops(), EditStrategy::Batched).unwrap();
        tx.start().unwrap();
        tx.on_response(Response::ok(1, ResponseBody::Empty)).unwrap();
        let err = tx
            .on_response(Response::ok(1, ResponseBody::BatchEdited { operation_index: 3, revision: 2 }))
            .unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn test_batch_frames_carry_payload() {
        let mut tx = EditTransaction::new(1, 1, ops(), EditStrategy::Batched).unwrap();
        tx.start().unwrap();
        let step = tx.on_response(Response::ok(1, ResponseBody::Empty)).unwrap();
        assert_eq!(
            step,
            EditStep::Continue {
                frames: vec![b"U:2;BL:U:0;U:2;;E:;".to_vec(), b"# ".to_vec()],
                expect: ResponseKind::BatchEdit,
            }
        );
    }

    #[test]
    fn test_empty_operation_list_finishes_immediately() {
        let mut tx = EditTransaction::new(1, 4, Vec::new(), EditStrategy::Auto).unwrap();
        assert_eq!(tx.start().unwrap(), EditStep::Finished(4));
        assert!(EditTransaction::new(
            1,
            4,
            vec![EditOperation::Insert { offset: 0, bytes: Vec::new() }],
            EditStrategy::Auto
        )
        .is_err());
    }

    #[test]
    fn test_diff_operations() {
        assert!(diff_operations(b"same", b"same").is_empty());
        assert_eq!(
            diff_operations(b"data", b"da12ta"),
            vec![EditOperation::Insert { offset: 2, bytes: b"12".to_vec() }]
        );
        assert_eq!(
            diff_operations(b"data1234", b"da1234"),
            vec![EditOperation::Delete { offset: 2, size: 2 }]
        );
        assert_eq!(
            diff_operations(b"hello world", b"hello there world"),
            vec![EditOperation::Insert { offset: 6, bytes: b"there ".to_vec() }]
        );
        assert_eq!(
            diff_operations(b"aaa", b"aa"),
            vec![EditOperation::Delete { offset: 2, size: 1 }]
        );
    }

    #[test]
    fn test_diff_replays_to_new_content() {
        let cases: [(&[u8], &[u8]); 5] = [
            (b"", b"new file"),
            (b"old file", b""),
            (b"abcdef", b"abXYef"),
            (b"abcabc", b"abc"),
            (b"# Title\nbody", b"# Other title\nbody text"),
        ];
        for (old, new) in cases {
            let mut content = old.to_vec();
            for op in diff_operations(old, new) {
                op.apply(&mut content).unwrap();
            }
            assert_eq!(content, new);
        }
    }
}
