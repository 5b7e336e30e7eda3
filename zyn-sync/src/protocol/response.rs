//! Response frames and the closed set of shapes they can take.

use crate::error::{ClientError, MalformedMessage};

use super::wire::{Reader, Writer, END_OF_MESSAGE, VERSION};
use super::{
    Block, FileKind, FsElement, NodeId, OpenedFile, Revision, SystemValue, TransactionId,
};

const ELEMENT_FILE: u64 = 0;
const ELEMENT_DIRECTORY: u64 = 1;

/// What the pending request expects back. Selects the body decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    /// Header only: auth, close, delete, edit preambles
    Ack,
    ListChildren,
    OpenFile,
    /// Header followed by a raw payload of the declared block size
    Read,
    CreateFile,
    CreateDirectory,
    QuerySystem,
    /// Acknowledgement of a completed single-step edit
    Edit,
    /// Per-operation acknowledgement inside a batch edit
    BatchEdit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Empty,
    Children(Vec<FsElement>),
    Opened(OpenedFile),
    Read {
        revision: Revision,
        block: Block,
        data: Vec<u8>,
    },
    FileCreated {
        node_id: NodeId,
        revision: Revision,
    },
    DirectoryCreated {
        node_id: NodeId,
    },
    System(Vec<(String, SystemValue)>),
    Edited {
        revision: Revision,
    },
    BatchEdited {
        operation_index: u64,
        revision: Revision,
    },
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub transaction_id: TransactionId,
    /// 0 on success
    pub error_code: u64,
    pub body: ResponseBody,
}

impl Response {
    pub fn ok(transaction_id: TransactionId, body: ResponseBody) -> Self {
        Self { transaction_id, error_code: 0, body }
    }

    pub fn error(transaction_id: TransactionId, error_code: u64) -> Self {
        Self { transaction_id, error_code, body: ResponseBody::Empty }
    }

    pub fn is_ok(&self) -> bool {
        self.error_code == 0
    }

    /// Turn a non-zero code into the matching [`ClientError`].
    pub fn into_result(self) -> Result<Response, ClientError> {
        if self.error_code == 0 {
            Ok(self)
        } else {
            Err(ClientError::from_code(self.error_code))
        }
    }

    /// Number of payload bytes that follow `header`, if it is a successful
    /// read response.
    pub fn declared_payload_len(header: &[u8]) -> Result<u64, MalformedMessage> {
        match Self::decode(header, ResponseKind::Read)? {
            Response { error_code: 0, body: ResponseBody::Read { block, .. }, .. } => Ok(block.size),
            _ => Ok(0),
        }
    }

    /// Decode a response header. Read payloads are attached separately
    /// with [`Response::attach_payload`].
    pub fn decode(header: &[u8], kind: ResponseKind) -> Result<Self, MalformedMessage> {
        let mut r = Reader::new(header);
        r.expect(VERSION)?;
        let tag_start = r.position();
        let tag = r.tag()?;
        if tag != "RSP" && tag != "RSP-BATCH" {
            return Err(MalformedMessage::new(tag_start, format!("expected response, found \"{tag}\"")));
        }
        let transaction_id = r.transaction_id()?;
        let error_code = r.unsigned()?;
        r.expect(b";")?;

        let body = if r.peek(END_OF_MESSAGE) && (error_code != 0 || kind == ResponseKind::Ack) {
            ResponseBody::Empty
        } else {
            decode_body(&mut r, kind)?
        };
        r.end()?;

        Ok(Self { transaction_id, error_code, body })
    }

    pub fn attach_payload(&mut self, payload: Vec<u8>) {
        if let ResponseBody::Read { data, .. } = &mut self.body {
            *data = payload;
        }
    }

    /// Encode header and, for reads, the trailing payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        let tag = match self.body {
            ResponseBody::BatchEdited { .. } => "RSP-BATCH",
            _ => "RSP",
        };
        w.version()
            .tag(tag)
            .transaction_id(self.transaction_id)
            .unsigned(self.error_code)
            .raw(b";");

        match &self.body {
            ResponseBody::Empty => {}
            ResponseBody::Children(elements) => {
                w.raw(b"L:").unsigned(elements.len() as u64);
                for element in elements {
                    w.raw(b"LE:");
                    match element {
                        FsElement::File { name, node_id, revision, kind, size, is_open } => {
                            w.unsigned(ELEMENT_FILE)
                                .string(name.as_bytes())
                                .node_id(*node_id)
                                .unsigned(*revision)
                                .unsigned(*kind as u64)
                                .unsigned(*size)
                                .unsigned(u64::from(*is_open));
                        }
                        FsElement::Directory { name, node_id, read, write } => {
                            w.unsigned(ELEMENT_DIRECTORY)
                                .string(name.as_bytes())
                                .node_id(*node_id)
                                .authority(read)
                                .authority(write);
                        }
                    }
                    w.raw(b";");
                }
                w.raw(b";");
            }
            ResponseBody::Opened(opened) => {
                w.node_id(opened.node_id)
                    .unsigned(opened.revision)
                    .unsigned(opened.size)
                    .unsigned(opened.page_size)
                    .unsigned(opened.kind as u64);
            }
            ResponseBody::Read { revision, block, .. } => {
                w.unsigned(*revision).block(*block);
            }
            ResponseBody::FileCreated { node_id, revision } => {
                w.node_id(*node_id).unsigned(*revision);
            }
            ResponseBody::DirectoryCreated { node_id } => {
                w.node_id(*node_id);
            }
            ResponseBody::System(pairs) => {
                w.raw(b"L:").unsigned(pairs.len() as u64);
                for (key, value) in pairs {
                    w.raw(b"LE:KVP:").string(key.as_bytes());
                    match value {
                        SystemValue::Unsigned(v) => w.unsigned(*v),
                        SystemValue::Timestamp(v) => w.timestamp(*v),
                    };
                    w.raw(b";;");
                }
                w.raw(b";");
            }
            ResponseBody::Edited { revision } => {
                w.unsigned(*revision);
            }
            ResponseBody::BatchEdited { operation_index, revision } => {
                w.unsigned(*operation_index).unsigned(*revision);
            }
        }
        w.end();

        let mut bytes = w.finish();
        if let ResponseBody::Read { data, .. } = &self.body {
            bytes.extend_from_slice(data);
        }
        bytes
    }
}

fn decode_body(r: &mut Reader<'_>, kind: ResponseKind) -> Result<ResponseBody, MalformedMessage> {
    let body = match kind {
        ResponseKind::Ack => ResponseBody::Empty,
        ResponseKind::OpenFile => {
            let node_id = r.node_id()?;
            let revision = r.unsigned()?;
            let size = r.unsigned()?;
            let page_size = r.unsigned()?;
            let code = r.unsigned()?;
            let kind = FileKind::from_code(code)
                .ok_or_else(|| r.error(format!("unknown file type {code}")))?;
            ResponseBody::Opened(OpenedFile { node_id, revision, size, page_size, kind })
        }
        ResponseKind::Read => {
            let revision = r.unsigned()?;
            let block = r.block()?;
            ResponseBody::Read { revision, block, data: Vec::new() }
        }
        ResponseKind::CreateFile => {
            let node_id = r.node_id()?;
            let revision = r.unsigned()?;
            ResponseBody::FileCreated { node_id, revision }
        }
        ResponseKind::CreateDirectory => ResponseBody::DirectoryCreated { node_id: r.node_id()? },
        ResponseKind::Edit => ResponseBody::Edited { revision: r.unsigned()? },
        ResponseKind::BatchEdit => {
            let operation_index = r.unsigned()?;
            let revision = r.unsigned()?;
            ResponseBody::BatchEdited { operation_index, revision }
        }
        ResponseKind::ListChildren => ResponseBody::Children(decode_children(r)?),
        ResponseKind::QuerySystem => ResponseBody::System(decode_system(r)?),
    };
    Ok(body)
}

fn decode_children(r: &mut Reader<'_>) -> Result<Vec<FsElement>, MalformedMessage> {
    r.expect(b"L:")?;
    let count = r.unsigned()?;
    let mut elements = Vec::new();
    for _ in 0..count {
        r.expect(b"LE:")?;
        let element_type = r.unsigned()?;
        let name = r.utf8_string()?;
        let node_id = r.node_id()?;
        let element = match element_type {
            ELEMENT_FILE => {
                let revision = r.unsigned()?;
                let code = r.unsigned()?;
                let kind = FileKind::from_code(code)
                    .ok_or_else(|| r.error(format!("unknown file type {code}")))?;
                let size = r.unsigned()?;
                let is_open = r.unsigned()? != 0;
                FsElement::File { name, node_id, revision, kind, size, is_open }
            }
            ELEMENT_DIRECTORY => {
                let read = r.authority()?;
                let write = r.authority()?;
                FsElement::Directory { name, node_id, read, write }
            }
            other => return Err(r.error(format!("unknown element type {other}"))),
        };
        r.expect(b";")?;
        elements.push(element);
    }
    r.expect(b";")?;
    Ok(elements)
}

fn decode_system(r: &mut Reader<'_>) -> Result<Vec<(String, SystemValue)>, MalformedMessage> {
    r.expect(b"L:")?;
    let count = r.unsigned()?;
    let mut pairs = Vec::new();
    for _ in 0..count {
        r.expect(b"LE:KVP:")?;
        let key = r.utf8_string()?;
        // Unsigned first, timestamp as the fallback
        let value = if r.peek(b"U:") {
            SystemValue::Unsigned(r.unsigned()?)
        } else if r.peek(b"TS:") {
            SystemValue::Timestamp(r.timestamp()?)
        } else {
            return Err(r.error(format!("value of \"{key}\" is neither unsigned nor timestamp")));
        };
        r.expect(b";;")?;
        pairs.push((key, value));
    }
    r.expect(b";")?;
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::find_end_of_message;
    use crate::protocol::{Authority, AuthorityKind};

    #[test]
    fn test_ack_header() {
        let rsp = Response::decode(b"V:1;RSP:T:U:4;;U:0;;E:;", ResponseKind::Ack).unwrap();
        assert_eq!(rsp, Response::ok(4, ResponseBody::Empty));
    }

    #[test]
    fn test_error_response_has_no_body() {
        let rsp = Response::decode(b"V:1;RSP:T:U:4;;U:302;;E:;", ResponseKind::OpenFile).unwrap();
        assert_eq!(rsp.error_code, 302);
        assert_eq!(rsp.into_result(), Err(ClientError::StaleRevision));
    }

    #[test]
    fn test_success_without_body_is_malformed() {
        assert!(Response::decode(b"V:1;RSP:T:U:4;;U:0;;E:;", ResponseKind::OpenFile).is_err());
    }

    #[test]
    fn test_open_response() {
        let bytes = b"V:1;RSP:T:U:2;;U:0;;N:U:9;;U:3;U:120;U:1024;U:0;E:;";
        let rsp = Response::decode(bytes, ResponseKind::OpenFile).unwrap();
        assert_eq!(
            rsp.body,
            ResponseBody::Opened(OpenedFile {
                node_id: 9,
                revision: 3,
                size: 120,
                page_size: 1024,
                kind: FileKind::RandomAccess,
            })
        );
    }

    #[test]
    fn test_read_declared_length() {
        let header = b"V:1;RSP:T:U:2;;U:0;;U:7;BL:U:10;U:5;;E:;";
        assert_eq!(Response::declared_payload_len(header).unwrap(), 5);
        assert_eq!(Response::declared_payload_len(b"V:1;RSP:T:U:2;;U:6;;E:;").unwrap(), 0);
    }

    #[test]
    fn test_batch_ack_with_error_keeps_index() {
        let bytes = b"V:1;RSP-BATCH:T:U:8;;U:303;;U:2;U:14;E:;";
        let rsp = Response::decode(bytes, ResponseKind::BatchEdit).unwrap();
        assert_eq!(rsp.error_code, 303);
        assert_eq!(rsp.body, ResponseBody::BatchEdited { operation_index: 2, revision: 14 });
    }

    #[test]
    fn test_notification_is_not_a_response() {
        let bytes = b"V:1;NOTIFICATION:;F-DEL:N:U:1;;U:2;BL:U:0;U:1;;E:;";
        assert!(Response::decode(bytes, ResponseKind::Ack).is_err());
    }

    #[test]
    fn test_system_values() {
        let rsp = Response::ok(
            1,
            ResponseBody::System(vec![
                ("max-number-of-open-files-per-connection".into(), SystemValue::Unsigned(10)),
                ("started-at".into(), SystemValue::Timestamp(1_700_000_000)),
            ]),
        );
        let bytes = rsp.encode();
        assert_eq!(Response::decode(&bytes, ResponseKind::QuerySystem).unwrap(), rsp);

        let bad = b"V:1;RSP:T:U:1;;U:0;;L:U:1;LE:KVP:S:U:1;B:k;;X:1;;;;E:;";
        assert!(Response::decode(bad, ResponseKind::QuerySystem).is_err());
    }

    #[test]
    fn test_children_roundtrip() {
        let admins = Authority { kind: AuthorityKind::Group, name: "admins".into() };
        let rsp = Response::ok(
            6,
            ResponseBody::Children(vec![
                FsElement::File {
                    name: "notes.md".into(),
                    node_id: 3,
                    revision: 8,
                    kind: FileKind::RandomAccess,
                    size: 42,
                    is_open: true,
                },
                FsElement::Directory {
                    name: "archive".into(),
                    node_id: 4,
                    read: admins.clone(),
                    write: admins,
                },
            ]),
        );
        let bytes = rsp.encode();
        assert_eq!(Response::decode(&bytes, ResponseKind::ListChildren).unwrap(), rsp);
    }

    #[test]
    fn test_read_encode_appends_payload() {
        let rsp = Response::ok(
            1,
            ResponseBody::Read { revision: 2, block: Block::new(0, 3), data: b"E:;".to_vec() },
        );
        let bytes = rsp.encode();
        assert!(bytes.ends_with(b";;E:;E:;"));
    }

    #[test]
    fn test_every_body_survives_encoding() {
        let nobody = Authority { kind: AuthorityKind::User, name: String::new() };
        let cases = vec![
            (ResponseKind::Ack, ResponseBody::Empty),
            (ResponseKind::ListChildren, ResponseBody::Children(Vec::new())),
            (
                ResponseKind::ListChildren,
                ResponseBody::Children(vec![
                    FsElement::File {
                        name: String::new(),
                        node_id: 1,
                        revision: 0,
                        kind: FileKind::Blob,
                        size: 0,
                        is_open: false,
                    },
                    FsElement::Directory { name: "E:;".into(), node_id: 2, read: nobody.clone(), write: nobody },
                ]),
            ),
            (
                ResponseKind::OpenFile,
                ResponseBody::Opened(OpenedFile {
                    node_id: 3,
                    revision: 0,
                    size: 0,
                    page_size: 1,
                    kind: FileKind::Blob,
                }),
            ),
            (
                ResponseKind::Read,
                ResponseBody::Read { revision: 4, block: Block::new(9, 0), data: Vec::new() },
            ),
            (
                ResponseKind::Read,
                ResponseBody::Read { revision: 4, block: Block::new(0, 4), data: b"a;;b".to_vec() },
            ),
            (ResponseKind::CreateFile, ResponseBody::FileCreated { node_id: 5, revision: 0 }),
            (ResponseKind::CreateDirectory, ResponseBody::DirectoryCreated { node_id: 6 }),
            (ResponseKind::QuerySystem, ResponseBody::System(Vec::new())),
            (
                ResponseKind::QuerySystem,
                ResponseBody::System(vec![(String::new(), SystemValue::Timestamp(0))]),
            ),
            (ResponseKind::Edit, ResponseBody::Edited { revision: u64::MAX }),
            (ResponseKind::BatchEdit, ResponseBody::BatchEdited { operation_index: 0, revision: 7 }),
        ];

        for (kind, body) in cases {
            let rsp = Response::ok(12, body);
            let bytes = rsp.encode();
            let end = find_end_of_message(&bytes).unwrap();
            let mut decoded = Response::decode(&bytes[..end], kind).unwrap();
            assert_eq!(Response::declared_payload_len(&bytes[..end]).unwrap_or(0) as usize, bytes.len() - end);
            decoded.attach_payload(bytes[end..].to_vec());
            assert_eq!(decoded, rsp, "{kind:?}");
        }
    }
}
