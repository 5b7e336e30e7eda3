//! Reassembly of protocol frames from transport deliveries.
//!
//! ```text
//!            ┌──────────── header mode ────────────┐
//! bytes ───► │ scan for E:;  ──► notification? ────┼──► frame
//!            │               ──► read response     │
//!            │                   with size > 0 ──┐ │
//!            └───────────────────────────────────┼─┘
//!            ┌──────────── payload mode ─────────▼─┐
//!            │ consume exactly <size> bytes ───────┼──► frame + payload
//!            └─────────────────────────────────────┘
//! ```
//!
//! The terminator is only searched for while no payload length is known.
//! Once a read header has declared its size the payload is taken by count,
//! so payload bytes that happen to spell `E:;` cannot cut a frame short.
//! Within a header, string fields are skipped by their declared length.

use crate::error::MalformedMessage;
use crate::protocol::wire::find_end_of_message;
use crate::protocol::{Notification, Response, ResponseKind};

/// One complete frame: the header text and, for reads, its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
}

impl RawFrame {
    pub fn is_notification(&self) -> bool {
        Notification::is_notification(&self.header)
    }
}

#[derive(Debug)]
struct PendingPayload {
    header: Vec<u8>,
    payload: Vec<u8>,
    expected: usize,
}

/// Incremental frame reassembler.
#[derive(Debug)]
pub struct Framer {
    buffer: Vec<u8>,
    pending: Option<PendingPayload>,
    max_header_bytes: usize,
}

impl Framer {
    pub fn new(max_header_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            pending: None,
            max_header_bytes,
        }
    }

    /// Append bytes from one transport delivery.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Push then try to complete a frame.
    pub fn feed(
        &mut self,
        bytes: &[u8],
        expecting: Option<ResponseKind>,
    ) -> Result<Option<RawFrame>, MalformedMessage> {
        self.push(bytes);
        self.next_frame(expecting)
    }

    /// Complete the next frame from buffered bytes, if possible.
    ///
    /// `expecting` is the response kind of the pending request; only a
    /// read response can switch the framer into payload mode.
    pub fn next_frame(
        &mut self,
        expecting: Option<ResponseKind>,
    ) -> Result<Option<RawFrame>, MalformedMessage> {
        if let Some(pending) = self.pending.as_mut() {
            let missing = pending.expected - pending.payload.len();
            let take = missing.min(self.buffer.len());
            pending.payload.extend(self.buffer.drain(..take));
            if pending.payload.len() < pending.expected {
                return Ok(None);
            }
            let done = self.pending.take().map(|p| RawFrame {
                header: p.header,
                payload: p.payload,
            });
            return Ok(done);
        }

        let end = match find_end_of_message(&self.buffer) {
            Some(end) => end,
            None => {
                if self.buffer.len() > self.max_header_bytes {
                    return Err(MalformedMessage::new(
                        self.buffer.len(),
                        format!("no end of message within {} bytes", self.max_header_bytes),
                    ));
                }
                return Ok(None);
            }
        };
        if end > self.max_header_bytes {
            return Err(MalformedMessage::new(end, "header exceeds size limit"));
        }

        let header: Vec<u8> = self.buffer.drain(..end).collect();
        if Notification::is_notification(&header) || expecting != Some(ResponseKind::Read) {
            return Ok(Some(RawFrame { header, payload: Vec::new() }));
        }

        let declared = Response::declared_payload_len(&header)? as usize;
        if declared == 0 {
            return Ok(Some(RawFrame { header, payload: Vec::new() }));
        }
        log::trace!("Read header declares {declared} payload bytes");
        self.pending = Some(PendingPayload {
            header,
            payload: Vec::with_capacity(declared.min(1 << 20)),
            expected: declared,
        });
        self.next_frame(expecting)
    }

    /// Bytes buffered but not yet part of a returned frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.pending.as_ref().map_or(0, |p| p.header.len() + p.payload.len())
    }

    /// Whether a read payload is being collected.
    pub fn in_payload(&self) -> bool {
        self.pending.is_some()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Authority, AuthorityKind, FsElement, ResponseBody};

    const READ_HEADER: &[u8] = b"V:1;RSP:T:U:1;;U:0;;U:4;BL:U:0;U:6;;E:;";

    #[test]
    fn test_header_only_frame() {
        let mut framer = Framer::new(1024);
        let frame = framer
            .feed(b"V:1;RSP:T:U:1;;U:0;;E:;", Some(ResponseKind::Ack))
            .unwrap()
            .unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(framer.buffered_len(), 0);
    }

    #[test]
    fn test_header_split_across_deliveries() {
        let mut framer = Framer::new(1024);
        assert!(framer.feed(b"V:1;RSP:T:U:1;", Some(ResponseKind::Ack)).unwrap().is_none());
        assert!(framer.feed(b";U:0;;E:", Some(ResponseKind::Ack)).unwrap().is_none());
        assert!(framer.feed(b";", Some(ResponseKind::Ack)).unwrap().is_some());
    }

    #[test]
    fn test_payload_split_across_deliveries() {
        let mut framer = Framer::new(1024);
        let mut first = READ_HEADER.to_vec();
        first.extend_from_slice(b"ab");
        assert!(framer.feed(&first, Some(ResponseKind::Read)).unwrap().is_none());
        assert!(framer.in_payload());
        assert!(framer.feed(b"cd", Some(ResponseKind::Read)).unwrap().is_none());
        let frame = framer.feed(b"ef", Some(ResponseKind::Read)).unwrap().unwrap();
        assert_eq!(frame.header, READ_HEADER);
        assert_eq!(frame.payload, b"abcdef");
    }

    #[test]
    fn test_payload_containing_terminator() {
        let mut framer = Framer::new(1024);
        let mut bytes = READ_HEADER.to_vec();
        bytes.extend_from_slice(b"E:;E:;");
        let frame = framer.feed(&bytes, Some(ResponseKind::Read)).unwrap().unwrap();
        assert_eq!(frame.payload, b"E:;E:;");
        assert_eq!(framer.buffered_len(), 0);
    }

    #[test]
    fn test_notification_during_read_is_not_payload() {
        let mut framer = Framer::new(1024);
        let notification = b"V:1;NOTIFICATION:;F-DEL:N:U:1;;U:2;BL:U:0;U:1;;E:;";
        let frame = framer.feed(notification, Some(ResponseKind::Read)).unwrap().unwrap();
        assert!(frame.is_notification());
        assert!(!framer.in_payload());
    }

    #[test]
    fn test_two_frames_in_one_delivery() {
        let mut framer = Framer::new(1024);
        let mut bytes = b"V:1;NOTIFICATION:;F-DEL:N:U:1;;U:2;BL:U:0;U:1;;E:;".to_vec();
        bytes.extend_from_slice(b"V:1;RSP:T:U:1;;U:0;;E:;");
        framer.push(&bytes);
        assert!(framer.next_frame(Some(ResponseKind::Ack)).unwrap().unwrap().is_notification());
        assert!(!framer.next_frame(Some(ResponseKind::Ack)).unwrap().unwrap().is_notification());
        assert!(framer.next_frame(Some(ResponseKind::Ack)).unwrap().is_none());
    }

    #[test]
    fn test_failed_read_has_no_payload() {
        let mut framer = Framer::new(1024);
        let frame = framer
            .feed(b"V:1;RSP:T:U:1;;U:6;;E:;", Some(ResponseKind::Read))
            .unwrap()
            .unwrap();
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_name_containing_terminator_split_across_deliveries() {
        let listing = Response::ok(
            1,
            ResponseBody::Children(vec![FsElement::Directory {
                name: "notes E:; draft".into(),
                node_id: 2,
                read: Authority { kind: AuthorityKind::User, name: "root".into() },
                write: Authority { kind: AuthorityKind::Group, name: "editors".into() },
            }]),
        )
        .encode();
        let cut = listing.windows(3).position(|w| w == b"E:;").unwrap() + 3;

        let mut framer = Framer::new(1024);
        assert!(framer.feed(&listing[..cut], Some(ResponseKind::ListChildren)).unwrap().is_none());
        let frame = framer
            .feed(&listing[cut..], Some(ResponseKind::ListChildren))
            .unwrap()
            .unwrap();
        assert_eq!(frame.header, listing);
        let response = Response::decode(&frame.header, ResponseKind::ListChildren).unwrap();
        match response.body {
            ResponseBody::Children(elements) => assert_eq!(elements[0].name(), "notes E:; draft"),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_oversized_header_is_malformed() {
        let mut framer = Framer::new(8);
        assert!(framer.feed(b"V:1;RSP:T:U:1;;", None).is_err());
    }
}
