//! Field-level primitives of the tagged text format.
//!
//! ```text
//! U:<n>;                    unsigned
//! TS:<n>;                   timestamp
//! S:U:<len>;B:<bytes>;;     length-prefixed string
//! N:U:<id>;;                node id
//! BL:U:<off>;U:<size>;;     block
//! T:U:<id>;;                transaction id
//! AUTHORITY:U:<t>;<S>;      authority
//! E:;                       end of message
//! ```
//!
//! `Writer` appends fields to a byte buffer; `Reader` consumes them and
//! fails on the first literal that does not match.

use crate::error::MalformedMessage;

use super::{Authority, AuthorityKind, Block};

/// Terminator of every header frame.
pub const END_OF_MESSAGE: &[u8] = b"E:;";

/// Protocol version prefix.
pub const VERSION: &[u8] = b"V:1;";

/// Append-only field encoder.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(64) }
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn version(&mut self) -> &mut Self {
        self.raw(VERSION)
    }

    /// `<name>:`
    pub fn tag(&mut self, name: &str) -> &mut Self {
        self.raw(name.as_bytes()).raw(b":")
    }

    pub fn unsigned(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(format!("U:{value};").as_bytes());
        self
    }

    pub fn timestamp(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(format!("TS:{value};").as_bytes());
        self
    }

    pub fn string(&mut self, value: &[u8]) -> &mut Self {
        self.raw(b"S:").unsigned(value.len() as u64);
        self.raw(b"B:").raw(value).raw(b";;")
    }

    pub fn node_id(&mut self, id: u64) -> &mut Self {
        self.raw(b"N:").unsigned(id).raw(b";")
    }

    pub fn block(&mut self, block: Block) -> &mut Self {
        self.raw(b"BL:")
            .unsigned(block.offset)
            .unsigned(block.size)
            .raw(b";")
    }

    pub fn transaction_id(&mut self, id: u64) -> &mut Self {
        self.raw(b"T:").unsigned(id).raw(b";")
    }

    pub fn path_descriptor(&mut self, path: &str) -> &mut Self {
        self.raw(b"F:P:").string(path.as_bytes()).raw(b";;")
    }

    pub fn node_descriptor(&mut self, id: u64) -> &mut Self {
        self.raw(b"F:N:").unsigned(id).raw(b";;")
    }

    pub fn authority(&mut self, authority: &Authority) -> &mut Self {
        self.raw(b"AUTHORITY:")
            .unsigned(authority.kind as u64)
            .string(authority.name.as_bytes())
            .raw(b";")
    }

    pub fn end(&mut self) -> &mut Self {
        self.raw(END_OF_MESSAGE)
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Cursor-based field decoder over one frame.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn error(&self, reason: impl Into<String>) -> MalformedMessage {
        MalformedMessage::new(self.pos, reason)
    }

    pub fn peek(&self, literal: &[u8]) -> bool {
        self.remaining().starts_with(literal)
    }

    /// Consume `literal` or fail without advancing.
    pub fn expect(&mut self, literal: &[u8]) -> Result<(), MalformedMessage> {
        if self.peek(literal) {
            self.pos += literal.len();
            Ok(())
        } else {
            Err(self.error(format!(
                "expected \"{}\", found \"{}\"",
                String::from_utf8_lossy(literal),
                preview(self.remaining())
            )))
        }
    }

    /// Read `<name>:` and return `name`.
    pub fn tag(&mut self) -> Result<&'a str, MalformedMessage> {
        let rest = self.remaining();
        let end = rest
            .iter()
            .position(|b| *b == b':')
            .ok_or_else(|| self.error("missing tag delimiter"))?;
        let name = std::str::from_utf8(&rest[..end])
            .map_err(|_| self.error("tag is not valid utf-8"))?;
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_uppercase() || b == b'-') {
            return Err(self.error(format!("invalid tag \"{}\"", preview(&rest[..end]))));
        }
        self.pos += end + 1;
        Ok(name)
    }

    fn digits(&mut self) -> Result<u64, MalformedMessage> {
        let rest = self.remaining();
        let end = rest
            .iter()
            .position(|b| *b == b';')
            .ok_or_else(|| self.error("unterminated number"))?;
        let text = &rest[..end];
        if text.is_empty() || !text.iter().all(u8::is_ascii_digit) {
            return Err(self.error(format!("invalid number \"{}\"", preview(text))));
        }
        let value = std::str::from_utf8(text)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| self.error("number out of range"))?;
        self.pos += end + 1;
        Ok(value)
    }

    pub fn unsigned(&mut self) -> Result<u64, MalformedMessage> {
        self.expect(b"U:")?;
        self.digits()
    }

    pub fn timestamp(&mut self) -> Result<u64, MalformedMessage> {
        self.expect(b"TS:")?;
        self.digits()
    }

    pub fn string(&mut self) -> Result<Vec<u8>, MalformedMessage> {
        self.expect(b"S:")?;
        let len = self.unsigned()? as usize;
        self.expect(b"B:")?;
        if self.remaining().len() < len {
            return Err(self.error(format!("string of {len} bytes exceeds frame")));
        }
        let value = self.remaining()[..len].to_vec();
        self.pos += len;
        self.expect(b";;")?;
        Ok(value)
    }

    pub fn utf8_string(&mut self) -> Result<String, MalformedMessage> {
        let start = self.pos;
        let bytes = self.string()?;
        String::from_utf8(bytes).map_err(|_| MalformedMessage::new(start, "string is not valid utf-8"))
    }

    pub fn node_id(&mut self) -> Result<u64, MalformedMessage> {
        self.expect(b"N:")?;
        let id = self.unsigned()?;
        self.expect(b";")?;
        Ok(id)
    }

    pub fn block(&mut self) -> Result<Block, MalformedMessage> {
        self.expect(b"BL:")?;
        let offset = self.unsigned()?;
        let size = self.unsigned()?;
        self.expect(b";")?;
        Ok(Block { offset, size })
    }

    pub fn transaction_id(&mut self) -> Result<u64, MalformedMessage> {
        self.expect(b"T:")?;
        let id = self.unsigned()?;
        self.expect(b";")?;
        Ok(id)
    }

    pub fn path_descriptor(&mut self) -> Result<String, MalformedMessage> {
        self.expect(b"F:P:")?;
        let path = self.utf8_string()?;
        self.expect(b";;")?;
        Ok(path)
    }

    pub fn node_descriptor(&mut self) -> Result<u64, MalformedMessage> {
        self.expect(b"F:N:")?;
        let id = self.unsigned()?;
        self.expect(b";;")?;
        Ok(id)
    }

    pub fn authority(&mut self) -> Result<Authority, MalformedMessage> {
        self.expect(b"AUTHORITY:")?;
        let kind = match self.unsigned()? {
            0 => AuthorityKind::User,
            1 => AuthorityKind::Group,
            other => return Err(self.error(format!("unknown authority type {other}"))),
        };
        let name = self.utf8_string()?;
        self.expect(b";")?;
        Ok(Authority { kind, name })
    }

    /// Consume the terminator and require that nothing follows it.
    pub fn end(&mut self) -> Result<(), MalformedMessage> {
        self.expect(END_OF_MESSAGE)?;
        if !self.is_empty() {
            return Err(self.error("trailing bytes after end of message"));
        }
        Ok(())
    }
}

/// Find the terminator of the first frame in `data`, returning the index
/// just past it, or `None` while the frame is incomplete.
///
/// String contents are skipped by their declared length, so a name such as
/// `a E:; b` does not end the frame early.
pub fn find_end_of_message(data: &[u8]) -> Option<usize> {
    const STRING: &[u8] = b"S:U:";
    let mut i = 0;
    while i + END_OF_MESSAGE.len() <= data.len() {
        let rest = &data[i..];
        if rest.starts_with(END_OF_MESSAGE) {
            return Some(i + END_OF_MESSAGE.len());
        }
        let at_field = i == 0 || matches!(data[i - 1], b';' | b':');
        if at_field && rest.starts_with(STRING) {
            match string_extent(&rest[STRING.len()..]) {
                Extent::Incomplete => return None,
                Extent::Skip(n) => {
                    i += STRING.len() + n;
                    continue;
                }
                Extent::NotAString => {}
            }
        }
        i += 1;
    }
    None
}

enum Extent {
    Incomplete,
    /// Length of `<len>;B:<bytes>`
    Skip(usize),
    NotAString,
}

/// Measure a string field from just after its `S:U:` tag.
fn string_extent(after: &[u8]) -> Extent {
    let digits = after.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == after.len() {
        return Extent::Incomplete;
    }
    if digits == 0 || after[digits] != b';' {
        return Extent::NotAString;
    }
    let Some(len) = std::str::from_utf8(&after[..digits])
        .ok()
        .and_then(|d| d.parse::<usize>().ok())
    else {
        return Extent::NotAString;
    };
    let tag = &after[digits + 1..];
    if tag.len() < 2 {
        return if b"B:".starts_with(tag) { Extent::Incomplete } else { Extent::NotAString };
    }
    if !tag.starts_with(b"B:") {
        return Extent::NotAString;
    }
    match (digits + 3).checked_add(len) {
        Some(end) if end <= after.len() => Extent::Skip(end),
        Some(_) => Extent::Incomplete,
        None => Extent::NotAString,
    }
}

fn preview(bytes: &[u8]) -> String {
    let shown = &bytes[..bytes.len().min(24)];
    String::from_utf8_lossy(shown).into_owned()
}
