//! Paginated reads.
//!
//! A range is fetched as a sequence of blocks that never cross a page
//! boundary, one request at a time:
//!
//! ```text
//! page_size = 10, offset = 7, size = 18
//!
//!   0         10        20        30
//!   |---------|---------|---------|
//!          [7,10)[10,20)[20,25)
//! ```
//!
//! `PagedRead` only plans blocks and accumulates responses; driving it over
//! a connection is `Connection::read_range`.

use crate::error::ClientError;
use crate::protocol::{Block, NodeId, Request, Response, ResponseBody, Revision};

/// Bytes of a completed read and the newest revision reported for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub data: Vec<u8>,
    /// `None` when the range was empty and nothing was requested
    pub revision: Option<Revision>,
}

/// Size of the block starting at `offset` with `remaining` bytes left.
fn block_size_at(offset: u64, remaining: u64, page_size: u64) -> u64 {
    remaining.min(page_size - offset % page_size)
}

/// Split `[offset, offset + size)` into page-bounded blocks.
pub fn plan_blocks(offset: u64, size: u64, page_size: u64) -> Vec<Block> {
    let mut blocks = Vec::new();
    if page_size == 0 {
        return blocks;
    }
    let end = offset + size;
    let mut at = offset;
    while at < end {
        let len = block_size_at(at, end - at, page_size);
        blocks.push(Block::new(at, len));
        at += len;
    }
    blocks
}

/// State of one paginated read.
#[derive(Debug)]
pub struct PagedRead {
    node_id: NodeId,
    next_offset: u64,
    end: u64,
    page_size: u64,
    data: Vec<u8>,
    revision: Option<Revision>,
    in_flight: Option<Block>,
}

impl PagedRead {
    pub fn new(node_id: NodeId, offset: u64, size: u64, page_size: u64) -> Result<Self, ClientError> {
        if page_size == 0 {
            return Err(ClientError::Protocol("page size of zero".to_string()));
        }
        let end = offset
            .checked_add(size)
            .ok_or_else(|| ClientError::Protocol("read range overflows".to_string()))?;
        Ok(Self {
            node_id,
            next_offset: offset,
            end,
            page_size,
            data: Vec::with_capacity(size.min(1 << 20) as usize),
            revision: None,
            in_flight: None,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.next_offset >= self.end && self.in_flight.is_none()
    }

    /// Request for the next block, or `None` once everything was requested.
    pub fn next_request(&mut self) -> Option<Request> {
        if self.in_flight.is_some() || self.next_offset >= self.end {
            return None;
        }
        let size = block_size_at(self.next_offset, self.end - self.next_offset, self.page_size);
        let block = Block::new(self.next_offset, size);
        self.in_flight = Some(block);
        Some(Request::Read { node_id: self.node_id, block })
    }

    /// Account for the response to the block in flight.
    ///
    /// Any error aborts the read; the caller drops the partial state.
    pub fn accept(&mut self, response: Response) -> Result<(), ClientError> {
        let requested = self
            .in_flight
            .take()
            .ok_or_else(|| ClientError::Protocol("read response without a block in flight".to_string()))?;
        let response = response.into_result()?;
        match response.body {
            ResponseBody::Read { revision, block, data } => {
                if block != requested || data.len() as u64 != requested.size {
                    return Err(ClientError::Protocol(format!(
                        "asked for {} bytes at {}, got {} bytes at {}",
                        requested.size,
                        requested.offset,
                        data.len(),
                        block.offset
                    )));
                }
                self.data.extend_from_slice(&data);
                self.revision = Some(revision);
                self.next_offset = requested.end();
                Ok(())
            }
            other => Err(ClientError::Protocol(format!("unexpected read body {other:?}"))),
        }
    }

    pub fn finish(self) -> ReadResult {
        ReadResult {
            data: self.data,
            revision: self.revision,
        }
    }
}
