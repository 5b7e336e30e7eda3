//! In-memory file tree behind the loopback server.
//!
//! ```text
//! / (node 0)
//! ├── notes/      directory
//! │   └── a.md    file, revision 3
//! └── b.md        file, revision 0
//! ```
//!
//! Every successful mutation of a file advances its revision by one, and a
//! mutation that names any other revision is refused with `RevisionTooOld`.

use std::collections::{BTreeMap, HashMap};

use crate::edit::EditOperation;
use crate::error::ErrorCode;
use crate::protocol::{Authority, AuthorityKind, Block, FileKind, FsElement, NodeId, Revision};

pub const ROOT: NodeId = 0;

/// Content and bookkeeping of one file.
#[derive(Debug, Clone)]
pub struct FileNode {
    pub kind: FileKind,
    pub revision: Revision,
    pub content: Vec<u8>,
    /// Connections currently holding the file open
    pub open_count: usize,
}

#[derive(Debug, Clone)]
enum NodeData {
    Directory { children: BTreeMap<String, NodeId> },
    File(FileNode),
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    parent: Option<NodeId>,
    data: NodeData,
}

#[derive(Debug)]
pub struct FileTree {
    nodes: HashMap<NodeId, Node>,
    next_id: NodeId,
}

impl Default for FileTree {
    fn default() -> Self {
        Self::new()
    }
}

fn everyone() -> Authority {
    Authority { kind: AuthorityKind::Group, name: "everyone".to_string() }
}

fn valid_name(name: &str) -> Result<(), ErrorCode> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(ErrorCode::InvalidPath);
    }
    Ok(())
}

impl FileTree {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT,
            Node {
                name: "/".to_string(),
                parent: None,
                data: NodeData::Directory { children: BTreeMap::new() },
            },
        );
        Self { nodes, next_id: ROOT + 1 }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Bytes held by all files.
    pub fn total_bytes(&self) -> u64 {
        self.nodes
            .values()
            .map(|node| match &node.data {
                NodeData::File(file) => file.content.len() as u64,
                NodeData::Directory { .. } => 0,
            })
            .sum()
    }

    /// Node id of an absolute `/`-separated path.
    pub fn resolve(&self, path: &str) -> Result<NodeId, ErrorCode> {
        if !path.starts_with('/') {
            return Err(ErrorCode::InvalidPath);
        }
        let mut current = ROOT;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let node = self.nodes.get(&current).ok_or(ErrorCode::InvalidNodeId)?;
            let NodeData::Directory { children } = &node.data else {
                return Err(ErrorCode::NodeIsNotDirectory);
            };
            current = *children.get(part).ok_or(ErrorCode::InvalidPath)?;
        }
        Ok(current)
    }

    pub fn children(&self, path: &str) -> Result<Vec<FsElement>, ErrorCode> {
        let id = self.resolve(path)?;
        let node = self.nodes.get(&id).ok_or(ErrorCode::InvalidNodeId)?;
        let NodeData::Directory { children } = &node.data else {
            return Err(ErrorCode::NodeIsNotDirectory);
        };
        Ok(children
            .values()
            .filter_map(|child_id| {
                let child = self.nodes.get(child_id)?;
                Some(match &child.data {
                    NodeData::File(file) => FsElement::File {
                        name: child.name.clone(),
                        node_id: *child_id,
                        revision: file.revision,
                        kind: file.kind,
                        size: file.content.len() as u64,
                        is_open: file.open_count > 0,
                    },
                    NodeData::Directory { .. } => FsElement::Directory {
                        name: child.name.clone(),
                        node_id: *child_id,
                        read: everyone(),
                        write: everyone(),
                    },
                })
            })
            .collect())
    }

    fn insert_node(&mut self, parent_path: &str, name: &str, data: NodeData) -> Result<NodeId, ErrorCode> {
        valid_name(name)?;
        let parent = self.resolve(parent_path)?;
        let id = self.next_id;
        let parent_node = self.nodes.get_mut(&parent).ok_or(ErrorCode::InvalidNodeId)?;
        let NodeData::Directory { children } = &mut parent_node.data else {
            return Err(ErrorCode::FsParentIsNotDirectory);
        };
        if children.contains_key(name) {
            return Err(ErrorCode::ElementWithNameAlreadyExists);
        }
        children.insert(name.to_string(), id);
        self.nodes.insert(id, Node { name: name.to_string(), parent: Some(parent), data });
        self.next_id += 1;
        Ok(id)
    }

    /// Create an empty file at revision 0.
    pub fn create_file(&mut self, parent: &str, name: &str, kind: FileKind) -> Result<(NodeId, Revision), ErrorCode> {
        let file = FileNode { kind, revision: 0, content: Vec::new(), open_count: 0 };
        let id = self.insert_node(parent, name, NodeData::File(file))?;
        Ok((id, 0))
    }

    pub fn create_directory(&mut self, parent: &str, name: &str) -> Result<NodeId, ErrorCode> {
        self.insert_node(parent, name, NodeData::Directory { children: BTreeMap::new() })
    }

    /// Remove a closed file or an empty directory.
    pub fn delete(&mut self, id: NodeId) -> Result<(), ErrorCode> {
        if id == ROOT {
            return Err(ErrorCode::UnauthorizedOperation);
        }
        let node = self.nodes.get(&id).ok_or(ErrorCode::InvalidNodeId)?;
        match &node.data {
            NodeData::Directory { children } if !children.is_empty() => {
                return Err(ErrorCode::DirectoryIsNotEmpty)
            }
            NodeData::File(file) if file.open_count > 0 => return Err(ErrorCode::FileLockedByOtherUser),
            _ => {}
        }
        let (name, parent) = (node.name.clone(), node.parent);
        if let Some(Node { data: NodeData::Directory { children }, .. }) =
            parent.and_then(|p| self.nodes.get_mut(&p))
        {
            children.remove(&name);
        }
        self.nodes.remove(&id);
        Ok(())
    }

    pub fn file(&self, id: NodeId) -> Result<&FileNode, ErrorCode> {
        match self.nodes.get(&id).map(|n| &n.data) {
            Some(NodeData::File(file)) => Ok(file),
            Some(NodeData::Directory { .. }) => Err(ErrorCode::NodeIsNotFile),
            None => Err(ErrorCode::UnknownFile),
        }
    }

    pub fn file_mut(&mut self, id: NodeId) -> Result<&mut FileNode, ErrorCode> {
        match self.nodes.get_mut(&id).map(|n| &mut n.data) {
            Some(NodeData::File(file)) => Ok(file),
            Some(NodeData::Directory { .. }) => Err(ErrorCode::NodeIsNotFile),
            None => Err(ErrorCode::UnknownFile),
        }
    }

    /// Bytes of `block`, which must lie inside the file.
    pub fn read(&self, id: NodeId, block: Block) -> Result<(Revision, Vec<u8>), ErrorCode> {
        let file = self.file(id)?;
        let end = block
            .offset
            .checked_add(block.size)
            .filter(|end| *end <= file.content.len() as u64)
            .ok_or(ErrorCode::OffsetAndSizeDoNotMapToPartOfFile)?;
        Ok((file.revision, file.content[block.offset as usize..end as usize].to_vec()))
    }

    /// Check that `revision` is current without changing anything.
    pub fn check_revision(&self, id: NodeId, revision: Revision) -> Result<(), ErrorCode> {
        if self.file(id)?.revision != revision {
            return Err(ErrorCode::RevisionTooOld);
        }
        Ok(())
    }

    /// Apply one edit at `revision`, returning the new revision.
    pub fn apply(&mut self, id: NodeId, revision: Revision, operation: &EditOperation) -> Result<Revision, ErrorCode> {
        let file = self.file_mut(id)?;
        if file.revision != revision {
            return Err(ErrorCode::RevisionTooOld);
        }
        operation
            .apply(&mut file.content)
            .map_err(|_| ErrorCode::OffsetAndSizeDoNotMapToPartOfFile)?;
        file.revision += 1;
        Ok(file.revision)
    }
}
