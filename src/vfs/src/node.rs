use std::collections::BTreeMap;

/// Index into the filesystem's node slab. Nodes are never deallocated
/// while the emulator runs; unlink only detaches a node from its parent,
/// so open handles keep their target alive for free.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Regular,
    Directory,
    Symlink,
    Fifo,
    CharDev,
    BlockDev,
    Socket,
}

impl NodeKind {
    /// Linux `d_type` value for dirent64 records.
    pub fn dirent_type(self) -> u8 {
        match self {
            NodeKind::Regular => 8,
            NodeKind::Directory => 4,
            NodeKind::Symlink => 10,
            NodeKind::Fifo => 1,
            NodeKind::CharDev => 2,
            NodeKind::BlockDev => 6,
            NodeKind::Socket => 12,
        }
    }

    /// `S_IFMT` bits for stat.
    pub fn mode_bits(self) -> u32 {
        match self {
            NodeKind::Regular => libc::S_IFREG as u32,
            NodeKind::Directory => libc::S_IFDIR as u32,
            NodeKind::Symlink => libc::S_IFLNK as u32,
            NodeKind::Fifo => libc::S_IFIFO as u32,
            NodeKind::CharDev => libc::S_IFCHR as u32,
            NodeKind::BlockDev => libc::S_IFBLK as u32,
            NodeKind::Socket => libc::S_IFSOCK as u32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    /// Permission bits only; the type lives in `kind`.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    /// File bytes for `Regular`; the in-flight buffer for `Fifo` (drained
    /// from the front by reads).
    pub content: Vec<u8>,
    pub link_target: String,
    /// Children by name. BTreeMap keeps listings lexicographic, which the
    /// dirent iterator relies on.
    pub children: BTreeMap<String, NodeId>,
}

impl Node {
    pub fn new(kind: NodeKind, mode: u32) -> Node {
        Node {
            kind,
            mode,
            uid: 0,
            gid: 0,
            mtime: 0,
            content: Vec::new(),
            link_target: String::new(),
            children: BTreeMap::new(),
        }
    }

    pub fn directory(mode: u32) -> Node {
        Node::new(NodeKind::Directory, mode)
    }

    pub fn regular(mode: u32, content: Vec<u8>) -> Node {
        let mut n = Node::new(NodeKind::Regular, mode);
        n.content = content;
        n
    }

    pub fn symlink(target: &str) -> Node {
        let mut n = Node::new(NodeKind::Symlink, 0o777);
        n.link_target = target.to_string();
        n
    }

    pub fn size(&self) -> u64 {
        match self.kind {
            NodeKind::Symlink => self.link_target.len() as u64,
            _ => self.content.len() as u64,
        }
    }
}
