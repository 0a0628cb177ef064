//! The IFS boot image format.
//!
//! A flat read-only file system embedded in the boot image:
//!
//! ```text
//! magic[4]="MAGC"  node_table_offset:u32  node_cnt:i32  ifs_size:u32
//! IFSNode { name[32]; ino:i32; parent_ino:i32; perm:u32; uid:i32; gid:i32;
//!           file_offset:u32; file_size:u32 } x node_cnt
//! ```
//!
//! All fields little-endian. The kernel hands the IFS server the image's
//! base and size; the server resolves names by scanning the node table
//! and serves file bytes straight out of the image.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use cheviot_core::Errno;

/// Image magic.
pub const IFS_MAGIC: [u8; 4] = *b"MAGC";

/// Size of the image header.
pub const IFS_HEADER_SZ: usize = 16;

/// Size of one node record: a 32-byte name field plus seven 32-bit
/// fields.
pub const IFS_NODE_SZ: usize = 60;

/// Maximum node name length (NUL-padded in the record).
pub const IFS_NAME_SZ: usize = 32;

/// One node of an IFS image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfsNode {
    /// Entry name (empty for the root node).
    pub name: String,
    /// Inode number (index into the node table).
    pub ino: i32,
    /// Parent inode number.
    pub parent_ino: i32,
    /// Type and permission bits.
    pub perm: u32,
    /// Owner.
    pub uid: i32,
    /// Group.
    pub gid: i32,
    /// Byte offset of file contents within the image.
    pub file_offset: u32,
    /// File size in bytes.
    pub file_size: u32,
}

/// A parsed IFS image.
pub struct IfsImage {
    image: Vec<u8>,
    nodes: Vec<IfsNode>,
}

impl IfsImage {
    /// Parses an image, validating magic, header bounds and the node
    /// table.
    ///
    /// # Errors
    ///
    /// `EINVAL` for a bad magic or an inconsistent header.
    pub fn parse(image: Vec<u8>) -> Result<Self, Errno> {
        if image.len() < IFS_HEADER_SZ || image[0..4] != IFS_MAGIC {
            return Err(Errno::EINVAL);
        }
        let node_table_offset =
            u32::from_le_bytes(image[4..8].try_into().expect("4 bytes")) as usize;
        let node_cnt = i32::from_le_bytes(image[8..12].try_into().expect("4 bytes"));
        let ifs_size = u32::from_le_bytes(image[12..16].try_into().expect("4 bytes")) as usize;

        if node_cnt < 0 || ifs_size > image.len() {
            return Err(Errno::EINVAL);
        }
        let node_cnt = node_cnt as usize;
        let table_end = node_table_offset
            .checked_add(node_cnt * IFS_NODE_SZ)
            .ok_or(Errno::EINVAL)?;
        if table_end > image.len() {
            return Err(Errno::EINVAL);
        }

        let mut nodes = Vec::with_capacity(node_cnt);
        for i in 0..node_cnt {
            let base = node_table_offset + i * IFS_NODE_SZ;
            let rec = &image[base..base + IFS_NODE_SZ];
            let name_end = rec[..IFS_NAME_SZ]
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(IFS_NAME_SZ);
            let name = core::str::from_utf8(&rec[..name_end])
                .map_err(|_| Errno::EINVAL)?;
            nodes.push(IfsNode {
                name: String::from(name),
                ino: i32::from_le_bytes(rec[32..36].try_into().expect("4 bytes")),
                parent_ino: i32::from_le_bytes(rec[36..40].try_into().expect("4 bytes")),
                perm: u32::from_le_bytes(rec[40..44].try_into().expect("4 bytes")),
                uid: i32::from_le_bytes(rec[44..48].try_into().expect("4 bytes")),
                gid: i32::from_le_bytes(rec[48..52].try_into().expect("4 bytes")),
                file_offset: u32::from_le_bytes(rec[52..56].try_into().expect("4 bytes")),
                file_size: u32::from_le_bytes(rec[56..60].try_into().expect("4 bytes")),
            });
        }
        Ok(Self { image, nodes })
    }

    /// The node table.
    pub fn nodes(&self) -> &[IfsNode] {
        &self.nodes
    }

    /// The node with inode number `ino`.
    pub fn node(&self, ino: i64) -> Option<&IfsNode> {
        self.nodes.iter().find(|n| i64::from(n.ino) == ino)
    }

    /// Finds `name` in the directory with inode `dir_ino`.
    pub fn lookup(&self, dir_ino: i64, name: &str) -> Option<&IfsNode> {
        self.nodes
            .iter()
            .find(|n| i64::from(n.parent_ino) == dir_ino && n.name == name && n.ino as i64 != dir_ino)
    }

    /// Children of the directory with inode `dir_ino`, in table order.
    pub fn children(&self, dir_ino: i64) -> impl Iterator<Item = &IfsNode> {
        self.nodes
            .iter()
            .filter(move |n| i64::from(n.parent_ino) == dir_ino && i64::from(n.ino) != dir_ino)
    }

    /// File bytes of a node, clamped to `[offset, offset + len)`.
    pub fn file_data(&self, node: &IfsNode, offset: u64, len: usize) -> &[u8] {
        let start = node.file_offset as u64 + offset.min(node.file_size as u64);
        let remaining = (node.file_size as u64).saturating_sub(offset.min(node.file_size as u64));
        let n = (remaining as usize).min(len);
        &self.image[start as usize..start as usize + n]
    }
}

/// Builds IFS images for boot and for tests, the way the host-side image
/// tool lays them out: header, file data, node table at the tail.
pub struct IfsImageBuilder {
    nodes: Vec<IfsNode>,
    data: Vec<u8>,
}

impl IfsImageBuilder {
    /// Starts an image containing only the root directory (inode 0).
    pub fn new() -> Self {
        Self {
            nodes: vec![IfsNode {
                name: String::new(),
                ino: 0,
                parent_ino: 0,
                perm: crate::stat::S_IFDIR | 0o755,
                uid: 0,
                gid: 0,
                file_offset: 0,
                file_size: 0,
            }],
            data: Vec::new(),
        }
    }

    /// Adds a directory under `parent_ino`; returns its inode.
    pub fn add_dir(&mut self, parent_ino: i32, name: &str) -> i32 {
        let ino = self.nodes.len() as i32;
        self.nodes.push(IfsNode {
            name: String::from(name),
            ino,
            parent_ino,
            perm: crate::stat::S_IFDIR | 0o755,
            uid: 0,
            gid: 0,
            file_offset: 0,
            file_size: 0,
        });
        ino
    }

    /// Adds a regular file under `parent_ino`; returns its inode.
    pub fn add_file(&mut self, parent_ino: i32, name: &str, contents: &[u8]) -> i32 {
        let ino = self.nodes.len() as i32;
        let file_offset = (IFS_HEADER_SZ + self.data.len()) as u32;
        self.data.extend_from_slice(contents);
        self.nodes.push(IfsNode {
            name: String::from(name),
            ino,
            parent_ino,
            perm: crate::stat::S_IFREG | 0o644,
            uid: 0,
            gid: 0,
            file_offset,
            file_size: contents.len() as u32,
        });
        ino
    }

    /// Serializes the image.
    pub fn build(self) -> Vec<u8> {
        let node_table_offset = IFS_HEADER_SZ + self.data.len();
        let total = node_table_offset + self.nodes.len() * IFS_NODE_SZ;
        let mut image = Vec::with_capacity(total);

        image.extend_from_slice(&IFS_MAGIC);
        image.extend_from_slice(&(node_table_offset as u32).to_le_bytes());
        image.extend_from_slice(&(self.nodes.len() as i32).to_le_bytes());
        image.extend_from_slice(&(total as u32).to_le_bytes());
        image.extend_from_slice(&self.data);

        for node in &self.nodes {
            let mut rec = [0u8; IFS_NODE_SZ];
            let name = node.name.as_bytes();
            let n = name.len().min(IFS_NAME_SZ - 1);
            rec[..n].copy_from_slice(&name[..n]);
            rec[32..36].copy_from_slice(&node.ino.to_le_bytes());
            rec[36..40].copy_from_slice(&node.parent_ino.to_le_bytes());
            rec[40..44].copy_from_slice(&node.perm.to_le_bytes());
            rec[44..48].copy_from_slice(&node.uid.to_le_bytes());
            rec[48..52].copy_from_slice(&node.gid.to_le_bytes());
            rec[52..56].copy_from_slice(&node.file_offset.to_le_bytes());
            rec[56..60].copy_from_slice(&node.file_size.to_le_bytes());
            image.extend_from_slice(&rec);
        }
        image
    }
}

impl Default for IfsImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}
