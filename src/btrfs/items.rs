//! On-disk btrfs item layouts, viewed through zerocopy.
//!
//! Item payloads returned by tree-search are in the on-disk format,
//! which is little-endian and packed. The zerocopy byteorder types have
//! alignment 1, so these `repr(C)` structs match the disk layout exactly.

use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::DedupError;

// Item type codes.
pub const INODE_ITEM_KEY: u32 = 1;
pub const INODE_REF_KEY: u32 = 12;
pub const DIR_ITEM_KEY: u32 = 84;
pub const DIR_INDEX_KEY: u32 = 96;
pub const EXTENT_DATA_KEY: u32 = 108;
pub const ROOT_ITEM_KEY: u32 = 132;
pub const ROOT_BACKREF_KEY: u32 = 144;

// Well-known object ids.
pub const ROOT_TREE_OBJECTID: u64 = 1;
pub const FS_TREE_OBJECTID: u64 = 5;
pub const FIRST_FREE_OBJECTID: u64 = 256;

/// Root-item flag marking a read-only (frozen) snapshot.
pub const ROOT_SUBVOL_RDONLY: u64 = 1 << 0;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DiskTimespec {
    pub sec: U64,
    pub nsec: U32,
}

/// `struct btrfs_inode_item` (160 bytes).
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct InodeItem {
    pub generation: U64,
    pub transid: U64,
    pub size: U64,
    pub nbytes: U64,
    pub block_group: U64,
    pub nlink: U32,
    pub uid: U32,
    pub gid: U32,
    pub mode: U32,
    pub rdev: U64,
    pub flags: U64,
    pub sequence: U64,
    pub reserved: [U64; 4],
    pub atime: DiskTimespec,
    pub ctime: DiskTimespec,
    pub mtime: DiskTimespec,
    pub otime: DiskTimespec,
}

impl InodeItem {
    pub fn parse(buf: &[u8]) -> Result<&InodeItem, DedupError> {
        Ok(InodeItem::ref_from_prefix(buf)
            .map_err(|_| DedupError::Parse("short inode item"))?
            .0)
    }

    pub fn is_regular(&self) -> bool {
        self.mode.get() & S_IFMT == S_IFREG
    }
}

/// `struct btrfs_disk_key` (17 bytes, packed).
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DiskKey {
    pub objectid: U64,
    pub key_type: u8,
    pub offset: U64,
}

/// `struct btrfs_root_item`, legacy portion (through `level`).
/// Newer filesystems append v2 fields; parsing by prefix covers both.
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RootItem {
    pub inode: InodeItem,
    pub generation: U64,
    pub root_dirid: U64,
    pub bytenr: U64,
    pub byte_limit: U64,
    pub bytes_used: U64,
    pub last_snapshot: U64,
    pub flags: U64,
    pub refs: U32,
    pub drop_progress: DiskKey,
    pub drop_level: u8,
    pub level: u8,
}

impl RootItem {
    pub fn parse(buf: &[u8]) -> Result<&RootItem, DedupError> {
        Ok(RootItem::ref_from_prefix(buf)
            .map_err(|_| DedupError::Parse("short root item"))?
            .0)
    }

    pub fn is_frozen(&self) -> bool {
        self.flags.get() & ROOT_SUBVOL_RDONLY != 0
    }
}

/// `struct btrfs_root_ref` (18 bytes), followed by the directory-entry name.
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RootRef {
    pub dirid: U64,
    pub sequence: U64,
    pub name_len: U16,
}

impl RootRef {
    /// Parse the fixed part and the trailing name.
    pub fn parse(buf: &[u8]) -> Result<(&RootRef, &[u8]), DedupError> {
        let (rref, rest) =
            RootRef::ref_from_prefix(buf).map_err(|_| DedupError::Parse("short root ref"))?;
        let name_len = rref.name_len.get() as usize;
        if rest.len() < name_len {
            return Err(DedupError::Parse("root ref name out of bounds"));
        }
        Ok((rref, &rest[..name_len]))
    }
}

/// `struct btrfs_inode_ref` (10 bytes), followed by the link name.
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct InodeRef {
    pub index: U64,
    pub name_len: U16,
}

impl InodeRef {
    pub fn parse(buf: &[u8]) -> Result<(&InodeRef, &[u8]), DedupError> {
        let (iref, rest) =
            InodeRef::ref_from_prefix(buf).map_err(|_| DedupError::Parse("short inode ref"))?;
        let name_len = iref.name_len.get() as usize;
        if rest.len() < name_len {
            return Err(DedupError::Parse("inode ref name out of bounds"));
        }
        Ok((iref, &rest[..name_len]))
    }
}

/// `struct btrfs_dir_item` (30 bytes), followed by the entry name.
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DirItem {
    pub location: DiskKey,
    pub transid: U64,
    pub data_len: U16,
    pub name_len: U16,
    pub dir_type: u8,
}

impl DirItem {
    pub fn parse(buf: &[u8]) -> Result<(&DirItem, &[u8]), DedupError> {
        let (item, rest) =
            DirItem::ref_from_prefix(buf).map_err(|_| DedupError::Parse("short dir item"))?;
        let name_len = item.name_len.get() as usize;
        if rest.len() < name_len {
            return Err(DedupError::Parse("dir item name out of bounds"));
        }
        Ok((item, &rest[..name_len]))
    }
}

/// Leading fields shared by all `btrfs_file_extent_item` variants.
/// Inline extents stop after `extent_type`; only this prefix is safe
/// to read unconditionally.
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FileExtentHeader {
    pub generation: U64,
    pub ram_bytes: U64,
    pub compression: u8,
    pub encryption: u8,
    pub other_encoding: U16,
    pub extent_type: u8,
}

impl FileExtentHeader {
    pub fn parse(buf: &[u8]) -> Result<&FileExtentHeader, DedupError> {
        Ok(FileExtentHeader::ref_from_prefix(buf)
            .map_err(|_| DedupError::Parse("short file extent item"))?
            .0)
    }
}
