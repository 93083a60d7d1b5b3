//! On-disk structures, all little-endian
//!
//! ```text
//! block 0          boot block: counts, 52 reserved bytes, 63 directory entries
//! blocks 1..=N     one inode per block: length, then 1023 data block indices
//! blocks N+1..     data blocks, addressed only through inodes
//! ```

use alloc::vec::Vec;

use crate::error::{Error, Result};

pub const BLOCK_SIZE: usize = 4096;
pub const MAX_NAME: usize = 32;
pub const MAX_ENTRIES: usize = 63;
pub const MAX_DATA_BLKS: usize = 1023;

const BOOT_HEADER_SIZE: usize = 64;
const ENTRY_SIZE: usize = 64;

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn put_u32(buf: &mut [u8], at: usize, val: u32) {
    buf[at..at + 4].copy_from_slice(&val.to_le_bytes());
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    name: [u8; MAX_NAME],
    pub inode: u32,
}

impl DirEntry {
    /// Names longer than 32 bytes are cut; shorter ones are NUL padded.
    pub fn new(name: &str, inode: u32) -> Self {
        let mut raw = [0u8; MAX_NAME];
        let len = name.len().min(MAX_NAME);
        raw[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self { name: raw, inode }
    }

    /// Bytes of the name up to the first NUL.
    pub fn name(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(MAX_NAME);
        &self.name[..len]
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootBlock {
    pub num_inodes: u32,
    pub num_data_blks: u32,
    pub entries: Vec<DirEntry>,
}

impl BootBlock {
    pub fn decode(block: &[u8]) -> Result<Self> {
        if block.len() < BLOCK_SIZE {
            return Err(Error::Io);
        }
        let num_entries = get_u32(block, 0) as usize;
        if num_entries > MAX_ENTRIES {
            return Err(Error::BadFormat);
        }
        let entries = (0..num_entries)
            .map(|i| {
                let at = BOOT_HEADER_SIZE + i * ENTRY_SIZE;
                let mut name = [0u8; MAX_NAME];
                name.copy_from_slice(&block[at..at + MAX_NAME]);
                DirEntry {
                    name,
                    inode: get_u32(block, at + MAX_NAME),
                }
            })
            .collect();
        Ok(Self {
            num_inodes: get_u32(block, 4),
            num_data_blks: get_u32(block, 8),
            entries,
        })
    }

    pub fn encode(&self, block: &mut [u8]) {
        block[..BLOCK_SIZE].fill(0);
        put_u32(block, 0, self.entries.len() as u32);
        put_u32(block, 4, self.num_inodes);
        put_u32(block, 8, self.num_data_blks);
        for (i, entry) in self.entries.iter().enumerate() {
            let at = BOOT_HEADER_SIZE + i * ENTRY_SIZE;
            block[at..at + MAX_NAME].copy_from_slice(&entry.name);
            put_u32(block, at + MAX_NAME, entry.inode);
        }
    }

    /// Inode number of `name`.
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.name() == name.as_bytes())
            .map(|e| e.inode)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inode {
    pub length: u32,
    pub blocks: [u32; MAX_DATA_BLKS],
}

impl Default for Inode {
    fn default() -> Self {
        Self {
            length: 0,
            blocks: [0; MAX_DATA_BLKS],
        }
    }
}

impl Inode {
    pub fn decode(block: &[u8]) -> Self {
        let mut inode = Self {
            length: get_u32(block, 0),
            ..Self::default()
        };
        for (i, blk) in inode.blocks.iter_mut().enumerate() {
            *blk = get_u32(block, 4 + 4 * i);
        }
        inode
    }

    pub fn encode(&self, block: &mut [u8]) {
        put_u32(block, 0, self.length);
        for (i, &blk) in self.blocks.iter().enumerate() {
            put_u32(block, 4 + 4 * i, blk);
        }
    }

    /// Data blocks needed to hold `length` bytes.
    pub fn blocks_for(length: u64) -> usize {
        (length as usize + BLOCK_SIZE - 1) / BLOCK_SIZE
    }

    pub fn block_count(&self) -> usize {
        Self::blocks_for(self.length as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn boot_block_field_offsets() {
        let boot = BootBlock {
            num_inodes: 2,
            num_data_blks: 5,
            entries: vec![DirEntry::new("hello", 1)],
        };
        let mut block = vec![0xaau8; BLOCK_SIZE];
        boot.encode(&mut block);
        assert_eq!(&block[0..12], &[1, 0, 0, 0, 2, 0, 0, 0, 5, 0, 0, 0]);
        assert_eq!(&block[64..69], b"hello");
        assert_eq!(block[69], 0);
        assert_eq!(get_u32(&block, 96), 1);
        assert_eq!(BootBlock::decode(&block).unwrap(), boot);
    }

    #[test]
    fn full_length_names_match() {
        let name = "abcdefghijklmnopqrstuvwxyz012345";
        let boot = BootBlock {
            entries: vec![DirEntry::new(name, 3)],
            ..BootBlock::default()
        };
        assert_eq!(boot.lookup(name), Some(3));
        assert_eq!(boot.lookup("abc"), None);
    }

    #[test]
    fn too_many_entries_is_bad_format() {
        let mut block = vec![0u8; BLOCK_SIZE];
        put_u32(&mut block, 0, 64);
        assert_eq!(BootBlock::decode(&block), Err(Error::BadFormat));
    }

    #[test]
    fn inode_rounds_blocks_up() {
        let mut inode = Inode::default();
        assert_eq!(inode.block_count(), 0);
        inode.length = 4096;
        assert_eq!(inode.block_count(), 1);
        inode.length = 4097;
        assert_eq!(inode.block_count(), 2);
        inode.blocks[1022] = 7;
        let mut block = vec![0u8; BLOCK_SIZE];
        inode.encode(&mut block);
        assert_eq!(get_u32(&block, BLOCK_SIZE - 4), 7);
        assert_eq!(Inode::decode(&block), inode);
    }
}
