//! Flat filesystem over a block device
//!
//! One directory in the boot block, one inode per file, data blocks handed
//! out in order from the boot block's counter and never reclaimed.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

use super::layout::{BootBlock, Inode, BLOCK_SIZE, MAX_DATA_BLKS};
use crate::arena::{Arena, Handle};
use crate::config::MAX_OPEN_FILES;
use crate::error::{Error, Result};
use crate::io::{read_full, seek, write_full, Io, Ioctl};

#[derive(Copy, Clone, Debug)]
struct FileDesc {
    pos: u64,
    inode: u32,
}

struct Kfs {
    dev: Box<dyn Io>,
    boot: BootBlock,
    data_start: u64,
    files: Arena<FileDesc, MAX_OPEN_FILES>,
    /// one block of staging space
    scratch: Vec<u8>,
}

/// A mounted filesystem. Clones share the same mount.
#[derive(Clone)]
pub struct FileSystem {
    inner: Rc<RefCell<Kfs>>,
}

impl FileSystem {
    /// Reads the boot block of `dev` and takes the device over.
    pub fn mount(mut dev: Box<dyn Io>) -> Result<Self> {
        let mut scratch = vec![0u8; BLOCK_SIZE];
        seek(&mut dev, 0)?;
        if read_full(&mut dev, &mut scratch)? != BLOCK_SIZE {
            return Err(Error::Io);
        }
        let boot = BootBlock::decode(&scratch)?;
        let data_start = (boot.num_inodes as u64 + 1) * BLOCK_SIZE as u64;
        info!(
            "kfs: {} files, {} inodes, {} data blocks",
            boot.entries.len(),
            boot.num_inodes,
            boot.num_data_blks
        );
        Ok(Self {
            inner: Rc::new(RefCell::new(Kfs {
                dev,
                boot,
                data_start,
                files: Arena::new(),
                scratch,
            })),
        })
    }

    /// Opens `name` positioned at its start.
    pub fn open(&self, name: &str) -> Result<FileHandle> {
        let mut fs = self.inner.borrow_mut();
        let inode_no = fs.boot.lookup(name).ok_or(Error::NotFound)?;
        fs.read_inode(inode_no)?;
        let slot = fs
            .files
            .insert(FileDesc {
                pos: 0,
                inode: inode_no,
            })
            .ok_or(Error::TooManyOpenFiles)?;
        debug!("kfs: open {} -> inode {}, slot {}", name, inode_no, slot.index());
        Ok(FileHandle {
            fs: self.inner.clone(),
            slot: Some(slot),
        })
    }

    pub fn open_files(&self) -> usize {
        self.inner.borrow().files.len()
    }

    /// Gives the backing device back once no file is open.
    pub fn unmount(self) -> core::result::Result<Box<dyn Io>, Self> {
        if self.open_files() != 0 {
            return Err(self);
        }
        match Rc::try_unwrap(self.inner) {
            Ok(inner) => Ok(inner.into_inner().dev),
            Err(inner) => Err(Self { inner }),
        }
    }
}

impl Kfs {
    fn desc(&self, h: Handle) -> Result<FileDesc> {
        self.files.get(h).copied().ok_or(Error::BadDescriptor)
    }

    fn read_block(&mut self, at: u64) -> Result<()> {
        seek(&mut self.dev, at)?;
        match read_full(&mut self.dev, &mut self.scratch)? {
            BLOCK_SIZE => Ok(()),
            _ => Err(Error::Io),
        }
    }

    fn write_block(&mut self, at: u64) -> Result<()> {
        seek(&mut self.dev, at)?;
        match write_full(&mut self.dev, &self.scratch)? {
            BLOCK_SIZE => Ok(()),
            _ => Err(Error::Io),
        }
    }

    fn inode_pos(inode_no: u32) -> u64 {
        (1 + inode_no as u64) * BLOCK_SIZE as u64
    }

    /// The on-disk inode is the only record of a file's length; every open
    /// descriptor of the file sees the same one.
    fn read_inode(&mut self, inode_no: u32) -> Result<Inode> {
        if inode_no >= self.boot.num_inodes {
            return Err(Error::BadFormat);
        }
        self.read_block(Self::inode_pos(inode_no))?;
        let inode = Inode::decode(&self.scratch);
        if inode.block_count() > MAX_DATA_BLKS {
            warn!("kfs: inode {} claims {} bytes", inode_no, inode.length);
            return Err(Error::BadFormat);
        }
        Ok(inode)
    }

    fn data_pos(&self, inode: &Inode, lblk: usize) -> u64 {
        self.data_start + inode.blocks[lblk] as u64 * BLOCK_SIZE as u64
    }

    fn read(&mut self, h: Handle, buf: &mut [u8]) -> Result<usize> {
        let fd = self.desc(h)?;
        let inode = self.read_inode(fd.inode)?;
        let left = (inode.length as u64).saturating_sub(fd.pos);
        let n = (buf.len() as u64).min(left) as usize;
        let mut done = 0;
        while done < n {
            let at = fd.pos as usize + done;
            let (lblk, off) = (at / BLOCK_SIZE, at % BLOCK_SIZE);
            let len = (BLOCK_SIZE - off).min(n - done);
            self.read_block(self.data_pos(&inode, lblk))?;
            buf[done..done + len].copy_from_slice(&self.scratch[off..off + len]);
            done += len;
        }
        if let Some(fd) = self.files.get_mut(h) {
            fd.pos += n as u64;
        }
        Ok(n)
    }

    /// Grows the file to `end` bytes, taking fresh data blocks from the boot
    /// block counter. Boot block and inode reach the disk before any data.
    /// A file never shrinks here.
    fn grow(&mut self, inode_no: u32, inode: &mut Inode, end: u64) -> Result<()> {
        if end <= inode.length as u64 {
            return Ok(());
        }
        let have = inode.block_count();
        let need = Inode::blocks_for(end);
        if need > MAX_DATA_BLKS {
            return Err(Error::FileTooLarge);
        }
        let extra = need.saturating_sub(have) as u64;
        let capacity = self.dev.ioctl(Ioctl::GetLen)?;
        let used = self.boot.num_data_blks as u64;
        if self.data_start + (used + extra) * BLOCK_SIZE as u64 > capacity {
            return Err(Error::NoSpace);
        }
        for lblk in have..need {
            inode.blocks[lblk] = self.boot.num_data_blks;
            self.boot.num_data_blks += 1;
        }
        inode.length = end as u32;

        if extra > 0 {
            self.boot.encode(&mut self.scratch);
            self.write_block(0)?;
        }
        self.scratch.fill(0);
        inode.encode(&mut self.scratch);
        self.write_block(Self::inode_pos(inode_no))
    }

    fn write(&mut self, h: Handle, buf: &[u8]) -> Result<usize> {
        let fd = self.desc(h)?;
        let n = buf.len();
        if n == 0 {
            return Ok(0);
        }
        let end = fd.pos + n as u64;
        let mut inode = self.read_inode(fd.inode)?;
        let fresh_from = inode.block_count();
        self.grow(fd.inode, &mut inode, end)?;

        let mut done = 0;
        while done < n {
            let at = fd.pos as usize + done;
            let (lblk, off) = (at / BLOCK_SIZE, at % BLOCK_SIZE);
            let len = (BLOCK_SIZE - off).min(n - done);
            let pos = self.data_pos(&inode, lblk);
            if lblk >= fresh_from {
                self.scratch.fill(0);
            } else if len != BLOCK_SIZE {
                self.read_block(pos)?;
            }
            self.scratch[off..off + len].copy_from_slice(&buf[done..done + len]);
            self.write_block(pos)?;
            done += len;
        }
        if let Some(fd) = self.files.get_mut(h) {
            fd.pos += n as u64;
        }
        Ok(n)
    }

    fn ioctl(&mut self, h: Handle, cmd: Ioctl) -> Result<u64> {
        let fd = self.desc(h)?;
        match cmd {
            Ioctl::GetLen => Ok(self.read_inode(fd.inode)?.length as u64),
            Ioctl::GetPos => Ok(fd.pos),
            Ioctl::SetPos(pos) => {
                let size = self.read_inode(fd.inode)?.length as u64;
                if let Some(fd) = self.files.get_mut(h) {
                    fd.pos = pos.min(size);
                }
                Ok(0)
            }
            Ioctl::GetBlkSz => Ok(BLOCK_SIZE as u64),
            Ioctl::SetLen(_) | Ioctl::Flush => Err(Error::NotSupported),
        }
    }
}

/// One open file. Dropping it closes the descriptor.
pub struct FileHandle {
    fs: Rc<RefCell<Kfs>>,
    slot: Option<Handle>,
}

impl FileHandle {
    fn slot(&self) -> Result<Handle> {
        self.slot.ok_or(Error::BadDescriptor)
    }
}

impl Io for FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let slot = self.slot()?;
        self.fs.borrow_mut().read(slot, buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let slot = self.slot()?;
        self.fs.borrow_mut().write(slot, buf)
    }

    fn ioctl(&mut self, cmd: Ioctl) -> Result<u64> {
        let slot = self.slot()?;
        self.fs.borrow_mut().ioctl(slot, cmd)
    }

    fn close(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.fs.borrow_mut().files.remove(slot);
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::VioBlk;
    use crate::io::MemIo;
    use crate::testing::{ImageBuilder, MockBlk, TestCondition, TestIntc};

    fn mount(image: Vec<u8>) -> FileSystem {
        FileSystem::mount(Box::new(MemIo::new(image))).unwrap()
    }

    #[test]
    fn hello_reads_to_eof() {
        let fs = mount(ImageBuilder::new().file("hello", b"0123456789").build());
        let mut file = fs.open("hello").unwrap();
        let mut buf = [0u8; 20];
        assert_eq!(file.read(&mut buf), Ok(10));
        assert_eq!(&buf[..10], b"0123456789");
        assert_eq!(file.read(&mut buf[..5]), Ok(0));
    }

    #[test]
    fn missing_file_takes_no_slot() {
        let fs = mount(ImageBuilder::new().file("a", b"x").build());
        assert_eq!(fs.open("b").err(), Some(Error::NotFound));
        assert_eq!(fs.open_files(), 0);
        let handles: Vec<_> = (0..MAX_OPEN_FILES).map(|_| fs.open("a").unwrap()).collect();
        assert_eq!(fs.open("a").err(), Some(Error::TooManyOpenFiles));
        drop(handles);
        assert_eq!(fs.open_files(), 0);
        assert!(fs.open("a").is_ok());
    }

    #[test]
    fn seek_past_end_clamps() {
        let fs = mount(ImageBuilder::new().file("f", b"abcdef").build());
        let mut file = fs.open("f").unwrap();
        assert_eq!(file.ioctl(Ioctl::SetPos(100)), Ok(0));
        assert_eq!(file.ioctl(Ioctl::GetPos), Ok(6));
        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf), Ok(0));
        assert_eq!(file.ioctl(Ioctl::GetBlkSz), Ok(BLOCK_SIZE as u64));
        assert_eq!(file.ioctl(Ioctl::SetLen(0)), Err(Error::NotSupported));
    }

    #[test]
    fn reads_follow_inode_indirection() {
        let contents: Vec<u8> = (0..3 * BLOCK_SIZE + 17).map(|i| (i % 253) as u8).collect();
        let fs = mount(ImageBuilder::new().file("big", &contents).build());
        let mut file = fs.open("big").unwrap();
        file.ioctl(Ioctl::SetPos(BLOCK_SIZE as u64 - 3)).unwrap();
        let mut buf = vec![0u8; BLOCK_SIZE + 10];
        assert_eq!(file.read(&mut buf), Ok(BLOCK_SIZE + 10));
        assert_eq!(buf[..], contents[BLOCK_SIZE - 3..2 * BLOCK_SIZE + 7]);
    }

    #[test]
    fn write_across_block_boundary_round_trips() {
        let fs = mount(ImageBuilder::new().file("empty", b"").build());
        let mut file = fs.open("empty").unwrap();
        assert_eq!(file.write(&[b'.'; 4094]), Ok(4094));
        assert_eq!(file.write(b"HELLO"), Ok(5));
        assert_eq!(file.ioctl(Ioctl::GetLen), Ok(4099));

        file.ioctl(Ioctl::SetPos(4094)).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf), Ok(5));
        assert_eq!(&buf, b"HELLO");

        // a second open sees the persisted length
        let mut again = fs.open("empty").unwrap();
        assert_eq!(again.ioctl(Ioctl::GetLen), Ok(4099));
        let mut all = vec![0u8; 5000];
        assert_eq!(read_full(&mut again, &mut all), Ok(4099));
        assert!(all[..4094].iter().all(|&b| b == b'.'));
    }

    #[test]
    fn overwrite_in_place_keeps_neighbours() {
        let fs = mount(ImageBuilder::new().file("f", b"0123456789").build());
        let mut file = fs.open("f").unwrap();
        file.ioctl(Ioctl::SetPos(3)).unwrap();
        assert_eq!(file.write(b"abc"), Ok(3));
        file.ioctl(Ioctl::SetPos(0)).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(file.read(&mut buf), Ok(10));
        assert_eq!(&buf, b"012abc6789");
        assert_eq!(file.ioctl(Ioctl::GetLen), Ok(10));
    }

    #[test]
    fn growth_stops_at_device_capacity() {
        let fs = mount(ImageBuilder::new().file("f", b"").spare_blocks(1).build());
        let mut file = fs.open("f").unwrap();
        assert_eq!(file.write(&[1u8; BLOCK_SIZE]), Ok(BLOCK_SIZE));
        assert_eq!(file.write(&[2u8; 1]), Err(Error::NoSpace));
        assert_eq!(file.ioctl(Ioctl::GetLen), Ok(BLOCK_SIZE as u64));
    }

    #[test]
    fn growth_stops_at_inode_capacity() {
        let fs = mount(ImageBuilder::new().file("f", b"").build());
        let mut file = fs.open("f").unwrap();
        let huge = vec![0u8; (MAX_DATA_BLKS + 1) * BLOCK_SIZE];
        assert_eq!(file.write(&huge), Err(Error::FileTooLarge));
    }

    #[test]
    fn handles_share_the_file_length() {
        let fs = mount(ImageBuilder::new().file("f", b"0123456789").build());
        let mut a = fs.open("f").unwrap();
        let mut b = fs.open("f").unwrap();
        let big: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
        assert_eq!(a.write(&big), Ok(5000));
        assert_eq!(b.ioctl(Ioctl::GetLen), Ok(5000));

        // a short write through the older handle must not shrink the file
        assert_eq!(b.write(&[b'x'; 20]), Ok(20));
        assert_eq!(a.ioctl(Ioctl::GetLen), Ok(5000));
        assert_eq!(b.ioctl(Ioctl::GetLen), Ok(5000));

        let mut all = vec![0u8; 6000];
        let mut c = fs.open("f").unwrap();
        assert_eq!(read_full(&mut c, &mut all), Ok(5000));
        assert_eq!(all[..20], [b'x'; 20]);
        assert_eq!(all[20..5000], big[20..]);

        // b can seek into and read what a wrote
        b.ioctl(Ioctl::SetPos(4990)).unwrap();
        let mut tail = [0u8; 16];
        assert_eq!(b.read(&mut tail), Ok(10));
        assert_eq!(tail[..10], big[4990..]);
    }

    #[test]
    fn oversized_inode_is_bad_format() {
        let mut image = ImageBuilder::new().file("f", b"abc").build();
        let bogus = ((MAX_DATA_BLKS + 1) * BLOCK_SIZE) as u32;
        image[BLOCK_SIZE..BLOCK_SIZE + 4].copy_from_slice(&bogus.to_le_bytes());
        let fs = mount(image);
        assert_eq!(fs.open("f").err(), Some(Error::BadFormat));
        assert_eq!(fs.open_files(), 0);
    }

    #[test]
    fn closed_handle_is_rejected() {
        let fs = mount(ImageBuilder::new().file("f", b"x").build());
        let mut file = fs.open("f").unwrap();
        file.close();
        file.close();
        let mut buf = [0u8; 1];
        assert_eq!(file.read(&mut buf), Err(Error::BadDescriptor));
        assert_eq!(fs.open_files(), 0);
    }

    #[test]
    fn mounts_over_virtio_block_device() {
        let image = ImageBuilder::new().file("hello", b"0123456789").build();
        let mock = MockBlk::new(image, 4096);
        let dev = VioBlk::attach(
            mock.clone(),
            1,
            TestIntc::new(),
            TestCondition::new(mock.clone()),
        )
        .unwrap();
        let fs = FileSystem::mount(Box::new(dev.open().unwrap())).unwrap();
        let mut file = fs.open("hello").unwrap();
        assert_eq!(file.write(b"ab"), Ok(2));
        file.ioctl(Ioctl::SetPos(0)).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(file.read(&mut buf), Ok(10));
        assert_eq!(&buf[..10], b"ab23456789");
    }
}
