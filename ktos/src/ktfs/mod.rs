//! KTFS, the on-disk filesystem.
//!
//! The disk is an array of 512-byte blocks:
//!
//! ```text
//! block 0                superblock
//! [1, 1+bitmaps)         data-block bitmap, 1 bit per data block,
//!                        LSB-first within each byte
//! [.., ..+inode blocks)  inodes, 32 bytes each, 16 per block
//! [.., ..)               data blocks
//! ```
//!
//! An inode addresses its data through three tiers: 3 direct block
//! pointers, one single-indirect block (128 pointers) and two
//! double-indirect blocks (128 x 128 pointers each). All pointers are
//! indices into the data-block region; the region's base offset is added
//! only when a block is actually fetched.
//!
//! The root directory is a single-level array of 32-byte entries in the
//! root inode's direct blocks. Directories never have holes: deleting an
//! entry moves the last entry into its slot. One file may be open at most
//! once; `delete` closes the file it removes.
//!
//! All operations run under the filesystem lock and move data through the
//! write-back [`BlockCache`]; `fsflush` pushes cached state to the device.

use crate::cache::{BlockCache, CACHE_BLKSZ};
use crate::io::{Io, IoCtl, IoKind};
use crate::thread::Lock;
use crate::KernelError;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bedrock::spinlock::SpinLock;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// Filesystem block size in bytes.
pub const KTFS_BLKSZ: usize = 512;
/// Longest allowed file name.
pub const KTFS_MAX_FILENAME_LEN: usize = 14;

const KTFS_DENSZ: usize = 32;
const KTFS_INOSZ: usize = 32;
const INODES_PER_BLK: usize = KTFS_BLKSZ / KTFS_INOSZ;
const DENTRIES_PER_BLK: usize = KTFS_BLKSZ / KTFS_DENSZ;
const NUM_DIRECT: usize = 3;
const NUM_DINDIRECT: usize = 2;
const BLKS_PER_INDIRECT: usize = KTFS_BLKSZ / 4;
const BLKS_PER_DINDIRECT: usize = BLKS_PER_INDIRECT * BLKS_PER_INDIRECT;
const BITS_PER_BITMAP_BLK: usize = KTFS_BLKSZ * 8;
/// The root directory's entries live in its direct blocks only.
const MAX_DENTRIES: usize = NUM_DIRECT * DENTRIES_PER_BLK;

bedrock::const_assert!(CACHE_BLKSZ == KTFS_BLKSZ);

/// On-disk superblock, stored at offset 0 of block 0.
#[derive(Clone, Copy, Debug)]
pub struct SuperBlock {
    /// Total number of blocks on the device.
    pub block_count: u32,
    /// Number of bitmap blocks following the superblock.
    pub bitmap_block_count: u32,
    /// Number of inode blocks following the bitmap.
    pub inode_block_count: u32,
    /// Inode of the root directory.
    pub root_directory_inode: u16,
}

impl SuperBlock {
    fn parse(block: &[u8; KTFS_BLKSZ]) -> Self {
        Self {
            block_count: u32::from_le_bytes(block[0..4].try_into().unwrap()),
            bitmap_block_count: u32::from_le_bytes(block[4..8].try_into().unwrap()),
            inode_block_count: u32::from_le_bytes(block[8..12].try_into().unwrap()),
            root_directory_inode: u16::from_le_bytes(block[12..14].try_into().unwrap()),
        }
    }

    /// First absolute block of the data region.
    fn data_base(&self) -> u64 {
        1 + self.bitmap_block_count as u64 + self.inode_block_count as u64
    }

    /// Total number of inodes.
    fn inode_count(&self) -> usize {
        self.inode_block_count as usize * INODES_PER_BLK
    }
}

/// On-disk inode: 32 bytes, 16 per block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Inode {
    /// File size in bytes.
    pub size: u32,
    /// Flag word; unused by this kernel but kept on disk.
    pub flags: u32,
    /// Directly addressed data blocks.
    pub direct: [u32; NUM_DIRECT],
    /// Single-indirect block of data-block indices.
    pub indirect: u32,
    /// Double-indirect blocks of indirect-block indices.
    pub dindirect: [u32; NUM_DINDIRECT],
}

impl Inode {
    fn parse(raw: &[u8]) -> Self {
        let word = |i: usize| u32::from_le_bytes(raw[4 * i..4 * i + 4].try_into().unwrap());
        Self {
            size: word(0),
            flags: word(1),
            direct: [word(2), word(3), word(4)],
            indirect: word(5),
            dindirect: [word(6), word(7)],
        }
    }

    fn encode(&self, raw: &mut [u8]) {
        let words = [
            self.size,
            self.flags,
            self.direct[0],
            self.direct[1],
            self.direct[2],
            self.indirect,
            self.dindirect[0],
            self.dindirect[1],
        ];
        for (i, w) in words.iter().enumerate() {
            raw[4 * i..4 * i + 4].copy_from_slice(&w.to_le_bytes());
        }
    }

    /// Number of data blocks covered by the current size.
    fn block_count(&self) -> usize {
        (self.size as usize).div_ceil(KTFS_BLKSZ)
    }
}

/// A directory entry: 32-byte slot holding an inode number and a name of up
/// to 14 bytes, zero-terminated when shorter.
#[derive(Clone, Copy, Debug)]
pub struct DirEntry {
    /// Inode of the entry.
    pub inode: u16,
    /// Name bytes; the tail is zero-padded.
    pub name: [u8; KTFS_MAX_FILENAME_LEN],
}

impl DirEntry {
    fn parse(raw: &[u8]) -> Self {
        Self {
            inode: u16::from_le_bytes(raw[0..2].try_into().unwrap()),
            name: raw[2..2 + KTFS_MAX_FILENAME_LEN].try_into().unwrap(),
        }
    }

    fn encode(&self, raw: &mut [u8]) {
        raw[..KTFS_DENSZ].fill(0);
        raw[0..2].copy_from_slice(&self.inode.to_le_bytes());
        raw[2..2 + KTFS_MAX_FILENAME_LEN].copy_from_slice(&self.name);
    }

    fn name_matches(&self, name: &[u8]) -> bool {
        if name.len() > KTFS_MAX_FILENAME_LEN {
            return false;
        }
        self.name[..name.len()] == *name
            && (name.len() == KTFS_MAX_FILENAME_LEN || self.name[name.len()] == 0)
    }
}

fn pack_name(name: &str) -> Result<[u8; KTFS_MAX_FILENAME_LEN], KernelError> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > KTFS_MAX_FILENAME_LEN {
        return Err(KernelError::InvalidArgument);
    }
    let mut out = [0u8; KTFS_MAX_FILENAME_LEN];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// Per-open-file state shared between the file's I/O handle and the
/// filesystem's open-files table.
pub struct FileState {
    ino: u16,
    name: [u8; KTFS_MAX_FILENAME_LEN],
    open: AtomicBool,
    // Guarded by the filesystem lock.
    inode: UnsafeCell<Inode>,
}

unsafe impl Send for FileState {}
unsafe impl Sync for FileState {}

struct KtfsState {
    root_inode: Inode,
    // One flag per inode; rebuilt from the root directory at mount.
    inode_bitmap: Vec<bool>,
    open_files: Vec<Arc<FileState>>,
}

/// A mounted KTFS instance.
pub struct Ktfs {
    sb: SuperBlock,
    cache: BlockCache,
    lock: Lock,
    state: UnsafeCell<KtfsState>,
}

// `state` is only touched while `lock` is owned.
unsafe impl Send for Ktfs {}
unsafe impl Sync for Ktfs {}

impl Ktfs {
    /// Mount a filesystem from a random-access endpoint.
    ///
    /// Reads the superblock and the root inode, then scans the root
    /// directory to rebuild the in-memory inode-usage bitmap.
    pub fn mount(io: Io) -> Result<Arc<Ktfs>, KernelError> {
        let cache = BlockCache::new(io)?;

        let blk = cache.get_block(0)?;
        let sb = SuperBlock::parse(&blk);
        blk.release(false);
        if sb.inode_block_count == 0 || sb.root_directory_inode as usize >= sb.inode_count() {
            return Err(KernelError::IOError);
        }

        let fs = Ktfs {
            sb,
            cache,
            lock: Lock::new(),
            state: UnsafeCell::new(KtfsState {
                root_inode: Inode::default(),
                inode_bitmap: alloc::vec![false; sb.inode_count()],
                open_files: Vec::new(),
            }),
        };

        let root_inode = fs.read_inode(sb.root_directory_inode)?;
        {
            let state = fs.state();
            state.root_inode = root_inode;
            state.inode_bitmap[sb.root_directory_inode as usize] = true;
        }

        // Every directory entry marks its inode in use.
        let count = root_inode.size as usize / KTFS_DENSZ;
        for idx in 0..count {
            let entry = fs.read_dentry(idx)?;
            fs.state().inode_bitmap[entry.inode as usize] = true;
        }
        Ok(Arc::new(fs))
    }

    fn state(&self) -> &mut KtfsState {
        unsafe { &mut *self.state.get() }
    }

    /// Open `name`, returning a seekable handle over the file.
    ///
    /// A file that is already open reports [`KernelError::Busy`].
    pub fn open(self: &Arc<Self>, name: &str) -> Result<Io, KernelError> {
        let packed = pack_name(name).map_err(|_| KernelError::NoSuchEntry)?;
        self.lock.acquire();
        let result = self.do_open(packed);
        self.lock.release();
        let (fs, state) = result?;
        let file = Io::new(IoKind::File(KtfsFile { fs, state }));
        Io::new_seekable(file)
    }

    fn do_open(
        self: &Arc<Self>,
        name: [u8; KTFS_MAX_FILENAME_LEN],
    ) -> Result<(Arc<Self>, Arc<FileState>), KernelError> {
        let (_, entry) = self
            .find_dentry(&name)?
            .ok_or(KernelError::NoSuchEntry)?;
        if self
            .state()
            .open_files
            .iter()
            .any(|f| f.name == name)
        {
            return Err(KernelError::Busy);
        }
        let inode = self.read_inode(entry.inode)?;
        let state = Arc::new(FileState {
            ino: entry.inode,
            name,
            open: AtomicBool::new(true),
            inode: UnsafeCell::new(inode),
        });
        self.state().open_files.push(state.clone());
        Ok((self.clone(), state))
    }

    // Removes `state` from the open-files table by swapping with the last
    // live entry.
    fn close_file(&self, state: &Arc<FileState>) {
        if !state.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.lock.acquire();
        let open = &mut self.state().open_files;
        if let Some(at) = open.iter().position(|f| Arc::ptr_eq(f, state)) {
            open.swap_remove(at);
        }
        self.lock.release();
    }

    /// Create an empty file named `name`.
    pub fn create(&self, name: &str) -> Result<(), KernelError> {
        let packed = pack_name(name)?;
        self.lock.acquire();
        let result = self.do_create(packed);
        self.lock.release();
        result
    }

    fn do_create(&self, name: [u8; KTFS_MAX_FILENAME_LEN]) -> Result<(), KernelError> {
        if self.find_dentry(&name)?.is_some() {
            return Err(KernelError::Busy);
        }
        let count = self.state().root_inode.size as usize / KTFS_DENSZ;
        if count >= MAX_DENTRIES {
            return Err(KernelError::NoSpace);
        }
        let ino = self
            .state()
            .inode_bitmap
            .iter()
            .position(|used| !used)
            .ok_or(KernelError::NoSpace)? as u16;

        // A full last directory block means the next entry starts a new
        // data block.
        if count % DENTRIES_PER_BLK == 0 {
            let fresh = self.allocate_block()?;
            let root = &mut self.state().root_inode;
            root.direct[count / DENTRIES_PER_BLK] = fresh;
            self.write_root_inode()?;
        }

        let dir_block = self.state().root_inode.direct[count / DENTRIES_PER_BLK];
        let blk = self
            .cache
            .get_block((dir_block as u64 + self.sb.data_base()) * KTFS_BLKSZ as u64)?;
        let mut blk = blk;
        let slot = (count % DENTRIES_PER_BLK) * KTFS_DENSZ;
        DirEntry { inode: ino, name }.encode(&mut blk[slot..slot + KTFS_DENSZ]);
        blk.release(true);

        // Fresh files start from a zeroed inode.
        self.write_inode(ino, &Inode::default())?;
        self.state().inode_bitmap[ino as usize] = true;
        self.state().root_inode.size += KTFS_DENSZ as u32;
        self.write_root_inode()
    }

    /// Delete the file named `name`, closing it first if it is open.
    pub fn delete(&self, name: &str) -> Result<(), KernelError> {
        let packed = pack_name(name)?;
        self.lock.acquire();
        let result = self.do_delete(packed);
        self.lock.release();
        self.cache.flush();
        result
    }

    fn do_delete(&self, name: [u8; KTFS_MAX_FILENAME_LEN]) -> Result<(), KernelError> {
        let (entry_idx, entry) = self
            .find_dentry(&name)?
            .ok_or(KernelError::NoSuchEntry)?;
        let inode = self.read_inode(entry.inode)?;

        // An open file is closed by its deletion.
        if let Some(at) = self
            .state()
            .open_files
            .iter()
            .position(|f| f.name == name)
        {
            let state = self.state().open_files.swap_remove(at);
            state.open.store(false, Ordering::SeqCst);
        }

        // Free the data blocks, then the indirect metadata that addressed
        // them.
        let nblocks = inode.block_count();
        for idx in 0..nblocks {
            let raw = self.resolve_raw(&inode, idx)?;
            self.free_block(raw)?;
        }
        if nblocks > NUM_DIRECT {
            self.free_block(inode.indirect)?;
        }
        if nblocks > NUM_DIRECT + BLKS_PER_INDIRECT {
            let mut remaining = nblocks - NUM_DIRECT - BLKS_PER_INDIRECT;
            for d in 0..NUM_DINDIRECT {
                if remaining == 0 {
                    break;
                }
                let used = remaining.min(BLKS_PER_DINDIRECT);
                let indirect_cnt = used.div_ceil(BLKS_PER_INDIRECT);
                for j in 0..indirect_cnt {
                    let ind = self.read_index_entry(inode.dindirect[d], j)?;
                    self.free_block(ind)?;
                }
                self.free_block(inode.dindirect[d])?;
                remaining -= used;
            }
        }

        // Swap-remove the directory entry: the last entry moves into the
        // vacated slot and the old last slot is cleared.
        let count = self.state().root_inode.size as usize / KTFS_DENSZ;
        let last_idx = count - 1;
        if entry_idx != last_idx {
            let last = self.read_dentry(last_idx)?;
            self.write_dentry(entry_idx, &last)?;
        }
        self.write_dentry(
            last_idx,
            &DirEntry {
                inode: 0,
                name: [0; KTFS_MAX_FILENAME_LEN],
            },
        )?;
        self.state().root_inode.size -= KTFS_DENSZ as u32;
        self.write_root_inode()?;

        // Release the inode.
        self.state().inode_bitmap[entry.inode as usize] = false;
        self.write_inode(entry.inode, &Inode::default())
    }

    /// List the root directory as `(inode, name)` pairs, in slot order.
    pub fn read_dir(&self) -> Result<Vec<(u16, alloc::string::String)>, KernelError> {
        self.lock.acquire();
        let result = (|| {
            let count = self.state().root_inode.size as usize / KTFS_DENSZ;
            let mut out = Vec::with_capacity(count);
            for idx in 0..count {
                let entry = self.read_dentry(idx)?;
                let len = entry
                    .name
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(KTFS_MAX_FILENAME_LEN);
                out.push((
                    entry.inode,
                    alloc::string::String::from_utf8_lossy(&entry.name[..len]).into_owned(),
                ));
            }
            Ok(out)
        })();
        self.lock.release();
        result
    }

    /// Push everything the cache holds to the backing device.
    pub fn flush(&self) {
        self.cache.flush();
    }

    // Scans the live directory entries for `name`.
    fn find_dentry(
        &self,
        name: &[u8; KTFS_MAX_FILENAME_LEN],
    ) -> Result<Option<(usize, DirEntry)>, KernelError> {
        let count = self.state().root_inode.size as usize / KTFS_DENSZ;
        for idx in 0..count {
            let entry = self.read_dentry(idx)?;
            if entry.name_matches(name) {
                return Ok(Some((idx, entry)));
            }
        }
        Ok(None)
    }

    fn read_dentry(&self, idx: usize) -> Result<DirEntry, KernelError> {
        let dir_block = self.state().root_inode.direct[idx / DENTRIES_PER_BLK];
        let blk = self
            .cache
            .get_block((dir_block as u64 + self.sb.data_base()) * KTFS_BLKSZ as u64)?;
        let slot = (idx % DENTRIES_PER_BLK) * KTFS_DENSZ;
        let entry = DirEntry::parse(&blk[slot..slot + KTFS_DENSZ]);
        blk.release(false);
        Ok(entry)
    }

    fn write_dentry(&self, idx: usize, entry: &DirEntry) -> Result<(), KernelError> {
        let dir_block = self.state().root_inode.direct[idx / DENTRIES_PER_BLK];
        let mut blk = self
            .cache
            .get_block((dir_block as u64 + self.sb.data_base()) * KTFS_BLKSZ as u64)?;
        let slot = (idx % DENTRIES_PER_BLK) * KTFS_DENSZ;
        entry.encode(&mut blk[slot..slot + KTFS_DENSZ]);
        blk.release(true);
        Ok(())
    }

    fn inode_block_pos(&self, ino: u16) -> u64 {
        (1 + self.sb.bitmap_block_count as u64 + ino as u64 / INODES_PER_BLK as u64)
            * KTFS_BLKSZ as u64
    }

    fn read_inode(&self, ino: u16) -> Result<Inode, KernelError> {
        let blk = self.cache.get_block(self.inode_block_pos(ino))?;
        let off = (ino as usize % INODES_PER_BLK) * KTFS_INOSZ;
        let inode = Inode::parse(&blk[off..off + KTFS_INOSZ]);
        blk.release(false);
        Ok(inode)
    }

    fn write_inode(&self, ino: u16, inode: &Inode) -> Result<(), KernelError> {
        let mut blk = self.cache.get_block(self.inode_block_pos(ino))?;
        let off = (ino as usize % INODES_PER_BLK) * KTFS_INOSZ;
        inode.encode(&mut blk[off..off + KTFS_INOSZ]);
        blk.release(true);
        Ok(())
    }

    fn write_root_inode(&self) -> Result<(), KernelError> {
        let root = self.state().root_inode;
        self.write_inode(self.sb.root_directory_inode, &root)
    }

    // Reads entry `entry` of the index block `raw` (an indirect or
    // double-indirect block).
    fn read_index_entry(&self, raw: u32, entry: usize) -> Result<u32, KernelError> {
        let blk = self
            .cache
            .get_block((raw as u64 + self.sb.data_base()) * KTFS_BLKSZ as u64)?;
        let value = u32::from_le_bytes(blk[4 * entry..4 * entry + 4].try_into().unwrap());
        blk.release(false);
        Ok(value)
    }

    fn write_index_entry(&self, raw: u32, entry: usize, value: u32) -> Result<(), KernelError> {
        let mut blk = self
            .cache
            .get_block((raw as u64 + self.sb.data_base()) * KTFS_BLKSZ as u64)?;
        blk[4 * entry..4 * entry + 4].copy_from_slice(&value.to_le_bytes());
        blk.release(true);
        Ok(())
    }

    // Resolves a logical block index of a file to its raw data-block index.
    fn resolve_raw(&self, inode: &Inode, idx: usize) -> Result<u32, KernelError> {
        if idx < NUM_DIRECT {
            return Ok(inode.direct[idx]);
        }
        if idx < NUM_DIRECT + BLKS_PER_INDIRECT {
            return self.read_index_entry(inode.indirect, idx - NUM_DIRECT);
        }
        let mut off = idx - NUM_DIRECT - BLKS_PER_INDIRECT;
        let d = if off < BLKS_PER_DINDIRECT {
            0
        } else {
            off -= BLKS_PER_DINDIRECT;
            1
        };
        if d >= NUM_DINDIRECT || off >= BLKS_PER_DINDIRECT {
            return Err(KernelError::InvalidArgument);
        }
        let indirect = self.read_index_entry(inode.dindirect[d], off / BLKS_PER_INDIRECT)?;
        self.read_index_entry(indirect, off % BLKS_PER_INDIRECT)
    }

    // Allocates one data block: the lowest clear bit of the bitmap wins,
    // scanning LSB-first within each byte.
    fn allocate_block(&self) -> Result<u32, KernelError> {
        for bitmap_blk in 0..self.sb.bitmap_block_count as u64 {
            let mut blk = self.cache.get_block((1 + bitmap_blk) * KTFS_BLKSZ as u64)?;
            for byte in 0..KTFS_BLKSZ {
                if blk[byte] == 0xff {
                    continue;
                }
                for bit in 0..8 {
                    if blk[byte] & (1 << bit) == 0 {
                        blk[byte] |= 1 << bit;
                        blk.release(true);
                        return Ok((bitmap_blk as usize * BITS_PER_BITMAP_BLK
                            + byte * 8
                            + bit) as u32);
                    }
                }
            }
            blk.release(false);
        }
        Err(KernelError::NoSpace)
    }

    // Clears the bitmap bit of data block `raw`.
    fn free_block(&self, raw: u32) -> Result<(), KernelError> {
        let bitmap_blk = 1 + raw as u64 / BITS_PER_BITMAP_BLK as u64;
        let bit = raw as usize % BITS_PER_BITMAP_BLK;
        let mut blk = self.cache.get_block(bitmap_blk * KTFS_BLKSZ as u64)?;
        blk[bit / 8] &= !(1 << (bit % 8));
        blk.release(true);
        Ok(())
    }

    fn file_readat(
        &self,
        state: &FileState,
        pos: u64,
        buf: &mut [u8],
    ) -> Result<usize, KernelError> {
        self.lock.acquire();
        let result = (|| {
            if !state.open.load(Ordering::SeqCst) {
                return Err(KernelError::IOError);
            }
            let inode = unsafe { *state.inode.get() };
            if inode.size == 0 || buf.is_empty() {
                return Ok(0);
            }
            if pos >= inode.size as u64 {
                return Err(KernelError::InvalidArgument);
            }
            let len = buf.len().min((inode.size as u64 - pos) as usize);
            let end = pos as usize + len;
            let mut cur = pos as usize;
            let mut copied = 0;
            while cur < end {
                let raw = self.resolve_raw(&inode, cur / KTFS_BLKSZ)?;
                let off = cur % KTFS_BLKSZ;
                let take = (KTFS_BLKSZ - off).min(end - cur);
                let blk = self
                    .cache
                    .get_block((raw as u64 + self.sb.data_base()) * KTFS_BLKSZ as u64)?;
                buf[copied..copied + take].copy_from_slice(&blk[off..off + take]);
                blk.release(false);
                copied += take;
                cur += take;
            }
            Ok(copied)
        })();
        self.lock.release();
        result
    }

    fn file_writeat(
        &self,
        state: &FileState,
        pos: u64,
        buf: &[u8],
    ) -> Result<usize, KernelError> {
        self.lock.acquire();
        let result = (|| {
            if !state.open.load(Ordering::SeqCst) {
                return Err(KernelError::IOError);
            }
            let inode = unsafe { *state.inode.get() };
            if buf.is_empty() {
                return Ok(0);
            }
            // Writes never extend the file; grow with SetEnd first.
            if pos >= inode.size as u64 {
                return Err(KernelError::InvalidArgument);
            }
            let len = buf.len().min((inode.size as u64 - pos) as usize);
            let end = pos as usize + len;
            let mut cur = pos as usize;
            let mut written = 0;
            while cur < end {
                let raw = self.resolve_raw(&inode, cur / KTFS_BLKSZ)?;
                let off = cur % KTFS_BLKSZ;
                let take = (KTFS_BLKSZ - off).min(end - cur);
                let mut blk = self
                    .cache
                    .get_block((raw as u64 + self.sb.data_base()) * KTFS_BLKSZ as u64)?;
                blk[off..off + take].copy_from_slice(&buf[written..written + take]);
                blk.release(true);
                written += take;
                cur += take;
            }
            Ok(written)
        })();
        self.lock.release();
        result
    }

    fn file_set_end(&self, state: &FileState, new_size: u64) -> Result<(), KernelError> {
        self.lock.acquire();
        let result = self.do_set_end(state, new_size);
        self.lock.release();
        result
    }

    fn do_set_end(&self, state: &FileState, new_size: u64) -> Result<(), KernelError> {
        if !state.open.load(Ordering::SeqCst) {
            return Err(KernelError::IOError);
        }
        let inode = unsafe { &mut *state.inode.get() };
        let new_size = u32::try_from(new_size).map_err(|_| KernelError::InvalidArgument)?;
        if new_size == inode.size {
            return Ok(());
        }
        // Shrinking is not supported.
        if new_size < inode.size {
            return Err(KernelError::InvalidArgument);
        }

        while inode.size < new_size {
            // Round up to the block boundary; a target inside the last
            // allocated block needs no new storage.
            inode.size = (inode.size as usize).next_multiple_of(KTFS_BLKSZ) as u32;
            if new_size <= inode.size {
                break;
            }
            if inode.size == 0 {
                inode.direct[0] = self.allocate_block()?;
            } else {
                let last = (inode.size as usize - 1) / KTFS_BLKSZ;
                self.add_block(inode, last)?;
            }
            inode.size = (inode.size / KTFS_BLKSZ as u32 + 1) * KTFS_BLKSZ as u32;
            self.write_inode(state.ino, inode)?;
        }
        inode.size = new_size;
        self.write_inode(state.ino, inode)
    }

    // Allocates one data block and installs it at logical index
    // `old_idx + 1`, allocating any missing indirect or double-indirect
    // blocks on the way.
    fn add_block(&self, inode: &mut Inode, old_idx: usize) -> Result<(), KernelError> {
        let new_idx = old_idx + 1;

        if new_idx < NUM_DIRECT {
            inode.direct[new_idx] = self.allocate_block()?;
            return Ok(());
        }

        if new_idx < NUM_DIRECT + BLKS_PER_INDIRECT {
            if new_idx == NUM_DIRECT {
                inode.indirect = self.allocate_block()?;
            }
            let data = self.allocate_block()?;
            return self.write_index_entry(inode.indirect, new_idx - NUM_DIRECT, data);
        }

        let mut off = new_idx - NUM_DIRECT - BLKS_PER_INDIRECT;
        if off == 0 {
            inode.dindirect[0] = self.allocate_block()?;
        } else if off == BLKS_PER_DINDIRECT {
            inode.dindirect[1] = self.allocate_block()?;
        }
        let d = if off < BLKS_PER_DINDIRECT {
            0
        } else {
            off -= BLKS_PER_DINDIRECT;
            1
        };
        if d >= NUM_DINDIRECT || off >= BLKS_PER_DINDIRECT {
            return Err(KernelError::NoSpace);
        }
        // A fresh indirect level every 128 blocks.
        if off % BLKS_PER_INDIRECT == 0 {
            let indirect = self.allocate_block()?;
            self.write_index_entry(inode.dindirect[d], off / BLKS_PER_INDIRECT, indirect)?;
        }
        let indirect = self.read_index_entry(inode.dindirect[d], off / BLKS_PER_INDIRECT)?;
        let data = self.allocate_block()?;
        self.write_index_entry(indirect, off % BLKS_PER_INDIRECT, data)
    }
}

/// An open KTFS file behind an [`Io`] handle.
pub struct KtfsFile {
    fs: Arc<Ktfs>,
    state: Arc<FileState>,
}

impl KtfsFile {
    pub(crate) fn readat(&self, pos: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.fs.file_readat(&self.state, pos, buf)
    }

    pub(crate) fn writeat(&self, pos: u64, buf: &[u8]) -> Result<usize, KernelError> {
        self.fs.file_writeat(&self.state, pos, buf)
    }

    pub(crate) fn cntl(&self, cmd: IoCtl) -> Result<u64, KernelError> {
        match cmd {
            IoCtl::GetBlkSz => Ok(1),
            IoCtl::GetEnd => {
                self.fs.lock.acquire();
                let size = unsafe { (*self.state.inode.get()).size };
                self.fs.lock.release();
                Ok(size as u64)
            }
            IoCtl::SetEnd(v) => self.fs.file_set_end(&self.state, v).map(|_| 0),
            _ => Err(KernelError::NotSupportedOperation),
        }
    }
}

impl Drop for KtfsFile {
    fn drop(&mut self) {
        self.fs.close_file(&self.state);
    }
}

static FS: SpinLock<Option<Arc<Ktfs>>> = SpinLock::new(None);

fn the_fs() -> Result<Arc<Ktfs>, KernelError> {
    let guard = FS.lock();
    let fs = guard.clone();
    guard.unlock();
    fs.ok_or(KernelError::IOError)
}

/// Mount `io` as the system filesystem.
pub fn fsmount(io: Io) -> Result<(), KernelError> {
    let fs = Ktfs::mount(io)?;
    let mut guard = FS.lock();
    *guard = Some(fs);
    guard.unlock();
    Ok(())
}

/// Open a file on the system filesystem.
pub fn fsopen(name: &str) -> Result<Io, KernelError> {
    the_fs()?.open(name)
}

/// Create a file on the system filesystem.
pub fn fscreate(name: &str) -> Result<(), KernelError> {
    the_fs()?.create(name)
}

/// Delete a file from the system filesystem.
pub fn fsdelete(name: &str) -> Result<(), KernelError> {
    the_fs()?.delete(name)
}

/// Flush the system filesystem's cache.
pub fn fsflush() -> Result<(), KernelError> {
    the_fs()?.flush();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IoCtl;
    use alloc::vec;

    // Builds an empty filesystem image: 1 bitmap block, 2 inode blocks
    // (32 inodes), root directory at inode 0 with no entries.
    fn mkfs(total_blocks: usize) -> Io {
        let mut img = vec![0u8; total_blocks * KTFS_BLKSZ];
        img[0..4].copy_from_slice(&(total_blocks as u32).to_le_bytes());
        img[4..8].copy_from_slice(&1u32.to_le_bytes());
        img[8..12].copy_from_slice(&2u32.to_le_bytes());
        img[12..14].copy_from_slice(&0u16.to_le_bytes());
        Io::new_memory(img.into_boxed_slice())
    }

    fn mounted() -> (Io, Arc<Ktfs>) {
        let io = mkfs(256);
        let fs = Ktfs::mount(io.dup()).unwrap();
        (io, fs)
    }

    fn set_bits(io: &Io) -> u32 {
        let mut bitmap = [0u8; KTFS_BLKSZ];
        io.readat(KTFS_BLKSZ as u64, &mut bitmap).unwrap();
        bitmap.iter().map(|b| b.count_ones()).sum()
    }

    #[test]
    fn create_then_delete_restores_the_disk_state() {
        let (io, fs) = mounted();
        fs.create("x").unwrap();
        fs.flush();
        let after_create = set_bits(&io);
        assert_eq!(after_create, 1); // one directory block

        fs.create("y").unwrap();
        let file = fs.open("y").unwrap();
        file.cntl(IoCtl::SetEnd(3 * KTFS_BLKSZ as u64)).unwrap();
        drop(file);

        fs.delete("y").unwrap();
        fs.delete("x").unwrap();
        fs.flush();
        // All data blocks are back except the directory block, which stays
        // with the root inode.
        assert_eq!(set_bits(&io), 1);
        assert_eq!(fs.read_dir().unwrap().len(), 0);
    }

    #[test]
    fn directory_swap_remove_keeps_entries_contiguous() {
        let (_io, fs) = mounted();
        fs.create("a").unwrap();
        fs.create("b").unwrap();
        fs.create("c").unwrap();
        fs.delete("a").unwrap();

        let entries = fs.read_dir().unwrap();
        assert_eq!(entries.len(), 2);
        // The last entry moved into slot 0.
        assert_eq!(entries[0].1, "c");
        assert_eq!(entries[1].1, "b");
    }

    #[test]
    fn double_open_is_busy() {
        let (_io, fs) = mounted();
        fs.create("f").unwrap();
        let first = fs.open("f").unwrap();
        assert!(matches!(fs.open("f"), Err(KernelError::Busy)));
        drop(first);
        // Closing makes the file openable again.
        let again = fs.open("f").unwrap();
        drop(again);
    }

    #[test]
    fn extend_then_write_inside_the_new_region() {
        let (_io, fs) = mounted();
        fs.create("x").unwrap();
        let file = fs.open("x").unwrap();

        // Extending to the current size is a no-op.
        file.cntl(IoCtl::SetEnd(0)).unwrap();
        assert_eq!(file.cntl(IoCtl::GetEnd).unwrap(), 0);

        // 1600 bytes = 4 blocks: 3 direct + 1 through the indirect block.
        file.cntl(IoCtl::SetEnd(1600)).unwrap();
        assert_eq!(file.cntl(IoCtl::GetEnd).unwrap(), 1600);
        let mut buf = vec![0xffu8; 1600];
        assert_eq!(file.readat(0, &mut buf).unwrap(), 1600);
        assert!(buf.iter().all(|&b| b == 0));

        file.writeat(1500, b"abc").unwrap();
        let mut probe = [0u8; 6];
        assert_eq!(file.readat(1498, &mut probe).unwrap(), 6);
        assert_eq!(&probe, &[0, 0, b'a', b'b', b'c', 0]);

        // Truncation is refused, as is writing past the end.
        assert_eq!(
            file.cntl(IoCtl::SetEnd(100)),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(file.writeat(1600, b"z"), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn survives_a_remount() {
        let (io, fs) = mounted();
        fs.create("t").unwrap();
        {
            let file = fs.open("t").unwrap();
            file.cntl(IoCtl::SetEnd(2)).unwrap();
            file.writeat(0, b"42").unwrap();
        }
        fs.flush();
        drop(fs);

        let fs = Ktfs::mount(io).unwrap();
        let file = fs.open("t").unwrap();
        assert_eq!(file.cntl(IoCtl::GetEnd).unwrap(), 2);
        let mut buf = [0u8; 2];
        assert_eq!(file.readat(0, &mut buf).unwrap(), 2);
        assert_eq!(&buf, b"42");
    }

    #[test]
    fn mount_marks_referenced_inodes_in_use() {
        let (io, fs) = mounted();
        fs.create("a").unwrap();
        fs.create("b").unwrap();
        fs.flush();
        drop(fs);

        let fs = Ktfs::mount(io).unwrap();
        let state = fs.state();
        // Root inode plus the two directory entries, nothing else.
        let used: Vec<usize> = state
            .inode_bitmap
            .iter()
            .enumerate()
            .filter(|&(_, &u)| u)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(used, vec![0, 1, 2]);
    }

    #[test]
    fn grows_into_the_double_indirect_tier() {
        // Enough blocks for 3 direct + 128 indirect + a few double-indirect
        // data blocks plus their metadata.
        let io = mkfs(1024);
        let fs = Ktfs::mount(io.dup()).unwrap();
        fs.create("big").unwrap();
        let file = fs.open("big").unwrap();

        let size = (NUM_DIRECT + BLKS_PER_INDIRECT + 2) * KTFS_BLKSZ;
        file.cntl(IoCtl::SetEnd(size as u64)).unwrap();
        assert_eq!(file.cntl(IoCtl::GetEnd).unwrap(), size as u64);

        // The very last block is addressed through dindirect[0].
        file.writeat((size - KTFS_BLKSZ) as u64, b"tail").unwrap();
        let mut probe = [0u8; 4];
        file.readat((size - KTFS_BLKSZ) as u64, &mut probe).unwrap();
        assert_eq!(&probe, b"tail");

        drop(file);
        fs.delete("big").unwrap();
        fs.flush();
        // Every block, metadata included, was returned to the bitmap.
        assert_eq!(set_bits(&io), 1);
    }

    #[test]
    fn sequential_reads_through_a_seek_handle() {
        let (_io, fs) = mounted();
        fs.create("seq").unwrap();
        let file = fs.open("seq").unwrap();
        file.cntl(IoCtl::SetEnd(600)).unwrap();
        file.writeat(0, &[7u8; 600]).unwrap();
        drop(file);

        let file = fs.open("seq").unwrap();
        let mut buf = [0u8; 512];
        assert_eq!(file.read(&mut buf).unwrap(), 512);
        assert_eq!(file.cntl(IoCtl::GetPos).unwrap(), 512);
        let mut rest = [0u8; 512];
        assert_eq!(file.read(&mut rest).unwrap(), 88);
        assert_eq!(file.read(&mut rest).unwrap(), 0);
        assert!(buf.iter().chain(rest[..88].iter()).all(|&b| b == 7));
    }
}
