//! Write-back block cache.
//!
//! A fixed set of 512-byte slots over a random-access backing endpoint.
//! [`BlockCache::get_block`] hands out an exclusive [`BlockGuard`] for one
//! block and takes the cache-wide lock; the lock is held until the matching
//! [`BlockGuard::release`], so the cache serializes access to any one block
//! and to the backing device. Dirty releases write the slot back; clean data
//! becomes visible to the backing device on eviction, dirty release or
//! [`BlockCache::flush`].
//!
//! Eviction is least-recently-used over a recency stamp per slot: a release
//! makes its slot the most recent and shifts the slots above its old rank
//! down one, so the stamps stay a dense ranking and the smallest stamp is
//! the coldest slot.

use crate::io::{Io, IoCtl};
use crate::thread::Lock;
use crate::KernelError;
use alloc::boxed::Box;
use core::cell::UnsafeCell;

/// Cache block size in bytes.
pub const CACHE_BLKSZ: usize = 512;
/// Number of slots in a cache.
const CACHE_SLOT_CNT: usize = 64;

struct Slot {
    block_id: Option<u64>,
    recency: usize,
    data: [u8; CACHE_BLKSZ],
}

struct CacheInner {
    slots: Box<[Slot]>,
    // Slot handed out by the pending `get_block`, so a flush can release it.
    held: Option<usize>,
}

/// A fixed-associativity write-back cache over a backing endpoint.
pub struct BlockCache {
    backing: Io,
    lock: Lock,
    inner: UnsafeCell<CacheInner>,
}

// The inner state is only touched while the cache lock is owned.
unsafe impl Send for BlockCache {}
unsafe impl Sync for BlockCache {}

impl BlockCache {
    /// Create a cache over `backing`, which must support `readat` and
    /// `writeat`.
    pub fn new(backing: Io) -> Result<Self, KernelError> {
        // A backing endpoint without random access cannot be cached.
        backing.cntl(IoCtl::GetBlkSz)?;
        let mut slots = alloc::vec::Vec::with_capacity(CACHE_SLOT_CNT);
        for _ in 0..CACHE_SLOT_CNT {
            slots.push(Slot {
                block_id: None,
                recency: 0,
                data: [0; CACHE_BLKSZ],
            });
        }
        Ok(Self {
            backing,
            lock: Lock::new(),
            inner: UnsafeCell::new(CacheInner {
                slots: slots.into_boxed_slice(),
                held: None,
            }),
        })
    }

    fn inner(&self) -> &mut CacheInner {
        unsafe { &mut *self.inner.get() }
    }

    /// Get the block at byte position `pos`, which must be block-aligned.
    ///
    /// The returned guard gives exclusive access to the 512-byte buffer and
    /// keeps the cache lock until released.
    pub fn get_block(&self, pos: u64) -> Result<BlockGuard<'_>, KernelError> {
        if pos % CACHE_BLKSZ as u64 != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let block_id = pos / CACHE_BLKSZ as u64;

        self.lock.acquire();
        let inner = self.inner();

        // Hit.
        if let Some(idx) = inner
            .slots
            .iter()
            .position(|s| s.block_id == Some(block_id))
        {
            inner.held = Some(idx);
            return Ok(BlockGuard {
                cache: self,
                idx,
                released: false,
            });
        }

        // Miss: an empty slot if one exists, else the coldest slot.
        let idx = match inner.slots.iter().position(|s| s.block_id.is_none()) {
            Some(idx) => idx,
            None => {
                let held = inner.held;
                inner
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| Some(*i) != held)
                    .min_by_key(|(_, s)| s.recency)
                    .map(|(i, _)| i)
                    .unwrap()
            }
        };
        // The victim's identity goes first: a failed refill must not leave
        // stale bytes labeled with the old block.
        inner.slots[idx].block_id = None;
        match self.backing.readat(pos, &mut inner.slots[idx].data) {
            Ok(n) if n == CACHE_BLKSZ => {}
            Ok(_) => {
                self.lock.release();
                return Err(KernelError::IOError);
            }
            Err(e) => {
                self.lock.release();
                return Err(e);
            }
        }
        inner.slots[idx].block_id = Some(block_id);
        inner.held = Some(idx);
        Ok(BlockGuard {
            cache: self,
            idx,
            released: false,
        })
    }

    /// Write back any block currently held and release it as dirty.
    pub fn flush(&self) {
        self.lock.acquire();
        let inner = self.inner();
        if let Some(idx) = inner.held.take() {
            let slot = &mut inner.slots[idx];
            if let Some(id) = slot.block_id {
                if let Err(e) = self.backing.writeat(id * CACHE_BLKSZ as u64, &slot.data) {
                    warning!("block cache: flush of block {} failed: {:?}", id, e);
                }
            }
            self.touch(idx);
            // Balance the acquisition of the outstanding `get_block`.
            self.lock.release();
        }
        self.lock.release();
    }

    // Slot `idx` becomes the most recently used: it takes the top rank and
    // every slot ranked above its previous rank moves down one.
    fn touch(&self, idx: usize) {
        let inner = self.inner();
        let prev = inner.slots[idx].recency;
        let ranked = inner
            .slots
            .iter()
            .filter(|s| s.recency != 0)
            .count()
            + if prev == 0 { 1 } else { 0 };
        for slot in inner.slots.iter_mut() {
            if slot.recency > prev {
                slot.recency -= 1;
            }
        }
        inner.slots[idx].recency = ranked;
    }
}

/// Exclusive access to one cached block.
///
/// Must be released with an explicit [`BlockGuard::release`]; dropping an
/// unreleased guard panics.
pub struct BlockGuard<'a> {
    cache: &'a BlockCache,
    idx: usize,
    released: bool,
}

impl BlockGuard<'_> {
    /// Release the block. A dirty release writes the slot back to the
    /// backing device first.
    pub fn release(mut self, dirty: bool) {
        let inner = self.cache.inner();
        let slot = &mut inner.slots[self.idx];
        if dirty {
            let pos = slot.block_id.unwrap() * CACHE_BLKSZ as u64;
            if let Err(e) = self.cache.backing.writeat(pos, &slot.data) {
                warning!("block cache: write-back of block {} failed: {:?}", pos, e);
            }
        }
        self.cache.touch(self.idx);
        inner.held = None;
        self.released = true;
        self.cache.lock.release();
    }
}

impl core::ops::Deref for BlockGuard<'_> {
    type Target = [u8; CACHE_BLKSZ];

    fn deref(&self) -> &Self::Target {
        &self.cache.inner().slots[self.idx].data
    }
}

impl core::ops::DerefMut for BlockGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.cache.inner().slots[self.idx].data
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            panic!("`.release()` must be explicitly called before dropping BlockGuard.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn backing(blocks: usize) -> Io {
        Io::new_memory(vec![0u8; blocks * CACHE_BLKSZ].into_boxed_slice())
    }

    #[test]
    fn rejects_unaligned_positions() {
        let cache = BlockCache::new(backing(4)).unwrap();
        assert!(matches!(
            cache.get_block(100),
            Err(KernelError::InvalidArgument)
        ));
    }

    #[test]
    fn dirty_release_reaches_the_backing_device() {
        let io = backing(4);
        let cache = BlockCache::new(io.dup()).unwrap();

        let mut blk = cache.get_block(512).unwrap();
        blk.fill(b'X');
        blk.release(true);
        cache.flush();

        let mut raw = [0u8; CACHE_BLKSZ];
        assert_eq!(io.readat(512, &mut raw).unwrap(), CACHE_BLKSZ);
        assert!(raw.iter().all(|&b| b == b'X'));
    }

    #[test]
    fn clean_release_is_not_written_back() {
        let io = backing(4);
        let cache = BlockCache::new(io.dup()).unwrap();

        let mut blk = cache.get_block(0).unwrap();
        blk.fill(0x55);
        blk.release(false);

        let mut raw = [0u8; CACHE_BLKSZ];
        io.readat(0, &mut raw).unwrap();
        assert!(raw.iter().all(|&b| b == 0));

        // The modified bytes are still visible through the cache.
        let blk = cache.get_block(0).unwrap();
        assert!(blk.iter().all(|&b| b == 0x55));
        blk.release(false);
    }

    #[test]
    fn eviction_takes_the_least_recently_used_slot() {
        let io = backing(2 * CACHE_SLOT_CNT);
        // Tag every block with its own id.
        for i in 0..2 * CACHE_SLOT_CNT {
            io.writeat((i * CACHE_BLKSZ) as u64, &[i as u8; CACHE_BLKSZ])
                .unwrap();
        }
        let cache = BlockCache::new(io.dup()).unwrap();

        // Fill all 64 slots, blocks 0..64.
        for i in 0..CACHE_SLOT_CNT {
            cache
                .get_block((i * CACHE_BLKSZ) as u64)
                .unwrap()
                .release(false);
        }
        // Refresh block 0, making block 1 the coldest.
        cache.get_block(0).unwrap().release(false);

        // A new block evicts the coldest slot. Dirty the victim's buffer on
        // disk first so a re-fetch is observable.
        io.writeat(CACHE_BLKSZ as u64, &[0xEE; CACHE_BLKSZ]).unwrap();
        cache
            .get_block((CACHE_SLOT_CNT * CACHE_BLKSZ) as u64)
            .unwrap()
            .release(false);

        // Block 0 is still cached (stale content served without re-read)...
        io.writeat(0, &[0xDD; CACHE_BLKSZ]).unwrap();
        let blk = cache.get_block(0).unwrap();
        assert!(blk.iter().all(|&b| b == 0));
        blk.release(false);

        // ...while block 1 was evicted and comes back fresh.
        let blk = cache.get_block(CACHE_BLKSZ as u64).unwrap();
        assert!(blk.iter().all(|&b| b == 0xEE));
        blk.release(false);
    }
}
