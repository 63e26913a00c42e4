// vim: tw=80
use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io,
    os::unix::fs::FileExt,
};

use cfg_if::cfg_if;

use crate::{errors::Result, BLOCK_SIZE};

/// Flush-and-drop threshold, in cached blocks (2 MiB).
const MAX_CACHED_BLOCKS: usize = 4096;

/// Disjoint, non-adjacent set of block ranges, used to remember trimmed
/// regions of the destination.
#[derive(Debug, Default)]
struct RangeSet {
    // start block -> block count
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    fn insert(&mut self, start: u64, count: u64) {
        if count == 0 {
            return;
        }
        let mut new_start = start;
        let mut new_end = start + count;
        let mut stale = Vec::new();
        for (&s, &c) in self.ranges.range(..=new_end).rev() {
            if s + c < new_start {
                break;
            }
            stale.push(s);
            new_start = new_start.min(s);
            new_end = new_end.max(s + c);
        }
        for s in stale {
            self.ranges.remove(&s);
        }
        self.ranges.insert(new_start, new_end - new_start);
    }

    fn remove_block(&mut self, block: u64) {
        let Some((&s, &c)) = self.ranges.range(..=block).next_back() else {
            return;
        };
        if block >= s + c {
            return;
        }
        self.ranges.remove(&s);
        if block > s {
            self.ranges.insert(s, block - s);
        }
        if block + 1 < s + c {
            self.ranges.insert(block + 1, s + c - block - 1);
        }
    }

    fn contains(&self, block: u64) -> bool {
        match self.ranges.range(..=block).next_back() {
            Some((&s, &c)) => block < s + c,
            None => false,
        }
    }
}

struct CachedBlock {
    data: Box<[u8]>,
    dirty: bool,
}

/// A bounded write-back cache over the destination, addressed in bytes and
/// managed in 512-byte blocks.
///
/// Reads are served from the cache, from the trimmed set (as zeros), or
/// from the destination; reads past end-of-file yield zeros. Writes that
/// cover only part of a block either read-modify-write the destination
/// (`allow_gaps = false`) or treat the uncovered remainder as zeros
/// (`allow_gaps = true`).
pub struct BlockCache {
    file: File,
    is_regular: bool,
    blocks: HashMap<u64, CachedBlock>,
    trimmed: RangeSet,
}

impl BlockCache {
    pub fn new(file: File) -> io::Result<Self> {
        let is_regular = file.metadata()?.file_type().is_file();
        Ok(BlockCache {
            file,
            is_regular,
            blocks: HashMap::new(),
            trimmed: RangeSet::default(),
        })
    }

    fn read_block_from_file(&self, block: u64, out: &mut [u8]) -> Result<()> {
        let base = block * BLOCK_SIZE as u64;
        let mut pos = 0;
        while pos < out.len() {
            let n = self.file.read_at(&mut out[pos..], base + pos as u64)?;
            if n == 0 {
                // Past end-of-file; the destination reads as zeros there.
                out[pos..].fill(0);
                break;
            }
            pos += n;
        }
        Ok(())
    }

    pub fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let block = abs / BLOCK_SIZE as u64;
            let in_block = (abs % BLOCK_SIZE as u64) as usize;
            let n = (BLOCK_SIZE - in_block).min(buf.len() - pos);
            if let Some(cb) = self.blocks.get(&block) {
                buf[pos..pos + n]
                    .copy_from_slice(&cb.data[in_block..in_block + n]);
            } else if self.trimmed.contains(block) {
                buf[pos..pos + n].fill(0);
            } else {
                let mut data = vec![0u8; BLOCK_SIZE];
                self.read_block_from_file(block, &mut data)?;
                buf[pos..pos + n]
                    .copy_from_slice(&data[in_block..in_block + n]);
            }
            pos += n;
        }
        Ok(())
    }

    pub fn pwrite(
        &mut self,
        buf: &[u8],
        offset: u64,
        allow_gaps: bool,
    ) -> Result<()> {
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let block = abs / BLOCK_SIZE as u64;
            let in_block = (abs % BLOCK_SIZE as u64) as usize;
            let n = (BLOCK_SIZE - in_block).min(buf.len() - pos);
            if !self.blocks.contains_key(&block) {
                let mut data = vec![0u8; BLOCK_SIZE].into_boxed_slice();
                let full_overwrite = n == BLOCK_SIZE;
                if !full_overwrite
                    && !allow_gaps
                    && !self.trimmed.contains(block)
                {
                    self.read_block_from_file(block, &mut data)?;
                }
                self.blocks.insert(block, CachedBlock { data, dirty: false });
            }
            let cb = self.blocks.get_mut(&block).unwrap();
            cb.data[in_block..in_block + n]
                .copy_from_slice(&buf[pos..pos + n]);
            cb.dirty = true;
            self.trimmed.remove_block(block);
            pos += n;
        }
        if self.blocks.len() > MAX_CACHED_BLOCKS {
            self.flush_dirty()?;
            self.blocks.clear();
        }
        Ok(())
    }

    /// Discard any pending writes in the block-aligned interior of the
    /// range and remember that it now reads as zeros. On regular-file
    /// destinations the hole is punched through to the filesystem where
    /// the platform supports it.
    pub fn trim(
        &mut self,
        offset: u64,
        len: u64,
        _allow_gaps: bool,
    ) -> Result<()> {
        let bs = BLOCK_SIZE as u64;
        let first = offset.div_ceil(bs);
        let end = (offset + len) / bs;
        if first >= end {
            return Ok(());
        }
        for block in first..end {
            self.blocks.remove(&block);
        }
        self.trimmed.insert(first, end - first);
        self.punch(first * bs, (end - first) * bs);
        Ok(())
    }

    fn punch(&self, offset: u64, len: u64) {
        if !self.is_regular || len == 0 {
            return;
        }
        cfg_if! {
            if #[cfg(any(target_os = "android", target_os = "linux"))] {
                use std::os::unix::io::AsRawFd;

                use nix::fcntl::FallocateFlags;

                // TRIM data is don't-care, so a filesystem that refuses the
                // punch is not an error.
                let _ = nix::fcntl::fallocate(
                    self.file.as_raw_fd(),
                    FallocateFlags::FALLOC_FL_PUNCH_HOLE |
                        FallocateFlags::FALLOC_FL_KEEP_SIZE,
                    offset as i64,
                    len as i64,
                );
            } else {
                let _ = (offset, len);
            }
        }
    }

    fn flush_dirty(&mut self) -> Result<()> {
        let mut dirty: Vec<u64> = self
            .blocks
            .iter()
            .filter(|(_, cb)| cb.dirty)
            .map(|(&b, _)| b)
            .collect();
        dirty.sort_unstable();
        for block in dirty {
            let cb = self.blocks.get_mut(&block).unwrap();
            self.file.write_all_at(&cb.data, block * BLOCK_SIZE as u64)?;
            cb.dirty = false;
        }
        Ok(())
    }

    /// Write out every dirty block and establish a barrier against any
    /// external view of the destination.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_dirty()?;
        self.file.sync_all()?;
        Ok(())
    }
}
