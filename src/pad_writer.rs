// vim: tw=80
use crate::{block_cache::BlockCache, errors::Result, BLOCK_SIZE};

/// Coalesces a stream of contiguous sub-block writes into whole-block cache
/// writes.
///
/// The block-aligned prefix of the pending bytes is emitted as soon as it
/// exists; a discontiguous offset or `flush()` drains the rest as a partial
/// write, which the cache completes by read-modify-write so that bytes
/// outside the passed ranges are left alone.
pub struct PadToBlockWriter<'a> {
    cache: &'a mut BlockCache,
    buf: Vec<u8>,
    /// Destination offset of `buf[0]`.
    base: u64,
}

impl<'a> PadToBlockWriter<'a> {
    pub fn new(cache: &'a mut BlockCache) -> Self {
        PadToBlockWriter {
            cache,
            buf: Vec::new(),
            base: 0,
        }
    }

    pub fn pwrite(&mut self, data: &[u8], offset: u64) -> Result<()> {
        if !self.buf.is_empty()
            && offset != self.base + self.buf.len() as u64
        {
            self.flush()?;
        }
        if self.buf.is_empty() {
            self.base = offset;
        }
        self.buf.extend_from_slice(data);

        let end = self.base + self.buf.len() as u64;
        let emit_end = end - end % BLOCK_SIZE as u64;
        if emit_end > self.base {
            let n = (emit_end - self.base) as usize;
            self.cache.pwrite(&self.buf[..n], self.base, false)?;
            self.buf.drain(..n);
            self.base = emit_end;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.cache.pwrite(&self.buf, self.base, false)?;
            self.base += self.buf.len() as u64;
            self.buf.clear();
        }
        Ok(())
    }
}
