// vim: tw=80
use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use crate::{errors::Result, sparse::SparseMap};

/// Streams a resource's payload out of the bundle's `data/` directory.
///
/// Payload files hold the data runs only, concatenated; holes exist solely
/// in the sparse map. Each read reports the logical offset of the bytes it
/// produced, so offsets jump over holes but never decrease.
pub struct ResourceReader {
    file: File,
    runs: Vec<(u64, u64)>,
    run_idx: usize,
    run_pos: u64,
}

impl ResourceReader {
    pub fn open(bundle: &Path, name: &str, map: &SparseMap) -> Result<Self> {
        let path = bundle.join("data").join(name);
        let file = File::open(&path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("payload for resource '{name}': {e}"),
            )
        })?;
        Ok(ResourceReader {
            file,
            runs: map.data_runs(),
            run_idx: 0,
            run_pos: 0,
        })
    }

    /// Fill `buf` with the next chunk. Returns `(len, logical_offset)`;
    /// `len == 0` means end of stream.
    ///
    /// A payload shorter than the map's data size simply ends early; the
    /// consumer's length accounting turns that into an integrity error.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<(usize, u64)> {
        loop {
            let Some(&(run_off, run_len)) = self.runs.get(self.run_idx)
            else {
                return Ok((0, 0));
            };
            let remaining = run_len - self.run_pos;
            if remaining == 0 {
                self.run_idx += 1;
                self.run_pos = 0;
                continue;
            }
            let want = remaining.min(buf.len() as u64) as usize;
            let n = self.file.read(&mut buf[..want])?;
            if n == 0 {
                return Ok((0, 0));
            }
            let offset = run_off + self.run_pos;
            self.run_pos += n as u64;
            return Ok((n, offset));
        }
    }
}
