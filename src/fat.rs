// vim: tw=80
//! FAT filesystem operations against a partition window of the output.
//!
//! Filesystem-level work (format, file and directory manipulation) goes
//! through the `fatfs` crate, mounted over a [`PartitionIo`] adapter that
//! exposes a byte window of the block cache. Attribute bits and the volume
//! label have no setter in that crate's public API, so those two operations
//! patch directory entries directly, walking the FAT structures through the
//! cache.

use std::io::{self, Read, Seek, SeekFrom, Write};

use fatfs::{format_volume, FileSystem, FormatVolumeOptions, FsOptions};

use crate::{
    block_cache::BlockCache,
    errors::{Error, Result},
    BLOCK_SIZE,
};

const ATTR_READ_ONLY: u8 = 0x01;
const ATTR_HIDDEN: u8 = 0x02;
const ATTR_SYSTEM: u8 = 0x04;
const ATTR_VOLUME: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LFN: u8 = 0x0F;

/// A byte window of the block cache starting at `base`, presented as a
/// plain `Read + Write + Seek` stream for the filesystem driver.
pub struct PartitionIo<'a> {
    cache: &'a mut BlockCache,
    base: u64,
    pos: u64,
    limit: Option<u64>,
}

impl<'a> PartitionIo<'a> {
    pub fn new(
        cache: &'a mut BlockCache,
        base: u64,
        limit: Option<u64>,
    ) -> Self {
        PartitionIo {
            cache,
            base,
            pos: 0,
            limit,
        }
    }
}

impl Read for PartitionIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match self.limit {
            Some(limit) => {
                (limit.saturating_sub(self.pos) as usize).min(buf.len())
            }
            None => buf.len(),
        };
        self.cache
            .pread(&mut buf[..n], self.base + self.pos)
            .map_err(|e| io::Error::other(e.to_string()))?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for PartitionIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.cache
            .pwrite(buf, self.base + self.pos, false)
            .map_err(|e| io::Error::other(e.to_string()))?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for PartitionIo<'_> {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        let new = match from {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => {
                let limit = self.limit.ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::Unsupported,
                        "partition window has no known end",
                    )
                })?;
                limit as i64 + d
            }
        };
        if new < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of partition",
            ));
        }
        self.pos = new as u64;
        Ok(self.pos)
    }
}

/// Mount the filesystem in the partition starting at `block_offset`.
pub fn open_fs(
    cache: &mut BlockCache,
    block_offset: u64,
) -> Result<FileSystem<PartitionIo<'_>>> {
    let io =
        PartitionIo::new(cache, block_offset * BLOCK_SIZE as u64, None);
    Ok(FileSystem::new(io, FsOptions::new())?)
}

pub fn mkfs(
    cache: &mut BlockCache,
    block_offset: u64,
    block_count: u64,
) -> Result<()> {
    let total: u32 = block_count.try_into().map_err(|_| {
        Error::Domain("fat_mkfs block count doesn't fit a FAT volume".into())
    })?;
    let mut io = PartitionIo::new(
        cache,
        block_offset * BLOCK_SIZE as u64,
        Some(block_count * BLOCK_SIZE as u64),
    );
    format_volume(
        &mut io,
        FormatVolumeOptions::new()
            .bytes_per_sector(BLOCK_SIZE as u16)
            .total_sectors(total),
    )?;
    Ok(())
}

pub fn touch(
    cache: &mut BlockCache,
    block_offset: u64,
    path: &str,
) -> Result<()> {
    let fs = open_fs(cache, block_offset)?;
    let file = fs.root_dir().create_file(path)?;
    drop(file);
    fs.unmount()?;
    Ok(())
}

pub fn mkdir(
    cache: &mut BlockCache,
    block_offset: u64,
    path: &str,
) -> Result<()> {
    let fs = open_fs(cache, block_offset)?;
    fs.root_dir().create_dir(path)?;
    fs.unmount()?;
    Ok(())
}

pub fn rm(
    cache: &mut BlockCache,
    block_offset: u64,
    action: &'static str,
    path: &str,
    must_exist: bool,
) -> Result<()> {
    let fs = open_fs(cache, block_offset)?;
    match fs.root_dir().remove(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if must_exist {
                return Err(Error::Failed(format!(
                    "{action}: '{path}' does not exist"
                )));
            }
        }
        Err(e) => return Err(e.into()),
    }
    fs.unmount()?;
    Ok(())
}

pub fn mv(
    cache: &mut BlockCache,
    block_offset: u64,
    action: &'static str,
    src: &str,
    dst: &str,
    force: bool,
) -> Result<()> {
    let fs = open_fs(cache, block_offset)?;
    {
        let root = fs.root_dir();
        if force {
            match root.remove(dst) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        root.rename(src, &root, dst).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                Error::Failed(format!("{action}: '{dst}' already exists"))
            } else {
                e.into()
            }
        })?;
    }
    fs.unmount()?;
    Ok(())
}

pub fn cp(
    cache: &mut BlockCache,
    block_offset: u64,
    src: &str,
    dst: &str,
) -> Result<()> {
    let fs = open_fs(cache, block_offset)?;
    {
        let root = fs.root_dir();
        let mut from = root.open_file(src)?;
        let mut to = root.create_file(dst)?;
        to.truncate()?;
        let mut buf = [0u8; 4096];
        loop {
            let n = from.read(&mut buf)?;
            if n == 0 {
                break;
            }
            to.write_all(&buf[..n])?;
        }
        drop(from);
        drop(to);
    }
    fs.unmount()?;
    Ok(())
}

/// Write `buf` at `offset` within an open FAT file, zero-filling any gap
/// between the current end of the file and `offset`. An empty `buf` just
/// grows the file to `offset`.
pub fn write_at<W: Write + Seek>(
    file: &mut W,
    offset: u64,
    buf: &[u8],
) -> io::Result<()> {
    let len = file.seek(SeekFrom::End(0))?;
    if offset > len {
        let zeros = [0u8; BLOCK_SIZE];
        let mut gap = offset - len;
        while gap > 0 {
            let n = gap.min(BLOCK_SIZE as u64) as usize;
            file.write_all(&zeros[..n])?;
            gap -= n as u64;
        }
    } else {
        file.seek(SeekFrom::Start(offset))?;
    }
    file.write_all(buf)
}

/// Decode an attribute flag string (any of `SsHhRr`) into DOS attribute
/// bits.
pub fn parse_attrib(flags: &str) -> Result<u8> {
    let mut bits = 0u8;
    for c in flags.chars() {
        match c {
            'S' | 's' => bits |= ATTR_SYSTEM,
            'H' | 'h' => bits |= ATTR_HIDDEN,
            'R' | 'r' => bits |= ATTR_READ_ONLY,
            _ => {
                return Err(Error::Domain(
                    "fat_attrib only supports R, H, and S attributes"
                        .into(),
                ))
            }
        }
    }
    Ok(bits)
}

/// Set the S/H/R attribute bits of `path`'s directory entry.
pub fn attrib(
    cache: &mut BlockCache,
    block_offset: u64,
    path: &str,
    flags: &str,
) -> Result<()> {
    let bits = parse_attrib(flags)?;
    let base = block_offset * BLOCK_SIZE as u64;
    let geo = read_geometry(cache, base)?;
    let (entry_offset, entry) = find_path(cache, base, &geo, path)?;
    let mask = ATTR_SYSTEM | ATTR_HIDDEN | ATTR_READ_ONLY;
    let attr = (entry[11] & !mask) | bits;
    cache.pwrite(&[attr], entry_offset + 11, false)?;
    Ok(())
}

/// Rewrite the volume label, both in the boot sector and in the root
/// directory's volume-label entry.
pub fn setlabel(
    cache: &mut BlockCache,
    block_offset: u64,
    label: &str,
) -> Result<()> {
    if label.len() > 11 || !label.is_ascii() {
        return Err(Error::Domain(
            "FAT labels are at most 11 ASCII characters".into(),
        ));
    }
    let mut name = [b' '; 11];
    for (i, b) in label.bytes().enumerate() {
        name[i] = b.to_ascii_uppercase();
    }

    let base = block_offset * BLOCK_SIZE as u64;
    let geo = read_geometry(cache, base)?;

    // Boot sector field, guarded by the extended boot signature.
    let (sig_at, label_at) = if geo.fat_bits == 32 {
        (66u64, 71u64)
    } else {
        (38, 43)
    };
    let mut sig = [0u8; 1];
    cache.pread(&mut sig, base + sig_at)?;
    if sig[0] == 0x29 {
        cache.pwrite(&name, base + label_at, false)?;
    }

    // Root directory entry: rewrite an existing label, or claim the first
    // free slot. The slot write never disturbs the end-of-directory marker
    // because only one 32-byte entry changes.
    let mut free_slot = None;
    let mut sector = [0u8; BLOCK_SIZE];
    'sectors: for s in root_dir_sectors(cache, base, &geo)? {
        let sector_offset = base + s as u64 * BLOCK_SIZE as u64;
        cache.pread(&mut sector, sector_offset)?;
        for i in 0..BLOCK_SIZE / 32 {
            let off = i * 32;
            let entry = &sector[off..off + 32];
            let first = entry[0];
            if first == 0x00 || first == 0xE5 {
                if free_slot.is_none() {
                    free_slot = Some(sector_offset + off as u64);
                }
                if first == 0x00 {
                    break 'sectors;
                }
                continue;
            }
            let attr = entry[11];
            if attr & ATTR_LFN == ATTR_LFN {
                continue;
            }
            if attr & ATTR_VOLUME != 0 {
                cache.pwrite(&name, sector_offset + off as u64, false)?;
                return Ok(());
            }
        }
    }
    if let Some(slot) = free_slot {
        let mut entry = [0u8; 32];
        entry[..11].copy_from_slice(&name);
        entry[11] = ATTR_VOLUME;
        cache.pwrite(&entry, slot, false)?;
    }
    Ok(())
}

struct Geometry {
    sectors_per_cluster: u32,
    reserved: u32,
    num_fats: u32,
    root_entries: u32,
    fat_size: u32,
    root_cluster: u32,
    total_clusters: u32,
    fat_bits: u8,
}

impl Geometry {
    fn root_dir_sector_count(&self) -> u32 {
        (self.root_entries * 32).div_ceil(BLOCK_SIZE as u32)
    }

    fn first_data_sector(&self) -> u32 {
        self.reserved
            + self.num_fats * self.fat_size
            + self.root_dir_sector_count()
    }

    fn cluster_sector(&self, cluster: u32) -> u32 {
        self.first_data_sector() + (cluster - 2) * self.sectors_per_cluster
    }
}

fn read_geometry(cache: &mut BlockCache, base: u64) -> Result<Geometry> {
    let mut bpb = [0u8; BLOCK_SIZE];
    cache.pread(&mut bpb, base)?;
    if bpb[510] != 0x55 || bpb[511] != 0xAA {
        return Err(Error::Failed(
            "no FAT filesystem at the given block offset".into(),
        ));
    }
    let u16at =
        |o: usize| u16::from_le_bytes(bpb[o..o + 2].try_into().unwrap());
    let u32at =
        |o: usize| u32::from_le_bytes(bpb[o..o + 4].try_into().unwrap());

    if u16at(11) as usize != BLOCK_SIZE {
        return Err(Error::Failed(
            "FAT filesystem does not use 512-byte sectors".into(),
        ));
    }
    let sectors_per_cluster = bpb[13] as u32;
    let reserved = u16at(14) as u32;
    let num_fats = bpb[16] as u32;
    let root_entries = u16at(17) as u32;
    let fat_size16 = u16at(22) as u32;
    let total_sectors = match u16at(19) {
        0 => u32at(32),
        n => n as u32,
    };
    let fat_size = if fat_size16 != 0 { fat_size16 } else { u32at(36) };
    if sectors_per_cluster == 0 || num_fats == 0 || fat_size == 0 {
        return Err(Error::Failed("corrupt FAT boot sector".into()));
    }

    let root_dir_sectors = (root_entries * 32).div_ceil(BLOCK_SIZE as u32);
    let first_data = reserved + num_fats * fat_size + root_dir_sectors;
    let total_clusters =
        total_sectors.saturating_sub(first_data) / sectors_per_cluster;
    let fat_bits = if fat_size16 == 0 {
        32
    } else if total_clusters < 4085 {
        12
    } else {
        16
    };
    Ok(Geometry {
        sectors_per_cluster,
        reserved,
        num_fats,
        root_entries,
        fat_size,
        root_cluster: u32at(44),
        total_clusters,
        fat_bits,
    })
}

fn fat_entry(
    cache: &mut BlockCache,
    base: u64,
    geo: &Geometry,
    cluster: u32,
) -> Result<u32> {
    let fat_start = base + geo.reserved as u64 * BLOCK_SIZE as u64;
    match geo.fat_bits {
        32 => {
            let mut b = [0u8; 4];
            cache.pread(&mut b, fat_start + cluster as u64 * 4)?;
            Ok(u32::from_le_bytes(b) & 0x0FFF_FFFF)
        }
        16 => {
            let mut b = [0u8; 2];
            cache.pread(&mut b, fat_start + cluster as u64 * 2)?;
            Ok(u16::from_le_bytes(b) as u32)
        }
        _ => {
            let mut b = [0u8; 2];
            let off = cluster as u64 + cluster as u64 / 2;
            cache.pread(&mut b, fat_start + off)?;
            let v = u16::from_le_bytes(b);
            Ok(if cluster & 1 != 0 {
                (v >> 4) as u32
            } else {
                (v & 0x0FFF) as u32
            })
        }
    }
}

fn chain_end(fat_bits: u8, entry: u32) -> bool {
    match fat_bits {
        32 => entry >= 0x0FFF_FFF8 || entry < 2,
        16 => entry >= 0xFFF8 || entry < 2,
        _ => entry >= 0xFF8 || entry < 2,
    }
}

/// Sectors (relative to the partition start) holding a directory's
/// entries.
fn chain_sectors(
    cache: &mut BlockCache,
    base: u64,
    geo: &Geometry,
    mut cluster: u32,
) -> Result<Vec<u32>> {
    let mut sectors = Vec::new();
    let mut hops = 0;
    while !chain_end(geo.fat_bits, cluster) {
        let first = geo.cluster_sector(cluster);
        sectors.extend(first..first + geo.sectors_per_cluster);
        cluster = fat_entry(cache, base, geo, cluster)?;
        hops += 1;
        if hops > geo.total_clusters + 2 {
            return Err(Error::Failed(
                "FAT directory cluster chain loops".into(),
            ));
        }
    }
    Ok(sectors)
}

fn root_dir_sectors(
    cache: &mut BlockCache,
    base: u64,
    geo: &Geometry,
) -> Result<Vec<u32>> {
    if geo.fat_bits == 32 {
        chain_sectors(cache, base, geo, geo.root_cluster)
    } else {
        let first = geo.reserved + geo.num_fats * geo.fat_size;
        Ok((first..first + geo.root_dir_sector_count()).collect())
    }
}

/// The 8.3 directory-entry form of a path component. Long names are not
/// supported here; the callers operate on plain short names.
fn short_name(component: &str) -> Result<[u8; 11]> {
    let (name, ext) = match component.rsplit_once('.') {
        Some((n, e)) => (n, e),
        None => (component, ""),
    };
    if name.is_empty()
        || name.len() > 8
        || ext.len() > 3
        || !component.is_ascii()
    {
        return Err(Error::Domain(format!(
            "'{component}' is not an 8.3 FAT name"
        )));
    }
    let mut out = [b' '; 11];
    for (i, b) in name.bytes().enumerate() {
        out[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.bytes().enumerate() {
        out[8 + i] = b.to_ascii_uppercase();
    }
    Ok(out)
}

/// Locate `path`'s directory entry. Returns the absolute byte offset of
/// the 32-byte entry on the output and a copy of it.
fn find_path(
    cache: &mut BlockCache,
    base: u64,
    geo: &Geometry,
    path: &str,
) -> Result<(u64, [u8; 32])> {
    let components: Vec<&str> = path
        .split('/')
        .filter(|c| !c.is_empty())
        .collect();
    if components.is_empty() {
        return Err(Error::Domain("empty FAT path".into()));
    }

    let mut sectors = root_dir_sectors(cache, base, geo)?;
    for (depth, component) in components.iter().enumerate() {
        let want = short_name(component)?;
        let found = scan_dir(cache, base, &sectors, &want)?.ok_or_else(
            || Error::Failed(format!("'{path}' not found in FAT filesystem")),
        )?;
        let (offset, entry) = found;
        if depth + 1 == components.len() {
            return Ok((offset, entry));
        }
        if entry[11] & ATTR_DIRECTORY == 0 {
            return Err(Error::Failed(format!(
                "'{component}' is not a directory"
            )));
        }
        let mut cluster =
            u16::from_le_bytes(entry[26..28].try_into().unwrap()) as u32;
        if geo.fat_bits == 32 {
            cluster |= (u16::from_le_bytes(entry[20..22].try_into().unwrap())
                as u32)
                << 16;
        }
        sectors = chain_sectors(cache, base, geo, cluster)?;
    }
    unreachable!()
}

fn scan_dir(
    cache: &mut BlockCache,
    base: u64,
    sectors: &[u32],
    want: &[u8; 11],
) -> Result<Option<(u64, [u8; 32])>> {
    let mut sector = [0u8; BLOCK_SIZE];
    for &s in sectors {
        let sector_offset = base + s as u64 * BLOCK_SIZE as u64;
        cache.pread(&mut sector, sector_offset)?;
        for i in 0..BLOCK_SIZE / 32 {
            let entry: [u8; 32] =
                sector[i * 32..i * 32 + 32].try_into().unwrap();
            match entry[0] {
                0x00 => return Ok(None),
                0xE5 => continue,
                _ => {}
            }
            let attr = entry[11];
            if attr & ATTR_LFN == ATTR_LFN || attr & ATTR_VOLUME != 0 {
                continue;
            }
            if &entry[..11] == want {
                return Ok(Some((sector_offset + i as u64 * 32, entry)));
            }
        }
    }
    Ok(None)
}
