// vim: tw=80
use serde_derive::Deserialize;

use crate::{
    errors::{Error, Result},
    BLOCK_SIZE,
};

const ENTRY_TABLE: usize = 446;
const SIGNATURE_OFFSET: usize = 440;

#[derive(Debug, Deserialize)]
pub struct PartitionSpec {
    #[serde(rename = "block-offset")]
    pub block_offset: u32,
    #[serde(rename = "block-count")]
    pub block_count: u32,
    #[serde(rename = "type")]
    pub part_type: u8,
    #[serde(default)]
    pub boot: bool,
}

/// A manifest `mbr` section, renderable into one 512-byte boot block.
#[derive(Debug, Deserialize)]
pub struct MbrSpec {
    /// Optional disk signature, stored little-endian at byte 440.
    #[serde(default)]
    pub signature: Option<u32>,

    #[serde(default, rename = "partition")]
    pub partitions: Vec<PartitionSpec>,
}

/// CHS encoding of an LBA with the conventional 255-head/63-sector
/// geometry. Addresses past cylinder 1023 saturate to the max tuple.
fn lba_to_chs(lba: u32) -> [u8; 3] {
    const HEADS: u32 = 255;
    const SECTORS: u32 = 63;

    let cylinder = lba / (HEADS * SECTORS);
    if cylinder > 1023 {
        return [0xFE, 0xFF, 0xFF];
    }
    let head = (lba / SECTORS) % HEADS;
    let sector = lba % SECTORS + 1;
    [
        head as u8,
        (sector as u8 & 0x3F) | (((cylinder >> 8) as u8 & 0x03) << 6),
        (cylinder & 0xFF) as u8,
    ]
}

impl MbrSpec {
    pub fn encode(&self) -> Result<[u8; BLOCK_SIZE]> {
        if self.partitions.len() > 4 {
            return Err(Error::Domain(
                "an MBR holds at most four partitions".into(),
            ));
        }
        let mut buf = [0u8; BLOCK_SIZE];
        if let Some(sig) = self.signature {
            buf[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 4]
                .copy_from_slice(&sig.to_le_bytes());
        }
        for (i, p) in self.partitions.iter().enumerate() {
            if p.block_count == 0 {
                return Err(Error::Domain(format!(
                    "partition {i} has a zero block count"
                )));
            }
            if p.part_type == 0 {
                return Err(Error::Domain(format!(
                    "partition {i} uses type 0, which marks an empty entry"
                )));
            }
            let last = p.block_offset.checked_add(p.block_count - 1).ok_or(
                Error::Domain(format!("partition {i} overflows the disk")),
            )?;
            let e = &mut buf[ENTRY_TABLE + 16 * i..ENTRY_TABLE + 16 * i + 16];
            e[0] = if p.boot { 0x80 } else { 0x00 };
            e[1..4].copy_from_slice(&lba_to_chs(p.block_offset));
            e[4] = p.part_type;
            e[5..8].copy_from_slice(&lba_to_chs(last));
            e[8..12].copy_from_slice(&p.block_offset.to_le_bytes());
            e[12..16].copy_from_slice(&p.block_count.to_le_bytes());
        }
        buf[510] = 0x55;
        buf[511] = 0xAA;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let mbr = MbrSpec {
            signature: Some(0x01020304),
            partitions: vec![
                PartitionSpec {
                    block_offset: 63,
                    block_count: 1000,
                    part_type: 0x83,
                    boot: true,
                },
                PartitionSpec {
                    block_offset: 2048,
                    block_count: 65536,
                    part_type: 0x0C,
                    boot: false,
                },
            ],
        };
        let buf = mbr.encode().unwrap();

        assert_eq!(&buf[440..444], &[0x04, 0x03, 0x02, 0x01]);
        // First entry: bootable, type 0x83, LBA 63 for 1000 blocks.
        assert_eq!(buf[446], 0x80);
        assert_eq!(buf[450], 0x83);
        assert_eq!(&buf[454..458], &63u32.to_le_bytes());
        assert_eq!(&buf[458..462], &1000u32.to_le_bytes());
        // Second entry.
        assert_eq!(buf[462], 0x00);
        assert_eq!(buf[466], 0x0C);
        assert_eq!(&buf[470..474], &2048u32.to_le_bytes());
        assert_eq!(&buf[474..478], &65536u32.to_le_bytes());
        // Unused entries stay zero; the boot signature is present.
        assert_eq!(&buf[478..510], &[0u8; 32][..]);
        assert_eq!(&buf[510..512], &[0x55, 0xAA]);
    }

    #[test]
    fn chs_saturates() {
        assert_eq!(lba_to_chs(0), [0, 1, 0]);
        // 1024 cylinders is out of CHS range.
        assert_eq!(lba_to_chs(1024 * 255 * 63), [0xFE, 0xFF, 0xFF]);
    }

    #[test]
    fn too_many_partitions() {
        let p = |off| PartitionSpec {
            block_offset: off,
            block_count: 1,
            part_type: 0x83,
            boot: false,
        };
        let mbr = MbrSpec {
            signature: None,
            partitions: vec![p(1), p(2), p(3), p(4), p(5)],
        };
        assert!(matches!(mbr.encode(), Err(Error::Domain(_))));
    }
}
