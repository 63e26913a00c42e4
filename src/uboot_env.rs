// vim: tw=80
use std::collections::BTreeMap;

use serde_derive::Deserialize;

use crate::{
    errors::{Error, Result},
    BLOCK_SIZE,
};

/// Placement of a U-Boot environment block on the destination.
#[derive(Debug, Deserialize)]
pub struct UbootEnvSpec {
    #[serde(rename = "block-offset")]
    pub block_offset: u64,
    #[serde(rename = "block-count")]
    pub block_count: u64,
}

impl UbootEnvSpec {
    pub fn env_size(&self) -> usize {
        self.block_count as usize * BLOCK_SIZE
    }

    pub fn byte_offset(&self) -> u64 {
        self.block_offset * BLOCK_SIZE as u64
    }
}

/// An in-memory U-Boot environment.
///
/// On disk: a little-endian CRC32 over the remaining `env_size - 4` data
/// bytes, then NUL-terminated `key=value` strings ended by an empty string,
/// zero filled to `env_size`. Variables serialize in sorted key order.
#[derive(Debug)]
pub struct UbootEnv {
    env_size: usize,
    vars: BTreeMap<String, String>,
}

impl UbootEnv {
    /// A freshly-initialized, empty environment.
    pub fn new(spec: &UbootEnvSpec) -> Self {
        UbootEnv {
            env_size: spec.env_size(),
            vars: BTreeMap::new(),
        }
    }

    pub fn parse(spec: &UbootEnvSpec, data: &[u8]) -> Result<Self> {
        let env_size = spec.env_size();
        if data.len() != env_size || env_size < 5 {
            return Err(Error::CorruptEnv(format!(
                "expected {} bytes, got {}",
                env_size,
                data.len()
            )));
        }
        let stored = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let computed = crc32fast::hash(&data[4..]);
        if stored != computed {
            return Err(Error::CorruptEnv("CRC32 mismatch".into()));
        }

        let mut vars = BTreeMap::new();
        let mut pos = 4;
        loop {
            let end = data[pos..]
                .iter()
                .position(|&b| b == 0)
                .map(|i| pos + i)
                .ok_or_else(|| {
                    Error::CorruptEnv("unterminated variable".into())
                })?;
            if end == pos {
                break;
            }
            let entry = std::str::from_utf8(&data[pos..end]).map_err(|_| {
                Error::CorruptEnv("variable is not UTF-8".into())
            })?;
            let (key, value) = entry.split_once('=').ok_or_else(|| {
                Error::CorruptEnv(format!("malformed variable '{entry}'"))
            })?;
            if key.is_empty() {
                return Err(Error::CorruptEnv("empty variable name".into()));
            }
            vars.insert(key.to_string(), value.to_string());
            pos = end + 1;
        }
        Ok(UbootEnv {
            env_size,
            vars,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.env_size < 5 {
            return Err(Error::Domain(
                "U-Boot environment is smaller than its CRC header".into(),
            ));
        }
        let mut data = vec![0u8; self.env_size];
        let mut pos = 4;
        for (key, value) in &self.vars {
            let needed = key.len() + 1 + value.len() + 1;
            // One byte stays reserved for the terminating empty string.
            if pos + needed + 1 > self.env_size {
                return Err(Error::Domain(format!(
                    "U-Boot environment does not fit in {} bytes",
                    self.env_size
                )));
            }
            data[pos..pos + key.len()].copy_from_slice(key.as_bytes());
            data[pos + key.len()] = b'=';
            let vstart = pos + key.len() + 1;
            data[vstart..vstart + value.len()]
                .copy_from_slice(value.as_bytes());
            pos += needed;
        }
        let crc = crc32fast::hash(&data[4..]);
        data[0..4].copy_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    /// Unsetting an absent variable is a no-op.
    pub fn unset(&mut self, key: &str) {
        self.vars.remove(key);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> UbootEnvSpec {
        UbootEnvSpec {
            block_offset: 16,
            block_count: 1,
        }
    }

    #[test]
    fn round_trip() {
        let spec = spec();
        let mut env = UbootEnv::new(&spec);
        env.set("bootcmd", "run distro_bootcmd");
        env.set("active", "a");
        let data = env.encode().unwrap();
        assert_eq!(data.len(), 512);

        let parsed = UbootEnv::parse(&spec, &data).unwrap();
        assert_eq!(parsed.get("bootcmd"), Some("run distro_bootcmd"));
        assert_eq!(parsed.get("active"), Some("a"));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn bad_crc_rejected() {
        let spec = spec();
        let mut data = UbootEnv::new(&spec).encode().unwrap();
        data[4] ^= 0xFF;
        assert!(matches!(
            UbootEnv::parse(&spec, &data),
            Err(Error::CorruptEnv(_))
        ));
    }

    #[test]
    fn set_then_unset_restores_encoding() {
        let spec = spec();
        let mut env = UbootEnv::new(&spec);
        env.set("a", "1");
        let before = env.encode().unwrap();

        env.set("foo", "bar");
        env.unset("foo");
        assert_eq!(env.encode().unwrap(), before);

        // Unsetting something that was never set changes nothing.
        env.unset("ghost");
        assert_eq!(env.encode().unwrap(), before);
    }

    #[test]
    fn oversized_environment_fails_encode() {
        let spec = spec();
        let mut env = UbootEnv::new(&spec);
        env.set("big", &"x".repeat(600));
        assert!(matches!(env.encode(), Err(Error::Domain(_))));
    }
}
