// vim: tw=80
use std::{collections::BTreeMap, fs, path::Path};

use serde_derive::Deserialize;

use crate::{
    errors::{Error, Result},
    mbr::MbrSpec,
    sparse::SparseMap,
    uboot_env::UbootEnvSpec,
};

/// Informational metadata. Nothing in the apply pipeline depends on it.
#[derive(Debug, Default, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// A named, hashed, sparse payload within the bundle.
#[derive(Debug, Deserialize)]
pub struct FileResource {
    /// 64 lowercase hex characters.
    #[serde(rename = "blake2b-256")]
    pub blake2b_256: String,

    /// Signed run lengths: positive = data, negative = hole.
    #[serde(default)]
    pub length: Vec<i64>,
}

impl FileResource {
    pub fn sparse_map(&self) -> Result<SparseMap> {
        SparseMap::from_lengths(&self.length)
    }
}

/// One `on-resource` block: actions bound to a streaming resource.
#[derive(Debug, Deserialize)]
pub struct OnResource {
    pub resource: String,
    #[serde(default)]
    pub funlist: Vec<String>,
}

/// An ordered unit of work over one destination.
#[derive(Debug, Default, Deserialize)]
pub struct Task {
    #[serde(default, rename = "on-init")]
    pub on_init: Vec<String>,
    #[serde(default, rename = "on-resource")]
    pub on_resource: Vec<OnResource>,
    #[serde(default, rename = "on-finish")]
    pub on_finish: Vec<String>,
}

/// The parsed bundle manifest. Immutable for the duration of an apply.
#[derive(Debug, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub meta: Meta,

    #[serde(default, rename = "file-resource")]
    pub file_resources: BTreeMap<String, FileResource>,

    #[serde(default)]
    pub mbr: BTreeMap<String, MbrSpec>,

    #[serde(default, rename = "uboot-environment")]
    pub uboot_environments: BTreeMap<String, UbootEnvSpec>,

    #[serde(default)]
    pub task: BTreeMap<String, Task>,
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Manifest(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Manifest(format!("{}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    pub fn file_resource(&self, name: &str) -> Option<&FileResource> {
        self.file_resources.get(name)
    }

    pub fn task(&self, name: &str) -> Result<&Task> {
        self.task.get(name).ok_or_else(|| {
            Error::Manifest(format!("no task named '{name}'"))
        })
    }
}
