// vim: tw=80
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Which check a streamed resource failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IntegrityKind {
    /// The stream produced no bytes at all, which usually means two write
    /// actions shared one on-resource block.
    NothingWritten,
    /// The stream length disagreed with the sparse map's data size.
    Length { written: u64, expected: u64 },
    /// The BLAKE2b-256 digest disagreed with the manifest.
    Digest,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Wrong argument count for an action.
    #[error("{0}")]
    Arity(String),

    /// Out-of-range numeric argument or malformed flag string.
    #[error("{0}")]
    Domain(String),

    /// Action invoked outside the context kind it needs.
    #[error("{action} is only usable in an on-resource block")]
    ContextMismatch { action: &'static str },

    /// A named manifest section does not exist.
    #[error("{action} can't find {kind} reference '{name}'")]
    Reference {
        action: &'static str,
        kind: &'static str,
        name: String,
    },

    /// Unknown action name in an action list.
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    /// A malformed flat action list encoding.
    #[error("{0}")]
    ActionList(String),

    /// The manifest itself failed to load or parse.
    #[error("manifest: {0}")]
    Manifest(String),

    /// A streamed resource failed its length or digest check.
    #[error("{}", integrity_message(.action, .resource, .kind))]
    Integrity {
        action: &'static str,
        resource: String,
        kind: IntegrityKind,
    },

    /// An unsafe action was attempted without `--unsafe`.
    #[error("{action} requires --unsafe")]
    Unsafe { action: &'static str },

    /// A U-Boot environment block failed to parse.
    #[error("corrupt U-Boot environment: {0}")]
    CorruptEnv(String),

    /// The `error` action, or a subprocess that exited nonzero.
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn integrity_message(
    action: &str,
    resource: &str,
    kind: &IntegrityKind,
) -> String {
    match kind {
        IntegrityKind::NothingWritten => format!(
            "{action} didn't write anything. Was it invoked twice in an \
             on-resource block for '{resource}'?"
        ),
        IntegrityKind::Length { written, expected } => format!(
            "{action} wrote {written} bytes of '{resource}', but expected \
             {expected}"
        ),
        IntegrityKind::Digest => {
            format!("{action} detected a blake2b-256 digest mismatch on \
                     '{resource}'")
        }
    }
}

impl Error {
    /// The `IntegrityKind` carried by an integrity error, if any. Lets
    /// callers distinguish the length symptom from the digest symptom.
    pub fn integrity_kind(&self) -> Option<IntegrityKind> {
        match self {
            Error::Integrity { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
