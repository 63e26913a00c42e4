// vim: tw=80
//! The built-in actions: parsing (the registry), validation, progress
//! pre-computation, and execution.
//!
//! Each `(name, argv)` record from a manifest action list parses once into
//! a typed [`Action`]; the strict `!`-suffixed flavors of `fat_mv` and
//! `fat_rm` become `force`/`must_exist` fields of the same variant. The
//! three phases then dispatch by match: `validate` and `compute_progress`
//! are pure with respect to the output, `run` is where the side effects
//! live.

use std::{
    fmt,
    fs::OpenOptions,
    io::{Read, Write},
    process::{Command, Stdio},
};

use cfg_if::cfg_if;
use log::warn;

use crate::{
    block_cache::BlockCache,
    errors::{Error, IntegrityKind, Result},
    fat,
    manifest::Manifest,
    pad_writer::PadToBlockWriter,
    progress::Progress,
    resource::ResourceReader,
    uboot_env::{UbootEnv, UbootEnvSpec},
    BLOCK_SIZE,
};

/// Read granularity for resource streaming.
const CHUNK_SIZE: usize = 64 * 1024;

/// Apply-wide policy knobs, threaded through the execution context.
#[derive(Clone, Copy, Debug, Default)]
pub struct ApplyOptions {
    /// Permits `path_write`, `pipe_write`, and `execute`.
    pub allow_unsafe: bool,
}

/// The streaming half of a File-kind context.
pub struct StreamCtx<'a> {
    pub resource: &'a str,
    pub reader: &'a mut ResourceReader,
}

/// Per-action transient state for the run phase. `stream` is present
/// exactly when the surrounding event is an `on-resource` block.
pub struct ActionCtx<'a> {
    pub manifest: &'a Manifest,
    pub output: &'a mut BlockCache,
    pub progress: &'a mut Progress,
    pub options: ApplyOptions,
    pub stream: Option<StreamCtx<'a>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Action {
    RawWrite { block_offset: u64 },
    RawMemset { block_offset: u64, block_count: u64, value: u8 },
    FatMkfs { block_offset: u64, block_count: u64 },
    FatAttrib { block_offset: u64, path: String, flags: String },
    FatWrite { block_offset: u64, path: String },
    FatMv { block_offset: u64, src: String, dst: String, force: bool },
    FatRm { block_offset: u64, path: String, must_exist: bool },
    FatCp { block_offset: u64, src: String, dst: String },
    FatMkdir { block_offset: u64, path: String },
    FatSetlabel { block_offset: u64, label: String },
    FatTouch { block_offset: u64, path: String },
    MbrWrite { name: String },
    Trim { block_offset: u64, block_count: u64 },
    UbootClearenv { name: String },
    UbootSetenv { name: String, key: String, value: String },
    UbootUnsetenv { name: String, key: String },
    UbootRecover { name: String },
    ErrorAction { message: String },
    Info { message: String },
    PathWrite { path: String },
    PipeWrite { cmdline: String },
    Execute { cmdline: String },
}

/// Accepts decimal or `0x`-prefixed hex, like the manifest format always
/// has.
fn parse_num(s: &str, msg: &str) -> Result<u64> {
    let t = s.trim();
    let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => t.parse(),
    };
    parsed.map_err(|_| Error::Domain(msg.to_string()))
}

fn parse_num_max(s: &str, max: u64, msg: &str) -> Result<u64> {
    let n = parse_num(s, msg)?;
    if n > max {
        return Err(Error::Domain(msg.to_string()));
    }
    Ok(n)
}

fn expect_argc(argv: &[String], argc: usize, msg: &str) -> Result<()> {
    if argv.len() != argc {
        return Err(Error::Arity(msg.to_string()));
    }
    Ok(())
}

impl Action {
    /// The registry: resolve a name and bind its arguments. Arity and
    /// argument-domain checking happen here, once, so the later phases
    /// never re-parse strings.
    pub fn parse(argv: &[String]) -> Result<Action> {
        let name = argv[0].as_str();
        match name {
            "raw_write" => {
                expect_argc(argv, 2, "raw_write requires a block offset")?;
                Ok(Action::RawWrite {
                    block_offset: parse_num(
                        &argv[1],
                        "raw_write requires a non-negative integer block \
                         offset",
                    )?,
                })
            }
            "raw_memset" => {
                expect_argc(
                    argv,
                    4,
                    "raw_memset requires a block offset, count, and value",
                )?;
                Ok(Action::RawMemset {
                    block_offset: parse_num(
                        &argv[1],
                        "raw_memset requires a non-negative integer block \
                         offset",
                    )?,
                    block_count: parse_num_max(
                        &argv[2],
                        i32::MAX as u64 / BLOCK_SIZE as u64,
                        "raw_memset requires a non-negative integer block \
                         count",
                    )?,
                    value: parse_num_max(
                        &argv[3],
                        255,
                        "raw_memset requires a value between 0 and 255",
                    )? as u8,
                })
            }
            "fat_mkfs" => {
                expect_argc(
                    argv,
                    3,
                    "fat_mkfs requires a block offset and block count",
                )?;
                Ok(Action::FatMkfs {
                    block_offset: parse_num(
                        &argv[1],
                        "fat_mkfs requires a non-negative integer block \
                         offset",
                    )?,
                    block_count: parse_num(
                        &argv[2],
                        "fat_mkfs requires a non-negative integer block \
                         count",
                    )?,
                })
            }
            "fat_attrib" => {
                expect_argc(
                    argv,
                    4,
                    "fat_attrib requires a block offset, filename, and \
                     attributes (SHR)",
                )?;
                fat::parse_attrib(&argv[3])?;
                Ok(Action::FatAttrib {
                    block_offset: parse_num(
                        &argv[1],
                        "fat_attrib requires a non-negative integer block \
                         offset",
                    )?,
                    path: argv[2].clone(),
                    flags: argv[3].clone(),
                })
            }
            "fat_write" => {
                expect_argc(
                    argv,
                    3,
                    "fat_write requires a block offset and destination \
                     filename",
                )?;
                Ok(Action::FatWrite {
                    block_offset: parse_num(
                        &argv[1],
                        "fat_write requires a non-negative integer block \
                         offset",
                    )?,
                    path: argv[2].clone(),
                })
            }
            "fat_mv" | "fat_mv!" => {
                expect_argc(
                    argv,
                    4,
                    "fat_mv requires a block offset, old filename, and new \
                     filename",
                )?;
                Ok(Action::FatMv {
                    block_offset: parse_num(
                        &argv[1],
                        "fat_mv requires a non-negative integer block \
                         offset",
                    )?,
                    src: argv[2].clone(),
                    dst: argv[3].clone(),
                    force: name.ends_with('!'),
                })
            }
            "fat_rm" | "fat_rm!" => {
                expect_argc(
                    argv,
                    3,
                    "fat_rm requires a block offset and filename",
                )?;
                Ok(Action::FatRm {
                    block_offset: parse_num(
                        &argv[1],
                        "fat_rm requires a non-negative integer block \
                         offset",
                    )?,
                    path: argv[2].clone(),
                    must_exist: name.ends_with('!'),
                })
            }
            "fat_cp" => {
                expect_argc(
                    argv,
                    4,
                    "fat_cp requires a block offset, from filename, and to \
                     filename",
                )?;
                Ok(Action::FatCp {
                    block_offset: parse_num(
                        &argv[1],
                        "fat_cp requires a non-negative integer block \
                         offset",
                    )?,
                    src: argv[2].clone(),
                    dst: argv[3].clone(),
                })
            }
            "fat_mkdir" => {
                expect_argc(
                    argv,
                    3,
                    "fat_mkdir requires a block offset and directory name",
                )?;
                Ok(Action::FatMkdir {
                    block_offset: parse_num(
                        &argv[1],
                        "fat_mkdir requires a non-negative integer block \
                         offset",
                    )?,
                    path: argv[2].clone(),
                })
            }
            "fat_setlabel" => {
                expect_argc(
                    argv,
                    3,
                    "fat_setlabel requires a block offset and name",
                )?;
                Ok(Action::FatSetlabel {
                    block_offset: parse_num(
                        &argv[1],
                        "fat_setlabel requires a non-negative integer \
                         block offset",
                    )?,
                    label: argv[2].clone(),
                })
            }
            "fat_touch" => {
                expect_argc(
                    argv,
                    3,
                    "fat_touch requires a block offset and filename",
                )?;
                Ok(Action::FatTouch {
                    block_offset: parse_num(
                        &argv[1],
                        "fat_touch requires a non-negative integer block \
                         offset",
                    )?,
                    path: argv[2].clone(),
                })
            }
            "mbr_write" => {
                expect_argc(argv, 2, "mbr_write requires an mbr")?;
                Ok(Action::MbrWrite {
                    name: argv[1].clone(),
                })
            }
            "trim" => {
                expect_argc(
                    argv,
                    3,
                    "trim requires a block offset and count",
                )?;
                Ok(Action::Trim {
                    block_offset: parse_num(
                        &argv[1],
                        "trim requires a non-negative integer block offset",
                    )?,
                    block_count: parse_num_max(
                        &argv[2],
                        i32::MAX as u64 / BLOCK_SIZE as u64,
                        "trim requires a non-negative integer block count",
                    )?,
                })
            }
            "uboot_clearenv" => {
                expect_argc(
                    argv,
                    2,
                    "uboot_clearenv requires a uboot-environment reference",
                )?;
                Ok(Action::UbootClearenv {
                    name: argv[1].clone(),
                })
            }
            "uboot_setenv" => {
                expect_argc(
                    argv,
                    4,
                    "uboot_setenv requires a uboot-environment reference, \
                     variable name, and value",
                )?;
                Ok(Action::UbootSetenv {
                    name: argv[1].clone(),
                    key: argv[2].clone(),
                    value: argv[3].clone(),
                })
            }
            "uboot_unsetenv" => {
                expect_argc(
                    argv,
                    3,
                    "uboot_unsetenv requires a uboot-environment reference \
                     and a variable name",
                )?;
                Ok(Action::UbootUnsetenv {
                    name: argv[1].clone(),
                    key: argv[2].clone(),
                })
            }
            "uboot_recover" => {
                expect_argc(
                    argv,
                    2,
                    "uboot_recover requires a uboot-environment reference",
                )?;
                Ok(Action::UbootRecover {
                    name: argv[1].clone(),
                })
            }
            "error" => {
                expect_argc(argv, 2, "error() requires a message parameter")?;
                Ok(Action::ErrorAction {
                    message: argv[1].clone(),
                })
            }
            "info" => {
                expect_argc(argv, 2, "info() requires a message parameter")?;
                Ok(Action::Info {
                    message: argv[1].clone(),
                })
            }
            "path_write" => {
                expect_argc(argv, 2, "path_write requires a file path")?;
                Ok(Action::PathWrite {
                    path: argv[1].clone(),
                })
            }
            "pipe_write" => {
                expect_argc(
                    argv,
                    2,
                    "pipe_write requires a command to execute",
                )?;
                Ok(Action::PipeWrite {
                    cmdline: argv[1].clone(),
                })
            }
            "execute" => {
                expect_argc(
                    argv,
                    2,
                    "execute requires a command to execute",
                )?;
                Ok(Action::Execute {
                    cmdline: argv[1].clone(),
                })
            }
            _ => Err(Error::UnknownAction(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::RawWrite { .. } => "raw_write",
            Action::RawMemset { .. } => "raw_memset",
            Action::FatMkfs { .. } => "fat_mkfs",
            Action::FatAttrib { .. } => "fat_attrib",
            Action::FatWrite { .. } => "fat_write",
            Action::FatMv { force: false, .. } => "fat_mv",
            Action::FatMv { force: true, .. } => "fat_mv!",
            Action::FatRm { must_exist: false, .. } => "fat_rm",
            Action::FatRm { must_exist: true, .. } => "fat_rm!",
            Action::FatCp { .. } => "fat_cp",
            Action::FatMkdir { .. } => "fat_mkdir",
            Action::FatSetlabel { .. } => "fat_setlabel",
            Action::FatTouch { .. } => "fat_touch",
            Action::MbrWrite { .. } => "mbr_write",
            Action::Trim { .. } => "trim",
            Action::UbootClearenv { .. } => "uboot_clearenv",
            Action::UbootSetenv { .. } => "uboot_setenv",
            Action::UbootUnsetenv { .. } => "uboot_unsetenv",
            Action::UbootRecover { .. } => "uboot_recover",
            Action::ErrorAction { .. } => "error",
            Action::Info { .. } => "info",
            Action::PathWrite { .. } => "path_write",
            Action::PipeWrite { .. } => "pipe_write",
            Action::Execute { .. } => "execute",
        }
    }

    /// File-kind actions consume the event's resource stream.
    pub fn requires_resource(&self) -> bool {
        matches!(
            self,
            Action::RawWrite { .. }
                | Action::FatWrite { .. }
                | Action::PathWrite { .. }
                | Action::PipeWrite { .. }
        )
    }

    /// Creation-time checks beyond arity and argument domains: context
    /// kind and manifest references. Pure; never touches an output.
    pub fn validate(
        &self,
        manifest: &Manifest,
        stream_resource: Option<&str>,
    ) -> Result<()> {
        if self.requires_resource() && stream_resource.is_none() {
            return Err(Error::ContextMismatch {
                action: self.name(),
            });
        }
        match self {
            Action::MbrWrite { name } => {
                if !manifest.mbr.contains_key(name) {
                    return Err(Error::Reference {
                        action: self.name(),
                        kind: "mbr",
                        name: name.clone(),
                    });
                }
            }
            Action::UbootClearenv { name }
            | Action::UbootSetenv { name, .. }
            | Action::UbootUnsetenv { name, .. }
            | Action::UbootRecover { name } => {
                if !manifest.uboot_environments.contains_key(name) {
                    return Err(Error::Reference {
                        action: self.name(),
                        kind: "uboot-environment",
                        name: name.clone(),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Accumulate this action's share of the progress total.
    pub fn compute_progress(
        &self,
        manifest: &Manifest,
        stream_resource: Option<&str>,
        progress: &mut Progress,
    ) -> Result<()> {
        let units = match self {
            Action::RawWrite { .. }
            | Action::PathWrite { .. }
            | Action::PipeWrite { .. } => {
                self.resource_data_size(manifest, stream_resource)?
            }
            // A zero-length resource still creates the file.
            Action::FatWrite { .. } => {
                self.resource_data_size(manifest, stream_resource)?.max(1)
            }
            Action::RawMemset { block_count, .. } => {
                block_count * BLOCK_SIZE as u64
            }
            // Heuristic: one unit per 128 KiB trimmed.
            Action::Trim { block_count, .. } => block_count / 256,
            Action::ErrorAction { .. }
            | Action::Info { .. }
            | Action::Execute { .. } => 0,
            _ => 1,
        };
        progress.total_units += units;
        Ok(())
    }

    fn resource_data_size(
        &self,
        manifest: &Manifest,
        stream_resource: Option<&str>,
    ) -> Result<u64> {
        let resource =
            stream_resource.ok_or(Error::ContextMismatch {
                action: self.name(),
            })?;
        let fr = manifest.file_resource(resource).ok_or_else(|| {
            Error::Reference {
                action: self.name(),
                kind: "file-resource",
                name: resource.to_string(),
            }
        })?;
        Ok(fr.sparse_map()?.data_size())
    }

    pub fn run(&self, ctx: &mut ActionCtx) -> Result<()> {
        match self {
            Action::RawWrite { block_offset } => {
                let dest = block_offset * BLOCK_SIZE as u64;
                let manifest = ctx.manifest;
                let stream = ctx.stream.as_mut().ok_or(
                    Error::ContextMismatch {
                        action: "raw_write",
                    },
                )?;
                let mut rs = ResourceStream::begin(
                    manifest,
                    stream.resource,
                    "raw_write",
                )?;
                let mut ptbw = PadToBlockWriter::new(&mut *ctx.output);
                let mut buf = vec![0u8; CHUNK_SIZE];
                loop {
                    let (len, offset) = stream.reader.read(&mut buf)?;
                    if len == 0 {
                        break;
                    }
                    rs.update(&buf[..len]);
                    ptbw.pwrite(&buf[..len], dest + offset)?;
                    ctx.progress.report(len as u64);
                }
                if rs.ending_hole > 0 {
                    // Seeking alone can't grow a regular-file destination,
                    // so the tail of the hole is written explicitly.
                    let zeros = [0u8; BLOCK_SIZE];
                    let n = rs.ending_hole.min(BLOCK_SIZE as u64);
                    ptbw.pwrite(
                        &zeros[..n as usize],
                        dest + rs.total_size - n,
                    )?;
                }
                ptbw.flush()?;
                rs.finish()
            }
            Action::RawMemset {
                block_offset,
                block_count,
                value,
            } => {
                let dest = block_offset * BLOCK_SIZE as u64;
                let block = [*value; BLOCK_SIZE];
                for i in 0..*block_count {
                    ctx.output.pwrite(
                        &block,
                        dest + i * BLOCK_SIZE as u64,
                        true,
                    )?;
                    ctx.progress.report(BLOCK_SIZE as u64);
                }
                Ok(())
            }
            Action::FatMkfs {
                block_offset,
                block_count,
            } => {
                fat::mkfs(&mut *ctx.output, *block_offset, *block_count)?;
                ctx.progress.report(1);
                Ok(())
            }
            Action::FatAttrib {
                block_offset,
                path,
                flags,
            } => {
                fat::attrib(&mut *ctx.output, *block_offset, path, flags)?;
                ctx.progress.report(1);
                Ok(())
            }
            Action::FatWrite { block_offset, path } => {
                let manifest = ctx.manifest;
                let stream = ctx.stream.as_mut().ok_or(
                    Error::ContextMismatch {
                        action: "fat_write",
                    },
                )?;
                let mut rs = ResourceStream::begin(
                    manifest,
                    stream.resource,
                    "fat_write",
                )?;
                // Truncation semantics if the file already exists.
                fat::rm(
                    &mut *ctx.output,
                    *block_offset,
                    "fat_write",
                    path,
                    false,
                )?;
                if rs.total_size == 0 {
                    fat::touch(&mut *ctx.output, *block_offset, path)?;
                    ctx.progress.report(1);
                    return Ok(());
                }
                let fs = fat::open_fs(&mut *ctx.output, *block_offset)?;
                let mut file = fs.root_dir().create_file(path)?;
                let mut buf = vec![0u8; CHUNK_SIZE];
                loop {
                    let (len, offset) = stream.reader.read(&mut buf)?;
                    if len == 0 {
                        break;
                    }
                    rs.update(&buf[..len]);
                    fat::write_at(&mut file, offset, &buf[..len])?;
                    ctx.progress.report(len as u64);
                }
                if rs.ending_hole > 0 {
                    // A zero-length positional write grows the file to its
                    // full logical size.
                    fat::write_at(&mut file, rs.total_size, &[])?;
                }
                drop(file);
                fs.unmount()?;
                rs.finish()
            }
            Action::FatMv {
                block_offset,
                src,
                dst,
                force,
            } => {
                fat::mv(
                    &mut *ctx.output,
                    *block_offset,
                    self.name(),
                    src,
                    dst,
                    *force,
                )?;
                ctx.progress.report(1);
                Ok(())
            }
            Action::FatRm {
                block_offset,
                path,
                must_exist,
            } => {
                fat::rm(
                    &mut *ctx.output,
                    *block_offset,
                    self.name(),
                    path,
                    *must_exist,
                )?;
                ctx.progress.report(1);
                Ok(())
            }
            Action::FatCp {
                block_offset,
                src,
                dst,
            } => {
                fat::cp(&mut *ctx.output, *block_offset, src, dst)?;
                ctx.progress.report(1);
                Ok(())
            }
            Action::FatMkdir { block_offset, path } => {
                fat::mkdir(&mut *ctx.output, *block_offset, path)?;
                ctx.progress.report(1);
                Ok(())
            }
            Action::FatSetlabel {
                block_offset,
                label,
            } => {
                fat::setlabel(&mut *ctx.output, *block_offset, label)?;
                ctx.progress.report(1);
                Ok(())
            }
            Action::FatTouch { block_offset, path } => {
                fat::touch(&mut *ctx.output, *block_offset, path)?;
                ctx.progress.report(1);
                Ok(())
            }
            Action::MbrWrite { name } => {
                let spec =
                    ctx.manifest.mbr.get(name).ok_or_else(|| {
                        Error::Reference {
                            action: "mbr_write",
                            kind: "mbr",
                            name: name.clone(),
                        }
                    })?;
                let buf = spec.encode()?;
                ctx.output.pwrite(&buf, 0, false)?;
                ctx.progress.report(1);
                Ok(())
            }
            Action::Trim {
                block_offset,
                block_count,
            } => {
                let offset = block_offset * BLOCK_SIZE as u64;
                let count = block_count * BLOCK_SIZE as u64;
                ctx.output.trim(offset, count, true)?;
                ctx.progress.report(block_count / 256);
                Ok(())
            }
            Action::UbootClearenv { name } => {
                let spec = uboot_spec(ctx.manifest, "uboot_clearenv", name)?;
                let env = UbootEnv::new(spec);
                ctx.output.pwrite(
                    &env.encode()?,
                    spec.byte_offset(),
                    false,
                )?;
                ctx.progress.report(1);
                Ok(())
            }
            Action::UbootSetenv { name, key, value } => {
                let spec = uboot_spec(ctx.manifest, "uboot_setenv", name)?;
                let mut data = vec![0u8; spec.env_size()];
                ctx.output.pread(&mut data, spec.byte_offset())?;
                let mut env = UbootEnv::parse(spec, &data)?;
                env.set(key, value);
                ctx.output.pwrite(
                    &env.encode()?,
                    spec.byte_offset(),
                    false,
                )?;
                ctx.progress.report(1);
                Ok(())
            }
            Action::UbootUnsetenv { name, key } => {
                let spec = uboot_spec(ctx.manifest, "uboot_unsetenv", name)?;
                let mut data = vec![0u8; spec.env_size()];
                ctx.output.pread(&mut data, spec.byte_offset())?;
                let mut env = UbootEnv::parse(spec, &data)?;
                env.unset(key);
                ctx.output.pwrite(
                    &env.encode()?,
                    spec.byte_offset(),
                    false,
                )?;
                ctx.progress.report(1);
                Ok(())
            }
            Action::UbootRecover { name } => {
                let spec = uboot_spec(ctx.manifest, "uboot_recover", name)?;
                let mut data = vec![0u8; spec.env_size()];
                ctx.output.pread(&mut data, spec.byte_offset())?;
                if let Err(Error::CorruptEnv(_)) =
                    UbootEnv::parse(spec, &data)
                {
                    // Corrupt, so write a freshly-initialized environment.
                    let clean = UbootEnv::new(spec);
                    ctx.output.pwrite(
                        &clean.encode()?,
                        spec.byte_offset(),
                        false,
                    )?;
                }
                ctx.progress.report(1);
                Ok(())
            }
            Action::ErrorAction { message } => {
                Err(Error::Failed(message.clone()))
            }
            Action::Info { message } => {
                warn!("{message}");
                Ok(())
            }
            Action::PathWrite { path } => {
                if !ctx.options.allow_unsafe {
                    return Err(Error::Unsafe {
                        action: "path_write",
                    });
                }
                let manifest = ctx.manifest;
                let stream = ctx.stream.as_mut().ok_or(
                    Error::ContextMismatch {
                        action: "path_write",
                    },
                )?;
                let mut rs = ResourceStream::begin(
                    manifest,
                    stream.resource,
                    "path_write",
                )?;
                let mut oo = OpenOptions::new();
                oo.write(true).create(true);
                cfg_if! {
                    if #[cfg(unix)] {
                        use std::os::unix::fs::OpenOptionsExt;
                        oo.mode(0o644);
                    }
                }
                let mut file = oo.open(path)?;
                stream_to_writer(&mut rs, stream, ctx.progress, &mut file)?;
                rs.finish()
            }
            Action::PipeWrite { cmdline } => {
                if !ctx.options.allow_unsafe {
                    return Err(Error::Unsafe {
                        action: "pipe_write",
                    });
                }
                let manifest = ctx.manifest;
                let stream = ctx.stream.as_mut().ok_or(
                    Error::ContextMismatch {
                        action: "pipe_write",
                    },
                )?;
                let mut rs = ResourceStream::begin(
                    manifest,
                    stream.resource,
                    "pipe_write",
                )?;
                let mut child = Command::new("sh")
                    .arg("-c")
                    .arg(cmdline)
                    .stdin(Stdio::piped())
                    .spawn()?;
                let streamed = match child.stdin.take() {
                    Some(mut stdin) => stream_to_writer(
                        &mut rs,
                        stream,
                        ctx.progress,
                        &mut stdin,
                    ),
                    None => Err(Error::Failed(format!(
                        "pipe_write can't open a pipe to '{cmdline}'"
                    ))),
                };
                if let Err(e) = streamed {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e);
                }
                let status = child.wait()?;
                if !status.success() {
                    return Err(Error::Failed(format!(
                        "pipe_write command '{cmdline}' failed: {status}"
                    )));
                }
                rs.finish()
            }
            Action::Execute { cmdline } => {
                if !ctx.options.allow_unsafe {
                    return Err(Error::Unsafe { action: "execute" });
                }
                let mut child = Command::new("sh")
                    .arg("-c")
                    .arg(cmdline)
                    .stdout(Stdio::piped())
                    .spawn()?;
                let mut stdout = child.stdout.take().ok_or_else(|| {
                    Error::Failed(format!(
                        "execute can't capture output of '{cmdline}'"
                    ))
                })?;
                let mut chunk = [0u8; BLOCK_SIZE];
                loop {
                    let n = stdout.read(&mut chunk)?;
                    if n == 0 {
                        break;
                    }
                    let text = String::from_utf8_lossy(&chunk[..n]);
                    let text = text.trim_end_matches('\n');
                    if !text.is_empty() {
                        warn!("{text}");
                    }
                }
                drop(stdout);
                let status = child.wait()?;
                if !status.success() {
                    return Err(Error::Failed(format!(
                        "execute command '{cmdline}' failed: {status}"
                    )));
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        match self {
            Action::RawWrite { block_offset } => {
                write!(f, " {block_offset}")
            }
            Action::RawMemset {
                block_offset,
                block_count,
                value,
            } => write!(f, " {block_offset} {block_count} {value}"),
            Action::FatMkfs {
                block_offset,
                block_count,
            }
            | Action::Trim {
                block_offset,
                block_count,
            } => write!(f, " {block_offset} {block_count}"),
            Action::FatAttrib {
                block_offset,
                path,
                flags,
            } => write!(f, " {block_offset} {path} {flags}"),
            Action::FatWrite { block_offset, path }
            | Action::FatRm {
                block_offset, path, ..
            }
            | Action::FatMkdir { block_offset, path }
            | Action::FatTouch { block_offset, path } => {
                write!(f, " {block_offset} {path}")
            }
            Action::FatSetlabel {
                block_offset,
                label,
            } => write!(f, " {block_offset} {label}"),
            Action::FatMv {
                block_offset,
                src,
                dst,
                ..
            }
            | Action::FatCp {
                block_offset,
                src,
                dst,
            } => write!(f, " {block_offset} {src} {dst}"),
            Action::MbrWrite { name }
            | Action::UbootClearenv { name }
            | Action::UbootRecover { name } => write!(f, " {name}"),
            Action::UbootSetenv { name, key, value } => {
                write!(f, " {name} {key} {value}")
            }
            Action::UbootUnsetenv { name, key } => {
                write!(f, " {name} {key}")
            }
            Action::ErrorAction { message }
            | Action::Info { message } => write!(f, " {message}"),
            Action::PathWrite { path } => write!(f, " {path}"),
            Action::PipeWrite { cmdline }
            | Action::Execute { cmdline } => write!(f, " {cmdline}"),
        }
    }
}

fn uboot_spec<'m>(
    manifest: &'m Manifest,
    action: &'static str,
    name: &str,
) -> Result<&'m UbootEnvSpec> {
    manifest.uboot_environments.get(name).ok_or_else(|| {
        Error::Reference {
            action,
            kind: "uboot-environment",
            name: name.to_string(),
        }
    })
}

/// The shared write-with-hash state for `raw_write`, `fat_write`,
/// `path_write`, and `pipe_write`: a running BLAKE2b-256 over every byte
/// the reader yields, plus consumed-length accounting against the sparse
/// map.
struct ResourceStream {
    action: &'static str,
    resource: String,
    expected_hash: String,
    data_size: u64,
    total_size: u64,
    ending_hole: u64,
    hash: blake2b_simd::State,
    consumed: u64,
}

impl ResourceStream {
    fn begin(
        manifest: &Manifest,
        resource: &str,
        action: &'static str,
    ) -> Result<Self> {
        let fr = manifest.file_resource(resource).ok_or_else(|| {
            Error::Reference {
                action,
                kind: "file-resource",
                name: resource.to_string(),
            }
        })?;
        let expected_hash = fr.blake2b_256.clone();
        if expected_hash.len() != 64
            || !expected_hash.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(Error::Domain(format!(
                "invalid blake2b-256 hash for '{resource}'"
            )));
        }
        let map = fr.sparse_map()?;
        Ok(ResourceStream {
            action,
            resource: resource.to_string(),
            expected_hash,
            data_size: map.data_size(),
            total_size: map.total_size(),
            ending_hole: map.ending_hole_size(),
            hash: blake2b_simd::Params::new().hash_length(32).to_state(),
            consumed: 0,
        })
    }

    fn update(&mut self, buf: &[u8]) {
        self.hash.update(buf);
        self.consumed += buf.len() as u64;
    }

    /// Length check, then digest check; the error says which one failed.
    fn finish(mut self) -> Result<()> {
        if self.consumed != self.data_size {
            let kind = if self.consumed == 0 {
                IntegrityKind::NothingWritten
            } else {
                IntegrityKind::Length {
                    written: self.consumed,
                    expected: self.data_size,
                }
            };
            return Err(Error::Integrity {
                action: self.action,
                resource: self.resource,
                kind,
            });
        }
        let actual = self.hash.finalize().to_hex();
        if actual.as_str() != self.expected_hash {
            return Err(Error::Integrity {
                action: self.action,
                resource: self.resource,
                kind: IntegrityKind::Digest,
            });
        }
        Ok(())
    }
}

/// Sequential-destination streaming for `path_write` and `pipe_write`.
/// The ending hole is topped off with at most one block of zeros, which
/// does not count toward the consumed length.
fn stream_to_writer<W: Write>(
    rs: &mut ResourceStream,
    stream: &mut StreamCtx,
    progress: &mut Progress,
    out: &mut W,
) -> Result<()> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let (len, _offset) = stream.reader.read(&mut buf)?;
        if len == 0 {
            break;
        }
        rs.update(&buf[..len]);
        out.write_all(&buf[..len])?;
        progress.report(len as u64);
    }
    if rs.ending_hole > 0 {
        let zeros = [0u8; BLOCK_SIZE];
        let n = rs.ending_hole.min(BLOCK_SIZE as u64) as usize;
        out.write_all(&zeros[..n])?;
    }
    Ok(())
}
