// vim: tw=80

use std::{ffi::CString, fs, io::Cursor, path::Path, process::Command};

use assert_cmd::prelude::*;
use pretty_assertions::assert_eq;
use rand::{RngCore, SeedableRng};
use rand_xorshift::XorShiftRng;
use rstest::rstest;
use tempfile::{NamedTempFile, TempDir};

const BLOCK_SIZE: usize = 512;

fn blake2b_hex(data: &[u8]) -> String {
    blake2b_simd::Params::new()
        .hash_length(32)
        .hash(data)
        .to_hex()
        .to_string()
}

/// Deterministic payload bytes, in the spirit of seeding everything.
fn payload(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = XorShiftRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

fn write_bundle(dir: &Path, manifest: &str, payloads: &[(&str, &[u8])]) {
    fs::write(dir.join("manifest.toml"), manifest).unwrap();
    fs::create_dir_all(dir.join("data")).unwrap();
    for (name, data) in payloads {
        fs::write(dir.join("data").join(name), data).unwrap();
    }
}

fn fwapply() -> Command {
    Command::cargo_bin("fwapply").unwrap()
}

fn stderr_of(cmd: &assert_cmd::assert::Assert) -> String {
    CString::new(cmd.get_output().stderr.clone())
        .unwrap()
        .into_string()
        .unwrap()
}

/// A 1 KiB all-data resource lands at exactly its block offset, leaves
/// everything before it untouched, and reports full progress.
#[test]
fn raw_write_exact_placement() {
    let bundle = TempDir::new().unwrap();
    let data = payload(1, 1024);
    write_bundle(
        bundle.path(),
        &format!(
            r#"
            [file-resource.boot]
            blake2b-256 = "{}"
            length = [1024]

            [task.complete]
            [[task.complete.on-resource]]
            resource = "boot"
            funlist = ["2", "raw_write", "10"]
            "#,
            blake2b_hex(&data)
        ),
        &[("boot", &data)],
    );
    let dest = NamedTempFile::new().unwrap();

    let cmd = fwapply()
        .arg("-p")
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .success();
    let stdout = String::from_utf8(cmd.get_output().stdout.clone()).unwrap();
    assert!(stdout.contains("100%"));

    let image = fs::read(dest.path()).unwrap();
    assert_eq!(image.len(), 12 * BLOCK_SIZE);
    assert!(image[..10 * BLOCK_SIZE].iter().all(|&b| b == 0));
    assert_eq!(&image[10 * BLOCK_SIZE..], &data[..]);
}

/// A resource with a trailing hole grows the destination to its full
/// logical size; the last byte is really written, not merely seeked over.
#[test]
fn raw_write_sparse_resource() {
    let bundle = TempDir::new().unwrap();
    let data = payload(2, 512);
    write_bundle(
        bundle.path(),
        &format!(
            r#"
            [file-resource.boot]
            blake2b-256 = "{}"
            length = [512, -3584]

            [task.complete]
            [[task.complete.on-resource]]
            resource = "boot"
            funlist = ["2", "raw_write", "0"]
            "#,
            blake2b_hex(&data)
        ),
        &[("boot", &data)],
    );
    let dest = NamedTempFile::new().unwrap();

    fwapply()
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .success();

    let image = fs::read(dest.path()).unwrap();
    assert_eq!(image.len(), 4096);
    assert_eq!(&image[..512], &data[..]);
    assert!(image[512..].iter().all(|&b| b == 0));
}

#[test]
fn raw_memset_fills_exact_range() {
    let bundle = TempDir::new().unwrap();
    write_bundle(
        bundle.path(),
        r#"
        [task.complete]
        on-init = ["4", "raw_memset", "2", "3", "0xab"]
        "#,
        &[],
    );
    let dest = NamedTempFile::new().unwrap();

    fwapply()
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .success();

    let image = fs::read(dest.path()).unwrap();
    assert_eq!(image.len(), 5 * BLOCK_SIZE);
    assert!(image[..2 * BLOCK_SIZE].iter().all(|&b| b == 0));
    assert!(image[2 * BLOCK_SIZE..].iter().all(|&b| b == 0xAB));
}

/// Writes queued behind a trim never reach the destination; neighbouring
/// blocks do.
#[test]
fn trim_discards_pending_writes() {
    let bundle = TempDir::new().unwrap();
    write_bundle(
        bundle.path(),
        r#"
        [task.complete]
        on-init = [
            "4", "raw_memset", "0", "4", "0xab",
            "3", "trim", "1", "2",
        ]
        "#,
        &[],
    );
    let dest = NamedTempFile::new().unwrap();

    fwapply()
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .success();

    let image = fs::read(dest.path()).unwrap();
    assert_eq!(image.len(), 4 * BLOCK_SIZE);
    assert!(image[..BLOCK_SIZE].iter().all(|&b| b == 0xAB));
    assert!(image[BLOCK_SIZE..3 * BLOCK_SIZE].iter().all(|&b| b == 0));
    assert!(image[3 * BLOCK_SIZE..].iter().all(|&b| b == 0xAB));
}

#[test]
fn mbr_write_renders_partition_table() {
    let bundle = TempDir::new().unwrap();
    write_bundle(
        bundle.path(),
        r#"
        [mbr.main]
        signature = 0x01020304
        [[mbr.main.partition]]
        block-offset = 63
        block-count = 77261
        type = 0x83
        boot = true

        [task.complete]
        on-init = ["2", "mbr_write", "main"]
        "#,
        &[],
    );
    let dest = NamedTempFile::new().unwrap();

    fwapply()
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .success();

    let image = fs::read(dest.path()).unwrap();
    assert_eq!(image.len(), BLOCK_SIZE);
    assert_eq!(&image[440..444], &[0x04, 0x03, 0x02, 0x01]);
    assert_eq!(image[446], 0x80);
    assert_eq!(image[450], 0x83);
    assert_eq!(&image[454..458], &63u32.to_le_bytes());
    assert_eq!(&image[458..462], &77261u32.to_le_bytes());
    assert_eq!(&image[510..512], &[0x55, 0xAA]);
}

/// Format a partition, stream a resource into it, then exercise the FAT
/// metadata actions; verify by mounting the partition image afterwards.
#[test]
fn fat_partition_flow() {
    let bundle = TempDir::new().unwrap();
    let data = payload(3, 3000);
    write_bundle(
        bundle.path(),
        &format!(
            r#"
            [file-resource.boot]
            blake2b-256 = "{}"
            length = [3000]

            [task.complete]
            on-init = ["3", "fat_mkfs", "2048", "65536"]
            on-finish = [
                "3", "fat_mkdir", "2048", "LOGS",
                "3", "fat_touch", "2048", "MARKER.TXT",
                "4", "fat_attrib", "2048", "BOOT.BIN", "sh",
                "3", "fat_setlabel", "2048", "FIRMWARE",
            ]
            [[task.complete.on-resource]]
            resource = "boot"
            funlist = ["3", "fat_write", "2048", "BOOT.BIN"]
            "#,
            blake2b_hex(&data)
        ),
        &[("boot", &data)],
    );
    let dest = NamedTempFile::new().unwrap();

    fwapply()
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .success();

    let image = fs::read(dest.path()).unwrap();
    let mut partition = image[2048 * BLOCK_SIZE..].to_vec();
    partition.resize(65536 * BLOCK_SIZE, 0);
    let fs = fatfs::FileSystem::new(
        Cursor::new(partition),
        fatfs::FsOptions::new(),
    )
    .unwrap();
    assert_eq!(fs.volume_label(), "FIRMWARE");

    let root = fs.root_dir();
    let mut content = Vec::new();
    {
        use std::io::Read;
        root.open_file("BOOT.BIN")
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
    }
    assert_eq!(content, data);

    let entries: Vec<_> = root.iter().map(|e| e.unwrap()).collect();
    let boot = entries.iter().find(|e| e.file_name() == "BOOT.BIN").unwrap();
    assert!(boot.attributes().contains(fatfs::FileAttributes::SYSTEM));
    assert!(boot.attributes().contains(fatfs::FileAttributes::HIDDEN));
    assert!(entries.iter().any(|e| e.file_name() == "LOGS" && e.is_dir()));
    let marker =
        entries.iter().find(|e| e.file_name() == "MARKER.TXT").unwrap();
    assert_eq!(marker.len(), 0);
}

#[test]
fn fat_mv_refuses_to_overwrite() {
    let bundle = TempDir::new().unwrap();
    write_bundle(
        bundle.path(),
        r#"
        [task.complete]
        on-init = [
            "3", "fat_mkfs", "0", "16384",
            "3", "fat_touch", "0", "A.TXT",
            "3", "fat_touch", "0", "B.TXT",
            "4", "fat_mv", "0", "A.TXT", "B.TXT",
        ]
        "#,
        &[],
    );
    let dest = NamedTempFile::new().unwrap();

    let cmd = fwapply()
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .failure();
    assert!(stderr_of(&cmd).contains("'B.TXT' already exists"));
}

#[test]
fn fat_mv_forced_replaces_destination() {
    let bundle = TempDir::new().unwrap();
    write_bundle(
        bundle.path(),
        r#"
        [task.complete]
        on-init = [
            "3", "fat_mkfs", "0", "16384",
            "3", "fat_touch", "0", "A.TXT",
            "3", "fat_touch", "0", "B.TXT",
            "4", "fat_mv!", "0", "A.TXT", "B.TXT",
            "3", "fat_rm", "0", "GHOST.TXT",
        ]
        "#,
        &[],
    );
    let dest = NamedTempFile::new().unwrap();

    fwapply()
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .success();

    let mut image = fs::read(dest.path()).unwrap();
    image.resize(16384 * BLOCK_SIZE, 0);
    let fs =
        fatfs::FileSystem::new(Cursor::new(image), fatfs::FsOptions::new())
            .unwrap();
    let names: Vec<String> = fs
        .root_dir()
        .iter()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert!(names.contains(&"B.TXT".to_string()));
    assert!(!names.contains(&"A.TXT".to_string()));
}

#[test]
fn fat_rm_strict_requires_presence() {
    let bundle = TempDir::new().unwrap();
    write_bundle(
        bundle.path(),
        r#"
        [task.complete]
        on-init = [
            "3", "fat_mkfs", "0", "16384",
            "3", "fat_rm!", "0", "GHOST.TXT",
        ]
        "#,
        &[],
    );
    let dest = NamedTempFile::new().unwrap();

    let cmd = fwapply()
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .failure();
    assert!(stderr_of(&cmd).contains("'GHOST.TXT' does not exist"));
}

/// Setting and then unsetting a variable leaves the environment block
/// bit-identical to its cleared state.
#[test]
fn uboot_env_round_trip() {
    let bundle = TempDir::new().unwrap();
    write_bundle(
        bundle.path(),
        r#"
        [uboot-environment.env]
        block-offset = 16
        block-count = 1

        [task.clear]
        on-init = ["2", "uboot_clearenv", "env"]

        [task.setunset]
        on-init = [
            "4", "uboot_setenv", "env", "foo", "bar",
            "3", "uboot_unsetenv", "env", "foo",
        ]

        [task.set]
        on-init = ["4", "uboot_setenv", "env", "foo", "bar"]
        "#,
        &[],
    );
    let dest = NamedTempFile::new().unwrap();

    let run = |task: &str| {
        fwapply()
            .arg("-t")
            .arg(task)
            .arg("-d")
            .arg(dest.path())
            .arg(bundle.path())
            .assert()
            .success();
    };

    run("clear");
    let cleared = fs::read(dest.path()).unwrap();
    assert_eq!(cleared.len(), 17 * BLOCK_SIZE);

    run("set");
    let set = fs::read(dest.path()).unwrap();
    assert_ne!(set, cleared);

    run("clear");
    run("setunset");
    assert_eq!(fs::read(dest.path()).unwrap(), cleared);
}

/// `uboot_recover` rewrites a corrupt environment once and then leaves it
/// alone.
#[test]
fn uboot_recover_is_idempotent() {
    let bundle = TempDir::new().unwrap();
    write_bundle(
        bundle.path(),
        r#"
        [uboot-environment.env]
        block-offset = 16
        block-count = 1

        [task.recover]
        on-init = ["2", "uboot_recover", "env"]
        "#,
        &[],
    );
    let dest = NamedTempFile::new().unwrap();
    // Seed the env block with garbage that cannot parse.
    let mut image = vec![0u8; 17 * BLOCK_SIZE];
    image[16 * BLOCK_SIZE..].fill(0xFF);
    fs::write(dest.path(), &image).unwrap();

    let run = || {
        fwapply()
            .arg("-t")
            .arg("recover")
            .arg("-d")
            .arg(dest.path())
            .arg(bundle.path())
            .assert()
            .success();
    };

    run();
    let first = fs::read(dest.path()).unwrap();
    assert_ne!(&first[16 * BLOCK_SIZE..], &image[16 * BLOCK_SIZE..]);

    run();
    assert_eq!(fs::read(dest.path()).unwrap(), first);
}

/// A digest mismatch fails the action after the bytes went out, and
/// nothing later in the task runs.
#[test]
fn digest_mismatch_aborts_apply() {
    let bundle = TempDir::new().unwrap();
    let data = payload(4, 1024);
    let mut hash = blake2b_hex(&data).into_bytes();
    hash[0] = if hash[0] == b'0' { b'1' } else { b'0' };
    write_bundle(
        bundle.path(),
        &format!(
            r#"
            [file-resource.boot]
            blake2b-256 = "{}"
            length = [1024]

            [task.complete]
            on-finish = ["2", "error", "should not run"]
            [[task.complete.on-resource]]
            resource = "boot"
            funlist = ["2", "raw_write", "0"]
            "#,
            String::from_utf8(hash).unwrap()
        ),
        &[("boot", &data)],
    );
    let dest = NamedTempFile::new().unwrap();

    let cmd = fwapply()
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .failure();
    let stderr = stderr_of(&cmd);
    assert!(stderr.contains("blake2b-256 digest mismatch on 'boot'"));
    assert!(!stderr.contains("should not run"));
}

#[test]
fn short_payload_reports_length_mismatch() {
    let bundle = TempDir::new().unwrap();
    let data = payload(5, 700);
    write_bundle(
        bundle.path(),
        &format!(
            r#"
            [file-resource.boot]
            blake2b-256 = "{}"
            length = [1024]

            [task.complete]
            [[task.complete.on-resource]]
            resource = "boot"
            funlist = ["2", "raw_write", "0"]
            "#,
            blake2b_hex(&data)
        ),
        &[("boot", &data)],
    );
    let dest = NamedTempFile::new().unwrap();

    let cmd = fwapply()
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .failure();
    assert!(stderr_of(&cmd)
        .contains("wrote 700 bytes of 'boot', but expected 1024"));
}

/// Two write actions in one on-resource block: the second one finds the
/// stream already drained.
#[test]
fn double_write_in_one_event() {
    let bundle = TempDir::new().unwrap();
    let data = payload(6, 512);
    write_bundle(
        bundle.path(),
        &format!(
            r#"
            [file-resource.boot]
            blake2b-256 = "{}"
            length = [512]

            [task.complete]
            [[task.complete.on-resource]]
            resource = "boot"
            funlist = [
                "2", "raw_write", "0",
                "2", "raw_write", "100",
            ]
            "#,
            blake2b_hex(&data)
        ),
        &[("boot", &data)],
    );
    let dest = NamedTempFile::new().unwrap();

    let cmd = fwapply()
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .failure();
    assert!(stderr_of(&cmd).contains("didn't write anything"));
}

#[rstest]
#[case::path_write("path_write")]
#[case::pipe_write("pipe_write")]
#[case::execute("execute")]
fn unsafe_actions_require_the_flag(#[case] action: &str) {
    let bundle = TempDir::new().unwrap();
    let data = payload(7, 64);
    let (funlist, on_resource) = if action == "execute" {
        (format!(r#"on-init = ["2", "execute", "true"]"#), String::new())
    } else {
        (
            String::new(),
            format!(
                r#"
                [[task.complete.on-resource]]
                resource = "boot"
                funlist = ["2", "{action}", "/dev/null"]
                "#
            ),
        )
    };
    write_bundle(
        bundle.path(),
        &format!(
            r#"
            [file-resource.boot]
            blake2b-256 = "{}"
            length = [64]

            [task.complete]
            {funlist}
            {on_resource}
            "#,
            blake2b_hex(&data)
        ),
        &[("boot", &data)],
    );
    let dest = NamedTempFile::new().unwrap();

    let cmd = fwapply()
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .failure();
    assert!(stderr_of(&cmd).contains(&format!("{action} requires --unsafe")));
}

/// `path_write` streams to a host file; the trailing hole is topped off
/// with up to one block of zeros.
#[test]
fn path_write_streams_to_host_file() {
    let bundle = TempDir::new().unwrap();
    let outdir = TempDir::new().unwrap();
    let target = outdir.path().join("out.bin");
    let data = payload(8, 512);
    write_bundle(
        bundle.path(),
        &format!(
            r#"
            [file-resource.boot]
            blake2b-256 = "{}"
            length = [512, -512]

            [task.complete]
            [[task.complete.on-resource]]
            resource = "boot"
            funlist = ["2", "path_write", "{}"]
            "#,
            blake2b_hex(&data),
            target.display()
        ),
        &[("boot", &data)],
    );
    let dest = NamedTempFile::new().unwrap();

    fwapply()
        .arg("--unsafe")
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .success();

    let written = fs::read(&target).unwrap();
    assert_eq!(written.len(), 1024);
    assert_eq!(&written[..512], &data[..]);
    assert!(written[512..].iter().all(|&b| b == 0));
}

#[test]
fn pipe_write_streams_to_subprocess() {
    let bundle = TempDir::new().unwrap();
    let outdir = TempDir::new().unwrap();
    let target = outdir.path().join("piped.bin");
    let data = payload(9, 2048);
    write_bundle(
        bundle.path(),
        &format!(
            r#"
            [file-resource.boot]
            blake2b-256 = "{}"
            length = [2048]

            [task.complete]
            [[task.complete.on-resource]]
            resource = "boot"
            funlist = ["2", "pipe_write", "cat > {}"]
            "#,
            blake2b_hex(&data),
            target.display()
        ),
        &[("boot", &data)],
    );
    let dest = NamedTempFile::new().unwrap();

    fwapply()
        .arg("--unsafe")
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .success();

    assert_eq!(fs::read(&target).unwrap(), data);
}

/// `execute` forwards the subprocess's stdout to the warning stream.
#[test]
fn execute_forwards_output() {
    let bundle = TempDir::new().unwrap();
    write_bundle(
        bundle.path(),
        r#"
        [task.complete]
        on-init = ["2", "execute", "echo hello-from-subprocess"]
        "#,
        &[],
    );
    let dest = NamedTempFile::new().unwrap();

    let cmd = fwapply()
        .env("RUST_LOG", "warn")
        .arg("--unsafe")
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .success();
    assert!(stderr_of(&cmd).contains("hello-from-subprocess"));
}

#[test]
fn info_emits_to_warning_stream() {
    let bundle = TempDir::new().unwrap();
    write_bundle(
        bundle.path(),
        r#"
        [task.complete]
        on-init = ["2", "info", "entering recovery"]
        "#,
        &[],
    );
    let dest = NamedTempFile::new().unwrap();

    let cmd = fwapply()
        .env("RUST_LOG", "warn")
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .success();
    assert!(stderr_of(&cmd).contains("entering recovery"));
}

/// A run-phase failure dumps the recent-action trace.
#[test]
fn failure_dumps_action_trace() {
    let bundle = TempDir::new().unwrap();
    write_bundle(
        bundle.path(),
        r#"
        [task.complete]
        on-init = [
            "4", "raw_memset", "0", "1", "0",
            "2", "error", "deliberate failure",
        ]
        "#,
        &[],
    );
    let dest = NamedTempFile::new().unwrap();

    let cmd = fwapply()
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .failure();
    let stderr = stderr_of(&cmd);
    assert!(stderr.contains("deliberate failure"));
    assert!(stderr.contains("Most recent actions:"));
    assert!(stderr.contains("raw_memset 0 1 0"));
}

/// The run-phase step log is stable.
#[rstest]
#[case::two_steps(
    r#"
    [task.complete]
    on-init = [
        "4", "raw_memset", "0", "2", "0xab",
        "3", "trim", "0", "256",
    ]
    "#,
    "[INFO  fwapply::apply] 1 raw_memset 0 2 171
[INFO  fwapply::apply] 2 trim 0 256
"
)]
fn step_log_stability(#[case] manifest: &str, #[case] expected: &str) {
    let bundle = TempDir::new().unwrap();
    write_bundle(bundle.path(), manifest, &[]);
    let dest = NamedTempFile::new().unwrap();

    let cmd = fwapply()
        .env("RUST_LOG", "info")
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .success();
    assert_eq!(expected, stderr_of(&cmd));
}

#[rstest]
// Arity errors surface at validation time, before any destination work.
#[case::bad_arity(
    r#"
    [task.complete]
    on-init = ["1", "raw_memset"]
    "#,
    "raw_memset requires a block offset, count, and value"
)]
// File-kind actions cannot appear outside an on-resource block.
#[case::misplaced_raw_write(
    r#"
    [task.complete]
    on-init = ["2", "raw_write", "0"]
    "#,
    "raw_write is only usable in an on-resource block"
)]
// References must resolve.
#[case::missing_mbr(
    r#"
    [task.complete]
    on-init = ["2", "mbr_write", "main"]
    "#,
    "mbr_write can't find mbr reference 'main'"
)]
#[case::unknown_action(
    r#"
    [task.complete]
    on-init = ["2", "frobnicate", "0"]
    "#,
    "unknown action 'frobnicate'"
)]
fn check_rejects_bad_manifests(#[case] manifest: &str, #[case] msg: &str) {
    let bundle = TempDir::new().unwrap();
    write_bundle(bundle.path(), manifest, &[]);

    let cmd = fwapply()
        .arg("--check")
        .arg(bundle.path())
        .assert()
        .failure();
    assert!(stderr_of(&cmd).contains(msg));
}

#[test]
fn check_accepts_a_good_manifest() {
    let bundle = TempDir::new().unwrap();
    let data = payload(10, 256);
    write_bundle(
        bundle.path(),
        &format!(
            r#"
            [file-resource.boot]
            blake2b-256 = "{}"
            length = [256]

            [mbr.main]
            [[mbr.main.partition]]
            block-offset = 63
            block-count = 1000
            type = 0x83

            [task.complete]
            on-init = ["2", "mbr_write", "main"]
            [[task.complete.on-resource]]
            resource = "boot"
            funlist = ["2", "raw_write", "63"]
            "#,
            blake2b_hex(&data)
        ),
        &[("boot", &data)],
    );

    fwapply().arg("--check").arg(bundle.path()).assert().success();
}

#[test]
fn unknown_task_is_an_error() {
    let bundle = TempDir::new().unwrap();
    write_bundle(
        bundle.path(),
        r#"
        [task.complete]
        on-init = ["2", "info", "hi"]
        "#,
        &[],
    );
    let dest = NamedTempFile::new().unwrap();

    let cmd = fwapply()
        .arg("-t")
        .arg("upgrade")
        .arg("-d")
        .arg(dest.path())
        .arg(bundle.path())
        .assert()
        .failure();
    assert!(stderr_of(&cmd).contains("no task named 'upgrade'"));
}
