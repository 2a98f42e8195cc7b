#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
    config: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let config = dir.path().join("config.toml");
        fs::write(&config, "").expect("write config");
        Self { dir, config }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn run(&self, args: &[&str]) -> std::process::Output {
        cargo_bin_cmd!("idxcheck")
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .env("RUST_LOG", "off")
            .output()
            .expect("run idxcheck")
    }

    fn sample_btree(&self, rows: u32, table: bool) -> (PathBuf, PathBuf) {
        let index = self.path("accounts_pkey.idx");
        let csv = self.path("accounts.csv");
        let rows = rows.to_string();
        let mut args = vec!["sample", "btree", path_str(&index), "--rows", &rows];
        if table {
            args.extend(["--table", path_str(&csv)]);
        }
        let out = self.run(&args);
        assert!(out.status.success(), "sample failed: {}", String::from_utf8_lossy(&out.stderr));
        (index, csv)
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf-8 temp path")
}

fn json(out: &std::process::Output) -> Value {
    serde_json::from_slice(&out.stdout).unwrap_or_else(|err| {
        panic!(
            "stdout is not json ({err}): {}",
            String::from_utf8_lossy(&out.stdout)
        )
    })
}

#[test]
fn sample_btree_passes_both_checks() {
    let ws = Workspace::new();
    let (index, _) = ws.sample_btree(1000, false);

    let out = ws.run(&["--format", "json", "btree", path_str(&index)]);
    assert!(out.status.success());
    let report = json(&out);
    assert_eq!(report["index"], "accounts_pkey");
    assert_eq!(report["strict"], false);
    assert_eq!(report["items_checked"].as_u64().map(|n| n >= 1000), Some(true));
    assert!(report["heap"].is_null());

    let out = ws.run(&["--format", "json", "btree", "--strict", path_str(&index)]);
    assert!(out.status.success());
    assert_eq!(json(&out)["strict"], true);
}

#[test]
fn table_argument_adds_the_presence_check() {
    let ws = Workspace::new();
    let (index, csv) = ws.sample_btree(700, true);

    let out = ws.run(&[
        "--format",
        "json",
        "btree",
        path_str(&index),
        "--table",
        path_str(&csv),
        "--bloom-seed",
        "7",
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let report = json(&out);
    assert_eq!(report["heapallindexed"], true);
    assert_eq!(report["heap"]["table"], "accounts");
    assert_eq!(report["heap"]["rows_present"], 700);
}

#[test]
fn damaged_page_exits_with_corruption_status() {
    let ws = Workspace::new();
    let (index, _) = ws.sample_btree(1000, false);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&index)
        .expect("open index");
    let offset = 8192 + 100;
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.read_exact(&mut byte).expect("read");
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.write_all(&[!byte[0]]).expect("write");
    drop(file);

    let out = ws.run(&["--format", "json", "btree", path_str(&index)]);
    assert_eq!(out.status.code(), Some(2));
    let failure = json(&out);
    assert_eq!(failure["corrupt"], true);
    assert_eq!(failure["corruption"]["kind"], "checksum");
    assert_eq!(failure["corruption"]["page"], 1);

    let out = ws.run(&["--theme", "plain", "btree", path_str(&index)]);
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stdout).contains("checksum does not match"));
}

#[test]
fn sample_gist_passes() {
    let ws = Workspace::new();
    let index = ws.path("parcels_gist.idx");
    let out = ws.run(&["sample", "gist", path_str(&index), "--rows", "2500"]);
    assert!(out.status.success());

    let out = ws.run(&["--format", "json", "gist", path_str(&index)]);
    assert!(out.status.success());
    let report = json(&out);
    assert_eq!(report["opclass"], "box_ops");
    assert_eq!(report["tuples_checked"].as_u64().map(|n| n >= 2500), Some(true));

    let out = ws.run(&["--theme", "plain", "gist", path_str(&index)]);
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("passed gist check"));
}

#[test]
fn config_file_supplies_defaults() {
    let ws = Workspace::new();
    let (index, _) = ws.sample_btree(300, false);
    fs::write(&ws.config, "[check]\nstrict = true\n\n[output]\nformat = \"json\"\n").expect("write config");

    let out = ws.run(&["btree", path_str(&index)]);
    assert!(out.status.success());
    assert_eq!(json(&out)["strict"], true);
}

#[test]
fn invalid_config_is_rejected() {
    let ws = Workspace::new();
    let (index, _) = ws.sample_btree(10, false);
    fs::write(&ws.config, "[output]\nformat = \"yaml\"\n").expect("write config");

    let out = ws.run(&["btree", path_str(&index)]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("output.format"));
}

#[test]
fn missing_index_file_is_an_error_not_corruption() {
    let ws = Workspace::new();
    let out = ws.run(&["btree", path_str(&ws.path("nope.idx"))]);
    assert_eq!(out.status.code(), Some(1));
}
