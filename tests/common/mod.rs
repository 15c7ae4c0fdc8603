#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_mountguard") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) {
        "mountguard.exe"
    } else {
        "mountguard"
    };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve mountguard binary path for integration test"),
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    run_cli_case_with_env(case_name, args, &[])
}

pub fn run_cli_case_with_env(case_name: &str, args: &[&str], env: &[(&str, &str)]) -> CmdResult {
    let root = std::env::temp_dir().join("mountguard-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let mut command = Command::new(&bin_path);
    command
        .args(args)
        .env("RUST_BACKTRACE", "1")
        .env_remove("MOUNTGUARD_OUTPUT_FORMAT");
    for (name, value) in env {
        command.env(name, value);
    }
    let output = command.output().expect("execute mountguard command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("env={env:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// A fake procfs + config pair under `dir`. Each mount is `(mount_point, fs_type)`;
/// mount points are written verbatim into `<dir>/proc/1/mountinfo`.
pub struct Fixture {
    pub config_path: PathBuf,
    pub proc_path: PathBuf,
    pub jsonl_path: PathBuf,
}

impl Fixture {
    pub fn new(dir: &Path, mounts: &[(&str, &str)]) -> Self {
        let proc_path = dir.join("proc");
        fs::create_dir_all(proc_path.join("1")).expect("create fake proc");

        let mut mountinfo = String::new();
        for (idx, (mount_point, fs_type)) in mounts.iter().enumerate() {
            mountinfo.push_str(&format!(
                "{} 1 8:{idx} / {mount_point} rw,relatime shared:1 - {fs_type} /dev/fake{idx} rw\n",
                idx + 20
            ));
        }
        fs::write(proc_path.join("1/mountinfo"), mountinfo).expect("write mountinfo");

        let jsonl_path = dir.join("activity.jsonl");
        let config_path = dir.join("config.toml");
        fs::write(
            &config_path,
            format!(
                "[paths]\nproc_path = {:?}\njsonl_log = {:?}\n\n[collector]\nmount_timeout_ms = 2000\n",
                proc_path.to_string_lossy(),
                jsonl_path.to_string_lossy()
            ),
        )
        .expect("write config");

        Self {
            config_path,
            proc_path,
            jsonl_path,
        }
    }

    pub fn config_arg(&self) -> String {
        self.config_path.to_string_lossy().into_owned()
    }
}
