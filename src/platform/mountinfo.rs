//! `/proc/<pid>/mountinfo` parser.
//!
//! Line layout (see proc(5)):
//!
//! ```text
//! 36 35 98:0 /mnt1 /mnt/parent rw,noatime master:1 - ext3 /dev/root rw,errors=continue
//! (1)(2)(3)   (4)   (5)         (6)      (7)     (8) (9)  (10)      (11)
//! ```
//!
//! Field 7 is a variable-length list of optional tags terminated by the
//! lone `-` separator, so the line is split on `" - "` first.

#![allow(missing_docs)]

use std::path::PathBuf;

use memchr::memmem;

use crate::core::errors::{MgError, Result};
use crate::platform::pal::MountLabel;

const SEPARATOR: &[u8] = b" - ";

/// Parse a full mountinfo document.
///
/// Structurally broken lines are skipped with a warning; an unparseable
/// `major:minor` field fails the whole parse since it means the table itself
/// cannot be trusted.
pub fn parse_mountinfo(raw: &str) -> Result<Vec<MountLabel>> {
    let finder = memmem::Finder::new(SEPARATOR);
    let mut mounts = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&finder, line) {
            Ok(Some(mount)) => mounts.push(mount),
            Ok(None) => {
                eprintln!(
                    "[MG-MOUNTS] warning: skipping malformed mountinfo line {}: {line}",
                    idx + 1
                );
            }
            Err(details) => {
                return Err(MgError::MountParse {
                    details: format!("line {}: {details}", idx + 1),
                });
            }
        }
    }
    Ok(mounts)
}

fn parse_line(
    finder: &memmem::Finder<'_>,
    line: &str,
) -> std::result::Result<Option<MountLabel>, String> {
    let Some(split) = finder.find(line.as_bytes()) else {
        return Ok(None);
    };
    let (head, tail) = (&line[..split], &line[split + SEPARATOR.len()..]);

    let pre: Vec<&str> = head.split_whitespace().collect();
    let post: Vec<&str> = tail.split_whitespace().collect();
    if pre.len() < 6 || post.len() < 2 {
        return Ok(None);
    }

    let (major, minor) = parse_device_number(pre[2])?;

    Ok(Some(MountLabel {
        device: unescape_field(post[1]),
        mount_point: unescape_mount_path(pre[4]),
        fs_type: post[0].to_string(),
        mount_options: pre[5].to_string(),
        super_options: post.get(2).copied().unwrap_or_default().to_string(),
        major: major.to_string(),
        minor: minor.to_string(),
    }))
}

fn parse_device_number(field: &str) -> std::result::Result<(u32, u32), String> {
    let parsed = field
        .split_once(':')
        .and_then(|(major, minor)| Some((major.parse().ok()?, minor.parse().ok()?)));
    parsed.ok_or_else(|| format!("invalid major:minor {field:?}"))
}

/// Kernel escapes space, tab, newline and backslash as `\ooo` octal.
fn unescape_bytes(raw: &str) -> Vec<u8> {
    let raw_bytes = raw.as_bytes();
    let mut bytes = Vec::with_capacity(raw_bytes.len());
    let mut i = 0;
    while i < raw_bytes.len() {
        if raw_bytes[i] == b'\\'
            && let Some(&[a, b, c]) = raw_bytes.get(i + 1..i + 4)
            && [a, b, c].iter().all(|d| (b'0'..=b'7').contains(d))
            && a <= b'3'
        {
            bytes.push((a - b'0') * 64 + (b - b'0') * 8 + (c - b'0'));
            i += 4;
            continue;
        }
        bytes.push(raw_bytes[i]);
        i += 1;
    }
    bytes
}

fn unescape_field(raw: &str) -> String {
    String::from_utf8_lossy(&unescape_bytes(raw)).into_owned()
}

fn unescape_mount_path(raw: &str) -> PathBuf {
    let bytes = unescape_bytes(raw);
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStringExt;
        PathBuf::from(std::ffi::OsString::from_vec(bytes))
    }
    #[cfg(not(unix))]
    {
        PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())
    }
}
