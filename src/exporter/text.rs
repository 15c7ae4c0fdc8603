//! Prometheus text exposition and atomic textfile output.

#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::Path;

use prometheus::proto::MetricFamily;
use prometheus::{Encoder, TextEncoder};

use crate::core::errors::{MgError, Result};

/// Encode gathered families in the text format a textfile collector reads.
pub fn render_text(families: &[MetricFamily]) -> Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(families, &mut buf)?;
    String::from_utf8(buf).map_err(|e| MgError::Metrics {
        details: format!("exposition is not UTF-8: {e}"),
    })
}

/// Write `contents` to `path` via a sibling `.tmp` file and `rename`, so a
/// textfile reader never sees a half-written scrape.
pub fn write_textfile_atomic(path: &Path, contents: &str) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| MgError::io(parent, source))?;
    }

    let result = (|| {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            opts.mode(0o644);
        }
        let mut file = opts.open(&tmp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if let Err(source) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(MgError::io(path, source));
    }
    Ok(())
}
