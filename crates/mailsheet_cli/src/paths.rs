//! Template lookup and output naming.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::NaiveDateTime;

use crate::config::C_OUTPUT_NAME_DEFAULT;

/// Resolve the configured template, falling back to the executable's directory.
pub fn resolve_template_path(c_path: &str) -> Result<PathBuf> {
    let dir_exe = std::env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(Path::to_path_buf));
    resolve_template_path_from(c_path, dir_exe.as_deref())
}

/// First existing match wins: the path as given, then `<dir_exe>/<basename>`.
pub fn resolve_template_path_from(c_path: &str, dir_exe: Option<&Path>) -> Result<PathBuf> {
    let c_path = c_path.trim();
    if c_path.is_empty() {
        bail!("Empty template path");
    }
    let path = Path::new(c_path);
    if path.exists() {
        return Ok(path.to_path_buf());
    }

    let Some(c_basename) = path.file_name() else {
        bail!("Template path has no file name: {c_path}");
    };
    let path_candidate = match dir_exe {
        Some(dir) => dir.join(c_basename),
        None => PathBuf::from(c_basename),
    };
    if path_candidate.exists() {
        return Ok(path_candidate);
    }
    bail!(
        "Template not found near executable: {}",
        path_candidate.display()
    )
}

/// Build `{dir}/{name}_{YYYYmmdd_HHMMSS}.xlsx`, creating `dir` when missing.
pub fn derive_output_path(dir_output: &Path, output_name: &str, now: NaiveDateTime) -> Result<PathBuf> {
    fs::create_dir_all(dir_output)
        .with_context(|| format!("Failed to create output dir {}", dir_output.display()))?;
    let c_name = match output_name.trim() {
        "" => C_OUTPUT_NAME_DEFAULT,
        c_name => c_name,
    };
    Ok(dir_output.join(format!("{c_name}_{}.xlsx", now.format("%Y%m%d_%H%M%S"))))
}
