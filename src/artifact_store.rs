use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::models::OutputFormat;

const INPUT_FILE_NAME: &str = "input.md";
const PREPROCESSED_FILE_NAME: &str = "input.preprocessed.md";

pub async fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create directory {}", path.display()))
}

pub fn job_dir(work_root: &Path, job_id: &str) -> PathBuf {
    work_root.join("jobs").join(job_id)
}

pub fn input_path(job_dir: &Path) -> PathBuf {
    job_dir.join(INPUT_FILE_NAME)
}

pub fn preprocessed_path(job_dir: &Path) -> PathBuf {
    job_dir.join(PREPROCESSED_FILE_NAME)
}

/// Outputs live under `<job_dir>/out` so the renderer's same-basename output
/// lands next to the converter's.
pub fn output_dir(job_dir: &Path) -> PathBuf {
    job_dir.join("out")
}

pub fn output_path(job_dir: &Path, stem: &str, format: OutputFormat) -> PathBuf {
    output_dir(job_dir).join(format!("{stem}.{}", format.extension()))
}

/// Reduces an uploaded file name to a safe basename.
pub fn sanitize_file_name(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or("").trim();
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '"' | ':' | '*' | '?' | '<' | '>' | '|'))
        .collect();
    let cleaned = cleaned.trim_start_matches('.').trim().to_string();
    if cleaned.is_empty() {
        "notes.md".to_string()
    } else {
        cleaned
    }
}

pub async fn write_input(job_dir: &Path, content: &[u8]) -> Result<PathBuf> {
    ensure_dir(job_dir).await?;
    let path = input_path(job_dir);
    fs::write(&path, content)
        .await
        .with_context(|| format!("Failed to write upload to {}", path.display()))?;
    Ok(path)
}

pub async fn delete_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

pub async fn delete_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}
