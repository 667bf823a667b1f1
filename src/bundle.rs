use std::{
    collections::HashSet,
    fs::File,
    io::{self, Write},
    path::PathBuf,
};

use flate2::{write::GzEncoder, Compression};
use tracing::{debug, info};

use crate::{error::ConvertError, manager::JobManager, models::JobState};

/// One file to place in the archive.
#[derive(Debug, Clone)]
struct BundleEntry {
    name: String,
    path: PathBuf,
}

/// Packs the outputs of every completed job among `job_ids` into a tar.gz.
///
/// Unknown and unfinished jobs are ignored. Artifacts already removed by
/// retention are skipped.
pub async fn build_bundle(manager: &JobManager, job_ids: &[String]) -> Result<Vec<u8>, ConvertError> {
    let mut entries = Vec::new();
    let mut used_names = HashSet::new();
    let mut completed = 0usize;

    for job_id in job_ids {
        let Ok(job) = manager.record(job_id).await else {
            debug!(job_id = %job_id, "Skipping unknown job in bundle");
            continue;
        };
        if job.state != JobState::Completed {
            continue;
        }
        completed += 1;

        let stem = job.output_stem();
        for (format, path) in &job.outputs {
            let name = unique_name(&mut used_names, &stem, format.extension());
            entries.push(BundleEntry {
                name,
                path: path.clone(),
            });
        }
    }

    if completed == 0 {
        return Err(ConvertError::NoContent);
    }

    // Built in memory: inputs are capped at the upload limit and outputs only
    // live for the artifact retention window.
    let bytes = tokio::task::spawn_blocking(move || write_archive(&entries))
        .await
        .map_err(|e| ConvertError::Internal(format!("Bundle task failed: {e}")))?
        .map_err(|e| ConvertError::Internal(format!("Failed to build bundle: {e}")))?;

    info!(jobs = completed, size_bytes = bytes.len(), "Bundle built");
    Ok(bytes)
}

fn unique_name(used: &mut HashSet<String>, stem: &str, extension: &str) -> String {
    let mut candidate = format!("{stem}.{extension}");
    let mut n = 2;
    while !used.insert(candidate.clone()) {
        candidate = format!("{stem} ({n}).{extension}");
        n += 1;
    }
    candidate
}

fn write_archive(entries: &[BundleEntry]) -> io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for entry in entries {
        let mut file = match File::open(&entry.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(entry = %entry.name, "Artifact expired, leaving it out of the bundle");
                continue;
            }
            Err(err) => return Err(err),
        };
        builder.append_file(&entry.name, &mut file)?;
    }

    let mut encoder = builder.into_inner()?;
    encoder.flush()?;
    encoder.finish()
}
