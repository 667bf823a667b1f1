use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::Arc,
};

use tokio::fs;
use tracing::{info, warn};

use crate::{
    artifact_store::{
        delete_dir_if_exists, delete_file_if_exists, ensure_dir, output_dir, output_path,
        preprocessed_path,
    },
    error::ConvertError,
    manager::JobRegistry,
    models::OutputFormat,
    preprocess::Preprocessor,
    tools::DocumentTools,
};

/// Collaborators shared by every pipeline run.
#[derive(Clone)]
pub struct PipelineContext {
    pub preprocessor: Preprocessor,
    pub tools: Arc<dyn DocumentTools>,
}

/// What a worker needs to run one job, captured when the job is promoted.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_id: String,
    pub job_dir: PathBuf,
    pub input_path: PathBuf,
    pub output_stem: String,
    pub requested_formats: BTreeSet<OutputFormat>,
}

pub type JobOutputs = BTreeMap<OutputFormat, PathBuf>;

/// Runs every stage for one job.
///
/// On failure nothing produced by this run is kept. Input cleanup is left to
/// the caller so it also happens when this future panics.
pub async fn execute(
    ctx: &PipelineContext,
    registry: &JobRegistry,
    job: &JobSpec,
) -> Result<JobOutputs, ConvertError> {
    let result = run_stages(ctx, registry, job).await;
    if let Err(err) = &result {
        warn!(job_id = %job.job_id, "Pipeline failed: {err}");
        if let Err(cleanup_err) = delete_dir_if_exists(&output_dir(&job.job_dir)).await {
            warn!(job_id = %job.job_id, "Failed to discard partial outputs: {cleanup_err:#}");
        }
    }
    result
}

async fn run_stages(
    ctx: &PipelineContext,
    registry: &JobRegistry,
    job: &JobSpec,
) -> Result<JobOutputs, ConvertError> {
    let wants_docx = job.requested_formats.contains(&OutputFormat::Docx);
    let wants_pdf = job.requested_formats.contains(&OutputFormat::Pdf);

    registry.advance(&job.job_id, 10).await;
    let raw = fs::read(&job.input_path)
        .await
        .map_err(|e| ConvertError::Internal(format!("Failed to read uploaded notes: {e}")))?;
    let text = String::from_utf8_lossy(&raw).into_owned();
    registry.advance(&job.job_id, 20).await;

    let converter_input = preprocess_stage(ctx, job, &text).await;
    registry.advance(&job.job_id, 40).await;

    ensure_dir(&output_dir(&job.job_dir)).await?;
    let docx_path = output_path(&job.job_dir, &job.output_stem, OutputFormat::Docx);
    ctx.tools.convert(&converter_input, &docx_path).await?;
    info!(job_id = %job.job_id, output = %docx_path.display(), "Primary conversion finished");

    let mut outputs = JobOutputs::new();
    if wants_docx {
        outputs.insert(OutputFormat::Docx, docx_path.clone());
    }
    registry.advance(&job.job_id, 70).await;

    if wants_pdf {
        match ctx
            .tools
            .render_pdf(&docx_path, &output_dir(&job.job_dir))
            .await
        {
            Ok(pdf_path) => {
                info!(job_id = %job.job_id, output = %pdf_path.display(), "PDF rendering finished");
                outputs.insert(OutputFormat::Pdf, pdf_path);
            }
            Err(err) if wants_docx => {
                warn!(job_id = %job.job_id, "PDF rendering failed, keeping DOCX only: {err}");
            }
            Err(err) => return Err(err),
        }
        registry.advance(&job.job_id, 100).await;
    }

    if !wants_docx {
        delete_file_if_exists(&docx_path).await?;
    }

    Ok(outputs)
}

/// Returns the file the converter should read. Preprocessing never fails the
/// job; any error falls back to the original upload.
async fn preprocess_stage(ctx: &PipelineContext, job: &JobSpec, text: &str) -> PathBuf {
    let outcome = match ctx.preprocessor.rewrite(text).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(job_id = %job.job_id, "Preprocessing failed, converting original text: {err}");
            return job.input_path.clone();
        }
    };

    if outcome.substituted == 0 {
        return job.input_path.clone();
    }

    let path = preprocessed_path(&job.job_dir);
    match fs::write(&path, outcome.text.as_bytes()).await {
        Ok(()) => {
            info!(
                job_id = %job.job_id,
                substituted = outcome.substituted,
                skipped = outcome.skipped,
                "Glyphs substituted"
            );
            path
        }
        Err(err) => {
            warn!(job_id = %job.job_id, "Failed to write preprocessed notes: {err}");
            job.input_path.clone()
        }
    }
}

/// Deletes the upload and the preprocessed copy.
pub async fn cleanup_inputs(job: &JobSpec) {
    for path in [job.input_path.clone(), preprocessed_path(&job.job_dir)] {
        if let Err(err) = delete_file_if_exists(&path).await {
            warn!(job_id = %job.job_id, "Input cleanup failed: {err:#}");
        }
    }
}
