use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Docx,
    Pdf,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Docx => "docx",
            Self::Pdf => "pdf",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            Self::Pdf => "application/pdf",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "docx" => Some(Self::Docx),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub file_name: String,
    pub content: String,
    pub formats: Vec<OutputFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAcceptedResponse {
    pub job_id: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleRequest {
    pub job_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: String,
    pub state: JobState,
    pub progress: u8,
    pub time_left_seconds: u64,
    pub outputs: BTreeMap<OutputFormat, bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub file_name: String,
    pub file_size_bytes: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One admitted conversion request.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub state: JobState,
    pub progress: u8,
    pub file_size_bytes: u64,
    pub original_name: String,
    pub job_dir: PathBuf,
    pub input_path: PathBuf,
    pub requested_formats: BTreeSet<OutputFormat>,
    pub outputs: BTreeMap<OutputFormat, PathBuf>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_duration_ms: Option<u64>,
    pub artifacts_purged: bool,
}

impl JobRecord {
    /// Output file stem derived from the uploaded name (`notes.md` -> `notes`).
    pub fn output_stem(&self) -> String {
        let stem = std::path::Path::new(&self.original_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .trim();
        if stem.is_empty() {
            "document".to_string()
        } else {
            stem.to_string()
        }
    }

    /// `queue_position` is the zero-based index in the admission queue and is
    /// only consulted while the job is queued.
    pub fn time_left_seconds(
        &self,
        now: DateTime<Utc>,
        queue_position: Option<usize>,
        slot_seconds: u64,
    ) -> u64 {
        match self.state {
            JobState::Queued => {
                let position = queue_position.unwrap_or(0) as u64;
                (position + 1) * slot_seconds
            }
            JobState::Processing => {
                let estimate = self.estimated_duration_ms.unwrap_or(0);
                let elapsed = self
                    .started_at
                    .map(|started| (now - started).num_milliseconds().max(0) as u64)
                    .unwrap_or(0);
                estimate.saturating_sub(elapsed).div_ceil(1000)
            }
            JobState::Completed | JobState::Error => 0,
        }
    }

    pub fn to_response(
        &self,
        now: DateTime<Utc>,
        queue_position: Option<usize>,
        slot_seconds: u64,
    ) -> JobStatusResponse {
        let outputs = self
            .requested_formats
            .iter()
            .map(|format| (*format, self.outputs.contains_key(format)))
            .collect();

        JobStatusResponse {
            job_id: self.job_id.clone(),
            state: self.state,
            progress: self.progress,
            time_left_seconds: self.time_left_seconds(now, queue_position, slot_seconds),
            outputs,
            error: self.error.clone(),
            file_name: self.original_name.clone(),
            file_size_bytes: self.file_size_bytes,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Heuristic run time used for the processing-phase estimate.
pub fn estimate_duration_ms(file_size_bytes: u64, formats: &BTreeSet<OutputFormat>) -> u64 {
    let kib = file_size_bytes / 1024;
    let mut estimate = 3_000 + kib * 20;
    if formats.contains(&OutputFormat::Pdf) {
        estimate += 6_000 + kib * 40;
    }
    estimate
}
