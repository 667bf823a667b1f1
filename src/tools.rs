use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{io::AsyncReadExt, process::Command, time};
use tracing::{debug, info, warn};

use crate::{config::Config, error::ConvertError};

const STDERR_TAIL_BYTES: usize = 4 * 1024;

/// The two external conversions a job can need.
#[async_trait]
pub trait DocumentTools: Send + Sync {
    /// Markup to DOCX, written to `output`.
    async fn convert(&self, input: &Path, output: &Path) -> Result<(), ConvertError>;

    /// DOCX to PDF, written as `<out_dir>/<document stem>.pdf`. Returns that path.
    async fn render_pdf(&self, document: &Path, out_dir: &Path) -> Result<PathBuf, ConvertError>;
}

/// Pandoc for the primary conversion and a headless office suite for PDF.
#[derive(Debug, Clone)]
pub struct ExternalTools {
    pandoc_bin: String,
    reference_doc: Option<PathBuf>,
    lua_filters: Vec<PathBuf>,
    soffice_bin: String,
    timeout: Duration,
}

impl ExternalTools {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pandoc_bin: config.pandoc_bin.clone(),
            reference_doc: config.reference_doc.clone(),
            lua_filters: config.lua_filters.clone(),
            soffice_bin: config.soffice_bin.clone(),
            timeout: config.tool_timeout(),
        }
    }

    fn pandoc_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            input.into(),
            "--from".into(),
            "markdown".into(),
            "--to".into(),
            "docx".into(),
            "--output".into(),
            output.into(),
        ];
        if let Some(reference) = &self.reference_doc {
            let mut arg = OsString::from("--reference-doc=");
            arg.push(reference);
            args.push(arg);
        }
        for filter in &self.lua_filters {
            let mut arg = OsString::from("--lua-filter=");
            arg.push(filter);
            args.push(arg);
        }
        args
    }

    fn soffice_args(document: &Path, out_dir: &Path) -> Vec<OsString> {
        vec![
            "--headless".into(),
            "--norestore".into(),
            "--convert-to".into(),
            "pdf".into(),
            "--outdir".into(),
            out_dir.into(),
            document.into(),
        ]
    }
}

#[async_trait]
impl DocumentTools for ExternalTools {
    async fn convert(&self, input: &Path, output: &Path) -> Result<(), ConvertError> {
        let args = self.pandoc_args(input, output);
        run_tool(&self.pandoc_bin, &args, self.timeout).await?;
        expect_output(&self.pandoc_bin, output).await
    }

    async fn render_pdf(&self, document: &Path, out_dir: &Path) -> Result<PathBuf, ConvertError> {
        let args = Self::soffice_args(document, out_dir);
        run_tool(&self.soffice_bin, &args, self.timeout).await?;

        let mut pdf_name = document.file_stem().unwrap_or_default().to_os_string();
        pdf_name.push(".pdf");
        let pdf = out_dir.join(pdf_name);
        expect_output(&self.soffice_bin, &pdf).await?;
        Ok(pdf)
    }
}

async fn expect_output(tool: &str, path: &Path) -> Result<(), ConvertError> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(());
    }
    Err(ConvertError::ExternalTool {
        tool: tool.to_string(),
        exit_code: Some(0),
        stderr: format!("expected output {} was not produced", path.display()),
    })
}

/// Runs `program` to completion under a time ceiling.
///
/// Stderr is captured for diagnostics. One deadline covers both the child's
/// exit and the stderr drain: on timeout the child is killed and reaped, and
/// a drain still held open by a detached helper is abandoned at the deadline.
pub async fn run_tool(
    program: &str,
    args: &[OsString],
    timeout: Duration,
) -> Result<(), ConvertError> {
    debug!(tool = %program, ?args, "Spawning external tool");
    let started = std::time::Instant::now();
    let deadline = time::Instant::now() + timeout;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ConvertError::Launch {
            tool: program.to_string(),
            source,
        })?;

    let stderr_pipe = child.stderr.take();
    let mut stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stderr_pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let status = match time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            let _ = child.kill().await;
            stderr_task.abort();
            return Err(ConvertError::Internal(format!(
                "Failed waiting for {program}: {err}"
            )));
        }
        Err(_) => {
            if let Err(err) = child.kill().await {
                warn!(tool = %program, "Failed to kill timed out tool: {err}");
            }
            stderr_task.abort();
            warn!(tool = %program, seconds = timeout.as_secs(), "External tool timed out");
            return Err(ConvertError::Timeout {
                tool: program.to_string(),
                seconds: timeout.as_secs(),
            });
        }
    };

    let stderr = match time::timeout_at(deadline, &mut stderr_task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            stderr_task.abort();
            warn!(tool = %program, "Tool exited but a helper kept stderr open; stopped reading");
            Vec::new()
        }
    };
    if status.success() {
        info!(
            tool = %program,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "External tool finished"
        );
        return Ok(());
    }

    Err(ConvertError::ExternalTool {
        tool: program.to_string(),
        exit_code: status.code(),
        stderr: stderr_tail(&stderr),
    })
}

fn stderr_tail(raw: &[u8]) -> String {
    let start = raw.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&raw[start..]).trim().to_string()
}
