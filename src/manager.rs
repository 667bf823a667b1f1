use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::{
    sync::{mpsc, RwLock},
    time,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    artifact_store::{
        delete_dir_if_exists, delete_file_if_exists, job_dir, sanitize_file_name, write_input,
    },
    config::Config,
    error::ConvertError,
    models::{
        estimate_duration_ms, JobRecord, JobState, JobStatusResponse, OutputFormat,
        SubmitAcceptedResponse,
    },
    pipeline::{self, JobOutputs, JobSpec, PipelineContext},
};

#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, JobRecord>,
    queue: VecDeque<String>,
}

impl JobTable {
    fn queue_position(&self, job_id: &str) -> Option<usize> {
        self.queue.iter().position(|id| id == job_id)
    }
}

/// Job records plus the admission queue, behind one lock.
///
/// Every mutation goes through a method here, so admission, promotion and
/// completion are serialized against each other.
#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<RwLock<JobTable>>,
}

impl JobRegistry {
    async fn admit(&self, record: JobRecord) {
        let mut table = self.inner.write().await;
        table.queue.push_back(record.job_id.clone());
        table.jobs.insert(record.job_id.clone(), record);
    }

    /// Pops queued ids in FIFO order until one still names a queued job and
    /// moves that job to `processing`.
    async fn promote_next(&self) -> Option<JobSpec> {
        let mut table = self.inner.write().await;
        while let Some(job_id) = table.queue.pop_front() {
            let Some(job) = table.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.state != JobState::Queued {
                continue;
            }

            job.state = JobState::Processing;
            job.progress = 0;
            job.started_at = Some(Utc::now());
            job.estimated_duration_ms =
                Some(estimate_duration_ms(job.file_size_bytes, &job.requested_formats));

            return Some(JobSpec {
                job_id: job.job_id.clone(),
                job_dir: job.job_dir.clone(),
                input_path: job.input_path.clone(),
                output_stem: job.output_stem(),
                requested_formats: job.requested_formats.clone(),
            });
        }
        None
    }

    /// Raises the progress of a processing job. Returns `false` once the
    /// record is gone.
    pub async fn advance(&self, job_id: &str, progress: u8) -> bool {
        let mut table = self.inner.write().await;
        let Some(job) = table.jobs.get_mut(job_id) else {
            return false;
        };
        if job.state == JobState::Processing && progress > job.progress {
            job.progress = progress.min(100);
            info!(job_id = %job_id, progress, "Job progress update");
        }
        true
    }

    /// Records the terminal state. Returns outputs nobody can reach anymore
    /// because the record was removed while the job ran.
    async fn finish(&self, job_id: &str, result: Result<JobOutputs, ConvertError>) -> Vec<PathBuf> {
        let mut table = self.inner.write().await;
        let Some(job) = table.jobs.get_mut(job_id) else {
            return match result {
                Ok(outputs) => outputs.into_values().collect(),
                Err(_) => Vec::new(),
            };
        };

        job.completed_at = Some(Utc::now());
        match result {
            Ok(outputs) => {
                job.state = JobState::Completed;
                job.progress = 100;
                job.outputs = outputs
                    .into_iter()
                    .filter(|(format, _)| job.requested_formats.contains(format))
                    .collect();
                info!(
                    job_id = %job_id,
                    outputs = ?job.outputs.keys().collect::<Vec<_>>(),
                    "Job completed"
                );
            }
            Err(err) => {
                job.state = JobState::Error;
                job.outputs.clear();
                job.error = Some(err.to_string());
                error!(job_id = %job_id, "Job failed: {err}");
            }
        }
        Vec::new()
    }

    async fn get(&self, job_id: &str) -> Option<(JobRecord, Option<usize>)> {
        let table = self.inner.read().await;
        let job = table.jobs.get(job_id)?;
        Some((job.clone(), table.queue_position(job_id)))
    }

    async fn remove(&self, job_id: &str) -> Option<JobRecord> {
        let mut table = self.inner.write().await;
        let record = table.jobs.remove(job_id)?;
        table.queue.retain(|id| id != job_id);
        Some(record)
    }

    async fn counts(&self) -> (usize, usize) {
        let table = self.inner.read().await;
        let processing = table
            .jobs
            .values()
            .filter(|job| job.state == JobState::Processing)
            .count();
        (table.queue.len(), processing)
    }
}

enum SchedulerEvent {
    Admitted,
    Finished,
}

/// Sends `Finished` when dropped, so a worker gives its slot back on every
/// exit path, unwinding included.
struct SlotRelease(mpsc::UnboundedSender<SchedulerEvent>);

impl Drop for SlotRelease {
    fn drop(&mut self) {
        let _ = self.0.send(SchedulerEvent::Finished);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub artifacts_purged: usize,
    pub records_evicted: usize,
}

#[derive(Clone)]
pub struct JobManager {
    config: Arc<Config>,
    registry: JobRegistry,
    events: mpsc::UnboundedSender<SchedulerEvent>,
}

impl JobManager {
    /// Creates the manager and spawns its scheduler task.
    pub fn start(config: Config, ctx: PipelineContext) -> Self {
        let config = Arc::new(config);
        let registry = JobRegistry::default();
        let (events, events_rx) = mpsc::unbounded_channel();

        spawn_scheduler(
            config.concurrency_limit.max(1),
            registry.clone(),
            Arc::new(ctx),
            events.clone(),
            events_rx,
        );

        Self {
            config,
            registry,
            events,
        }
    }

    /// Admits a job. Admission is unbounded; only execution is limited.
    pub async fn submit(
        &self,
        file_name: &str,
        content: &[u8],
        formats: BTreeSet<OutputFormat>,
    ) -> Result<SubmitAcceptedResponse, ConvertError> {
        if content.is_empty() {
            return Err(ConvertError::Validation(
                "Request must include note content.".to_string(),
            ));
        }
        if formats.is_empty() {
            return Err(ConvertError::Validation(
                "Request must name at least one output format.".to_string(),
            ));
        }
        if content.len() > self.config.max_upload_bytes {
            return Err(ConvertError::Validation(format!(
                "Note content exceeds the {} byte limit.",
                self.config.max_upload_bytes
            )));
        }

        let job_id = Uuid::new_v4().to_string();
        let dir = job_dir(&self.config.work_root, &job_id);
        let input_path = write_input(&dir, content).await?;

        let now = Utc::now();
        let record = JobRecord {
            job_id: job_id.clone(),
            state: JobState::Queued,
            progress: 0,
            file_size_bytes: content.len() as u64,
            original_name: sanitize_file_name(file_name),
            job_dir: dir,
            input_path,
            requested_formats: formats,
            outputs: Default::default(),
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            estimated_duration_ms: None,
            artifacts_purged: false,
        };

        info!(
            job_id = %job_id,
            file = %record.original_name,
            size_bytes = record.file_size_bytes,
            formats = ?record.requested_formats,
            "Job admitted"
        );
        self.registry.admit(record).await;

        if self.events.send(SchedulerEvent::Admitted).is_err() {
            warn!(job_id = %job_id, "Scheduler is gone; job will stay queued");
        }

        Ok(SubmitAcceptedResponse {
            job_id,
            state: JobState::Queued,
            created_at: now,
        })
    }

    pub async fn status(&self, job_id: &str) -> Result<JobStatusResponse, ConvertError> {
        let (job, position) = self.record_with_position(job_id).await?;
        Ok(job.to_response(Utc::now(), position, self.config.queue_slot_seconds))
    }

    pub async fn record(&self, job_id: &str) -> Result<JobRecord, ConvertError> {
        self.record_with_position(job_id).await.map(|(job, _)| job)
    }

    async fn record_with_position(
        &self,
        job_id: &str,
    ) -> Result<(JobRecord, Option<usize>), ConvertError> {
        self.registry
            .get(job_id)
            .await
            .ok_or_else(|| ConvertError::NotFound(format!("Job {job_id} not found.")))
    }

    /// Forgets the job and deletes its files. A running external tool is not
    /// interrupted; whatever it produces is discarded when it finishes.
    pub async fn cancel(&self, job_id: &str) -> Result<(), ConvertError> {
        let record = self
            .registry
            .remove(job_id)
            .await
            .ok_or_else(|| ConvertError::NotFound(format!("Job {job_id} not found.")))?;

        info!(job_id = %job_id, state = ?record.state, "Job canceled");
        if let Err(err) = delete_dir_if_exists(&record.job_dir).await {
            warn!(job_id = %job_id, "Failed removing files during cancel: {err:#}");
        }
        Ok(())
    }

    pub async fn counts(&self) -> (usize, usize) {
        self.registry.counts().await
    }

    /// Runs both retention sweeps against the current time.
    pub async fn cleanup(&self) -> CleanupReport {
        let now = Utc::now();
        CleanupReport {
            artifacts_purged: self.purge_expired_artifacts(now).await,
            records_evicted: self.evict_expired_records(now).await,
        }
    }

    /// Deletes output files of jobs that finished more than the artifact
    /// retention ago. The records keep their `outputs` entries.
    pub async fn purge_expired_artifacts(&self, now: DateTime<Utc>) -> usize {
        let retention = ChronoDuration::seconds(self.config.artifact_retention_seconds as i64);
        let mut files_to_delete = Vec::new();
        let mut purged = 0usize;

        {
            let mut table = self.registry.inner.write().await;
            for job in table.jobs.values_mut() {
                if job.artifacts_purged || !job.state.is_terminal() {
                    continue;
                }
                let Some(completed_at) = job.completed_at else {
                    continue;
                };
                if completed_at + retention > now {
                    continue;
                }

                info!(job_id = %job.job_id, "Expiring job artifacts");
                files_to_delete.extend(job.outputs.values().cloned());
                job.artifacts_purged = true;
                purged += 1;
            }
        }

        for path in files_to_delete {
            if let Err(err) = delete_file_if_exists(&path).await {
                warn!("Failed to delete expired artifact {}: {err:#}", path.display());
            }
        }
        purged
    }

    /// Drops every record created more than the record retention ago,
    /// whatever its state, along with its job directory.
    pub async fn evict_expired_records(&self, now: DateTime<Utc>) -> usize {
        let retention = ChronoDuration::seconds(self.config.record_retention_seconds as i64);
        let mut dirs_to_delete = Vec::new();

        {
            let mut table = self.registry.inner.write().await;
            let expired: Vec<String> = table
                .jobs
                .values()
                .filter(|job| job.created_at + retention <= now)
                .map(|job| job.job_id.clone())
                .collect();

            for job_id in &expired {
                if let Some(job) = table.jobs.remove(job_id) {
                    info!(job_id = %job_id, state = ?job.state, "Evicting job record");
                    dirs_to_delete.push(job.job_dir);
                }
            }
            table.queue.retain(|id| !expired.contains(id));
        }

        let evicted = dirs_to_delete.len();
        for dir in dirs_to_delete {
            if let Err(err) = delete_dir_if_exists(&dir).await {
                warn!("Failed to delete job directory {}: {err:#}", dir.display());
            }
        }
        evicted
    }
}

fn spawn_scheduler(
    concurrency_limit: usize,
    registry: JobRegistry,
    ctx: Arc<PipelineContext>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    mut events_rx: mpsc::UnboundedReceiver<SchedulerEvent>,
) {
    tokio::spawn(async move {
        let mut running = 0usize;
        while let Some(event) = events_rx.recv().await {
            if matches!(event, SchedulerEvent::Finished) {
                running = running.saturating_sub(1);
            }

            while running < concurrency_limit {
                let Some(spec) = registry.promote_next().await else {
                    break;
                };
                running += 1;
                info!(job_id = %spec.job_id, running, "Worker picked conversion job");
                spawn_worker(
                    ctx.clone(),
                    registry.clone(),
                    spec,
                    SlotRelease(events.clone()),
                );
            }
        }
    });
}

fn spawn_worker(
    ctx: Arc<PipelineContext>,
    registry: JobRegistry,
    spec: JobSpec,
    slot: SlotRelease,
) {
    tokio::spawn(async move {
        let _slot = slot;

        let run = tokio::spawn({
            let ctx = ctx.clone();
            let registry = registry.clone();
            let spec = spec.clone();
            async move { pipeline::execute(&ctx, &registry, &spec).await }
        });
        let result = match run.await {
            Ok(result) => result,
            Err(err) => Err(ConvertError::Internal(format!(
                "Conversion pipeline aborted: {err}"
            ))),
        };

        pipeline::cleanup_inputs(&spec).await;

        let orphaned = registry.finish(&spec.job_id, result).await;
        if !orphaned.is_empty() {
            info!(job_id = %spec.job_id, "Discarding outputs of a removed job");
            for path in orphaned {
                if let Err(err) = delete_file_if_exists(&path).await {
                    warn!("Failed to delete orphaned output {}: {err:#}", path.display());
                }
            }
            if let Err(err) = delete_dir_if_exists(&spec.job_dir).await {
                warn!(job_id = %spec.job_id, "Failed to delete job directory: {err:#}");
            }
        }
    });
}

pub fn spawn_cleanup_worker(manager: JobManager, interval_seconds: u64) {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(interval_seconds.max(1)));
        loop {
            interval.tick().await;
            let report = manager.cleanup().await;
            if report != CleanupReport::default() {
                info!(
                    artifacts_purged = report.artifacts_purged,
                    records_evicted = report.records_evicted,
                    "Retention sweep finished"
                );
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        glyph_cache::{tests::FakeFetcher, GlyphCache},
        pipeline::tests::FakeTools,
        preprocess::Preprocessor,
    };
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Harness {
        _tmp: TempDir,
        manager: JobManager,
        tools: Arc<FakeTools>,
        fetcher: Arc<FakeFetcher>,
    }

    fn harness_with(tools: FakeTools, tweak: impl FnOnce(&mut Config)) -> Harness {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = Config::for_tests(tmp.path());
        tweak(&mut config);

        let tools = Arc::new(tools);
        let fetcher = Arc::new(FakeFetcher::default());
        let ctx = PipelineContext {
            preprocessor: Preprocessor::new(
                GlyphCache::new(config.glyph_cache_dir.clone(), fetcher.clone()),
                config.glyph_size.clone(),
            ),
            tools: tools.clone(),
        };
        Harness {
            manager: JobManager::start(config, ctx),
            _tmp: tmp,
            tools,
            fetcher,
        }
    }

    fn harness(tools: FakeTools) -> Harness {
        harness_with(tools, |_| {})
    }

    fn formats(list: &[OutputFormat]) -> BTreeSet<OutputFormat> {
        list.iter().copied().collect()
    }

    async fn wait_terminal(manager: &JobManager, job_id: &str) -> JobStatusResponse {
        for _ in 0..500 {
            let status = manager.status(job_id).await.expect("status");
            if status.state.is_terminal() {
                return status;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never finished");
    }

    #[tokio::test]
    async fn docx_only_job_completes_with_docx() {
        let h = harness(FakeTools::default());
        let accepted = h
            .manager
            .submit("lecture.md", b"# Lecture\n", formats(&[OutputFormat::Docx]))
            .await
            .expect("submit");
        assert_eq!(accepted.state, JobState::Queued);

        let status = wait_terminal(&h.manager, &accepted.job_id).await;
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.progress, 100);
        assert_eq!(status.outputs.len(), 1);
        assert_eq!(status.outputs.get(&OutputFormat::Docx), Some(&true));

        let record = h.manager.record(&accepted.job_id).await.expect("record");
        let docx = record.outputs.get(&OutputFormat::Docx).expect("docx");
        assert!(docx.exists());
        assert!(docx.ends_with("lecture.docx"));
        assert!(!record.input_path.exists(), "input is removed after the run");
    }

    #[tokio::test]
    async fn pdf_only_render_failure_fails_job_without_outputs() {
        let h = harness(FakeTools {
            render_fails: true,
            ..Default::default()
        });
        let accepted = h
            .manager
            .submit("notes.md", b"text", formats(&[OutputFormat::Pdf]))
            .await
            .expect("submit");

        let status = wait_terminal(&h.manager, &accepted.job_id).await;
        assert_eq!(status.state, JobState::Error);
        assert_eq!(status.outputs.get(&OutputFormat::Pdf), Some(&false));
        assert!(status.error.expect("error message").contains("soffice"));

        let record = h.manager.record(&accepted.job_id).await.expect("record");
        assert!(record.outputs.is_empty());
        assert!(!record.job_dir.join("out").join("notes.docx").exists());
    }

    #[tokio::test]
    async fn render_failure_keeps_docx_when_both_requested() {
        let h = harness(FakeTools {
            render_fails: true,
            ..Default::default()
        });
        let accepted = h
            .manager
            .submit(
                "notes.md",
                b"text",
                formats(&[OutputFormat::Docx, OutputFormat::Pdf]),
            )
            .await
            .expect("submit");

        let status = wait_terminal(&h.manager, &accepted.job_id).await;
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.outputs.get(&OutputFormat::Docx), Some(&true));
        assert_eq!(status.outputs.get(&OutputFormat::Pdf), Some(&false));
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn pdf_only_success_drops_intermediate_docx() {
        let h = harness(FakeTools::default());
        let accepted = h
            .manager
            .submit("notes.md", b"text", formats(&[OutputFormat::Pdf]))
            .await
            .expect("submit");

        let status = wait_terminal(&h.manager, &accepted.job_id).await;
        assert_eq!(status.state, JobState::Completed);

        let record = h.manager.record(&accepted.job_id).await.expect("record");
        assert_eq!(record.outputs.keys().collect::<Vec<_>>(), vec![&OutputFormat::Pdf]);
        assert!(record.outputs[&OutputFormat::Pdf].exists());
        assert!(!record.job_dir.join("out").join("notes.docx").exists());
    }

    #[tokio::test]
    async fn conversion_failure_is_fatal() {
        let h = harness(FakeTools {
            convert_fails: true,
            ..Default::default()
        });
        let accepted = h
            .manager
            .submit("notes.md", b"text", formats(&[OutputFormat::Docx]))
            .await
            .expect("submit");

        let status = wait_terminal(&h.manager, &accepted.job_id).await;
        assert_eq!(status.state, JobState::Error);
        assert!(status.error.expect("error").contains("pandoc"));
    }

    #[tokio::test]
    async fn concurrency_limit_and_fifo_order_hold() {
        let h = harness(FakeTools {
            delay: Duration::from_millis(40),
            ..Default::default()
        });

        let mut ids = Vec::new();
        for name in ["a.md", "b.md", "c.md", "d.md"] {
            let accepted = h
                .manager
                .submit(name, b"text", formats(&[OutputFormat::Docx]))
                .await
                .expect("submit");
            ids.push(accepted.job_id);
        }

        let mut max_processing = 0;
        loop {
            let mut processing = 0;
            let mut done = 0;
            for id in &ids {
                match h.manager.status(id).await.expect("status").state {
                    JobState::Processing => processing += 1,
                    JobState::Completed | JobState::Error => done += 1,
                    JobState::Queued => {}
                }
            }
            max_processing = max_processing.max(processing);
            if done == ids.len() {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }

        assert!(max_processing <= 1);
        assert_eq!(h.tools.max_active.load(Ordering::SeqCst), 1);
        let order = h.tools.started.lock().expect("started").clone();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn wider_limit_runs_jobs_side_by_side() {
        let h = harness_with(
            FakeTools {
                delay: Duration::from_millis(100),
                ..Default::default()
            },
            |config| config.concurrency_limit = 2,
        );
        let mut ids = Vec::new();
        for name in ["a.md", "b.md", "c.md"] {
            let accepted = h
                .manager
                .submit(name, b"text", formats(&[OutputFormat::Docx]))
                .await
                .expect("submit");
            ids.push(accepted.job_id);
        }
        for id in &ids {
            wait_terminal(&h.manager, id).await;
        }
        assert_eq!(h.tools.max_active.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn queued_jobs_report_position_based_estimate() {
        let h = harness(FakeTools {
            delay: Duration::from_millis(300),
            ..Default::default()
        });
        let first = h
            .manager
            .submit("a.md", b"text", formats(&[OutputFormat::Docx]))
            .await
            .expect("submit");
        let second = h
            .manager
            .submit("b.md", b"text", formats(&[OutputFormat::Docx]))
            .await
            .expect("submit");
        let third = h
            .manager
            .submit("c.md", b"text", formats(&[OutputFormat::Docx]))
            .await
            .expect("submit");

        for _ in 0..100 {
            if h.manager.status(&first.job_id).await.expect("status").state == JobState::Processing {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }

        let second_status = h.manager.status(&second.job_id).await.expect("status");
        let third_status = h.manager.status(&third.job_id).await.expect("status");
        assert_eq!(second_status.state, JobState::Queued);
        assert_eq!(second_status.time_left_seconds, 30);
        assert_eq!(third_status.time_left_seconds, 60);
    }

    #[tokio::test]
    async fn identical_submissions_get_independent_jobs() {
        let h = harness(FakeTools::default());
        let first = h
            .manager
            .submit("same.md", b"same", formats(&[OutputFormat::Docx]))
            .await
            .expect("submit");
        let second = h
            .manager
            .submit("same.md", b"same", formats(&[OutputFormat::Docx]))
            .await
            .expect("submit");
        assert_ne!(first.job_id, second.job_id);

        wait_terminal(&h.manager, &first.job_id).await;
        wait_terminal(&h.manager, &second.job_id).await;
        h.manager.cancel(&first.job_id).await.expect("cancel");
        assert!(h.manager.status(&second.job_id).await.is_ok());
    }

    #[tokio::test]
    async fn panicking_pipeline_releases_its_slot() {
        let h = harness(FakeTools {
            panic_on: Some("boom".to_string()),
            ..Default::default()
        });
        let crashed = h
            .manager
            .submit("boom.md", b"text", formats(&[OutputFormat::Docx]))
            .await
            .expect("submit");
        let next = h
            .manager
            .submit("fine.md", b"text", formats(&[OutputFormat::Docx]))
            .await
            .expect("submit");

        let crashed_status = wait_terminal(&h.manager, &crashed.job_id).await;
        assert_eq!(crashed_status.state, JobState::Error);
        let crashed_record = h.manager.record(&crashed.job_id).await.expect("record");
        assert!(!crashed_record.input_path.exists());

        let next_status = wait_terminal(&h.manager, &next.job_id).await;
        assert_eq!(next_status.state, JobState::Completed);
    }

    #[tokio::test]
    async fn glyphs_are_substituted_before_conversion() {
        let h = harness(FakeTools::default());
        let accepted = h
            .manager
            .submit("emoji.md", "Ship it 🚀 🚀".as_bytes(), formats(&[OutputFormat::Docx]))
            .await
            .expect("submit");
        wait_terminal(&h.manager, &accepted.job_id).await;

        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
        let seen = h.tools.inputs.lock().expect("inputs").clone();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].contains('🚀'));
        assert_eq!(seen[0].matches("1f680.png").count(), 2);
    }

    #[tokio::test]
    async fn preprocessing_failure_falls_back_to_original_text() {
        let h = harness_with(FakeTools::default(), |config| {
            // A plain file where the cache directory should be.
            config.glyph_cache_dir = config.work_root.join("not-a-dir");
        });
        std::fs::write(h._tmp.path().join("not-a-dir"), b"x").expect("blocker");

        let accepted = h
            .manager
            .submit("emoji.md", "Party 🎉".as_bytes(), formats(&[OutputFormat::Docx]))
            .await
            .expect("submit");
        let status = wait_terminal(&h.manager, &accepted.job_id).await;

        assert_eq!(status.state, JobState::Completed);
        let seen = h.tools.inputs.lock().expect("inputs").clone();
        assert_eq!(seen, vec!["Party 🎉".to_string()]);
    }

    #[tokio::test]
    async fn validation_rejects_empty_content_and_formats() {
        let h = harness(FakeTools::default());
        let err = h
            .manager
            .submit("a.md", b"", formats(&[OutputFormat::Docx]))
            .await
            .expect_err("empty content");
        assert!(matches!(err, ConvertError::Validation(_)));

        let err = h
            .manager
            .submit("a.md", b"text", BTreeSet::new())
            .await
            .expect_err("no formats");
        assert!(matches!(err, ConvertError::Validation(_)));
    }

    #[tokio::test]
    async fn expired_records_are_unreachable() {
        let h = harness(FakeTools::default());
        let accepted = h
            .manager
            .submit("old.md", b"text", formats(&[OutputFormat::Docx]))
            .await
            .expect("submit");
        wait_terminal(&h.manager, &accepted.job_id).await;
        let record = h.manager.record(&accepted.job_id).await.expect("record");

        let evicted = h
            .manager
            .evict_expired_records(Utc::now() + ChronoDuration::days(2))
            .await;
        assert_eq!(evicted, 1);
        assert!(matches!(
            h.manager.status(&accepted.job_id).await,
            Err(ConvertError::NotFound(_))
        ));
        assert!(!record.job_dir.exists());
    }

    #[tokio::test]
    async fn artifact_retention_outlives_files_not_records() {
        let h = harness(FakeTools::default());
        let accepted = h
            .manager
            .submit("keep.md", b"text", formats(&[OutputFormat::Docx]))
            .await
            .expect("submit");
        wait_terminal(&h.manager, &accepted.job_id).await;

        let later = Utc::now() + ChronoDuration::hours(2);
        assert_eq!(h.manager.purge_expired_artifacts(later).await, 1);
        assert_eq!(h.manager.purge_expired_artifacts(later).await, 0);
        assert_eq!(h.manager.evict_expired_records(later).await, 0);

        // Status still advertises the output even though the file is gone.
        let status = h.manager.status(&accepted.job_id).await.expect("status");
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.outputs.get(&OutputFormat::Docx), Some(&true));
        let record = h.manager.record(&accepted.job_id).await.expect("record");
        assert!(!record.outputs[&OutputFormat::Docx].exists());
    }

    #[tokio::test]
    async fn cancel_removes_record_and_files() {
        let h = harness(FakeTools::default());
        let accepted = h
            .manager
            .submit("gone.md", b"text", formats(&[OutputFormat::Docx]))
            .await
            .expect("submit");
        wait_terminal(&h.manager, &accepted.job_id).await;
        let record = h.manager.record(&accepted.job_id).await.expect("record");

        h.manager.cancel(&accepted.job_id).await.expect("cancel");
        assert!(matches!(
            h.manager.status(&accepted.job_id).await,
            Err(ConvertError::NotFound(_))
        ));
        assert!(!record.job_dir.exists());
        assert!(matches!(
            h.manager.cancel(&accepted.job_id).await,
            Err(ConvertError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn canceling_a_running_job_discards_its_outputs() {
        let h = harness(FakeTools {
            delay: Duration::from_millis(150),
            ..Default::default()
        });
        let running = h
            .manager
            .submit("slow.md", b"text", formats(&[OutputFormat::Docx]))
            .await
            .expect("submit");
        let follower = h
            .manager
            .submit("next.md", b"text", formats(&[OutputFormat::Docx]))
            .await
            .expect("submit");

        for _ in 0..100 {
            if h.manager.status(&running.job_id).await.expect("status").state == JobState::Processing {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        let record = h.manager.record(&running.job_id).await.expect("record");
        h.manager.cancel(&running.job_id).await.expect("cancel");

        let follower_status = wait_terminal(&h.manager, &follower.job_id).await;
        assert_eq!(follower_status.state, JobState::Completed);
        assert!(!record.job_dir.join("out").join("slow.docx").exists());
    }
}
