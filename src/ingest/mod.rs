//! Background ingestion: source connector → field mapping → embedding index.
//!
//! Jobs run on the tokio runtime and report progress through an in-memory
//! job table. Ingestion is best-effort: decode errors and empty documents
//! are skipped and counted, and documents embedded before a failure stay in
//! the index, so re-running a job resumes it (ids are stable).

pub mod mapping;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::core::errors::{ErrorBody, RagError};
use crate::embedding::{Document, EmbeddingIndex};
use crate::sources::{connector_for, SourceConnector, SourceDescriptor};

pub use mapping::FieldMapping;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestJob {
    pub job_id: String,
    pub source: String,
    pub status: JobStatus,
    pub documents_embedded: usize,
    pub documents_skipped: usize,
    pub error: Option<ErrorBody>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct JobTable {
    order: VecDeque<String>,
    jobs: HashMap<String, IngestJob>,
}

#[derive(Clone)]
pub struct IngestService {
    index: Arc<EmbeddingIndex>,
    page_size: usize,
    job_history: usize,
    jobs: Arc<Mutex<JobTable>>,
}

impl IngestService {
    pub fn new(index: Arc<EmbeddingIndex>, page_size: usize, job_history: usize) -> Self {
        Self {
            index,
            page_size: page_size.max(1),
            job_history: job_history.max(1),
            jobs: Arc::new(Mutex::new(JobTable::default())),
        }
    }

    /// Validates the request and starts the job in the background.
    ///
    /// Descriptor and mapping errors are returned immediately; everything
    /// that happens after the job is queued is reported on the job record.
    pub fn start(
        &self,
        descriptor: SourceDescriptor,
        mapping: FieldMapping,
    ) -> Result<IngestJob, RagError> {
        let (job, connector) = self.prepare(&descriptor, &mapping)?;
        let service = self.clone();
        let job_id = job.job_id.clone();
        tokio::spawn(async move {
            service.execute(&job_id, connector, mapping).await;
        });
        Ok(job)
    }

    /// Runs a job to completion on the current task.
    pub async fn ingest(
        &self,
        descriptor: SourceDescriptor,
        mapping: FieldMapping,
    ) -> Result<IngestJob, RagError> {
        let (job, connector) = self.prepare(&descriptor, &mapping)?;
        self.execute(&job.job_id, connector, mapping).await;
        self.get(&job.job_id)
            .ok_or_else(|| RagError::InvalidRequest(format!("job {} was evicted", job.job_id)))
    }

    pub fn get(&self, job_id: &str) -> Option<IngestJob> {
        let table = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        table.jobs.get(job_id).cloned()
    }

    /// Most recent jobs first.
    pub fn recent(&self, limit: usize) -> Vec<IngestJob> {
        let table = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        table
            .order
            .iter()
            .rev()
            .filter_map(|id| table.jobs.get(id).cloned())
            .take(limit)
            .collect()
    }

    fn prepare(
        &self,
        descriptor: &SourceDescriptor,
        mapping: &FieldMapping,
    ) -> Result<(IngestJob, Box<dyn SourceConnector>), RagError> {
        mapping.validate().map_err(RagError::InvalidRequest)?;
        let connector = connector_for(descriptor)?;

        let job = IngestJob {
            job_id: Uuid::new_v4().to_string(),
            source: connector.label(),
            status: JobStatus::Queued,
            documents_embedded: 0,
            documents_skipped: 0,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        self.insert(job.clone());
        tracing::info!(job_id = %job.job_id, source = %job.source, "Ingestion job queued");
        Ok((job, connector))
    }

    fn insert(&self, job: IngestJob) {
        let mut table = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        table.order.push_back(job.job_id.clone());
        table.jobs.insert(job.job_id.clone(), job);

        // Evict the oldest finished jobs; running jobs are always kept.
        while table.order.len() > self.job_history {
            let evictable = table.order.iter().position(|id| {
                table
                    .jobs
                    .get(id)
                    .map_or(true, |job| job.status.is_terminal())
            });
            let Some(position) = evictable else {
                break;
            };
            if let Some(id) = table.order.remove(position) {
                table.jobs.remove(&id);
            }
        }
    }

    fn update(&self, job_id: &str, apply: impl FnOnce(&mut IngestJob)) {
        let mut table = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = table.jobs.get_mut(job_id) {
            apply(job);
        }
    }

    async fn execute(&self, job_id: &str, connector: Box<dyn SourceConnector>, mapping: FieldMapping) {
        self.update(job_id, |job| job.status = JobStatus::Running);
        let label = connector.label();
        let mut progress = Progress::default();

        let result = self.pump(connector.as_ref(), &label, &mapping, &mut progress).await;
        let status = match &result {
            Ok(()) if progress.skipped == 0 => JobStatus::Completed,
            Ok(()) => JobStatus::CompletedWithErrors,
            Err(_) => JobStatus::Failed,
        };

        match &result {
            Ok(()) => tracing::info!(
                job_id,
                source = %label,
                embedded = progress.embedded,
                skipped = progress.skipped,
                "Ingestion job finished"
            ),
            Err(err) => tracing::warn!(
                job_id,
                source = %label,
                embedded = progress.embedded,
                skipped = progress.skipped,
                "Ingestion job failed: {}",
                err
            ),
        }

        self.update(job_id, |job| {
            job.status = status;
            job.documents_embedded = progress.embedded;
            job.documents_skipped = progress.skipped;
            job.error = result.err().map(|err| err.to_body());
            job.finished_at = Some(Utc::now());
        });
    }

    async fn pump(
        &self,
        connector: &dyn SourceConnector,
        label: &str,
        mapping: &FieldMapping,
        progress: &mut Progress,
    ) -> Result<(), RagError> {
        let mut records = connector.open(self.page_size).await?;
        let batch_size = self.index.batch_size();
        let mut buffer: Vec<Document> = Vec::with_capacity(batch_size);

        while let Some(item) = records.recv().await {
            match item {
                Ok(record) => {
                    buffer.push(mapping.to_document(label, &record));
                    if buffer.len() >= batch_size {
                        self.flush(&mut buffer, progress).await?;
                    }
                }
                Err(RagError::RecordDecode(reason)) => {
                    tracing::warn!(source = %label, "Skipping malformed record: {}", reason);
                    progress.skipped += 1;
                }
                Err(err) => {
                    // Keep what was read before the source went away.
                    self.flush(&mut buffer, progress).await?;
                    return Err(err);
                }
            }
        }

        self.flush(&mut buffer, progress).await
    }

    async fn flush(&self, buffer: &mut Vec<Document>, progress: &mut Progress) -> Result<(), RagError> {
        if buffer.is_empty() {
            return Ok(());
        }
        let report = self.index.embed_and_store(std::mem::take(buffer)).await?;
        progress.embedded += report.stored;
        progress.skipped += report.rejected.len();
        Ok(())
    }
}

#[derive(Default)]
struct Progress {
    embedded: usize,
    skipped: usize,
}
