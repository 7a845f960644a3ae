//! MCP server implementation with tool handlers
//!
//! Implements the `ServerHandler` trait and registers the job tools. Handlers
//! validate input, call into the [`EngineHandle`] and wrap results in the
//! standard [`ToolEnvelope`].

use std::time::Instant;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ErrorData, ServerCapabilities, ServerInfo};
use rmcp::{Json, ServerHandler, tool, tool_handler, tool_router};

use crate::engine::EngineHandle;
use crate::errors::{AppError, AppResult};
use crate::jobs::JobStatus;
use crate::models::{
    EngineStatusView, EnqueueMutationInput, EnqueueSyncInput, EnqueuedJob, EventPage,
    JobEventView, JobIdInput, JobListData, JobView, ListJobsInput, Meta, TailEventsInput,
    ToolEnvelope,
};
use crate::mutation::MutationParams;

/// Sync engine MCP server
///
/// Thin adapter over an [`EngineHandle`]; every tool returns immediately,
/// long-running work happens in jobs.
#[derive(Clone)]
pub struct MailSyncServer {
    engine: EngineHandle,
    /// Tool router for dispatching MCP tool calls
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl MailSyncServer {
    pub fn new(engine: EngineHandle) -> Self {
        Self {
            engine,
            tool_router: Self::tool_router(),
        }
    }

    /// Tool: Enqueue a folder sync
    ///
    /// Incremental syncs are deduplicated per folder while one is pending.
    #[tool(
        name = "imap_enqueue_sync",
        description = "Enqueue a folder sync job (incremental by default, deduplicated per folder)"
    )]
    async fn enqueue_sync(
        &self,
        Parameters(input): Parameters<EnqueueSyncInput>,
    ) -> Result<Json<ToolEnvelope<EnqueuedJob>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.enqueue_sync_impl(input).map(|data| {
                let summary = if data.deduplicated {
                    format!("Sync already pending as job {}", data.job_id)
                } else {
                    format!("Sync enqueued as job {}", data.job_id)
                };
                (summary, data)
            }),
        )
    }

    /// Tool: Enqueue a bulk mark-read / move batch
    #[tool(
        name = "imap_enqueue_mutation_batch",
        description = "Enqueue a batch that marks messages read and/or moves them to another folder. Requires MAIL_IMAP_WRITE_ENABLED=true"
    )]
    async fn enqueue_mutation_batch(
        &self,
        Parameters(input): Parameters<EnqueueMutationInput>,
    ) -> Result<Json<ToolEnvelope<EnqueuedJob>>, ErrorData> {
        let started = Instant::now();
        let count = input.uids.len();
        finalize_tool(
            started,
            self.enqueue_mutation_impl(input).map(|data| {
                (
                    format!("Mutation of {count} message(s) enqueued as job {}", data.job_id),
                    data,
                )
            }),
        )
    }

    #[tool(name = "imap_get_job", description = "Get a job's status and progress")]
    async fn get_job(
        &self,
        Parameters(input): Parameters<JobIdInput>,
    ) -> Result<Json<ToolEnvelope<JobView>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.get_job_impl(&input.job_id).map(|job| {
                let summary = match job.total_estimate {
                    Some(total) => {
                        format!("Job {} {} ({}/{total})", job.job_id, job.status, job.processed)
                    }
                    None => format!("Job {} {}", job.job_id, job.status),
                };
                (summary, job)
            }),
        )
    }

    /// Tool: List recent jobs, newest first
    #[tool(
        name = "imap_list_jobs",
        description = "List recent jobs, newest first, optionally filtered by status"
    )]
    async fn list_jobs(
        &self,
        Parameters(input): Parameters<ListJobsInput>,
    ) -> Result<Json<ToolEnvelope<JobListData>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.list_jobs_impl(input)
                .map(|data| (format!("{} job(s)", data.jobs.len()), data)),
        )
    }

    /// Tool: Read a page of job events after a watermark
    ///
    /// Callers poll with the returned `next_after_id` until `finished`.
    #[tool(
        name = "imap_tail_job_events",
        description = "Read job events after an id watermark; poll with next_after_id until finished is true"
    )]
    async fn tail_job_events(
        &self,
        Parameters(input): Parameters<TailEventsInput>,
    ) -> Result<Json<ToolEnvelope<EventPage>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.tail_events_impl(input)
                .map(|page| (format!("{} event(s), job {}", page.events.len(), page.status), page)),
        )
    }

    #[tool(
        name = "imap_cancel_job",
        description = "Request cancellation of a pending or running job"
    )]
    async fn cancel_job(
        &self,
        Parameters(input): Parameters<JobIdInput>,
    ) -> Result<Json<ToolEnvelope<JobView>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.cancel_impl(&input.job_id)
                .map(|job| (format!("Cancellation requested for job {}", job.job_id), job)),
        )
    }

    #[tool(
        name = "imap_engine_status",
        description = "Engine status: job counts, connection pool, workers and watch monitors"
    )]
    async fn engine_status(&self) -> Result<Json<ToolEnvelope<EngineStatusView>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.engine.status().map(|status| {
                let view = EngineStatusView::from(&status);
                (
                    format!(
                        "{} running, {} pending, {}/{} connection(s) checked out",
                        view.jobs.running,
                        view.jobs.pending,
                        view.pool.capacity.saturating_sub(view.pool.available),
                        view.pool.capacity
                    ),
                    view,
                )
            }),
        )
    }
}

/// MCP server handler implementation
#[tool_handler(router = self.tool_router)]
impl ServerHandler for MailSyncServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build()).with_instructions(
            "IMAP sync engine. Enqueue syncs and mutation batches as jobs, then follow them \
             with imap_get_job or imap_tail_job_events. Mutation batches require \
             MAIL_IMAP_WRITE_ENABLED=true.",
        )
    }
}

impl MailSyncServer {
    fn enqueue_sync_impl(&self, input: EnqueueSyncInput) -> AppResult<EnqueuedJob> {
        let enqueued = self.engine.enqueue_sync(&input.folder, input.mode)?;
        Ok(EnqueuedJob::from(&enqueued))
    }

    fn enqueue_mutation_impl(&self, input: EnqueueMutationInput) -> AppResult<EnqueuedJob> {
        let params = MutationParams {
            folder: input.folder,
            uids: input.uids,
            mark_read: input.mark_read,
            move_to: input.move_to,
        };
        let job_id = self.engine.enqueue_mutation(&params)?;
        Ok(EnqueuedJob {
            job_id,
            deduplicated: false,
        })
    }

    fn get_job_impl(&self, job_id: &str) -> AppResult<JobView> {
        validate_job_id(job_id)?;
        Ok(JobView::from(&self.engine.get_job(job_id)?))
    }

    fn list_jobs_impl(&self, input: ListJobsInput) -> AppResult<JobListData> {
        let status = input
            .status
            .as_deref()
            .map(str::parse::<JobStatus>)
            .transpose()?;
        let jobs = self.engine.list_jobs(status, input.limit)?;
        Ok(JobListData {
            jobs: jobs.iter().map(JobView::from).collect(),
        })
    }

    fn tail_events_impl(&self, input: TailEventsInput) -> AppResult<EventPage> {
        validate_job_id(&input.job_id)?;
        if input.after_id < 0 {
            return Err(AppError::invalid("after_id must be >= 0"));
        }
        // job before events: a terminal status read here cannot hide later events
        let job = self.engine.get_job(&input.job_id)?;
        let events = self.engine.events(&input.job_id, input.after_id, input.limit)?;
        let next_after_id = events.last().map_or(input.after_id, |e| e.id);
        let finished = job.status.is_terminal() && events.len() < input.limit;
        Ok(EventPage {
            job_id: input.job_id,
            events: events.iter().map(JobEventView::from).collect(),
            next_after_id,
            status: job.status.as_str().to_owned(),
            finished,
        })
    }

    fn cancel_impl(&self, job_id: &str) -> AppResult<JobView> {
        validate_job_id(job_id)?;
        Ok(JobView::from(&self.engine.cancel(job_id)?))
    }
}

/// Calculate elapsed milliseconds
fn duration_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

/// Build a standardized MCP tool response envelope from business logic output
fn finalize_tool<T>(
    started: Instant,
    result: AppResult<(String, T)>,
) -> Result<Json<ToolEnvelope<T>>, ErrorData>
where
    T: schemars::JsonSchema,
{
    match result {
        Ok((summary, data)) => Ok(Json(ToolEnvelope {
            summary,
            data,
            meta: Meta::now(duration_ms(started)),
        })),
        Err(e) => Err(e.to_error_data()),
    }
}

fn validate_job_id(job_id: &str) -> AppResult<()> {
    if job_id.is_empty() || job_id.len() > 64 {
        return Err(AppError::invalid("job_id must be 1..64 characters"));
    }
    if job_id.chars().any(char::is_control) {
        return Err(AppError::invalid("job_id must not contain control characters"));
    }
    Ok(())
}
