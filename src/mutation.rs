//! Bulk flag/move routine run as a `mutation_batch` job

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::cache::MailCache;
use crate::errors::{AppError, AppResult};
use crate::executor::{JobContext, Outcome, renew_and_open};
use crate::jobs::EventLevel;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::protocol::{Connector, MailConnection};

/// UIDs touched per STORE/MOVE round trip
pub const MUTATION_BATCH_SIZE: usize = 10;
/// Upper bound on UIDs in one job
pub const MAX_MUTATION_UIDS: usize = 10_000;

const SEEN: &str = "\\Seen";

/// Parameters of a `mutation_batch` job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationParams {
    pub folder: String,
    pub uids: Vec<u32>,
    #[serde(default)]
    pub mark_read: bool,
    #[serde(default)]
    pub move_to: Option<String>,
}

impl MutationParams {
    /// Reject batches that would do nothing or loop back onto the source
    pub fn validate(&self) -> AppResult<()> {
        if self.uids.is_empty() {
            return Err(AppError::InvalidInput("uids must not be empty".to_owned()));
        }
        if self.uids.len() > MAX_MUTATION_UIDS {
            return Err(AppError::InvalidInput(format!(
                "at most {MAX_MUTATION_UIDS} uids per batch"
            )));
        }
        if self.uids.contains(&0) {
            return Err(AppError::InvalidInput("uid 0 is not valid".to_owned()));
        }
        if !self.mark_read && self.move_to.is_none() {
            return Err(AppError::InvalidInput(
                "nothing to do: set mark_read or move_to".to_owned(),
            ));
        }
        if self.move_to.as_deref() == Some(self.folder.as_str()) {
            return Err(AppError::InvalidInput(
                "move_to must differ from folder".to_owned(),
            ));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        match (&self.move_to, self.mark_read) {
            (Some(dest), true) => format!("marked read and moved to {dest}"),
            (Some(dest), false) => format!("moved to {dest}"),
            (None, _) => "marked read".to_owned(),
        }
    }
}

pub struct MutationBatch<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    cache: &'a MailCache,
}

impl<'a, C: Connector> MutationBatch<'a, C> {
    pub fn new(pool: &'a ConnectionPool<C>, cache: &'a MailCache) -> Self {
        Self { pool, cache }
    }

    pub async fn run(
        &self,
        ctx: &JobContext,
        conn: &mut PooledConnection<C::Connection>,
        params: &MutationParams,
    ) -> AppResult<Outcome> {
        params.validate()?;
        let folder = params.folder.as_str();

        let opened = conn.session()?.select(folder).await;
        match opened {
            Ok(_) => {}
            Err(e) if e.is_connection_error() => {
                renew_and_open(self.pool, ctx, conn, folder, true, &e).await?;
            }
            Err(e) => return Err(e),
        }

        let total = params.uids.len();
        ctx.progress(0, Some(total as u64))?;
        let batches = total.div_ceil(MUTATION_BATCH_SIZE);
        let mut done = 0usize;

        for (index, chunk) in params.uids.chunks(MUTATION_BATCH_SIZE).enumerate() {
            if ctx.cancel_requested()? {
                return Ok(Outcome::Cancelled);
            }

            let mut attempt = 0;
            loop {
                let result = apply(conn.session()?, chunk, params).await;
                match result {
                    Ok(()) => break,
                    Err(e) if e.is_connection_error() && attempt == 0 => {
                        attempt += 1;
                        renew_and_open(self.pool, ctx, conn, folder, true, &e).await?;
                    }
                    Err(e) => return Err(e),
                }
            }

            if params.move_to.is_some() {
                self.cache.mark_deleted(folder, chunk)?;
            } else if params.mark_read {
                self.cache.add_flag(folder, chunk, SEEN)?;
            }
            done += chunk.len();
            ctx.progress(chunk.len() as u64, None)?;
            ctx.event(
                EventLevel::Info,
                &format!("Processed batch {}/{batches}", index + 1),
                json!({ "batch": index + 1, "uids": chunk }),
            )?;
            debug!(job_id = ctx.job_id(), folder, batch = index + 1, "mutation batch applied");
        }

        Ok(Outcome::Completed {
            summary: format!("{done} message(s) in {folder} {}", params.describe()),
            data: json!({
                "folder": folder,
                "processed": done,
                "mark_read": params.mark_read,
                "move_to": params.move_to,
            }),
        })
    }
}

async fn apply<M: MailConnection>(
    session: &mut M,
    uids: &[u32],
    params: &MutationParams,
) -> AppResult<()> {
    if params.mark_read {
        session.add_flags(uids, "(\\Seen)").await?;
    }
    if let Some(dest) = &params.move_to {
        session.move_messages(uids, dest).await?;
    }
    Ok(())
}
