use std::sync::Arc;
use std::time::Duration;

use autoprice_core::{QueryHandle, QueryState, Statement};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{QueryContext, QueryService, RawRows, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` waits until the engine reaches a terminal state, however long that takes.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1200),
            timeout: Some(Duration::from_secs(600)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Yes,
    No,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub state: QueryState,
    pub handle: QueryHandle,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("submitting {kind} statement failed: {source}")]
    Submit {
        kind: &'static str,
        #[source]
        source: ServiceError,
    },
    #[error("polling query {handle} failed: {source}")]
    Status {
        handle: QueryHandle,
        #[source]
        source: ServiceError,
    },
    /// Terminal non-success state; `reason` falls back to the bare state name.
    #[error("{reason}")]
    Failed {
        handle: QueryHandle,
        state: QueryState,
        reason: String,
    },
    #[error("query {handle} still {state} after {waited:?}")]
    TimedOut {
        handle: QueryHandle,
        state: QueryState,
        waited: Duration,
    },
    #[error("reading results of query {handle} failed: {source}")]
    Results {
        handle: QueryHandle,
        #[source]
        source: ServiceError,
    },
}

/// Column-addressable view over a result whose first raw row was the header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn from_raw(raw: RawRows) -> Self {
        let mut iter = raw.into_iter();
        let columns = iter
            .next()
            .map(|header| header.into_iter().map(Option::unwrap_or_default).collect())
            .unwrap_or_default();
        Self {
            columns,
            rows: iter.collect(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Non-empty cell value of `row` under `column`.
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows
            .get(row)?
            .get(idx)?
            .as_deref()
            .filter(|v| !v.is_empty())
    }
}

/// Submits statements within one fixed [`QueryContext`] and waits for terminal states.
pub struct QueryGateway {
    service: Arc<dyn QueryService>,
    context: QueryContext,
    poll: PollPolicy,
}

impl QueryGateway {
    pub fn new(service: Arc<dyn QueryService>, context: QueryContext, poll: PollPolicy) -> Self {
        Self {
            service,
            context,
            poll,
        }
    }

    pub async fn submit(&self, statement: &Statement, wait: Wait) -> Result<Submission, QueryError> {
        let kind = statement.kind();
        let handle = self
            .service
            .submit(statement, &self.context)
            .await
            .map_err(|source| {
                warn!(kind, error = %source, "query submission rejected");
                QueryError::Submit { kind, source }
            })?;
        info!(kind, %handle, namespace = %self.context.namespace, "query started");

        if wait == Wait::No {
            return Ok(Submission {
                state: QueryState::Submitted,
                handle,
            });
        }

        let started = Instant::now();
        loop {
            let status = self
                .service
                .status(&handle)
                .await
                .map_err(|source| QueryError::Status {
                    handle: handle.clone(),
                    source,
                })?;

            if status.state.is_terminal() {
                info!(
                    kind,
                    %handle,
                    state = %status.state,
                    engine_ms = ?status.engine_ms,
                    reason = status.reason.as_deref().unwrap_or(""),
                    "query finished"
                );
                if status.state == QueryState::Succeeded {
                    return Ok(Submission {
                        state: status.state,
                        handle,
                    });
                }
                let reason = status
                    .reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| status.state.to_string());
                return Err(QueryError::Failed {
                    handle,
                    state: status.state,
                    reason,
                });
            }

            if let Some(limit) = self.poll.timeout {
                let waited = started.elapsed();
                if waited >= limit {
                    warn!(kind, %handle, state = %status.state, ?waited, "query wait timed out; cancelling");
                    if let Err(err) = self.service.cancel(&handle).await {
                        warn!(%handle, error = %err, "query cancellation failed");
                    }
                    return Err(QueryError::TimedOut {
                        handle,
                        state: status.state,
                        waited,
                    });
                }
            }

            tokio::time::sleep(self.poll.interval).await;
        }
    }

    /// Runs a statement to completion.
    pub async fn execute(&self, statement: &Statement) -> Result<QueryHandle, QueryError> {
        Ok(self.submit(statement, Wait::Yes).await?.handle)
    }

    pub async fn fetch_results(&self, handle: &QueryHandle) -> Result<ResultSet, QueryError> {
        let raw = self
            .service
            .results(handle)
            .await
            .map_err(|source| QueryError::Results {
                handle: handle.clone(),
                source,
            })?;
        Ok(ResultSet::from_raw(raw))
    }

    pub async fn query(&self, statement: &Statement) -> Result<ResultSet, QueryError> {
        let handle = self.execute(statement).await?;
        self.fetch_results(&handle).await
    }
}
