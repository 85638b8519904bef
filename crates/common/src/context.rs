//! Per-request context: correlation headers, saga branch and cancellation.
//!
//! A context is built once per inbound request or message and passed by
//! reference down the call chain. Nothing is captured implicitly; the only
//! way correlation data reaches the asynchronous reconciler is through the
//! envelope headers it was copied into.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ErrorClassification, ErrorKind};
use crate::metadata::{Metadata, headers};

/// Barrier id used for the single sub-transaction a branch performs.
pub const DEFAULT_BARRIER_ID: &str = "01";

/// Operation a saga branch call performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchOp {
    Action,
    Compensate,
}

impl BranchOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::Compensate => "compensate",
        }
    }

    /// The op whose barrier row a compensation must also claim.
    pub const fn origin(self) -> Option<BranchOp> {
        match self {
            Self::Action => None,
            Self::Compensate => Some(Self::Action),
        }
    }
}

impl std::fmt::Display for BranchOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one saga branch invocation as handed over by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaBranch {
    pub trans_type: String,
    pub gid: String,
    pub branch_id: String,
    pub op: BranchOp,
    pub barrier_id: String,
}

impl SagaBranch {
    pub fn new(gid: impl Into<String>, branch_id: impl Into<String>, op: BranchOp) -> Self {
        Self {
            trans_type: "saga".to_string(),
            gid: gid.into(),
            branch_id: branch_id.into(),
            op,
            barrier_id: DEFAULT_BARRIER_ID.to_string(),
        }
    }
}

/// Why a context-bound operation stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl ErrorClassification for Interrupted {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Timeout
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    metadata: Metadata,
    saga_branch: Option<SagaBranch>,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    /// Creates a root context with a freshly generated trace id.
    pub fn new() -> Self {
        Self::from_metadata(Metadata::new())
    }

    /// Rebuilds a context from message or request headers.
    ///
    /// The trace id is taken from `Trace-Id`, then from a W3C `traceparent`
    /// header in any casing, and generated when neither is present.
    pub fn from_metadata(mut metadata: Metadata) -> Self {
        if metadata.get(headers::TRACE_ID).is_none() {
            let trace_id = metadata
                .get_ignore_case(headers::TRACEPARENT)
                .and_then(trace_id_from_traceparent)
                .map(str::to_string)
                .unwrap_or_else(new_trace_id);
            metadata.insert(headers::TRACE_ID, trace_id);
        }
        Self {
            metadata,
            saga_branch: None,
            cancellation: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn trace_id(&self) -> &str {
        self.metadata.get(headers::TRACE_ID).unwrap_or_default()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    pub fn with_saga_branch(mut self, branch: SagaBranch) -> Self {
        self.saga_branch = Some(branch);
        self
    }

    pub fn saga_branch(&self) -> Option<&SagaBranch> {
        self.saga_branch.as_ref()
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Sets a deadline relative to now. An earlier existing deadline wins.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Derives a context whose cancellation follows this one but can also be
    /// cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            metadata: self.metadata.clone(),
            saga_branch: self.saga_branch.clone(),
            cancellation: self.cancellation.child_token(),
            deadline: self.deadline,
        }
    }

    /// Fails fast when the context is already cancelled or past its deadline.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.cancellation.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(Interrupted::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drives `fut` to completion unless the context is cancelled or the
    /// deadline passes first, in which case `fut` is dropped.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => Err(Interrupted::Cancelled),
            () = deadline => Err(Interrupted::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }

    /// Sleeps for `duration`, waking early on cancellation.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.run(tokio::time::sleep(duration)).await
    }
}

fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Extracts the trace id field from `00-<trace-id>-<span-id>-<flags>`.
fn trace_id_from_traceparent(value: &str) -> Option<&str> {
    let mut parts = value.split('-');
    let _version = parts.next()?;
    let trace_id = parts.next()?;
    (trace_id.len() == 32 && trace_id.bytes().all(|b| b.is_ascii_hexdigit())).then_some(trace_id)
}
