//! Call and attempt contexts: cancellation, deadlines, and capture opt-in.
//!
//! Contexts form a tree: caller context ⊇ overall-deadline context ⊇ hedge
//! group context ⊇ per-attempt context. Cancelling an outer layer cancels
//! every inner layer; deadlines only ever tighten.

use crate::observe::{AttemptInfo, TimelineCapture};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CtxError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// The caller-facing context for one call into the executor.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    capture: Option<TimelineCapture>,
}

impl CallContext {
    /// A context that is never cancelled and never expires.
    pub fn background() -> Self {
        Self::default()
    }

    /// Cancel this context and everything derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Derive a child: cancelling the parent cancels the child, not the
    /// reverse. Deadline and capture are inherited.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            capture: self.capture.clone(),
        }
    }

    /// Derive a context whose deadline is the tighter of the existing one and
    /// `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self {
            token: self.token.clone(),
            deadline: Some(deadline),
            capture: self.capture.clone(),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Opt in to timeline capture. The returned context carries the capture
    /// marker; the executor publishes the finalized timeline into the capture
    /// exactly once when the call terminates.
    pub fn record_timeline(&self) -> (Self, TimelineCapture) {
        let capture = TimelineCapture::new();
        let ctx = Self {
            token: self.token.clone(),
            deadline: self.deadline,
            capture: Some(capture.clone()),
        };
        (ctx, capture)
    }

    pub(crate) fn capture(&self) -> Option<&TimelineCapture> {
        self.capture.as_ref()
    }

    /// Drop the capture marker so nested calls do not inherit it.
    pub(crate) fn strip_capture(&self) -> Self {
        Self {
            token: self.token.clone(),
            deadline: self.deadline,
            capture: None,
        }
    }

    /// Why this context is done, if it is.
    ///
    /// Cancellation wins over an expired deadline when both hold.
    pub fn err(&self) -> Option<CtxError> {
        if self.token.is_cancelled() {
            return Some(CtxError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CtxError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    /// Pends forever on a background context.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

/// The context handed to one attempt of the caller's operation.
///
/// Carries the attempt's metadata and a context that is a strict descendant
/// of the caller's: the executor cancels it when a sibling wins or the call
/// is abandoned, and tightens its deadline with the per-attempt timeout.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    ctx: CallContext,
    info: AttemptInfo,
}

impl AttemptContext {
    pub(crate) fn new(ctx: CallContext, info: AttemptInfo) -> Self {
        Self { ctx, info }
    }

    pub fn info(&self) -> &AttemptInfo {
        &self.info
    }

    pub fn is_cancelled(&self) -> bool {
        self.ctx.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.ctx.deadline()
    }

    pub fn err(&self) -> Option<CtxError> {
        self.ctx.err()
    }

    pub async fn done(&self) {
        self.ctx.done().await
    }

    /// The underlying call context, for nesting executor calls inside an
    /// operation. The timeline capture never propagates through attempts.
    pub fn call_context(&self) -> CallContext {
        self.ctx.strip_capture()
    }
}
