//! Worker side: dispatch loop bound to one function
//!
//! A worker scans the input queue oldest-first and only claims requests for
//! its own function. Foreign requests are left untouched for other workers.
//! Claiming is exclusive, so two workers for the same function never process
//! the same request.
//!
//! Outcomes per request:
//! - handler succeeded: response committed, request removed (one lock hold)
//! - handler rejected the arguments: error response written, request
//!   dead-lettered
//! - payload unreadable: request dead-lettered, no response possible
//! - request removed while the handler ran (cleared, reconciled): dropped

use crate::error::{QueueError, Result};
use crate::poll::Poller;
use crate::protocol::{Request, Response};
use crate::segment::Segment;
use crate::table::EntryState;
use serde_json::Value;

/// Why a handler refused a request
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("missing argument '{0}'")]
    MissingArgument(String),

    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

/// Computes a result from request arguments
pub trait Handler {
    fn handle(&mut self, args: &Value) -> std::result::Result<Value, HandlerError>;
}

impl<F> Handler for F
where
    F: FnMut(&Value) -> std::result::Result<Value, HandlerError>,
{
    fn handle(&mut self, args: &Value) -> std::result::Result<Value, HandlerError> {
        self(args)
    }
}

/// What one dispatch step did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing for this worker
    Idle,
    /// Response committed
    Processed { id: String },
    /// Handler refused; error response written and request dead-lettered
    Rejected { id: String, reason: String },
    /// Payload unreadable; request dead-lettered
    DeadLettered { id: String, reason: String },
    /// Output queue full; claim released for a later attempt
    Deferred { id: String },
    /// Request disappeared while being handled; result discarded
    Vanished { id: String },
}

impl Outcome {
    fn made_progress(&self) -> bool {
        !matches!(
            self,
            Outcome::Idle | Outcome::Deferred { .. } | Outcome::Vanished { .. }
        )
    }
}

/// Counters kept across steps
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub rejected: u64,
    pub dead_lettered: u64,
    pub deferred: u64,
    /// Requests removed by someone else mid-dispatch
    pub vanished: u64,
    /// Foreign requests seen and left alone
    pub skipped: u64,
}

pub struct Worker<'a, H> {
    segment: &'a Segment,
    function: String,
    handler: H,
    stats: WorkerStats,
}

impl<'a, H: Handler> Worker<'a, H> {
    pub fn new(segment: &'a Segment, function: impl Into<String>, handler: H) -> Self {
        Self {
            segment,
            function: function.into(),
            handler,
            stats: WorkerStats::default(),
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Handle at most one request
    pub fn step(&mut self) -> Result<Outcome> {
        let segment = self.segment;
        let input = segment.input();

        for entry in input.scan() {
            if entry.state != EntryState::Ready {
                continue;
            }

            // Unreadable payloads name no function, so any worker parks them
            let request = match Request::decode(&entry.payload) {
                Ok(request) => request,
                Err(QueueError::MalformedPayload { reason }) => {
                    match self.park(&entry.key, reason)? {
                        Some(outcome) => return Ok(outcome),
                        None => continue,
                    }
                }
                Err(e) => return Err(e),
            };

            if request.function != self.function {
                self.stats.skipped += 1;
                continue;
            }

            if request.uuid != entry.key {
                let reason = format!("uuid '{}' does not match key", request.uuid);
                match self.park(&entry.key, reason)? {
                    Some(outcome) => return Ok(outcome),
                    None => continue,
                }
            }

            match input.claim(&entry.key) {
                Ok(_) => {}
                Err(
                    QueueError::AlreadyClaimed { .. }
                    | QueueError::KeyNotFound(_)
                    | QueueError::InvalidState { .. },
                ) => continue,
                Err(e) => return Err(e),
            }

            return self.dispatch(request);
        }

        Ok(Outcome::Idle)
    }

    fn dispatch(&mut self, request: Request) -> Result<Outcome> {
        let id = request.uuid;
        let response = match self.handler.handle(&request.args) {
            Ok(result) => Response::ok(id.as_str(), result).encode()?,
            Err(e) => return self.reject(id, e.to_string()),
        };

        match self.segment.commit_response(&id, &response) {
            Ok(()) => {
                self.stats.processed += 1;
                tracing::debug!(id = %id, function = %self.function, "request processed");
                Ok(Outcome::Processed { id })
            }
            Err(QueueError::PayloadTooLarge { max, got }) => {
                self.reject(id, format!("result of {got} bytes exceeds {max} byte payload limit"))
            }
            Err(e) => self.give_back(id, e),
        }
    }

    fn reject(&mut self, id: String, reason: String) -> Result<Outcome> {
        let response = Response::failed(id.as_str(), reason.as_str()).encode()?;
        match self.segment.reject(&id, &response) {
            Ok(()) => {
                self.stats.rejected += 1;
                Ok(Outcome::Rejected { id, reason })
            }
            Err(e) => self.give_back(id, e),
        }
    }

    /// Release the claim after the output write failed
    fn give_back(&mut self, id: String, err: QueueError) -> Result<Outcome> {
        if let QueueError::KeyNotFound(_) = err {
            return Ok(self.vanished(id));
        }
        match self.segment.input().release(&id) {
            Ok(()) => {}
            Err(QueueError::KeyNotFound(_)) => return Ok(self.vanished(id)),
            Err(e) => return Err(e),
        }
        match err {
            QueueError::QueueFull { .. } => {
                self.stats.deferred += 1;
                tracing::debug!(id = %id, "output queue full, request deferred");
                Ok(Outcome::Deferred { id })
            }
            e => Err(e),
        }
    }

    fn vanished(&mut self, id: String) -> Outcome {
        self.stats.vanished += 1;
        tracing::debug!(id = %id, "request removed while being handled, result dropped");
        Outcome::Vanished { id }
    }

    /// Dead-letter an unreadable request; `None` if someone else got to it
    fn park(&mut self, key: &str, reason: String) -> Result<Option<Outcome>> {
        let segment = self.segment;
        let input = segment.input();
        match input.claim(key) {
            Ok(_) => {}
            Err(
                QueueError::AlreadyClaimed { .. }
                | QueueError::KeyNotFound(_)
                | QueueError::InvalidState { .. },
            ) => return Ok(None),
            Err(e) => return Err(e),
        }
        input.dead_letter(key)?;
        self.stats.dead_lettered += 1;
        tracing::warn!(key, reason = %reason, "unreadable request dead-lettered");
        Ok(Some(Outcome::DeadLettered {
            id: key.to_string(),
            reason,
        }))
    }

    /// Reconcile, then process requests until `poller`'s budget passes idle
    ///
    /// The budget restarts after every request handled.
    pub fn serve(&mut self, poller: &Poller) -> Result<WorkerStats> {
        self.segment.reconcile();
        tracing::info!(function = %self.function, segment = self.segment.descriptor(), "worker serving");

        loop {
            let polled = poller.poll(|| {
                let outcome = self.step()?;
                Ok(outcome.made_progress().then_some(outcome))
            });
            match polled {
                Ok(_) => continue,
                Err(QueueError::Timeout { .. }) => break,
                Err(e) => return Err(e),
            }
        }

        tracing::info!(function = %self.function, stats = ?self.stats, "worker idle, stopping");
        Ok(self.stats.clone())
    }
}
