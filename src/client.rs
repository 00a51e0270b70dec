//! Caller side of the request/response correlation
//!
//! A call is written to the input queue under a fresh UUID and then polled
//! for in the output queue under the same key.
//!
//! ```text
//! Pending --response--> Fulfilled
//!    |----budget spent--> TimedOut
//!    '----abandon-------> Abandoned
//! ```
//!
//! Timing out does not clean up: the request may still be picked up later,
//! and its response will then sit in the output queue. Callers that want the
//! request gone call [`PendingCall::withdraw`].

use crate::error::{QueueError, Result};
use crate::poll::Poller;
use crate::protocol::{Request, Response};
use crate::segment::Segment;
use serde_json::Value;
use uuid::Uuid;

/// Where a call stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Fulfilled,
    TimedOut,
    Abandoned,
}

/// A request that has been written and not yet resolved
#[derive(Debug)]
pub struct PendingCall {
    id: String,
    function: String,
    state: CallState,
}

impl PendingCall {
    /// Correlation identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Check once for the response; consumes it when present
    pub fn try_complete(&mut self, segment: &Segment) -> Result<Option<Value>> {
        let entry = match segment.output().take(&self.id) {
            Ok(entry) => entry,
            Err(QueueError::KeyNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.state = CallState::Fulfilled;

        let response = Response::decode(&entry.payload)?;
        if response.uuid != self.id {
            return Err(QueueError::malformed(format!(
                "response under key '{}' carries uuid '{}'",
                self.id, response.uuid
            )));
        }
        response.into_result(&self.function).map(Some)
    }

    /// Block until the response arrives or `poller`'s budget is spent
    pub fn wait(&mut self, segment: &Segment, poller: &Poller) -> Result<Value> {
        let result = poller.poll(|| self.try_complete(segment));
        if let Err(QueueError::Timeout { attempts, .. }) = &result {
            self.state = CallState::TimedOut;
            tracing::debug!(id = %self.id, function = %self.function, attempts, "call timed out");
        }
        result
    }

    /// Async variant of [`PendingCall::wait`]
    #[cfg(feature = "async")]
    pub async fn wait_async(&mut self, segment: &Segment, poller: &Poller) -> Result<Value> {
        let result = poller.poll_async(|| self.try_complete(segment)).await;
        if matches!(result, Err(QueueError::Timeout { .. })) {
            self.state = CallState::TimedOut;
        }
        result
    }

    /// Remove the request if no worker has claimed it yet
    ///
    /// Returns `true` when the request was removed.
    pub fn withdraw(&mut self, segment: &Segment) -> Result<bool> {
        let input = segment.input();
        match input.claim(&self.id) {
            Ok(_) => {
                input.remove(&self.id)?;
                self.state = CallState::Abandoned;
                Ok(true)
            }
            Err(QueueError::KeyNotFound(_))
            | Err(QueueError::AlreadyClaimed { .. })
            | Err(QueueError::InvalidState { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Stop tracking the call; its entries stay where they are
    pub fn abandon(mut self) -> CallState {
        self.state = CallState::Abandoned;
        tracing::debug!(id = %self.id, "call abandoned");
        self.state
    }
}

/// Issues calls against one segment
pub struct Client<'a> {
    segment: &'a Segment,
    poller: Poller,
}

impl<'a> Client<'a> {
    pub fn new(segment: &'a Segment) -> Self {
        Self {
            segment,
            poller: Poller::default(),
        }
    }

    pub fn with_poller(mut self, poller: Poller) -> Self {
        self.poller = poller;
        self
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    /// Write a request and return without waiting
    pub fn submit(&self, function: &str, args: Value) -> Result<PendingCall> {
        let id = Uuid::new_v4().to_string();
        let payload = Request::new(function, id.as_str(), args).encode()?;
        self.segment.input().write(&id, &payload)?;
        tracing::debug!(id = %id, function, "call submitted");
        Ok(PendingCall {
            id,
            function: function.to_string(),
            state: CallState::Pending,
        })
    }

    /// Submit and wait for the result
    ///
    /// A [`QueueError::Timeout`] leaves the request in the input queue; the
    /// call may be retried, which uses a new identifier.
    pub fn call(&self, function: &str, args: Value) -> Result<Value> {
        let mut pending = self.submit(function, args)?;
        pending.wait(self.segment, &self.poller)
    }

    #[cfg(feature = "async")]
    pub async fn call_async(&self, function: &str, args: Value) -> Result<Value> {
        let mut pending = self.submit(function, args)?;
        pending.wait_async(self.segment, &self.poller).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;
    use serde_json::json;
    use std::time::Duration;

    fn segment() -> Segment {
        Segment::create_unique(&SegmentConfig {
            capacity: 8,
            max_payload: 512,
            ..SegmentConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_submit_writes_wire_request() {
        let seg = segment();
        let client = Client::new(&seg);
        let pending = client.submit("add", json!({"a": 1, "b": 2})).unwrap();

        assert_eq!(pending.state(), CallState::Pending);
        assert_eq!(pending.id().len(), 36);

        let entry = seg.input().read_by_key(pending.id()).unwrap();
        let request = Request::decode(&entry.payload).unwrap();
        assert_eq!(request.function, "add");
        assert_eq!(request.uuid, pending.id());
        assert_eq!(request.args, json!({"a": 1, "b": 2}));
        seg.teardown().unwrap();
    }

    #[test]
    fn test_try_complete_consumes_response() {
        let seg = segment();
        let client = Client::new(&seg);
        let mut pending = client.submit("add", json!({})).unwrap();
        assert_eq!(pending.try_complete(&seg).unwrap(), None);

        let response = Response::ok(pending.id(), json!(3)).encode().unwrap();
        seg.commit_response(pending.id(), &response).unwrap();

        assert_eq!(pending.try_complete(&seg).unwrap(), Some(json!(3)));
        assert_eq!(pending.state(), CallState::Fulfilled);
        assert!(seg.output().is_empty());
        seg.teardown().unwrap();
    }

    #[test]
    fn test_error_response_surfaces_worker_failure() {
        let seg = segment();
        let mut pending = Client::new(&seg).submit("add", json!({"a": 1})).unwrap();
        let response = Response::failed(pending.id(), "missing argument 'b'")
            .encode()
            .unwrap();
        seg.output().write(pending.id(), &response).unwrap();

        let poller = Poller::attempts(Duration::from_millis(1), 3);
        let err = pending.wait(&seg, &poller).unwrap_err();
        assert!(matches!(err, QueueError::WorkerFailed { ref function, .. } if function == "add"));
        seg.teardown().unwrap();
    }

    #[test]
    fn test_timeout_then_withdraw() {
        let seg = segment();
        let client = Client::new(&seg).with_poller(Poller::attempts(Duration::from_millis(1), 3));
        let mut pending = client.submit("nobody", json!({})).unwrap();

        let err = pending.wait(&seg, client.poller()).unwrap_err();
        assert!(matches!(err, QueueError::Timeout { attempts: 3, .. }));
        assert_eq!(pending.state(), CallState::TimedOut);
        assert!(seg.input().read_by_key(pending.id()).is_ok());

        assert!(pending.withdraw(&seg).unwrap());
        assert_eq!(pending.state(), CallState::Abandoned);
        assert!(seg.input().is_empty());
        assert!(!pending.withdraw(&seg).unwrap());
        seg.teardown().unwrap();
    }

    #[test]
    fn test_withdraw_leaves_claimed_request() {
        let seg = segment();
        let mut pending = Client::new(&seg).submit("add", json!({})).unwrap();
        seg.input().claim(pending.id()).unwrap();

        assert!(!pending.withdraw(&seg).unwrap());
        assert_eq!(pending.state(), CallState::Pending);
        assert_eq!(seg.input().len(), 1);
        seg.teardown().unwrap();
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_call_async_times_out() {
        let seg = segment();
        let client = Client::new(&seg).with_poller(Poller::attempts(Duration::from_millis(1), 2));
        let err = client.call_async("add", json!({})).await.unwrap_err();
        assert!(matches!(err, QueueError::Timeout { attempts: 2, .. }));
        assert_eq!(seg.input().len(), 1);
        seg.teardown().unwrap();
    }

    #[test]
    fn test_abandon() {
        let seg = segment();
        let pending = Client::new(&seg).submit("add", json!({})).unwrap();
        let id = pending.id().to_string();
        assert_eq!(pending.abandon(), CallState::Abandoned);
        // Orphaned request stays
        assert!(seg.input().read_by_key(&id).is_ok());
        seg.teardown().unwrap();
    }
}
