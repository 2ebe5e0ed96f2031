//! Call state machine and the shape-specific call handles.
//!
//! A [`Call`] is one in-flight invocation. Inbound packets drive it
//! through `handle_response` / `handle_completion` / `handle_error`;
//! consumers read decoded messages back out through a [`ResponseReader`]
//! or the listener callbacks. The four public handles (`UnaryCall`,
//! `ServerStreamingCall`, `ClientStreamingCall`,
//! `BidirectionalStreamingCall`) expose only the operations legal for
//! their shape; the state machine itself lives in one place.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec::Message;
use crate::descriptor::Rpc;
use crate::error::{CallError, Status};
use crate::queue::WaitQueue;
use crate::registry::PendingCalls;

// ============================================================================
// Listeners
// ============================================================================

/// Receives each decoded response message as it arrives.
pub trait ResponseListener: Send + Sync {
    fn on_next(&self, message: &Message);
}

impl<F: Fn(&Message) + Send + Sync> ResponseListener for F {
    fn on_next(&self, message: &Message) {
        self(message)
    }
}

/// Receives the final status of a gracefully completed call.
pub trait CompletionListener: Send + Sync {
    fn on_completed(&self, status: Status);
}

impl<F: Fn(Status) + Send + Sync> CompletionListener for F {
    fn on_completed(&self, status: Status) {
        self(status)
    }
}

/// Receives the error status of a failed or cancelled call.
pub trait ErrorListener: Send + Sync {
    fn on_error(&self, status: Status);
}

impl<F: Fn(Status) + Send + Sync> ErrorListener for F {
    fn on_error(&self, status: Status) {
        self(status)
    }
}

/// The three callback roles of a call. Roles left unset are explicit
/// no-ops rather than optional fields checked all over the state machine.
#[derive(Clone)]
pub struct CallListeners {
    on_next: Arc<dyn ResponseListener>,
    on_completed: Arc<dyn CompletionListener>,
    on_error: Arc<dyn ErrorListener>,
}

impl CallListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_next(mut self, listener: impl ResponseListener + 'static) -> Self {
        self.on_next = Arc::new(listener);
        self
    }

    pub fn on_completed(mut self, listener: impl CompletionListener + 'static) -> Self {
        self.on_completed = Arc::new(listener);
        self
    }

    pub fn on_error(mut self, listener: impl ErrorListener + 'static) -> Self {
        self.on_error = Arc::new(listener);
        self
    }
}

impl Default for CallListeners {
    fn default() -> Self {
        Self {
            on_next: Arc::new(|_: &Message| {}),
            on_completed: Arc::new(|_: Status| {}),
            on_error: Arc::new(|_: Status| {}),
        }
    }
}

impl fmt::Debug for CallListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallListeners").finish_non_exhaustive()
    }
}

// ============================================================================
// Call
// ============================================================================

#[derive(Default)]
struct CallInner {
    responses: Vec<Message>,
    status: Option<Status>,
    error: Option<Status>,
    callback_error: Option<String>,
    client_stream_ended: bool,
}

impl CallInner {
    fn terminal(&self) -> bool {
        self.status.is_some() || self.error.is_some()
    }
}

/// One in-flight invocation.
///
/// Buffers every decoded response, tracks the terminal state, and hands
/// messages to readers through a wait queue terminated by a stream-end
/// sentinel. At most one of `status` and `error` is ever set, and the
/// call is completed exactly when either is; no transitions happen after
/// that. The registry tracks the *current* call per identity; the
/// invoker owns the call itself.
pub struct Call {
    rpc: Rpc,
    registry: Arc<PendingCalls>,
    listeners: CallListeners,
    inner: Mutex<CallInner>,
    queue: Arc<WaitQueue<Option<Message>>>,
}

impl Call {
    pub(crate) fn new(registry: Arc<PendingCalls>, rpc: Rpc, listeners: CallListeners) -> Arc<Self> {
        Arc::new(Self {
            rpc,
            registry,
            listeners,
            inner: Mutex::new(CallInner::default()),
            queue: Arc::new(WaitQueue::new()),
        })
    }

    pub fn rpc(&self) -> &Rpc {
        &self.rpc
    }

    /// True once the call reached either terminal state.
    pub fn completed(&self) -> bool {
        self.inner.lock().terminal()
    }

    /// Final status of a gracefully completed call.
    pub fn status(&self) -> Option<Status> {
        self.inner.lock().status
    }

    /// Error status of a failed or cancelled call.
    pub fn error(&self) -> Option<Status> {
        self.inner.lock().error
    }

    /// Snapshot of every response received so far, in arrival order.
    pub fn responses(&self) -> Vec<Message> {
        self.inner.lock().responses.clone()
    }

    // ------------------------------------------------------------------
    // Outbound actions
    // ------------------------------------------------------------------

    /// Register in the registry (evicting and cancelling any previous
    /// call under the identity) and send the REQUEST packet. Channel
    /// failures propagate unless `ignore_errors` is set.
    pub(crate) fn invoke(
        call: &Arc<Self>,
        request: Option<&Message>,
        ignore_errors: bool,
    ) -> Result<(), CallError> {
        let payload = match request {
            Some(message) => call.rpc.method.encode_request(message)?,
            None => Vec::new(),
        };
        tracing::debug!(
            rpc = %call.rpc.id_string(),
            payload_len = payload.len(),
            "invoking rpc"
        );
        call.registry.send_request(call.clone(), &payload, ignore_errors)
    }

    /// Register without sending a request packet, for picking up an RPC
    /// that is already running on the server side.
    pub(crate) fn open(call: &Arc<Self>) -> Result<(), CallError> {
        if let Some(previous) = call.registry.open(call.clone())? {
            tracing::debug!(rpc = %call.rpc.id_string(), "evicting previous call for identity");
            previous.handle_error(Status::Cancelled);
        }
        Ok(())
    }

    /// Cancel the call.
    ///
    /// Returns `Ok(false)` without doing anything when the call is
    /// already terminal. Otherwise records the cancellation locally and
    /// reports whether a cancel packet actually went out; cancellation of
    /// in-flight transport bytes is cooperative, never forced.
    pub fn cancel(&self) -> Result<bool, CallError> {
        let client_stream_ended = {
            let mut inner = self.inner.lock();
            if inner.terminal() {
                return Ok(false);
            }
            inner.error = Some(Status::Cancelled);
            inner.client_stream_ended
        };
        self.queue.push(None);
        tracing::debug!(rpc = %self.rpc.id_string(), "cancelling call");
        self.registry.send_cancel(&self.rpc, client_stream_ended)
    }

    /// Send one message on the open client stream.
    ///
    /// Fails with the recorded error after cancellation or failure, and
    /// with FAILED_PRECONDITION after graceful completion.
    pub(crate) fn send_client_stream(&self, message: &Message) -> Result<(), CallError> {
        {
            let inner = self.inner.lock();
            if let Some(error) = inner.error {
                return Err(CallError::Status(error));
            }
            if inner.status.is_some() {
                return Err(CallError::Status(Status::FailedPrecondition));
            }
        }
        let payload = self.rpc.method.encode_request(message)?;
        self.registry.send_client_stream(&self.rpc, &payload)
    }

    // ------------------------------------------------------------------
    // Inbound packet handlers
    // ------------------------------------------------------------------

    pub(crate) fn handle_response(&self, message: Message) {
        {
            let mut inner = self.inner.lock();
            if inner.terminal() {
                tracing::debug!(rpc = %self.rpc.id_string(), "dropping response for terminal call");
                return;
            }
            inner.responses.push(message.clone());
        }
        self.queue.push(Some(message.clone()));
        self.run_callback("on_next", || self.listeners.on_next.on_next(&message));
    }

    pub(crate) fn handle_completion(&self, status: Status) {
        {
            let mut inner = self.inner.lock();
            if inner.terminal() {
                tracing::debug!(rpc = %self.rpc.id_string(), "dropping completion for terminal call");
                return;
            }
            inner.status = Some(status);
        }
        self.queue.push(None);
        tracing::debug!(rpc = %self.rpc.id_string(), %status, "call completed");
        self.run_callback("on_completed", || {
            self.listeners.on_completed.on_completed(status)
        });
    }

    pub(crate) fn handle_error(&self, status: Status) {
        {
            let mut inner = self.inner.lock();
            if inner.terminal() {
                tracing::debug!(rpc = %self.rpc.id_string(), "dropping error for terminal call");
                return;
            }
            inner.error = Some(status);
        }
        self.queue.push(None);
        tracing::debug!(rpc = %self.rpc.id_string(), %status, "call failed");
        self.run_callback("on_error", || self.listeners.on_error.on_error(status));
    }

    /// Run a user callback, deferring any panic so packet processing is
    /// never blocked or corrupted by application code. The panic is
    /// re-raised from the next blocking read.
    fn run_callback(&self, name: &str, callback: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
            let message = panic_message(payload.as_ref());
            tracing::error!(
                rpc = %self.rpc.id_string(),
                callback = name,
                %message,
                "call listener panicked"
            );
            self.inner.lock().callback_error = Some(format!("{name} listener panicked: {message}"));
        }
    }

    fn check_errors(&self) -> Result<(), CallError> {
        let inner = self.inner.lock();
        if let Some(message) = &inner.callback_error {
            return Err(CallError::Callback(message.clone()));
        }
        if let Some(error) = inner.error {
            return Err(CallError::Status(error));
        }
        Ok(())
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Call")
            .field("rpc", &self.rpc)
            .field("status", &inner.status)
            .field("error", &inner.error)
            .field("responses", &inner.responses.len())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

// ============================================================================
// Response reader
// ============================================================================

/// Lazy sequence of decoded responses from one call.
///
/// Each `next` first re-raises any deferred listener panic or recorded
/// error — errors take priority over buffered responses — and then waits
/// for the next message or the end of the stream. With a timeout, each
/// wait races a timer; losing the race raises
/// [`CallError::Timeout`] while the awaited item, if one arrives later,
/// is requeued at the front so delivery stays exactly-once and in order.
///
/// A reader created after completion observes the terminal sentinel
/// immediately and yields nothing further.
pub struct ResponseReader {
    call: Arc<Call>,
    remaining: Option<usize>,
    timeout: Option<Duration>,
}

impl ResponseReader {
    fn new(call: Arc<Call>, count: Option<usize>, timeout: Option<Duration>) -> Self {
        Self {
            call,
            remaining: count,
            timeout,
        }
    }

    /// The next response, or `None` once the stream has ended or the
    /// requested count has been read.
    pub async fn next(&mut self) -> Result<Option<Message>, CallError> {
        self.call.check_errors()?;
        if self.remaining == Some(0) {
            return Ok(None);
        }
        let item = match self.timeout {
            Some(timeout) => match self.call.queue.clone().shift_timeout(timeout).await {
                Some(item) => item,
                None => {
                    return Err(CallError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            },
            None => self.call.queue.shift().await,
        };
        match item {
            Some(message) => {
                self.call.check_errors()?;
                if let Some(remaining) = &mut self.remaining {
                    *remaining -= 1;
                }
                Ok(Some(message))
            }
            None => {
                // Leave the sentinel in place so later readers observe
                // the terminal state immediately.
                self.call.queue.unshift(None);
                self.call.check_errors()?;
                Ok(None)
            }
        }
    }

    /// Read to the end of the sequence, collecting every message.
    pub async fn collect(mut self) -> Result<Vec<Message>, CallError> {
        let mut messages = Vec::new();
        while let Some(message) = self.next().await? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// Adapt the reader into a `futures` stream. The stream ends after
    /// yielding an error.
    pub fn into_stream(self) -> impl futures_util::Stream<Item = Result<Message, CallError>> {
        futures_util::stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.next().await {
                Ok(Some(message)) => Some((Ok(message), Some(reader))),
                Ok(None) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }
}

impl fmt::Debug for ResponseReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseReader")
            .field("remaining", &self.remaining)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Drain responses until the stream ends, then report the final status.
/// Errors recorded on the call surface here instead.
async fn drain_to_completion(
    call: &Arc<Call>,
    timeout: Option<Duration>,
) -> Result<Status, CallError> {
    let mut reader = ResponseReader::new(call.clone(), None, timeout);
    while reader.next().await?.is_some() {}
    Ok(call
        .status()
        .expect("drained call completed without an error"))
}

/// Shared tail of the client-streaming shapes: send trailing messages,
/// half-close the request stream unless the call is already terminal,
/// then wait for the final status. Idempotent once the call completed.
async fn finish_call(
    call: &Arc<Call>,
    trailing: &[Message],
    timeout: Option<Duration>,
) -> Result<(Status, Vec<Message>), CallError> {
    for message in trailing {
        call.send_client_stream(message)?;
    }
    let send_end = {
        let mut inner = call.inner.lock();
        if !inner.terminal() && !inner.client_stream_ended {
            inner.client_stream_ended = true;
            true
        } else {
            false
        }
    };
    if send_end {
        call.registry.send_client_stream_end(&call.rpc)?;
    }
    let status = drain_to_completion(call, timeout).await?;
    Ok((status, call.responses()))
}

// ============================================================================
// Shape-specific handles
// ============================================================================

macro_rules! call_accessors {
    () => {
        /// The underlying call.
        pub fn call(&self) -> &Arc<Call> {
            &self.call
        }

        /// True once the call reached either terminal state.
        pub fn completed(&self) -> bool {
            self.call.completed()
        }

        /// Final status of a gracefully completed call.
        pub fn status(&self) -> Option<Status> {
            self.call.status()
        }

        /// Error status of a failed or cancelled call.
        pub fn error(&self) -> Option<Status> {
            self.call.error()
        }

        /// Snapshot of every response received so far.
        pub fn responses(&self) -> Vec<Message> {
            self.call.responses()
        }

        /// Lazily read responses; see [`ResponseReader`].
        pub fn response_reader(
            &self,
            count: Option<usize>,
            timeout: Option<Duration>,
        ) -> ResponseReader {
            ResponseReader::new(self.call.clone(), count, timeout)
        }

        /// Cancel the call; see [`Call::cancel`].
        pub fn cancel(&self) -> Result<bool, CallError> {
            self.call.cancel()
        }
    };
}

/// Handle for a unary call: exactly one response, then a status.
#[derive(Debug)]
pub struct UnaryCall {
    call: Arc<Call>,
}

impl UnaryCall {
    pub(crate) fn new(call: Arc<Call>) -> Self {
        Self { call }
    }

    call_accessors!();

    /// Wait for the response and the final status. Idempotent after
    /// completion.
    pub async fn complete(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(Status, Message), CallError> {
        let status = drain_to_completion(&self.call, timeout).await?;
        let response = self
            .call
            .responses()
            .into_iter()
            .next()
            // The call completed without the unary response payload.
            .ok_or(CallError::Status(Status::DataLoss))?;
        Ok((status, response))
    }
}

/// Handle for a server-streaming call.
#[derive(Debug)]
pub struct ServerStreamingCall {
    call: Arc<Call>,
}

impl ServerStreamingCall {
    pub(crate) fn new(call: Arc<Call>) -> Self {
        Self { call }
    }

    call_accessors!();

    /// Wait for the stream to end; returns the final status and every
    /// response received over the call's lifetime.
    pub async fn complete(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(Status, Vec<Message>), CallError> {
        let status = drain_to_completion(&self.call, timeout).await?;
        Ok((status, self.call.responses()))
    }
}

/// Handle for a client-streaming call.
#[derive(Debug)]
pub struct ClientStreamingCall {
    call: Arc<Call>,
}

impl ClientStreamingCall {
    pub(crate) fn new(call: Arc<Call>) -> Self {
        Self { call }
    }

    call_accessors!();

    /// Send one request message on the open client stream.
    pub fn send(&self, message: &Message) -> Result<(), CallError> {
        self.call.send_client_stream(message)
    }

    /// Send any trailing messages, end the client stream, and wait for
    /// the final status and response. Idempotent after completion.
    pub async fn finish_and_wait(
        &self,
        trailing: &[Message],
        timeout: Option<Duration>,
    ) -> Result<(Status, Vec<Message>), CallError> {
        finish_call(&self.call, trailing, timeout).await
    }
}

/// Handle for a bidirectional-streaming call.
#[derive(Debug)]
pub struct BidirectionalStreamingCall {
    call: Arc<Call>,
}

impl BidirectionalStreamingCall {
    pub(crate) fn new(call: Arc<Call>) -> Self {
        Self { call }
    }

    call_accessors!();

    /// Send one request message on the open client stream.
    pub fn send(&self, message: &Message) -> Result<(), CallError> {
        self.call.send_client_stream(message)
    }

    /// Send any trailing messages, end the client stream, and wait for
    /// the final status and all responses. Idempotent after completion.
    pub async fn finish_and_wait(
        &self,
        trailing: &[Message],
        timeout: Option<Duration>,
    ) -> Result<(Status, Vec<Message>), CallError> {
        finish_call(&self.call, trailing, timeout).await
    }
}
