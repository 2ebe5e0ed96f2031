//! Pending-call registry: at most one live call per identity.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::call::Call;
use crate::descriptor::{MethodKind, Rpc};
use crate::error::{CallError, Status};
use crate::packet::Packet;

const DEFAULT_MAX_PENDING: usize = 8192;

fn max_pending() -> usize {
    std::env::var("WIRECALL_MAX_PENDING")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_PENDING)
}

/// Tracks the single pending [`Call`] per `(channel, service, method)`
/// identity and emits the outgoing packets for request, stream, and
/// cancel actions.
///
/// Every operation is one non-suspending critical section over the map,
/// so single-threaded ordering is the only synchronization callers need.
pub struct PendingCalls {
    pending: Mutex<HashMap<String, Arc<Call>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Install `call` under its identity, returning whatever was
    /// previously installed there. The caller is responsible for
    /// cancelling the returned call.
    pub(crate) fn open(&self, call: Arc<Call>) -> Result<Option<Arc<Call>>, CallError> {
        let key = call.rpc().id_string();
        let mut pending = self.pending.lock();
        if !pending.contains_key(&key) && pending.len() >= max_pending() {
            tracing::warn!(
                pending_len = pending.len(),
                "too many pending calls; refusing new call"
            );
            return Err(CallError::Status(Status::ResourceExhausted));
        }
        Ok(pending.insert(key, call))
    }

    /// Register the call, evict-cancel any previous call under the same
    /// identity, and send the REQUEST packet.
    pub(crate) fn send_request(
        &self,
        call: Arc<Call>,
        payload: &[u8],
        ignore_errors: bool,
    ) -> Result<(), CallError> {
        let rpc = call.rpc().clone();
        if let Some(previous) = self.open(call)? {
            tracing::debug!(rpc = %rpc.id_string(), "evicting previous call for identity");
            previous.handle_error(Status::Cancelled);
        }
        let packet = Packet::request(rpc.ids(), payload).encode();
        match rpc.channel.send(&packet) {
            Ok(()) => Ok(()),
            Err(error) if ignore_errors => {
                tracing::warn!(rpc = %rpc.id_string(), %error, "ignoring channel failure for request");
                Ok(())
            }
            Err(error) => Err(CallError::Channel(error)),
        }
    }

    /// Send one client-streamed message for an active call.
    ///
    /// # Panics
    ///
    /// Panics if no call is pending under the identity: streaming on an
    /// RPC that was never invoked is caller misuse, not a runtime
    /// condition.
    pub(crate) fn send_client_stream(&self, rpc: &Rpc, payload: &[u8]) -> Result<(), CallError> {
        self.expect_pending(rpc);
        let packet = Packet::client_stream(rpc.ids(), payload).encode();
        rpc.channel.send(&packet).map_err(CallError::Channel)
    }

    /// Send the client stream-end marker for an active call.
    ///
    /// # Panics
    ///
    /// Panics if no call is pending under the identity, like
    /// [`send_client_stream`](Self::send_client_stream).
    pub(crate) fn send_client_stream_end(&self, rpc: &Rpc) -> Result<(), CallError> {
        self.expect_pending(rpc);
        let packet = Packet::client_stream_end(rpc.ids()).encode();
        rpc.channel.send(&packet).map_err(CallError::Channel)
    }

    /// Drop the pending entry and report the cancellation to the server.
    ///
    /// Returns whether a cancel packet was actually sent: a bidirectional
    /// call whose client stream already ended has nothing left for the
    /// server to cancel.
    pub(crate) fn send_cancel(
        &self,
        rpc: &Rpc,
        client_stream_ended: bool,
    ) -> Result<bool, CallError> {
        self.pending.lock().remove(&rpc.id_string());
        if rpc.method.kind() == MethodKind::BidirectionalStreaming && client_stream_ended {
            return Ok(false);
        }
        let packet = Packet::cancel(rpc.ids()).encode();
        rpc.channel.send(&packet).map_err(CallError::Channel)?;
        Ok(true)
    }

    /// Look up the pending call for an identity. Supplying a terminal
    /// `status` also removes the entry.
    pub fn get_pending(&self, rpc: &Rpc, status: Option<Status>) -> Option<Arc<Call>> {
        let key = rpc.id_string();
        let mut pending = self.pending.lock();
        match status {
            None => pending.get(&key).cloned(),
            Some(_) => pending.remove(&key),
        }
    }

    /// Number of currently pending calls.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    fn expect_pending(&self, rpc: &Rpc) {
        assert!(
            self.pending.lock().contains_key(&rpc.id_string()),
            "no pending call for {}; invoke the RPC before streaming on it",
            rpc.id_string()
        );
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PendingCalls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCalls")
            .field("pending", &self.len())
            .finish()
    }
}
