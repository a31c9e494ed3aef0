//! Restart handoff
//!
//! A swap that needs an activity restart cannot run now. The session answers
//! `NEED_ACTIVITY_RESTART` at once, then parks the request together with its
//! connection as one [`PendingSwap`] and passes a token for it to the hooked
//! handler in the payload. When the host reaches the restart boundary the
//! handler calls back into [`native_bindings`], which takes the pending swap
//! out of the table, applies it and writes the final response.
//!
//! The table hands each pending swap out exactly once. The session never
//! sees a pending swap again after parking it, and a token that was already
//! consumed (or never issued) finds nothing.
//!
//! The hooked handler holds one token per process. Once it accepts a new
//! token, every older swap parked for the same process is unreachable; each
//! is taken back and answered `ERROR` with kind `SUPERSEDED`. A handler that
//! refuses the token gets the same treatment for the new swap, with kind
//! `HANDOFF`. Either way the controller sees its final frame.

use crate::error::{AttachError, HandoffError};
use crate::host::{HostRuntime, JValue, MethodSig, NativeBinding};
use crate::protocol::{ErrorDetail, Request, Response, Status};
use crate::swap::SwapExecutor;
use crate::transport::Connection;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Payload class that wraps the hooked handler
pub const HANDLER_WRAPPER_CLASS: &str =
    "com/android/tools/deploy/instrument/ActivityThreadHandlerWrapper";

/// Hands a pending-swap token to the wrapper
pub const PREPARE_FOR_HOT_SWAP: MethodSig = MethodSig::new("prepareForHotSwap", "(J)V");

/// Native: apply the pending swap for a token
pub const TRY_REDEFINE_CLASSES: MethodSig = MethodSig::new("tryRedefineClasses", "(J)Z");

/// Native: message code the hooked handler waits for
pub const GET_APPLICATION_INFO_CHANGED: MethodSig =
    MethodSig::new("getApplicationInfoChangedValue", "()I");

/// Handler message code for "application info changed"
pub const APPLICATION_INFO_CHANGED: i32 = 156;

/// Error kind for a swap replaced by a newer one before the restart
pub const SUPERSEDED: &str = "SUPERSEDED";

/// Error kind for a swap the hooked handler refused
pub const HANDOFF: &str = "HANDOFF";

static PENDING: Lazy<Mutex<HashMap<i64, PendingSwap>>> = Lazy::new(|| Mutex::new(HashMap::new()));
static NEXT_TOKEN: AtomicI64 = AtomicI64::new(1);

/// The full native binding table, registered on every handoff
///
/// A previous agent image attached to the same process may have left its own
/// function pointers behind; registering the whole table replaces them.
#[must_use]
pub fn native_bindings() -> [NativeBinding; 2] {
    [
        NativeBinding::new(
            HANDLER_WRAPPER_CLASS,
            GET_APPLICATION_INFO_CHANGED,
            native_get_application_info_changed,
        ),
        NativeBinding::new(
            HANDLER_WRAPPER_CLASS,
            TRY_REDEFINE_CLASSES,
            native_try_redefine_classes,
        ),
    ]
}

fn native_get_application_info_changed(_host: &dyn HostRuntime, _args: &[JValue]) -> JValue {
    JValue::Int(APPLICATION_INFO_CHANGED)
}

fn native_try_redefine_classes(host: &dyn HostRuntime, args: &[JValue]) -> JValue {
    let Some(token) = args.first().and_then(JValue::as_long) else {
        tracing::error!(?args, "tryRedefineClasses called without a token");
        return JValue::Bool(false);
    };
    match take(token) {
        Some(pending) => JValue::Bool(pending.complete(host)),
        None => {
            tracing::warn!(token, "no pending swap for token");
            JValue::Bool(false)
        }
    }
}

/// A deferred swap: the request and the connection its answer goes to
pub struct PendingSwap {
    pid: u32,
    request: Request,
    connection: Box<dyn Connection>,
}

impl PendingSwap {
    fn new(pid: u32, request: Request, connection: Box<dyn Connection>) -> Self {
        Self {
            pid,
            request,
            connection,
        }
    }

    /// Apply the swap and write the final response, consuming the pending
    /// swap and closing its connection
    ///
    /// Returns whether the swap was applied and reported.
    pub fn complete(mut self, host: &dyn HostRuntime) -> bool {
        let executor = SwapExecutor::new();
        match executor.execute_and_respond(host, &self.request, self.connection.as_mut()) {
            Ok(response) => response.status == Status::Ok,
            Err(e) => {
                tracing::error!(error = %e, "cannot deliver final swap response");
                false
            }
        }
    }

    /// Answer `ERROR` without applying the swap, consuming the pending swap
    /// and closing its connection
    fn abandon(mut self, detail: ErrorDetail) {
        let response = Response::error(self.pid, detail);
        if let Err(e) = self.connection.write_frame(&response.encode()) {
            tracing::warn!(error = %e, "cannot deliver final swap response");
        }
    }
}

impl fmt::Debug for PendingSwap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSwap")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// Park `pending` and return the token that claims it
fn park(pending: PendingSwap) -> i64 {
    let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    PENDING.lock().insert(token, pending);
    token
}

/// Claim the pending swap for `token`; each token yields at most once
#[must_use]
pub fn take(token: i64) -> Option<PendingSwap> {
    PENDING.lock().remove(&token)
}

/// Claim every swap parked for `pid` other than `current`
fn take_superseded(pid: u32, current: i64) -> Vec<PendingSwap> {
    let mut pending = PENDING.lock();
    let stale: Vec<i64> = pending
        .iter()
        .filter(|(token, swap)| **token != current && swap.pid == pid)
        .map(|(token, _)| *token)
        .collect();
    stale.into_iter().filter_map(|token| pending.remove(&token)).collect()
}

/// Parks deferred swaps with the hooked handler
#[derive(Debug, Clone, Copy, Default)]
pub struct RestartHandoff;

impl RestartHandoff {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Register the full native binding table
    ///
    /// # Errors
    /// [`HandoffError::RegisterNatives`] if the host refuses
    pub fn register_natives(&self, host: &dyn HostRuntime) -> Result<(), HandoffError> {
        host.register_natives(&native_bindings())
            .map_err(HandoffError::RegisterNatives)?;
        tracing::debug!("native bindings registered");
        Ok(())
    }

    /// Answer `NEED_ACTIVITY_RESTART`, then give the request and connection
    /// to the hooked handler
    ///
    /// Returns the token under which the swap was parked. Older swaps parked
    /// for the same process are answered `SUPERSEDED`.
    ///
    /// # Errors
    /// A transport error if the interim response cannot be written (nothing
    /// is parked), or [`HandoffError::Transfer`] if the handler refuses the
    /// token (the swap is answered `HANDOFF` and dropped).
    pub fn respond_and_transfer(
        &self,
        host: &dyn HostRuntime,
        request: Request,
        mut connection: Box<dyn Connection>,
    ) -> Result<i64, AttachError> {
        let pid = host.process_id();
        let interim = Response::need_restart(pid);
        connection.write_frame(&interim.encode())?;

        let package = request.package_name.clone();
        let token = park(PendingSwap::new(pid, request, connection));

        if let Err(source) =
            host.call_static(HANDLER_WRAPPER_CLASS, &PREPARE_FOR_HOT_SWAP, &[JValue::Long(token)])
        {
            if let Some(pending) = take(token) {
                pending.abandon(ErrorDetail::new(HANDOFF, source.to_string()));
            }
            return Err(HandoffError::Transfer(source).into());
        }

        for stale in take_superseded(pid, token) {
            tracing::warn!(package = %stale.request.package_name, "deferred swap superseded");
            stale.abandon(ErrorDetail::new(
                SUPERSEDED,
                "replaced by a newer deferred swap before the activity restarted",
            ));
        }

        tracing::info!(package = %package, token, "swap deferred until activity restart");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostError, HostErrorCode, MockHostRuntime};
    use crate::protocol::ChangeSet;
    use crate::transport::TransportError;
    use std::sync::Arc;

    /// Connection that records written frames
    #[derive(Default, Clone)]
    struct Recorder {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Connection for Recorder {
        fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
            Err(TransportError::Closed)
        }

        fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
            self.frames.lock().push(frame.to_vec());
            Ok(())
        }
    }

    fn request() -> Request {
        Request {
            package_name: "com.example".to_string(),
            restart_activity: true,
            change_set: ChangeSet::default(),
        }
    }

    fn statuses(recorder: &Recorder) -> Vec<Status> {
        recorder
            .frames
            .lock()
            .iter()
            .map(|f| Response::decode(f).unwrap().status)
            .collect()
    }

    #[test]
    fn bindings_cover_wrapper_natives() {
        let table = native_bindings();
        assert!(table.iter().all(|b| b.class == HANDLER_WRAPPER_CLASS));
        assert_eq!(table[0].method, GET_APPLICATION_INFO_CHANGED);
        assert_eq!(table[1].method, TRY_REDEFINE_CLASSES);

        let host = MockHostRuntime::new();
        assert_eq!((table[0].function)(&host, &[]), JValue::Int(APPLICATION_INFO_CHANGED));
    }

    #[test]
    fn interim_then_final_on_same_connection() {
        let recorder = Recorder::default();
        let mut host = MockHostRuntime::new();
        host.expect_process_id().return_const(101u32);
        host.expect_call_static()
            .withf(|class, m, args| {
                class == HANDLER_WRAPPER_CLASS
                    && *m == PREPARE_FOR_HOT_SWAP
                    && matches!(args, [JValue::Long(_)])
            })
            .times(1)
            .returning(|_, _, _| Ok(JValue::Void));
        host.expect_redefine_classes().times(1).returning(|_| Ok(()));

        let token = RestartHandoff::new()
            .respond_and_transfer(&host, request(), Box::new(recorder.clone()))
            .unwrap();
        assert_eq!(statuses(&recorder), vec![Status::NeedActivityRestart]);

        // Host reaches the restart boundary.
        let applied = native_try_redefine_classes(&host, &[JValue::Long(token)]);
        assert_eq!(applied, JValue::Bool(true));
        assert_eq!(statuses(&recorder), vec![Status::NeedActivityRestart, Status::Ok]);

        // A second trigger with the same token finds nothing.
        assert_eq!(native_try_redefine_classes(&host, &[JValue::Long(token)]), JValue::Bool(false));
        assert_eq!(recorder.frames.lock().len(), 2);
    }

    #[test]
    fn rejected_deferred_swap_reports_error() {
        let recorder = Recorder::default();
        let mut host = MockHostRuntime::new();
        host.expect_process_id().return_const(102u32);
        host.expect_call_static().returning(|_, _, _| Ok(JValue::Void));
        host.expect_redefine_classes()
            .times(1)
            .returning(|_| Err(HostError::new(HostErrorCode::UnsupportedChange, "schema change")));

        let token = RestartHandoff::new()
            .respond_and_transfer(&host, request(), Box::new(recorder.clone()))
            .unwrap();
        assert_eq!(native_try_redefine_classes(&host, &[JValue::Long(token)]), JValue::Bool(false));
        assert_eq!(statuses(&recorder), vec![Status::NeedActivityRestart, Status::Error]);
    }

    fn last_detail(recorder: &Recorder) -> ErrorDetail {
        let frames = recorder.frames.lock();
        Response::decode(frames.last().unwrap())
            .unwrap()
            .error_detail
            .unwrap()
    }

    #[test]
    fn refused_transfer_answers_final_error() {
        let recorder = Recorder::default();
        let mut host = MockHostRuntime::new();
        host.expect_process_id().return_const(103u32);
        host.expect_call_static()
            .returning(|_, _, _| Err(HostError::new(HostErrorCode::ClassNotFound, "no wrapper")));
        host.expect_redefine_classes().never();

        let err = RestartHandoff::new()
            .respond_and_transfer(&host, request(), Box::new(recorder.clone()))
            .unwrap_err();
        assert!(matches!(err, AttachError::Handoff(HandoffError::Transfer(_))));
        assert_eq!(statuses(&recorder), vec![Status::NeedActivityRestart, Status::Error]);
        let detail = last_detail(&recorder);
        assert_eq!(detail.kind, HANDOFF);
        assert!(detail.message.contains("no wrapper"));
    }

    fn accepting_host(pid: u32) -> MockHostRuntime {
        let mut host = MockHostRuntime::new();
        host.expect_process_id().return_const(pid);
        host.expect_call_static().returning(|_, _, _| Ok(JValue::Void));
        host.expect_redefine_classes().never();
        host
    }

    #[test]
    fn newer_swap_supersedes_older_in_same_process() {
        let process = accepting_host(104);
        let other_process = accepting_host(105);
        let (older, unrelated, newer) = (Recorder::default(), Recorder::default(), Recorder::default());
        let handoff = RestartHandoff::new();

        let older_token = handoff
            .respond_and_transfer(&process, request(), Box::new(older.clone()))
            .unwrap();
        let unrelated_token = handoff
            .respond_and_transfer(&other_process, request(), Box::new(unrelated.clone()))
            .unwrap();
        let newer_token = handoff
            .respond_and_transfer(&process, request(), Box::new(newer.clone()))
            .unwrap();

        assert_eq!(statuses(&older), vec![Status::NeedActivityRestart, Status::Error]);
        assert_eq!(last_detail(&older).kind, SUPERSEDED);
        assert!(take(older_token).is_none());

        assert_eq!(statuses(&unrelated), vec![Status::NeedActivityRestart]);
        assert_eq!(statuses(&newer), vec![Status::NeedActivityRestart]);
        assert!(take(unrelated_token).is_some());
        assert!(take(newer_token).is_some());
    }

    #[test]
    fn missing_token_argument_is_rejected() {
        let host = MockHostRuntime::new();
        assert_eq!(native_try_redefine_classes(&host, &[]), JValue::Bool(false));
        assert_eq!(native_try_redefine_classes(&host, &[JValue::Int(1)]), JValue::Bool(false));
    }
}
