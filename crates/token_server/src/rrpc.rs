//! Reverse remote procedure calls.
//!
//! The RRPC manager is a routing-layer plugin that lets the server call
//! procedures on a connected client. Each call gets a wrap-around call id
//! and, when the caller wants an answer, a pending entry plus an optional
//! cancellable timeout task. A `resp` token from the client, an `rpne`
//! token (remote procedure does not exist), a timeout, a connector stop,
//! or a server shutdown each resolve the call; whichever path removes the
//! pending entry first fires the callback, the loser observes the removal
//! and does nothing, so exactly one of success/failure fires per call.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use tokamak_protocol::{CloseReason, ConnectorId, Token};

use crate::engine::connector::Connector;
use crate::error::ServerError;
use crate::routing::{PluginVerdict, TokenPlugin, TokenServer};

/// Namespace of the RRPC plugin.
pub const NS_RRPC: &str = "tokamak.rrpc";

/// Token type of an outgoing call.
pub const TT_RRPC: &str = "rrpc";
/// Token type of a client response.
pub const TT_RESPONSE: &str = "resp";
/// Token type signalling the remote procedure does not exist.
pub const TT_NOT_EXISTS: &str = "rpne";

/// Upper bound for call ids; the counter wraps back to 0 here instead of
/// overflowing.
pub const CALL_ID_MAX: u32 = i32::MAX as u32;

/// Why a call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RrpcFailure {
    /// No response arrived inside the requested timeout
    Timeout,
    /// The target connector stopped while the call was pending
    ConnectorStopped,
    /// The client reported the procedure does not exist
    RemoteProcedureNotExists,
    /// The response failed the declared type or validity check
    InvalidResponse,
    /// The server shut down with the call still pending
    ServerShutdown,
}

impl std::fmt::Display for RrpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RrpcFailure::Timeout => "timeout",
            RrpcFailure::ConnectorStopped => "connector stopped",
            RrpcFailure::RemoteProcedureNotExists => "remote procedure does not exist",
            RrpcFailure::InvalidResponse => "invalid response",
            RrpcFailure::ServerShutdown => "server shutdown",
        };
        write!(f, "{label}")
    }
}

/// Terminal outcome delivered to a call's callback, exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum RrpcOutcome {
    /// The response passed its checks
    Success(Value),
    /// The call failed
    Failure(RrpcFailure),
}

/// Callback invoked with the call's single terminal outcome.
pub type RrpcCallback = Box<dyn FnOnce(RrpcOutcome) + Send + Sync>;

/// Caller-supplied response validity check.
pub type ResponseValidator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A procedure call to run on a client.
pub struct ProcedureCall {
    /// Procedure name on the client
    pub procedure: String,
    /// Positional arguments
    pub args: Vec<Value>,
    /// Declared response type; `None` or `"void"` expects no payload
    pub response_type: Option<String>,
    /// Optional validity check run before success fires
    pub validator: Option<ResponseValidator>,
    /// Optional per-call timeout
    pub timeout: Option<Duration>,
}

impl ProcedureCall {
    /// Starts a call to the named procedure.
    pub fn new(procedure: impl Into<String>) -> Self {
        Self {
            procedure: procedure.into(),
            args: Vec::new(),
            response_type: None,
            validator: None,
            timeout: None,
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    /// Declares the expected response type.
    pub fn expect(mut self, response_type: impl Into<String>) -> Self {
        self.response_type = Some(response_type.into());
        self
    }

    /// Attaches a validity check to run on the response.
    pub fn validate(mut self, validator: ResponseValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Bounds the call with a timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// How a pending call got resolved.
enum Arrival {
    Response(Value),
    Rpne,
    Timeout,
    ConnectorStopped,
    Shutdown,
}

struct PendingCall {
    response_type: Option<String>,
    validator: Option<ResponseValidator>,
    callback: RrpcCallback,
    timeout_handle: Option<AbortHandle>,
}

fn type_matches(declared: &str, value: &Value) -> bool {
    match declared {
        "string" => value.is_string(),
        "int" | "integer" => value.is_i64() || value.is_u64(),
        "double" | "number" => value.is_number(),
        "bool" | "boolean" => value.is_boolean(),
        "object" | "map" => value.is_object(),
        "array" | "list" => value.is_array(),
        _ => false,
    }
}

/// The reverse-RPC manager. Register it as a plugin so responses route
/// back to it; keep an `Arc` around to issue calls.
pub struct RrpcManager {
    counter: AtomicU32,
    pending: DashMap<ConnectorId, HashMap<u32, PendingCall>>,
    self_ref: std::sync::Weak<RrpcManager>,
}

impl RrpcManager {
    /// Creates the manager.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            counter: AtomicU32::new(0),
            pending: DashMap::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Issues the next call id, wrapping to 0 at [`CALL_ID_MAX`].
    fn next_call_id(&self) -> u32 {
        let previous = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(if current >= CALL_ID_MAX {
                    0
                } else {
                    current + 1
                })
            })
            .unwrap_or(0);
        if previous >= CALL_ID_MAX {
            0
        } else {
            previous + 1
        }
    }

    /// Outstanding calls for a connector; used by tests and diagnostics.
    pub fn pending_count(&self, connector_id: &ConnectorId) -> usize {
        self.pending
            .get(connector_id)
            .map(|per| per.len())
            .unwrap_or(0)
    }

    /// Sends a procedure call to the target connector.
    ///
    /// With a callback, the call is tracked until exactly one terminal
    /// outcome fires. Without one it is fire-and-forget: nothing is
    /// registered and no failure can reach the caller later.
    pub async fn send(
        &self,
        server: &TokenServer,
        target: ConnectorId,
        call: ProcedureCall,
        callback: Option<RrpcCallback>,
    ) -> u32 {
        let call_id = self.next_call_id();
        let Some(connector) = server.registry().get(&target) else {
            debug!("📞 RRPC call {call_id} to unknown connector {target}");
            if let Some(callback) = callback {
                callback(RrpcOutcome::Failure(RrpcFailure::ConnectorStopped));
            }
            return call_id;
        };

        let has_callback = callback.is_some();
        if let Some(callback) = callback {
            self.pending.entry(target).or_default().insert(
                call_id,
                PendingCall {
                    response_type: call.response_type.clone(),
                    validator: call.validator.clone(),
                    callback,
                    timeout_handle: None,
                },
            );
            if let Some(timeout) = call.timeout {
                if let Some(manager) = self.self_ref.upgrade() {
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        manager.resolve(target, call_id, Arrival::Timeout);
                    });
                    // Park the abort handle so a response cancels the timer.
                    if let Some(mut per_connector) = self.pending.get_mut(&target) {
                        match per_connector.get_mut(&call_id) {
                            Some(pending) => pending.timeout_handle = Some(task.abort_handle()),
                            // Resolved in the gap; the timer has nothing to do.
                            None => task.abort(),
                        }
                    } else {
                        task.abort();
                    }
                }
            }
        }

        let mut token = Token::new(NS_RRPC, TT_RRPC);
        token.set_string("procedure", call.procedure);
        token.set("args", Value::Array(call.args));
        token.set_i64("callId", call_id as i64);
        token.set_bool("hasCallback", has_callback);

        match server.send_token(None, &connector, &token).await {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                self.resolve(target, call_id, Arrival::ConnectorStopped);
            }
        }
        call_id
    }

    /// Resolves a pending call. The first caller to remove the entry wins;
    /// everyone else observes the removal and no-ops.
    fn resolve(&self, connector_id: ConnectorId, call_id: u32, arrival: Arrival) {
        let removed = self
            .pending
            .get_mut(&connector_id)
            .and_then(|mut per_connector| per_connector.remove(&call_id));
        let Some(call) = removed else {
            return;
        };
        if let Some(handle) = call.timeout_handle {
            handle.abort();
        }
        (call.callback)(Self::outcome_for(call.response_type, call.validator, arrival));
    }

    fn outcome_for(
        response_type: Option<String>,
        validator: Option<ResponseValidator>,
        arrival: Arrival,
    ) -> RrpcOutcome {
        match arrival {
            Arrival::Response(value) => match response_type.as_deref() {
                None | Some("void") => RrpcOutcome::Success(Value::Null),
                Some(declared) => {
                    let valid = type_matches(declared, &value)
                        && validator.map_or(true, |check| check(&value));
                    if valid {
                        RrpcOutcome::Success(value)
                    } else {
                        RrpcOutcome::Failure(RrpcFailure::InvalidResponse)
                    }
                }
            },
            Arrival::Rpne => RrpcOutcome::Failure(RrpcFailure::RemoteProcedureNotExists),
            Arrival::Timeout => RrpcOutcome::Failure(RrpcFailure::Timeout),
            Arrival::ConnectorStopped => RrpcOutcome::Failure(RrpcFailure::ConnectorStopped),
            Arrival::Shutdown => RrpcOutcome::Failure(RrpcFailure::ServerShutdown),
        }
    }

    fn fail_all_for(&self, connector_id: ConnectorId, arrival_reason: RrpcFailure) {
        let Some((_, per_connector)) = self.pending.remove(&connector_id) else {
            return;
        };
        let count = per_connector.len();
        for (_, call) in per_connector {
            if let Some(handle) = call.timeout_handle {
                handle.abort();
            }
            (call.callback)(RrpcOutcome::Failure(arrival_reason));
        }
        if count > 0 {
            debug!("📞 Failed {count} pending calls for {connector_id}: {arrival_reason}");
        }
    }
}

#[async_trait]
impl TokenPlugin for RrpcManager {
    fn id(&self) -> &str {
        "rrpc"
    }

    fn namespace(&self) -> &str {
        NS_RRPC
    }

    async fn process_token(
        &self,
        _server: &TokenServer,
        connector: &Arc<dyn Connector>,
        token: &Token,
    ) -> Result<PluginVerdict, ServerError> {
        match token.token_type.as_str() {
            TT_RESPONSE => {
                let Some(call_id) = token.get_i64("callId") else {
                    warn!("⚠️ resp token without callId from {}", connector.id());
                    return Ok(PluginVerdict::Abort);
                };
                let result = token.get("result").cloned().unwrap_or(Value::Null);
                self.resolve(connector.id(), call_id as u32, Arrival::Response(result));
                Ok(PluginVerdict::Abort)
            }
            TT_NOT_EXISTS => {
                let Some(call_id) = token.get_i64("callId") else {
                    warn!("⚠️ rpne token without callId from {}", connector.id());
                    return Ok(PluginVerdict::Abort);
                };
                self.resolve(connector.id(), call_id as u32, Arrival::Rpne);
                Ok(PluginVerdict::Abort)
            }
            _ => Ok(PluginVerdict::Continue),
        }
    }

    async fn connector_stopped(
        &self,
        _server: &TokenServer,
        connector: &Arc<dyn Connector>,
        _reason: CloseReason,
    ) {
        self.fail_all_for(connector.id(), RrpcFailure::ConnectorStopped);
    }

    async fn engine_stopped(&self, _server: &TokenServer) {
        let connector_ids: Vec<ConnectorId> =
            self.pending.iter().map(|entry| *entry.key()).collect();
        for connector_id in connector_ids {
            self.fail_all_for(connector_id, RrpcFailure::ServerShutdown);
        }
        info!("📞 RRPC manager shut down");
    }
}
