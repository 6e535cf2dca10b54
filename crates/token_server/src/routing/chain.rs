//! Filter and plugin chain contracts.
//!
//! Inbound tokens pass the filter chain first; a single `Reject` verdict
//! short-circuits routing. Surviving tokens then walk the plugin chain in
//! registration order; each plugin only acts when the token's namespace
//! matches its own, and any plugin can abort the rest of the chain with an
//! explicit verdict rather than an exception or a shared mutable response.

use async_trait::async_trait;
use std::sync::Arc;

use tokamak_protocol::{CloseReason, Token};

use crate::engine::connector::Connector;
use crate::error::ServerError;
use crate::routing::TokenServer;

/// Verdict of one filter stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Let the token continue
    Pass,
    /// Drop the token; nothing downstream sees it
    Reject,
}

/// Verdict of one plugin invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginVerdict {
    /// Let later plugins see the token
    Continue,
    /// Stop the chain here
    Abort,
}

/// A token filter. Filters see every token regardless of namespace.
#[async_trait]
pub trait TokenFilter: Send + Sync {
    /// Stable identifier for logs.
    fn id(&self) -> &str;

    /// Inspects an inbound token before the plugin chain runs.
    async fn process_token_in(
        &self,
        _server: &TokenServer,
        _connector: &Arc<dyn Connector>,
        _token: &Token,
    ) -> FilterVerdict {
        FilterVerdict::Pass
    }

    /// Inspects an outbound token before it is encoded and delivered.
    async fn process_token_out(
        &self,
        _server: &TokenServer,
        _source: Option<&Arc<dyn Connector>>,
        _target: &Arc<dyn Connector>,
        _token: &Token,
    ) -> FilterVerdict {
        FilterVerdict::Pass
    }
}

/// A token plugin bound to one namespace.
#[async_trait]
pub trait TokenPlugin: Send + Sync {
    /// Stable identifier for logs.
    fn id(&self) -> &str;

    /// The namespace this plugin acts on.
    fn namespace(&self) -> &str;

    /// Handles a token addressed to this plugin's namespace.
    ///
    /// Errors are caught by the chain runner, logged with the offending
    /// namespace and token, and do not abort the remaining chain.
    async fn process_token(
        &self,
        server: &TokenServer,
        connector: &Arc<dyn Connector>,
        token: &Token,
    ) -> Result<PluginVerdict, ServerError>;

    /// A connector came up.
    async fn connector_started(&self, _server: &TokenServer, _connector: &Arc<dyn Connector>) {}

    /// A connector went down.
    async fn connector_stopped(
        &self,
        _server: &TokenServer,
        _connector: &Arc<dyn Connector>,
        _reason: CloseReason,
    ) {
    }

    /// The engine finished starting.
    async fn engine_started(&self, _server: &TokenServer) {}

    /// The engine stopped; pending plugin state must reach a terminal state.
    async fn engine_stopped(&self, _server: &TokenServer) {}
}
