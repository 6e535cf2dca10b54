//! The token routing layer.
//!
//! Sits directly on the engine: packets come in, tokens go through the
//! filter chain and the plugin chain, replies and broadcasts go back out
//! through the negotiated codec. The server never owns connectors; it
//! reaches them through the engine's registry by id.

pub mod chain;
pub mod fragment;
pub mod pool;

pub use chain::{FilterVerdict, PluginVerdict, TokenFilter, TokenPlugin};

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, error, info, warn};

use tokamak_protocol::{
    CloseReason, FrameType, JsonTokenCodec, Packet, Token, TokenCodec,
};

use crate::config::DispatchSettings;
use crate::engine::connector::Connector;
use crate::engine::{ConnectorRegistry, EngineHooks};
use crate::error::ServerError;
use crate::session::SessionManager;
use fragment::FragmentStore;
use pool::DispatchPool;

/// Current namespace prefix for built-in plugins.
pub const NS_PREFIX: &str = "tokamak";

/// Namespace prefix of the previous major release, rewritten on arrival
/// for backward compatibility.
pub const LEGACY_NS_PREFIX: &str = "org.tokamak";

/// Connector variable naming the broadcast group a connector belongs to.
pub const GROUP_VAR: &str = "group";

/// Options for a broadcast.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastOptions {
    /// Whether the originating connector receives the token too
    pub sender_included: bool,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            sender_included: false,
        }
    }
}

/// Rewrites legacy namespace prefixes to the current one.
pub fn normalize_namespace(namespace: &str) -> String {
    if namespace == LEGACY_NS_PREFIX {
        return NS_PREFIX.to_string();
    }
    match namespace.strip_prefix(LEGACY_NS_PREFIX) {
        Some(rest) if rest.starts_with('.') => format!("{NS_PREFIX}{rest}"),
        _ => namespace.to_string(),
    }
}

/// The token server: codec dispatch, filter and plugin chains, direct and
/// broadcast delivery, and fragment reassembly.
pub struct TokenServer {
    registry: Arc<ConnectorRegistry>,
    codecs: DashMap<String, Arc<dyn TokenCodec>>,
    filters: RwLock<Vec<Arc<dyn TokenFilter>>>,
    plugins: RwLock<Vec<Arc<dyn TokenPlugin>>>,
    pool: DispatchPool,
    fragments: FragmentStore,
    sessions: Option<Arc<SessionManager>>,
    stopped: AtomicBool,
    self_ref: Weak<TokenServer>,
}

impl TokenServer {
    /// Creates the server over an engine's registry.
    ///
    /// The JSON codec is pre-registered; further codecs attach with
    /// [`TokenServer::register_codec`].
    pub fn new(
        registry: Arc<ConnectorRegistry>,
        dispatch: &DispatchSettings,
        sessions: Option<Arc<SessionManager>>,
    ) -> Arc<Self> {
        let server = Arc::new_cyclic(|self_ref| Self {
            registry,
            codecs: DashMap::new(),
            filters: RwLock::new(Vec::new()),
            plugins: RwLock::new(Vec::new()),
            pool: DispatchPool::new(dispatch),
            fragments: FragmentStore::new(),
            sessions,
            stopped: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });
        server.register_codec(Arc::new(JsonTokenCodec::new()));
        server
    }

    /// The engine registry this server routes through.
    pub fn registry(&self) -> &Arc<ConnectorRegistry> {
        &self.registry
    }

    /// Registers a codec under its format string.
    pub fn register_codec(&self, codec: Arc<dyn TokenCodec>) {
        self.codecs.insert(codec.format().to_string(), codec);
    }

    /// Looks up the codec for a wire format.
    pub fn codec_for(&self, format: &str) -> Option<Arc<dyn TokenCodec>> {
        self.codecs.get(format).map(|entry| entry.value().clone())
    }

    /// Appends a filter to the chain.
    pub fn add_filter(&self, filter: Arc<dyn TokenFilter>) {
        self.filters.write().unwrap().push(filter);
    }

    /// Appends a plugin to the chain. Plugins run in registration order.
    pub fn add_plugin(&self, plugin: Arc<dyn TokenPlugin>) {
        info!("🔌 Plugin '{}' registered for namespace '{}'", plugin.id(), plugin.namespace());
        self.plugins.write().unwrap().push(plugin);
    }

    fn filter_chain(&self) -> Vec<Arc<dyn TokenFilter>> {
        self.filters.read().unwrap().clone()
    }

    fn plugin_chain(&self) -> Vec<Arc<dyn TokenPlugin>> {
        self.plugins.read().unwrap().clone()
    }

    /// Routes one inbound token: filters first, then the plugin chain.
    ///
    /// Tokens flagged `spawnThread` run on the dispatch pool instead of the
    /// calling task.
    pub async fn route_token(&self, connector: Arc<dyn Connector>, token: Token) {
        if token.namespace.is_empty() {
            warn!("⚠️ Dropping token without namespace from {}", connector.id());
            return;
        }
        if token.spawn_thread() {
            let Some(server) = self.self_ref.upgrade() else {
                return;
            };
            self.pool.spawn(async move {
                server.run_chains(&connector, &token).await;
            });
            return;
        }
        self.run_chains(&connector, &token).await;
    }

    async fn run_chains(&self, connector: &Arc<dyn Connector>, token: &Token) {
        for filter in self.filter_chain() {
            if filter.process_token_in(self, connector, token).await == FilterVerdict::Reject {
                debug!(
                    "🛑 Filter '{}' rejected '{}:{}' from {}",
                    filter.id(),
                    token.namespace,
                    token.token_type,
                    connector.id()
                );
                return;
            }
        }

        for plugin in self.plugin_chain() {
            if plugin.namespace() != token.namespace {
                continue;
            }
            match plugin.process_token(self, connector, token).await {
                Ok(PluginVerdict::Continue) => {}
                Ok(PluginVerdict::Abort) => break,
                Err(e) => {
                    // A failing plugin never takes the chain down with it.
                    error!(
                        "💥 Plugin '{}' failed on '{}:{}': {e}",
                        plugin.id(),
                        token.namespace,
                        token.token_type
                    );
                }
            }
        }
    }

    /// Sends a token to one connector through the outbound filter stage.
    ///
    /// Returns `Ok(false)` when a filter rejected the token and nothing was
    /// sent.
    pub async fn send_token(
        &self,
        source: Option<&Arc<dyn Connector>>,
        target: &Arc<dyn Connector>,
        token: &Token,
    ) -> Result<bool, ServerError> {
        for filter in self.filter_chain() {
            if filter.process_token_out(self, source, target, token).await
                == FilterVerdict::Reject
            {
                debug!(
                    "🛑 Filter '{}' rejected outbound '{}:{}' to {}",
                    filter.id(),
                    token.namespace,
                    token.token_type,
                    target.id()
                );
                return Ok(false);
            }
        }
        let codec = self
            .codec_for(target.format())
            .ok_or_else(|| ServerError::Internal(format!("no codec for {}", target.format())))?;
        let bytes = codec.encode(token)?;
        target.send(Packet::new(FrameType::Text, bytes))?;
        Ok(true)
    }

    /// Broadcasts a token to every up connector.
    pub async fn broadcast_token(
        &self,
        source: Option<&Arc<dyn Connector>>,
        token: &Token,
        options: BroadcastOptions,
    ) -> usize {
        self.broadcast_inner(source, token, options, |_| true).await
    }

    /// Broadcasts to the connectors a predicate selects.
    pub async fn broadcast_filtered<F>(
        &self,
        source: Option<&Arc<dyn Connector>>,
        token: &Token,
        options: BroadcastOptions,
        predicate: F,
    ) -> usize
    where
        F: Fn(&Arc<dyn Connector>) -> bool,
    {
        self.broadcast_inner(source, token, options, predicate).await
    }

    /// Broadcasts to the connectors whose `group` variable matches.
    pub async fn broadcast_to_group(
        &self,
        source: Option<&Arc<dyn Connector>>,
        group: &str,
        token: &Token,
        options: BroadcastOptions,
    ) -> usize {
        self.broadcast_inner(source, token, options, |connector| {
            connector
                .vars()
                .get(GROUP_VAR)
                .map(|value| value.as_str() == Some(group))
                .unwrap_or(false)
        })
        .await
    }

    /// Selects the connector subset, then encodes the token once per
    /// distinct wire format present in that subset and reuses the bytes
    /// across all connectors sharing the format.
    async fn broadcast_inner<F>(
        &self,
        source: Option<&Arc<dyn Connector>>,
        token: &Token,
        options: BroadcastOptions,
        predicate: F,
    ) -> usize
    where
        F: Fn(&Arc<dyn Connector>) -> bool,
    {
        let source_id = source.map(|connector| connector.id());
        let filters = self.filter_chain();
        let mut encoded: HashMap<String, Vec<u8>> = HashMap::new();
        let mut delivered = 0;

        'targets: for connector in self.registry.up_connectors() {
            if !options.sender_included && Some(connector.id()) == source_id {
                continue;
            }
            if !predicate(&connector) {
                continue;
            }
            for filter in &filters {
                if filter
                    .process_token_out(self, source, &connector, token)
                    .await
                    == FilterVerdict::Reject
                {
                    continue 'targets;
                }
            }

            let format = connector.format().to_string();
            let bytes = match encoded.get(&format) {
                Some(bytes) => bytes.clone(),
                None => {
                    let Some(codec) = self.codec_for(&format) else {
                        warn!("⚠️ No codec for format '{format}', skipping {}", connector.id());
                        continue;
                    };
                    match codec.encode(token) {
                        Ok(bytes) => {
                            encoded.insert(format, bytes.clone());
                            bytes
                        }
                        Err(e) => {
                            warn!("⚠️ Broadcast encode failed for format '{format}': {e}");
                            continue;
                        }
                    }
                }
            };
            if connector.send(Packet::new(FrameType::Text, bytes)).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Shuts the routing layer down: plugins reach their terminal state
    /// (outstanding reverse calls fail with a shutdown reason) and the
    /// dispatch pool drains.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for plugin in self.plugin_chain() {
            plugin.engine_stopped(self).await;
        }
        self.pool.shutdown().await;
        info!("✅ Token server stopped");
    }
}

#[async_trait]
impl EngineHooks for TokenServer {
    async fn engine_started(&self) {
        for plugin in self.plugin_chain() {
            plugin.engine_started(self).await;
        }
    }

    async fn engine_stopped(&self) {
        self.shutdown().await;
    }

    async fn connector_started(&self, connector: Arc<dyn Connector>) {
        if let Some(sessions) = &self.sessions {
            if let Err(e) = sessions.get_session(connector.session_id()).await {
                warn!(
                    "⚠️ Session recovery for connector {} failed: {e}",
                    connector.id()
                );
            }
        }
        for plugin in self.plugin_chain() {
            plugin.connector_started(self, &connector).await;
        }
    }

    async fn connector_stopped(&self, connector: Arc<dyn Connector>, reason: CloseReason) {
        self.fragments.clear_connector(connector.id());
        for plugin in self.plugin_chain() {
            plugin.connector_stopped(self, &connector, reason).await;
        }
        if let Some(sessions) = &self.sessions {
            sessions.put_in_reconnection_mode(connector.session_id()).await;
        }
    }

    async fn packet_received(&self, connector: Arc<dyn Connector>, packet: Packet) {
        let Some(codec) = self.codec_for(connector.format()) else {
            warn!("⚠️ No codec for connector {} format '{}'", connector.id(), connector.format());
            return;
        };
        let mut token = match codec.decode(&packet.payload) {
            Ok(token) => token,
            Err(e) => {
                // Undecodable traffic is logged and dropped, never routed.
                warn!("⚠️ Dropping undecodable packet from {}: {e}", connector.id());
                return;
            }
        };
        token.namespace = normalize_namespace(&token.namespace);

        if FragmentStore::is_fragment(&token) {
            if let Some(payload) = self.fragments.offer(connector.id(), &token) {
                match codec.decode(&payload) {
                    Ok(mut whole) => {
                        whole.namespace = normalize_namespace(&whole.namespace);
                        self.route_token(connector, whole).await;
                    }
                    Err(e) => {
                        warn!(
                            "⚠️ Reassembled transfer from {} is undecodable: {e}",
                            connector.id()
                        );
                    }
                }
            }
            return;
        }

        self.route_token(connector, token).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockConnector;
    use std::sync::atomic::AtomicUsize;
    use tokamak_protocol::ProtocolError;

    fn server() -> Arc<TokenServer> {
        TokenServer::new(
            Arc::new(ConnectorRegistry::new()),
            &DispatchSettings::default(),
            None,
        )
    }

    fn registered(server: &Arc<TokenServer>, format: &str) -> Arc<MockConnector> {
        let connector = Arc::new(MockConnector::up(format));
        server
            .registry()
            .register(connector.clone() as Arc<dyn Connector>);
        connector
    }

    struct CountingCodec {
        inner: JsonTokenCodec,
        format: String,
        encodes: AtomicUsize,
    }

    impl CountingCodec {
        fn new(format: &str) -> Self {
            Self {
                inner: JsonTokenCodec::new(),
                format: format.to_string(),
                encodes: AtomicUsize::new(0),
            }
        }
    }

    impl TokenCodec for CountingCodec {
        fn format(&self) -> &str {
            &self.format
        }
        fn encode(&self, token: &Token) -> Result<Vec<u8>, ProtocolError> {
            self.encodes.fetch_add(1, Ordering::SeqCst);
            self.inner.encode(token)
        }
        fn decode(&self, data: &[u8]) -> Result<Token, ProtocolError> {
            self.inner.decode(data)
        }
    }

    struct RecordingPlugin {
        namespace: String,
        seen: std::sync::Mutex<Vec<String>>,
        verdict: PluginVerdict,
    }

    impl RecordingPlugin {
        fn new(namespace: &str, verdict: PluginVerdict) -> Self {
            Self {
                namespace: namespace.to_string(),
                seen: std::sync::Mutex::new(Vec::new()),
                verdict,
            }
        }
    }

    #[async_trait]
    impl TokenPlugin for RecordingPlugin {
        fn id(&self) -> &str {
            "recording"
        }
        fn namespace(&self) -> &str {
            &self.namespace
        }
        async fn process_token(
            &self,
            _server: &TokenServer,
            _connector: &Arc<dyn Connector>,
            token: &Token,
        ) -> Result<PluginVerdict, ServerError> {
            self.seen.lock().unwrap().push(token.token_type.clone());
            Ok(self.verdict)
        }
    }

    struct RejectingFilter;

    #[async_trait]
    impl TokenFilter for RejectingFilter {
        fn id(&self) -> &str {
            "reject-all"
        }
        async fn process_token_in(
            &self,
            _server: &TokenServer,
            _connector: &Arc<dyn Connector>,
            _token: &Token,
        ) -> FilterVerdict {
            FilterVerdict::Reject
        }
    }

    #[test]
    fn test_namespace_normalization() {
        assert_eq!(normalize_namespace("org.tokamak"), "tokamak");
        assert_eq!(normalize_namespace("org.tokamak.system"), "tokamak.system");
        assert_eq!(normalize_namespace("tokamak.system"), "tokamak.system");
        assert_eq!(normalize_namespace("org.tokamakish"), "org.tokamakish");
        assert_eq!(normalize_namespace("custom.ns"), "custom.ns");
    }

    #[tokio::test]
    async fn test_plugin_chain_matches_namespace() {
        let server = server();
        let connector = registered(&server, "json");
        let matching = Arc::new(RecordingPlugin::new("tokamak.chat", PluginVerdict::Continue));
        let other = Arc::new(RecordingPlugin::new("tokamak.game", PluginVerdict::Continue));
        server.add_plugin(matching.clone());
        server.add_plugin(other.clone());

        server
            .route_token(
                connector as Arc<dyn Connector>,
                Token::new("tokamak.chat", "say"),
            )
            .await;

        assert_eq!(*matching.seen.lock().unwrap(), ["say"]);
        assert!(other.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abort_stops_later_plugins() {
        let server = server();
        let connector = registered(&server, "json");
        let first = Arc::new(RecordingPlugin::new("tokamak.chat", PluginVerdict::Abort));
        let second = Arc::new(RecordingPlugin::new("tokamak.chat", PluginVerdict::Continue));
        server.add_plugin(first.clone());
        server.add_plugin(second.clone());

        server
            .route_token(
                connector as Arc<dyn Connector>,
                Token::new("tokamak.chat", "say"),
            )
            .await;

        assert_eq!(first.seen.lock().unwrap().len(), 1);
        assert!(second.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejecting_filter_short_circuits() {
        let server = server();
        let connector = registered(&server, "json");
        let plugin = Arc::new(RecordingPlugin::new("tokamak.chat", PluginVerdict::Continue));
        server.add_filter(Arc::new(RejectingFilter));
        server.add_plugin(plugin.clone());

        server
            .route_token(
                connector as Arc<dyn Connector>,
                Token::new("tokamak.chat", "say"),
            )
            .await;

        assert!(plugin.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_encodes_once_per_format() {
        let server = server();
        let codec = Arc::new(CountingCodec::new("json"));
        server.register_codec(codec.clone());
        for _ in 0..5 {
            registered(&server, "json");
        }

        let delivered = server
            .broadcast_token(
                None,
                &Token::new("tokamak.chat", "say"),
                BroadcastOptions {
                    sender_included: true,
                },
            )
            .await;

        assert_eq!(delivered, 5);
        assert_eq!(codec.encodes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_encodes_per_distinct_format() {
        let server = server();
        let json = Arc::new(CountingCodec::new("json"));
        let csv = Arc::new(CountingCodec::new("csv"));
        server.register_codec(json.clone());
        server.register_codec(csv.clone());
        registered(&server, "json");
        registered(&server, "json");
        registered(&server, "csv");

        let delivered = server
            .broadcast_token(
                None,
                &Token::new("tokamak.chat", "say"),
                BroadcastOptions {
                    sender_included: true,
                },
            )
            .await;

        assert_eq!(delivered, 3);
        assert_eq!(json.encodes.load(Ordering::SeqCst), 1);
        assert_eq!(csv.encodes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender_by_default() {
        let server = server();
        let sender = registered(&server, "json");
        let receiver = registered(&server, "json");

        let delivered = server
            .broadcast_token(
                Some(&(sender.clone() as Arc<dyn Connector>)),
                &Token::new("tokamak.chat", "say"),
                BroadcastOptions::default(),
            )
            .await;

        assert_eq!(delivered, 1);
        assert!(sender.sent_packets().is_empty());
        assert_eq!(receiver.sent_packets().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_to_group_selects_by_var() {
        let server = server();
        let in_group = registered(&server, "json");
        let out_group = registered(&server, "json");
        in_group
            .vars()
            .insert(GROUP_VAR.to_string(), serde_json::json!("lobby"));

        let delivered = server
            .broadcast_to_group(
                None,
                "lobby",
                &Token::new("tokamak.chat", "say"),
                BroadcastOptions {
                    sender_included: true,
                },
            )
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(in_group.sent_packets().len(), 1);
        assert!(out_group.sent_packets().is_empty());
    }

    #[tokio::test]
    async fn test_send_token_outbound_filter_reject() {
        struct OutboundReject;
        #[async_trait]
        impl TokenFilter for OutboundReject {
            fn id(&self) -> &str {
                "outbound-reject"
            }
            async fn process_token_out(
                &self,
                _server: &TokenServer,
                _source: Option<&Arc<dyn Connector>>,
                _target: &Arc<dyn Connector>,
                _token: &Token,
            ) -> FilterVerdict {
                FilterVerdict::Reject
            }
        }

        let server = server();
        let target = registered(&server, "json");
        server.add_filter(Arc::new(OutboundReject));

        let sent = server
            .send_token(
                None,
                &(target.clone() as Arc<dyn Connector>),
                &Token::new("tokamak.chat", "say"),
            )
            .await
            .unwrap();
        assert!(!sent);
        assert!(target.sent_packets().is_empty());
    }

    #[tokio::test]
    async fn test_fragmented_token_routes_once_complete() {
        let server = server();
        let connector = registered(&server, "json");
        let plugin = Arc::new(RecordingPlugin::new("tokamak.chat", PluginVerdict::Continue));
        server.add_plugin(plugin.clone());

        let whole = {
            let mut token = Token::new("tokamak.chat", "say");
            token.set_string("text", "hello fragmented world");
            String::from_utf8(JsonTokenCodec::new().encode(&token).unwrap()).unwrap()
        };
        let (first_half, second_half) = whole.split_at(whole.len() / 2);
        let codec = JsonTokenCodec::new();

        for (index, part) in [first_half, second_half].iter().enumerate() {
            let mut fragment = Token::new("tokamak.system", fragment::TT_FRAGMENT);
            fragment.set_string("tid", "tx-1");
            fragment.set_i64("total", 2);
            fragment.set_i64("index", index as i64);
            fragment.set_string("data", *part);
            let payload = codec.encode(&fragment).unwrap();
            server
                .packet_received(
                    connector.clone() as Arc<dyn Connector>,
                    Packet::new(FrameType::Text, payload),
                )
                .await;
        }

        assert_eq!(*plugin.seen.lock().unwrap(), ["say"]);
    }

    #[tokio::test]
    async fn test_undecodable_packet_dropped() {
        let server = server();
        let connector = registered(&server, "json");
        let plugin = Arc::new(RecordingPlugin::new("tokamak.chat", PluginVerdict::Continue));
        server.add_plugin(plugin.clone());

        server
            .packet_received(
                connector as Arc<dyn Connector>,
                Packet::new(FrameType::Text, b"not json at all".to_vec()),
            )
            .await;

        assert!(plugin.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_thread_token_routes_on_pool() {
        let server = server();
        let connector = registered(&server, "json");
        let plugin = Arc::new(RecordingPlugin::new("tokamak.slow", PluginVerdict::Continue));
        server.add_plugin(plugin.clone());

        let mut token = Token::new("tokamak.slow", "work");
        token.set_bool("spawnThread", true);
        server
            .route_token(connector as Arc<dyn Connector>, token)
            .await;

        // The pooled handler runs asynchronously; drain the pool to join it.
        server.pool.shutdown().await;
        assert_eq!(*plugin.seen.lock().unwrap(), ["work"]);
    }

    #[tokio::test]
    async fn test_failing_plugin_does_not_break_chain() {
        struct FailingPlugin;
        #[async_trait]
        impl TokenPlugin for FailingPlugin {
            fn id(&self) -> &str {
                "failing"
            }
            fn namespace(&self) -> &str {
                "tokamak.chat"
            }
            async fn process_token(
                &self,
                _server: &TokenServer,
                _connector: &Arc<dyn Connector>,
                _token: &Token,
            ) -> Result<PluginVerdict, ServerError> {
                Err(ServerError::Internal("boom".into()))
            }
        }

        let server = server();
        let connector = registered(&server, "json");
        let after = Arc::new(RecordingPlugin::new("tokamak.chat", PluginVerdict::Continue));
        server.add_plugin(Arc::new(FailingPlugin));
        server.add_plugin(after.clone());

        server
            .route_token(
                connector as Arc<dyn Connector>,
                Token::new("tokamak.chat", "say"),
            )
            .await;

        // The failure was contained; the next plugin still ran.
        assert_eq!(after.seen.lock().unwrap().len(), 1);
    }
}
