//! The message router: maps an envelope's type to a registered handler,
//! through the ordered middleware chain.
//!
//! Routing failures never escape [`MessageRouter::route`]: handler
//! errors are converted to a `system.error` envelope sent back to the
//! originating connection, so a misbehaving handler cannot take down
//! the receive loop of an otherwise healthy connection. An unknown type
//! is not an error at all — it is logged and ignored for forward
//! compatibility with protocol extensions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::{debug, warn};

use parley_core::envelope::Envelope;
use parley_core::errors::ProtocolError;

use crate::routing::handlers::DomainSink;
use crate::routing::middleware::{Middleware, Next};
use crate::ws::connection::Connection;
use crate::ws::registry::ConnectionRegistry;

/// Seams the handlers reach collaborators through: the registry for
/// unicast/broadcast effects and the domain sink for business logic.
pub struct RouterContext {
    /// The registry owning every live connection.
    pub registry: Arc<ConnectionRegistry>,
    /// Asynchronous hand-off into domain processing.
    pub domain: Arc<dyn DomainSink>,
}

/// Trait implemented by every message handler.
///
/// Handlers are stateless with respect to connection data: anything a
/// handler needs lives on the [`Connection`] or behind the registry, so
/// a single instance safely serves all connections concurrently.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a typed payload for a connection.
    async fn handle(
        &self,
        conn: &Arc<Connection>,
        envelope: Envelope,
        ctx: &RouterContext,
    ) -> Result<(), ProtocolError>;
}

/// Registry mapping envelope kinds to handlers, with an ordered
/// middleware chain executed outermost-registered-first.
pub struct MessageRouter {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    chain: Vec<Arc<dyn Middleware>>,
}

impl MessageRouter {
    /// Maximum time a single handler is allowed to run.
    pub(crate) const HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            chain: Vec::new(),
        }
    }

    /// Register a handler for an envelope kind. Last registration wins;
    /// a replacement is logged. This is a configuration-time operation.
    pub fn register(&mut self, kind: &str, handler: impl MessageHandler + 'static) {
        if self
            .handlers
            .insert(kind.to_owned(), Arc::new(handler))
            .is_some()
        {
            warn!(kind, "replacing existing handler registration");
        }
    }

    /// Append a middleware to the chain.
    pub fn layer(&mut self, middleware: impl Middleware + 'static) {
        self.chain.push(Arc::new(middleware));
    }

    /// Registered kinds (sorted).
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a kind has a handler.
    #[must_use]
    pub fn has_handler(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Route one envelope through the middleware chain to its handler.
    pub async fn route(&self, conn: &Arc<Connection>, envelope: Envelope, ctx: &RouterContext) {
        let kind = envelope.kind().to_owned();
        counter!("messages_routed_total", "kind" => kind.clone()).increment(1);

        let Some(handler) = self.handlers.get(&kind) else {
            debug!(kind, conn_id = %conn.id, "no handler registered, ignoring");
            return;
        };

        let start = Instant::now();
        let next = Next::start(&self.chain, handler.as_ref(), ctx);
        if let Err(err) = next.run(conn, envelope).await {
            counter!("route_errors_total", "kind" => kind.clone(), "code" => err.code().to_owned())
                .increment(1);
            warn!(kind, conn_id = %conn.id, code = err.code(), "handler failed: {err}");
            if let Err(send_err) = conn.send(err.to_envelope()) {
                debug!(conn_id = %conn.id, %send_err, "could not deliver error envelope");
            }
        }
        histogram!("route_duration_seconds", "kind" => kind).record(start.elapsed().as_secs_f64());
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}
