//! The ordered middleware chain.
//!
//! The chain is an explicit list walked with an index-based [`Next`]
//! continuation rather than nested closures: each middleware receives
//! the continuation for the rest of the chain and decides whether to
//! call it. A middleware that does not call `next` short-circuits —
//! the handler never runs and the router generates no implicit error
//! response; signalling the rejection (via `Connection::send`) is the
//! middleware's own responsibility.

use std::sync::Arc;

use async_trait::async_trait;

use parley_core::envelope::Envelope;
use parley_core::errors::{self, ProtocolError};

use crate::routing::router::{MessageHandler, MessageRouter, RouterContext};
use crate::ws::connection::Connection;

/// A composable pre/post-processing step wrapped around dispatch.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Process the envelope, optionally passing it on via `next`.
    async fn handle(
        &self,
        conn: &Arc<Connection>,
        envelope: Envelope,
        ctx: &RouterContext,
        next: Next<'_>,
    ) -> Result<(), ProtocolError>;
}

/// Continuation over the remaining chain, ending at the handler.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    index: usize,
    handler: &'a dyn MessageHandler,
    ctx: &'a RouterContext,
}

impl<'a> Next<'a> {
    /// Continuation positioned at the head of the chain.
    #[must_use]
    pub(crate) fn start(
        chain: &'a [Arc<dyn Middleware>],
        handler: &'a dyn MessageHandler,
        ctx: &'a RouterContext,
    ) -> Self {
        Self {
            chain,
            index: 0,
            handler,
            ctx,
        }
    }

    /// Invoke the next link: the following middleware, or — past the end
    /// of the chain — the handler itself under its execution deadline.
    pub async fn run(
        self,
        conn: &Arc<Connection>,
        envelope: Envelope,
    ) -> Result<(), ProtocolError> {
        if let Some(middleware) = self.chain.get(self.index) {
            let next = Next {
                chain: self.chain,
                index: self.index + 1,
                handler: self.handler,
                ctx: self.ctx,
            };
            middleware.handle(conn, envelope, self.ctx, next).await
        } else {
            match tokio::time::timeout(
                MessageRouter::HANDLER_TIMEOUT,
                self.handler.handle(conn, envelope, self.ctx),
            )
            .await
            {
                Ok(result) => result,
                Err(_elapsed) => Err(ProtocolError::Business {
                    code: errors::HANDLER_TIMEOUT.into(),
                    message: "handler exceeded its execution deadline".into(),
                }),
            }
        }
    }
}
