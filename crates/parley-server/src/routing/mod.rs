//! Message routing: type → handler dispatch through an ordered
//! middleware chain, plus the built-in system handlers and the
//! rate-limit middleware.

pub mod handlers;
pub mod middleware;
pub mod rate_limit;
pub mod router;
