//! HTTP API: webhook, job listing, metrics.

mod handlers;
mod middleware;
mod routes;

pub use routes::create_router;
