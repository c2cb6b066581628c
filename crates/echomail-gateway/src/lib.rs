//! HTTP gateway: cron-style dispatch trigger, open-tracking pixel, test mail.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
