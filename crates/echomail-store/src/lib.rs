//! # EchoMail Store
//!
//! SQLite persistence for email sequences, their recipient lists, and the
//! per-send delivery records used for open tracking.
//!
//! The store is the sole owner of its rows; the engine only holds transient
//! in-memory copies for the duration of one pass. Every status transition
//! away from `pending` is a single conditional UPDATE whose affected-row
//! count is the claim signal — there is no other locking.

mod store;

pub use store::MailStore;
