//! # EchoMail Core
//!
//! Shared foundation for the EchoMail workspace: the sequence/delivery data
//! model, the TOML configuration system, and the common error type.

pub mod config;
pub mod error;
pub mod types;

pub use config::EchomailConfig;
pub use error::{EchomailError, Result};
pub use types::{DeliveryRecord, Recipient, Recurrence, Sequence, SequenceStatus};
