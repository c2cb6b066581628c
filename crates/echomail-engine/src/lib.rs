//! # EchoMail Engine
//!
//! The sequence dispatch engine. One pass, triggered externally:
//!
//! ```text
//! run_pass(now)
//!   ├── due sequences: status = pending AND scheduled_at <= now
//!   ├── per sequence: atomic claim (pending → sending, CAS on status)
//!   │     ├── lost claim → silent skip (another worker owns it)
//!   │     ├── recipients → BatchDispatcher
//!   │     │     ├── batches of N, concurrent within, throttled between
//!   │     │     └── one delivery record per accepted send (pixel id pre-generated)
//!   │     └── finish: once → completed; recurring → pending @ next occurrence
//!   └── per-sequence failures never abort the pass
//! ```
//!
//! Correctness under overlapping passes (including other processes) rests
//! entirely on the conditional claim — there is no other locking.

pub mod dispatch;
pub mod recurrence;
pub mod runner;

pub use dispatch::{BatchDispatcher, DispatchOutcome};
pub use recurrence::next_occurrence;
pub use runner::{RunSummary, SequenceRunner};

#[cfg(test)]
mod test_support;
