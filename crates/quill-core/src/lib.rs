//! # Quill Core
//!
//! Shared building blocks for the Quill site-transform engine.
//!
//! This crate provides:
//! - The versioned mutation language (`DslDocument` / `Change`)
//! - One-way identity hashing and id generation
//! - An injectable wall clock (`SystemClock`, `ManualClock`)
//! - The core error type
//!
//! ## Pipeline
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      QUILL TRANSFORM                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Rate Limiter → Text Policy → Intent Parser → Schema        │
//! │       ↓              ↓             ↓             ↓          │
//! │  Ban Store      Risk Level     DslDocument   Field Errors   │
//! │                                      ↓                      │
//! │                  DSL Policy → Session History → Executor    │
//! │                                      ↓                      │
//! │                               Audit Log (redacted)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything is memory-resident. Nothing in the workspace writes durable
//! state.

pub mod clock;
pub mod dsl;
pub mod error;
pub mod types;

pub use clock::{duration_ms, Clock, ManualClock, SharedClock, SystemClock};
pub use dsl::{Change, DslDocument, OpKind, DSL_VERSION, MAX_CHANGES};
pub use error::{CoreError, Result};
pub use types::{identity_hash, new_id};
