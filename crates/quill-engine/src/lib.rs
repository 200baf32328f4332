//! # Quill Engine
//!
//! The request pipeline that turns an untrusted editing request into a
//! recorded snapshot, or into a typed rejection.
//!
//! ## Example
//!
//! ```no_run
//! use quill_engine::{EngineConfig, TransformEngine, TransformRequest};
//!
//! let engine = TransformEngine::new(EngineConfig::default())?;
//! let accepted = engine.transform(&TransformRequest::new(
//!     "把主题色改为绿色",
//!     "203.0.113.5",
//!     "Mozilla/5.0",
//! ))?;
//! let undone = engine.undo(&accepted.session_id, 1)?;
//! assert!(undone.current.is_none());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod sweeper;

pub use config::{EngineConfig, PolicyConfig, SweeperConfig};
pub use engine::{EngineStats, SweepSummary, TransformAccepted, TransformEngine, TransformRequest};
pub use error::{EngineError, PolicyStage, TransformError};
pub use sweeper::{spawn_sweeper, SweeperHandle};

pub use quill_core::{Change, DslDocument};
pub use quill_security::{LimitKey, RiskLevel};
pub use quill_session::{Snapshot, UndoOutcome};
