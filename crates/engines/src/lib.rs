//! `engines` crate: the `Engine` call interface and its test double.
//!
//! Every AI/data capability, model-backed or provider-backed, must
//! implement [`Engine`]. The orchestrator crate dispatches execution through
//! this trait object.

pub mod error;
pub mod traits;
pub mod mock;

pub use error::{EngineError, ErrorKind};
pub use traits::Engine;
