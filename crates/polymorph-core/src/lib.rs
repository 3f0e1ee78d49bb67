//! # polymorph-core
//!
//! Shared building blocks for the polymorph crates:
//!
//! - [`exception`]: the error taxonomy (`Error`, `FieldError`, `Result`)
//! - [`signals`]: process-wide model lifecycle signals
//! - [`checks`]: startup system-check messages

pub mod checks;
pub mod exception;
pub mod signals;

pub use checks::{CheckLevel, CheckMessage};
pub use exception::{DeletionBlocked, Error, FieldError, ObjectRef, Result};
