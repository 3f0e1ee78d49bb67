//! Errors, lifecycle signals and system-check messages.
//!
//! # Examples
//!
//! ```rust
//! use polymorph::core::signals::pre_delete;
//! use polymorph::db::orm::Instance;
//!
//! pre_delete::<Instance>().connect("log_deletes", |label, instance| {
//!     println!("deleting {} {:?}", label, instance.pk());
//! });
//! ```

pub use polymorph_core::*;
