//! webmforge-common: shared types, IDs, errors and media detection.
//!
//! This crate is the foundational dependency for the other webmforge crates:
//!
//! - **Typed IDs**: [`JobId`], [`ArtifactId`] and the caller key [`CallerId`]
//! - **Errors**: the conversion error taxonomy ([`Error`], [`ErrorKind`])
//! - **Core types**: artifact roles, subscription plans, job states
//! - **Media detection**: WebM media type, extension and magic-byte checks
//!
//! # Examples
//!
//! ```
//! use webmforge_common::{media, ErrorKind, JobId, Plan};
//!
//! let job_id = JobId::new();
//! assert!(!job_id.to_string().is_empty());
//!
//! assert!(media::is_webm_name("clip.WEBM"));
//! assert_eq!(Plan::default(), Plan::Free);
//! assert_eq!(ErrorKind::Busy.as_str(), "Busy");
//! ```

pub mod error;
pub mod ids;
pub mod media;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use ids::*;
pub use types::*;
