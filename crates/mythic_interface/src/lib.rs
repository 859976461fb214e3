//! Trait definitions for the collaborators of the Mythic batch pipeline.
//!
//! The pipeline talks to three external systems, each behind a narrow trait:
//! the asynchronous batch provider, the reference image store, and the
//! per-entity metadata store.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod traits;
mod types;

pub use traits::{BatchClient, EntityStore, ReferenceStore};
pub use types::{EntityDocument, JobHandle, JobStatus, RemoteReference, SubmitRequest};
