//! Read model storage for projections.
//!
//! Read models are disposable: a projection may clear and rebuild its store from the
//! event log at any time.

pub mod document_store;

pub use document_store::{DocumentStore, InMemoryDocumentStore};
