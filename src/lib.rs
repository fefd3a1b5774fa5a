//! lotacquire - vehicle auction listing acquisition and archival.
//!
//! The engine behind the `lot` binary: execution sessions, retrying remote
//! operations, load-more pagination, listing extraction, the content archive,
//! and the orchestrator that ties them into a scrape run.

pub mod archive;
pub mod config;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod models;
pub mod orchestrator;
pub mod pagination;
pub mod retry;
pub mod session;
pub mod store;

pub use error::{ErrorClass, ScrapeError, ScrapeResult};
