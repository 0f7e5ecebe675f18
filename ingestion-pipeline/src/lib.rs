#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod analysis;
pub mod chunker;
pub mod pipeline;
pub mod progress;
pub mod reconcile;
pub mod scheduler;

pub use pipeline::IngestionPipeline;
pub use progress::{ProgressEvent, ProgressHub};
pub use scheduler::{JobScheduler, SubmitRequest};
