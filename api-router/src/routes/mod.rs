pub mod admin;
pub mod ingest;
pub mod jobs;
pub mod liveness;
pub mod ontologies;
pub mod query;
pub mod readiness;
pub mod vocabulary;
