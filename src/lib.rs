pub mod capture;
pub mod config;
pub mod fingerprint;
pub mod flow;
pub mod ingest;
pub mod logging;
pub mod retry;
pub mod store;
pub mod tail;
