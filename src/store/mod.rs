use std::future::Future;

use chrono::NaiveDateTime;

use crate::{
    fingerprint::Fingerprint,
    flow::{FlowRecord, header_block},
};

pub mod mysql;
pub mod sqlite;

/// Name of the table holding one row per endpoint fingerprint.
pub const FLOW_TABLE: &str = "flow";

/// The persisted unit: a flow plus its fingerprint, keys and creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFlowEntry {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub request_headers: String,
    pub request_content: Vec<u8>,
    pub request_start: f64,
    pub keys: String,
    pub fingerprint: Fingerprint,
    pub response_code: u16,
    pub response_reason: String,
    pub response_headers: String,
    pub response_content: Vec<u8>,
    pub created: NaiveDateTime,
}

impl StoredFlowEntry {
    pub fn from_record(
        record: &FlowRecord,
        fingerprint: Fingerprint,
        keys: String,
        created: NaiveDateTime,
    ) -> Self {
        let request = &record.request;
        let response = &record.response;
        Self {
            method: request.method.clone(),
            scheme: request.scheme.clone(),
            host: request.host.clone(),
            port: request.port,
            path: request.path.clone(),
            request_headers: header_block(&request.headers),
            request_content: request.content.clone(),
            request_start: request.timestamp_start,
            keys,
            fingerprint,
            response_code: response.status_code,
            response_reason: response.reason.clone(),
            response_headers: header_block(&response.headers),
            response_content: response.content.clone(),
            created,
        }
    }
}

/// What the store already holds for a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingFlow {
    pub id: i64,
    pub keys: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store rejected the row's content (oversized or badly encoded field).
    Data(String),
    /// The database could not be reached or the connection broke.
    Unavailable(String),
    Internal(String),
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Data(_) => "data",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data(message) => write!(f, "flow rejected by store: {message}"),
            Self::Unavailable(message) => write!(f, "flow store unavailable: {message}"),
            Self::Internal(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for StoreError {}

/// Durable flow table keyed by fingerprint.
///
/// Every call is its own transaction and an `insert` is committed before it returns. The store
/// does not enforce one row per fingerprint; callers check with `exists` first.
pub trait FlowStore {
    fn exists(
        &mut self,
        fingerprint: &Fingerprint,
    ) -> impl Future<Output = Result<Option<ExistingFlow>, StoreError>> + Send;

    /// Inserts the entry and returns its assigned id.
    fn insert(
        &mut self,
        entry: &StoredFlowEntry,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send;

    /// Replaces the connection after a call failed with `StoreError::Unavailable`.
    fn reconnect(&mut self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Releases the underlying connection.
    fn close(self) -> impl Future<Output = Result<(), StoreError>> + Send
    where
        Self: Sized;
}
