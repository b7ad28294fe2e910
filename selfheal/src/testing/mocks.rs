//! Connector and state store doubles.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;

use crate::core::{keys, Dataset, ExtractionParams};
use crate::errors::{ConnectorError, StateStoreError};
use crate::extraction::{
    Connector, FieldSchema, InMemoryStateStore, SourceSchema, SourceType, StateStore,
};

/// A connector that pages through a fixed dataset using `offset` and
/// `batch_size`, the way a SQL `LIMIT/OFFSET` source would.
///
/// Calls without paging parameters return every row.
#[derive(Debug)]
pub struct PagedConnector {
    source_id: String,
    source_type: SourceType,
    data: Dataset,
    latency: Option<Duration>,
    estimate: Option<u64>,
    transient_failures: Mutex<VecDeque<ConnectorError>>,
    fail_from_offset: Option<(u64, ConnectorError)>,
    connect_failures: Mutex<VecDeque<ConnectorError>>,
    calls: Mutex<Vec<ExtractionParams>>,
    connects: Mutex<usize>,
    disconnects: Mutex<usize>,
}

impl PagedConnector {
    /// Creates a connector serving `data`.
    #[must_use]
    pub fn new(source_id: impl Into<String>, data: Dataset) -> Self {
        Self {
            source_id: source_id.into(),
            source_type: SourceType::Unknown,
            data,
            latency: None,
            estimate: None,
            transient_failures: Mutex::new(VecDeque::new()),
            fail_from_offset: None,
            connect_failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            connects: Mutex::new(0),
            disconnects: Mutex::new(0),
        }
    }

    /// Sets the reported source type.
    #[must_use]
    pub fn with_source_type(mut self, source_type: SourceType) -> Self {
        self.source_type = source_type;
        self
    }

    /// Sleeps this long inside every extract call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Reports a record count estimate.
    #[must_use]
    pub fn with_estimate(mut self, estimate: u64) -> Self {
        self.estimate = Some(estimate);
        self
    }

    /// Fails the next extract calls with these errors, in order.
    #[must_use]
    pub fn with_transient_failures(self, errors: impl IntoIterator<Item = ConnectorError>) -> Self {
        self.transient_failures.lock().extend(errors);
        self
    }

    /// Fails every extract call at or past `offset`.
    #[must_use]
    pub fn failing_from_offset(mut self, offset: u64, error: ConnectorError) -> Self {
        self.fail_from_offset = Some((offset, error));
        self
    }

    /// Fails the next connect calls with these errors, in order.
    #[must_use]
    pub fn with_connect_failures(self, errors: impl IntoIterator<Item = ConnectorError>) -> Self {
        self.connect_failures.lock().extend(errors);
        self
    }

    /// Returns the number of extract calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the parameters of every extract call.
    #[must_use]
    pub fn recorded_params(&self) -> Vec<ExtractionParams> {
        self.calls.lock().clone()
    }

    /// Returns `(connects, disconnects)`.
    #[must_use]
    pub fn session_counts(&self) -> (usize, usize) {
        (*self.connects.lock(), *self.disconnects.lock())
    }
}

#[async_trait]
impl Connector for PagedConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn source_type(&self) -> SourceType {
        self.source_type
    }

    async fn connect(&self) -> Result<bool, ConnectorError> {
        *self.connects.lock() += 1;
        match self.connect_failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(true),
        }
    }

    async fn disconnect(&self) -> Result<bool, ConnectorError> {
        *self.disconnects.lock() += 1;
        Ok(true)
    }

    async fn extract(&self, params: &ExtractionParams) -> Result<Dataset, ConnectorError> {
        self.calls.lock().push(params.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = self.transient_failures.lock().pop_front() {
            return Err(err);
        }

        let offset = params
            .get_u64(keys::OFFSET)
            .map_err(|e| ConnectorError::InvalidParams(e.to_string()))?;
        let limit = params
            .get_u64(keys::BATCH_SIZE)
            .map_err(|e| ConnectorError::InvalidParams(e.to_string()))?;

        if let (Some((from, err)), Some(offset)) = (&self.fail_from_offset, offset) {
            if offset >= *from {
                return Err(err.clone());
            }
        }

        let start = usize::try_from(offset.unwrap_or(0)).unwrap_or(usize::MAX);
        let take = limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        let rows = self
            .data
            .rows()
            .iter()
            .skip(start)
            .take(take)
            .cloned()
            .collect();
        Ok(Dataset::from_parts(self.data.columns().to_vec(), rows))
    }

    async fn get_source_schema(&self, object_name: &str) -> Result<SourceSchema, ConnectorError> {
        Ok(SourceSchema {
            object_name: object_name.to_string(),
            fields: self
                .data
                .columns()
                .iter()
                .map(|c| FieldSchema::new(c.clone(), "json"))
                .collect(),
        })
    }

    async fn estimate_record_count(
        &self,
        _params: &ExtractionParams,
    ) -> Result<Option<u64>, ConnectorError> {
        Ok(self.estimate)
    }
}

/// A connector that replays queued responses in order.
///
/// Once the queue is empty every call returns an empty dataset.
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    source_id: String,
    responses: Mutex<VecDeque<Result<Dataset, ConnectorError>>>,
    calls: Mutex<Vec<ExtractionParams>>,
}

impl ScriptedConnector {
    /// Creates a connector with an empty script.
    #[must_use]
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Self::default()
        }
    }

    /// Queues a successful response.
    #[must_use]
    pub fn then_return(self, dataset: Dataset) -> Self {
        self.responses.lock().push_back(Ok(dataset));
        self
    }

    /// Queues a failure.
    #[must_use]
    pub fn then_fail(self, error: ConnectorError) -> Self {
        self.responses.lock().push_back(Err(error));
        self
    }

    /// Queues a successful response on a shared connector.
    pub fn push_response(&self, dataset: Dataset) {
        self.responses.lock().push_back(Ok(dataset));
    }

    /// Returns the number of extract calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the parameters of the most recent extract call.
    #[must_use]
    pub fn last_params(&self) -> Option<ExtractionParams> {
        self.calls.lock().last().cloned()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn connect(&self) -> Result<bool, ConnectorError> {
        Ok(true)
    }

    async fn disconnect(&self) -> Result<bool, ConnectorError> {
        Ok(true)
    }

    async fn extract(&self, params: &ExtractionParams) -> Result<Dataset, ConnectorError> {
        self.calls.lock().push(params.clone());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Dataset::default()))
    }

    async fn get_source_schema(&self, object_name: &str) -> Result<SourceSchema, ConnectorError> {
        Err(ConnectorError::schema(object_name, "scripted connector has no schema"))
    }
}

/// An in-memory state store whose reads and writes can be switched off.
#[derive(Debug, Default)]
pub struct FailingStateStore {
    inner: InMemoryStateStore,
    fail_reads: Mutex<bool>,
    fail_writes: Mutex<bool>,
    reads: Mutex<usize>,
    writes: Mutex<usize>,
}

impl FailingStateStore {
    /// Creates a healthy store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes reads fail with an unavailable error.
    pub fn set_fail_reads(&self, fail: bool) {
        *self.fail_reads.lock() = fail;
    }

    /// Makes writes fail with a rejected error.
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    /// Returns `(reads, writes)` attempted so far.
    #[must_use]
    pub fn call_counts(&self) -> (usize, usize) {
        (*self.reads.lock(), *self.writes.lock())
    }

    /// Returns the wrapped store.
    #[must_use]
    pub fn inner(&self) -> &InMemoryStateStore {
        &self.inner
    }
}

#[async_trait]
impl StateStore for FailingStateStore {
    async fn get(&self, collection: &str, doc_id: &str) -> Result<Option<Value>, StateStoreError> {
        *self.reads.lock() += 1;
        if *self.fail_reads.lock() {
            return Err(StateStoreError::unavailable("reads disabled"));
        }
        self.inner.get(collection, doc_id).await
    }

    async fn set(&self, collection: &str, doc_id: &str, document: Value) -> Result<(), StateStoreError> {
        *self.writes.lock() += 1;
        if *self.fail_writes.lock() {
            return Err(StateStoreError::Rejected("writes disabled".into()));
        }
        self.inner.set(collection, doc_id, document).await
    }

    async fn delete(&self, collection: &str, doc_id: &str) -> Result<bool, StateStoreError> {
        if *self.fail_writes.lock() {
            return Err(StateStoreError::Rejected("writes disabled".into()));
        }
        self.inner.delete(collection, doc_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::numbered_rows;

    #[tokio::test]
    async fn test_paged_connector_pages() {
        let connector = PagedConnector::new("src", numbered_rows(5));
        let page = connector
            .extract(&ExtractionParams::new().with("offset", 3).with("batch_size", 10))
            .await
            .unwrap();
        assert_eq!(page.len(), 2);

        let all = connector.extract(&ExtractionParams::new()).await.unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(connector.call_count(), 2);
    }

    #[tokio::test]
    async fn test_scripted_connector_replays_then_empties() {
        let connector = ScriptedConnector::new("src")
            .then_fail(ConnectorError::timeout("slow"))
            .then_return(numbered_rows(1));

        assert!(connector.extract(&ExtractionParams::new()).await.is_err());
        assert_eq!(connector.extract(&ExtractionParams::new()).await.unwrap().len(), 1);
        assert!(connector.extract(&ExtractionParams::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_store_toggles() {
        let store = FailingStateStore::new();
        store.set_fail_writes(true);
        assert!(store.set("c", "d", Value::Null).await.is_err());
        store.set_fail_writes(false);
        assert!(store.set("c", "d", Value::Bool(true)).await.is_ok());
        assert_eq!(store.call_counts(), (0, 2));
    }
}
