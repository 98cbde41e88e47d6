//! Buffered multi-key transactions.

use crate::client::KvClient;
use crate::error::ClientError;
use std::time::Duration;
use tessera_protocol::{Key, ProtocolError, Value, MAX_PAIRS};
use tokio::time::Instant;

/// Deadline applied to a transaction's commit or confirm.
pub const TXN_TIMEOUT: Duration = Duration::from_secs(1);

/// Writes collected for a single commit or confirm.
///
/// Each value carries the sequence number its key is expected to be at,
/// usually the one returned by a previous [`KvClient::get`].
pub struct Txn<'a> {
    client: &'a KvClient,
    keys: Vec<Key>,
    values: Vec<Value>,
}

impl<'a> Txn<'a> {
    pub fn new(client: &'a KvClient) -> Self {
        Self {
            client,
            keys: Vec::with_capacity(MAX_PAIRS),
            values: Vec::with_capacity(MAX_PAIRS),
        }
    }

    /// Adds a pair. Fails once the transaction holds `MAX_PAIRS` pairs.
    pub fn put(&mut self, key: Key, value: Value) -> Result<(), ClientError> {
        if self.keys.len() >= MAX_PAIRS {
            return Err(ProtocolError::InvalidArgument("transaction full").into());
        }
        self.keys.push(key);
        self.values.push(value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Checks that no key has moved past its expected sequence number.
    pub async fn confirm(&self) -> Result<(), ClientError> {
        if self.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + TXN_TIMEOUT;
        self.client.confirm(deadline, &self.keys, &self.values).await
    }

    /// Commits every pair atomically and returns the values with their new
    /// sequence numbers.
    pub async fn commit(&self) -> Result<Vec<Value>, ClientError> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + TXN_TIMEOUT;
        tracing::debug!(pairs = self.len(), "committing transaction");
        self.client.commit(deadline, &self.keys, &self.values).await
    }
}
