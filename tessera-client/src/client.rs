//! High-level client API.

use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::error::{ClientError, ConfigError};
use crate::replica::{ReplicaSelector, ReplicaSet};
use crate::request::KvRequest;
use crate::retry::{self, RetryPolicy};
use crate::txn::Txn;
use std::sync::Arc;
use std::time::Duration;
use tessera_protocol::record::{decode_keys, decode_pairs};
use tessera_protocol::{IterateHint, Key, ProtocolError, Value};
use tokio::time::Instant;

/// Keys and, when requested, values returned by [`KvClient::iterate`].
pub type IteratePage = (Vec<Key>, Option<Vec<Value>>);

/// Key-value client over a replica set.
pub struct KvClient {
    selector: ReplicaSelector,
    retry: Arc<dyn RetryPolicy>,
    rtt_margin: Duration,
}

impl KvClient {
    /// Creates a client from configuration. No connection is opened until
    /// the first request.
    pub fn new(config: &ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let manager = Arc::new(ConnectionManager::new(config.connection_config()));
        let replicas = ReplicaSet::new(config.service_endpoints()?, config.revival_window())
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        tracing::debug!(
            replicas = replicas.len(),
            client_id = manager.client_id(),
            "client created"
        );
        Ok(Self::with_selector(
            ReplicaSelector::new(manager, replicas, config.hint),
            config.retry.policy(),
            config.rtt_margin(),
        ))
    }

    pub fn with_selector(
        selector: ReplicaSelector,
        retry: Arc<dyn RetryPolicy>,
        rtt_margin: Duration,
    ) -> Self {
        Self {
            selector,
            retry,
            rtt_margin,
        }
    }

    pub fn selector(&self) -> &ReplicaSelector {
        &self.selector
    }

    /// Returns the underlying connection manager.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        self.selector.manager()
    }

    /// Starts a transaction buffering writes for one commit or confirm.
    pub fn begin_txn(&self) -> Txn<'_> {
        Txn::new(self)
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    fn request(&self, deadline: Instant) -> Arc<KvRequest> {
        Arc::new(KvRequest::with_rtt_margin(deadline, self.rtt_margin))
    }

    /// Runs a prepared request to completion under the retry policy.
    async fn call(&self, request: &Arc<KvRequest>, hint: u64) -> Result<(), ClientError> {
        retry::attempt(self.retry.as_ref(), || {
            let request = request.clone();
            async move {
                self.selector.rpc(request.clone(), hint).await?;
                request.check_outcome()
            }
        })
        .await
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Reads `keys`. Absent keys come back with `present == false` and the
    /// sequence number a commit over them must name.
    pub async fn get(&self, deadline: Instant, keys: &[Key]) -> Result<Vec<Value>, ClientError> {
        let request = self.request(deadline);
        request.prepare_get(keys)?;
        self.call(&request, self.selector.hint(&keys[0])).await?;

        let response = request.response();
        let (_, mut values) = decode_pairs(response.payload().data())?;
        if values.len() != keys.len() {
            return Err(ProtocolError::Malformed("response pair count mismatch").into());
        }

        let present = response.present_mask();
        for (i, value) in values.iter_mut().enumerate() {
            value.seqnum = response.seqnum(i)?;
            value.present = present & (1 << i) != 0;
        }
        Ok(values)
    }

    /// Writes `values` to `keys` if every key is still at the sequence number
    /// given in its value. Returns the values with their new sequence numbers.
    ///
    /// A conflicting sequence number fails the whole commit with
    /// [`Outcome::Stale`](tessera_protocol::Outcome::Stale).
    pub async fn commit(
        &self,
        deadline: Instant,
        keys: &[Key],
        values: &[Value],
    ) -> Result<Vec<Value>, ClientError> {
        let request = self.request(deadline);
        request.prepare_commit(keys, values)?;
        self.call(&request, self.selector.hint(&keys[0])).await?;

        let response = request.response();
        values
            .iter()
            .enumerate()
            .map(|(i, value)| {
                Ok(Value {
                    seqnum: response.seqnum(i)?,
                    ..value.clone()
                })
            })
            .collect()
    }

    /// Checks that every key is still at the sequence number of its value.
    pub async fn confirm(
        &self,
        deadline: Instant,
        keys: &[Key],
        values: &[Value],
    ) -> Result<(), ClientError> {
        let request = self.request(deadline);
        request.prepare_confirm(keys, values)?;
        self.call(&request, self.selector.hint(&keys[0])).await
    }

    /// Lists up to `count` keys after `cursor`, in the direction and with the
    /// projection given by `hint`.
    ///
    /// The end of the table is reported as
    /// [`Outcome::NoNext`](tessera_protocol::Outcome::NoNext).
    pub async fn iterate(
        &self,
        deadline: Instant,
        cursor: &Key,
        count: usize,
        hint: IterateHint,
    ) -> Result<IteratePage, ClientError> {
        let request = self.request(deadline);
        request.prepare_iterate(cursor, count, hint)?;
        self.call(&request, self.selector.hint(cursor)).await?;

        let response = request.response();
        let npairs = response.npairs()?;
        if npairs == 0 {
            return Err(ProtocolError::Malformed("empty iterate response").into());
        }

        if !hint.has_value() {
            let keys = decode_keys(response.payload().data())?;
            if keys.len() != npairs {
                return Err(ProtocolError::Malformed("iterate key count mismatch").into());
            }
            return Ok((keys, None));
        }

        let (keys, mut values) = decode_pairs(response.payload().data())?;
        if keys.len() != npairs {
            return Err(ProtocolError::Malformed("iterate pair count mismatch").into());
        }
        for (i, value) in values.iter_mut().enumerate() {
            value.present = true;
            if hint.has_seqnum() {
                value.seqnum = response.seqnum(i)?;
            }
        }
        Ok((keys, Some(values)))
    }
}
