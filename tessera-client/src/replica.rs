//! Replica selection.
//!
//! Keys are routed by rendezvous hashing: every replica scores
//! `identity ^ hint` and the highest healthy score wins, so each key has a
//! stable preferred replica and a stable fallback order. A replica that fails
//! at the transport level is avoided for the revival window.

use crate::connection::{ConnectionManager, Request};
use crate::endpoint::Endpoint;
use crate::error::ClientError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tessera_protocol::{mix, siphash, Key, DEFAULT_SIP_KEY};
use tokio::time::Instant;

/// How long a failed replica is skipped.
pub const DEFAULT_REVIVAL_WINDOW: Duration = Duration::from_secs(60);

fn hint_dropping(key: &Key, dropped: usize) -> u64 {
    let table = mix(key.table);
    if key.key.len() > dropped {
        table ^ siphash(&key.key[..key.key.len() - dropped], DEFAULT_SIP_KEY)
    } else {
        table
    }
}

/// Shard hint ignoring the last key byte, so keys differing only there share
/// a replica.
pub fn shard_hint(key: &Key) -> u64 {
    hint_dropping(key, 1)
}

/// Shard hint ignoring the last two key bytes.
pub fn coarse_shard_hint(key: &Key) -> u64 {
    hint_dropping(key, 2)
}

/// Which key prefix feeds the shard hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintGranularity {
    #[default]
    Fine,
    Coarse,
}

impl HintGranularity {
    pub fn hint(self, key: &Key) -> u64 {
        match self {
            HintGranularity::Fine => shard_hint(key),
            HintGranularity::Coarse => coarse_shard_hint(key),
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fine" => Some(HintGranularity::Fine),
            "coarse" => Some(HintGranularity::Coarse),
            _ => None,
        }
    }
}

/// An ordered replica list with per-replica failure marks.
#[derive(Debug)]
pub struct ReplicaSet {
    endpoints: Vec<Endpoint>,
    failed_at: Mutex<Vec<Option<Instant>>>,
    revival: Duration,
}

impl ReplicaSet {
    pub fn new(endpoints: Vec<Endpoint>, revival: Duration) -> Result<Self, ClientError> {
        if endpoints.is_empty() {
            return Err(ClientError::NoReplicas);
        }
        let failed_at = Mutex::new(vec![None; endpoints.len()]);
        Ok(Self {
            endpoints,
            failed_at,
            revival,
        })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn endpoint(&self, index: usize) -> Endpoint {
        self.endpoints[index]
    }

    fn healthy(mark: Option<Instant>, now: Instant, revival: Duration) -> bool {
        match mark {
            None => true,
            Some(at) => now.saturating_duration_since(at) > revival,
        }
    }

    pub fn is_healthy(&self, index: usize) -> bool {
        Self::healthy(self.failed_at.lock()[index], Instant::now(), self.revival)
    }

    /// Index of the replica to use for `hint`.
    pub fn pick(&self, hint: u64) -> usize {
        self.pick_at(hint, Instant::now())
    }

    /// [`ReplicaSet::pick`] evaluated at `now`.
    ///
    /// When every replica is marked, all marks are cleared and the choice is
    /// made over the whole set.
    pub fn pick_at(&self, hint: u64, now: Instant) -> usize {
        let mut failed_at = self.failed_at.lock();
        loop {
            let mut best: Option<(usize, u64)> = None;
            for (i, endpoint) in self.endpoints.iter().enumerate() {
                if !Self::healthy(failed_at[i], now, self.revival) {
                    continue;
                }
                let score = endpoint.identity() ^ hint;
                if best.map_or(true, |(_, top)| score >= top) {
                    best = Some((i, score));
                }
            }

            if let Some((index, _)) = best {
                return index;
            }
            tracing::info!(replicas = self.endpoints.len(), "no healthy replica, reviving all");
            failed_at.iter_mut().for_each(|mark| *mark = None);
        }
    }

    pub fn mark_unhealthy(&self, index: usize) {
        self.mark_unhealthy_at(index, Instant::now());
    }

    pub fn mark_unhealthy_at(&self, index: usize, now: Instant) {
        self.failed_at.lock()[index] = Some(now);
    }
}

/// Routes requests to replicas through a shared connection manager.
pub struct ReplicaSelector {
    manager: Arc<ConnectionManager>,
    replicas: ReplicaSet,
    granularity: HintGranularity,
}

impl ReplicaSelector {
    pub fn new(
        manager: Arc<ConnectionManager>,
        replicas: ReplicaSet,
        granularity: HintGranularity,
    ) -> Self {
        Self {
            manager,
            replicas,
            granularity,
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn replicas(&self) -> &ReplicaSet {
        &self.replicas
    }

    pub fn hint(&self, key: &Key) -> u64 {
        self.granularity.hint(key)
    }

    fn fail(&self, index: usize, error: &ClientError) -> ClientError {
        let endpoint = self.replicas.endpoint(index);
        tracing::warn!(%endpoint, %error, "marking replica unhealthy");
        self.replicas.mark_unhealthy(index);
        ClientError::Unavailable {
            endpoint: endpoint.addr(),
        }
    }

    /// Sends `request` to the replica chosen for `hint` and returns its index.
    ///
    /// A transport failure marks the replica and yields
    /// [`ClientError::Unavailable`].
    pub async fn submit(&self, request: Arc<dyn Request>, hint: u64) -> Result<usize, ClientError> {
        let index = self.replicas.pick(hint);
        let addr = self.replicas.endpoint(index).addr();

        match self.manager.submit(request, addr).await {
            Ok(()) => Ok(index),
            Err(e @ ClientError::Io(_)) => Err(self.fail(index, &e)),
            Err(e) => Err(e),
        }
    }

    /// Submits `request` and waits for its response.
    ///
    /// A response that fails to parse is treated like a transport failure.
    pub async fn rpc(&self, request: Arc<dyn Request>, hint: u64) -> Result<(), ClientError> {
        let index = self.submit(request.clone(), hint).await?;
        match self.manager.wait_for_completion(&*request).await {
            Err(e) if e.is_malformed() => Err(self.fail(index, &e)),
            result => result,
        }
    }
}
