//! Key-value requests.

use crate::config::DEFAULT_RTT_MARGIN;
use crate::connection::{Completion, Request};
use crate::error::ClientError;
use bytes::{Bytes, BytesMut};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::time::Duration;
use tessera_protocol::{IterateHint, Key, KvMessage, Outcome, ProtocolError, Value};
use tokio::time::Instant;

struct Exchange {
    deadline: Instant,
    request_id: u64,
    request: KvMessage,
    response: KvMessage,
    send_buf: BytesMut,
}

/// A key-value request and the storage for its response.
///
/// One `KvRequest` is reused across the retries of an operation; each
/// attempt gets a fresh request id.
pub struct KvRequest {
    exchange: Mutex<Exchange>,
    completion: Completion,
    rtt_margin: Duration,
}

impl KvRequest {
    pub fn new(deadline: Instant) -> Self {
        Self::with_rtt_margin(deadline, DEFAULT_RTT_MARGIN)
    }

    /// `rtt_margin` is subtracted from the time allowance sent to the replica.
    pub fn with_rtt_margin(deadline: Instant, rtt_margin: Duration) -> Self {
        Self {
            exchange: Mutex::new(Exchange {
                deadline,
                request_id: 0,
                request: KvMessage::new(),
                response: KvMessage::new(),
                send_buf: BytesMut::new(),
            }),
            completion: Completion::new(),
            rtt_margin,
        }
    }

    /// Starts a new operation with `deadline`.
    pub fn begin(&self, deadline: Instant) {
        let mut exchange = self.exchange.lock();
        exchange.deadline = deadline;
        exchange.request_id = 0;
    }

    pub fn prepare_get(&self, keys: &[Key]) -> Result<(), ProtocolError> {
        self.exchange.lock().request.prepare_get(keys)
    }

    pub fn prepare_commit(&self, keys: &[Key], values: &[Value]) -> Result<(), ProtocolError> {
        self.exchange.lock().request.prepare_commit(keys, values)
    }

    pub fn prepare_confirm(&self, keys: &[Key], values: &[Value]) -> Result<(), ProtocolError> {
        self.exchange.lock().request.prepare_confirm(keys, values)
    }

    pub fn prepare_iterate(
        &self,
        cursor: &Key,
        count: usize,
        hint: IterateHint,
    ) -> Result<(), ProtocolError> {
        self.exchange.lock().request.prepare_iterate(cursor, count, hint)
    }

    /// The last response received. Do not hold across an await.
    pub fn response(&self) -> MappedMutexGuard<'_, KvMessage> {
        MutexGuard::map(self.exchange.lock(), |exchange| &mut exchange.response)
    }

    /// Fails with the response outcome unless it is OK.
    pub fn check_outcome(&self) -> Result<(), ClientError> {
        match self.response().outcome()? {
            Outcome::Ok => Ok(()),
            outcome => Err(ClientError::Outcome(outcome)),
        }
    }

    /// Remaining time granted to the replica, in microseconds.
    fn allowance_us(&self, deadline: Instant) -> u64 {
        deadline
            .saturating_duration_since(Instant::now())
            .saturating_sub(self.rtt_margin)
            .as_micros() as u64
    }
}

impl Request for KvRequest {
    fn deadline(&self) -> Instant {
        self.exchange.lock().deadline
    }

    fn completion(&self) -> &Completion {
        &self.completion
    }

    fn request_id(&self) -> u64 {
        self.exchange.lock().request_id
    }

    fn serialize(&self, request_id: u64, client_id: u64) -> Result<Bytes, ProtocolError> {
        let mut exchange = self.exchange.lock();
        let allowance = self.allowance_us(exchange.deadline);
        exchange.request_id = request_id;

        let Exchange {
            request, send_buf, ..
        } = &mut *exchange;
        request.put_header(request_id, client_id, allowance);
        send_buf.clear();
        request.serialize(send_buf)?;
        Ok(send_buf.split().freeze())
    }

    /// Absorbs a response. A reply without a known outcome is rejected
    /// like a corrupt one.
    fn deserialize(&self, frame: &Bytes) -> Result<(), ProtocolError> {
        let mut exchange = self.exchange.lock();
        exchange.response.deserialize(frame)?;
        exchange.response.outcome().map(|_| ())
    }
}
