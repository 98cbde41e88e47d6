//! In-process replica speaking the key-value wire protocol.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_client::{ClientConfig, Endpoint, KvClient};
use tessera_protocol::message::tag;
use tessera_protocol::record::{decode_keys, decode_pairs, encode_keys, encode_pairs};
use tessera_protocol::{FrameDecoder, Key, Kind, KvMessage, Outcome, ProtocolError, Value, WIRE_MAGIC};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A way of answering badly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Flips the last payload byte so the payload CRC no longer matches.
    CorruptPayload,
    /// Answers without an outcome tag.
    MissingOutcome,
}

/// Stored record: sequence number and data, `None` once deleted.
type Record = (u64, Option<Bytes>);

#[derive(Default)]
struct State {
    store: BTreeMap<(u64, Bytes), Record>,
    /// Outcome forced onto the next N requests.
    forced: Option<(Outcome, usize)>,
    fault: Option<Fault>,
}

struct Shared {
    state: Mutex<State>,
    requests: AtomicUsize,
    accepts: AtomicUsize,
    silent: AtomicBool,
    kick: watch::Sender<u64>,
}

pub struct MockReplica {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockReplica {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (kick, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            requests: AtomicUsize::new(0),
            accepts: AtomicUsize::new(0),
            silent: AtomicBool::new(false),
            kick,
        });

        let accept = shared.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept.accepts.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(accept.clone(), socket));
            }
        });
        Self { addr, shared }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn endpoint(&self) -> Endpoint {
        match self.addr {
            SocketAddr::V4(addr) => addr.into(),
            SocketAddr::V6(_) => unreachable!("bound to an IPv4 address"),
        }
    }

    /// Requests received so far.
    pub fn requests(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    /// Connections accepted so far.
    pub fn accepts(&self) -> usize {
        self.shared.accepts.load(Ordering::SeqCst)
    }

    /// Answers every request with `fault` until cleared.
    pub fn set_fault(&self, fault: Option<Fault>) {
        self.shared.state.lock().fault = fault;
    }

    /// Reads requests without ever answering them.
    pub fn set_silent(&self, silent: bool) {
        self.shared.silent.store(silent, Ordering::SeqCst);
    }

    /// Answers the next `count` requests with `outcome`.
    pub fn force_outcome(&self, outcome: Outcome, count: usize) {
        self.shared.state.lock().forced = Some((outcome, count));
    }

    /// Closes every open connection. The listener stays up.
    pub fn drop_connections(&self) {
        self.shared.kick.send_modify(|generation| *generation += 1);
    }
}

/// Client configuration addressing `endpoints` directly.
pub fn config(endpoints: Vec<Endpoint>) -> ClientConfig {
    ClientConfig {
        replicas: endpoints,
        port_offset: 0,
        ..Default::default()
    }
}

pub fn client(replica: &MockReplica) -> KvClient {
    KvClient::new(&config(vec![replica.endpoint()])).unwrap()
}

/// An IPv4 address nobody listens on.
pub async fn unreachable_endpoint() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    match listener.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr.into(),
        SocketAddr::V6(_) => unreachable!("bound to an IPv4 address"),
    }
}

/// Polls `cond` every few milliseconds for up to a second.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

async fn serve(shared: Arc<Shared>, mut socket: TcpStream) {
    let mut kick = shared.kick.subscribe();
    let mut decoder = FrameDecoder::new(WIRE_MAGIC);
    let mut request = KvMessage::new();
    let mut response = KvMessage::new();
    let mut out = BytesMut::new();

    loop {
        tokio::select! {
            read = socket.read_buf(decoder.buffer_mut()) => {
                if !matches!(read, Ok(n) if n > 0) {
                    return;
                }
            }
            _ = kick.changed() => return,
        }

        while let Ok(Some((info, frame))) = decoder.next_frame() {
            shared.requests.fetch_add(1, Ordering::SeqCst);
            if shared.silent.load(Ordering::SeqCst) {
                continue;
            }
            if request.deserialize(&frame).is_err() {
                return;
            }

            let (forced, fault) = {
                let mut state = shared.state.lock();
                let forced = match state.forced.take() {
                    Some((outcome, n)) if n > 0 => {
                        if n > 1 {
                            state.forced = Some((outcome, n - 1));
                        }
                        Some(outcome)
                    }
                    _ => None,
                };
                (forced, state.fault)
            };

            let handled = match (fault, forced) {
                (Some(Fault::MissingOutcome), _) => request.kind().map(|kind| {
                    response.reset(kind, 0, Bytes::new());
                }),
                (_, Some(outcome)) => request.kind().map(|kind| {
                    response.reset(kind, 0, Bytes::new());
                    response.put(tag::OUTCOME, outcome.code());
                }),
                _ => handle(&shared, &request, &mut response),
            };
            if handled.is_err() {
                return;
            }

            response.put_header(info.request_id, info.client_id, 0);
            out.clear();
            if response.serialize(&mut out).is_err() {
                return;
            }
            if fault == Some(Fault::CorruptPayload) && !response.payload().is_empty() {
                // The payload is the last blob, right before the 2-byte trailer.
                let last = out.len() - 3;
                out[last] ^= 0xff;
            }
            if socket.write_all(&out).await.is_err() {
                return;
            }
        }
    }
}

fn handle(
    shared: &Shared,
    request: &KvMessage,
    response: &mut KvMessage,
) -> Result<(), ProtocolError> {
    let kind = request.kind()?;
    let mut state = shared.state.lock();
    let store = &mut state.store;

    match kind {
        Kind::Get => {
            let keys = decode_keys(request.payload().data())?;
            let values: Vec<Value> = keys
                .iter()
                .map(|key| match store.get(&(key.table, key.key.clone())) {
                    Some((seqnum, Some(data))) => Value::present(*seqnum, data.clone()),
                    Some((seqnum, None)) => Value::absent(*seqnum),
                    None => Value::absent(0),
                })
                .collect();

            let mut data = BytesMut::new();
            encode_pairs(&mut data, &keys, &values)?;
            response.reset(kind, keys.len(), data.freeze());
            put_seqnums(response, &values);
            let present = values
                .iter()
                .enumerate()
                .filter(|(_, v)| v.present)
                .fold(0u64, |mask, (i, _)| mask | 1 << i);
            response.put(tag::PRESENT, present);
            response.put(tag::OUTCOME, Outcome::Ok.code());
        }
        Kind::Commit => {
            let (keys, mut values) = decode_pairs(request.payload().data())?;
            let present = request.present_mask();
            for (i, value) in values.iter_mut().enumerate() {
                value.seqnum = request.seqnum(i)?;
                value.present = present & (1 << i) != 0;
            }

            response.reset(kind, keys.len(), Bytes::new());
            if !seqnums_match(store, &keys, &values) {
                response.put(tag::OUTCOME, Outcome::Stale.code());
                return Ok(());
            }
            for (i, (key, value)) in keys.iter().zip(&values).enumerate() {
                let seqnum = value.seqnum + 1;
                let data = value.present.then(|| value.data.clone());
                store.insert((key.table, key.key.clone()), (seqnum, data));
                response.put(tag::SEQNUM + i as u8, seqnum);
            }
            response.put(tag::OUTCOME, Outcome::Ok.code());
        }
        Kind::Confirm => {
            let keys = decode_keys(request.payload().data())?;
            let values = (0..keys.len())
                .map(|i| request.seqnum(i).map(Value::absent))
                .collect::<Result<Vec<_>, _>>()?;

            response.reset(kind, keys.len(), Bytes::new());
            let outcome = if seqnums_match(store, &keys, &values) {
                Outcome::Ok
            } else {
                Outcome::Stale
            };
            response.put(tag::OUTCOME, outcome.code());
        }
        Kind::Iterate => {
            let cursor = decode_keys(request.payload().data())?
                .into_iter()
                .next()
                .ok_or(ProtocolError::Malformed("missing cursor"))?;
            let count = request.npairs()?;
            let hint = request.iterate_hint()?;

            let live = store
                .iter()
                .filter(|((table, _), (_, data))| *table == cursor.table && data.is_some());
            let found: Vec<(Key, Value)> = if hint.is_backward() {
                live.rev()
                    .filter(|((_, key), _)| *key < cursor.key)
                    .take(count)
                    .map(to_pair)
                    .collect()
            } else {
                live.filter(|((_, key), _)| *key > cursor.key)
                    .take(count)
                    .map(to_pair)
                    .collect()
            };

            if found.is_empty() {
                response.reset(kind, 0, Bytes::new());
                response.put(tag::OUTCOME, Outcome::NoNext.code());
                return Ok(());
            }

            let (keys, values): (Vec<Key>, Vec<Value>) = found.into_iter().unzip();
            let mut data = BytesMut::new();
            if hint.has_value() {
                encode_pairs(&mut data, &keys, &values)?;
            } else {
                encode_keys(&mut data, &keys)?;
            }
            response.reset(kind, keys.len(), data.freeze());
            if hint.has_seqnum() {
                put_seqnums(response, &values);
            }
            response.put(tag::OUTCOME, Outcome::Ok.code());
        }
    }
    Ok(())
}

fn to_pair(((table, key), (seqnum, data)): (&(u64, Bytes), &Record)) -> (Key, Value) {
    let value = Value::present(*seqnum, data.clone().unwrap_or_default());
    (Key::new(*table, key.clone()), value)
}

fn put_seqnums(response: &mut KvMessage, values: &[Value]) {
    for (i, value) in values.iter().enumerate() {
        response.put(tag::SEQNUM + i as u8, value.seqnum);
    }
}

fn seqnums_match(store: &BTreeMap<(u64, Bytes), Record>, keys: &[Key], values: &[Value]) -> bool {
    keys.iter().zip(values).all(|(key, value)| {
        let current = store
            .get(&(key.table, key.key.clone()))
            .map_or(0, |(seqnum, _)| *seqnum);
        current == value.seqnum
    })
}
