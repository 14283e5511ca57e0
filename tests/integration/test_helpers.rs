// tests/integration/test_helpers.rs

//! Test helpers: a scripted in-process IPROTO server.
//!
//! The mock speaks just enough of the protocol to drive the client end to
//! end. It sends a greeting, checks `chap-sha1` credentials when auth is
//! required, answers catalog selects from an editable in-memory catalog, and
//! interprets a handful of stored-procedure names as scripts (delayed
//! replies, push sequences, errors, garbage frames).

use bytes::BytesMut;
use futures::StreamExt;
use parking_lot::Mutex;
use rmpv::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tntwire::config::{ClientConfig, ReconnectConfig};
use tntwire::connection::{Connection, ConnectionState};
use tntwire::core::protocol::constants::{
    VINDEX_ID, VSPACE_ID, body_key, request_type, response_code,
};
use tntwire::core::protocol::frame::{self, Header};
use tntwire::core::protocol::greeting;
use tntwire::core::protocol::{Frame, IprotoCodec};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing_subscriber::EnvFilter;

pub const TEST_USER: &str = "tester";
pub const TEST_PASSWORD: &str = "secret";

/// A regular space holding three tuples `[id, value]`.
pub const TESTER_SPACE_ID: u32 = 512;
/// A space whose selects push every tuple before the terminal reply.
pub const EVENTS_SPACE_ID: u32 = 513;

pub const INITIAL_SCHEMA_VERSION: u64 = 80;

const INSTANCE_UUID: &str = "6f4a6b3e-1c2d-4e5f-8a9b-0c1d2e3f4a5b";

/// Server-side error codes used by the scripts.
pub mod server_error {
    pub const NO_SUCH_PROC: u32 = 33;
    pub const NO_SUCH_SPACE: u32 = 36;
    pub const ACCESS_DENIED: u32 = 42;
    pub const CREDS_MISMATCH: u32 = 47;
    pub const PROC_LUA: u32 = 32;
}

/// Installs a quiet subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
}

/// One space of the mock catalog.
#[derive(Debug, Clone)]
pub struct CatalogSpace {
    pub id: u32,
    pub name: String,
    pub indexes: Vec<(u32, String)>,
}

impl CatalogSpace {
    pub fn new(id: u32, name: &str, indexes: &[(u32, &str)]) -> Self {
        Self {
            id,
            name: name.to_string(),
            indexes: indexes
                .iter()
                .map(|(id, name)| (*id, name.to_string()))
                .collect(),
        }
    }

    fn space_row(&self) -> Value {
        let format = Value::Array(vec![
            field_format("id", "unsigned"),
            field_format("value", "string"),
        ]);
        Value::Array(vec![
            Value::from(self.id),
            Value::from(1),
            Value::from(self.name.as_str()),
            Value::from("memtx"),
            Value::from(0),
            Value::Map(Vec::new()),
            format,
        ])
    }

    fn index_rows(&self) -> Vec<Value> {
        self.indexes
            .iter()
            .map(|(iid, name)| {
                Value::Array(vec![
                    Value::from(self.id),
                    Value::from(*iid),
                    Value::from(name.as_str()),
                    Value::from("tree"),
                    Value::Map(vec![(Value::from("unique"), Value::from(*iid == 0))]),
                    Value::Array(vec![Value::Array(vec![
                        Value::from(*iid),
                        Value::from("unsigned"),
                    ])]),
                ])
            })
            .collect()
    }
}

fn field_format(name: &str, field_type: &str) -> Value {
    Value::Map(vec![
        (Value::from("name"), Value::from(name)),
        (Value::from("type"), Value::from(field_type)),
    ])
}

fn default_catalog() -> Vec<CatalogSpace> {
    vec![
        CatalogSpace::new(TESTER_SPACE_ID, "tester", &[(0, "primary"), (1, "by_value")]),
        CatalogSpace::new(EVENTS_SPACE_ID, "events", &[(0, "primary")]),
    ]
}

fn tester_rows() -> Vec<Value> {
    vec![
        Value::Array(vec![Value::from(1), Value::from("one")]),
        Value::Array(vec![Value::from(2), Value::from("two")]),
        Value::Array(vec![Value::from(3), Value::from("three")]),
    ]
}

#[derive(Debug)]
struct MockState {
    require_auth: bool,
    schema_version: AtomicU64,
    catalog: Mutex<Vec<CatalogSpace>>,
    accepted: AtomicUsize,
    refuse: AtomicBool,
    silent: AtomicBool,
    greeting_delay_ms: AtomicU64,
    received: Mutex<Vec<(u32, u64)>>,
    kill_tx: broadcast::Sender<()>,
}

/// A running mock server. Dropping it stops accepting and closes every
/// connection.
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::spawn(false).await
    }

    /// A server that rejects data requests until `TEST_USER` authenticates.
    pub async fn start_with_auth() -> Self {
        Self::spawn(true).await
    }

    async fn spawn(require_auth: bool) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock server");
        let addr = listener.local_addr().expect("Mock server has no address");
        let (kill_tx, _) = broadcast::channel(16);
        let state = Arc::new(MockState {
            require_auth,
            schema_version: AtomicU64::new(INITIAL_SCHEMA_VERSION),
            catalog: Mutex::new(default_catalog()),
            accepted: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            greeting_delay_ms: AtomicU64::new(0),
            received: Mutex::new(Vec::new()),
            kill_tx,
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                if accept_state.refuse.load(Ordering::SeqCst) {
                    drop(socket);
                    continue;
                }
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                let kill_rx = accept_state.kill_tx.subscribe();
                tokio::spawn(serve_connection(socket, Arc::clone(&accept_state), kill_rx));
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// A client configuration pointing at this server with fast reconnects.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new("127.0.0.1", self.addr.port());
        config.connect_timeout = Duration::from_secs(2);
        config.sweep_interval = Duration::from_millis(20);
        config.reconnect = ReconnectConfig {
            enabled: true,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            jitter: Duration::ZERO,
        };
        config
    }

    /// Like `client_config` but with the test credentials set.
    pub fn auth_config(&self) -> ClientConfig {
        let mut config = self.client_config();
        config.username = Some(TEST_USER.to_string());
        config.password = Some(TEST_PASSWORD.to_string());
        config
    }

    /// Connects a client with `client_config`.
    pub async fn connect(&self) -> Connection {
        Connection::open(self.client_config())
            .await
            .expect("Failed to connect to mock server")
    }

    /// Closes every open connection from the server side.
    pub fn kill_connections(&self) {
        let _ = self.state.kill_tx.send(());
    }

    /// While set, new connections are closed before the greeting.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// While set, requests are read but never answered.
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Holds back the greeting of new connections by `delay`.
    pub fn set_greeting_delay(&self, delay: Duration) {
        self.state
            .greeting_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of connections that received a greeting.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn schema_version(&self) -> u64 {
        self.state.schema_version.load(Ordering::SeqCst)
    }

    /// Adds a space to the catalog and bumps the schema version.
    pub fn add_space(&self, space: CatalogSpace) -> u64 {
        self.state.catalog.lock().push(space);
        self.state.schema_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Number of requests received with the given request type.
    pub fn requests_of(&self, code: u32) -> usize {
        self.state
            .received
            .lock()
            .iter()
            .filter(|(c, _)| *c == code)
            .count()
    }

    /// Number of catalog reads (one per `_vspace` select).
    pub fn catalog_loads(&self) -> usize {
        self.state
            .received
            .lock()
            .iter()
            .filter(|(c, space)| *c == request_type::SELECT && *space == u64::from(VSPACE_ID))
            .count()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = self.state.kill_tx.send(());
    }
}

/// Waits until the connection reports `state`, panicking after `limit`.
pub async fn wait_for_state(connection: &Connection, state: ConnectionState, limit: Duration) {
    let mut rx = connection.subscribe();
    tokio::time::timeout(limit, rx.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| {
            panic!(
                "Connection did not reach {state} within {limit:?}; it is {}",
                connection.state()
            )
        })
        .expect("Status channel closed");
}

/// Waits until the connection has reached `Connected` on a transport newer
/// than `epoch`.
pub async fn wait_for_epoch_after(connection: &Connection, epoch: u64, limit: Duration) {
    let mut rx = connection.subscribe();
    tokio::time::timeout(
        limit,
        rx.wait_for(|s| s.state == ConnectionState::Connected && s.epoch > epoch),
    )
    .await
    .unwrap_or_else(|_| panic!("Connection did not reconnect within {limit:?}"))
    .expect("Status channel closed");
}

/// Polls until `count` requests are pending on the connection.
pub async fn wait_for_pending(connection: &Connection, count: usize) {
    for _ in 0..400 {
        if connection.pending_requests() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "Expected {count} pending requests, found {}",
        connection.pending_requests()
    );
}

/// Builds the 128-byte greeting for `salt`.
pub fn greeting_bytes(salt: &[u8]) -> Vec<u8> {
    use base64::Engine;
    let mut out = Vec::with_capacity(greeting::GREETING_SIZE);
    let banner = format!("Tarantool 2.11.1 (Binary) {INSTANCE_UUID}");
    out.extend_from_slice(format!("{banner:<63}\n").as_bytes());
    let salt_line = base64::engine::general_purpose::STANDARD.encode(salt);
    out.extend_from_slice(format!("{salt_line:<63}\n").as_bytes());
    out
}

/// One reply step: wait `delay`, then write `bytes`.
struct Step {
    delay: Duration,
    bytes: Vec<u8>,
}

impl Step {
    fn now(bytes: Vec<u8>) -> Self {
        Self {
            delay: Duration::ZERO,
            bytes,
        }
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

async fn serve_connection(
    mut socket: TcpStream,
    state: Arc<MockState>,
    mut kill_rx: broadcast::Receiver<()>,
) {
    let salt: [u8; 32] = rand::random();
    let delay = state.greeting_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if socket.write_all(&greeting_bytes(&salt)).await.is_err() {
        return;
    }

    let (read_half, write_half) = socket.into_split();
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(write_half));
    let mut frames = FramedRead::new(read_half, IprotoCodec::default());
    let mut session = Session {
        state: Arc::clone(&state),
        salt: salt.to_vec(),
        authenticated: !state.require_auth,
    };

    loop {
        tokio::select! {
            _ = kill_rx.recv() => {
                let _ = writer.lock().await.shutdown().await;
                return;
            }
            item = frames.next() => {
                let Some(Ok(frame)) = item else {
                    return;
                };
                let steps = session.handle(&frame);
                if steps.is_empty() {
                    continue;
                }
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    for step in steps {
                        if !step.delay.is_zero() {
                            tokio::time::sleep(step.delay).await;
                        }
                        if writer.lock().await.write_all(&step.bytes).await.is_err() {
                            return;
                        }
                    }
                });
            }
        }
    }
}

struct Session {
    state: Arc<MockState>,
    salt: Vec<u8>,
    authenticated: bool,
}

impl Session {
    fn handle(&mut self, frame: &Frame) -> Vec<Step> {
        let code = frame.header.code;
        let sync = frame.header.sync;
        let body = decode_map(&frame.body);

        let recorded = match code {
            request_type::SELECT => body_uint(&body, body_key::SPACE_ID).unwrap_or(0),
            _ => sync,
        };
        self.state.received.lock().push((code, recorded));

        if self.state.silent.load(Ordering::SeqCst) {
            return Vec::new();
        }

        match code {
            request_type::PING => vec![Step::now(self.ok(sync, None))],
            request_type::AUTH => vec![Step::now(self.authenticate(sync, &body))],
            _ if !self.authenticated => vec![Step::now(self.error(
                sync,
                server_error::ACCESS_DENIED,
                "Read access to universe '' is denied for user 'guest'",
            ))],
            request_type::SELECT => self.select(sync, &body),
            request_type::CALL => self.call(sync, &body),
            request_type::EVAL => {
                let mut data = vec![body_value(&body, body_key::EXPR).unwrap_or(Value::Nil)];
                data.extend(body_array(&body, body_key::TUPLE));
                vec![Step::now(self.ok(sync, Some(Value::Array(data))))]
            }
            request_type::INSERT | request_type::REPLACE => {
                let tuple = Value::Array(body_array(&body, body_key::TUPLE));
                vec![Step::now(self.ok(sync, Some(Value::Array(vec![tuple]))))]
            }
            request_type::DELETE | request_type::UPDATE => {
                let key = Value::Array(body_array(&body, body_key::KEY));
                vec![Step::now(self.ok(sync, Some(Value::Array(vec![key]))))]
            }
            request_type::UPSERT => vec![Step::now(self.ok(sync, Some(Value::Array(Vec::new()))))],
            other => vec![Step::now(self.error(
                sync,
                48,
                &format!("Unknown request type {other}"),
            ))],
        }
    }

    fn authenticate(&mut self, sync: u64, body: &[(Value, Value)]) -> Vec<u8> {
        let user = body_value(body, body_key::USER_NAME);
        let tuple = body_array(body, body_key::TUPLE);
        let scramble = tuple.get(1).and_then(|v| v.as_slice()).map(<[u8]>::to_vec);
        let expected = greeting::scramble(&self.salt, TEST_PASSWORD).ok();

        let user_ok = user.as_ref().and_then(Value::as_str) == Some(TEST_USER);
        if user_ok && scramble.is_some() && scramble.as_deref() == expected.as_ref().map(|s| &s[..]) {
            self.authenticated = true;
            self.ok(sync, None)
        } else {
            let name = user.as_ref().and_then(Value::as_str).unwrap_or("?").to_string();
            self.error(
                sync,
                server_error::CREDS_MISMATCH,
                &format!("Incorrect password supplied for user '{name}'"),
            )
        }
    }

    fn select(&self, sync: u64, body: &[(Value, Value)]) -> Vec<Step> {
        let space_id = body_uint(body, body_key::SPACE_ID).unwrap_or(0) as u32;
        let limit = body_uint(body, body_key::LIMIT).unwrap_or(u64::from(u32::MAX)) as usize;
        let offset = body_uint(body, body_key::OFFSET).unwrap_or(0) as usize;
        let key = body_array(body, body_key::KEY);

        let rows: Vec<Value> = match space_id {
            VSPACE_ID => self.state.catalog.lock().iter().map(CatalogSpace::space_row).collect(),
            VINDEX_ID => self
                .state
                .catalog
                .lock()
                .iter()
                .flat_map(CatalogSpace::index_rows)
                .collect(),
            TESTER_SPACE_ID => tester_rows()
                .into_iter()
                .filter(|row| match (key.first(), row) {
                    (Some(k), Value::Array(fields)) => fields.first() == Some(k),
                    _ => true,
                })
                .collect(),
            EVENTS_SPACE_ID => {
                // Every row but the last is pushed; the last one is the terminal reply.
                let events = ["x", "y", "z"];
                let mut steps: Vec<Step> = events[..events.len() - 1]
                    .iter()
                    .map(|e| Step::now(self.push(sync, Value::Array(vec![Value::from(*e)]))))
                    .collect();
                steps.push(Step::now(self.ok(
                    sync,
                    Some(Value::Array(vec![Value::from(events[events.len() - 1])])),
                )));
                return steps;
            }
            other => {
                return vec![Step::now(self.error(
                    sync,
                    server_error::NO_SUCH_SPACE,
                    &format!("Space '{other}' does not exist"),
                ))];
            }
        };

        let rows = rows.into_iter().skip(offset).take(limit).collect();
        vec![Step::now(self.ok(sync, Some(Value::Array(rows))))]
    }

    fn call(&self, sync: u64, body: &[(Value, Value)]) -> Vec<Step> {
        let name = body_value(body, body_key::FUNCTION_NAME)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let args = body_array(body, body_key::TUPLE);

        match name.as_str() {
            "echo" => vec![Step::now(self.ok(sync, Some(Value::Array(args))))],
            // sleep(ms): replies after `ms` milliseconds.
            "sleep" => {
                let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
                vec![Step {
                    delay: Duration::from_millis(ms),
                    bytes: self.ok(sync, Some(Value::Array(args))),
                }]
            }
            // push(a, b, ..., last): pushes every argument but the last, then returns the last.
            "push" => {
                let Some((last, pushed)) = args.split_last() else {
                    return vec![Step::now(self.ok(sync, Some(Value::Array(Vec::new()))))];
                };
                let mut steps: Vec<Step> = pushed
                    .iter()
                    .map(|v| Step::now(self.push(sync, Value::Array(vec![v.clone()]))))
                    .collect();
                steps.push(Step::now(self.ok(sync, Some(Value::Array(vec![last.clone()])))));
                steps
            }
            // push_then_fail(a): pushes `a`, then fails.
            "push_then_fail" => {
                let mut steps: Vec<Step> = args
                    .iter()
                    .map(|v| Step::now(self.push(sync, Value::Array(vec![v.clone()]))))
                    .collect();
                steps.push(Step::now(self.error(sync, server_error::PROC_LUA, "stream failed")));
                steps
            }
            "fail" => vec![Step::now(self.error(sync, server_error::PROC_LUA, "boom"))],
            // Replies with a frame whose header is not a map.
            "garbage" => vec![Step::now(vec![0x04, 0x93, 0x01, 0x02, 0x03])],
            // Replies OK with a body cut off after the map marker.
            "bad_body" => vec![Step::now(self.raw_frame(response_code::OK, sync, &[0x81]))],
            // Replies with the current schema version, which the caller may have bumped.
            "schema_version" => vec![Step::now(self.ok(
                sync,
                Some(Value::Array(vec![Value::from(
                    self.state.schema_version.load(Ordering::SeqCst),
                )])),
            ))],
            other => vec![Step::now(self.error(
                sync,
                server_error::NO_SUCH_PROC,
                &format!("Procedure '{other}' is not defined"),
            ))],
        }
    }

    fn ok(&self, sync: u64, data: Option<Value>) -> Vec<u8> {
        let body = data.map(|d| Value::Map(vec![(Value::from(body_key::DATA), d)]));
        self.frame(response_code::OK, sync, body)
    }

    fn push(&self, sync: u64, data: Value) -> Vec<u8> {
        let body = Value::Map(vec![(Value::from(body_key::DATA), data)]);
        self.frame(response_code::CHUNK, sync, Some(body))
    }

    fn error(&self, sync: u64, code: u32, message: &str) -> Vec<u8> {
        let body = Value::Map(vec![(Value::from(body_key::ERROR_24), Value::from(message))]);
        self.frame(response_code::ERROR_BIT | code, sync, Some(body))
    }

    fn frame(&self, code: u32, sync: u64, body: Option<Value>) -> Vec<u8> {
        let mut body_bytes = Vec::new();
        if let Some(body) = body {
            rmpv::encode::write_value(&mut body_bytes, &body).expect("Failed to encode mock body");
        }
        self.raw_frame(code, sync, &body_bytes)
    }

    fn raw_frame(&self, code: u32, sync: u64, body: &[u8]) -> Vec<u8> {
        let header = Header {
            code,
            sync,
            schema_version: self.state.schema_version.load(Ordering::SeqCst),
        };
        let mut out = BytesMut::new();
        frame::encode(&header, body, &mut out).expect("Failed to encode mock frame");
        out.to_vec()
    }
}

fn decode_map(body: &[u8]) -> Vec<(Value, Value)> {
    if body.is_empty() {
        return Vec::new();
    }
    let mut rd = body;
    match rmpv::decode::read_value(&mut rd) {
        Ok(Value::Map(entries)) => entries,
        _ => Vec::new(),
    }
}

fn body_value(body: &[(Value, Value)], key: u8) -> Option<Value> {
    body.iter()
        .find(|(k, _)| k.as_u64() == Some(u64::from(key)))
        .map(|(_, v)| v.clone())
}

fn body_uint(body: &[(Value, Value)], key: u8) -> Option<u64> {
    body_value(body, key).and_then(|v| v.as_u64())
}

fn body_array(body: &[(Value, Value)], key: u8) -> Vec<Value> {
    match body_value(body, key) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}
