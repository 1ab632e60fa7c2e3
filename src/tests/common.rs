use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::watch;
use uuid::Uuid;

use crate::dbbat::auth::{seal_password, AuthCache, KEY_LEN};
use crate::dbbat::common::Result;
use crate::dbbat::config::SslMode;
use crate::dbbat::pg::protocol::{
    AuthType, Message, MessageBuilder, StartupParams, Tag,
};
use crate::dbbat::pg::{
    run_session, BoxedStream, CaptureLimits, MessageStream, SessionContext, UpstreamConnector,
};
use crate::dbbat::store::{AccessControl, Database, Grant, MemoryStore, Store, User};

pub const TEST_USER: &str = "florent";
pub const TEST_DATABASE: &str = "analytics";
pub const TEST_PASSWORD: &str = "openseasame";
pub const UPSTREAM_USER: &str = "dbbat_svc";
pub const UPSTREAM_PASSWORD: &str = "upstream-secret";
pub const TEST_KEY: [u8; KEY_LEN] = [7u8; KEY_LEN];

/// What the scripted upstream observed; tests assert against this.
#[derive(Default)]
pub struct UpstreamState {
    pub startup_params: Vec<(String, String)>,
    pub password_received: Option<String>,
    pub queries: Vec<String>,
    pub read_only_set: bool,
}

#[derive(Clone, Copy)]
pub enum UpstreamAuthMode {
    Trust,
    Cleartext,
    Md5 { salt: [u8; 4] },
    Sasl,
}

/// Accumulates the backend messages a query handler wants to send.
pub struct Responder {
    out: Vec<u8>,
}

impl Responder {
    fn new() -> Self {
        Responder { out: Vec::new() }
    }

    fn push(&mut self, msg: Message) {
        self.out.extend_from_slice(msg.as_slice());
    }

    pub fn row_description(&mut self, cols: &[(&str, i32)]) {
        let mut mb = MessageBuilder::new(Tag::ROW_DESCRIPTION);
        mb.write_i16(cols.len() as i16);
        for (name, oid) in cols {
            mb.write_str(name);
            mb.write_i32(0); // table oid
            mb.write_i16(0); // column attr
            mb.write_i32(*oid);
            mb.write_i16(-1); // type len
            mb.write_i32(-1); // type mod
            mb.write_i16(0); // text format
        }
        self.push(mb.finish());
    }

    pub fn data_row(&mut self, values: &[Option<&str>]) {
        let mut mb = MessageBuilder::new(Tag::DATA_ROW);
        mb.write_i16(values.len() as i16);
        for value in values {
            match value {
                None => mb.write_i32(-1),
                Some(v) => {
                    mb.write_i32(v.len() as i32);
                    mb.write_bytes(v.as_bytes());
                }
            }
        }
        self.push(mb.finish());
    }

    pub fn command_complete(&mut self, tag: &str) {
        let mut mb = MessageBuilder::new(Tag::COMMAND_COMPLETE);
        mb.write_str(tag);
        self.push(mb.finish());
    }

    pub fn error(&mut self, code: &str, message: &str) {
        self.push(crate::dbbat::pg::protocol::new_error(code, message));
    }

    /// CopyOutResponse + one CopyData per line + CopyDone + CommandComplete.
    pub fn copy_out(&mut self, lines: &[&str]) {
        let mut mb = MessageBuilder::new(Tag::COPY_OUT_RESPONSE);
        mb.write_byte(0); // text format
        mb.write_i16(1);
        mb.write_i16(0);
        self.push(mb.finish());
        for line in lines {
            let mut mb = MessageBuilder::new(Tag::COPY_DATA);
            mb.write_bytes(line.as_bytes());
            mb.write_byte(b'\n');
            self.push(mb.finish());
        }
        self.push(MessageBuilder::new(Tag::COPY_DONE).finish());
        self.command_complete(&format!("COPY {}", lines.len()));
    }
}

pub type QueryHandler = Arc<dyn Fn(&str, &[Option<String>], &mut Responder) + Send + Sync>;

/// The default handler: every statement returns one row, one int column.
pub fn select_one_handler() -> QueryHandler {
    Arc::new(|_sql, params, resp: &mut Responder| {
        resp.row_description(&[("?column?", 23)]);
        match params.first() {
            Some(Some(v)) => resp.data_row(&[Some(v)]),
            _ => resp.data_row(&[Some("1")]),
        }
        resp.command_complete("SELECT 1");
    })
}

/// A scripted upstream PostgreSQL server running over an in-memory duplex
/// stream; stands in for the real thing in session tests.
pub struct ScriptedUpstream {
    pub auth: UpstreamAuthMode,
    pub handler: QueryHandler,
    pub describe_fields: Vec<(String, i32)>,
    pub state: Arc<Mutex<UpstreamState>>,
}

#[async_trait]
impl UpstreamConnector for ScriptedUpstream {
    async fn connect(&self, _database: &Database) -> Result<BoxedStream> {
        let (ours, theirs) = duplex(1 << 20);
        let auth = self.auth;
        let handler = self.handler.clone();
        let fields = self.describe_fields.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let _ = run_fake_backend(theirs, auth, handler, fields, state).await;
        });
        Ok(Box::new(ours))
    }
}

async fn run_fake_backend(
    stream: DuplexStream,
    auth: UpstreamAuthMode,
    handler: QueryHandler,
    describe_fields: Vec<(String, i32)>,
    state: Arc<Mutex<UpstreamState>>,
) -> Result<()> {
    let (r, mut w) = tokio::io::split(stream);
    let mut stream = MessageStream::new(r, 8192);

    let startup = stream.next_startup().await?;
    let params = StartupParams::from_startup_message(&startup)?;
    {
        let mut state = state.lock().unwrap();
        state.startup_params = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
    }

    match auth {
        UpstreamAuthMode::Trust => (),
        UpstreamAuthMode::Cleartext => {
            let mut mb = MessageBuilder::new(Tag::AUTHENTICATION);
            mb.write_i32(AuthType::ClearText.as_i32());
            w.write_all(mb.finish().as_slice()).await?;
            let msg = stream.next().await?;
            assert_eq!(msg.tag(), Tag::PASSWORD_MESSAGE);
            state.lock().unwrap().password_received = Some(msg.reader().read_str()?.to_string());
        }
        UpstreamAuthMode::Md5 { salt } => {
            let mut mb = MessageBuilder::new(Tag::AUTHENTICATION);
            mb.write_i32(AuthType::MD5.as_i32());
            mb.write_bytes(&salt);
            w.write_all(mb.finish().as_slice()).await?;
            let msg = stream.next().await?;
            assert_eq!(msg.tag(), Tag::PASSWORD_MESSAGE);
            state.lock().unwrap().password_received = Some(msg.reader().read_str()?.to_string());
        }
        UpstreamAuthMode::Sasl => {
            let mut mb = MessageBuilder::new(Tag::AUTHENTICATION);
            mb.write_i32(AuthType::SASL.as_i32());
            mb.write_str("SCRAM-SHA-256");
            mb.write_byte(0);
            w.write_all(mb.finish().as_slice()).await?;
            // the proxy refuses SASL and hangs up
            return Ok(());
        }
    }

    let mut mb = MessageBuilder::new(Tag::AUTHENTICATION);
    mb.write_i32(AuthType::Ok.as_i32());
    mb.add_new(Tag::PARAMETER_STATUS);
    mb.write_str("server_version");
    mb.write_str("14.5");
    mb.add_new(Tag::PARAMETER_STATUS);
    mb.write_str("server_encoding");
    mb.write_str("UTF8");
    mb.add_new(Tag::BACKEND_KEY_DATA);
    mb.write_i32(1234);
    mb.write_i32(5678);
    mb.add_new(Tag::READY_FOR_QUERY);
    mb.write_byte(b'I');
    w.write_all(mb.finish().as_slice()).await?;

    // statement/portal registries for the extended protocol
    let mut statements: Vec<(String, String)> = Vec::new(); // name -> sql
    let mut portals: Vec<(String, String, Vec<Option<String>>)> = Vec::new();

    loop {
        let msg = match stream.next().await {
            Ok(msg) => msg,
            Err(_) => return Ok(()), // client side closed
        };
        match msg.tag() {
            Tag::TERMINATE => return Ok(()),
            Tag::QUERY => {
                let sql = msg.reader().read_str()?.to_string();
                state.lock().unwrap().queries.push(sql.clone());
                let head = sql.trim_start().to_ascii_uppercase();
                let mut resp = Responder::new();
                if head.starts_with("SET SESSION DEFAULT_TRANSACTION_READ_ONLY") {
                    state.lock().unwrap().read_only_set = true;
                    resp.command_complete("SET");
                } else {
                    handler(&sql, &[], &mut resp);
                }
                let mut mb = MessageBuilder::new(Tag::READY_FOR_QUERY);
                mb.write_byte(b'I');
                resp.out.extend_from_slice(mb.finish().as_slice());
                w.write_all(&resp.out).await?;
            }
            Tag::PARSE => {
                let mut r = msg.reader();
                let name = r.read_str()?.to_string();
                let sql = r.read_str()?.to_string();
                statements.retain(|(n, _)| n != &name);
                statements.push((name, sql));
                w.write_all(MessageBuilder::new(Tag::PARSE_COMPLETE).finish().as_slice())
                    .await?;
            }
            Tag::BIND => {
                let mut r = msg.reader();
                let portal = r.read_str()?.to_string();
                let statement = r.read_str()?.to_string();
                let num_formats = r.read_i16();
                for _ in 0..num_formats {
                    r.read_i16();
                }
                let num_params = r.read_i16();
                let mut values = Vec::new();
                for _ in 0..num_params {
                    let len = r.read_i32();
                    if len < 0 {
                        values.push(None);
                    } else {
                        let raw = r.read_bytes(len as u32)?;
                        values.push(Some(String::from_utf8_lossy(raw).into_owned()));
                    }
                }
                portals.retain(|(n, _, _)| n != &portal);
                portals.push((portal, statement, values));
                w.write_all(MessageBuilder::new(Tag::BIND_COMPLETE).finish().as_slice())
                    .await?;
            }
            Tag::DESCRIBE => {
                let cols: Vec<(&str, i32)> = describe_fields
                    .iter()
                    .map(|(name, oid)| (name.as_str(), *oid))
                    .collect();
                let mut resp = Responder::new();
                resp.row_description(&cols);
                w.write_all(&resp.out).await?;
            }
            Tag::EXECUTE => {
                let portal_name = msg.reader().read_str()?.to_string();
                let found = portals.iter().find(|(n, _, _)| n == &portal_name).cloned();
                if let Some((_, statement, values)) = found {
                    let sql = statements
                        .iter()
                        .find(|(n, _)| n == &statement)
                        .map(|(_, sql)| sql.clone())
                        .unwrap_or_default();
                    state.lock().unwrap().queries.push(sql.clone());
                    let mut resp = Responder::new();
                    handler(&sql, &values, &mut resp);
                    w.write_all(&resp.out).await?;
                }
            }
            Tag::CLOSE => {
                w.write_all(MessageBuilder::new(Tag::CLOSE_COMPLETE).finish().as_slice())
                    .await?;
            }
            Tag::SYNC => {
                let mut mb = MessageBuilder::new(Tag::READY_FOR_QUERY);
                mb.write_byte(b'I');
                w.write_all(mb.finish().as_slice()).await?;
            }
            _ => (),
        }
    }
}

pub struct TestEnv {
    pub store: Arc<MemoryStore>,
    pub ctx: Arc<SessionContext>,
    pub grant_uid: Uuid,
    pub upstream_state: Arc<Mutex<UpstreamState>>,
    pub shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

pub struct EnvBuilder {
    controls: Vec<AccessControl>,
    capture: CaptureLimits,
    auth: UpstreamAuthMode,
    handler: QueryHandler,
    describe_fields: Vec<(String, i32)>,
    max_query_counts: Option<u64>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        EnvBuilder {
            controls: Vec::new(),
            capture: CaptureLimits {
                store_results: true,
                max_result_rows: 100_000,
                max_result_bytes: 100 * 1024 * 1024,
            },
            auth: UpstreamAuthMode::Trust,
            handler: select_one_handler(),
            describe_fields: vec![("?column?".to_string(), 23)],
            max_query_counts: None,
        }
    }

    pub fn controls(mut self, controls: Vec<AccessControl>) -> Self {
        self.controls = controls;
        self
    }

    pub fn capture(mut self, capture: CaptureLimits) -> Self {
        self.capture = capture;
        self
    }

    pub fn auth(mut self, auth: UpstreamAuthMode) -> Self {
        self.auth = auth;
        self
    }

    pub fn handler(mut self, handler: QueryHandler) -> Self {
        self.handler = handler;
        self
    }

    pub fn max_query_counts(mut self, cap: u64) -> Self {
        self.max_query_counts = Some(cap);
        self
    }

    pub async fn build(self) -> TestEnv {
        let store = Arc::new(MemoryStore::new());
        let user_uid = Uuid::now_v7();
        store.add_user(User {
            uid: user_uid,
            username: TEST_USER.to_string(),
            password_hash: crate::dbbat::auth::password::hash(TEST_PASSWORD.to_string())
                .await
                .unwrap(),
            roles: vec!["analyst".to_string()],
        });
        let db_uid = Uuid::now_v7();
        store.add_database(Database {
            uid: db_uid,
            name: TEST_DATABASE.to_string(),
            host: "scripted".to_string(),
            port: 5432,
            database_name: "analytics_prod".to_string(),
            username: UPSTREAM_USER.to_string(),
            password_ciphertext: seal_password(&TEST_KEY, db_uid, UPSTREAM_PASSWORD).unwrap(),
            ssl_mode: SslMode::Disable,
        });
        let grant_uid = Uuid::now_v7();
        store.add_grant(Grant {
            uid: grant_uid,
            user_id: user_uid,
            database_id: db_uid,
            controls: self.controls,
            starts_at: chrono::DateTime::<chrono::Utc>::MIN_UTC,
            expires_at: chrono::DateTime::<chrono::Utc>::MAX_UTC,
            revoked_at: None,
            query_count: 0,
            bytes_transferred: 0,
            max_query_counts: self.max_query_counts,
            max_bytes_transferred: None,
        });

        let upstream_state = Arc::new(Mutex::new(UpstreamState::default()));
        let connector = Arc::new(ScriptedUpstream {
            auth: self.auth,
            handler: self.handler,
            describe_fields: self.describe_fields,
            state: upstream_state.clone(),
        });
        let ctx = Arc::new(SessionContext {
            store: store.clone() as Arc<dyn Store>,
            auth_cache: Arc::new(AuthCache::new(true, Duration::from_secs(300), 100)),
            connector,
            encryption_key: TEST_KEY,
            capture: self.capture,
            recv_buffer_size: 8192,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        TestEnv {
            store,
            ctx,
            grant_uid,
            upstream_state,
            shutdown_tx,
            shutdown_rx,
        }
    }
}

/// A raw protocol client driving a spawned session over a duplex stream.
pub struct TestClient {
    pub stream: MessageStream<ReadHalf<DuplexStream>>,
    pub w: WriteHalf<DuplexStream>,
}

impl TestClient {
    /// Spawn a session for this env and return the unauthenticated client end.
    pub fn start(env: &TestEnv) -> Self {
        let (ours, theirs) = duplex(1 << 20);
        let ctx = env.ctx.clone();
        let shutdown = env.shutdown_rx.clone();
        tokio::spawn(async move {
            let _ = run_session(ctx, theirs, IpAddr::V4(Ipv4Addr::LOCALHOST), shutdown).await;
        });
        let (r, w) = tokio::io::split(ours);
        TestClient {
            stream: MessageStream::new(r, 8192),
            w,
        }
    }

    pub async fn send_startup(&mut self, user: &str, database: &str) {
        let mut params = StartupParams::new();
        params.add("user", user);
        params.add("database", database);
        params.add("application_name", "psql");
        self.w
            .write_all(params.into_startup_message().as_slice())
            .await
            .unwrap();
    }

    pub async fn next(&mut self) -> Message {
        self.stream.next().await.expect("connection closed")
    }

    pub async fn send_password(&mut self, password: &str) {
        let mut mb = MessageBuilder::new(Tag::PASSWORD_MESSAGE);
        mb.write_str(password);
        self.w.write_all(mb.finish().as_slice()).await.unwrap();
    }

    /// Full happy-path connect; asserts the mandated auth sequence ordering
    /// and returns the authenticated client.
    pub async fn connect(env: &TestEnv) -> Self {
        let mut client = Self::start(env);
        client.send_startup(TEST_USER, TEST_DATABASE).await;
        let challenge = client.next().await;
        assert_eq!(challenge.tag(), Tag::AUTHENTICATION);
        assert_eq!(
            challenge.reader().read_i32(),
            AuthType::ClearText.as_i32()
        );
        client.send_password(TEST_PASSWORD).await;

        // AuthenticationOk, ParameterStatus*, BackendKeyData, ReadyForQuery:
        // this exact order
        let msg = client.next().await;
        assert_eq!(msg.tag(), Tag::AUTHENTICATION);
        assert_eq!(msg.reader().read_i32(), AuthType::Ok.as_i32());
        let mut saw_key_data = false;
        let mut saw_params = 0;
        loop {
            let msg = client.next().await;
            match msg.tag() {
                Tag::PARAMETER_STATUS => {
                    assert!(!saw_key_data, "ParameterStatus after BackendKeyData");
                    saw_params += 1;
                }
                Tag::BACKEND_KEY_DATA => saw_key_data = true,
                Tag::READY_FOR_QUERY => break,
                other => panic!("unexpected {} during startup", other),
            }
        }
        assert!(saw_params >= 1, "expected forwarded ParameterStatus");
        assert!(saw_key_data, "expected BackendKeyData");
        client
    }

    pub async fn send_query(&mut self, sql: &str) {
        let mut mb = MessageBuilder::new(Tag::QUERY);
        mb.write_str(sql);
        self.w.write_all(mb.finish().as_slice()).await.unwrap();
    }

    /// Collect every response message up to and including ReadyForQuery.
    pub async fn read_until_ready(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        loop {
            let msg = self.next().await;
            let done = msg.tag() == Tag::READY_FOR_QUERY;
            out.push(msg);
            if done {
                return out;
            }
        }
    }

    pub async fn send_parse(&mut self, name: &str, sql: &str) {
        let mut mb = MessageBuilder::new(Tag::PARSE);
        mb.write_str(name);
        mb.write_str(sql);
        mb.write_i16(0);
        self.w.write_all(mb.finish().as_slice()).await.unwrap();
    }

    pub async fn send_bind(&mut self, portal: &str, statement: &str, values: &[&str]) {
        let mut mb = MessageBuilder::new(Tag::BIND);
        mb.write_str(portal);
        mb.write_str(statement);
        mb.write_i16(0); // all text
        mb.write_i16(values.len() as i16);
        for value in values {
            mb.write_i32(value.len() as i32);
            mb.write_bytes(value.as_bytes());
        }
        mb.write_i16(0);
        self.w.write_all(mb.finish().as_slice()).await.unwrap();
    }

    pub async fn send_describe_portal(&mut self, portal: &str) {
        let mut mb = MessageBuilder::new(Tag::DESCRIBE);
        mb.write_byte(b'P');
        mb.write_str(portal);
        self.w.write_all(mb.finish().as_slice()).await.unwrap();
    }

    pub async fn send_execute(&mut self, portal: &str) {
        let mut mb = MessageBuilder::new(Tag::EXECUTE);
        mb.write_str(portal);
        mb.write_i32(0);
        self.w.write_all(mb.finish().as_slice()).await.unwrap();
    }

    pub async fn send_sync(&mut self) {
        let msg = MessageBuilder::new(Tag::SYNC).finish();
        self.w.write_all(msg.as_slice()).await.unwrap();
    }

    pub async fn terminate(mut self) {
        let msg = MessageBuilder::new(Tag::TERMINATE).finish();
        let _ = self.w.write_all(msg.as_slice()).await;
        let _ = self.w.shutdown().await;
    }
}

/// Wait until the store has recorded `count` queries, or panic after ~2s.
pub async fn wait_for_queries(store: &MemoryStore, count: usize) {
    for _ in 0..200 {
        if store.queries().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "timed out waiting for {} queries, have {}",
        count,
        store.queries().len()
    );
}
