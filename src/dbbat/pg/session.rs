use std::convert::TryInto;
use std::net::IpAddr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dbbat::auth::{AuthCache, KEY_LEN};
use crate::dbbat::common::{Error, ErrorKind, Result};
use crate::dbbat::pg::intercept::{
    CaptureLimits, Intercept, PendingQuery, Portal, PreparedStatement,
};
use crate::dbbat::pg::message_stream::MessageStream;
use crate::dbbat::pg::protocol::{
    build_application_name, error_codes, hash_md5_password, new_error, new_fatal,
    parse_command_tag, parse_row_description, AuthType, Message, MessageBuilder, PostgresError,
    StartupParams, Tag, CANCEL_REQUEST, GSSENC_REQUEST, PROTOCOL_VERSION, SSL_NOT_ALLOWED,
    SSL_REQUEST,
};
use crate::dbbat::pg::sql::{classify, CopyDirection, StatementInfo};
use crate::dbbat::pg::upstream::{BoxedStream, Stream, UpstreamConnector};
use crate::dbbat::pg::SessionState;
use crate::dbbat::store::{
    AccessControl, Database, FailureReason, Grant, NewQuery, QueryParameters, Store, User,
};

/// Everything a session needs that outlives any one connection.
pub struct SessionContext {
    pub store: Arc<dyn Store>,
    pub auth_cache: Arc<AuthCache>,
    pub connector: Arc<dyn UpstreamConnector>,
    pub encryption_key: [u8; KEY_LEN],
    pub capture: CaptureLimits,
    pub recv_buffer_size: usize,
}

/// Session state shared by the two relay pumps.
struct SessionShared {
    ctx: Arc<SessionContext>,
    intercept: Mutex<Intercept>,
    connection_uid: Option<Uuid>,
    /// grant snapshot taken at authorization time; counters move through the
    /// store, these session-local deltas only gate mid-session quota checks
    grant: Grant,
    used_queries: AtomicU64,
    used_bytes: AtomicU64,
}

struct PolicyViolation {
    reason: FailureReason,
    message: String,
}

/// Drive one client connection end-to-end: startup, client auth, upstream
/// auth bridge, relay, cleanup.
pub async fn run_session<S: Stream>(
    ctx: Arc<SessionContext>,
    client: S,
    peer_ip: IpAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (client_r, mut client_w) = tokio::io::split(client);
    let mut client_stream = MessageStream::new(client_r, ctx.recv_buffer_size);
    let mut state = SessionState::AwaitingStartup;

    // Phase A: startup + client authentication
    let params = match read_startup(&mut client_stream, &mut client_w).await {
        Ok(params) => params,
        Err(e) => {
            if e.is_closed() {
                return Ok(()); // CancelRequest or the client went away
            }
            warn!(error = %e, failure_reason = %FailureReason::ProtocolViolation, "startup failed");
            let msg = new_fatal(error_codes::PROTOCOL_VIOLATION, &e.to_string());
            let _ = client_w.write_all(msg.as_slice()).await;
            return Err(e);
        }
    };
    state.transition(SessionState::ClientAuth)?;

    let (user, database, grant) =
        match authenticate_client(&ctx, &params, &mut client_stream, &mut client_w).await {
            Ok(outcome) => outcome,
            Err(e) => {
                fail_client_auth(&mut client_w, &e).await;
                return Err(e);
            }
        };
    debug!(user = %user.username, database = %database.name, "client authenticated");

    // Phase B: upstream connect + auth bridge
    state.transition(SessionState::UpstreamConnect)?;
    let read_only = grant.has_control(AccessControl::ReadOnly);
    let (mut up_stream, mut up_w) = match open_upstream(&ctx, &database, &params).await {
        Ok(halves) => halves,
        Err(e) => {
            fail_client_auth(&mut client_w, &e).await;
            return Err(e);
        }
    };
    state.transition(SessionState::UpstreamAuth)?;
    let bridged = bridge_upstream_auth(
        &mut up_stream,
        &mut up_w,
        &mut client_w,
        &database,
        &ctx.encryption_key,
        read_only,
    )
    .await;
    let (param_msgs, key_data, tx_status) = match bridged {
        Ok(v) => v,
        Err(e) => {
            // the upstream's own ErrorResponse was already forwarded verbatim
            if e.failure_reason() != Some(FailureReason::UpstreamAuthFailed) {
                fail_client_auth(&mut client_w, &e).await;
            } else {
                warn!(failure_reason = %FailureReason::UpstreamAuthFailed, error = %e, "session rejected");
            }
            return Err(e);
        }
    };

    // The client-side auth sequence, in this exact order; drivers depend on it
    complete_client_startup(&mut client_w, &param_msgs, &key_data, tx_status).await?;
    state.transition(SessionState::Ready)?;

    // Phase C: connection record; on failure log but continue
    let connection_uid = match ctx
        .store
        .create_connection(user.uid, database.uid, peer_ip)
        .await
    {
        Ok(conn) => Some(conn.uid),
        Err(e) => {
            warn!(error = %e, "failed to create connection record");
            None
        }
    };
    info!(
        user = %user.username,
        database = %database.name,
        connection_uid = ?connection_uid,
        read_only,
        "session established"
    );

    // Phase D: concurrent relay pumps
    state.transition(SessionState::Proxying)?;
    let shared = Arc::new(SessionShared {
        ctx: ctx.clone(),
        intercept: Mutex::new(Intercept::new()),
        connection_uid,
        grant,
        used_queries: AtomicU64::new(0),
        used_bytes: AtomicU64::new(0),
    });
    let client_w = Arc::new(tokio::sync::Mutex::new(client_w));

    let result = tokio::select! {
        r = client_pump(&mut client_stream, &mut up_w, client_w.clone(), shared.clone()) => r,
        r = upstream_pump(&mut up_stream, client_w.clone(), shared.clone()) => r,
        _ = shutdown.changed() => {
            debug!("session cancelled by shutdown");
            Ok(())
        }
    };

    // Cleanup always runs; dropping the halves closes both sockets
    state.transition(SessionState::Closing)?;
    if let Some(uid) = connection_uid {
        if let Err(e) = ctx.store.close_connection(uid).await {
            warn!(error = %e, "failed to close connection record");
        }
    }
    match result {
        Err(e) if e.is_closed() => Ok(()),
        other => other,
    }
}

/// Read startup messages until a real StartupMessage arrives: SSLRequest and
/// GSSENCRequest are denied with 'N', CancelRequest closes the connection.
async fn read_startup<R, W>(
    stream: &mut MessageStream<R>,
    client_w: &mut W,
) -> Result<StartupParams>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = stream.next_startup().await?;
        let mut r = msg.reader();
        let version = r.read_i32();
        match version {
            PROTOCOL_VERSION => return StartupParams::from_startup_message(&msg),
            SSL_REQUEST | GSSENC_REQUEST => {
                client_w.write_all(&[SSL_NOT_ALLOWED]).await?;
                client_w.flush().await?;
            }
            CANCEL_REQUEST => return Err(Error::closed()),
            _ => {
                return Err(Error::protocol_error(format!(
                    "unsupported protocol version {}",
                    version
                )))
            }
        }
    }
}

async fn authenticate_client<R, W>(
    ctx: &SessionContext,
    params: &StartupParams,
    stream: &mut MessageStream<R>,
    client_w: &mut W,
) -> Result<(User, Database, Grant)>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let username = params
        .get("user")
        .ok_or_else(|| {
            Error::auth(
                FailureReason::MissingStartupParameter,
                "no PostgreSQL user name specified in startup packet",
            )
        })?
        .to_string();
    let db_name = params
        .get("database")
        .ok_or_else(|| {
            Error::auth(
                FailureReason::MissingStartupParameter,
                "no database name specified in startup packet",
            )
        })?
        .to_string();

    let user = ctx
        .store
        .get_user_by_username(&username)
        .await?
        .ok_or_else(|| Error::auth(FailureReason::InvalidUsername, "authentication failed"))?;
    let database = ctx
        .store
        .get_database_by_name(&db_name)
        .await?
        .ok_or_else(|| {
            Error::auth(
                FailureReason::DatabaseNotFound,
                format!("database \"{}\" does not exist", db_name),
            )
        })?;
    // Missing, expired and revoked grants are indistinguishable here: the
    // store only hands back active grants
    let grant = ctx
        .store
        .get_active_grant(user.uid, database.uid)
        .await?
        .ok_or_else(|| {
            Error::auth(
                FailureReason::NoGrant,
                format!("access to database \"{}\" denied", db_name),
            )
        })?;
    if let Some(cap) = grant.max_query_counts {
        if grant.query_count >= cap {
            return Err(Error::auth(
                FailureReason::QueryQuotaExceeded,
                "query quota exceeded for this grant",
            ));
        }
    }
    if let Some(cap) = grant.max_bytes_transferred {
        if grant.bytes_transferred >= cap {
            return Err(Error::auth(
                FailureReason::BytesQuotaExceeded,
                "byte quota exceeded for this grant",
            ));
        }
    }

    // Challenge. Cleartext is acceptable: the client side is expected to sit
    // on a trusted network or behind a TLS terminator.
    let mut mb = MessageBuilder::new(Tag::AUTHENTICATION);
    mb.write_i32(AuthType::ClearText.as_i32());
    client_w.write_all(mb.finish().as_slice()).await?;
    client_w.flush().await?;

    let msg = stream.next().await?;
    if msg.tag() != Tag::PASSWORD_MESSAGE {
        return Err(Error::protocol_error(format!(
            "expected PasswordMessage, got {}",
            msg.tag()
        )));
    }
    let password = msg.reader().read_str()?.to_string();
    let valid = ctx
        .auth_cache
        .verify_password(&username, &user.password_hash, &password)
        .await?;
    if !valid {
        return Err(Error::auth(
            FailureReason::InvalidPassword,
            format!("password authentication failed for user \"{}\"", username),
        ));
    }
    Ok((user, database, grant))
}

/// Map an auth-phase error onto the FATAL ErrorResponse the client sees, and
/// log its failure_reason.
async fn fail_client_auth<W: AsyncWrite + Unpin>(client_w: &mut W, err: &Error) {
    let (code, message) = match err.kind() {
        ErrorKind::AuthError(reason, msg) => {
            warn!(failure_reason = %reason, "session rejected");
            let code = match reason {
                FailureReason::InvalidPassword => error_codes::INVALID_PASSWORD,
                FailureReason::SaslNotSupported => error_codes::FEATURE_NOT_SUPPORTED,
                FailureReason::UpstreamConnFailed | FailureReason::UpstreamReadOnlyMode => {
                    error_codes::CANNOT_CONNECT_NOW
                }
                _ => error_codes::INVALID_AUTHORIZATION_SPECIFICATION,
            };
            (code, msg.clone())
        }
        _ => {
            warn!(error = %err, "session failed during startup");
            (
                error_codes::CONNECTION_FAILURE,
                "internal error".to_string(),
            )
        }
    };
    let msg = new_fatal(code, &message);
    let _ = client_w.write_all(msg.as_slice()).await;
    let _ = client_w.flush().await;
}

type UpstreamHalves = (MessageStream<ReadHalf<BoxedStream>>, WriteHalf<BoxedStream>);

async fn open_upstream(
    ctx: &SessionContext,
    database: &Database,
    client_params: &StartupParams,
) -> Result<UpstreamHalves> {
    let upstream = ctx.connector.connect(database).await?;
    let (up_r, mut up_w) = tokio::io::split(upstream);
    let up_stream = MessageStream::new(up_r, ctx.recv_buffer_size);

    let mut params = StartupParams::new();
    params.add("user", &database.username);
    params.add("database", &database.database_name);
    let app_name = build_application_name(
        env!("CARGO_PKG_VERSION"),
        client_params.get("application_name").unwrap_or(""),
    );
    params.add("application_name", &app_name);
    params.add("client_encoding", "UTF8");
    up_w.write_all(params.into_startup_message().as_slice())
        .await?;
    up_w.flush().await?;
    Ok((up_stream, up_w))
}

/// Run the upstream authentication loop, buffering ParameterStatus and
/// BackendKeyData for later replay to the client, then apply session
/// read-only enforcement. Returns the buffered messages and the transaction
/// status byte of the final ReadyForQuery.
async fn bridge_upstream_auth<W>(
    up_stream: &mut MessageStream<ReadHalf<BoxedStream>>,
    up_w: &mut WriteHalf<BoxedStream>,
    client_w: &mut W,
    database: &Database,
    encryption_key: &[u8; KEY_LEN],
    read_only: bool,
) -> Result<(Vec<Message>, Option<Message>, u8)>
where
    W: AsyncWrite + Unpin,
{
    let password = database.decrypt_password(encryption_key)?;
    let mut param_msgs: Vec<Message> = Vec::new();
    let mut key_data: Option<Message> = None;
    let mut tx_status;

    loop {
        let msg = up_stream.next().await?;
        match msg.tag() {
            Tag::AUTHENTICATION => {
                let mut r = msg.reader();
                match AuthType::parse(r.read_i32())? {
                    AuthType::Ok => (),
                    AuthType::ClearText => {
                        send_password_message(up_w, &password).await?;
                    }
                    AuthType::MD5 => {
                        let salt: [u8; 4] = r.read_bytes(4)?.try_into()?;
                        let hashed =
                            hash_md5_password(&database.username, &password, &salt);
                        send_password_message(up_w, &hashed).await?;
                    }
                    AuthType::SASL => {
                        return Err(Error::auth(
                            FailureReason::SaslNotSupported,
                            "upstream requested SASL authentication, which is not supported",
                        ));
                    }
                    other => {
                        return Err(Error::auth(
                            FailureReason::UpstreamAuthFailed,
                            format!("upstream requested unsupported authentication {}", other),
                        ));
                    }
                }
            }
            Tag::PARAMETER_STATUS => param_msgs.push(msg),
            Tag::BACKEND_KEY_DATA => key_data = Some(msg),
            Tag::NOTICE_RESPONSE => {
                let notice = PostgresError::parse(&msg)?;
                debug!(%notice, "notice during upstream auth");
            }
            Tag::ERROR_RESPONSE => {
                // let the client see the real error before we close
                client_w.write_all(msg.as_slice()).await?;
                client_w.flush().await?;
                let err = PostgresError::parse(&msg)?;
                return Err(Error::auth(
                    FailureReason::UpstreamAuthFailed,
                    format!("upstream authentication failed: {}", err.message),
                ));
            }
            Tag::READY_FOR_QUERY => {
                tx_status = msg.reader().read_byte();
                break;
            }
            other => {
                return Err(Error::protocol_error(format!(
                    "unexpected {} message during upstream authentication",
                    other
                )));
            }
        }
    }

    // Authoritative read-only enforcement; the SQL classifier only catches
    // the obvious bypasses
    if read_only {
        tx_status = set_session_read_only(up_stream, up_w).await?;
    }
    Ok((param_msgs, key_data, tx_status))
}

async fn send_password_message(up_w: &mut WriteHalf<BoxedStream>, password: &str) -> Result<()> {
    let mut mb = MessageBuilder::new(Tag::PASSWORD_MESSAGE);
    mb.write_str(password);
    up_w.write_all(mb.finish().as_slice()).await?;
    up_w.flush().await?;
    Ok(())
}

async fn set_session_read_only(
    up_stream: &mut MessageStream<ReadHalf<BoxedStream>>,
    up_w: &mut WriteHalf<BoxedStream>,
) -> Result<u8> {
    let mut mb = MessageBuilder::new(Tag::QUERY);
    mb.write_str("SET SESSION default_transaction_read_only = on;");
    up_w.write_all(mb.finish().as_slice()).await?;
    up_w.flush().await?;

    let mut failure: Option<PostgresError> = None;
    loop {
        let msg = up_stream.next().await?;
        match msg.tag() {
            Tag::ERROR_RESPONSE => failure = Some(PostgresError::parse(&msg)?),
            Tag::READY_FOR_QUERY => {
                let status = msg.reader().read_byte();
                return match failure {
                    Some(err) => Err(Error::auth(
                        FailureReason::UpstreamReadOnlyMode,
                        format!("could not enable read-only mode upstream: {}", err.message),
                    )),
                    None => Ok(status),
                };
            }
            _ => (), // CommandComplete, ParameterStatus, notices
        }
    }
}

/// Emit the client-side auth sequence in exactly this order: AuthenticationOk,
/// buffered ParameterStatus messages in receive order, BackendKeyData,
/// ReadyForQuery. One write batch, atomic with respect to client reads.
async fn complete_client_startup<W: AsyncWrite + Unpin>(
    client_w: &mut W,
    param_msgs: &[Message],
    key_data: &Option<Message>,
    tx_status: u8,
) -> Result<()> {
    let mut mb = MessageBuilder::new(Tag::AUTHENTICATION);
    mb.write_i32(AuthType::Ok.as_i32());
    client_w.write_all(mb.finish().as_slice()).await?;
    for msg in param_msgs {
        client_w.write_all(msg.as_slice()).await?;
    }
    if let Some(msg) = key_data {
        client_w.write_all(msg.as_slice()).await?;
    }
    let mut mb = MessageBuilder::new(Tag::READY_FOR_QUERY);
    mb.write_byte(tx_status);
    client_w.write_all(mb.finish().as_slice()).await?;
    client_w.flush().await?;
    Ok(())
}

fn check_policy(
    stmts: &[StatementInfo],
    controls: &[AccessControl],
) -> std::result::Result<(), PolicyViolation> {
    let read_only = controls.contains(&AccessControl::ReadOnly);
    let block_ddl = controls.contains(&AccessControl::BlockDdl);
    let block_copy = controls.contains(&AccessControl::BlockCopy);

    // any statement tripping a rule rejects the whole batch
    for stmt in stmts {
        if stmt.password_change {
            return Err(PolicyViolation {
                reason: FailureReason::WrongAccessLevel,
                message: "changing passwords through the proxy is not allowed".to_string(),
            });
        }
        if block_copy && stmt.copy.is_some() {
            return Err(PolicyViolation {
                reason: FailureReason::WrongAccessLevel,
                message: "COPY is not permitted for this grant".to_string(),
            });
        }
        if (block_ddl || read_only) && stmt.is_ddl() {
            return Err(PolicyViolation {
                reason: FailureReason::WrongAccessLevel,
                message: if block_ddl {
                    "DDL statements are not permitted for this grant".to_string()
                } else {
                    "DDL statements are not permitted with read-only access".to_string()
                },
            });
        }
        if read_only {
            if stmt.read_only_bypass {
                return Err(PolicyViolation {
                    reason: FailureReason::WrongAccessLevel,
                    message: "changing the read-only state of the session is not allowed"
                        .to_string(),
                });
            }
            if stmt.is_write() || stmt.is_dcl() {
                return Err(PolicyViolation {
                    reason: FailureReason::WrongAccessLevel,
                    message: "write operations are not permitted with read-only access"
                        .to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Mid-session quota gate: grant snapshot plus what this session has used.
/// The query in flight always finishes; the next one fails here.
fn check_quota(shared: &SessionShared) -> std::result::Result<(), PolicyViolation> {
    let grant = &shared.grant;
    if let Some(cap) = grant.max_query_counts {
        if grant.query_count + shared.used_queries.load(Relaxed) >= cap {
            return Err(PolicyViolation {
                reason: FailureReason::QueryQuotaExceeded,
                message: "query quota exceeded for this grant".to_string(),
            });
        }
    }
    if let Some(cap) = grant.max_bytes_transferred {
        if grant.bytes_transferred + shared.used_bytes.load(Relaxed) >= cap {
            return Err(PolicyViolation {
                reason: FailureReason::BytesQuotaExceeded,
                message: "byte quota exceeded for this grant".to_string(),
            });
        }
    }
    Ok(())
}

/// Policy rejections still leave an audit trail: a Query row with the error
/// set and no captured rows, counted against the grant.
async fn record_rejected(shared: &SessionShared, sql: &str, violation: &PolicyViolation) {
    warn!(failure_reason = %violation.reason, sql, "query rejected by policy");
    let query = NewQuery {
        sql_text: sql.to_string(),
        parameters: None,
        executed_at: chrono::Utc::now(),
        duration_ms: 0,
        rows_affected: None,
        error: Some(violation.message.clone()),
        copy_format: None,
        copy_direction: None,
        truncated: false,
        data_bytes: 0,
    };
    if let Some(uid) = shared.connection_uid {
        if let Err(e) = shared.ctx.store.record_query(uid, query, Vec::new()).await {
            warn!(error = %e, "failed to record rejected query");
        }
    }
    if let Err(e) = shared
        .ctx
        .store
        .increment_grant_usage(shared.grant.uid, 1, 0)
        .await
    {
        warn!(error = %e, "failed to increment grant usage");
    }
    shared.used_queries.fetch_add(1, Relaxed);
}

/// Synthesized policy error: severity ERROR, SQLSTATE 42000, optionally
/// followed by ReadyForQuery('I') (Simple Query only; Extended Query gets its
/// ReadyForQuery at Sync).
async fn send_policy_error<W: AsyncWrite + Unpin>(
    client_w: &Arc<tokio::sync::Mutex<W>>,
    violation: &PolicyViolation,
    with_ready: bool,
) -> Result<()> {
    let err = new_error(
        error_codes::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION,
        &violation.message,
    );
    let mut w = client_w.lock().await;
    w.write_all(err.as_slice()).await?;
    if with_ready {
        let mut mb = MessageBuilder::new(Tag::READY_FOR_QUERY);
        mb.write_byte(b'I');
        w.write_all(mb.finish().as_slice()).await?;
    }
    w.flush().await?;
    Ok(())
}

async fn send_ready_for_query<W: AsyncWrite + Unpin>(
    client_w: &Arc<tokio::sync::Mutex<W>>,
) -> Result<()> {
    let mut mb = MessageBuilder::new(Tag::READY_FOR_QUERY);
    mb.write_byte(b'I');
    let mut w = client_w.lock().await;
    w.write_all(mb.finish().as_slice()).await?;
    w.flush().await?;
    Ok(())
}

/// Client→upstream pump: interpose on Query/Parse/Bind/Execute/Close/COPY,
/// forward everything else verbatim.
async fn client_pump<R, W>(
    stream: &mut MessageStream<R>,
    up_w: &mut WriteHalf<BoxedStream>,
    client_w: Arc<tokio::sync::Mutex<W>>,
    shared: Arc<SessionShared>,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // After an extended-protocol rejection the server must act as though it
    // errored: discard the rest of the batch until Sync
    let mut skip_until_sync = false;
    let mut forwarded_since_sync = false;

    loop {
        let msg = stream.next().await?;
        match msg.tag() {
            Tag::TERMINATE => return Ok(()),
            Tag::QUERY => {
                skip_until_sync = false;
                let sql = msg.reader().read_str()?.to_string();
                let verdict = check_policy(&classify(&sql), &shared.grant.controls)
                    .and_then(|_| check_quota(&shared));
                if let Err(violation) = verdict {
                    record_rejected(&shared, &sql, &violation).await;
                    send_policy_error(&client_w, &violation, true).await?;
                    continue; // upstream never sees the statement
                }
                shared.intercept.lock()?.begin_simple(sql);
            }
            Tag::PARSE => {
                if skip_until_sync {
                    continue;
                }
                let mut r = msg.reader();
                let name = r.read_str()?.to_string();
                let sql = r.read_str()?.to_string();
                let num_oids = r.read_i16();
                let mut type_oids = Vec::with_capacity(num_oids.max(0) as usize);
                for _ in 0..num_oids {
                    type_oids.push(r.read_i32());
                }
                r.error()?;
                if let Err(violation) = check_policy(&classify(&sql), &shared.grant.controls) {
                    record_rejected(&shared, &sql, &violation).await;
                    send_policy_error(&client_w, &violation, false).await?;
                    skip_until_sync = true;
                    continue;
                }
                shared
                    .intercept
                    .lock()?
                    .prepared
                    .insert(name, PreparedStatement { sql, type_oids });
            }
            Tag::BIND => {
                if skip_until_sync {
                    continue;
                }
                let (portal, statement, parameters) = decode_bind(&msg, &shared)?;
                shared.intercept.lock()?.portals.insert(
                    portal,
                    Portal {
                        statement,
                        parameters,
                    },
                );
            }
            Tag::EXECUTE => {
                if skip_until_sync {
                    continue;
                }
                let portal_name = msg.reader().read_str()?.to_string();
                let resolved = {
                    let intercept = shared.intercept.lock()?;
                    intercept.portals.get(&portal_name).and_then(|portal| {
                        intercept
                            .prepared
                            .get(&portal.statement)
                            .map(|stmt| (stmt.sql.clone(), portal.parameters.clone()))
                    })
                };
                if let Some((sql, parameters)) = resolved {
                    if let Err(violation) = check_quota(&shared) {
                        record_rejected(&shared, &sql, &violation).await;
                        send_policy_error(&client_w, &violation, false).await?;
                        skip_until_sync = true;
                        continue;
                    }
                    shared.intercept.lock()?.begin_execute(sql, parameters);
                }
                // unknown portal: forward anyway, the upstream reports the error
            }
            Tag::CLOSE => {
                if skip_until_sync {
                    continue;
                }
                let mut r = msg.reader();
                let kind = r.read_byte();
                let name = r.read_str()?;
                let mut intercept = shared.intercept.lock()?;
                match kind {
                    b'S' => intercept.close_statement(name),
                    b'P' => intercept.close_portal(name),
                    _ => (),
                }
            }
            Tag::SYNC => {
                if skip_until_sync {
                    skip_until_sync = false;
                    if !forwarded_since_sync {
                        // nothing of the batch reached the upstream, so the
                        // ReadyForQuery has to come from us
                        send_ready_for_query(&client_w).await?;
                        continue;
                    }
                }
                forwarded_since_sync = false;
                up_w.write_all(msg.as_slice()).await?;
                up_w.flush().await?;
                continue;
            }
            Tag::COPY_DATA => {
                let mut r = msg.reader();
                let payload = r.read_to_end();
                shared
                    .intercept
                    .lock()?
                    .on_copy_data(payload, true, &shared.ctx.capture);
            }
            Tag::COPY_DONE | Tag::COPY_FAIL => (),
            _ => {
                if skip_until_sync {
                    continue;
                }
            }
        }
        up_w.write_all(msg.as_slice()).await?;
        up_w.flush().await?;
        forwarded_since_sync = true;
    }
}

/// Upstream→client pump: observe result metadata, capture rows, settle and
/// persist queries on ReadyForQuery, forward everything.
async fn upstream_pump<W>(
    up_stream: &mut MessageStream<ReadHalf<BoxedStream>>,
    client_w: Arc<tokio::sync::Mutex<W>>,
    shared: Arc<SessionShared>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = up_stream.next().await?;
        match msg.tag() {
            Tag::ROW_DESCRIPTION => {
                let fields = parse_row_description(&msg)?;
                shared.intercept.lock()?.on_row_description(fields);
            }
            Tag::DATA_ROW => {
                shared
                    .intercept
                    .lock()?
                    .on_data_row(&msg, &shared.ctx.capture)?;
            }
            Tag::COMMAND_COMPLETE => {
                let tag = parse_command_tag(&msg)?;
                shared.intercept.lock()?.on_command_complete(&tag);
            }
            Tag::EMPTY_QUERY => {
                shared.intercept.lock()?.on_command_complete("");
            }
            Tag::COPY_IN_RESPONSE => {
                let binary = msg.reader().read_byte() == 1;
                shared
                    .intercept
                    .lock()?
                    .on_copy_response(CopyDirection::In, binary);
            }
            Tag::COPY_OUT_RESPONSE => {
                let binary = msg.reader().read_byte() == 1;
                shared
                    .intercept
                    .lock()?
                    .on_copy_response(CopyDirection::Out, binary);
            }
            Tag::COPY_DATA => {
                let mut r = msg.reader();
                let payload = r.read_to_end();
                shared
                    .intercept
                    .lock()?
                    .on_copy_data(payload, false, &shared.ctx.capture);
            }
            Tag::COPY_DONE => {
                shared.intercept.lock()?.on_copy_done();
            }
            Tag::ERROR_RESPONSE => {
                let err = PostgresError::parse(&msg)?;
                shared.intercept.lock()?.on_error(&err);
            }
            Tag::READY_FOR_QUERY => {
                // persistence is committed before the ReadyForQuery that
                // reports the queries to the client
                let finished = shared.intercept.lock()?.take_finished();
                persist_finished(&shared, finished).await;
            }
            _ => (),
        }
        let mut w = client_w.lock().await;
        w.write_all(msg.as_slice()).await?;
        w.flush().await?;
    }
}

async fn persist_finished(shared: &SessionShared, finished: Vec<PendingQuery>) {
    for pending in finished {
        let (query, rows) = pending.finish();
        let data_bytes = query.data_bytes;
        if let Some(uid) = shared.connection_uid {
            if let Err(e) = shared.ctx.store.record_query(uid, query, rows).await {
                // never fake success to the client, never tear the session down
                warn!(error = %e, "failed to record query");
            }
        }
        if let Err(e) = shared
            .ctx
            .store
            .increment_grant_usage(shared.grant.uid, 1, data_bytes)
            .await
        {
            warn!(error = %e, "failed to increment grant usage");
        }
        shared.used_queries.fetch_add(1, Relaxed);
        shared.used_bytes.fetch_add(data_bytes, Relaxed);
    }
}

/// Decode a Bind message into its portal name, statement name, and the bound
/// parameters we persist with the query.
fn decode_bind(msg: &Message, shared: &SessionShared) -> Result<(String, String, QueryParameters)> {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    let mut r = msg.reader();
    let portal = r.read_str()?.to_string();
    let statement = r.read_str()?.to_string();
    let num_formats = r.read_i16();
    let mut format_codes = Vec::with_capacity(num_formats.max(0) as usize);
    for _ in 0..num_formats {
        format_codes.push(r.read_i16());
    }
    let num_params = r.read_i16();
    let mut values = Vec::with_capacity(num_params.max(0) as usize);
    for i in 0..num_params as usize {
        let len = r.read_i32();
        if len < 0 {
            values.push(serde_json::Value::Null);
            continue;
        }
        let raw = r.read_bytes(len as u32)?;
        let format = match format_codes.len() {
            0 => 0,
            1 => format_codes[0],
            _ => format_codes.get(i).copied().unwrap_or(0),
        };
        let value = if format == 0 {
            match std::str::from_utf8(raw) {
                Ok(s) => serde_json::Value::String(s.to_string()),
                Err(_) => serde_json::Value::String(BASE64.encode(raw)),
            }
        } else {
            serde_json::Value::String(BASE64.encode(raw))
        };
        values.push(value);
    }
    r.error()?;

    let type_oids = shared
        .intercept
        .lock()?
        .prepared
        .get(&statement)
        .map(|stmt| stmt.type_oids.clone())
        .unwrap_or_default();
    Ok((
        portal,
        statement,
        QueryParameters {
            values,
            format_codes,
            type_oids,
        },
    ))
}
