use crate::directory::Directory;
use crate::error::{result_code, LdapError};
use crate::ldap_handler::LdapHandler;
use crate::ldap_protocol::{
    encode_ldap_message, encode_ldap_result, parse_ldap_message, parse_ldap_message_header, BerWriter,
    BindAuthentication, LdapMessage, LdapResult, ProtocolOp, LDAP_TAG_ADD_RESPONSE, LDAP_TAG_BIND_RESPONSE,
    LDAP_TAG_COMPARE_RESPONSE, LDAP_TAG_DEL_RESPONSE, LDAP_TAG_EXTENDED_RESPONSE, LDAP_TAG_MODIFY_DN_RESPONSE,
    LDAP_TAG_MODIFY_RESPONSE, LDAP_TAG_SEARCH_RESULT_DONE,
};
use crate::metrics::Metrics;
use anyhow::{Context, Result};
use bytes::BytesMut;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Top-level LDAP message is always a SEQUENCE (BER tag 0x30).
const LDAP_MESSAGE_SEQUENCE_TAG: u8 = 0x30;

/// Larger PDUs are treated as a framing error.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Result of trying to parse one LDAP message from the buffer.
enum TryParseResult {
    /// Not enough data yet.
    Incomplete,
    Message(LdapMessage),
    /// A whole PDU of `consume` bytes was dropped because it failed to decode.
    ParseError {
        message_id: i32,
        response_tag: u8,
        consume: usize,
    },
}

/// What the connection loop does after one request.
#[derive(Debug)]
enum Reply {
    /// One or more encoded LDAPMessages.
    Send(Vec<u8>),
    Nothing,
    Close,
}

/// LDAP listener serving a [`Directory`] through an [`LdapHandler`].
pub struct LdapServer {
    listener: TcpListener,
    handler: Arc<LdapHandler>,
    metrics: Arc<Metrics>,
}

impl LdapServer {
    /// Binds `listen_url` (`ldap://host:port`, `ldap://:port`). Port 0 picks a free port.
    pub async fn bind(listen_url: &str, handler: Arc<LdapHandler>, metrics: Arc<Metrics>) -> Result<Self> {
        let addr = parse_listen_url(listen_url)?;
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        Ok(Self {
            listener,
            handler,
            metrics,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Failed to read listener address")
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves. Connections already accepted keep running.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        info!("fakeldap listening on ldap://{}", addr);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("fakeldap on {} stopped listening", addr);
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("New connection from {}", peer_addr);
                        let handler = Arc::clone(&self.handler);
                        let metrics = Arc::clone(&self.metrics);
                        metrics.inc_connections();

                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, peer_addr, handler, metrics).await {
                                error!("Error handling client {}: {:#}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    /// Runs the server on a background task. Used by test suites that need a live endpoint.
    pub fn spawn(self) -> Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        let directory = Arc::clone(self.handler.directory());
        let (shutdown, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(self.run_until(async {
            let _ = stopped.await;
        }));
        Ok(ServerHandle {
            local_addr,
            directory,
            shutdown,
            task,
        })
    }
}

/// A running server started with [`LdapServer::spawn`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    directory: Arc<Directory>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("ldap://{}", self.local_addr)
    }

    /// The served store, for seeding entries directly.
    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    /// Stops listening and waits for the accept loop to exit.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task.await.context("LDAP server task panicked")?
    }
}

pub(crate) fn parse_listen_url(url: &str) -> Result<SocketAddr> {
    let url = url
        .strip_prefix("ldap://")
        .ok_or_else(|| anyhow::anyhow!("Invalid URL scheme, expected ldap://"))?;

    // Remove leading slashes if present
    let url = url.trim_start_matches('/');

    if let Some(port) = url.strip_prefix(':') {
        // Just port specified, bind to all interfaces
        let port: u16 = port.parse().context("Invalid port number")?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    } else {
        url.parse()
            .with_context(|| format!("Failed to parse address: {}", url))
    }
}

async fn handle_client(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<LdapHandler>,
    metrics: Arc<Metrics>,
) -> Result<()> {
    debug!("Handling client connection from {}", peer_addr);
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        // Answer every complete message already buffered, in order.
        loop {
            let parsed = match try_parse_message(&mut buffer) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Unframeable data from {}: {}; closing connection", peer_addr, e);
                    metrics.inc_parse_error();
                    let notice = encode_error_response(
                        0,
                        LDAP_TAG_EXTENDED_RESPONSE,
                        result_code::PROTOCOL_ERROR,
                        "",
                        "Invalid LDAP message framing",
                    )?;
                    let _ = stream.write_all(&notice).await;
                    return Ok(());
                }
            };

            match parsed {
                TryParseResult::Incomplete => break,
                TryParseResult::ParseError {
                    message_id,
                    response_tag,
                    consume,
                } => {
                    metrics.inc_parse_error();
                    debug!(
                        "Parse error from {} (message_id={}, dropped {} bytes); sending protocolError",
                        peer_addr, message_id, consume
                    );
                    let err_data = encode_error_response(
                        message_id,
                        response_tag,
                        result_code::PROTOCOL_ERROR,
                        "",
                        "Failed to parse LDAP message",
                    )?;
                    stream
                        .write_all(&err_data)
                        .await
                        .with_context(|| format!("Failed to send parse error to {}", peer_addr))?;
                }
                TryParseResult::Message(message) => {
                    match process_ldap_message(&handler, &metrics, message, &peer_addr)? {
                        Reply::Send(data) => {
                            stream
                                .write_all(&data)
                                .await
                                .with_context(|| format!("Failed to send response to {}", peer_addr))?;
                        }
                        Reply::Nothing => {}
                        Reply::Close => {
                            debug!("Client {} unbound", peer_addr);
                            let _ = stream.shutdown().await;
                            return Ok(());
                        }
                    }
                }
            }
        }

        let n = stream
            .read_buf(&mut buffer)
            .await
            .with_context(|| format!("Failed to read from {}", peer_addr))?;
        if n == 0 {
            debug!("Client {} disconnected", peer_addr);
            return Ok(());
        }
    }
}

/// Operation label for metrics. None for unbind and abandon, which are not counted.
fn metric_op_name(op: &ProtocolOp) -> Option<&'static str> {
    match op {
        ProtocolOp::BindRequest(_) => Some("bind"),
        ProtocolOp::SearchRequest(_) => Some("search"),
        ProtocolOp::ModifyRequest(_) => Some("modify"),
        ProtocolOp::AddRequest(_) => Some("add"),
        ProtocolOp::DelRequest(_) => Some("delete"),
        ProtocolOp::UnbindRequest | ProtocolOp::AbandonRequest(_) => None,
        _ => Some("other"),
    }
}

fn response_tag_for_request(request_tag: u8) -> u8 {
    match request_tag {
        0x60 => LDAP_TAG_BIND_RESPONSE,      // BindRequest
        0x63 => LDAP_TAG_SEARCH_RESULT_DONE, // SearchRequest
        0x66 => LDAP_TAG_MODIFY_RESPONSE,    // ModifyRequest
        0x68 => LDAP_TAG_ADD_RESPONSE,       // AddRequest
        0x4A => LDAP_TAG_DEL_RESPONSE,       // DelRequest
        0x6C => LDAP_TAG_MODIFY_DN_RESPONSE, // ModifyDNRequest
        0x6E => LDAP_TAG_COMPARE_RESPONSE,   // CompareRequest
        // ExtendedResponse doubles as the unsolicited notification for anything else
        _ => LDAP_TAG_EXTENDED_RESPONSE,
    }
}

/// Response tag for a decoded request. None when the request gets no response.
fn response_tag_for_protocol_op(op: &ProtocolOp) -> Option<u8> {
    match op {
        ProtocolOp::BindRequest(_) => Some(LDAP_TAG_BIND_RESPONSE),
        ProtocolOp::SearchRequest(_) => Some(LDAP_TAG_SEARCH_RESULT_DONE),
        ProtocolOp::ModifyRequest(_) => Some(LDAP_TAG_MODIFY_RESPONSE),
        ProtocolOp::AddRequest(_) => Some(LDAP_TAG_ADD_RESPONSE),
        ProtocolOp::DelRequest(_) => Some(LDAP_TAG_DEL_RESPONSE),
        ProtocolOp::Unsupported(tag) => Some(response_tag_for_request(*tag)),
        ProtocolOp::UnbindRequest | ProtocolOp::AbandonRequest(_) => None,
        _ => Some(LDAP_TAG_EXTENDED_RESPONSE),
    }
}

/// Frames one LDAPMessage off the front of `buffer` and decodes it.
/// Err means the stream can no longer be framed and the connection should close.
fn try_parse_message(buffer: &mut BytesMut) -> Result<TryParseResult> {
    if buffer.len() < 2 {
        return Ok(TryParseResult::Incomplete);
    }
    if buffer[0] != LDAP_MESSAGE_SEQUENCE_TAG {
        anyhow::bail!("Expected SEQUENCE (0x30), got: 0x{:02X}", buffer[0]);
    }

    let length_byte = buffer[1];
    let total_length = if (length_byte & 0x80) == 0 {
        // Short form
        2 + length_byte as usize
    } else {
        // Long form
        let length_bytes = (length_byte & 0x7F) as usize;
        if length_bytes == 0 || length_bytes > 4 {
            anyhow::bail!("Invalid length encoding");
        }
        if buffer.len() < 2 + length_bytes {
            return Ok(TryParseResult::Incomplete);
        }
        let length = buffer[2..2 + length_bytes]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        2 + length_bytes + length
    };

    if total_length > MAX_MESSAGE_SIZE {
        anyhow::bail!("LDAP message of {} bytes exceeds limit of {}", total_length, MAX_MESSAGE_SIZE);
    }
    if buffer.len() < total_length {
        return Ok(TryParseResult::Incomplete);
    }

    let pdu = buffer.split_to(total_length);
    match parse_ldap_message(&pdu) {
        Ok(message) => Ok(TryParseResult::Message(message)),
        Err(e) => {
            let hex_preview: String = pdu
                .iter()
                .take(64)
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ");
            warn!("Failed to parse LDAP message: {:#} (first 64 bytes: {})", e, hex_preview);
            let (message_id, request_tag) = parse_ldap_message_header(&pdu).unwrap_or((0, 0));
            Ok(TryParseResult::ParseError {
                message_id,
                response_tag: response_tag_for_request(request_tag),
                consume: total_length,
            })
        }
    }
}

fn process_ldap_message(
    handler: &LdapHandler,
    metrics: &Metrics,
    message: LdapMessage,
    peer_addr: &SocketAddr,
) -> Result<Reply> {
    let message_id = message.message_id;

    match &message.protocol_op {
        ProtocolOp::UnbindRequest => return Ok(Reply::Close),
        ProtocolOp::AbandonRequest(target) => {
            // Every operation completes before the next is read; nothing is left to abandon.
            debug!("Abandon of message {} from {} ignored", target, peer_addr);
            return Ok(Reply::Nothing);
        }
        _ => {}
    }

    let op = metric_op_name(&message.protocol_op);
    let response_tag = response_tag_for_protocol_op(&message.protocol_op).unwrap_or(LDAP_TAG_EXTENDED_RESPONSE);

    // No control is recognised, so any critical one must be refused.
    if let Some(control) = message.controls.iter().flatten().find(|c| c.critical) {
        warn!(
            "Rejecting message {} from {}: unsupported critical control {}",
            message_id, peer_addr, control.ctype
        );
        metrics.inc_error(op.unwrap_or("other"));
        let err = LdapError::UnavailableCriticalExtension(format!(
            "Critical control {} is not supported",
            control.ctype
        ));
        return Ok(Reply::Send(response_message(message_id, response_tag, error_result(&err))?));
    }

    let started = Instant::now();
    let mut out = Vec::new();
    let result = match message.protocol_op {
        ProtocolOp::BindRequest(req) => match req.authentication {
            BindAuthentication::Simple(password) => handler.handle_bind(req.version, &req.name, &password),
            BindAuthentication::Sasl { mechanism, .. } => Err(LdapError::AuthMethodNotSupported(format!(
                "SASL mechanism {} is not supported",
                mechanism
            ))),
        },
        ProtocolOp::SearchRequest(req) => {
            let mut entries = Vec::new();
            let result = handler
                .handle_search(&req.base_object, req.scope, req.deref_aliases, &req.filter, |entry| {
                    entries.push(entry)
                })
                .map(|_| ());
            for entry in entries {
                out.extend_from_slice(&encode_ldap_message(&LdapMessage {
                    message_id,
                    protocol_op: ProtocolOp::SearchResultEntry(entry),
                    controls: None,
                })?);
            }
            result
        }
        ProtocolOp::ModifyRequest(req) => handler.handle_modify(&req.object, &req.changes),
        ProtocolOp::AddRequest(req) => handler.handle_add(&req.entry, &req.attributes),
        ProtocolOp::DelRequest(req) => handler.handle_delete(&req.entry),
        ProtocolOp::Unsupported(tag) => Err(LdapError::UnwillingToPerform(format!(
            "Operation 0x{:02X} is not supported",
            tag
        ))),
        _ => Err(LdapError::ProtocolError("Unexpected PDU from client".to_string())),
    };

    if let Some(op) = op {
        metrics.observe_duration(op, started.elapsed());
    }
    let ldap_result = match &result {
        Ok(()) => {
            if let Some(op) = op {
                metrics.inc_request(op);
            }
            LdapResult::success()
        }
        Err(e) => {
            metrics.inc_error(op.unwrap_or("other"));
            warn!(
                "{} request {} from {} failed: code={} {}",
                op.unwrap_or("other"),
                message_id,
                peer_addr,
                e.result_code(),
                e
            );
            error_result(e)
        }
    };

    out.extend_from_slice(&response_message(message_id, response_tag, ldap_result)?);
    Ok(Reply::Send(out))
}

fn error_result(err: &LdapError) -> LdapResult {
    LdapResult::error(err.result_code(), &err.to_string())
}

/// Encodes the final response of an operation.
fn response_message(message_id: i32, response_tag: u8, result: LdapResult) -> Result<Vec<u8>> {
    let protocol_op = match response_tag {
        LDAP_TAG_BIND_RESPONSE => ProtocolOp::BindResponse(result),
        LDAP_TAG_SEARCH_RESULT_DONE => ProtocolOp::SearchResultDone(result),
        LDAP_TAG_MODIFY_RESPONSE => ProtocolOp::ModifyResponse(result),
        LDAP_TAG_ADD_RESPONSE => ProtocolOp::AddResponse(result),
        LDAP_TAG_DEL_RESPONSE => ProtocolOp::DelResponse(result),
        _ => {
            return encode_error_response(
                message_id,
                response_tag,
                result.result_code,
                &result.matched_dn,
                &result.diagnostic_message,
            )
        }
    };
    encode_ldap_message(&LdapMessage {
        message_id,
        protocol_op,
        controls: None,
    })
}

/// LDAPMessage carrying a bare LDAPResult under any response tag.
fn encode_error_response(
    message_id: i32,
    response_tag: u8,
    result_code: i32,
    matched_dn: &str,
    diagnostic_message: &str,
) -> Result<Vec<u8>> {
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();
    writer.write_integer(message_id);
    encode_ldap_result(
        &mut writer,
        response_tag,
        &LdapResult {
            result_code,
            matched_dn: matched_dn.to_string(),
            diagnostic_message: diagnostic_message.to_string(),
        },
    );
    writer.end_sequence(seq_start);
    Ok(writer.into_vec())
}
