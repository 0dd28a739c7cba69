//! WebSocket connection
//!
//! The per-connection state machine. One tokio task runs the reader loop:
//! it performs the opening handshake, dispatches inbound frames, answers
//! pings, drives the closing handshake and delivers events to the
//! handler. Writes from any task serialize on the connection's write-half
//! mutex. Read deadlines come from the configuration; forced teardown is
//! signalled out-of-band and raced against every read.

use crate::handler::ConnectionHandler;
use crate::reader::MessageReader;
use crate::registry::ConnectionRegistry;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::timeout;
use url::Url;
use wavesock_core::error::{Error, ProtocolError, Result};
use wavesock_core::frame::{self, FrameHeader};
use wavesock_core::handshake;
use wavesock_core::http::{RequestHead, ResponseHead};
use wavesock_core::protocol::constants::{MAX_CONTROL_PAYLOAD, PING_PAYLOAD};
use wavesock_core::protocol::frame_bits::FIN_BIT;
use wavesock_core::protocol::Opcode;
use wavesock_core::status::{clamp_close_code, close_code, truncate_reason, CloseStatus};
use wavesock_core::{BoxStream, ConnectionConfig};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type Reader = BufReader<ReadHalf<BoxStream>>;
type Writer = WriteHalf<BoxStream>;

enum Side {
    Client { url: Url },
    Server,
}

/// Handle to a WebSocket connection, client or server side
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    secure: bool,
    side: Side,
    peer: SocketAddr,
    config: ConnectionConfig,
    status: StdMutex<CloseStatus>,
    subprotocol: StdMutex<Option<String>>,
    resource: StdMutex<Option<String>>,
    handler: StdMutex<Arc<dyn ConnectionHandler>>,
    writer: AsyncMutex<Writer>,
    reader: StdMutex<Option<Reader>>,
    force_close: Notify,
    registry: ConnectionRegistry,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("secure", &self.inner.secure)
            .field("client_side", &self.is_client_side())
            .field("status", &self.status())
            .finish()
    }
}

fn lock_ignoring_poison<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Connection {
    fn new(
        stream: BoxStream,
        peer: SocketAddr,
        secure: bool,
        side: Side,
        handler: Arc<dyn ConnectionHandler>,
        config: ConnectionConfig,
        registry: ConnectionRegistry,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let resource = match &side {
            Side::Client { url } => {
                let mut target = url.path().to_string();
                if target.is_empty() {
                    target.push('/');
                }
                if let Some(query) = url.query() {
                    target.push('?');
                    target.push_str(query);
                }
                Some(target)
            }
            Side::Server => None,
        };
        Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                secure,
                side,
                peer,
                config,
                status: StdMutex::new(CloseStatus::pre_open()),
                subprotocol: StdMutex::new(None),
                resource: StdMutex::new(resource),
                handler: StdMutex::new(handler),
                writer: AsyncMutex::new(write_half),
                reader: StdMutex::new(Some(BufReader::new(read_half))),
                force_close: Notify::new(),
                registry,
            }),
        }
    }

    pub(crate) fn client(
        stream: BoxStream,
        peer: SocketAddr,
        url: Url,
        handler: Arc<dyn ConnectionHandler>,
        config: ConnectionConfig,
        registry: ConnectionRegistry,
    ) -> Self {
        let secure = url.scheme() == "wss";
        Self::new(
            stream,
            peer,
            secure,
            Side::Client { url },
            handler,
            config,
            registry,
        )
    }

    pub(crate) fn server(
        stream: BoxStream,
        peer: SocketAddr,
        secure: bool,
        handler: Arc<dyn ConnectionHandler>,
        config: ConnectionConfig,
        registry: ConnectionRegistry,
    ) -> Self {
        Self::new(stream, peer, secure, Side::Server, handler, config, registry)
    }

    /// Identifier of this connection, unique within the process
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// True while the connection is open
    pub fn is_open(&self) -> bool {
        self.status_ref().is_open()
    }

    /// True when the connection runs over TLS
    pub fn is_secure(&self) -> bool {
        self.inner.secure
    }

    /// True when this side initiated the connection
    pub fn is_client_side(&self) -> bool {
        matches!(self.inner.side, Side::Client { .. })
    }

    /// The subprotocol agreed during the handshake
    pub fn subprotocol(&self) -> Option<String> {
        lock_ignoring_poison(&self.inner.subprotocol).clone()
    }

    /// Snapshot of the connection status
    pub fn status(&self) -> CloseStatus {
        self.status_ref().clone()
    }

    /// Per-connection configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Peer host: the requested host on the client side, the peer address
    /// on the server side
    pub fn peer_host(&self) -> Option<String> {
        match &self.inner.side {
            Side::Client { url } => url.host_str().map(str::to_string),
            Side::Server => Some(self.inner.peer.ip().to_string()),
        }
    }

    /// Peer port
    pub fn port(&self) -> u16 {
        self.inner.peer.port()
    }

    /// Path of the upgrade request
    pub fn path(&self) -> Option<String> {
        lock_ignoring_poison(&self.inner.resource)
            .as_ref()
            .map(|r| match r.split_once('?') {
                Some((path, _)) => path.to_string(),
                None => r.clone(),
            })
    }

    /// Query of the upgrade request
    pub fn query(&self) -> Option<String> {
        lock_ignoring_poison(&self.inner.resource)
            .as_ref()
            .and_then(|r| r.split_once('?').map(|(_, q)| q.to_string()))
    }

    /// Connections registered alongside this one (same endpoint or same
    /// acceptor)
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.registry.list()
    }

    /// Swap the connection handler while the connection is open. The
    /// outgoing handler receives a synthetic `on_close`, the incoming one
    /// an `on_open`; when the connection is not open the call does
    /// nothing.
    pub async fn set_handler(&self, handler: impl ConnectionHandler) {
        if !self.is_open() {
            return;
        }
        let incoming: Arc<dyn ConnectionHandler> = Arc::new(handler);
        let outgoing = {
            let mut slot = lock_ignoring_poison(&self.inner.handler);
            std::mem::replace(&mut *slot, incoming.clone())
        };
        outgoing.on_close(self, self.status()).await;
        incoming.on_open(self, self.subprotocol().as_deref()).await;
    }

    /// Send a text message
    pub async fn send_text(&self, text: impl AsRef<str>) -> Result<()> {
        let payload = text.as_ref().as_bytes().to_vec();
        self.send(std::io::Cursor::new(payload), true).await
    }

    /// Send a binary message
    pub async fn send_binary(&self, data: impl AsRef<[u8]>) -> Result<()> {
        let payload = data.as_ref().to_vec();
        self.send(std::io::Cursor::new(payload), false).await
    }

    /// Stream a message from `source`, fragmenting it into frames of at
    /// most `payload_buffer_len` bytes. The final frame carries FIN; a
    /// zero-length tail frame is emitted when the source ends exactly on
    /// a fragment boundary.
    pub async fn send<S>(&self, mut source: S, is_text: bool) -> Result<()>
    where
        S: AsyncRead + Unpin + Send,
    {
        let result = {
            let mut writer = self.inner.writer.lock().await;
            self.stream_message(&mut writer, &mut source, is_text).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(error) => Err(self
                .close_due_to(close_code::INTERNAL_ERROR, error)
                .await),
        }
    }

    async fn stream_message<S>(
        &self,
        writer: &mut Writer,
        source: &mut S,
        is_text: bool,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin + Send,
    {
        let mut opcode = if is_text { Opcode::Text } else { Opcode::Binary };
        let mut buf = vec![0u8; self.inner.config.payload_buffer_len];
        loop {
            let len = read_fully(source, &mut buf).await?;
            if len == buf.len() {
                self.send_frame_locked(writer, opcode, false, &buf).await?;
                opcode = Opcode::Continuation;
            } else {
                // final frame even when the source ended on a boundary
                self.send_frame_locked(writer, opcode, true, &buf[..len])
                    .await?;
                return Ok(());
            }
        }
    }

    pub(crate) async fn send_frame(
        &self,
        opcode: Opcode,
        fin: bool,
        payload: &[u8],
    ) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        self.send_frame_locked(&mut writer, opcode, fin, payload).await
    }

    async fn send_frame_locked(
        &self,
        writer: &mut Writer,
        opcode: Opcode,
        fin: bool,
        payload: &[u8],
    ) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        let mut buf = BytesMut::new();
        frame::encode_frame(&mut buf, opcode, fin, payload, self.is_client_side());
        let result = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }
        .await;
        if let Err(error) = result {
            self.status_mut().code = close_code::ABNORMAL_CLOSURE;
            return Err(error.into());
        }
        Ok(())
    }

    /// Start the closing handshake. No-op unless the connection is open.
    ///
    /// Codes outside [1000, 4999] are replaced by NO_STATUS and the
    /// reason dropped; a reason longer than 123 UTF-8 bytes is truncated.
    /// Further sends fail once this returns. A grace timer forces the
    /// socket shut after `handshake_timeout` if the peer never answers.
    pub async fn close(&self, code: u16, reason: &str) {
        let mut writer = self.inner.writer.lock().await;
        if !self.is_open() {
            return;
        }
        let code = clamp_close_code(code);
        let reason = if code == close_code::NO_STATUS {
            ""
        } else {
            truncate_reason(reason)
        };
        let mut payload = Vec::with_capacity(2 + reason.len());
        if code != close_code::NO_STATUS {
            payload.extend_from_slice(&code.to_be_bytes());
            payload.extend_from_slice(reason.as_bytes());
        }
        let sent = self
            .send_frame_locked(&mut writer, Opcode::Close, true, &payload)
            .await;
        {
            let mut status = self.status_mut();
            match sent {
                Ok(()) => {
                    status.remotely = false;
                    status.code = code; // blocks further sends
                    status.reason = reason.to_string();
                }
                Err(error) => {
                    // the failed write already recorded ABNORMAL_CLOSURE
                    if status.error.is_none() {
                        status.error = Some(Arc::new(error));
                    }
                }
            }
        }
        drop(writer);

        let inner = self.inner.clone();
        let grace = self.inner.config.handshake_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            inner.force_close.notify_one();
        });
    }

    /// Record `error` into the status if the connection is still open,
    /// then start the closing handshake with `code`. Returns the error,
    /// re-wrapped when it was captured.
    pub(crate) async fn close_due_to(&self, code: u16, error: Error) -> Error {
        let error = {
            let mut status = self.status_mut();
            if status.is_open() && status.error.is_none() {
                let shared = Arc::new(error);
                status.error = Some(shared.clone());
                Error::Shared(shared)
            } else {
                error
            }
        };
        self.close(code, "").await;
        error
    }

    pub(crate) async fn shutdown_socket(&self) {
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub(crate) fn handler(&self) -> Arc<dyn ConnectionHandler> {
        lock_ignoring_poison(&self.inner.handler).clone()
    }

    pub(crate) fn status_mut(&self) -> MutexGuard<'_, CloseStatus> {
        lock_ignoring_poison(&self.inner.status)
    }

    fn status_ref(&self) -> MutexGuard<'_, CloseStatus> {
        lock_ignoring_poison(&self.inner.status)
    }

    /// Reader task: registry entry, handshake, messaging, events
    pub(crate) async fn run(self) {
        let _guard = self.inner.registry.register(&self);
        let reader = lock_ignoring_poison(&self.inner.reader).take();
        let Some(mut reader) = reader else {
            return;
        };

        match self.perform_handshake(&mut reader).await {
            Ok(()) => self.run_messaging(reader).await,
            Err(error) => {
                tracing::debug!(id = self.inner.id, %error, "handshake failed");
                self.shutdown_socket().await;
                {
                    let mut status = self.status_mut();
                    if status.error.is_none() {
                        status.error = Some(Arc::new(error));
                    }
                }
                let status = self.status();
                let handler = self.handler();
                if let Some(error) = status.error.as_deref() {
                    handler.on_error(&self, error).await;
                }
                handler.on_close(&self, status).await;
            }
        }
    }

    async fn perform_handshake(&self, reader: &mut Reader) -> Result<()> {
        let deadline = self.inner.config.handshake_timeout;
        match &self.inner.side {
            Side::Client { url } => self.handshake_as_client(reader, url.clone(), deadline).await,
            Side::Server => self.handshake_as_server(reader, deadline).await,
        }
    }

    async fn handshake_as_client(
        &self,
        reader: &mut Reader,
        url: Url,
        deadline: Duration,
    ) -> Result<()> {
        let key = handshake::generate_key();
        let resource = lock_ignoring_poison(&self.inner.resource)
            .clone()
            .unwrap_or_else(|| "/".to_string());
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };
        let origin = format!("{}://{}", url.scheme(), host);
        let request = handshake::build_client_request(
            &resource,
            &host,
            &origin,
            &key,
            &self.inner.config.subprotocols,
        );
        {
            let mut writer = self.inner.writer.lock().await;
            request.write(&mut *writer).await?;
        }

        let response = timeout(deadline, ResponseHead::read(reader))
            .await
            .map_err(|_| Error::ReadTimeout(deadline))??;
        match handshake::validate_server_response(
            &response,
            &key,
            &self.inner.config.subprotocols,
        ) {
            Ok(subprotocol) => {
                *lock_ignoring_poison(&self.inner.subprotocol) = subprotocol;
                Ok(())
            }
            Err(error) => {
                self.status_mut().remotely = false;
                Err(error)
            }
        }
    }

    async fn handshake_as_server(&self, reader: &mut Reader, deadline: Duration) -> Result<()> {
        let request = timeout(deadline, RequestHead::read(reader))
            .await
            .map_err(|_| Error::ReadTimeout(deadline))??;
        match handshake::accept_request(&request, &self.inner.config.subprotocols) {
            Ok((response, subprotocol)) => {
                {
                    let mut writer = self.inner.writer.lock().await;
                    response.write(&mut *writer).await?;
                }
                *lock_ignoring_poison(&self.inner.subprotocol) = subprotocol;
                *lock_ignoring_poison(&self.inner.resource) = Some(request.target.clone());
                Ok(())
            }
            Err(error) => {
                let reject = handshake::reject_response();
                {
                    let mut writer = self.inner.writer.lock().await;
                    let _ = reject.write(&mut *writer).await;
                }
                self.status_mut().remotely = false;
                Err(error)
            }
        }
    }

    async fn run_messaging(&self, reader: Reader) {
        self.status_mut().code = close_code::IS_OPEN;
        tracing::debug!(id = self.inner.id, peer = %self.inner.peer, "connection open");
        let subprotocol = self.subprotocol();
        self.handler()
            .on_open(self, subprotocol.as_deref())
            .await;

        let mut state = ReaderState::new(self.clone(), reader);
        loop {
            let Some(is_text) = state.wait_data_frame().await else {
                break;
            };
            let mut message = MessageReader::new(&mut state, is_text);
            let handler = self.handler();
            handler.on_message(self, &mut message, is_text).await;
            let _ = message.finish().await;
        }

        self.shutdown_socket().await;
        let status = self.status();
        tracing::debug!(
            id = self.inner.id,
            code = status.code,
            was_clean = status.was_clean,
            "connection closed"
        );
        let handler = self.handler();
        if let Some(error) = status.error.as_deref() {
            // a plain EOF ends the loop but is not reported as an error
            if !error.is_eof() {
                handler.on_error(self, error).await;
            }
        }
        handler.on_close(self, status).await;
    }
}

async fn read_fully<S>(source: &mut S, buf: &mut [u8]) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

enum Flow {
    /// A data frame is ready; true for text messages
    Data(bool),
    /// A control frame or a skipped frame was consumed
    Control,
    /// The closing handshake completed
    Closed,
}

/// Inbound side of one connection, owned by the reader task
pub(crate) struct ReaderState {
    conn: Connection,
    reader: Reader,
    /// Opcode of the data message in progress, FIN bit included once the
    /// final frame arrived; 0 when no message is in progress
    op_data: u8,
    payload_len: u64,
    payload_pos: u64,
    mask: [u8; 4],
    masked: bool,
    message_len: u64,
    /// Bumped when a new data message starts; a reader holding a stale
    /// sequence number must not consume the current frame
    message_seq: u64,
    /// A data frame yielded to a stale reader, handed back for the next
    /// `wait_data_frame` call
    redelivery: Option<bool>,
    /// Remaining frames of an oversize message are drained, not yielded
    message_aborted: bool,
    ping_outstanding: bool,
}

impl ReaderState {
    fn new(conn: Connection, reader: Reader) -> Self {
        Self {
            conn,
            reader,
            op_data: 0,
            payload_len: 0,
            payload_pos: 0,
            mask: [0; 4],
            masked: false,
            message_len: 0,
            message_seq: 0,
            redelivery: None,
            message_aborted: false,
            ping_outstanding: false,
        }
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn message_final(&self) -> bool {
        self.op_data & FIN_BIT != 0
    }

    pub(crate) fn message_seq(&self) -> u64 {
        self.message_seq
    }

    /// Hand a yielded data frame back so the next `wait_data_frame`
    /// returns it untouched
    pub(crate) fn push_back(&mut self, is_text: bool) {
        self.redelivery = Some(is_text);
    }

    /// Wait for the next data frame. Returns `Some(is_text)` when one is
    /// ready for streaming, `None` when the connection finished.
    pub(crate) async fn wait_data_frame(&mut self) -> Option<bool> {
        if let Some(is_text) = self.redelivery.take() {
            return Some(is_text);
        }
        while !self.conn.status().was_clean {
            if self.message_final() {
                self.op_data = 0;
                self.message_len = 0;
            }

            let mut prefix = [0u8; 2];
            match self.read_exact_deadline(&mut prefix).await {
                Ok(()) => {}
                Err(Error::ReadTimeout(_)) => {
                    let ping_allowed = self.conn.is_open()
                        && self.conn.config().ping_enabled
                        && !self.ping_outstanding;
                    if ping_allowed {
                        self.ping_outstanding = true;
                        if self
                            .conn
                            .send_frame(Opcode::Ping, true, PING_PAYLOAD)
                            .await
                            .is_err()
                        {
                            return None;
                        }
                        continue;
                    }
                    let deadline = self.conn.config().read_timeout;
                    self.conn
                        .close_due_to(
                            close_code::ABNORMAL_CLOSURE,
                            Error::ReadTimeout(deadline),
                        )
                        .await;
                    return None;
                }
                Err(error) => {
                    self.abort(error).await;
                    return None;
                }
            }

            match self.process_frame(prefix[0], prefix[1]).await {
                Ok(Flow::Data(is_text)) => return Some(is_text),
                Ok(Flow::Control) => continue,
                Ok(Flow::Closed) => return None,
                Err(error) => {
                    self.abort(error).await;
                    return None;
                }
            }
        }
        None
    }

    async fn abort(&mut self, error: Error) {
        let code = match &error {
            Error::Io(_) | Error::ReadTimeout(_) | Error::ForcedClose => {
                close_code::ABNORMAL_CLOSURE
            }
            _ => close_code::INTERNAL_ERROR,
        };
        self.conn.close_due_to(code, error).await;
    }

    /// Read the extended length and mask bytes of a frame whose first two
    /// header bytes are already in hand, under the read deadline
    async fn read_header_rest(&mut self, b1: u8, b2: u8) -> Result<FrameHeader> {
        use wavesock_core::protocol::frame_bits::{
            MASK_BIT, OPCODE_MASK, PAYLOAD_LEN_16, PAYLOAD_LEN_64, PAYLOAD_LEN_MASK, RSV_MASK,
        };

        let mut payload_len = u64::from(b2 & PAYLOAD_LEN_MASK);
        if payload_len == u64::from(PAYLOAD_LEN_16) {
            let mut ext = [0u8; 2];
            self.read_exact_deadline(&mut ext).await?;
            payload_len = u64::from(u16::from_be_bytes(ext));
        } else if payload_len == u64::from(PAYLOAD_LEN_64) {
            let mut ext = [0u8; 8];
            self.read_exact_deadline(&mut ext).await?;
            payload_len = u64::from_be_bytes(ext);
        }

        let masked = (b2 & MASK_BIT) != 0;
        let mut mask = [0u8; 4];
        if masked {
            self.read_exact_deadline(&mut mask).await?;
        }

        Ok(FrameHeader {
            fin: (b1 & FIN_BIT) != 0,
            rsv: b1 & RSV_MASK,
            opcode: b1 & OPCODE_MASK,
            masked,
            mask,
            payload_len,
        })
    }

    async fn process_frame(&mut self, b1: u8, b2: u8) -> Result<Flow> {
        let header = self.read_header_rest(b1, b2).await?;

        if header.rsv != 0 {
            return self
                .violation(
                    close_code::UNSUPPORTED_EXTENSION,
                    ProtocolError::ReservedBits,
                    &header,
                )
                .await;
        }

        let opcode = match header.opcode() {
            Some(opcode) => opcode,
            None => {
                return self
                    .violation(
                        close_code::PROTOCOL_ERROR,
                        ProtocolError::UnexpectedOpcode(header.opcode),
                        &header,
                    )
                    .await;
            }
        };

        // dispatch validity
        match opcode {
            Opcode::Text | Opcode::Binary => {
                if self.op_data != 0 {
                    return self
                        .violation(
                            close_code::PROTOCOL_ERROR,
                            ProtocolError::MessageInProgress,
                            &header,
                        )
                        .await;
                }
            }
            Opcode::Continuation => {
                if self.op_data == 0 {
                    return self
                        .violation(
                            close_code::PROTOCOL_ERROR,
                            ProtocolError::UnexpectedContinuation,
                            &header,
                        )
                        .await;
                }
            }
            Opcode::Close | Opcode::Ping | Opcode::Pong => {
                if !header.fin {
                    return self
                        .violation(
                            close_code::PROTOCOL_ERROR,
                            ProtocolError::FragmentedControlFrame,
                            &header,
                        )
                        .await;
                }
            }
        }

        // payload length caps
        if opcode.is_control() && header.payload_len > MAX_CONTROL_PAYLOAD {
            return self
                .violation(
                    close_code::PROTOCOL_ERROR,
                    ProtocolError::ControlFrameTooBig(header.payload_len),
                    &header,
                )
                .await;
        }
        if opcode.is_data() && !self.message_aborted {
            let max = self.conn.config().max_message_len;
            let total = self.message_len.saturating_add(header.payload_len);
            if total > max {
                self.skip_payload(&header).await?;
                let error = Error::MessageTooBig { size: total, max };
                self.conn
                    .close_due_to(close_code::MESSAGE_TOO_BIG, error)
                    .await;
                if header.fin || self.op_data == 0 {
                    self.op_data = 0;
                    self.message_len = 0;
                } else {
                    self.message_aborted = true;
                }
                return Ok(Flow::Control);
            }
        }

        // mask direction: client frames masked, server frames not
        if self.conn.is_client_side() == header.masked {
            return self
                .violation(
                    close_code::PROTOCOL_ERROR,
                    ProtocolError::MaskMismatch,
                    &header,
                )
                .await;
        }

        match opcode {
            Opcode::Text | Opcode::Binary => {
                self.op_data = opcode.bits() | if header.fin { FIN_BIT } else { 0 };
                self.message_seq = self.message_seq.wrapping_add(1);
                self.message_len += header.payload_len;
                self.begin_payload(&header);
                Ok(Flow::Data(opcode == Opcode::Text))
            }
            Opcode::Continuation => {
                if self.message_aborted {
                    self.skip_payload(&header).await?;
                    if header.fin {
                        self.op_data = 0;
                        self.message_len = 0;
                        self.message_aborted = false;
                    }
                    return Ok(Flow::Control);
                }
                if header.fin {
                    self.op_data |= FIN_BIT;
                }
                self.message_len += header.payload_len;
                self.begin_payload(&header);
                Ok(Flow::Data(self.op_data & 0x0F == Opcode::Text.bits()))
            }
            Opcode::Ping => {
                let payload = self.read_control_payload(&header).await?;
                if self.conn.is_open() {
                    self.conn.send_frame(Opcode::Pong, true, &payload).await?;
                }
                Ok(Flow::Control)
            }
            Opcode::Pong => {
                let payload = self.read_control_payload(&header).await?;
                let expected = self.ping_outstanding && payload == PING_PAYLOAD;
                self.ping_outstanding = false;
                if !expected {
                    self.conn
                        .close_due_to(
                            close_code::PROTOCOL_ERROR,
                            ProtocolError::UnexpectedPong.into(),
                        )
                        .await;
                }
                Ok(Flow::Control)
            }
            Opcode::Close => {
                let payload = self.read_control_payload(&header).await?;
                if self.conn.is_open() {
                    // echo before the status transition blocks sends
                    self.conn.send_frame(Opcode::Close, true, &payload).await?;
                    let mut status = self.conn.status_mut();
                    if payload.len() > 1 {
                        status.code = u16::from_be_bytes([payload[0], payload[1]]);
                        status.reason = String::from_utf8_lossy(&payload[2..]).into_owned();
                    }
                    if status.code == close_code::IS_OPEN {
                        status.code = close_code::NO_STATUS;
                    }
                }
                self.conn.status_mut().was_clean = true;
                Ok(Flow::Closed)
            }
        }
    }

    /// Close due to a protocol violation, then drain the offending frame
    /// so the loop stays synchronized while the close handshake runs
    async fn violation(
        &mut self,
        code: u16,
        error: ProtocolError,
        header: &FrameHeader,
    ) -> Result<Flow> {
        self.conn.close_due_to(code, error.into()).await;
        self.skip_payload(header).await?;
        Ok(Flow::Control)
    }

    fn begin_payload(&mut self, header: &FrameHeader) {
        self.payload_len = header.payload_len;
        self.payload_pos = 0;
        self.mask = header.mask;
        self.masked = header.masked;
    }

    async fn read_control_payload(&mut self, header: &FrameHeader) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; header.payload_len as usize];
        self.read_exact_deadline(&mut payload).await?;
        if header.masked {
            frame::apply_mask(&mut payload, header.mask, 0);
        }
        Ok(payload)
    }

    async fn skip_payload(&mut self, header: &FrameHeader) -> Result<()> {
        let mut remaining = header.payload_len;
        let mut scratch = [0u8; 4096];
        while remaining > 0 {
            let n = remaining.min(scratch.len() as u64) as usize;
            self.read_exact_deadline(&mut scratch[..n]).await?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Read up to `buf.len()` payload bytes of the current frame,
    /// unmasked. Returns 0 when the frame is exhausted.
    pub(crate) async fn read_payload(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.payload_len - self.payload_pos;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let n = remaining.min(buf.len() as u64) as usize;
        self.read_exact_deadline(&mut buf[..n]).await?;
        if self.masked {
            frame::apply_mask(&mut buf[..n], self.mask, self.payload_pos);
        }
        self.payload_pos += n as u64;
        Ok(n)
    }

    async fn read_exact_deadline(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let deadline = self.conn.inner.config.read_timeout;
        tokio::select! {
            result = timeout(deadline, self.reader.read_exact(buf)) => match result {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(error)) => Err(error.into()),
                Err(_) => Err(Error::ReadTimeout(deadline)),
            },
            _ = self.conn.inner.force_close.notified() => Err(Error::ForcedClose),
        }
    }
}
