//! The server-side WebSocket connection
//!
//! One `WebSocket` per upgraded peer. A spawned receive task drives the
//! frame parser and owns fragment assembly; any number of application
//! tasks may send concurrently. Four disjoint locks keep the paths apart:
//! the async send lock serializes the whole outbound sequence, the state
//! lock guards transitions, the event lock serializes callbacks, and the
//! queue lock is a leaf. When both are needed, the send lock is taken
//! before the state lock, and the event lock is never held while taking
//! either.
//!
//! Callbacks are invoked synchronously; they must not call back into the
//! connection from inside the callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};

use crate::close::{self, CloseReason};
use crate::deflate::{DeflateConfig, DeflateContext, DeflateDecoder, DeflateEncoder};
use crate::error::{Error, Result};
use crate::events::{CloseEvent, EventSink, MessageEvent, MessageKind};
use crate::frame::{encode_frame, Frame, FrameParser, OpCode};
use crate::queue::EventQueue;
use crate::signal::Latch;
use crate::state::ReadyState;
use crate::{Compression, DEFAULT_CLOSE_TIMEOUT, FRAGMENT_LENGTH, RECV_BUFFER_SIZE};

/// Parameters the upgrade layer settled on before handing the stream over
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Negotiated subprotocol, if any
    pub subprotocol: Option<String>,
    /// Whether the underlying stream is TLS-terminated
    pub secure: bool,
    /// Per-message compression mode, fixed for the connection lifetime
    pub compression: Compression,
    /// Deflate parameters, used when compression is enabled
    pub deflate: DeflateConfig,
    /// Largest accepted inbound frame payload
    pub max_frame_size: usize,
    /// Largest accepted assembled message
    pub max_message_size: usize,
    /// How long to wait for the peer's confirming close
    pub close_timeout: Duration,
    /// Soft cap on undelivered inbound events; exceeding it closes 1009
    pub queue_soft_cap: Option<usize>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            subprotocol: None,
            secure: false,
            compression: Compression::Disabled,
            deflate: DeflateConfig::default(),
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 64 * 1024 * 1024,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            queue_soft_cap: None,
        }
    }
}

impl ConnectOptions {
    /// Set the negotiated subprotocol
    pub fn subprotocol(mut self, proto: impl Into<String>) -> Self {
        self.subprotocol = Some(proto.into());
        self
    }

    /// Mark the stream as TLS-terminated
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Set the compression mode
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Set the close-handshake timeout
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Bound the inbound event queue
    pub fn queue_soft_cap(mut self, cap: usize) -> Self {
        self.queue_soft_cap = Some(cap);
        self
    }
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// Read-path state, moved into the receive task on connect
struct Receiver<S> {
    read_half: ReadHalf<S>,
    parser: FrameParser,
    decoder: Option<DeflateDecoder>,
}

/// An in-progress fragmented message
struct FragmentRun {
    kind: MessageKind,
    compressed: bool,
    buf: BytesMut,
}

struct Shared<S> {
    state: Mutex<ReadyState>,
    writer: AsyncMutex<WriteHalf<S>>,
    encoder: Mutex<Option<DeflateEncoder>>,
    reader: Mutex<Option<Receiver<S>>>,
    events: EventSink,
    queue: EventQueue,
    exit_receiving: Latch,
    receive_pong: Latch,
    close_hook: Mutex<Option<CloseHook>>,
    peer_close: Mutex<Option<CloseReason>>,
    close_frame_sent: AtomicBool,
    closing_locally: AtomicBool,
    subprotocol: Option<String>,
    secure: bool,
    compression: Compression,
    close_timeout: Duration,
    max_message_size: usize,
}

/// A server-side WebSocket connection over an upgraded stream
pub struct WebSocket<S> {
    inner: Arc<Shared<S>>,
}

impl<S> Clone for WebSocket<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// How frame dispatch left the connection
enum Dispatch {
    Continue,
    PeerClosed(Option<CloseReason>),
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> WebSocket<S> {
    /// Bind an upgraded stream. The connection starts in `Connecting`;
    /// register callbacks and a close hook, then call
    /// [`connect_as_server`](Self::connect_as_server).
    pub fn attach(stream: S, options: ConnectOptions) -> Self {
        let (read_half, write_half) = split(stream);

        let mut parser = FrameParser::new(options.max_frame_size, true);
        parser.set_compression(options.compression.is_enabled());

        let (encoder, decoder) = if options.compression.is_enabled() {
            let (e, d) = DeflateContext::server(&options.deflate).split();
            (Some(e), Some(d))
        } else {
            (None, None)
        };

        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(ReadyState::Connecting),
                writer: AsyncMutex::new(write_half),
                encoder: Mutex::new(encoder),
                reader: Mutex::new(Some(Receiver {
                    read_half,
                    parser,
                    decoder,
                })),
                events: EventSink::new(),
                queue: EventQueue::new(options.queue_soft_cap),
                exit_receiving: Latch::new(),
                receive_pong: Latch::new(),
                close_hook: Mutex::new(None),
                peer_close: Mutex::new(None),
                close_frame_sent: AtomicBool::new(false),
                closing_locally: AtomicBool::new(false),
                subprotocol: options.subprotocol,
                secure: options.secure,
                compression: options.compression,
                close_timeout: options.close_timeout,
                max_message_size: options.max_message_size,
            }),
        }
    }

    /// Supply the hook released when the connection reaches `Closed`
    pub fn set_close_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.inner.close_hook.lock() = Some(Box::new(hook));
    }

    /// Register the open callback
    pub fn on_open(&self, f: impl Fn() + Send + 'static) {
        self.inner.events.set_on_open(f);
    }

    /// Register the message callback
    pub fn on_message(&self, f: impl Fn(MessageEvent) + Send + 'static) {
        self.inner.events.set_on_message(f);
    }

    /// Register the error callback
    pub fn on_error(&self, f: impl Fn(&str) + Send + 'static) {
        self.inner.events.set_on_error(f);
    }

    /// Register the close callback
    pub fn on_close(&self, f: impl Fn(CloseEvent) + Send + 'static) {
        self.inner.events.set_on_close(f);
    }

    /// Current lifecycle state
    pub fn state(&self) -> ReadyState {
        *self.inner.state.lock()
    }

    /// Negotiated subprotocol
    pub fn subprotocol(&self) -> Option<&str> {
        self.inner.subprotocol.as_deref()
    }

    /// Whether the stream is TLS-terminated
    pub fn is_secure(&self) -> bool {
        self.inner.secure
    }

    /// Compression mode fixed at construction
    pub fn compression(&self) -> Compression {
        self.inner.compression
    }

    /// Open the connection: transition to `Open`, emit the open event and
    /// start the receive task.
    pub async fn connect_as_server(&self) -> Result<()> {
        {
            let mut st = self.inner.state.lock();
            if *st != ReadyState::Connecting {
                return Err(Error::InvalidState("connection already started"));
            }
            *st = ReadyState::Open;
        }
        let rx = self
            .inner
            .reader
            .lock()
            .take()
            .ok_or(Error::InvalidState("receive task already started"))?;

        if !self.inner.events.emit_open() {
            self.inner.events.emit_error("open callback panicked");
            self.inner.exit_receiving.trip();
            self.send_close_frame_best_effort(CloseReason::ABNORMAL, "").await;
            self.finalize_close(CloseEvent {
                was_clean: false,
                code: CloseReason::ABNORMAL,
                reason: "open callback panicked".into(),
            })
            .await;
            return Err(Error::Application("open callback panicked"));
        }

        let ws = self.clone();
        tokio::spawn(async move {
            ws.receive_loop(rx).await;
        });
        Ok(())
    }

    /// Send a binary message. Ownership of the payload transfers to the
    /// call; the future completes when the bytes reach the stream.
    pub async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.send_data(OpCode::Binary, data).await
    }

    /// UTF-8 encode and send a text message
    pub async fn send_text(&self, text: impl AsRef<str>) -> Result<()> {
        let data = Bytes::copy_from_slice(text.as_ref().as_bytes());
        self.send_data(OpCode::Text, data).await
    }

    /// Send a ping carrying up to 125 bytes of application data
    pub async fn ping(&self, data: Bytes) -> Result<()> {
        if !close::is_valid_control_data(&data) {
            return Err(Error::ControlTooLarge);
        }
        let mut writer = self.inner.writer.lock().await;
        self.inner
            .state
            .lock()
            .check_open()
            .map_err(Error::InvalidState)?;
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Ping, &data, true, false, None);
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Wait for the next pong, up to `timeout`. Returns true when one
    /// arrived; keep-alive schedulers poll this after [`ping`](Self::ping).
    pub async fn await_pong(&self, timeout: Duration) -> bool {
        self.inner.receive_pong.wait(timeout).await
    }

    /// Normal close with an empty payload
    pub async fn close(&self) {
        self.close_impl(None).await;
    }

    /// Close with a status code and reason. The close frame is elided for
    /// reserved codes; the connection still reaches `Closed`.
    pub async fn close_with(&self, code: u16, reason: &str) {
        self.close_impl(Some((code, reason))).await;
    }

    /// Release the connection, closing with 1001 Away
    pub async fn dispose(&self) {
        self.close_impl(Some((CloseReason::AWAY, "Away"))).await;
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    async fn send_data(&self, opcode: OpCode, payload: Bytes) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        self.inner
            .state
            .lock()
            .check_open()
            .map_err(Error::InvalidState)?;

        let mut rsv1 = false;
        let payload = if self.inner.compression.is_enabled() {
            let mut guard = self.inner.encoder.lock();
            match guard.as_mut() {
                Some(encoder) => {
                    rsv1 = true;
                    encoder.compress(&payload)?
                }
                None => payload,
            }
        } else {
            payload
        };

        let result = write_fragmented(&mut *writer, opcode, &payload, rsv1).await;
        drop(writer);

        if let Err(e) = &result {
            self.inner.events.emit_error(&format!("send failed: {}", e));
        }
        result
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    async fn receive_loop(self, mut rx: Receiver<S>) {
        let outcome = self.drive(&mut rx).await;

        if let Ok(reason) = &outcome {
            let recorded = reason
                .clone()
                .unwrap_or_else(|| CloseReason::new(CloseReason::NO_STATUS, ""));
            *self.inner.peer_close.lock() = Some(recorded);
        }

        let locally_closing = self.inner.closing_locally.load(Ordering::SeqCst);
        self.inner.exit_receiving.trip();
        if locally_closing {
            // The initiating close call observes the latch and finalizes.
            return;
        }

        match outcome {
            Ok(reason) => {
                let (code, text) = match reason {
                    Some(r) => (r.code, r.reason),
                    None => (CloseReason::NO_STATUS, String::new()),
                };
                self.finalize_close(CloseEvent {
                    was_clean: true,
                    code,
                    reason: text,
                })
                .await;
            }
            Err(e) => {
                let code = e.close_code();
                warn!(error = %e, code, "receive loop terminated");
                self.send_close_frame_best_effort(code, "").await;
                self.finalize_close(CloseEvent {
                    was_clean: false,
                    code,
                    reason: e.to_string(),
                })
                .await;
            }
        }
    }

    /// Read frames until the close handshake completes from this side or
    /// the connection fails. `Ok` carries the peer's close reason.
    async fn drive(&self, rx: &mut Receiver<S>) -> Result<Option<CloseReason>> {
        let mut buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
        let mut run: Option<FragmentRun> = None;

        loop {
            while let Some(frame) = rx.parser.parse(&mut buf)? {
                match self.handle_frame(frame, &mut rx.decoder, &mut run).await? {
                    Dispatch::Continue => {}
                    Dispatch::PeerClosed(reason) => return Ok(reason),
                }
            }
            if rx.read_half.read_buf(&mut buf).await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    async fn handle_frame(
        &self,
        frame: Frame,
        decoder: &mut Option<DeflateDecoder>,
        run: &mut Option<FragmentRun>,
    ) -> Result<Dispatch> {
        match frame.header.opcode {
            OpCode::Text | OpCode::Binary => {
                if run.is_some() {
                    return Err(Error::IncorrectData(
                        "data frame inside a fragmented message",
                    ));
                }
                let kind = if frame.header.opcode == OpCode::Text {
                    MessageKind::Text
                } else {
                    MessageKind::Binary
                };

                if frame.header.fin {
                    let data = self.finish_payload(frame.header.rsv1, frame.payload, decoder)?;
                    self.deliver(kind, data)?;
                } else {
                    if frame.payload.len() > self.inner.max_message_size {
                        return Err(Error::MessageTooLarge);
                    }
                    let mut assembly = BytesMut::with_capacity(frame.payload.len() * 2);
                    assembly.extend_from_slice(&frame.payload);
                    *run = Some(FragmentRun {
                        kind,
                        compressed: frame.header.rsv1,
                        buf: assembly,
                    });
                }
                Ok(Dispatch::Continue)
            }

            OpCode::Continuation => {
                let Some(mut current) = run.take() else {
                    return Err(Error::Protocol("continuation without a started message"));
                };
                if frame.header.rsv1 {
                    return Err(Error::Protocol("RSV1 on continuation frame"));
                }
                if current.buf.len() + frame.payload.len() > self.inner.max_message_size {
                    return Err(Error::MessageTooLarge);
                }
                current.buf.extend_from_slice(&frame.payload);

                if frame.header.fin {
                    let data =
                        self.finish_payload(current.compressed, current.buf.freeze(), decoder)?;
                    self.deliver(current.kind, data)?;
                } else {
                    *run = Some(current);
                }
                Ok(Dispatch::Continue)
            }

            OpCode::Ping => {
                trace!(len = frame.payload.len(), "ping");
                self.send_control(OpCode::Pong, &frame.payload).await?;
                Ok(Dispatch::Continue)
            }

            OpCode::Pong => {
                trace!("pong");
                self.inner.receive_pong.trip();
                Ok(Dispatch::Continue)
            }

            OpCode::Close => {
                let reason = close::parse_close_payload(&frame.payload)?;
                if run.take().is_some() {
                    debug!("close received mid-message; partial message dropped");
                }
                {
                    let mut st = self.inner.state.lock();
                    if *st == ReadyState::Open {
                        *st = ReadyState::CloseSent;
                    }
                }
                let send_reply = reason.as_ref().map_or(true, |r| !close::is_reserved(r.code));
                if send_reply {
                    self.reply_close(reason.as_ref().map(|r| r.code)).await;
                }
                Ok(Dispatch::PeerClosed(reason))
            }
        }
    }

    fn finish_payload(
        &self,
        compressed: bool,
        payload: Bytes,
        decoder: &mut Option<DeflateDecoder>,
    ) -> Result<Bytes> {
        if !compressed {
            return Ok(payload);
        }
        let decoder = decoder.as_mut().ok_or(Error::IncorrectData(
            "RSV1 set without negotiated compression",
        ))?;
        decoder.decompress(&payload, self.inner.max_message_size)
    }

    /// Queue the assembled message and drain the queue through the emitter
    fn deliver(&self, kind: MessageKind, data: Bytes) -> Result<()> {
        if kind == MessageKind::Text && simdutf8::basic::from_utf8(&data).is_err() {
            return Err(Error::InvalidUtf8);
        }
        if self.inner.queue.push(MessageEvent { kind, data }).is_err() {
            return Err(Error::QueueOverflow);
        }
        while let Some(event) = self.inner.queue.pop() {
            if !self.inner.events.emit_message(event) {
                self.inner.events.emit_error("message callback panicked");
                return Err(Error::Application("message callback panicked"));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Close paths
    // ------------------------------------------------------------------

    async fn close_impl(&self, args: Option<(u16, &str)>) {
        {
            let st = *self.inner.state.lock();
            if let Err(msg) = st.check_closable() {
                self.inner.events.emit_error(msg);
                return;
            }
        }
        if self.inner.closing_locally.swap(true, Ordering::SeqCst) {
            self.inner.events.emit_error("close already in progress");
            return;
        }

        // Wire payload; `None` elides the frame for reserved codes.
        let (event_code, event_reason, payload) = match args {
            None => (CloseReason::NO_STATUS, String::new(), Some(Bytes::new())),
            Some((code, reason)) => {
                if close::is_reserved(code) {
                    (code, reason.to_string(), None)
                } else {
                    match close::build_close_payload(code, reason) {
                        Ok(p) => (code, reason.to_string(), Some(p)),
                        Err(e) => {
                            self.inner.closing_locally.store(false, Ordering::SeqCst);
                            self.inner
                                .events
                                .emit_error(&format!("close rejected: {}", e));
                            return;
                        }
                    }
                }
            }
        };

        {
            let mut st = self.inner.state.lock();
            if *st == ReadyState::Open {
                *st = ReadyState::CloseSent;
            }
        }

        if let Some(payload) = payload {
            if !self.inner.close_frame_sent.swap(true, Ordering::SeqCst) {
                let mut buf = BytesMut::new();
                encode_frame(&mut buf, OpCode::Close, &payload, true, false, None);
                let mut writer = self.inner.writer.lock().await;
                // The peer may already be gone; close still completes.
                if let Err(e) = writer.write_all(&buf).await {
                    debug!(error = %e, "close frame write failed");
                } else {
                    let _ = writer.flush().await;
                }
            }
        }

        let exited = self
            .inner
            .exit_receiving
            .wait(self.inner.close_timeout)
            .await;
        let was_clean = exited && self.inner.peer_close.lock().is_some();

        debug!(was_clean, code = event_code, "closing");
        self.finalize_close(CloseEvent {
            was_clean,
            code: event_code,
            reason: event_reason,
        })
        .await;
    }

    /// Echo the peer's close. I/O failures are swallowed.
    async fn reply_close(&self, code: Option<u16>) {
        if self.inner.close_frame_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let payload = match code {
            Some(c) => close::build_close_payload(c, "").unwrap_or_else(|_| Bytes::new()),
            None => Bytes::new(),
        };
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Close, &payload, true, false, None);
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.write_all(&buf).await {
            debug!(error = %e, "close reply write failed");
            return;
        }
        let _ = writer.flush().await;
    }

    /// Close initiated by a failure. Reserved codes send nothing; I/O
    /// failures are swallowed.
    async fn send_close_frame_best_effort(&self, code: u16, reason: &str) {
        if close::is_reserved(code) {
            return;
        }
        if self.inner.close_frame_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let payload = close::build_close_payload(code, reason).unwrap_or_else(|_| Bytes::new());
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Close, &payload, true, false, None);
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.write_all(&buf).await {
            debug!(error = %e, "close frame write failed");
            return;
        }
        let _ = writer.flush().await;
    }

    /// Transition to `Closed`, release the stream and close hook, emit the
    /// close event. Safe to reach from both the receive task and the close
    /// path; the event fires at most once.
    async fn finalize_close(&self, event: CloseEvent) {
        {
            let mut st = self.inner.state.lock();
            *st = ReadyState::Closed;
        }
        {
            let mut writer = self.inner.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        if let Some(hook) = self.inner.close_hook.lock().take() {
            hook();
        }
        if !self.inner.events.emit_close(event) {
            warn!("close callback panicked");
        }
    }

    async fn send_control(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, true, false, None);
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Split a payload into 1016-byte fragments and write them out.
///
/// Every non-terminal fragment carries exactly [`FRAGMENT_LENGTH`] bytes;
/// the terminal fragment carries the remainder (or a full fragment when
/// the length divides evenly). An empty payload is a single empty frame.
async fn write_fragmented<W: AsyncWrite + Unpin>(
    writer: &mut W,
    opcode: OpCode,
    payload: &[u8],
    rsv1: bool,
) -> Result<()> {
    let mut buf = BytesMut::new();

    if payload.len() <= FRAGMENT_LENGTH {
        encode_frame(&mut buf, opcode, payload, true, rsv1, None);
    } else {
        encode_frame(&mut buf, opcode, &payload[..FRAGMENT_LENGTH], false, rsv1, None);
        let mut offset = FRAGMENT_LENGTH;
        while payload.len() - offset > FRAGMENT_LENGTH {
            encode_frame(
                &mut buf,
                OpCode::Continuation,
                &payload[offset..offset + FRAGMENT_LENGTH],
                false,
                false,
                None,
            );
            offset += FRAGMENT_LENGTH;
        }
        encode_frame(&mut buf, OpCode::Continuation, &payload[offset..], true, false, None);
    }

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
