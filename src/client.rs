//! Manager-session client: handshake, login, publish/correlate, subscribe.
//!
//! # Architecture
//!
//! ```text
//! caller ──publish──▶ AmiClient ──registers──▶ pending table
//!                        │                          ▲
//!                        │ encoded frame            │ resolve by ActionID
//!                        ▼                          │
//!                  writer task ──▶ transport ──▶ reader task
//!                        │                          │
//!                        ▼                          ▼
//!                    wire taps ◀────────────── fan-out ──▶ AmiEventStream
//! ```
//!
//! Two background tasks own the transport halves. The writer drains a frame
//! channel, so concurrent publishers never interleave bytes mid-frame. The
//! reader is the only task that touches the receive side: it decodes frames,
//! resolves pending actions, and publishes every frame to the subscriber
//! fan-out in wire-arrival order. Teardown runs exactly once, from whichever
//! side observes the end first.
//!
//! Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use md5::{Digest, Md5};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};

use crate::codec::{encode_frame, FrameDecoder};
use crate::error::{AmiError, AmiResult};
use crate::message::{key, AmiMessage, Classification};
use crate::pending::PendingActions;
use crate::session::{SessionState, SharedSessionState};
use crate::stream::{AmiEventStream, Fanout, WireEvent, WireTap};

/// Read buffer size for the connection reader.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Every compatible server greets with a banner starting with this.
const BANNER_PREFIX: &str = "Asterisk Call Manager";

// ─── Configuration ───────────────────────────────────────────────────────────

/// Tuning knobs for [`AmiClient::connect_with_options`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// How long to wait for the server banner before failing the connect.
    pub banner_timeout: Duration,
    /// Bound applied to every [`AmiClient::publish`]; `None` waits until the
    /// response arrives or the session closes.
    pub action_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            banner_timeout: Duration::from_secs(10),
            action_timeout: None,
        }
    }
}

impl ClientOptions {
    /// Replace the banner wait bound.
    pub fn with_banner_timeout(mut self, timeout: Duration) -> Self {
        self.banner_timeout = timeout;
        self
    }

    /// Bound every publish await with `timeout`.
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = Some(timeout);
        self
    }
}

/// Authentication modes supported by [`AmiClient::login`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Send the secret directly in the login action.
    Plain,
    /// Request a challenge, then answer with `md5(challenge + secret)` so
    /// the secret never crosses the wire.
    Md5Challenge,
}

// ─── Client handle ───────────────────────────────────────────────────────────

/// State shared between the handle and the background tasks.
#[derive(Debug)]
struct ClientInner {
    state: Arc<SharedSessionState>,
    pending: PendingActions,
    messages: Fanout<AmiMessage>,
    taps: Fanout<WireEvent>,
    /// Taken at teardown so the writer task drains and exits.
    write_tx: StdMutex<Option<mpsc::UnboundedSender<Bytes>>>,
    /// Taken at teardown to stop the reader task.
    shutdown_tx: StdMutex<Option<oneshot::Sender<()>>>,
    options: ClientOptions,
    banner: String,
}

/// Asynchronous manager-protocol client over a caller-supplied transport.
///
/// All methods take `&self`, so a single client can be shared across tasks
/// behind an [`Arc`] and publish concurrently. Dropping the client closes
/// the session: background tasks stop, pending actions fail, and every
/// subscribed stream ends.
#[derive(Debug)]
pub struct AmiClient {
    inner: Arc<ClientInner>,
}

impl AmiClient {
    /// Attach to an already-connected transport with default options.
    ///
    /// See [`AmiClient::connect_with_options`].
    pub async fn connect<S>(stream: S) -> AmiResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::connect_with_options(stream, ClientOptions::default()).await
    }

    /// Attach to an already-connected transport, read and validate the
    /// server banner, and start the background reader and writer tasks.
    ///
    /// The client never dials: `stream` is any ordered byte stream the
    /// caller established (TCP, TLS, an in-memory pipe). On success the
    /// session is in [`SessionState::Authenticating`], ready for
    /// [`AmiClient::login`].
    ///
    /// # Errors
    ///
    /// Returns [`AmiError::Handshake`] if the transport fails or closes
    /// before the banner, the banner does not look like a manager-protocol
    /// greeting, or the banner wait times out.
    pub async fn connect_with_options<S>(stream: S, options: ClientOptions) -> AmiResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut read_half, write_half) = split(stream);
        let state = SharedSessionState::new();
        state.set(SessionState::Handshaking);

        let mut decoder = FrameDecoder::expecting_banner();
        let mut early = Vec::new();
        let banner = match tokio::time::timeout(
            options.banner_timeout,
            read_banner(&mut read_half, &mut decoder, &mut early),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(AmiError::Handshake("timed out waiting for banner".into())),
        };

        if !banner.starts_with(BANNER_PREFIX) {
            return Err(AmiError::Handshake(format!("unexpected banner: {banner:?}")));
        }
        log::info!("[AmiClient] Connected; server banner: {banner}");
        state.set(SessionState::Authenticating);

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let inner = Arc::new(ClientInner {
            state,
            pending: PendingActions::new(),
            messages: Fanout::new(),
            taps: Fanout::new(),
            write_tx: StdMutex::new(Some(write_tx)),
            shutdown_tx: StdMutex::new(Some(shutdown_tx)),
            options,
            banner,
        });

        tokio::spawn(write_loop(write_half, write_rx, Arc::clone(&inner)));
        tokio::spawn(read_loop(read_half, decoder, early, shutdown_rx, Arc::clone(&inner)));

        Ok(Self { inner })
    }

    /// Publish an action and await its correlated response.
    ///
    /// Assigns a fresh `ActionID` when the action lacks one. Safe to call
    /// from any number of tasks concurrently; each call awaits only its own
    /// identifier. Dropping the returned future cancels the wait without
    /// affecting the connection; a late response then goes to the
    /// subscriber stream only.
    ///
    /// # Errors
    ///
    /// [`AmiError::CorrelationCollision`] if the supplied `ActionID` is
    /// already pending (nothing is sent in that case);
    /// [`AmiError::ConnectionClosed`] if the session closes before the
    /// response arrives; [`AmiError::Timeout`] when
    /// [`ClientOptions::action_timeout`] is set and elapses;
    /// [`AmiError::Protocol`] if the action cannot be encoded.
    pub async fn publish(&self, action: AmiMessage) -> AmiResult<AmiMessage> {
        match self.inner.options.action_timeout {
            Some(limit) => self.publish_with_timeout(action, limit).await,
            None => self.publish_inner(action).await,
        }
    }

    /// Like [`AmiClient::publish`], but bounded by `limit` regardless of the
    /// configured default. On timeout the pending record is removed and the
    /// connection is left untouched.
    pub async fn publish_with_timeout(
        &self,
        action: AmiMessage,
        limit: Duration,
    ) -> AmiResult<AmiMessage> {
        match tokio::time::timeout(limit, self.publish_inner(action)).await {
            Ok(result) => result,
            Err(_) => Err(AmiError::Timeout),
        }
    }

    async fn publish_inner(&self, mut action: AmiMessage) -> AmiResult<AmiMessage> {
        if self.inner.state.get() == SessionState::Closed {
            return Err(AmiError::ConnectionClosed);
        }

        let id = match action.action_id() {
            Some(id) => id.to_string(),
            None => {
                let id = self.inner.pending.next_id();
                action.push(key::ACTION_ID, id.clone());
                id
            }
        };

        // Register before the frame can reach the wire so the response
        // cannot race the waiter. The guard also de-registers on
        // cancellation or timeout.
        let (_guard, response_rx) = self.inner.pending.register(&id)?;
        let frame = encode_frame(&action)?;
        self.queue_frame(frame.into())?;
        log::debug!(
            "[AmiClient] Sent action {} ({id})",
            action.get(key::ACTION).unwrap_or("<unnamed>")
        );

        match response_rx.await {
            Ok(response) => Ok(response),
            Err(_) => Err(AmiError::ConnectionClosed),
        }
    }

    /// Authenticate the session.
    ///
    /// Returns `Ok(true)` and moves to [`SessionState::Ready`] on success.
    /// A rejected login returns `Ok(false)` and leaves the session in
    /// [`SessionState::Authenticating`] with the connection open, so the
    /// caller may retry with different credentials.
    ///
    /// # Errors
    ///
    /// Propagates [`AmiClient::publish`] failures for the login exchange
    /// itself (closed connection, timeout).
    pub async fn login(&self, username: &str, secret: &str, mode: AuthMode) -> AmiResult<bool> {
        let action = match mode {
            AuthMode::Plain => AmiMessage::from_iter([
                (key::ACTION, "Login"),
                ("Username", username),
                ("Secret", secret),
            ]),
            AuthMode::Md5Challenge => {
                let challenge = self
                    .publish(AmiMessage::from_iter([
                        (key::ACTION, "Challenge"),
                        ("AuthType", "MD5"),
                    ]))
                    .await?;
                if !response_reports(&challenge, &["Success"]) {
                    log::warn!("[AmiClient] Challenge request rejected");
                    return Ok(false);
                }
                let Some(token) = challenge.get("Challenge") else {
                    log::warn!("[AmiClient] Challenge response carried no challenge token");
                    return Ok(false);
                };
                let digest = challenge_digest(token, secret);
                AmiMessage::from_iter([
                    (key::ACTION, "Login"),
                    ("Username", username),
                    ("AuthType", "MD5"),
                    ("Key", digest.as_str()),
                ])
            }
        };

        let response = self.publish(action).await?;
        let success = response_reports(&response, &["Success"]);
        if success {
            self.inner.state.set(SessionState::Ready);
            log::info!("[AmiClient] Logged in as {username}");
        } else {
            log::warn!("[AmiClient] Login rejected for {username}");
        }
        Ok(success)
    }

    /// Log off and close the session.
    ///
    /// On an affirmative reply (`Goodbye`, or `Success`) the session moves
    /// through [`SessionState::Closing`] to [`SessionState::Closed`]: the
    /// reader stops, remaining pending actions fail, and subscriber streams
    /// end. On a rejected logoff the session stays [`SessionState::Ready`]
    /// and remains usable.
    ///
    /// # Errors
    ///
    /// Propagates [`AmiClient::publish`] failures for the logoff exchange.
    pub async fn logoff(&self) -> AmiResult<bool> {
        let response = self.publish(AmiMessage::action("Logoff")).await?;
        let success = response_reports(&response, &["Goodbye", "Success"]);
        if success {
            self.inner.state.set(SessionState::Closing);
            log::info!("[AmiClient] Logged off");
            teardown(&self.inner);
        } else {
            log::warn!("[AmiClient] Logoff rejected; session stays ready");
        }
        Ok(success)
    }

    /// Subscribe to every message received from now on.
    ///
    /// Each subscription is independent, sees frames in wire-arrival order,
    /// does not replay history, and ends when the session closes. Slow
    /// consumers buffer without stalling the reader or other subscribers.
    pub fn subscribe(&self) -> AmiEventStream {
        AmiEventStream::new(self.inner.messages.subscribe())
    }

    /// Observe the raw bytes written to and read from the transport.
    ///
    /// Purely diagnostic; taps see transport chunks, not frame boundaries.
    pub fn wire_tap(&self) -> WireTap {
        WireTap::new(self.inner.taps.subscribe())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.state.get()
    }

    /// The banner line the server greeted with.
    pub fn banner(&self) -> &str {
        &self.inner.banner
    }

    /// Close the session immediately, without a logoff exchange.
    ///
    /// Idempotent. Pending actions fail with
    /// [`AmiError::ConnectionClosed`] and subscriber streams end.
    pub fn close(&self) {
        teardown(&self.inner);
    }

    /// Hand one encoded frame to the writer task.
    fn queue_frame(&self, frame: Bytes) -> AmiResult<()> {
        let write_tx = self.inner.write_tx.lock().expect("write channel lock poisoned");
        let Some(tx) = write_tx.as_ref() else {
            return Err(AmiError::ConnectionClosed);
        };
        if tx.send(frame).is_err() {
            return Err(AmiError::ConnectionClosed);
        }
        Ok(())
    }
}

impl Drop for AmiClient {
    fn drop(&mut self) {
        teardown(&self.inner);
    }
}

// ─── Background tasks ────────────────────────────────────────────────────────

/// Read transport chunks until the banner line completes. Frames that arrive
/// piggybacked on the same chunks are collected for the reader to dispatch.
/// Every failure in this phase surfaces as [`AmiError::Handshake`].
async fn read_banner<R: AsyncRead + Unpin>(
    read_half: &mut R,
    decoder: &mut FrameDecoder,
    early: &mut Vec<AmiMessage>,
) -> AmiResult<String> {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        if let Some(banner) = decoder.banner() {
            return Ok(banner.to_string());
        }
        let n = read_half
            .read(&mut buf)
            .await
            .map_err(|e| AmiError::Handshake(format!("transport error before banner: {e}")))?;
        if n == 0 {
            return Err(AmiError::Handshake("transport closed before banner".into()));
        }
        match decoder.feed(&buf[..n]) {
            Ok(frames) => early.extend(frames),
            Err(e) => {
                return Err(AmiError::Handshake(format!("broken framing before banner: {e}")));
            }
        }
    }
}

/// Background loop owning the receive half: decode, correlate, fan out.
async fn read_loop<S>(
    mut read_half: ReadHalf<S>,
    mut decoder: FrameDecoder,
    early: Vec<AmiMessage>,
    mut shutdown_rx: oneshot::Receiver<()>,
    inner: Arc<ClientInner>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    for message in early {
        route_message(&inner, message);
    }

    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                log::debug!("[Reader] Shutdown requested");
                break;
            }
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        log::info!("[Reader] Transport closed by server");
                        break;
                    }
                    Ok(n) => {
                        if inner.taps.is_active() {
                            inner.taps.publish(&WireEvent::Received(Bytes::copy_from_slice(&buf[..n])));
                        }
                        match decoder.feed(&buf[..n]) {
                            Ok(messages) => {
                                for message in messages {
                                    route_message(&inner, message);
                                }
                            }
                            Err(e) => {
                                log::error!("[Reader] Fatal decode failure: {e}");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("[Reader] Read error: {e}");
                        break;
                    }
                }
            }
        }
    }
    teardown(&inner);
    // Subscriber streams end strictly after the last routed frame.
    inner.messages.close();
    inner.taps.close();
    log::debug!("[Reader] Exited");
}

/// Background loop owning the send half. Frames arrive pre-encoded over the
/// channel, so bytes of concurrent publishes never interleave.
async fn write_loop<S>(
    mut write_half: WriteHalf<S>,
    mut write_rx: mpsc::UnboundedReceiver<Bytes>,
    inner: Arc<ClientInner>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    while let Some(frame) = write_rx.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            log::warn!("[Writer] Write error: {e}");
            break;
        }
        if let Err(e) = write_half.flush().await {
            log::warn!("[Writer] Flush error: {e}");
            break;
        }
        if inner.taps.is_active() {
            inner.taps.publish(&WireEvent::Sent(frame));
        }
    }
    // A dead write half must still fail pending actions even if the read
    // half has not noticed yet.
    teardown(&inner);
    log::debug!("[Writer] Exited");
}

/// Deliver one decoded frame: resolve its waiter first, then publish to the
/// stream. Responses must never reach the stream before their waiter.
fn route_message(inner: &ClientInner, message: AmiMessage) {
    match message.classify() {
        Classification::Response => {
            if let Some(id) = message.action_id() {
                if inner.pending.resolve(id, message.clone()) {
                    log::debug!("[Reader] Resolved action {id}");
                } else {
                    log::debug!("[Reader] Response for unknown action {id}; stream only");
                }
            }
        }
        Classification::Malformed => {
            log::warn!("[Reader] Frame with ambiguous classification ({} pairs)", message.len());
        }
        Classification::Action | Classification::Event => {}
    }
    inner.messages.publish(&message);
}

/// Tear the session down exactly once: mark it closed, stop both tasks, and
/// fail every pending action. Subscriber streams are not closed here; the
/// reader closes them at exit, after its final route.
fn teardown(inner: &ClientInner) {
    if !inner.state.close() {
        return;
    }
    inner
        .write_tx
        .lock()
        .expect("write channel lock poisoned")
        .take();
    if let Some(tx) = inner
        .shutdown_tx
        .lock()
        .expect("shutdown channel lock poisoned")
        .take()
    {
        let _ = tx.send(());
    }
    let failed = inner.pending.fail_all();
    if failed > 0 {
        log::warn!("[AmiClient] Session closed with {failed} pending action(s)");
    }
    log::info!("[AmiClient] Session closed");
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// True if the frame's `Response` value matches any of `accepted`,
/// case-insensitively.
fn response_reports(message: &AmiMessage, accepted: &[&str]) -> bool {
    message
        .get(key::RESPONSE)
        .is_some_and(|value| accepted.iter().any(|a| value.eq_ignore_ascii_case(a)))
}

/// Lowercase hex `md5(challenge + secret)`, the digest the server expects
/// under `Key` for challenge-mode login.
fn challenge_digest(challenge: &str, secret: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(challenge.as_bytes());
    hasher.update(secret.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_digest_known_vector() {
        // md5("112233" + "secret")
        assert_eq!(
            challenge_digest("112233", "secret"),
            "e2939912687803dadfe58317032d5a99"
        );
    }

    #[test]
    fn test_options_defaults() {
        let options = ClientOptions::default();
        assert_eq!(options.banner_timeout, Duration::from_secs(10));
        assert!(options.action_timeout.is_none());
    }

    #[test]
    fn test_response_reports_matches_case_insensitively() {
        let goodbye: AmiMessage = [("Response", "goodbye")].into_iter().collect();
        assert!(response_reports(&goodbye, &["Goodbye", "Success"]));
        let error: AmiMessage = [("Response", "Error")].into_iter().collect();
        assert!(!response_reports(&error, &["Goodbye", "Success"]));
    }
}
