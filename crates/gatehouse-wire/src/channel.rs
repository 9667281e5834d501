//! RpcChannel — id-correlated calls multiplexed over one gateway WebSocket.
//!
//! Each channel owns two background tasks: a writer draining an outbound
//! queue into the socket, and a reader that matches inbound responses to
//! pending calls by request id. Responses may arrive in any order; each one
//! settles exactly the call that sent its id. A call that times out removes
//! its pending entry, so a response arriving afterwards is discarded.
//!
//! The channel never closes itself on a timed-out call. Closing is the
//! owner's job (one-shot operations close, pooled ones release).

use crate::error::WireError;
use crate::message::{decode_frame, encode_request, RpcRequest};
use crate::transport::GatewayConnection;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

/// Outbound frames queued ahead of the socket.
const OUTBOUND_BUFFER: usize = 64;

/// How long `close` waits for the close frame to be flushed.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

type Completion = oneshot::Sender<Result<Value, WireError>>;
type PendingMap = DashMap<String, Completion>;

/// A multiplexed RPC connection to one gateway.
pub struct RpcChannel {
    /// Short random tag; prefixes request ids and identifies the connection in logs.
    tag: String,
    /// `host[:port]` of the gateway, for logs.
    gateway: String,
    outbound: mpsc::Sender<Message>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    open: Arc<AtomicBool>,
    closing: AtomicBool,
    pongs: watch::Receiver<u64>,
    ping_seq: AtomicU64,
    ping_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl RpcChannel {
    /// Start serving calls over an already-upgraded WebSocket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S>(stream: WebSocketStream<S>, gateway: impl Into<String>, ping_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let tag = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let gateway = gateway.into();
        let (sink, inbound) = stream.split();
        let (outbound, queue) = mpsc::channel(OUTBOUND_BUFFER);
        let (pong_tx, pongs) = watch::channel(0u64);
        let pending = Arc::new(PendingMap::new());
        let open = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(
            inbound,
            Arc::clone(&pending),
            Arc::clone(&open),
            pong_tx,
            tag.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            sink,
            queue,
            Arc::clone(&pending),
            Arc::clone(&open),
            tag.clone(),
        ));

        debug!(gateway = %gateway, connection = %tag, "RPC channel started");

        Self {
            tag,
            gateway,
            outbound,
            pending,
            next_id: AtomicU64::new(0),
            open,
            closing: AtomicBool::new(false),
            pongs,
            ping_seq: AtomicU64::new(0),
            ping_timeout,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Connection tag used in request ids and logs.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Gateway this channel talks to.
    pub fn gateway(&self) -> &str {
        &self.gateway
    }

    /// Number of calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Ids are never reused within the lifetime of a channel.
    fn next_request_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{n}", self.tag)
    }

    fn take_task(slot: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
        slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[async_trait]
impl GatewayConnection for RpcChannel {
    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, WireError> {
        if !self.is_open() {
            return Err(WireError::ConnectionClosed);
        }

        let id = self.next_request_id();
        let frame = encode_request(&RpcRequest {
            id: id.clone(),
            method: method.to_string(),
            params,
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: &id,
        };

        // The reader flips `open` before failing pending calls, so an entry
        // inserted before this check is always settled.
        if !self.is_open() {
            return Err(WireError::ConnectionClosed);
        }

        trace!(connection = %self.tag, id = %id, method, "Sending RPC request");
        let exchange = async {
            self.outbound
                .send(Message::Text(frame))
                .await
                .map_err(|_| WireError::ConnectionClosed)?;
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(WireError::ConnectionClosed),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    gateway = %self.gateway,
                    connection = %self.tag,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    "RPC call timed out"
                );
                Err(WireError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    async fn ping(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        let mut pongs = self.pongs.clone();

        // Sequence numbers start at 1; the watch starts at 0.
        let seq = self.ping_seq.fetch_add(1, Ordering::Relaxed) + 1;
        if self
            .outbound
            .send(Message::Ping(seq.to_be_bytes().to_vec()))
            .await
            .is_err()
        {
            return false;
        }
        // Pongs echo the ping payload. One for this ping or a later one
        // counts; a late answer to an earlier ping does not.
        let answered = matches!(
            tokio::time::timeout(self.ping_timeout, pongs.wait_for(|latest| *latest >= seq)).await,
            Ok(Ok(_))
        );
        answered
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);

        let _ = tokio::time::timeout(CLOSE_GRACE, self.outbound.send(Message::Close(None))).await;
        if let Some(writer) = Self::take_task(&self.writer) {
            let abort = writer.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
                abort.abort();
            }
        }
        if let Some(reader) = Self::take_task(&self.reader) {
            reader.abort();
        }
        fail_pending(&self.pending);
        debug!(gateway = %self.gateway, connection = %self.tag, "Gateway connection closed");
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        for slot in [&self.reader, &self.writer] {
            if let Some(task) = Self::take_task(slot) {
                task.abort();
            }
        }
    }
}

/// Removes a pending entry however the call ends: response, timeout, send
/// failure, or the caller dropping the future.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

fn fail_pending(pending: &PendingMap) {
    let ids: Vec<String> = pending.iter().map(|entry| entry.key().clone()).collect();
    for id in ids {
        if let Some((_, completion)) = pending.remove(&id) {
            let _ = completion.send(Err(WireError::ConnectionClosed));
        }
    }
}

fn dispatch_frame(text: &str, pending: &PendingMap, tag: &str) {
    let frame = match decode_frame(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection = %tag, error = %e, "Ignoring malformed gateway frame");
            return;
        }
    };
    let Some(id) = frame.id.clone() else {
        trace!(connection = %tag, "Ignoring gateway event frame");
        return;
    };
    match pending.remove(&id) {
        Some((_, completion)) => {
            let _ = completion.send(frame.into_outcome());
        }
        None => debug!(connection = %tag, id = %id, "Discarding response for unknown or expired request"),
    }
}

async fn read_loop<S>(
    mut inbound: SplitStream<WebSocketStream<S>>,
    pending: Arc<PendingMap>,
    open: Arc<AtomicBool>,
    pongs: watch::Sender<u64>,
    tag: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch_frame(&text, &pending, &tag),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => dispatch_frame(&text, &pending, &tag),
                Err(_) => debug!(connection = %tag, "Ignoring non-UTF-8 binary frame"),
            },
            Ok(Message::Pong(payload)) => match <[u8; 8]>::try_from(payload.as_slice()) {
                Ok(bytes) => {
                    let seq = u64::from_be_bytes(bytes);
                    pongs.send_if_modified(|latest| {
                        let newer = seq > *latest;
                        if newer {
                            *latest = seq;
                        }
                        newer
                    });
                }
                Err(_) => trace!(connection = %tag, "Ignoring unsolicited pong"),
            },
            Ok(Message::Close(frame)) => {
                debug!(connection = %tag, ?frame, "Gateway closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(connection = %tag, error = %e, "Gateway connection error");
                break;
            }
        }
    }
    open.store(false, Ordering::SeqCst);
    fail_pending(&pending);
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut queue: mpsc::Receiver<Message>,
    pending: Arc<PendingMap>,
    open: Arc<AtomicBool>,
    tag: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = queue.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(connection = %tag, error = %e, "Gateway write failed");
            open.store(false, Ordering::SeqCst);
            fail_pending(&pending);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RpcResponse;
    use serde_json::json;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    type ServerSocket = WebSocketStream<DuplexStream>;

    async fn channel_pair() -> (RpcChannel, ServerSocket) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        (
            RpcChannel::start(client, "test-gateway", Duration::from_millis(500)),
            server,
        )
    }

    async fn next_request(server: &mut ServerSocket) -> RpcRequest {
        loop {
            match server.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("expected a request frame, got {other:?}"),
            }
        }
    }

    async fn reply(server: &mut ServerSocket, response: RpcResponse) {
        let text = serde_json::to_string(&response).unwrap();
        server.send(Message::Text(text)).await.unwrap();
    }

    #[tokio::test]
    async fn test_call_resolves_result() {
        let (channel, mut server) = channel_pair().await;
        let (result, _) = tokio::join!(
            channel.call("sessions.list", json!({}), Duration::from_secs(2)),
            async {
                let req = next_request(&mut server).await;
                assert_eq!(req.method, "sessions.list");
                assert_eq!(req.params, json!({}));
                reply(&mut server, RpcResponse::success(req.id, json!({"sessions": []}))).await;
            }
        );
        assert_eq!(result.unwrap(), json!({"sessions": []}));
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_match_by_id() {
        let (channel, mut server) = channel_pair().await;
        let timeout = Duration::from_secs(2);
        let (first, second, _) = tokio::join!(
            channel.call("chat.history", json!({"sessionKey": "a"}), timeout),
            channel.call("chat.history", json!({"sessionKey": "b"}), timeout),
            async {
                let r1 = next_request(&mut server).await;
                let r2 = next_request(&mut server).await;
                // Answer in reverse order, echoing the session key.
                for req in [r2, r1] {
                    let key = req.params["sessionKey"].clone();
                    reply(&mut server, RpcResponse::success(req.id, json!({"echo": key}))).await;
                }
            }
        );
        assert_eq!(first.unwrap(), json!({"echo": "a"}));
        assert_eq!(second.unwrap(), json!({"echo": "b"}));
    }

    #[tokio::test]
    async fn test_remote_error_rejects_call() {
        let (channel, mut server) = channel_pair().await;
        let (result, _) = tokio::join!(
            channel.call("chat.nope", json!({}), Duration::from_secs(2)),
            async {
                let req = next_request(&mut server).await;
                reply(&mut server, RpcResponse::failure(req.id, "unknown method: chat.nope")).await;
            }
        );
        assert_eq!(
            result.unwrap_err(),
            WireError::Remote("unknown method: chat.nope".to_string())
        );
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_discarded() {
        let (channel, mut server) = channel_pair().await;

        let (result, stale) = tokio::join!(
            channel.call("sessions.list", json!({}), Duration::from_millis(50)),
            next_request(&mut server)
        );
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "RPC call timeout: sessions.list");
        assert_eq!(channel.pending_calls(), 0);
        assert!(channel.is_open(), "a timeout must not close the connection");

        // Late answer for the expired id, then a fresh call on the same connection.
        reply(&mut server, RpcResponse::success(stale.id.clone(), json!("stale"))).await;
        let (fresh, _) = tokio::join!(
            channel.call("sessions.list", json!({}), Duration::from_secs(2)),
            async {
                let req = next_request(&mut server).await;
                assert_ne!(req.id, stale.id);
                reply(&mut server, RpcResponse::success(req.id, json!("fresh"))).await;
            }
        );
        assert_eq!(fresh.unwrap(), json!("fresh"));
    }

    #[tokio::test]
    async fn test_event_frames_are_ignored() {
        let (channel, mut server) = channel_pair().await;
        let (result, _) = tokio::join!(
            channel.call("chat.send", json!({}), Duration::from_secs(2)),
            async {
                let req = next_request(&mut server).await;
                server
                    .send(Message::Text(r#"{"type":"event","event":"tick"}"#.to_string()))
                    .await
                    .unwrap();
                reply(&mut server, RpcResponse::success(req.id, json!({"ok": true}))).await;
            }
        );
        assert_eq!(result.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_remote_close_fails_pending_calls() {
        let (channel, mut server) = channel_pair().await;
        let (result, _) = tokio::join!(
            channel.call("chat.history", json!({}), Duration::from_secs(5)),
            async {
                next_request(&mut server).await;
                server.close(None).await.unwrap();
            }
        );
        assert_eq!(result.unwrap_err(), WireError::ConnectionClosed);
        assert!(!channel.is_open());
        assert_eq!(
            channel
                .call("sessions.list", json!({}), Duration::from_secs(1))
                .await
                .unwrap_err(),
            WireError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (channel, _server) = channel_pair().await;
        channel.close().await;
        channel.close().await;
        assert!(!channel.is_open());
        assert!(!channel.ping().await);
        assert_eq!(
            channel
                .call("sessions.list", json!({}), Duration::from_secs(1))
                .await
                .unwrap_err(),
            WireError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let (channel, mut server) = channel_pair().await;
        // The server answers pings automatically while it is being read.
        let drain = tokio::spawn(async move { while server.next().await.is_some() {} });
        assert!(channel.ping().await);
        drain.abort();
    }

    #[tokio::test]
    async fn test_ping_times_out_when_unread() {
        let (channel, _server) = channel_pair().await;
        assert!(!channel.ping().await);
    }

    #[tokio::test]
    async fn test_ping_ignores_stale_and_unsolicited_pongs() {
        let (channel, mut server) = channel_pair().await;
        let channel = Arc::new(channel);

        let first = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.ping().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The server never reads, so it never answers the ping itself. It
        // only sends pongs that belong to no outstanding ping.
        server
            .send(Message::Pong(0u64.to_be_bytes().to_vec()))
            .await
            .unwrap();
        server.send(Message::Pong(b"hb".to_vec())).await.unwrap();

        assert!(!first.await.unwrap());

        // An answer to the first ping arriving late cannot pass the second.
        let second = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.ping().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        server
            .send(Message::Pong(1u64.to_be_bytes().to_vec()))
            .await
            .unwrap();
        assert!(!second.await.unwrap());

        // The matching pong does.
        let third = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.ping().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        server
            .send(Message::Pong(3u64.to_be_bytes().to_vec()))
            .await
            .unwrap();
        assert!(third.await.unwrap());
    }

    #[tokio::test]
    async fn test_request_ids_are_unique() {
        let (channel, _server) = channel_pair().await;
        let a = channel.next_request_id();
        let b = channel.next_request_id();
        assert_ne!(a, b);
        assert!(a.starts_with(channel.tag()));
    }
}
