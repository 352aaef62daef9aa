use super::packet::{CloseReason, Packet, Payload, StreamType};
use super::stream::{StreamHandle, WispStream};
use crate::error::TunnelError;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as WsRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, USER_AGENT};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One Wisp connection carrying many logical streams.
///
/// A reader task dispatches incoming packets to their streams and a writer
/// task serializes everything queued on `outgoing`. Dropping the last handle
/// closes every stream still open on the connection.
pub struct Multiplexor {
    url: String,
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Packet>,
    next_stream_id: AtomicU32,
    initial_credit: u32,
    reader: JoinHandle<()>,
}

pub(crate) struct Shared {
    streams: Mutex<HashMap<u32, StreamSlot>>,
    closed: OnceLock<CloseReason>,
}

struct StreamSlot {
    incoming: mpsc::UnboundedSender<Bytes>,
    state: Arc<StreamState>,
}

/// Flow-control and close state of one stream.
pub(crate) struct StreamState {
    credit: Mutex<u32>,
    credit_ready: Notify,
    reason: OnceLock<CloseReason>,
}

impl StreamState {
    fn new(initial_credit: u32) -> Self {
        Self {
            credit: Mutex::new(initial_credit),
            credit_ready: Notify::new(),
            reason: OnceLock::new(),
        }
    }

    fn grant(&self, buffer_remaining: u32) {
        *self.credit.lock().unwrap_or_else(|e| e.into_inner()) = buffer_remaining;
        self.credit_ready.notify_one();
    }

    pub(crate) fn close(&self, reason: CloseReason) {
        let _ = self.reason.set(reason);
        self.credit_ready.notify_one();
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    /// Wait until one DATA packet may be sent.
    pub(crate) async fn acquire(&self) -> Result<(), CloseReason> {
        loop {
            if let Some(reason) = self.close_reason() {
                return Err(reason);
            }
            {
                let mut credit = self.credit.lock().unwrap_or_else(|e| e.into_inner());
                if *credit > 0 {
                    *credit -= 1;
                    return Ok(());
                }
            }
            self.credit_ready.notified().await;
        }
    }
}

impl Shared {
    fn dispatch(&self, packet: Packet) {
        let id = packet.stream_id;
        match packet.payload {
            Payload::Data(data) => {
                let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
                match streams.get(&id) {
                    Some(slot) => {
                        let _ = slot.incoming.send(data);
                    }
                    None => trace!(stream = id, "DATA for unknown stream"),
                }
            }
            Payload::Continue { buffer_remaining } => {
                if id == 0 {
                    return;
                }
                let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(slot) = streams.get(&id) {
                    slot.state.grant(buffer_remaining);
                }
            }
            Payload::Close(reason) if id == 0 => {
                debug!(%reason, "wisp server closed the connection");
                self.shutdown(reason);
            }
            Payload::Close(reason) => {
                let removed = self
                    .streams
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                if let Some(slot) = removed {
                    debug!(stream = id, %reason, "wisp stream closed by server");
                    slot.state.close(reason);
                }
            }
            Payload::Connect { .. } => warn!(stream = id, "ignoring CONNECT sent by server"),
        }
    }

    /// Close the connection and every stream on it. The first reason sticks.
    pub(crate) fn shutdown(&self, reason: CloseReason) {
        let _ = self.closed.set(reason);
        let reason = self.closed.get().copied().unwrap_or(reason);
        let drained: Vec<StreamSlot> = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in drained {
            slot.state.close(reason);
        }
    }

    /// Forget a stream the local side finished with. Returns whether it was
    /// still open.
    pub(crate) fn remove(&self, id: u32) -> bool {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }
}

impl Multiplexor {
    /// Open the WebSocket, then wait for the server's initial CONTINUE.
    pub async fn connect(
        url: &str,
        user_agent: &str,
        connect_timeout: Duration,
        tls: Arc<rustls::ClientConfig>,
    ) -> Result<Arc<Self>, TunnelError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TunnelError::Config(format!("invalid Wisp server URL {url}: {e}")))?;
        let agent = HeaderValue::from_str(user_agent)
            .map_err(|e| TunnelError::Config(format!("invalid user agent: {e}")))?;
        request.headers_mut().insert(USER_AGENT, agent);

        let (ws, initial_credit) = tokio::time::timeout(connect_timeout, handshake(request, tls))
            .await
            .map_err(|_| {
                TunnelError::Transport(format!(
                    "timed out after {}s connecting to {url}",
                    connect_timeout.as_secs()
                ))
            })??;
        debug!(url, initial_credit, "wisp connection established");

        let shared = Arc::new(Shared {
            streams: Mutex::new(HashMap::new()),
            closed: OnceLock::new(),
        });
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (sink, stream) = ws.split();
        let reader = tokio::spawn(read_loop(stream, shared.clone()));
        tokio::spawn(write_loop(sink, outgoing_rx, shared.clone()));

        Ok(Arc::new(Self {
            url: url.to_string(),
            shared,
            outgoing,
            next_stream_id: AtomicU32::new(1),
            initial_credit,
            reader,
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.closed.get().copied()
    }

    /// Open a TCP stream to `host:port` through the Wisp server.
    pub fn open_tcp(self: &Arc<Self>, host: &str, port: u16) -> Result<WispStream, TunnelError> {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let state = Arc::new(StreamState::new(self.initial_credit));

        {
            let mut streams = self.shared.streams.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(reason) = self.shared.closed.get() {
                return Err(TunnelError::from(*reason));
            }
            streams.insert(
                id,
                StreamSlot {
                    incoming: incoming_tx,
                    state: state.clone(),
                },
            );
        }

        if self
            .outgoing
            .send(Packet::connect(id, StreamType::Tcp, host, port))
            .is_err()
        {
            self.shared.remove(id);
            return Err(TunnelError::Transport(
                "wisp connection is no longer writable".to_string(),
            ));
        }
        trace!(stream = id, host, port, "wisp stream opened");

        Ok(WispStream::spawn(
            id,
            StreamHandle::new(state),
            incoming_rx,
            self.outgoing.clone(),
            self.shared.clone(),
            self.clone(),
        ))
    }
}

impl Drop for Multiplexor {
    fn drop(&mut self) {
        self.shared.shutdown(CloseReason::Voluntary);
        self.reader.abort();
    }
}

async fn handshake(
    request: WsRequest,
    tls: Arc<rustls::ClientConfig>,
) -> Result<(Ws, u32), TunnelError> {
    let (mut ws, _) =
        connect_async_tls_with_config(request, None, false, Some(Connector::Rustls(tls)))
            .await
            .map_err(TunnelError::transport)?;

    loop {
        let data = match ws.next().await {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => {
                return Err(TunnelError::Transport(
                    "wisp server closed the socket before the handshake".to_string(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(TunnelError::transport(err)),
        };
        let packet = Packet::decode(Bytes::from(data)).map_err(TunnelError::transport)?;
        return match packet.payload {
            Payload::Continue { buffer_remaining } if packet.stream_id == 0 => {
                Ok((ws, buffer_remaining))
            }
            Payload::Close(reason) if packet.stream_id == 0 => Err(TunnelError::from(reason)),
            other => Err(TunnelError::Transport(format!(
                "expected initial CONTINUE, got {other:?}"
            ))),
        };
    }
}

async fn read_loop(mut stream: SplitStream<Ws>, shared: Arc<Shared>) {
    while let Some(message) = stream.next().await {
        let data = match message {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!("wisp socket read failed: {err}");
                break;
            }
        };
        match Packet::decode(Bytes::from(data)) {
            Ok(packet) => shared.dispatch(packet),
            Err(err) => warn!("dropping malformed wisp packet: {err}"),
        }
        if shared.closed.get().is_some() {
            break;
        }
    }
    shared.shutdown(CloseReason::NetworkError);
}

async fn write_loop(
    mut sink: SplitSink<Ws, Message>,
    mut outgoing: mpsc::UnboundedReceiver<Packet>,
    shared: Arc<Shared>,
) {
    while let Some(packet) = outgoing.recv().await {
        if let Err(err) = sink.send(Message::Binary(packet.encode().to_vec())).await {
            debug!("wisp socket write failed: {err}");
            shared.shutdown(CloseReason::NetworkError);
            return;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_with(id: u32, credit: u32) -> (Shared, Arc<StreamState>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(StreamState::new(credit));
        let shared = Shared {
            streams: Mutex::new(HashMap::from([(
                id,
                StreamSlot {
                    incoming: tx,
                    state: state.clone(),
                },
            )])),
            closed: OnceLock::new(),
        };
        (shared, state, rx)
    }

    #[tokio::test]
    async fn test_credit_is_consumed_and_refilled() {
        let (shared, state, _rx) = shared_with(1, 1);
        state.acquire().await.unwrap();

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.acquire().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        shared.dispatch(Packet::continue_with(1, 4));
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_data_is_routed_to_its_stream() {
        let (shared, _state, mut rx) = shared_with(5, 1);
        shared.dispatch(Packet::data(5, Bytes::from_static(b"abc")));
        shared.dispatch(Packet::data(6, Bytes::from_static(b"lost")));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn test_stream_close_wakes_blocked_writer() {
        let (shared, state, mut rx) = shared_with(2, 0);
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.acquire().await })
        };
        shared.dispatch(Packet::close(2, CloseReason::Throttled));
        assert_eq!(waiter.await.unwrap(), Err(CloseReason::Throttled));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_connection_close_applies_to_all_streams() {
        let (shared, state, _rx) = shared_with(3, 8);
        shared.dispatch(Packet::close(0, CloseReason::Throttled));
        shared.shutdown(CloseReason::NetworkError);
        assert_eq!(state.close_reason(), Some(CloseReason::Throttled));
        assert_eq!(shared.closed.get().copied(), Some(CloseReason::Throttled));
        assert!(!shared.remove(3));
    }
}
