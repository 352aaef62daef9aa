use super::mux::{Multiplexor, Shared, StreamState};
use super::packet::{CloseReason, Packet};
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::sync::mpsc;
use tracing::trace;

const DUPLEX_CAPACITY: usize = 64 * 1024;
/// Largest payload put in a single DATA packet.
const MAX_DATA_CHUNK: usize = 16 * 1024;

/// Observes a stream's close reason after the stream itself was handed to
/// TLS or HTTP.
#[derive(Clone)]
pub struct StreamHandle {
    state: Arc<StreamState>,
}

impl StreamHandle {
    pub(crate) fn new(state: Arc<StreamState>) -> Self {
        Self { state }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.close_reason()
    }
}

/// A TCP stream tunneled over Wisp.
///
/// Bytes written here become DATA packets once flow-control credit allows.
/// Reads return EOF after the server closes the stream.
pub struct WispStream {
    id: u32,
    io: DuplexStream,
    handle: StreamHandle,
    _connection: Arc<Multiplexor>,
}

impl WispStream {
    pub(crate) fn spawn(
        id: u32,
        handle: StreamHandle,
        incoming: mpsc::UnboundedReceiver<Bytes>,
        outgoing: mpsc::UnboundedSender<Packet>,
        shared: Arc<Shared>,
        connection: Arc<Multiplexor>,
    ) -> Self {
        let (local, remote) = tokio::io::duplex(DUPLEX_CAPACITY);
        let (remote_read, remote_write) = tokio::io::split(remote);
        tokio::spawn(pump_upstream(id, remote_read, handle.clone(), outgoing, shared));
        tokio::spawn(pump_downstream(remote_write, incoming));
        Self {
            id,
            io: local,
            handle,
            _connection: connection,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }
}

async fn pump_upstream(
    id: u32,
    mut reader: ReadHalf<DuplexStream>,
    handle: StreamHandle,
    outgoing: mpsc::UnboundedSender<Packet>,
    shared: Arc<Shared>,
) {
    let mut buf = vec![0u8; MAX_DATA_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if handle.state.acquire().await.is_err() {
            return;
        }
        let packet = Packet::data(id, Bytes::copy_from_slice(&buf[..n]));
        if outgoing.send(packet).is_err() {
            return;
        }
    }
    if shared.remove(id) {
        trace!(stream = id, "local side finished, closing wisp stream");
        handle.state.close(CloseReason::Voluntary);
        let _ = outgoing.send(Packet::close(id, CloseReason::Voluntary));
    }
}

async fn pump_downstream(
    mut writer: WriteHalf<DuplexStream>,
    mut incoming: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(data) = incoming.recv().await {
        if writer.write_all(&data).await.is_err() {
            return;
        }
    }
    let _ = writer.shutdown().await;
}

impl AsyncRead for WispStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for WispStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
