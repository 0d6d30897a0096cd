//! Persistent bidirectional channel over a WebSocket.
//!
//! Each side numbers its own requests; responses carry the response flag and
//! the requester's id. Outbound frames go through a bounded writer queue,
//! inbound request frames are handed to the network-wide dispatch pool and
//! the reader waits for room there instead of dropping work.

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::frame::{FrameCodec, HEADER_LEN};
use super::TransportLimits;
use crate::p2p::error::TransportError;

const OUTBOUND_QUEUE: usize = 64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

type Pending = oneshot::Sender<Result<Vec<u8>, TransportError>>;

/// A request frame received on a channel, waiting for a dispatch worker.
pub struct InboundRequest {
    pub channel: Arc<Channel>,
    pub id: u64,
    pub payload: Vec<u8>,
}

pub struct Channel {
    id: u64,
    remote: String,
    codec: FrameCodec,
    limits: TransportLimits,
    outbound: mpsc::Sender<Vec<u8>>,
    dispatch: mpsc::Sender<InboundRequest>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_request: AtomicU64,
    open: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Channel {
    fn new(
        remote: String,
        limits: TransportLimits,
        outbound: mpsc::Sender<Vec<u8>>,
        dispatch: mpsc::Sender<InboundRequest>,
    ) -> Self {
        Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            codec: FrameCodec::new(&limits),
            limits,
            outbound,
            dispatch,
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            open: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Open a client channel to `url` (`ws://host:port/forge`).
    pub async fn connect(
        url: &str,
        remote: &str,
        limits: TransportLimits,
        connect_timeout: Duration,
        dispatch: mpsc::Sender<InboundRequest>,
    ) -> Result<Arc<Self>, TransportError> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(limits.max_message_size + HEADER_LEN);
        config.max_frame_size = Some(limits.max_message_size + HEADER_LEN);
        let connecting = tokio_tungstenite::connect_async_with_config(url, Some(config), true);
        let (ws, _) = tokio::time::timeout(connect_timeout, connecting)
            .await
            .map_err(|_| TransportError::Timeout(connect_timeout.as_millis() as u64))??;
        debug!(peer = %remote, "[CHANNEL] Opened outbound channel");
        Ok(Self::client(ws, remote.to_string(), limits, dispatch))
    }

    /// Wrap an established client-side WebSocket.
    pub fn client(
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        remote: String,
        limits: TransportLimits,
        dispatch: mpsc::Sender<InboundRequest>,
    ) -> Arc<Self> {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
        let channel = Arc::new(Self::new(remote, limits, tx, dispatch));

        let writer = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if sink.send(WsMessage::Binary(bytes)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });
        let reader_channel = channel.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(WsMessage::Binary(bytes)) => {
                        if let Err(e) = reader_channel.on_frame(bytes).await {
                            debug!(peer = %reader_channel.remote, error = %e, "[CHANNEL] Dropping channel");
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            reader_channel.close();
        });
        channel.track(writer.abort_handle());
        channel.track(reader.abort_handle());
        channel
    }

    /// Wrap an accepted server-side WebSocket.
    pub fn server(
        socket: WebSocket,
        remote: String,
        limits: TransportLimits,
        dispatch: mpsc::Sender<InboundRequest>,
    ) -> Arc<Self> {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
        let channel = Arc::new(Self::new(remote, limits, tx, dispatch));

        let writer = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if sink.send(AxumMessage::Binary(bytes)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });
        let reader_channel = channel.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(AxumMessage::Binary(bytes)) => {
                        if let Err(e) = reader_channel.on_frame(bytes).await {
                            debug!(peer = %reader_channel.remote, error = %e, "[CHANNEL] Dropping channel");
                            break;
                        }
                    }
                    Ok(AxumMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            reader_channel.close();
        });
        channel.track(writer.abort_handle());
        channel.track(reader.abort_handle());
        channel
    }

    fn track(&self, handle: AbortHandle) {
        if self.is_open() {
            self.tasks.lock().push(handle);
        } else {
            handle.abort();
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Send a request and wait up to `timeout` for the matching response.
    pub async fn request(
        &self,
        payload: &[u8],
        timeout: Duration,
        max_response: usize,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        if payload.len() > self.limits.max_request_size {
            return Err(TransportError::Frame(format!(
                "request of {} bytes exceeds the {} byte limit",
                payload.len(),
                self.limits.max_request_size
            )));
        }
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let frame = self.codec.encode(id, false, payload)?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if !self.is_open() {
            // close() may have drained before our insert
            self.pending.lock().remove(&id);
            return Err(TransportError::Closed);
        }

        if self.outbound.send(frame).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(TransportError::Closed);
        }
        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(TransportError::Timeout(timeout.as_millis() as u64));
            }
        };
        if response.len() > max_response {
            return Err(TransportError::SizeExceeded { limit: max_response });
        }
        Ok(response)
    }

    /// Answer an inbound request received on this channel.
    pub async fn respond(&self, id: u64, payload: &[u8]) -> Result<(), TransportError> {
        let frame = self.codec.encode(id, true, payload)?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn on_frame(self: &Arc<Self>, bytes: Vec<u8>) -> Result<(), TransportError> {
        let frame = self.codec.decode(&bytes)?;
        if frame.response {
            let waiter = self.pending.lock().remove(&frame.id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(Ok(frame.payload));
                }
                None => debug!(peer = %self.remote, id = frame.id, "[CHANNEL] Response for unknown request"),
            }
            return Ok(());
        }
        if frame.payload.len() > self.limits.max_request_size {
            return Err(TransportError::SizeExceeded {
                limit: self.limits.max_request_size,
            });
        }
        self.dispatch
            .send(InboundRequest {
                channel: self.clone(),
                id: frame.id,
                payload: frame.payload,
            })
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Stop both socket tasks and fail every pending request with `Closed`.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        let pending: Vec<Pending> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(TransportError::Closed));
        }
        debug!(peer = %self.remote, channel = self.id, "[CHANNEL] Closed");
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}
