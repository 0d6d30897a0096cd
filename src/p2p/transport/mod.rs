//! Moving request bytes to a peer and its response bytes back.
//!
//! A send goes over the peer's persistent channel when one can be opened and
//! falls back to a one-shot HTTP exchange otherwise. Both paths enforce the
//! same size caps.

pub mod channel;
pub mod frame;
pub mod oneshot;

pub use channel::{Channel, InboundRequest};
pub use frame::{Frame, FrameCodec};
pub use oneshot::{OneShotClient, SizeLimit};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::address::host_for_url;
use super::error::TransportError;
use super::peer::Peer;
use crate::config::NetworkConfig;

/// Byte caps shared by both delivery modes.
#[derive(Debug, Clone, Copy)]
pub struct TransportLimits {
    pub max_message_size: usize,
    pub max_request_size: usize,
    pub max_response_size: usize,
    pub min_compress_size: usize,
}

impl TransportLimits {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            max_request_size: config.max_request_size,
            max_response_size: config.max_response_size,
            min_compress_size: config.min_compress_size,
        }
    }
}

/// How one outbound message reaches its peer.
pub enum Delivery {
    Persistent(Arc<Channel>),
    OneShot,
}

pub struct Transport {
    limits: TransportLimits,
    oneshot: OneShotClient,
    persistent: bool,
    connect_timeout: Duration,
    read_timeout: Duration,
    dispatch: mpsc::Sender<InboundRequest>,
}

impl Transport {
    pub fn new(
        config: &NetworkConfig,
        dispatch: mpsc::Sender<InboundRequest>,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            limits: TransportLimits::from_config(config),
            oneshot: OneShotClient::new(config)?,
            persistent: config.use_persistent_channels && config.proxy.is_none(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            dispatch,
        })
    }

    pub fn limits(&self) -> TransportLimits {
        self.limits
    }

    pub fn uses_persistent_channels(&self) -> bool {
        self.persistent
    }

    pub fn dispatch(&self) -> mpsc::Sender<InboundRequest> {
        self.dispatch.clone()
    }

    /// Pick the delivery mode for the next message to `peer`, opening a
    /// channel if persistent delivery is enabled and none is open yet.
    pub async fn delivery(&self, peer: &Arc<Peer>) -> Delivery {
        if !self.persistent {
            return Delivery::OneShot;
        }
        if let Some(channel) = peer.channel() {
            return Delivery::Persistent(channel);
        }
        let url = format!("ws://{}:{}/forge", host_for_url(peer.host()), peer.port());
        match Channel::connect(
            &url,
            peer.host(),
            self.limits,
            self.connect_timeout,
            self.dispatch.clone(),
        )
        .await
        {
            Ok(channel) => {
                peer.set_channel(channel.clone());
                Delivery::Persistent(channel)
            }
            Err(e) => {
                debug!(peer = %peer.host(), error = %e, "[TRANSPORT] No channel, using one-shot request");
                Delivery::OneShot
            }
        }
    }

    /// Send `body` to `peer` and return the raw response bytes.
    pub async fn exchange(
        &self,
        peer: &Arc<Peer>,
        body: Vec<u8>,
        max_response: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let max_response = max_response.min(self.limits.max_message_size);
        match self.delivery(peer).await {
            Delivery::Persistent(channel) => {
                let result = channel.request(&body, self.read_timeout, max_response).await;
                if matches!(result, Err(TransportError::Closed)) {
                    peer.close_channel();
                }
                result
            }
            Delivery::OneShot => {
                self.oneshot
                    .post(peer.host(), peer.port(), body, max_response)
                    .await
            }
        }
    }
}
