//! QUIC server that accepts CSI requests and dispatches them to the plugin.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use quinn::crypto::rustls::QuicServerConfig;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// Upper bound for a single request or response body.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Lifecycle of a [`CsiServer`]: Running, then Stopping, then Stopped.
/// Each transition happens at most once.
#[derive(Debug, Default)]
pub struct ShutdownState(AtomicU8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Stopping,
    Stopped,
}

impl ShutdownState {
    const RUNNING: u8 = 0;
    const STOPPING: u8 = 1;
    const STOPPED: u8 = 2;

    pub fn get(&self) -> ServerState {
        match self.0.load(Ordering::Acquire) {
            Self::RUNNING => ServerState::Running,
            Self::STOPPING => ServerState::Stopping,
            _ => ServerState::Stopped,
        }
    }

    /// Move from Running to Stopping. Only the first caller gets `true`.
    pub fn begin_stop(&self) -> bool {
        self.0
            .compare_exchange(
                Self::RUNNING,
                Self::STOPPING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn finish_stop(&self) {
        self.0.store(Self::STOPPED, Ordering::Release);
    }
}

/// A CSI server that accepts QUIC connections and dispatches
/// [`CsiMessage`] requests to an [`CsiIdentity`] + [`CsiController`] +
/// [`CsiNode`] implementation.
pub struct CsiServer<T> {
    endpoint: quinn::Endpoint,
    handler: Arc<T>,
    state: ShutdownState,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    /// Create a new server bound to `addr`.
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        handler: Arc<T>,
    ) -> Result<Self, CsiError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint = quinn::Endpoint::server(server_config, addr).map_err(CsiError::transport)?;
        info!(%addr, "CSI QUIC server listening");
        Ok(Self {
            endpoint,
            handler,
            state: ShutdownState::default(),
        })
    }

    /// Accept connections until [`Self::shutdown`] closes the endpoint.
    ///
    /// Each accepted connection spawns a Tokio task, and each bi-stream
    /// within a connection is handled concurrently.
    pub async fn serve(&self) -> Result<(), CsiError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!(%remote, "CSI connection accepted");
                        if let Err(e) = Self::handle_connection(conn, handler).await {
                            warn!(%remote, error = %e, "CSI connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "CSI incoming connection failed");
                    }
                }
            });
        }
        debug!("accept loop finished");
        Ok(())
    }

    /// Stop accepting, close open connections and wait for them to drain.
    ///
    /// Safe to call any number of times from any task; only the first call
    /// does the work.
    pub async fn shutdown(&self) {
        if !self.state.begin_stop() {
            debug!(state = ?self.state.get(), "shutdown already requested");
            return;
        }
        info!("stopping CSI server");
        self.endpoint
            .close(quinn::VarInt::from_u32(0), b"server shutdown");
        self.endpoint.wait_idle().await;
        self.state.finish_stop();
        info!("CSI server stopped");
    }

    pub fn state(&self) -> ServerState {
        self.state.get()
    }

    /// Handle all bi-streams on a single connection.
    async fn handle_connection(conn: quinn::Connection, handler: Arc<T>) -> Result<(), CsiError> {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(stream) => stream,
                Err(
                    quinn::ConnectionError::ApplicationClosed(_)
                    | quinn::ConnectionError::LocallyClosed,
                ) => return Ok(()),
                Err(e) => return Err(CsiError::transport(e)),
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, &handler).await {
                    error!(error = %e, "CSI stream handler error");
                }
            });
        }
    }

    /// Process a single bi-stream: read request, dispatch, write response.
    ///
    /// If the peer stops the stream before the response is ready the
    /// handler future is dropped, which cancels any attach wait in flight.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        handler: &T,
    ) -> Result<(), CsiError> {
        let buf = recv
            .read_to_end(MAX_MESSAGE_BYTES)
            .await
            .map_err(CsiError::transport)?;

        let request: CsiMessage = serde_json::from_slice(&buf)
            .map_err(|e| CsiError::TransportError(format!("malformed request: {e}")))?;

        debug!(%request, "CSI request received");

        let response = tokio::select! {
            response = Self::dispatch(handler, request) => response,
            _ = send.stopped() => {
                warn!("caller abandoned the request");
                return Ok(());
            }
        };
        if let CsiMessage::Error(e) = &response {
            warn!(code = %e.code(), error = %e, "CSI request failed");
        }

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;
        Ok(())
    }

    /// Map a [`CsiMessage`] request to the correct trait method call and
    /// wrap the result in a response [`CsiMessage`].
    async fn dispatch(handler: &T, request: CsiMessage) -> CsiMessage {
        match request {
            // --- Identity ---------------------------------------------------
            CsiMessage::Probe => match handler.probe().await {
                Ok(ok) => CsiMessage::ProbeResult(ok),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetPluginInfo => match handler.get_plugin_info().await {
                Ok(info) => CsiMessage::PluginInfoResponse(info),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetPluginCapabilities => match handler.get_plugin_capabilities().await {
                Ok(caps) => CsiMessage::PluginCapabilitiesResponse(caps),
                Err(e) => CsiMessage::Error(e),
            },

            // --- Controller -------------------------------------------------
            CsiMessage::ControllerPublishVolume(req) => {
                match handler.controller_publish_volume(req).await {
                    Ok(ctx) => CsiMessage::Published(ctx),
                    Err(e) => CsiMessage::Error(e),
                }
            }
            CsiMessage::ControllerUnpublishVolume(req) => {
                match handler.controller_unpublish_volume(req).await {
                    Ok(()) => CsiMessage::Ok,
                    Err(e) => CsiMessage::Error(e),
                }
            }
            CsiMessage::ControllerGetVolume(id) => match handler.get_volume(&id).await {
                Ok(status) => CsiMessage::VolumeStatusResponse(status),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::ControllerGetCapabilities => {
                match handler.controller_get_capabilities().await {
                    Ok(caps) => CsiMessage::ControllerCapabilitiesResponse(caps),
                    Err(e) => CsiMessage::Error(e),
                }
            }
            CsiMessage::CreateVolume(req) => match handler.create_volume(req).await {
                Ok(vol) => CsiMessage::VolumeCreated(vol),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::DeleteVolume(id) => match handler.delete_volume(&id).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::ValidateVolumeCapabilities {
                volume_id,
                capabilities,
            } => match handler
                .validate_volume_capabilities(&volume_id, &capabilities)
                .await
            {
                Ok(valid) => CsiMessage::CapabilitiesValid(valid),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::ListVolumes => match handler.list_volumes().await {
                Ok(vols) => CsiMessage::VolumeList(vols),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetCapacity => match handler.get_capacity().await {
                Ok(cap) => CsiMessage::Capacity(cap),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::CreateSnapshot {
                source_volume_id,
                name,
            } => match handler.create_snapshot(&source_volume_id, &name).await {
                Ok(snap) => CsiMessage::SnapshotCreated(snap),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::DeleteSnapshot(id) => match handler.delete_snapshot(&id).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::ListSnapshots => match handler.list_snapshots().await {
                Ok(snaps) => CsiMessage::SnapshotList(snaps),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::ControllerExpandVolume {
                volume_id,
                capacity_bytes,
            } => match handler.expand_volume(&volume_id, capacity_bytes).await {
                Ok(cap) => CsiMessage::Expanded(cap),
                Err(e) => CsiMessage::Error(e),
            },

            // --- Node -------------------------------------------------------
            CsiMessage::NodeStageVolume(req) => match handler.stage_volume(req).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::NodeUnstageVolume(req) => match handler.unstage_volume(req).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::NodePublishVolume(req) => match handler.publish_volume(req).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::NodeUnpublishVolume(req) => match handler.unpublish_volume(req).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::NodeGetInfo => match handler.get_info().await {
                Ok(info) => CsiMessage::NodeInfoResponse(info),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::NodeGetCapabilities => match handler.node_get_capabilities().await {
                Ok(caps) => CsiMessage::NodeCapabilitiesResponse(caps),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::NodeGetVolumeStats {
                volume_id,
                volume_path,
            } => match handler.get_volume_stats(&volume_id, &volume_path).await {
                Ok(stats) => CsiMessage::VolumeStatsResponse(stats),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::NodeExpandVolume {
                volume_id,
                volume_path,
                capacity_bytes,
            } => match handler
                .node_expand_volume(&volume_id, &volume_path, capacity_bytes)
                .await
            {
                Ok(cap) => CsiMessage::Expanded(cap),
                Err(e) => CsiMessage::Error(e),
            },

            // --- Response variants should never arrive as requests ----------
            other => {
                warn!(msg = %other, "unexpected message variant received as request");
                CsiMessage::Error(CsiError::InvalidArgument(format!(
                    "unexpected message: {other}"
                )))
            }
        }
    }

    /// Return a reference to the underlying QUIC endpoint, useful for
    /// obtaining the local address.
    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }
}
