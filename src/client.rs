use async_trait::async_trait;
use tracing::debug;

use crate::context::{ConnContext, ConnId};
use crate::error::{GateError, Result};
use crate::gateway::{ClientConn, GatewayHandle};
use crate::protocol::{OutboundFrame, FRAME_PING};

/// Callbacks a connection task implements to consume its frame stream.
#[async_trait]
pub trait EventHandler: Send {
    async fn on_frame(&mut self, _frame: OutboundFrame) {}
    async fn on_close(&mut self, _code: u16) {}
}

/// Drives one registered connection: receives outbound frames, answers
/// pings automatically, and dispatches everything else to the handler.
/// A transport adapter would forward frames to its socket instead.
pub struct GatewayClient {
    conn_id: ConnId,
    frames: tokio::sync::mpsc::Receiver<OutboundFrame>,
    handle: GatewayHandle,
}

impl GatewayClient {
    pub async fn connect(context: ConnContext, handle: GatewayHandle) -> Result<Self> {
        let ClientConn { conn_id, frames } = handle.register(context).await?;
        Ok(Self {
            conn_id,
            frames,
            handle,
        })
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Run until the gateway closes the connection or drops the channel.
    /// Returns the close code for a server-initiated close.
    pub async fn run<H: EventHandler>(&mut self, handler: &mut H) -> Result<u16> {
        while let Some(frame) = self.frames.recv().await {
            if frame.frame_type == FRAME_PING {
                self.handle.pong(self.conn_id).await?;
                continue;
            }
            if frame.frame_type == "close" {
                let code = frame.payload["code"].as_u64().unwrap_or(0) as u16;
                debug!(conn = %self.conn_id, code, "server closed connection");
                handler.on_close(code).await;
                return Ok(code);
            }
            handler.on_frame(frame).await;
        }
        Err(GateError::ChannelClosed)
    }

    /// Tell the gateway this connection is going away.
    pub async fn disconnect(self) -> Result<()> {
        self.handle.disconnect(self.conn_id).await
    }
}
