//! TCP accept loop.
//!
//! Each accepted connection is wrapped in a [`StreamTransport`] and gets its
//! own [`Channel`] serving the demo handlers. The channel is stopped when the
//! connection closes or the server shuts down.

use crate::handlers::demo_handlers;
use sandbox_rpc::{Channel, StreamTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running server. Dropping shuts it down.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and close every active channel.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Bind and start accepting in the background.
pub async fn start_server(host: &str, port: u16, channel: String) -> anyhow::Result<ServerHandle> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Serving channel {} on {}", channel, actual_addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

    let task_handle = tokio::spawn(accept_loop(listener, channel, shutdown_rx, conn_shutdown_rx));

    Ok(ServerHandle {
        addr: actual_addr,
        shutdown_tx: Some(shutdown_tx),
        conn_shutdown_tx,
        task_handle: Some(task_handle),
    })
}

async fn accept_loop(
    listener: TcpListener,
    channel: String,
    mut shutdown_rx: oneshot::Receiver<()>,
    conn_shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("Server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let channel = channel.clone();
                        let conn_shutdown = conn_shutdown_rx.clone();
                        tokio::spawn(async move {
                            debug!("Connection from {}", peer_addr);
                            if let Err(e) = handle_connection(stream, channel, conn_shutdown).await {
                                warn!("Connection {} ended with error: {}", peer_addr, e);
                            }
                            debug!("Connection from {} closed", peer_addr);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    channel_id: String,
    mut shutdown_rx: watch::Receiver<bool>,
) -> sandbox_rpc::Result<()> {
    stream.set_nodelay(true)?;
    let transport = Arc::new(StreamTransport::new(stream));
    let channel = Channel::new(transport.clone(), channel_id);
    channel.start(demo_handlers()).await?;

    tokio::select! {
        _ = transport.closed() => {}
        _ = shutdown_rx.changed() => {}
    }

    channel.stop()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_rpc::{Handlers, RpcError};
    use serde_json::json;

    #[tokio::test]
    async fn test_server_serves_demo_handlers() {
        let mut handle = start_server("127.0.0.1", 0, "sandbox".to_string())
            .await
            .unwrap();
        assert!(handle.addr().port() > 0);

        let transport = StreamTransport::connect(handle.addr()).await.unwrap();
        let host = Channel::new(Arc::new(transport), "sandbox");
        host.start(Handlers::new()).await.unwrap();

        assert_eq!(host.call("double", vec![json!(21)]).await.unwrap(), json!(42));
        assert!(matches!(
            host.call("fail", vec![json!("boom")]).await,
            Err(RpcError::Remote(ref r)) if r.message == "boom"
        ));

        host.stop().unwrap();
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_ignores_other_channels() {
        let mut handle = start_server("127.0.0.1", 0, "sandbox".to_string())
            .await
            .unwrap();

        let transport = StreamTransport::connect(handle.addr()).await.unwrap();
        let host = Channel::new(Arc::new(transport), "elsewhere");
        host.start(Handlers::new()).await.unwrap();

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(100), host.wait_ready()).await;
        assert!(result.is_err(), "no handshake should happen on a foreign channel");

        host.stop().unwrap();
        handle.shutdown();
    }
}
