//! The client-facing RPC endpoint: a TCP listener speaking length-prefixed
//! JSON frames, one dispatcher root per connection.

pub mod codec;
pub mod dispatch;
pub mod facades;
pub mod watchers;

use std::sync::Arc;

use bytes::BytesMut;
use metrics::counter;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info};

use common::api::{RpcRequest, RpcResponse};

use crate::app_state::AppState;
use crate::heartbeat::HeartMonitor;
use crate::rpc::dispatch::Root;

const RESPONSE_CHANNEL_CAPACITY: usize = 128;
const MAX_INFLIGHT_REQUESTS: usize = 32;

/// Accepts connections forever. Callers bind the listener so tests can use
/// an ephemeral port.
pub async fn serve(state: AppState, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(?err, "accept failed for RPC listener");
                continue;
            }
        };
        debug!(%peer, "client connected");
        counter!("gateway_rpc_connections_total").increment(1);

        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, state).await {
                debug!(%peer, %err, "connection closed with error");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, state: AppState) -> crate::error::Result<()> {
    let heartbeat = Arc::new(HeartMonitor::new(state.heartbeat_idle_timeout));
    let root = Arc::new(Root::new(state, heartbeat.clone()));
    let (cancel, ctx) = crate::ctx::context();
    let (mut reader, mut writer) = stream.into_split();

    // Responses from concurrently dispatched requests funnel through one
    // writer task so frames never interleave.
    let (resp_tx, mut resp_rx) = mpsc::channel::<RpcResponse>(RESPONSE_CHANNEL_CAPACITY);
    let writer_task = tokio::spawn(async move {
        while let Some(response) = resp_rx.recv().await {
            if let Err(err) = codec::write_frame(&mut writer, &response).await {
                debug!(%err, "cannot write response frame");
                break;
            }
        }
    });

    let inflight = Arc::new(Semaphore::new(MAX_INFLIGHT_REQUESTS));
    let mut buffer = BytesMut::new();
    loop {
        tokio::select! {
            frame = codec::read_frame::<_, RpcRequest>(&mut reader, &mut buffer) => {
                match frame {
                    Ok(Some(request)) => {
                        let root = root.clone();
                        let ctx = ctx.clone();
                        let resp_tx = resp_tx.clone();
                        let Ok(permit) = inflight.clone().acquire_owned().await else {
                            break;
                        };
                        tokio::spawn(async move {
                            let _permit = permit;
                            let response = dispatch::dispatch(&root, &ctx, &request).await;
                            let _ = resp_tx.send(response).await;
                        });
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!(%err, "bad request frame");
                        break;
                    }
                }
            }
            _ = heartbeat.expired() => {
                info!("closing idle connection");
                break;
            }
        }
    }

    // Cancel in-flight dispatch, tear down watchers and let the writer
    // drain whatever was already queued.
    cancel.cancel();
    root.watchers.drain();
    drop(resp_tx);
    let _ = writer_task.await;
    Ok(())
}
