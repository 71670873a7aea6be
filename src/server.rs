//! TCP front end of the controller daemon.
//!
//! The daemon binds an ephemeral localhost port, writes the port
//! number atomically to the well-known port file, and serves framed
//! requests. Connections are independent; within one connection
//! requests are handled in order, which is what makes the streaming
//! start (names, then a commit) work.

use crate::controller::Controller;
use crate::error::Result;
use crate::paths::{write_file_atomic, ControlPaths};
use crate::wire::{self, messages as msg, FrameCodec};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

/// Bind, publish the port file and serve until the process dies.
pub async fn serve(controller: Arc<Controller>, paths: &ControlPaths) -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tracing::info!("Listening on port {}", port);
    write_file_atomic(&paths.port_file(), port.to_string().as_bytes())?;
    serve_on(controller, listener).await
}

/// Serve on an already-bound listener; the daemon and the in-process
/// test harness share this loop.
pub async fn serve_on(controller: Arc<Controller>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::debug!("connection from {}", peer);
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(controller, stream).await {
                tracing::debug!("connection ended: {}", e);
            }
        });
    }
}

async fn handle_connection(controller: Arc<Controller>, stream: TcpStream) -> Result<()> {
    let mut framed = Framed::new(stream, FrameCodec::new());
    // Names accumulated by start-name frames, consumed by the commit.
    let mut pending_start: Vec<String> = Vec::new();

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let response = match dispatch(&controller, &frame, &mut pending_start).await {
            Ok(None) => continue,
            Ok(Some(response)) => response,
            Err(e) => wire::encode_err(&e),
        };
        framed.send(response).await?;
    }
    Ok(())
}

/// Route one request frame. `Ok(None)` means the request expects no
/// response (start-name accumulation).
async fn dispatch(
    controller: &Controller,
    frame: &Bytes,
    pending_start: &mut Vec<String>,
) -> Result<Option<Bytes>> {
    let (tag, payload) = wire::decode_request(frame)?;
    match tag {
        wire::Tag::CreateBatch => {
            let req = msg::CreateBatchReq::decode(payload)?;
            controller.create_batch(req)?;
            Ok(Some(wire::encode_ok(&msg::Empty {})))
        }
        wire::Tag::RemoveBatch => {
            let req = msg::RemoveBatchReq::decode(payload)?;
            controller.remove_batch(req).await?;
            Ok(Some(wire::encode_ok(&msg::Empty {})))
        }
        wire::Tag::StartName => {
            let req = msg::StartReq::decode(payload)?;
            pending_start.push(req.service_name);
            Ok(None)
        }
        wire::Tag::StartCommit => {
            let names = std::mem::take(pending_start);
            controller.start_services(&names).await?;
            Ok(Some(wire::encode_ok(&msg::Empty {})))
        }
        wire::Tag::Stop => {
            let req = msg::StopReq::decode(payload)?;
            controller.stop_service(&req.service_name).await?;
            Ok(Some(wire::encode_ok(&msg::Empty {})))
        }
        wire::Tag::StopAll => {
            let req = msg::StopAllReq::decode(payload)?;
            controller.stop_all(req.graceful).await?;
            Ok(Some(wire::encode_ok(&msg::Empty {})))
        }
        wire::Tag::Status => {
            let req = msg::StatusReq::decode(payload)?;
            let resp = controller.status(req)?;
            Ok(Some(wire::encode_ok(&resp)))
        }
        wire::Tag::Diagnostics => {
            let req = msg::DiagnosticsReq::decode(payload)?;
            let resp = controller.diagnostics(req)?;
            Ok(Some(wire::encode_ok(&resp)))
        }
    }
}
