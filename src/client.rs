//! Client side of the controller protocol.
//!
//! [`ControlChannel`] opens one connection per call, which keeps
//! concurrent callers (parallel restarts, status polling during a
//! start) trivially safe. [`ServiceHandle`] is the per-service
//! convenience wrapper the CLI and the launcher use.

use crate::error::{Error, Result};
use crate::paths::ControlPaths;
use crate::wire::{self, messages as msg, FrameCodec};
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

#[derive(Debug, Clone)]
pub struct ControlChannel {
    paths: ControlPaths,
}

impl ControlChannel {
    pub fn new(paths: ControlPaths) -> Self {
        Self { paths }
    }

    /// Whether a daemon is up and accepting connections.
    pub async fn listening(&self) -> bool {
        self.connect().await.is_ok()
    }

    async fn connect(&self) -> Result<Framed<TcpStream, FrameCodec>> {
        let port_file = self.paths.port_file();
        let raw = std::fs::read_to_string(&port_file).map_err(|e| {
            Error::Unreachable(format!("reading {}: {}", port_file.display(), e))
        })?;
        let port: u16 = raw
            .trim()
            .parse()
            .map_err(|e| Error::Unreachable(format!("bad port file contents: {}", e)))?;
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|e| Error::Unreachable(format!("connecting to port {}: {}", port, e)))?;
        Ok(Framed::new(stream, FrameCodec::new()))
    }

    async fn round_trip<Req: Message, Resp: Message + Default>(
        &self,
        tag: wire::Tag,
        req: &Req,
    ) -> Result<Resp> {
        let mut framed = self.connect().await?;
        framed.send(wire::encode_request(tag, req)).await?;
        let frame = framed
            .next()
            .await
            .ok_or_else(|| Error::Protocol("connection closed before response".to_string()))??;
        wire::decode_response(&frame)
    }

    pub async fn create_batch(&self, req: &msg::CreateBatchReq) -> Result<()> {
        self.round_trip::<_, msg::Empty>(wire::Tag::CreateBatch, req)
            .await
            .map(|_| ())
    }

    pub async fn remove_batch(&self, names: Vec<String>) -> Result<()> {
        let req = msg::RemoveBatchReq {
            service_names: names,
        };
        self.round_trip::<_, msg::Empty>(wire::Tag::RemoveBatch, &req)
            .await
            .map(|_| ())
    }

    /// Stream the names, then block on the commit until every named
    /// service (and its dependencies) is healthy.
    pub async fn start(&self, names: &[String]) -> Result<()> {
        let mut framed = self.connect().await?;
        for name in names {
            let req = msg::StartReq {
                service_name: name.clone(),
            };
            framed
                .send(wire::encode_request(wire::Tag::StartName, &req))
                .await?;
        }
        framed
            .send(wire::encode_request(wire::Tag::StartCommit, &msg::Empty {}))
            .await?;
        let frame = framed
            .next()
            .await
            .ok_or_else(|| Error::Protocol("connection closed before response".to_string()))??;
        wire::decode_response::<msg::Empty>(&frame).map(|_| ())
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let req = msg::StopReq {
            service_name: name.to_string(),
        };
        self.round_trip::<_, msg::Empty>(wire::Tag::Stop, &req)
            .await
            .map(|_| ())
    }

    pub async fn stop_all(&self) -> Result<()> {
        let req = msg::StopAllReq { graceful: true };
        self.round_trip::<_, msg::Empty>(wire::Tag::StopAll, &req)
            .await
            .map(|_| ())
    }

    /// Stop-all that force-kills the process trees outright.
    pub async fn stop_all_unsafe(&self) -> Result<()> {
        let req = msg::StopAllReq { graceful: false };
        self.round_trip::<_, msg::Empty>(wire::Tag::StopAll, &req)
            .await
            .map(|_| ())
    }

    pub async fn status(&self, names: Vec<String>) -> Result<Vec<msg::SvcStatus>> {
        let req = msg::StatusReq {
            service_names: names,
        };
        let resp: msg::StatusResp = self.round_trip(wire::Tag::Status, &req).await?;
        Ok(resp.svc_status)
    }

    pub async fn diagnostics(&self, names: Vec<String>) -> Result<Vec<msg::Metrics>> {
        let req = msg::DiagnosticsReq {
            service_names: names,
        };
        let resp: msg::DiagnosticsResp = self.round_trip(wire::Tag::Diagnostics, &req).await?;
        Ok(resp.svc_metrics)
    }

    /// Start every registered service.
    pub async fn start_all(&self) -> Result<()> {
        let names: Vec<String> = self
            .status(vec![])
            .await?
            .into_iter()
            .map(|status| status.service_name)
            .collect();
        self.start(&names).await
    }

    /// Handle for one named service. Registration is not checked here;
    /// the first call will surface an unknown name.
    pub fn service(&self, name: &str) -> ServiceHandle {
        ServiceHandle {
            channel: self.clone(),
            name: name.to_string(),
        }
    }

    /// Handles for every registered service.
    pub async fn list_services(&self) -> Result<Vec<ServiceHandle>> {
        Ok(self
            .status(vec![])
            .await?
            .into_iter()
            .map(|status| ServiceHandle {
                channel: self.clone(),
                name: status.service_name,
            })
            .collect())
    }

    /// Refuse to proceed when the definitions this container was
    /// created from differ from the ones the controller started with.
    pub fn version_check(&self) -> Result<()> {
        let current = std::fs::read(self.paths.current_defs_version_file()).map_err(|e| {
            Error::Config(format!(
                "Unable to read current version file at {}: {}",
                self.paths.current_defs_version_file().display(),
                e
            ))
        })?;
        let frozen = std::fs::read(self.paths.frozen_defs_version_file()).map_err(|e| {
            Error::Config(format!(
                "Unable to read frozen version file at {}: {}",
                self.paths.frozen_defs_version_file().display(),
                e
            ))
        })?;
        if current != frozen {
            return Err(Error::StaleDefinitions);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServiceHandle {
    channel: ControlChannel,
    name: String,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn start(&self) -> Result<()> {
        self.channel.start(std::slice::from_ref(&self.name)).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.channel.stop(&self.name).await
    }

    pub async fn remove(&self) -> Result<()> {
        self.channel.remove_batch(vec![self.name.clone()]).await
    }

    pub async fn status(&self) -> Result<msg::SvcStatus> {
        let mut statuses = self.channel.status(vec![self.name.clone()]).await?;
        if statuses.len() != 1 {
            return Err(Error::Protocol(format!(
                "expected exactly one value in status response, got {}",
                statuses.len()
            )));
        }
        Ok(statuses.remove(0))
    }

    pub async fn diagnostics(&self) -> Result<msg::Metrics> {
        let mut metrics = self.channel.diagnostics(vec![self.name.clone()]).await?;
        if metrics.len() != 1 {
            return Err(Error::Protocol(format!(
                "expected exactly one value in diagnostics response, got {}",
                metrics.len()
            )));
        }
        Ok(metrics.remove(0))
    }

    pub async fn running(&self) -> Result<bool> {
        Ok(self.status().await?.status_code == msg::StatusCode::Started as i32)
    }
}
