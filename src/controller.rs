//! The service registry and the operations the daemon exposes over the
//! wire: batch create/remove, start in dependency order, stop in
//! reverse order, status and diagnostics snapshots.
//!
//! The registry lock is held only for map access; starts and stops
//! drop to per-service locks once they have their slice of records.

use crate::error::{Error, Result};
use crate::paths::ControlPaths;
use crate::service::{fmt_duration, Service};
use crate::topological::{reversed_runner, Runner, Task};
use crate::wire::messages as wire;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Controller {
    paths: ControlPaths,
    verbose: bool,
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Controller {
    pub fn new(paths: ControlPaths, verbose: bool) -> Self {
        Self {
            paths,
            verbose,
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Register a batch of definitions. A definition can only link once
    /// its dependencies exist, so keep passing over the pending list
    /// until a full pass makes no progress; that is also where cycles
    /// and missing dependencies surface. The batch commits atomically:
    /// on failure the registry is left untouched.
    pub fn create_batch(&self, req: wire::CreateBatchReq) -> Result<()> {
        let mut services = self.services.write();
        let mut staged = services.clone();

        let mut pending: Vec<&wire::Service> = req.services.iter().collect();
        loop {
            if pending.is_empty() {
                *services = staged;
                return Ok(());
            }
            let prev_len = pending.len();
            let mut next = Vec::new();
            let mut errors = Vec::new();
            for def in pending {
                if let Err(e) = self.create_in(&mut staged, def) {
                    next.push(def);
                    errors.push(e);
                }
            }
            if next.len() == prev_len {
                let mut reason = String::new();
                for e in &errors {
                    reason.push('\n');
                    reason.push_str(&e.to_string());
                }
                return Err(Error::BatchRejected(reason));
            }
            pending = next;
        }
    }

    fn create_in(
        &self,
        staged: &mut HashMap<String, Arc<Service>>,
        def: &wire::Service,
    ) -> Result<()> {
        if staged.contains_key(&def.service_name) {
            return Err(Error::DuplicateService(def.service_name.clone()));
        }
        let svc = Service::new(def, staged, &self.paths, self.verbose)?;
        staged.insert(def.service_name.clone(), svc);
        Ok(())
    }

    /// Stop and delete the named services. Stopping an already-stopped
    /// service is a no-op, so removal is idempotent in that sense; an
    /// unknown name is an error.
    pub async fn remove_batch(&self, req: wire::RemoveBatchReq) -> Result<()> {
        for name in &req.service_names {
            let svc = self.lookup(name)?;
            svc.stop().await.map_err(|e| {
                Error::Config(format!("Error stopping service {} for removal. {}", name, e))
            })?;
            self.services.write().remove(name);
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Arc<Service>> {
        self.services
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    fn resolve(&self, names: &[String]) -> Result<Vec<Arc<Service>>> {
        let services = self.services.read();
        names
            .iter()
            .map(|name| {
                services
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::ServiceNotFound(name.clone()))
            })
            .collect()
    }

    /// Resolve `names`, or every registered service when empty.
    fn resolve_or_all(&self, names: &[String]) -> Result<Vec<Arc<Service>>> {
        if names.is_empty() {
            Ok(self.services.read().values().cloned().collect())
        } else {
            self.resolve(names)
        }
    }

    /// Start the named services and their transitive dependencies in
    /// dependency order, blocking until all of them are healthy. On
    /// success the critical path is logged.
    pub async fn start_services(&self, names: &[String]) -> Result<()> {
        let services = self.resolve(names)?;
        let roots: Vec<Arc<dyn Task>> = services
            .into_iter()
            .map(|svc| Arc::new(StartTask { svc }) as Arc<dyn Task>)
            .collect();
        let runner = Runner::new(roots);
        runner.run().await?;

        for line in critical_path_report(&runner).await {
            tracing::info!("{}", line);
        }
        Ok(())
    }

    /// Stop one service, blocking until its process is gone.
    pub async fn stop_service(&self, name: &str) -> Result<()> {
        let svc = self.lookup(name)?;
        svc.stop().await
    }

    /// Stop every registered service in reverse dependency order: no
    /// service is signaled until everything depending on it has
    /// stopped.
    pub async fn stop_all(&self, graceful: bool) -> Result<()> {
        let services: Vec<Arc<Service>> = self.services.read().values().cloned().collect();
        let roots: Vec<Arc<dyn Task>> = services
            .into_iter()
            .map(|svc| Arc::new(StopTask { svc, graceful }) as Arc<dyn Task>)
            .collect();
        let runner = reversed_runner(roots);
        runner.run().await
    }

    /// Status snapshots; an empty name list means every service, and
    /// any unknown name fails the whole query.
    pub fn status(&self, req: wire::StatusReq) -> Result<wire::StatusResp> {
        let services = self.resolve_or_all(&req.service_names)?;
        Ok(wire::StatusResp {
            svc_status: services.iter().map(|svc| svc.status()).collect(),
        })
    }

    /// Resource snapshots, same name semantics as status.
    pub fn diagnostics(&self, req: wire::DiagnosticsReq) -> Result<wire::DiagnosticsResp> {
        let services = self.resolve_or_all(&req.service_names)?;
        Ok(wire::DiagnosticsResp {
            svc_metrics: services.iter().map(|svc| svc.diagnostics()).collect(),
        })
    }

    #[cfg(test)]
    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.read().get(name).cloned()
    }
}

/// Render the post-start summary: count, per-service critical path
/// lines and the total.
pub async fn critical_path_report(runner: &Runner) -> Vec<String> {
    let mut lines = Vec::with_capacity(16);
    lines.push(format!("Started {} services", runner.completed().await));
    lines.push("Service startup critical path:".to_string());
    let mut total = Duration::ZERO;
    for task in runner.critical_path().await {
        lines.push(format!(
            "  {:<76} {}",
            task.key(),
            fmt_duration(task.duration())
        ));
        total += task.duration();
    }
    lines.push(format!("  {:<76} {}", "Total", fmt_duration(total)));
    lines
}

/// Starting a service means launching it and waiting for health.
struct StartTask {
    svc: Arc<Service>,
}

#[async_trait]
impl Task for StartTask {
    fn key(&self) -> String {
        self.svc.name().to_string()
    }

    async fn run(&self) -> Result<()> {
        self.svc.start().await?;
        self.svc.wait_till_healthy().await
    }

    fn deps(&self) -> Vec<Arc<dyn Task>> {
        self.svc
            .deps()
            .iter()
            .map(|svc| Arc::new(StartTask { svc: Arc::clone(svc) }) as Arc<dyn Task>)
            .collect()
    }

    fn duration(&self) -> Duration {
        self.svc.start_duration()
    }

    fn start_time(&self) -> Instant {
        self.svc.start_time()
    }
}

struct StopTask {
    svc: Arc<Service>,
    graceful: bool,
}

#[async_trait]
impl Task for StopTask {
    fn key(&self) -> String {
        self.svc.name().to_string()
    }

    async fn run(&self) -> Result<()> {
        if self.graceful {
            self.svc.stop().await
        } else {
            self.svc.stop_unsafe().await
        }
    }

    fn deps(&self) -> Vec<Arc<dyn Task>> {
        self.svc
            .deps()
            .iter()
            .map(|svc| {
                Arc::new(StopTask {
                    svc: Arc::clone(svc),
                    graceful: self.graceful,
                }) as Arc<dyn Task>
            })
            .collect()
    }

    fn duration(&self) -> Duration {
        self.svc.stop_duration()
    }

    fn start_time(&self) -> Instant {
        self.svc.stop_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ServiceState;

    fn controller() -> (tempfile::TempDir, Controller) {
        let dir = tempfile::tempdir().unwrap();
        let paths = ControlPaths::new(dir.path());
        (dir, Controller::new(paths, false))
    }

    fn task_def(name: &str, cmd: &str, deps: &[&str]) -> wire::Service {
        wire::Service {
            service_name: name.to_string(),
            service_type: wire::ServiceType::Task as i32,
            launch_cmd: Some(wire::Command {
                cmd: cmd.to_string(),
                env_vars: vec![],
            }),
            stop_cmd: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            health_checks: vec![],
            version_files: vec![],
            owner: String::new(),
            verbose: false,
        }
    }

    #[tokio::test]
    async fn create_batch_accepts_any_declaration_order() {
        let (_dir, ctl) = controller();
        // `top` is declared before the dependency it needs.
        let req = wire::CreateBatchReq {
            services: vec![
                task_def("top", "true", &["bottom"]),
                task_def("bottom", "true", &[]),
            ],
        };
        ctl.create_batch(req).unwrap();
        assert!(ctl.service("top").is_some());
        assert!(ctl.service("bottom").is_some());
    }

    #[tokio::test]
    async fn create_batch_rejects_missing_dependency_without_partial_insert() {
        let (_dir, ctl) = controller();
        let req = wire::CreateBatchReq {
            services: vec![
                task_def("ok", "true", &[]),
                task_def("broken", "true", &["ghost"]),
            ],
        };
        let err = ctl.create_batch(req).unwrap_err();
        assert!(err.to_string().contains("ghost"));
        // All or nothing: the healthy definition was not committed.
        assert!(ctl.service("ok").is_none());
        assert!(ctl.service("broken").is_none());
    }

    #[tokio::test]
    async fn create_batch_rejects_cycles() {
        let (_dir, ctl) = controller();
        let req = wire::CreateBatchReq {
            services: vec![
                task_def("a", "true", &["b"]),
                task_def("b", "true", &["a"]),
            ],
        };
        assert!(ctl.create_batch(req).is_err());
        assert!(ctl.service("a").is_none());
    }

    #[tokio::test]
    async fn create_batch_rejects_duplicates() {
        let (_dir, ctl) = controller();
        ctl.create_batch(wire::CreateBatchReq {
            services: vec![task_def("twin", "true", &[])],
        })
        .unwrap();
        let err = ctl
            .create_batch(wire::CreateBatchReq {
                services: vec![task_def("twin", "true", &[])],
            })
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[tokio::test]
    async fn start_respects_dependency_order() {
        let (dir, ctl) = controller();
        let marker = |name: &str| format!("{}/{}", dir.path().display(), name);
        // Each task appends its name; dependencies must appear first.
        let log = marker("order.log");
        let req = wire::CreateBatchReq {
            services: vec![
                task_def("bottom", &format!("echo bottom >> {}", log), &[]),
                task_def("left", &format!("echo left >> {}", log), &["bottom"]),
                task_def("right", &format!("echo right >> {}", log), &["bottom"]),
                task_def("top", &format!("echo top >> {}", log), &["left", "right"]),
            ],
        };
        ctl.create_batch(req).unwrap();
        ctl.start_services(&["top".to_string()]).await.unwrap();

        let contents = std::fs::read_to_string(&log).unwrap();
        let order: Vec<&str> = contents.lines().collect();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "bottom");
        assert_eq!(order[3], "top");
        for svc in ["bottom", "left", "right", "top"] {
            assert_eq!(ctl.service(svc).unwrap().state(), ServiceState::Started);
        }
    }

    #[tokio::test]
    async fn start_of_unknown_service_fails() {
        let (_dir, ctl) = controller();
        assert!(ctl.start_services(&["nobody".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn status_for_unknown_name_is_an_error_with_no_partial_list() {
        let (_dir, ctl) = controller();
        ctl.create_batch(wire::CreateBatchReq {
            services: vec![task_def("known", "true", &[])],
        })
        .unwrap();
        let err = ctl
            .status(wire::StatusReq {
                service_names: vec!["known".to_string(), "unknown".to_string()],
            })
            .unwrap_err();
        assert!(matches!(err, Error::ServiceNotFound(_)));
    }

    #[tokio::test]
    async fn empty_status_request_returns_everything() {
        let (_dir, ctl) = controller();
        ctl.create_batch(wire::CreateBatchReq {
            services: vec![
                task_def("one", "true", &[]),
                task_def("two", "true", &[]),
            ],
        })
        .unwrap();
        let resp = ctl.status(wire::StatusReq { service_names: vec![] }).unwrap();
        assert_eq!(resp.svc_status.len(), 2);
    }

    #[tokio::test]
    async fn remove_batch_clears_from_status() {
        let (_dir, ctl) = controller();
        ctl.create_batch(wire::CreateBatchReq {
            services: vec![task_def("temp", "true", &[])],
        })
        .unwrap();
        ctl.remove_batch(wire::RemoveBatchReq {
            service_names: vec!["temp".to_string()],
        })
        .await
        .unwrap();
        let resp = ctl.status(wire::StatusReq { service_names: vec![] }).unwrap();
        assert!(resp.svc_status.is_empty());
    }

    #[tokio::test]
    async fn remove_batch_unknown_name_errors() {
        let (_dir, ctl) = controller();
        assert!(ctl
            .remove_batch(wire::RemoveBatchReq {
                service_names: vec!["ghost".to_string()],
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn stop_all_on_empty_registry_is_fine() {
        let (_dir, ctl) = controller();
        ctl.stop_all(true).await.unwrap();
    }

    #[tokio::test]
    async fn diagnostics_for_stopped_service_is_zero() {
        let (_dir, ctl) = controller();
        ctl.create_batch(wire::CreateBatchReq {
            services: vec![task_def("quiet", "true", &[])],
        })
        .unwrap();
        let resp = ctl
            .diagnostics(wire::DiagnosticsReq {
                service_names: vec!["quiet".to_string()],
            })
            .unwrap();
        assert_eq!(resp.svc_metrics.len(), 1);
        assert_eq!(resp.svc_metrics[0].cpu_time_ms, 0);
        assert_eq!(resp.svc_metrics[0].rss_mb, 0);
    }
}
