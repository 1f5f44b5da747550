//! The instance registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::instance::{Instance, InstanceSnapshot, InstanceStatus};
use super::monitor;
use super::process::{ProcessHandle, StopOutcome};
use crate::config::Config;
use crate::error::{InstanceError, Result};

/// Outcome of a bulk cleanup: how many instances stopped cleanly and which
/// ones did not. Failed stops are not retried.
#[derive(Debug, Serialize)]
pub struct CleanupReport {
    pub stopped: usize,
    pub failures: Vec<CleanupFailure>,
}

#[derive(Debug, Serialize)]
pub struct CleanupFailure {
    pub id: String,
    pub error: String,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Registry of supervised Q CLI instances.
///
/// The id → instance map is the only widely shared mutable state in the
/// system; every structural mutation (create, stop, cleanup) and every
/// listing runs under the one lock below, so concurrent creates can
/// neither double-register an id nor exceed capacity.
pub struct InstanceManager {
    config: Config,
    instances: Mutex<HashMap<String, Arc<Instance>>>,
}

impl InstanceManager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a chat process and register it under `id`. Either everything
    /// succeeds (process spawned, monitor started, instance registered) or
    /// nothing is registered.
    pub async fn create(&self, id: &str) -> Result<InstanceSnapshot> {
        let mut instances = self.instances.lock().await;

        if instances.contains_key(id) {
            return Err(InstanceError::AlreadyExists(id.to_string()));
        }
        if instances.len() >= self.config.max_instances {
            return Err(InstanceError::CapacityExceeded(self.config.max_instances));
        }

        let (process, lines) =
            ProcessHandle::spawn(&self.config).map_err(InstanceError::SpawnFailure)?;
        let pid = process.pid();

        let instance = Arc::new(Instance::new(id.to_string(), process));
        instance
            .set_status(InstanceStatus::Running, format!("PID: {pid}"))
            .await;
        instances.insert(id.to_string(), Arc::clone(&instance));

        tokio::spawn(monitor::run(
            Arc::clone(&instance),
            lines,
            self.config.response_idle_timeout,
            self.config.read_poll_interval,
        ));

        info!(instance = %id, pid, "instance created");
        Ok(instance.snapshot().await)
    }

    /// Stop `id`, gracefully when the process cooperates. Stopping an
    /// instance that already reached a terminal state succeeds without
    /// re-signaling.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let instances = self.instances.lock().await;
        let instance = instances
            .get(id)
            .ok_or_else(|| InstanceError::NotFound(id.to_string()))?;

        if let Err(e) = stop_instance(instance, self.config.stop_grace_period).await {
            // The status is Stopped either way; an unreapable process is
            // logged but not surfaced as an operation failure.
            error!(instance = %id, error = %e, "stop left the process unreaped");
        }
        Ok(())
    }

    /// Forward one command line to a running instance.
    pub async fn send(&self, id: &str, message: &str) -> Result<()> {
        let instance = {
            let instances = self.instances.lock().await;
            instances
                .get(id)
                .cloned()
                .ok_or_else(|| InstanceError::NotFound(id.to_string()))?
        };

        if !instance.is_running().await {
            return Err(InstanceError::NotRunning(id.to_string()));
        }

        instance
            .process()
            .write_line(message)
            .await
            .map_err(|source| InstanceError::WriteFailure {
                id: id.to_string(),
                source,
            })?;
        instance.touch().await;
        info!(instance = %id, "command forwarded");
        Ok(())
    }

    /// Point-in-time snapshots of every registered instance. Reads only
    /// bookkeeping state, never process I/O.
    pub async fn list(&self) -> Vec<InstanceSnapshot> {
        let instances = self.instances.lock().await;
        let mut snapshots = Vec::with_capacity(instances.len());
        for instance in instances.values() {
            snapshots.push(instance.snapshot().await);
        }
        snapshots
    }

    /// Live handle for `id`, if registered. Used by the delivery loop.
    pub async fn get(&self, id: &str) -> Option<Arc<Instance>> {
        self.instances.lock().await.get(id).cloned()
    }

    /// Stop every instance, best effort, then clear the registry. Errors
    /// are collected per instance rather than aborting the sweep.
    pub async fn cleanup_all(&self) -> CleanupReport {
        let mut instances = self.instances.lock().await;
        let mut report = CleanupReport {
            stopped: 0,
            failures: Vec::new(),
        };

        for (id, instance) in instances.iter() {
            match stop_instance(instance, self.config.stop_grace_period).await {
                Ok(()) => report.stopped += 1,
                Err(e) => {
                    error!(instance = %id, error = %e, "cleanup failed to stop instance");
                    report.failures.push(CleanupFailure {
                        id: id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        instances.clear();

        info!(
            stopped = report.stopped,
            failed = report.failures.len(),
            "registry cleared"
        );
        report
    }
}

/// Shared stop path for `stop` and `cleanup_all`. Flips the status to
/// Stopped before signaling so the monitor winds down instead of reporting
/// a monitor failure when the pipes close.
async fn stop_instance(instance: &Arc<Instance>, grace: Duration) -> std::io::Result<()> {
    if !instance.is_running().await {
        return Ok(());
    }

    instance
        .set_status(InstanceStatus::Stopped, "stopping")
        .await;

    match instance.process().shutdown(grace).await {
        Ok(StopOutcome::Graceful) => {
            instance
                .set_status(InstanceStatus::Stopped, "stopped")
                .await;
            info!(instance = %instance.id(), "instance stopped");
            Ok(())
        }
        Ok(StopOutcome::Forced) => {
            instance
                .set_status(InstanceStatus::Stopped, "killed after grace period")
                .await;
            warn!(instance = %instance.id(), "instance ignored SIGTERM and was killed");
            Ok(())
        }
        Err(e) => {
            instance
                .set_status(InstanceStatus::Stopped, format!("stop failed: {e}"))
                .await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::test_util::{echo_stub, test_config};
    use std::time::Duration;

    fn manager(dir: &tempfile::TempDir) -> InstanceManager {
        InstanceManager::new(test_config(echo_stub(dir)))
    }

    /// Poll until `cond` holds or the deadline passes.
    async fn wait_for<F, Fut>(mut cond: F, deadline: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if cond().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn create_registers_a_running_instance() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        let snapshot = manager.create("a").await.unwrap();
        assert_eq!(snapshot.id, "a");
        assert_eq!(snapshot.status, InstanceStatus::Running);
        assert!(snapshot.details.contains("PID"));
        assert_eq!(manager.list().await.len(), 1);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        manager.create("a").await.unwrap();
        let err = manager.create("a").await.unwrap_err();
        assert!(matches!(err, InstanceError::AlreadyExists(ref id) if id == "a"));
        assert_eq!(manager.list().await.len(), 1);
    }

    #[tokio::test]
    async fn create_enforces_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir); // max_instances = 2

        manager.create("a").await.unwrap();
        manager.create("b").await.unwrap();
        let err = manager.create("c").await.unwrap_err();
        assert!(matches!(err, InstanceError::CapacityExceeded(2)));
        assert_eq!(manager.list().await.len(), 2);
    }

    #[tokio::test]
    async fn create_reports_spawn_failure_and_registers_nothing() {
        let manager = InstanceManager::new(test_config("/nonexistent/q-binary".to_string()));

        let err = manager.create("a").await.unwrap_err();
        assert!(matches!(err, InstanceError::SpawnFailure(_)));
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_blocks_send() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        manager.create("a").await.unwrap();
        manager.stop("a").await.unwrap();

        let snapshots = manager.list().await;
        assert_eq!(snapshots[0].status, InstanceStatus::Stopped);

        let err = manager.send("a", "hello").await.unwrap_err();
        assert!(matches!(err, InstanceError::NotRunning(_)));

        // Second stop reports success without re-signaling.
        manager.stop("a").await.unwrap();
    }

    #[tokio::test]
    async fn stop_and_send_require_a_known_id() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        assert!(matches!(
            manager.stop("ghost").await.unwrap_err(),
            InstanceError::NotFound(_)
        ));
        assert!(matches!(
            manager.send("ghost", "hello").await.unwrap_err(),
            InstanceError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn send_updates_activity() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        let before = manager.create("a").await.unwrap().last_activity;
        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.send("a", "hello").await.unwrap();

        let after = manager.list().await[0].last_activity;
        assert!(after > before);
    }

    #[tokio::test]
    async fn echoed_output_becomes_one_reply_after_idle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        manager.create("a").await.unwrap();

        manager.send("a", "hi").await.unwrap();
        manager.send("a", "there").await.unwrap();

        let instance = manager.get("a").await.unwrap();
        let framed = wait_for(
            || {
                let instance = Arc::clone(&instance);
                async move { instance.output().len().await == 1 }
            },
            Duration::from_secs(5),
        )
        .await;
        assert!(framed, "expected exactly one complete reply");

        let replies = instance.output().drain().await;
        assert_eq!(replies[0].raw_content, "hi\nthere");
        assert!(replies[0].is_complete);
    }

    #[tokio::test]
    async fn cleanup_all_on_empty_registry_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        let report = manager.cleanup_all().await;
        assert_eq!(report.stopped, 0);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn cleanup_all_stops_everything_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        manager.create("a").await.unwrap();
        manager.create("b").await.unwrap();

        let report = manager.cleanup_all().await;
        assert_eq!(report.stopped, 2);
        assert!(report.is_clean());
        assert!(manager.list().await.is_empty());

        assert!(matches!(
            manager.send("a", "hello").await.unwrap_err(),
            InstanceError::NotFound(_)
        ));
    }
}
