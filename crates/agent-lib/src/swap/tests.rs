//! Reconcile scenarios for the Swap-Limit Manager
//!
//! Each test builds a fake host procfs and cgroup tree in a temp dir, a
//! pod cache and a runtime that maps container ids to pids.

#[cfg(test)]
mod manager_tests {
    use crate::cluster::mock::MockPodLister;
    use crate::error::AgentError;
    use crate::health::{components, ComponentStatus, HealthRegistry};
    use crate::models::PodKey;
    use crate::observability::AgentMetrics;
    use crate::resources::test_pods::*;
    use crate::swap::cri::mock::MockRuntime;
    use crate::swap::{EnqueueState, NodeCapacity, SwapLimitManager, SwapManagerConfig};
    use k8s_openapi::api::core::v1::Pod;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    const GI: u64 = 1024 * 1024 * 1024;

    struct Host {
        _proc: TempDir,
        _cgroup: TempDir,
        proc_root: PathBuf,
        cgroup_root: PathBuf,
    }

    impl Host {
        fn new() -> Self {
            let proc = TempDir::new().unwrap();
            let cgroup = TempDir::new().unwrap();
            Self {
                proc_root: proc.path().to_path_buf(),
                cgroup_root: cgroup.path().to_path_buf(),
                _proc: proc,
                _cgroup: cgroup,
            }
        }

        /// Lay out `/proc/<pid>/cgroup` and the container's cgroup directory
        fn container(&self, id: &str, pid: u32, with_control_file: bool) -> PathBuf {
            let pid_dir = self.proc_root.join(pid.to_string());
            std::fs::create_dir_all(&pid_dir).unwrap();
            let relative = format!("kubepods.slice/crio-{}.scope", id);
            std::fs::write(pid_dir.join("cgroup"), format!("0::/{}\n", relative)).unwrap();

            let dir = self.cgroup_root.join(&relative);
            std::fs::create_dir_all(&dir).unwrap();
            if with_control_file {
                std::fs::write(dir.join("memory.swap.max"), "max\n").unwrap();
            }
            dir
        }
    }

    fn swap_max(dir: &Path) -> String {
        std::fs::read_to_string(dir.join("memory.swap.max")).unwrap()
    }

    struct Harness {
        pods: Arc<MockPodLister>,
        runtime: Arc<MockRuntime>,
        metrics: AgentMetrics,
        health: HealthRegistry,
        manager: Arc<SwapLimitManager>,
    }

    fn harness(host: &Host, runtime: MockRuntime) -> Harness {
        let pods = Arc::new(MockPodLister::default());
        let runtime = Arc::new(runtime);
        let metrics = AgentMetrics::new().unwrap();
        let health = HealthRegistry::new();

        let manager = Arc::new(SwapLimitManager::new(
            SwapManagerConfig {
                node_name: "node-a".to_string(),
                proc_root: host.proc_root.clone(),
                cgroup_root: host.cgroup_root.clone(),
                resync_period: Duration::from_millis(20),
                capacity: NodeCapacity {
                    total_memory_bytes: 100 * GI,
                    total_swap_bytes: 10 * GI,
                },
                ..SwapManagerConfig::default()
            },
            pods.clone(),
            runtime.clone(),
            metrics.clone(),
            health.clone(),
        ));

        Harness {
            pods,
            runtime,
            metrics,
            health,
            manager,
        }
    }

    fn burstable(namespace: &str, name: &str, container_id: &str) -> Pod {
        with_statuses(
            pod(
                namespace,
                name,
                vec![container("c", &[("memory", "25Gi")], &[("memory", "50Gi")])],
            ),
            vec![running_status("c", container_id)],
        )
    }

    fn metrics_text(metrics: &AgentMetrics) -> String {
        String::from_utf8(metrics.encode().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_burstable_container_gets_proportional_swap() {
        let host = Host::new();
        let dir = host.container("abc", 100, true);
        let h = harness(&host, MockRuntime::with_pids(&[("abc", 100)]));
        h.pods.insert(burstable("default", "web", "cri-o://abc"));

        let state = h
            .manager
            .reconcile(&PodKey::new("default", "web"))
            .await
            .unwrap();

        assert_eq!(state, EnqueueState::Forget);
        assert_eq!(swap_max(&dir), (5 * GI / 2).to_string());
        assert_eq!(*h.runtime.calls.lock().unwrap(), vec!["abc".to_string()]);
        assert!(metrics_text(&h.metrics).contains("swapguard_swap_limit_writes_total 1"));
    }

    #[tokio::test]
    async fn test_privileged_pods_get_no_swap() {
        let host = Host::new();
        let critical_dir = host.container("crit", 101, true);
        let system_dir = host.container("sys", 102, true);
        let h = harness(
            &host,
            MockRuntime::with_pids(&[("crit", 101), ("sys", 102)]),
        );
        h.pods.insert(with_priority(
            burstable("default", "critical", "cri-o://crit"),
            2_000_000_000,
        ));
        h.pods.insert(burstable("kube-system", "dns", "cri-o://sys"));

        for key in [
            PodKey::new("default", "critical"),
            PodKey::new("kube-system", "dns"),
        ] {
            let state = h.manager.reconcile(&key).await.unwrap();
            assert_eq!(state, EnqueueState::Forget);
        }

        assert_eq!(swap_max(&critical_dir), "0");
        assert_eq!(swap_max(&system_dir), "0");
    }

    #[tokio::test]
    async fn test_request_equal_to_limit_or_unset_gets_no_swap() {
        let host = Host::new();
        let equal_dir = host.container("eq", 201, true);
        let unset_dir = host.container("none", 202, true);
        let h = harness(
            &host,
            MockRuntime::with_pids(&[("eq", 201), ("none", 202)]),
        );

        // memory request == limit without cpu is still burstable
        h.pods.insert(with_statuses(
            pod(
                "default",
                "equal",
                vec![
                    container("eq", &[("memory", "1Gi")], &[("memory", "1Gi")]),
                    container("none", &[("cpu", "100m")], &[]),
                ],
            ),
            vec![
                running_status("eq", "cri-o://eq"),
                running_status("none", "cri-o://none"),
            ],
        ));

        let state = h
            .manager
            .reconcile(&PodKey::new("default", "equal"))
            .await
            .unwrap();

        assert_eq!(state, EnqueueState::Forget);
        assert_eq!(swap_max(&equal_dir), "0");
        assert_eq!(swap_max(&unset_dir), "0");
    }

    #[tokio::test]
    async fn test_best_effort_pod_gets_no_swap() {
        let host = Host::new();
        let dir = host.container("be", 300, true);
        let h = harness(&host, MockRuntime::with_pids(&[("be", 300)]));
        h.pods.insert(with_statuses(
            pod("default", "batch", vec![container("c", &[], &[])]),
            vec![running_status("c", "cri-o://be")],
        ));

        h.manager
            .reconcile(&PodKey::new("default", "batch"))
            .await
            .unwrap();
        assert_eq!(swap_max(&dir), "0");
    }

    #[tokio::test]
    async fn test_missing_pod_is_forgotten() {
        let host = Host::new();
        let h = harness(&host, MockRuntime::default());

        let state = h
            .manager
            .reconcile(&PodKey::new("default", "gone"))
            .await
            .unwrap();

        assert_eq!(state, EnqueueState::Forget);
        assert!(h.runtime.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_waiting_container_backs_off() {
        let host = Host::new();
        let h = harness(&host, MockRuntime::default());
        h.pods.insert(with_statuses(
            pod(
                "default",
                "starting",
                vec![container("c", &[("memory", "1Gi")], &[("memory", "2Gi")])],
            ),
            vec![waiting_status("c")],
        ));
        h.pods.insert(pod("default", "unscheduled", vec![container("c", &[], &[])]));

        for name in ["starting", "unscheduled"] {
            let state = h
                .manager
                .reconcile(&PodKey::new("default", name))
                .await
                .unwrap();
            assert_eq!(state, EnqueueState::BackOff);
        }
        assert!(h.runtime.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminated_container_is_skipped() {
        let host = Host::new();
        let h = harness(&host, MockRuntime::default());
        h.pods.insert(with_statuses(
            pod("default", "job", vec![container("c", &[("memory", "1Gi")], &[])]),
            vec![terminated_status("c")],
        ));

        let state = h
            .manager
            .reconcile(&PodKey::new("default", "job"))
            .await
            .unwrap();

        assert_eq!(state, EnqueueState::Forget);
        assert!(h.runtime.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_runtime_failure_is_error() {
        let host = Host::new();
        let h = harness(&host, MockRuntime::default());
        h.pods.insert(burstable("default", "web", "cri-o://unknown"));

        let err = h
            .manager
            .reconcile(&PodKey::new("default", "web"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Runtime(_)));
    }

    #[tokio::test]
    async fn test_write_failure_is_counted() {
        let host = Host::new();
        host.container("abc", 100, false);
        let h = harness(&host, MockRuntime::with_pids(&[("abc", 100)]));
        h.pods.insert(burstable("default", "web", "cri-o://abc"));

        assert!(h
            .manager
            .reconcile(&PodKey::new("default", "web"))
            .await
            .is_err());
        assert!(metrics_text(&h.metrics).contains("swapguard_swap_limit_write_failures_total 1"));
    }

    #[tokio::test]
    async fn test_failed_item_is_requeued_with_backoff() {
        let host = Host::new();
        let h = harness(&host, MockRuntime::default());
        h.pods.insert(burstable("default", "web", "cri-o://unknown"));
        let key = PodKey::new("default", "web");

        h.manager.queue().add(key.clone()).await;
        assert!(h.manager.process_next_item().await);

        assert_eq!(h.manager.queue().num_requeues(&key).await, 1);
        let health = h.health.health().await;
        assert_eq!(
            health.components[components::SWAP_MANAGER].status,
            ComponentStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_success_forgets_backoff() {
        let host = Host::new();
        host.container("abc", 100, true);
        let h = harness(&host, MockRuntime::with_pids(&[("abc", 100)]));
        h.pods.insert(burstable("default", "web", "cri-o://abc"));
        let key = PodKey::new("default", "web");

        h.manager.apply_outcome(&key, EnqueueState::BackOff).await;
        assert_eq!(h.manager.queue().num_requeues(&key).await, 1);

        // the backoff re-add delivers the key after 5ms
        let processed = tokio::time::timeout(Duration::from_secs(1), h.manager.process_next_item())
            .await
            .unwrap();
        assert!(processed);
        assert_eq!(h.manager.queue().num_requeues(&key).await, 0);
        assert!(h.manager.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_immediate_requeues_without_backoff() {
        let host = Host::new();
        let h = harness(&host, MockRuntime::default());
        let key = PodKey::new("default", "web");

        h.manager.apply_outcome(&key, EnqueueState::Immediate).await;
        assert_eq!(h.manager.queue().len().await, 1);
        assert_eq!(h.manager.queue().num_requeues(&key).await, 0);
    }

    #[tokio::test]
    async fn test_resync_enqueues_only_local_pods() {
        let host = Host::new();
        let h = harness(&host, MockRuntime::default());
        h.pods.insert(pod("default", "local", vec![]));
        let mut remote = pod("default", "remote", vec![]);
        if let Some(spec) = remote.spec.as_mut() {
            spec.node_name = Some("node-b".to_string());
        }
        h.pods.insert(remote);

        h.manager.enqueue_all_pods().await;
        h.manager.enqueue_all_pods().await;

        assert_eq!(h.manager.queue().len().await, 1);
        assert_eq!(
            h.manager.queue().get().await,
            Some(PodKey::new("default", "local"))
        );
        assert!(metrics_text(&h.metrics).contains("swapguard_swap_queue_depth 1"));
    }

    #[tokio::test]
    async fn test_run_reconciles_and_stops_on_shutdown() {
        let host = Host::new();
        let dir = host.container("abc", 100, true);
        let h = harness(&host, MockRuntime::with_pids(&[("abc", 100)]));
        h.pods.insert(burstable("default", "web", "cri-o://abc"));
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(h.manager.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("swap manager did not stop")
            .unwrap();
        assert_eq!(swap_max(&dir), (5 * GI / 2).to_string());

        // the queue refuses new keys once the manager stopped
        let queue = h.manager.queue();
        let queued = queue.len().await;
        queue.add(PodKey::new("default", "late")).await;
        assert_eq!(queue.len().await, queued);
    }
}
