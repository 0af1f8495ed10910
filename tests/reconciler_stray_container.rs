//! A container this driver started stays untouched by a reconciler sweep;
//! a stray container carrying the driver's label, started outside the
//! driver, gets swept away.

use std::collections::HashMap;
use std::time::Duration;

use container_task_driver::engine::mock::{MockContainer, MockEngine};
use container_task_driver::labels::ALLOC_ID_LABEL;
use container_task_driver::reconciler::{Reconciler, ReconcilerConfig};
use container_task_driver::task::spec::{ResourceLimits, TaskSpec};
use container_task_driver::{Configuration, Driver};

fn test_config() -> Configuration {
    toml::from_str("").unwrap()
}

fn spec(task_id: &str) -> TaskSpec {
    TaskSpec {
        task_id: task_id.to_string(),
        alloc_id: format!("{}-alloc", task_id),
        task_name: "worker".to_string(),
        job_name: None,
        task_group_name: None,
        image: "redis:7".to_string(),
        command: Some("redis-server".to_string()),
        args: vec![],
        env: HashMap::new(),
        working_dir: None,
        user: None,
        labels: HashMap::new(),
        cap_add: vec![],
        cap_drop: vec![],
        devices: vec![],
        mounts: vec![],
        ports: vec![],
        dns: vec![],
        resources: ResourceLimits::default(),
        runtime: None,
        kill_signal: None,
        kill_timeout_secs: 5,
        log_stdout_fifo: None,
        log_stderr_fifo: None,
        tty: false,
        privileged: false,
        network_mode: None,
        extra_hosts: vec![],
    }
}

#[tokio::test]
async fn sweep_removes_only_the_untracked_container() {
    let engine = MockEngine::new();
    let driver = Driver::new(engine.clone(), &test_config());

    driver.start_task(spec("tracked"), None).await.unwrap();

    let mut labels = HashMap::new();
    labels.insert(ALLOC_ID_LABEL.to_string(), "some-other-alloc".to_string());
    engine.seed_container(MockContainer {
        id: "stray-id".to_string(),
        name: "stray".to_string(),
        image: "redis:7".to_string(),
        running: true,
        exit_code: 0,
        oom_killed: false,
        labels,
        mounts: vec![],
        created_unix: 0,
    });

    let reconciler = Reconciler::new(
        engine.clone(),
        driver.task_store().clone(),
        ReconcilerConfig {
            period: Duration::from_secs(1),
            creation_grace: Duration::from_secs(0),
            dry_run: false,
        },
    );
    reconciler.mark_fingerprinted();

    let acted = reconciler.sweep_once().await.unwrap();

    assert_eq!(acted.len(), 1);
    assert!(!engine.containers.lock().contains_key("stray"));
    assert!(engine
        .containers
        .lock()
        .values()
        .any(|c| c.name.starts_with("worker-tracked")));
}
