//! Two tasks that reference the same image and start at the same time
//! observe exactly one engine pull between them.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use container_task_driver::engine::mock::MockEngine;
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
async fn two_concurrent_starts_share_one_pull() {
    let engine = MockEngine::new();
    engine.with_pull_delay(Duration::from_millis(50));
    let driver = Driver::new(engine.clone(), &test_config());

    let a = driver.start_task(spec("task-a"), None);
    let b = driver.start_task(spec("task-b"), None);
    let (ra, rb) = tokio::join!(a, b);

    ra.unwrap();
    rb.unwrap();

    assert_eq!(engine.pull_count.load(Ordering::SeqCst), 1);
    assert!(driver.task_store().contains("task-a"));
    assert!(driver.task_store().contains("task-b"));
}
