//! A transient image pull failure surfaces from `start_task` as a
//! `DriverError` that classifies as recoverable, not fatal (spec §8
//! "Image pull transient -> RecoverableError").

use std::collections::HashMap;

use container_task_driver::engine::mock::MockEngine;
use container_task_driver::error::Classification;
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
async fn start_task_reports_transient_pull_failure_as_recoverable() {
    let engine = MockEngine::new();
    engine.set_fail_pull(Some("registry overloaded".to_string()));
    let driver = Driver::new(engine, &test_config());

    let err = driver
        .start_task(spec("task-a"), None)
        .await
        .expect_err("pull failure should surface as an error");

    assert_eq!(err.classify(), Classification::Recoverable);
}

#[tokio::test]
async fn start_task_recovers_once_the_pull_stops_failing() {
    let engine = MockEngine::new();
    engine.set_fail_pull(Some("registry overloaded".to_string()));
    let driver = Driver::new(engine.clone(), &test_config());

    driver
        .start_task(spec("task-a"), None)
        .await
        .expect_err("first attempt should fail while the pull is scripted to fail");

    engine.set_fail_pull(None);
    driver
        .start_task(spec("task-a"), None)
        .await
        .expect("retry should succeed once the pull stops failing");
}
