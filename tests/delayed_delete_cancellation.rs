//! Destroying a task schedules a delayed image removal; starting a new
//! task against the same image before the delay fires cancels it.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use container_task_driver::engine::mock::MockEngine;
use container_task_driver::task::spec::{ResourceLimits, TaskSpec};
use container_task_driver::{Configuration, Driver};

fn test_config() -> Configuration {
    toml::from_str("[gc]\nimage_delay = 1\n").unwrap()
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
async fn repulling_before_the_delay_fires_keeps_the_image() {
    let engine = MockEngine::new();
    let driver = Driver::new(engine.clone(), &test_config());

    driver.start_task(spec("task-a"), None).await.unwrap();
    driver.wait_task("task-a").await.unwrap();
    driver.destroy_task("task-a", true).await.unwrap();

    // Well inside the 1s image_delay: a fresh task referencing the same
    // image must see the pending delete cancelled, not a re-pull.
    driver.start_task(spec("task-b"), None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(engine.remove_image_count.load(Ordering::SeqCst), 0);
}
