//! Fingerprints the engine once and prints the result, for standalone
//! operation outside the plugin RPC harness (SPEC_FULL §A.4).

use anyhow::Result;
use bollard::Docker;

pub async fn run(endpoint: &str) -> Result<()> {
    println!("Container Task Driver Diagnostics");
    println!("==================================\n");

    println!("Engine ({}):", endpoint);
    match Docker::connect_with_socket(endpoint, 120, bollard::API_DEFAULT_VERSION) {
        Ok(docker) => match docker.ping().await {
            Ok(_) => {
                println!("  Status: reachable");
                if let Ok(version) = docker.version().await {
                    println!("  Version: {}", version.version.unwrap_or_default());
                    println!("  API Version: {}", version.api_version.unwrap_or_default());
                    println!(
                        "  OS/Arch: {}/{}",
                        version.os.unwrap_or_default(),
                        version.arch.unwrap_or_default()
                    );
                }
                if let Ok(info) = docker.info().await {
                    println!("  Containers: {}", info.containers.unwrap_or(0));
                    println!("    Running: {}", info.containers_running.unwrap_or(0));
                    println!("    Stopped: {}", info.containers_stopped.unwrap_or(0));
                    println!("  Images: {}", info.images.unwrap_or(0));
                }
            }
            Err(e) => println!("  Status: unreachable ({})", e),
        },
        Err(e) => println!("  Status: could not connect ({})", e),
    }

    Ok(())
}
