use quire_server::ServiceError;
use stress_test::{stress_test_scaling, stress_test_service, SimulationParams};
use tracing_subscriber::EnvFilter;
pub mod stress_test;

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            DOCUMENT SERVICE STRESS TESTS                   ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: two servers, small history
    let stats = stress_test_service(SimulationParams {
        servers: 2,
        clients_per_server: 2,
        steps: 400,
        snapshot_interval: 50,
        gc_interval: 80,
        seed: 7,
    })
    .await?;
    stats.print();

    // Test 2: three servers, long history with frequent compaction
    let stats = stress_test_service(SimulationParams {
        servers: 3,
        clients_per_server: 4,
        steps: 3000,
        snapshot_interval: 200,
        gc_interval: 250,
        seed: 42,
    })
    .await?;
    stats.print();

    // Test 3: scaling
    stress_test_scaling(4, 1000).await?;

    println!("\n✓ All stress tests completed successfully!");
    Ok(())
}
