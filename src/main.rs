#[tokio::main]
async fn main() -> std::process::ExitCode {
    hive_swarm_lib::run().await
}
