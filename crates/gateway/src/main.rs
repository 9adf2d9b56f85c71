#[tokio::main]
async fn main() {
    gateway::init_tracing();
    if let Err(err) = gateway::run().await {
        eprintln!("ERROR {err}");
        std::process::exit(1);
    }
}
