#[tokio::main]
async fn main() {
    if let Err(err) = cli::run().await {
        eprintln!("ERROR {err}");
        if err.downcast_ref::<cli::UsageError>().is_some() {
            std::process::exit(2);
        }
        std::process::exit(1);
    }
}
