//! Binary entrypoint for the taskstack tool

#[tokio::main]
async fn main() {
    if let Err(e) = taskstack::cli::run().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
