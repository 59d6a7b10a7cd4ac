#[tokio::main]
async fn main() {
    if let Err(err) = shuttle::run_cli().await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
