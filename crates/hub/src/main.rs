#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hub::cli::run().await
}
