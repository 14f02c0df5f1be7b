#[tokio::main]
async fn main() -> anyhow::Result<()> {
    recordbook_lib::run().await
}
