#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cipriano::run().await
}
