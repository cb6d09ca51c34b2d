#[tokio::main]
async fn main() -> anyhow::Result<()> {
    omechat_lib::run().await
}
