mod bootstrap;
mod config_loader;
mod ledger_api;
#[cfg(test)]
mod tests;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bootstrap::async_main().await
}
