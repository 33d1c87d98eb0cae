use std::sync::Arc;

use clap::Parser;
use docserve::builtins::{builtin_creators, DocCatalog};
use docserve::cli::ServeArgs;
use docserve::config::DocserveConfig;
use docserve::server::Server;
use docserve::tools::{compose_tools, ComposedTools};
use docserve::{logging, shutdown_host};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServeArgs::parse();
    logging::init("info");

    let cwd = std::env::current_dir()?;
    let mut config = DocserveConfig::load(args.config.as_deref(), &cwd)?;
    config.apply(args.overrides());
    config.validate()?;

    let catalog = Arc::new(DocCatalog::scan(cwd.join(&config.docs_dir))?);
    let host_config = config.host_config(&cwd);
    let ComposedTools { registry, mut host } = compose_tools(
        builtin_creators(catalog),
        &config.plugins,
        config.isolation,
        &host_config,
    )
    .await;

    let mut server = Server::start(config.bind, Arc::new(registry)).await?;
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    server.shutdown().await;
    shutdown_host(&mut host, host_config.grace_period).await;
    Ok(())
}
