use std::sync::Arc;

use clap::Parser;
use docserve::cli::WorkerArgs;
use docserve::logging;
use docserve::plugin::{
    connect_and_run, CompositeLoader, ManifestLoader, ModuleRegistry, ReadCapability, WorkerExit,
    WorkerRuntime,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("info");
    let args = WorkerArgs::parse();

    let cwd = std::env::current_dir()?;
    let capability = ReadCapability::from_allow_list(args.allow_fs_read);
    let loader = CompositeLoader::new(
        ModuleRegistry::new(),
        ManifestLoader::new(cwd, args.plugin_dirs, capability),
    );
    let runtime = WorkerRuntime::new(Arc::new(loader));

    match connect_and_run(&args.channel, &args.token, runtime).await? {
        WorkerExit::Shutdown => std::process::exit(0),
        WorkerExit::Disconnected => {
            tracing::debug!("supervisor channel closed");
            std::process::exit(1)
        }
    }
}
