use anyhow::Result;
use clap::Parser;
use node_agent::app::ApplicationBuilder;
use node_agent::config::Cli;
use node_agent::config::Commands;
use node_agent::config::DaemonArgs;
use node_agent::infrastructure::gpu_probe;
use node_agent::infrastructure::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::ShowGpus => run_show_gpus(),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.log_dir.as_deref())?;

    tracing::info!("Starting node agent daemon {}", &**version::VERSION);

    let app = ApplicationBuilder::new(daemon_args).build().await?;

    app.run().await?;
    app.shutdown().await?;

    Ok(())
}

fn run_show_gpus() -> Result<()> {
    utils::logging::init();

    let gpus = gpu_probe::probe();
    for gpu in &gpus {
        let pci = gpu
            .pci
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{}\t{}\t{}", gpu.index, pci, gpu.model);
    }

    let pool = gpu_probe::to_pool(&gpus);
    println!("{} GPUs, {} free: {pool}", pool.total(), pool.free_count());
    Ok(())
}
