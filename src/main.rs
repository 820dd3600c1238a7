#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use janus_gateway::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "janus-gateway", about = "Multi-protocol API gateway data plane")]
struct Cli {
    /// Path to gateway config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// HTTP proxy listen address (overrides the config's http listener)
    #[arg(short, long)]
    listen: Option<String>,

    /// Admin API listen address (for health/metrics/snapshots)
    #[arg(long, default_value = "0.0.0.0:9901")]
    admin_listen: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = worker_thread_count();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
    }))
}

/// Worker pool sizing: explicit `JANUS_WORKER_THREADS` override, otherwise
/// the host parallelism.
fn worker_thread_count() -> usize {
    if let Ok(v) = std::env::var("JANUS_WORKER_THREADS") {
        if let Ok(n) = v.trim().parse::<usize>() {
            return n.max(1);
        }
    }
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}
