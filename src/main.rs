#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use bastion_gateway::server;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bastion-gateway", about = "Resilient reverse-proxy gateway for named backend services")]
struct Cli {
    /// Path to gateway config file (.toml or .json)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Proxy listen address, overrides `server.listen`
    #[arg(short, long)]
    listen: Option<String>,

    /// Admin listen address (health, metrics, introspection), overrides `server.admin_listen`
    #[arg(long)]
    admin_listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cpu = server::runtime::container_cpu_limit();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cpu.threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
        cpu,
    }))
}
