use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use drover_client::minion::UnlinkedMinions;
use drover_client::Counters;
use drover_cloud::UnlinkedProviders;
use drover_db::Db;
use drover_server::{controller, shutdown, Context, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "drover", version)]
struct Options {
    /// The daemon's own public IP; substituted for the `local` ACL token.
    #[arg(long, env = "DROVER_PUBLIC_IP", default_value = "")]
    public_ip: String,

    /// Admin SSH key appended to every machine's authorized keys.
    #[arg(long, env = "DROVER_ADMIN_SSH_KEY")]
    admin_ssh_key: Option<String>,

    /// Log filter, e.g. `info` or `drover_server=debug`.
    #[arg(long, env = "DROVER_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&options.log_level).context("invalid log filter")?)
        .init();

    let ctx = Context {
        db: Db::new(),
        counters: Counters::new(),
        clock: Arc::new(SystemClock::new()),
        providers: Arc::new(UnlinkedProviders),
        minions: Arc::new(UnlinkedMinions),
        my_public_ip: options.public_ip,
        admin_ssh_key: options.admin_ssh_key,
    };

    let (stop_tx, stop_rx) = shutdown::channel();
    tokio::spawn(controller::run(ctx.clone(), stop_rx.clone()));
    tokio::spawn(controller::foreman::run(ctx, stop_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for interrupt")?;
    info!("shutting down");
    drop(stop_tx);
    Ok(())
}
