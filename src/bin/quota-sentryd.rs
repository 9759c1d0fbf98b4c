use std::sync::Arc;

use clap::Parser;

use quota_sentry::config::Config;
use quota_sentry::daemon::{self, AppState};
use quota_sentry::error::{QuotaSentryError, Result};
use quota_sentry::interfaces::accounts::{
    JsonFileAccountDirectory, StaticAccountDirectory, StaticModelCatalog,
};
use quota_sentry::interfaces::probe::DryRunProbe;
use quota_sentry::interfaces::refresh::NoopQuotaRefresh;

#[derive(Parser, Debug)]
#[command(name = "quota-sentryd")]
#[command(about = "Quota Sentry wakeup scheduler daemon")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 7979)]
    port: u16,

    #[arg(long, default_value_t = quota_sentry::runtime_paths::default_db_path())]
    db: String,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    accounts: Option<String>,

    #[arg(long, env = "QUOTA_SENTRY_TOKEN")]
    token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    quota_sentry::logging::init_tracing("quota_sentryd");
    let cli = Cli::parse();

    if cli.token.trim().is_empty() {
        return Err(QuotaSentryError::Config(
            "daemon auth token is empty".to_string(),
        ));
    }

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::convention_defaults(&cli.db),
    };
    if config.db_path.is_none() {
        config.db_path = Some(cli.db.clone());
    }
    if let Some(accounts) = &cli.accounts {
        config.accounts_path = Some(accounts.clone());
    }

    let directory: Arc<dyn quota_sentry::interfaces::accounts::AccountDirectory> =
        match &config.accounts_path {
            Some(path) => Arc::new(JsonFileAccountDirectory::new(path.clone())),
            None => {
                tracing::warn!("no accounts file configured; directory starts empty");
                Arc::new(StaticAccountDirectory::default())
            }
        };

    let scheduler = daemon::bootstrap(
        &config,
        directory,
        Arc::new(StaticModelCatalog::builtin()),
        Arc::new(DryRunProbe),
        Arc::new(NoopQuotaRefresh),
    )
    .await?;

    daemon::run(
        &cli.host,
        cli.port,
        AppState {
            scheduler,
            token: cli.token,
        },
    )
    .await
}
