use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use rb_ranking::{RankConfig, Ranker};
use rb_storage::{MemStore, TtlGcTask};
use rb_types::{Clock, OrderBasis, SystemClock};

#[derive(clap::Parser, Debug)]
#[command(name = "rb-node", about = "Rankboard article ranking walkthrough")]
struct Cli {
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// Overrides `observability.log_level`.
    #[arg(long)]
    log_level: Option<String>,
    #[arg(long, default_value = "username")]
    poster: String,
    #[arg(long, default_value = "A_title")]
    title: String,
    #[arg(long, default_value = "www.example.com")]
    link: String,
    #[arg(long, default_value = "other_user")]
    voter: String,
    /// Groups to file the article under, repeatable
    #[arg(long = "group", default_values_t = vec!["new-group".to_string()])]
    groups: Vec<String>,
    #[arg(long, value_enum, default_value_t = Basis::Score)]
    order: Basis,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Basis {
    Score,
    Time,
}

impl From<Basis> for OrderBasis {
    fn from(b: Basis) -> Self {
        match b {
            Basis::Score => OrderBasis::Score,
            Basis::Time => OrderBasis::Time,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    ttl_gc_interval_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    ranking: RankConfig,
    storage: StorageConfig,
    observability: ObservabilityConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let config: Config = figment
        .merge(Env::prefixed("RANKBOARD_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.ranking.validate().context("invalid ranking configuration")?;

    let log_level = cli.log_level.as_deref().unwrap_or(&config.observability.log_level);
    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt().json().with_env_filter(log_level).init();
        }
        _ => {
            tracing_subscriber::fmt().pretty().with_env_filter(log_level).init();
        }
    }

    tracing::info!(
        vote_score = config.ranking.vote_score,
        page_size = config.ranking.page_size,
        vote_window_secs = config.ranking.vote_window_secs,
        group_cache_ttl_secs = config.ranking.group_cache_ttl_secs,
        "node starting"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemStore::with_clock(clock.clone()));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let gc = tokio::spawn(
        TtlGcTask::new(
            store.clone(),
            Duration::from_millis(config.storage.ttl_gc_interval_ms),
            shutdown_rx,
        )
        .run(),
    );

    let ranker = Ranker::new(store, clock, config.ranking);
    let basis = OrderBasis::from(cli.order);

    let id = ranker
        .create_article(&cli.poster, &cli.title, &cli.link)
        .await
        .context("failed to create article")?;
    tracing::info!(article_id = id, poster = %cli.poster, "posted article");

    let outcome = ranker.vote(&cli.voter, id).await.context("vote failed")?;
    let votes = ranker.get_article(id).await?.votes;
    tracing::info!(article_id = id, voter = %cli.voter, ?outcome, votes, "voted for the article");

    for article in ranker.list_articles(1, basis).await? {
        tracing::info!(?article, "listed");
    }

    ranker.add_to_groups(id, cli.groups.as_slice()).await?;
    for group in &cli.groups {
        for article in ranker.list_group_articles(group, 1, basis).await? {
            tracing::info!(group = %group, ?article, "group article");
        }
    }

    let _ = shutdown_tx.send(true);
    gc.await.context("ttl gc task panicked")?;
    Ok(())
}
