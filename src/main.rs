use anyhow::Result;
use clap::Parser;
use marketwatch::config;
use marketwatch::model::Listing;
use marketwatch::monitor::{Monitor, Settings};
use marketwatch::notify::{DispatchPolicy, Dispatcher, TelegramNotifier};
use marketwatch::scraper::HttpListingSource;
use marketwatch::store::{self, SeenStore};
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run a single check and exit
    #[arg(long)]
    once: bool,

    /// Print the loaded configuration and exit
    #[arg(long)]
    show_config: bool,

    /// Send a test notification and exit
    #[arg(long)]
    test_notify: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    if args.show_config {
        println!("{}", serde_yaml::to_string(&cfg)?);
        return Ok(());
    }

    cfg.ensure_dirs()?;

    let pool = store::init_pool(&cfg.database_url()).await?;
    store::run_migrations(&pool).await?;
    let seen = SeenStore::new(pool);

    let source = Arc::new(HttpListingSource::new(
        Url::parse(&cfg.source.base_url)?,
        Duration::from_secs(cfg.source.request_timeout_secs),
    ));
    let notifier = Arc::new(TelegramNotifier::new(
        &cfg.telegram.bot_token,
        cfg.telegram.chat_id,
    ));
    let dispatcher = Dispatcher::new(notifier, DispatchPolicy::from_config(&cfg.notify));

    let monitor = Monitor::new(seen, source, dispatcher, Settings::from_config(&cfg));

    if args.test_notify {
        let test_listing = Listing {
            id: "test123".into(),
            title: "Test Listing - Marketplace Monitor".into(),
            price: "$0".into(),
            location: "Test Location".into(),
            url: "https://market.example/item/test123".into(),
            description: Some("This is a test notification from the marketplace monitor.".into()),
            image_url: None,
        };
        monitor.notify_listing(&test_listing).await?;
        println!("Test notification sent");
        return Ok(());
    }

    if args.once {
        let stats = monitor.check_once().await;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    monitor.start().await;

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal, stopping");
    monitor.stop().await;

    Ok(())
}
