use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use cloudata_server::RedisServer;
use cloudata_storage::{Engine, FjallBackend, ObjectStoreLocation};

#[derive(clap::Parser, Debug)]
#[command(name = "cloudata-node", about = "Cloudata storage node")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `storage.data_dir`
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Overrides `redis.listen_addr`
    #[arg(long)]
    listen_addr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    data_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RedisConfig {
    listen_addr: String,
    default_keyspace: String,
    require_auth: bool,
}

#[derive(Debug, Deserialize)]
struct ObjectStoreConfig {
    #[serde(default)]
    uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BootstrapConfig {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    storage: StorageConfig,
    redis: RedisConfig,
    object_store: ObjectStoreConfig,
    bootstrap: BootstrapConfig,
    observability: ObservabilityConfig,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut figment = Figment::new()
        .merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let mut config: Config = figment
        .merge(Env::prefixed("CLOUDATA_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    if let Some(ref data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir.clone();
    }
    if let Some(ref listen_addr) = cli.listen_addr {
        config.redis.listen_addr = listen_addr.clone();
    }
    Ok(config)
}

fn init_logging(config: &ObservabilityConfig) {
    match config.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt().json().with_env_filter(&config.log_level).init();
        }
        _ => {
            tracing_subscriber::fmt().pretty().with_env_filter(&config.log_level).init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config.observability);

    let location = ObjectStoreLocation::parse(config.object_store.uri.as_deref().unwrap_or(""))
        .context("invalid object_store configuration")?;
    let ObjectStoreLocation::S3 { bucket, prefix } = &location;
    tracing::info!(%bucket, %prefix, "object store configured");

    let listen_addr: SocketAddr = config
        .redis
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr: {}", config.redis.listen_addr))?;

    tracing::info!(data_dir = %config.storage.data_dir.display(), "node starting");
    std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
        format!("failed to create data_dir {}", config.storage.data_dir.display())
    })?;
    let backend = FjallBackend::open(&config.storage.data_dir).context("failed to open storage")?;
    let engine = Arc::new(Engine::open(backend).context("failed to open engine")?);

    let server = Arc::new(
        RedisServer::new(engine, &config.redis.default_keyspace, config.redis.require_auth)
            .await
            .context("failed to initialise redis front-end")?,
    );

    if !config.bootstrap.username.is_empty() {
        anyhow::ensure!(
            !config.bootstrap.password.is_empty(),
            "bootstrap.password must be set when bootstrap.username is"
        );
        server
            .authenticator()
            .ensure_user(&config.bootstrap.username, &config.bootstrap.password)
            .await
            .context("failed to create bootstrap account")?;
    }

    tokio::select! {
        result = server.serve(listen_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            Ok(())
        }
    }
}
