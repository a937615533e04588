use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use compose_store::{
    config::{AppConfig, CatArgs, Cli, Command, ServeArgs, WriteArgs, WriterConfig},
    routes,
    services::{backend::HttpBackend, storage_service::StorageService, stream_writer::StreamWriter},
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::{
    fs,
    io::{self, AsyncRead, AsyncWriteExt},
    net::TcpListener,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Write(args) => write(args).await,
        Command::Cat(args) => cat(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let (cfg, migrate) = AppConfig::from_env_and_args(args)?;
    tracing::info!("Starting compose-store backend with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .await
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let options = SqliteConnectOptions::from_str(&cfg.database_url)
        .with_context(|| format!("parsing database URL {}", cfg.database_url))?
        .create_if_missing(true);
    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {}", cfg.database_url))?,
    );

    let storage = StorageService::new(db, cfg.storage_dir.clone());
    storage.migrate().await.context("running migrations")?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    let app: Router = routes::routes::routes().with_state(storage);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn write(args: WriteArgs) -> Result<()> {
    let cfg = WriterConfig::from_write_args(&args)?;
    let http = reqwest::Client::new();
    let backend = HttpBackend::new(http.clone(), cfg.endpoint.clone(), cfg.bucket.clone());
    let writer = StreamWriter::new(cfg, backend, http);

    let input: Box<dyn AsyncRead + Unpin + Send> = match &args.file {
        Some(path) => Box::new(
            fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?,
        ),
        None => Box::new(io::stdin()),
    };

    let written = writer
        .write_at_offset(&args.key, args.offset, input)
        .await
        .with_context(|| format!("writing `{}` at offset {}", args.key, args.offset))?;
    println!("{}", written);
    Ok(())
}

async fn cat(args: CatArgs) -> Result<()> {
    let cfg = WriterConfig::from_client_args(&args.client)?;
    let backend = HttpBackend::new(reqwest::Client::new(), cfg.endpoint, cfg.bucket);
    let bytes = backend
        .get_object(&args.key)
        .await
        .with_context(|| format!("reading `{}`", args.key))?;
    let mut stdout = io::stdout();
    stdout.write_all(&bytes).await?;
    stdout.flush().await?;
    Ok(())
}
