use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:3000";
const DEFAULT_BUCKET: &str = "registry";
const DEFAULT_SPOOL_THRESHOLD: usize = 4 * 1024 * 1024;
const DEFAULT_TOKEN_EXPIRY: Duration = Duration::from_secs(3600);

/// Command line. Every optional flag falls back to a `COMPOSE_STORE_*`
/// environment variable, then to a built-in default.
#[derive(Parser, Debug)]
#[command(author, version, about = "Offset writes over compose-capable object storage")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the reference compose backend.
    Serve(ServeArgs),
    /// Write a file (or stdin) into an object at an offset.
    Write(WriteArgs),
    /// Print an object to stdout.
    Cat(CatArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Host to bind to (overrides COMPOSE_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides COMPOSE_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where payloads are stored (overrides COMPOSE_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides COMPOSE_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

#[derive(Args, Debug, Default)]
pub struct ClientArgs {
    /// Backend base URL (overrides COMPOSE_STORE_ENDPOINT)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Bucket holding the objects (overrides COMPOSE_STORE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,
}

#[derive(Args, Debug)]
pub struct WriteArgs {
    #[command(flatten)]
    pub client: ClientArgs,

    /// Object key
    pub key: String,

    /// Byte offset to write at
    #[arg(long, default_value_t = 0)]
    pub offset: u64,

    /// Input file; stdin when omitted
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Bytes kept in memory before spooling to disk (overrides COMPOSE_STORE_SPOOL_THRESHOLD)
    #[arg(long)]
    pub spool_threshold: Option<usize>,

    /// Skip CRC32 verification of uploaded parts
    #[arg(long)]
    pub no_crc: bool,

    /// Content type recorded on the object
    #[arg(long)]
    pub mime_type: Option<String>,

    /// Upload token lifetime in seconds
    #[arg(long)]
    pub token_expiry_secs: Option<u64>,
}

#[derive(Args, Debug)]
pub struct CatArgs {
    #[command(flatten)]
    pub client: ClientArgs,

    /// Object key
    pub key: String,
}

/// Read `name`, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

/// Reference backend configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
}

impl AppConfig {
    /// Merge `serve` flags over environment variables. Also returns the
    /// migrate-only flag.
    pub fn from_env_and_args(args: ServeArgs) -> Result<(Self, bool)> {
        let cfg = Self {
            host: match args.host {
                Some(host) => host,
                None => env_or("COMPOSE_STORE_HOST", "0.0.0.0".to_string())?,
            },
            port: match args.port {
                Some(port) => port,
                None => env_or("COMPOSE_STORE_PORT", 3000)?,
            },
            storage_dir: match args.storage_dir {
                Some(dir) => dir,
                None => env_or("COMPOSE_STORE_STORAGE_DIR", "./data/objects".to_string())?,
            },
            database_url: match args.database_url {
                Some(url) => url,
                None => env_or(
                    "COMPOSE_STORE_DATABASE_URL",
                    "sqlite://./data/meta/compose_store.db".to_string(),
                )?,
            },
        };
        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Client-side settings for [`crate::services::stream_writer::StreamWriter`].
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Base URL of the object endpoint (probe, PUT, GET).
    pub endpoint: String,
    /// Base URL of the compose endpoint. Defaults to `endpoint`.
    pub up_host: Option<String>,
    pub bucket: String,
    /// Inputs larger than this are spooled to a temp file.
    pub spool_threshold: usize,
    /// Compute and send CRC32 for direct parts.
    pub check_crc: bool,
    pub token_expiry: Duration,
    pub mime_type: Option<String>,
}

impl WriterConfig {
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            up_host: None,
            bucket: bucket.into(),
            spool_threshold: DEFAULT_SPOOL_THRESHOLD,
            check_crc: true,
            token_expiry: DEFAULT_TOKEN_EXPIRY,
            mime_type: None,
        }
    }

    pub fn up_host(&self) -> &str {
        self.up_host.as_deref().unwrap_or(&self.endpoint)
    }

    /// Endpoint and bucket from flags or the environment.
    pub fn from_client_args(args: &ClientArgs) -> Result<Self> {
        let endpoint = match &args.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => env_or("COMPOSE_STORE_ENDPOINT", DEFAULT_ENDPOINT.to_string())?,
        };
        let bucket = match &args.bucket {
            Some(bucket) => bucket.clone(),
            None => env_or("COMPOSE_STORE_BUCKET", DEFAULT_BUCKET.to_string())?,
        };
        let mut cfg = Self::new(endpoint, bucket);
        cfg.up_host = env::var("COMPOSE_STORE_UP_HOST").ok();
        Ok(cfg)
    }

    pub fn from_write_args(args: &WriteArgs) -> Result<Self> {
        let mut cfg = Self::from_client_args(&args.client)?;
        cfg.spool_threshold = match args.spool_threshold {
            Some(threshold) => threshold,
            None => env_or("COMPOSE_STORE_SPOOL_THRESHOLD", DEFAULT_SPOOL_THRESHOLD)?,
        };
        cfg.check_crc = !args.no_crc;
        if let Some(secs) = args.token_expiry_secs {
            cfg.token_expiry = Duration::from_secs(secs);
        }
        cfg.mime_type = args.mime_type.clone();
        Ok(cfg)
    }
}
