//! VidCache Daemon - serves cached media byte ranges over RESP

mod handler;
mod origin;
mod resp;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::BytesMut;
use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use vidcache::{CacheConfig, RetryPolicy, VideoCache};

use crate::handler::MethodHandler;
use crate::origin::FileOrigin;
use crate::resp::Frame;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind address [default: 127.0.0.1:6390]
    #[arg(short, long)]
    bind: Option<String>,

    /// Directory served as the origin [default: ./media]
    #[arg(short, long)]
    origin: Option<PathBuf>,

    /// Segment directory; segments stay in memory when unset
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Cache capacity in bytes
    #[arg(short, long)]
    capacity: Option<u64>,

    /// Deadline for one origin fetch, retries included
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Retries after a transient origin failure
    #[arg(long)]
    max_retries: Option<u32>,

    /// Delay before the first retry
    #[arg(long)]
    backoff_ms: Option<u64>,

    /// JSON config file; command-line flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// Health check mode (for Docker)
    #[arg(long)]
    health: bool,
}

/// Settings accepted from `--config`
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    bind: Option<String>,
    origin: Option<PathBuf>,
    data: Option<PathBuf>,
    capacity: Option<u64>,
    timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    backoff_ms: Option<u64>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}

const DEFAULT_BIND: &str = "127.0.0.1:6390";
const DEFAULT_ORIGIN: &str = "./media";

/// Daemon settings resolved from flags, the config file and defaults
#[derive(Debug)]
struct ServerConfig {
    bind: String,
    origin: PathBuf,
    cache: CacheConfig,
}

fn server_config(args: &Args, file: FileConfig) -> ServerConfig {
    let bind = args
        .bind
        .clone()
        .or_else(|| file.bind.clone())
        .unwrap_or_else(|| DEFAULT_BIND.to_string());
    let origin = args
        .origin
        .clone()
        .or_else(|| file.origin.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ORIGIN));

    ServerConfig {
        bind,
        origin,
        cache: cache_config(args, file),
    }
}

fn cache_config(args: &Args, file: FileConfig) -> CacheConfig {
    let mut config = CacheConfig::new();

    if let Some(capacity) = args.capacity.or(file.capacity) {
        config = config.with_capacity(capacity);
    }
    if let Some(dir) = args.data.clone().or(file.data) {
        config = config.on_disk(dir);
    }
    if let Some(ms) = args.timeout_ms.or(file.timeout_ms) {
        config = config.with_fetch_timeout(Duration::from_millis(ms));
    }

    let mut retry = RetryPolicy::default();
    if let Some(max_retries) = args.max_retries.or(file.max_retries) {
        retry.max_retries = max_retries;
    }
    if let Some(ms) = args.backoff_ms.or(file.backoff_ms) {
        retry.base_backoff = Duration::from_millis(ms);
    }
    config.with_retry(retry)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let ServerConfig {
        bind,
        origin,
        cache: config,
    } = server_config(&args, file);

    if args.health {
        match TcpStream::connect(&bind).await {
            Ok(_) => {
                println!("OK");
                std::process::exit(0);
            }
            Err(_) => {
                eprintln!("FAILED");
                std::process::exit(1);
            }
        }
    }

    info!("Starting VidCache Daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Origin directory: {}", origin.display());
    info!("Storage: {:?}", config.storage);
    info!("Cache capacity: {} bytes", config.capacity);

    let origin = Arc::new(FileOrigin::new(&origin));
    let cache = VideoCache::init(config, origin).context("opening segment cache")?;

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    info!("Server listening on {}", bind);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    let cache = Arc::clone(&cache);

                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, cache).await {
                            error!("Error handling client {}: {}", addr, e);
                        }
                        info!("Connection closed: {}", addr);
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    cache.shutdown().context("flushing segment cache")?;
    Ok(())
}

async fn handle_client(mut stream: TcpStream, cache: Arc<VideoCache>) -> Result<()> {
    let handler = MethodHandler::new(cache);
    let mut buffer = BytesMut::with_capacity(4096);
    let mut reply = BytesMut::with_capacity(4096);

    loop {
        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }

        loop {
            match Frame::parse(&mut buffer) {
                Ok(Some(request)) => {
                    handler.handle(request).await.encode(&mut reply);
                    stream.write_all(&reply).await?;
                    reply.clear();
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Parse error: {}", e);
                    Frame::err(e).encode(&mut reply);
                    stream.write_all(&reply).await?;
                    reply.clear();
                    buffer.clear();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vidcache::StorageConfig;

    #[test]
    fn test_cli_overrides_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vidcached.json");
        std::fs::write(
            &path,
            r#"{"capacity": 1024, "timeout_ms": 500, "data": "/var/cache/vid"}"#,
        )
        .unwrap();

        let args = Args::parse_from(["vidcached", "--capacity", "2048", "--max-retries", "1"]);
        let config = cache_config(&args, FileConfig::load(&path).unwrap());

        assert_eq!(config.capacity, 2048);
        assert_eq!(config.fetch_timeout, Duration::from_millis(500));
        assert_eq!(config.storage, StorageConfig::Disk(PathBuf::from("/var/cache/vid")));
        assert_eq!(config.retry.max_retries, 1);
    }

    #[test]
    fn test_defaults_are_in_memory() {
        let args = Args::parse_from(["vidcached"]);
        let server = server_config(&args, FileConfig::default());

        assert_eq!(server.bind, "127.0.0.1:6390");
        assert_eq!(server.origin, PathBuf::from("./media"));
        assert_eq!(server.cache.storage, StorageConfig::Memory);
        assert_eq!(server.cache.capacity, CacheConfig::default().capacity);
    }

    #[test]
    fn test_config_file_sets_bind_and_origin() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vidcached.json");
        std::fs::write(&path, r#"{"bind": "0.0.0.0:7000", "origin": "/srv/media"}"#).unwrap();

        let args = Args::parse_from(["vidcached"]);
        let server = server_config(&args, FileConfig::load(&path).unwrap());
        assert_eq!(server.bind, "0.0.0.0:7000");
        assert_eq!(server.origin, PathBuf::from("/srv/media"));

        let args = Args::parse_from(["vidcached", "-b", "127.0.0.1:7001", "-o", "/tmp/media"]);
        let server = server_config(&args, FileConfig::load(&path).unwrap());
        assert_eq!(server.bind, "127.0.0.1:7001");
        assert_eq!(server.origin, PathBuf::from("/tmp/media"));
    }

    #[test]
    fn test_config_file_rejects_unknown_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"capacitty": 1}"#).unwrap();

        assert!(FileConfig::load(&path).is_err());
    }

    #[tokio::test]
    async fn test_serves_requests_over_tcp() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.ts"), b"0123456789").unwrap();
        let cache = VideoCache::init(
            CacheConfig::new().with_capacity(1024),
            Arc::new(FileOrigin::new(dir.path())),
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_client(stream, cache).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"*1\r\n$4\r\nPING\r\n*4\r\n$4\r\nREAD\r\n$4\r\na.ts\r\n$1\r\n1\r\n$1\r\n4\r\n")
            .await
            .unwrap();

        let expected = b"+PONG\r\n$3\r\n123\r\n";
        let mut received = vec![0u8; expected.len()];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(&received[..], &expected[..]);
    }
}
