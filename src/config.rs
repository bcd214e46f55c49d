//! CLI 参数与服务默认配置。

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_STATIC_DIR: &str = "static";
pub const DEFAULT_STAGING_DIR: &str = "tmp";
pub const DEFAULT_HTTP_PORT: u16 = 4001;
pub const DEFAULT_CORS_ORIGINS: &str = "http://localhost:5173,http://localhost:4173";
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_STAGING_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_LOCK_WAIT_SECS: u64 = 10;
pub const STAGING_CLEAN_INTERVAL_SECS: u64 = 900;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "music-catalog", version = VERSION_INFO, about = "Music catalog server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "CATALOG_STATIC_DIR",
        default_value = DEFAULT_STATIC_DIR,
        help = "Catalog root (groups live under <dir>/groups)"
    )]
    pub static_dir: String,
    #[arg(
        short = 't',
        long,
        env = "CATALOG_STAGING_DIR",
        default_value = DEFAULT_STAGING_DIR,
        help = "Staging directory for incoming uploads"
    )]
    pub staging_dir: String,
    #[arg(
        short = 'b',
        long = "bind",
        env = "CATALOG_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "CATALOG_HTTP_PORT",
        default_value_t = DEFAULT_HTTP_PORT,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "CATALOG_HTTPS_PORT",
        help = "HTTPS port (requires --tls-cert and --tls-key)"
    )]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "CATALOG_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "CATALOG_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(
        long,
        env = "CATALOG_CORS_ORIGINS",
        default_value = DEFAULT_CORS_ORIGINS,
        help = "Comma separated CORS origins"
    )]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "CATALOG_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload request size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "CATALOG_STAGING_TTL_SECS",
        default_value_t = DEFAULT_STAGING_TTL_SECS,
        help = "Staging cleanup threshold in seconds (0 to disable)"
    )]
    pub staging_ttl_secs: u64,
    #[arg(
        long,
        env = "CATALOG_LOCK_WAIT_SECS",
        default_value_t = DEFAULT_LOCK_WAIT_SECS,
        help = "Seconds a write waits for a busy entity before giving up"
    )]
    pub lock_wait_secs: u64,
}
