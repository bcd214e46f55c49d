//! TLS 证书加载。

use axum_server::tls_rustls::RustlsConfig;
use std::net::{IpAddr, SocketAddr};
use tracing::info;

use crate::config::Args;

/// HTTPS 监听配置；未同时提供端口、证书与私钥时返回 `None`。
pub async fn build_https_listener(
    args: &Args,
    host: IpAddr,
) -> Result<Option<(SocketAddr, RustlsConfig)>, std::io::Error> {
    let (Some(port), Some(cert), Some(key)) = (args.https_port, &args.tls_cert, &args.tls_key)
    else {
        if args.https_port.is_some() {
            info!("https port given without --tls-cert/--tls-key, serving http only");
        }
        return Ok(None);
    };
    let config = RustlsConfig::from_pem_file(cert, key).await?;
    Ok(Some((SocketAddr::new(host, port), config)))
}
