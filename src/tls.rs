//! HTTPS listener.

use crate::api::{self, ApiState, ConnectionScheme};
use axum::{Extension, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// In-flight requests get this long to finish after shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Load a certificate chain and private key from PEM files.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> io::Result<RustlsConfig> {
    if !cert_path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Certificate file not found: {:?}", cert_path),
        ));
    }
    if !key_path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Private key file not found: {:?}", key_path),
        ));
    }

    RustlsConfig::from_pem_file(cert_path, key_path).await
}

/// The API router as seen through the HTTPS listener: test requests
/// report `https` as their protocol.
pub fn router(state: ApiState) -> Router {
    api::router(state).layer(Extension(ConnectionScheme::Https))
}

/// Serve HTTPS on `address` until Ctrl+C.
pub async fn serve_tls(address: &str, config: RustlsConfig, state: ApiState) -> io::Result<()> {
    let addr = tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("cannot resolve {}", address))
        })?;

    let handle = Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            api::shutdown_signal().await;
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        }
    });

    info!(address = %addr, "HTTPS server starting");
    axum_server::bind_rustls(addr, config)
        .handle(handle)
        .serve(router(state).into_make_service())
        .await?;

    info!("HTTPS server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_certificate_files() {
        let dir = TempDir::new().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");

        let err = load_tls_config(&cert, &key).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("Certificate"));

        std::fs::write(&cert, "not a certificate").unwrap();
        let err = load_tls_config(&cert, &key).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("Private key"));
    }

    #[tokio::test]
    async fn test_invalid_pem_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();

        assert!(load_tls_config(&cert, &key).await.is_err());
    }
}
