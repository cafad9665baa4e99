use std::net::SocketAddr;

use anyhow::Context;

use drainq_api::app::{self, services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    drainq_observability::init();

    let mut settings = services::Settings::from_env()?;

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    let local_addr = listener.local_addr()?;

    if settings.self_url.is_none() {
        settings.self_url = Some(loopback_url(local_addr));
    }

    let primary = services::build_extractor(&settings)?;
    let wiring = services::build_services(settings, primary).await?;

    tracing::info!("listening on {}", local_addr);

    axum::serve(listener, app::build_app(wiring.services.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("server error")?;

    wiring.shutdown().await;
    Ok(())
}

/// Continuations reach this process through its own listener when no public URL is set.
fn loopback_url(addr: SocketAddr) -> String {
    let host = if addr.ip().is_unspecified() {
        match addr {
            SocketAddr::V4(_) => "127.0.0.1".to_string(),
            SocketAddr::V6(_) => "[::1]".to_string(),
        }
    } else {
        match addr {
            SocketAddr::V4(v4) => v4.ip().to_string(),
            SocketAddr::V6(v6) => format!("[{}]", v6.ip()),
        }
    };
    format!("http://{host}:{}", addr.port())
}
