use keymux::config::ProxyConfig;
use keymux::state::AppState;

/// Every two minutes, compare each key's p50 against the pool average and
/// quarantine persistent outliers.
const SLOW_KEY_SWEEP_SECS: u64 = 120;
const SLOW_KEY_THRESHOLD: f64 = 2.5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(true)
            .init();
    }

    dotenvy::dotenv().ok();

    let config = ProxyConfig::load()?;
    let state = AppState::new(config);

    // ── Background slow-key sweep ──
    let sweep_state = state.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(SLOW_KEY_SWEEP_SECS)).await;
            sweep_state.keys.detect_slow_keys(SLOW_KEY_THRESHOLD);
        }
    });

    state.mark_ready();
    let app = keymux::create_router(state);

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    print_banner(port);
    tracing::info!("keymux listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn print_banner(port: u16) {
    println!();
    println!("  \x1b[1;36m>>>  KEYMUX  <<<\x1b[0m");
    println!("  \x1b[36mmulti-key LLM reverse proxy\x1b[0m");
    println!("  \x1b[1;32mhttp://localhost:{port}\x1b[0m");
    println!();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
