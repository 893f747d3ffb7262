//! Pass-through proxy server
//!
//! Accepts TCP (optionally TLS) connections and forwards each one to a fixed
//! destination through the relay core.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use proxy_relay::business::{format_bytes, DefaultDispatcher, StatsManager, SystemDialer, UserStore};
use proxy_relay::config;
use proxy_relay::core::{MemoryUser, Relay, Server, SessionManager, UserManager};
use proxy_relay::logger::{self, log};
use proxy_relay::proxy::{Freedom, Timeouts, Tunnel};
use proxy_relay::server_runner;

#[tokio::main]
async fn main() -> Result<()> {
    // Install ring as the default crypto provider for rustls
    // This must be done before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = config::CliArgs::parse_args();
    let server_config = config::ServerConfig::load(&cli)?;

    logger::init_logger(&server_config.log_level);

    log::info!(
        listen = %server_config.listen,
        destination = %server_config.destination,
        "Starting proxy relay"
    );

    let cancel_token = CancellationToken::new();
    let stats = Arc::new(StatsManager::new());
    let sessions = SessionManager::with_parent(cancel_token.clone());

    let relay = Arc::new(Relay::new(server_config.relay.clone()));
    let timeouts = Timeouts::from(&server_config.conn);

    let dialer = SystemDialer::from_config(&server_config.conn)
        .with_traffic(stats.traffic_counters("outbound", &server_config.outbound_tag));
    let dispatcher = DefaultDispatcher::new(
        Arc::new(Freedom::new(Arc::clone(&relay), timeouts)),
        Arc::new(dialer),
    )
    .with_stats(Arc::clone(&stats))
    .with_buffer_size(server_config.conn.buffer_size);

    let mut tunnel = Tunnel::new(server_config.destination.clone(), Arc::clone(&relay), timeouts);
    if let Some(email) = &server_config.user {
        let users = UserStore::with_sessions(sessions.clone());
        users.add_user(MemoryUser::new(email.as_str())).await?;
        log::info!(user = %email, "Tunneled traffic accounted to user");
        tunnel = tunnel.with_owner(email.as_str(), users);
    }

    let server = Arc::new(
        Server::builder()
            .tag(server_config.inbound_tag.clone())
            .inbound(Arc::new(tunnel))
            .dispatcher(Arc::new(dispatcher))
            .sessions(sessions.clone())
            .conn_config(server_config.conn.clone())
            .traffic(stats.traffic_counters("inbound", &server_config.inbound_tag))
            .build(),
    );

    // Setup shutdown handler
    let cancel_token_clone = cancel_token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT");
            let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM");

            tokio::select! {
                _ = sigint.recv() => {
                    log::info!("SIGINT received, shutting down...");
                }
                _ = sigterm.recv() => {
                    log::info!("SIGTERM received, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutdown signal received...");
        }

        cancel_token_clone.cancel();
    });

    let result = server_runner::run_server(Arc::clone(&server), &server_config, cancel_token).await;

    log::info!(sessions = sessions.session_count(), "Closing remaining sessions");
    sessions.cancel_all();
    for counter in stats.snapshot() {
        log::info!(counter = %counter.name, bytes = %format_bytes(counter.value), "Traffic");
    }

    result
}
