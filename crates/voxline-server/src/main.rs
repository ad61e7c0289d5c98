//! voxline server binary.
//!
//! Starts an axum HTTP server with structured logging, the stream pipeline
//! and the conversation reaper, and shuts down gracefully on SIGTERM/SIGINT.
//!
//! `voxline-server issue-token <uid> [role]` prints an observer token signed
//! with the configured secret and exits.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use voxline_server::config::{self, Config};
use voxline_server::middleware::{derive_token_secret, generate_observer_token};
use voxline_server::{app, background, AppState, Backends};
use voxline_types::PrincipalInfo;
use voxline_voice::{CommandSynthesizer, CommandTranscriber, HttpDialogueEngine};

fn resolve_config_path(cli_arg: Option<String>) -> (Option<String>, &'static str) {
    if let Some(path) = cli_arg.filter(|value| !value.trim().is_empty()) {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("VOXLINE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn load(cli_arg: Option<String>) -> (Config, String, &'static str) {
    let (resolved_config_path, config_source) = resolve_config_path(cli_arg);
    let selected = resolved_config_path.unwrap_or_else(|| "config.toml".to_string());
    let config = config::load_config(Some(&selected))
        .expect("failed to load configuration: the server cannot start without valid config");
    (config, selected, config_source)
}

fn issue_token(args: &[String]) {
    let Some(uid) = args.get(2) else {
        eprintln!("usage: voxline-server issue-token <uid> [role]");
        std::process::exit(2);
    };
    let role = args.get(3).cloned().unwrap_or_else(|| "observer".to_string());
    let (config, _, _) = load(None);
    if config.auth.token_secret.is_empty() {
        eprintln!("auth.token_secret is not set; tokens would not survive a restart");
        std::process::exit(1);
    }
    let token = generate_observer_token(
        &PrincipalInfo {
            uid: uid.clone(),
            role,
        },
        &derive_token_secret(&config.auth.token_secret),
        config.auth.token_ttl(),
    );
    println!("{}", token);
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("issue-token") {
        issue_token(&args);
        return;
    }

    let (config, selected_config_path, config_source) = load(args.get(1).cloned());

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = %selected_config_path,
        "resolved startup configuration path"
    );

    let token_secret = if config.auth.token_secret.is_empty() {
        tracing::warn!("auth.token_secret not set; using a random secret, tokens will not survive a restart");
        derive_token_secret(&format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        ))
    } else {
        derive_token_secret(&config.auth.token_secret)
    };

    let dialogue = HttpDialogueEngine::new(config.dialogue.clone())
        .expect("failed to create dialogue engine: set dialogue.endpoint or VOXLINE_DIALOGUE_ENDPOINT");
    let backends = Backends {
        transcription: Arc::new(CommandTranscriber::new(&config.transcription.backend)),
        synthesizer: Arc::new(CommandSynthesizer::new(&config.synthesis.backend)),
        dialogue: Arc::new(dialogue),
    };

    let state = AppState::build(&config, token_secret, backends);

    let reaper = tokio::spawn(background::start_reaper_task(
        Arc::new(state.clone()),
        config.memory.reap_interval_seconds,
    ));

    // Build application
    let router = app(state.clone());
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting voxline server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address: is another process using this port?");

    // Serve with graceful shutdown
    let shutdown_state = state.clone();
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        shutdown_state.pipeline.shutdown().await;
        shutdown_state.shutdown.cancel();
        shutdown_state.broker.clear().await;
    })
    .await
    .expect("server error");

    reaper.abort();
    tracing::info!("voxline server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_arg_wins_over_default() {
        let (path, source) = resolve_config_path(Some("/etc/voxline.toml".to_string()));
        assert_eq!(path.as_deref(), Some("/etc/voxline.toml"));
        assert_eq!(source, "cli-arg");
    }

    #[test]
    fn blank_cli_arg_is_ignored() {
        let (_, source) = resolve_config_path(Some("  ".to_string()));
        assert_ne!(source, "cli-arg");
    }
}
