use std::future::Future;
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Resolves once SIGINT (Ctrl+C) or SIGTERM is received.
///
/// Handlers are installed when this is called, not when the future is first
/// polled, so a signal arriving before the server starts is not lost.
pub fn shutdown_signal() -> impl Future<Output = ()> {
    let interrupt = install(SignalKind::interrupt(), "SIGINT");
    let terminate = install(SignalKind::terminate(), "SIGTERM");

    async move {
        tokio::select! {
            _ = recv(interrupt) => tracing::info!("Received SIGINT, shutting down HTTP server"),
            _ = recv(terminate) => tracing::info!("Received SIGTERM, shutting down HTTP server"),
        }
    }
}

fn install(kind: SignalKind, name: &str) -> Option<Signal> {
    match signal(kind) {
        Ok(stream) => Some(stream),
        Err(e) => {
            tracing::error!("Failed to install {} handler: {}", name, e);
            None
        }
    }
}

async fn recv(stream: Option<Signal>) {
    match stream {
        Some(mut stream) => {
            stream.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptConfig;
    use crate::engine::server::{router, AppState};
    use crate::launcher::{self, ScriptMonitor, ScriptState};
    use nix::sys::signal::{raise, Signal as NixSignal};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigterm_closes_listener_then_stops_script() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("start.sh");
        std::fs::write(&script, "echo up\nsleep 30\n").unwrap();

        let config = ScriptConfig {
            path: script,
            interpreter: "sh".to_string(),
            env_file: None,
            stop_grace_secs: 2,
            ..Default::default()
        };
        let monitor = Arc::new(ScriptMonitor::new(&config.label(), config.log_capacity));
        let launch = launcher::launch(config, Arc::clone(&monitor));

        let state = Arc::new(AppState {
            landing_message: "Hello world!".to_string(),
            subscription_path: PathBuf::from("/nonexistent/sub.txt"),
            monitor: Arc::clone(&monitor),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let shutdown = shutdown_signal();
        let server = tokio::spawn(async move {
            axum::serve(listener, router(state))
                .with_graceful_shutdown(shutdown)
                .await
        });

        let resp = reqwest::get(format!("http://{}/", addr)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(resp.text().await.unwrap(), "Hello world!");

        for _ in 0..100 {
            if matches!(monitor.snapshot().await.state, ScriptState::Running { .. }) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        raise(NixSignal::SIGTERM).unwrap();

        tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .expect("server should stop after SIGTERM")
            .unwrap()
            .unwrap();
        assert!(
            tokio::net::TcpStream::connect(addr).await.is_err(),
            "listener should be closed"
        );

        tokio::time::timeout(Duration::from_secs(10), launch.shutdown())
            .await
            .expect("script shutdown should not hang");
        assert!(matches!(
            monitor.snapshot().await.state,
            ScriptState::Exited { .. }
        ));
    }
}
