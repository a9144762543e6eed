use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use embed_queue::config::{DaemonConfig, QueueConfig};
use embed_queue::host::ProcessHostFactory;
use embed_queue::router::{Message, Reply};
use embed_queue::runtime::QueueRuntime;
use embed_queue::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries replies
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = QueueConfig::from_env();
    config.validate().context("invalid queue configuration")?;
    let daemon = DaemonConfig::from_env().context("invalid daemon configuration")?;

    eprintln!("embed-queue v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", daemon.db_path.display());
    eprintln!("   Worker: {}", daemon.host_command.join(" "));

    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&daemon.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", daemon.db_path.display()))?,
    );
    let factory = Arc::new(ProcessHostFactory::new(&daemon.host_command)?);

    let runtime = QueueRuntime::start(store, factory, &config);
    let router = runtime.handle();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Message>(line) {
            Ok(message) => router.request(message).await.unwrap_or_else(|e| Reply::Error {
                message: e.to_string(),
            }),
            Err(e) => Reply::Error {
                message: format!("invalid message: {}", e),
            },
        };

        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    runtime.shutdown().await;
    Ok(())
}
