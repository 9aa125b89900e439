//! Rally node
//!
//! Runs one reward engine per enabled platform over a shared activity
//! store and metrics registry, feeds them from the JSON-lines ingest and
//! writes their outbound actions as JSON lines.

use crate::adapters::{DiscordAdapter, Outbound, Outbox, TelegramAdapter};
use crate::config::{Credentials, NodeConfig, PlatformSettings};
use crate::ingest::{IngestStats, Router};
use crate::metrics::MetricsServer;
use rally_core::Platform;
use rally_engine::{
    EngineInput, EngineMetrics, FlushReport, MemoryStore, PlatformAdapter, RewardEngine,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What a node run did
#[derive(Debug, Default)]
pub struct NodeReport {
    /// `None` when shutdown arrived before the input was exhausted
    pub ingest: Option<IngestStats>,
    /// Final flush of each engine
    pub final_flushes: Vec<(Platform, FlushReport)>,
    /// Outbound actions written
    pub outbound: u64,
}

struct EngineHandle {
    platform: Platform,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<FlushReport>,
}

/// Rally node
pub struct RallyNode {
    config: NodeConfig,
    credentials: Vec<(PlatformSettings, Credentials)>,
    store: Arc<MemoryStore>,
}

impl RallyNode {
    /// Create a node, loading the store snapshot if one exists
    pub fn new(
        config: NodeConfig,
        credentials: Vec<(PlatformSettings, Credentials)>,
    ) -> anyhow::Result<Self> {
        let store = match &config.store.snapshot_path {
            Some(path) if path.exists() => {
                tracing::info!("Loading store snapshot from {:?}", path);
                MemoryStore::open(path)?
            }
            _ => MemoryStore::new(),
        };

        Ok(Self {
            config,
            credentials,
            store: Arc::new(store),
        })
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Run until `input` is exhausted (unless `ingest.keep_running`) or
    /// `shutdown` resolves. Every engine flushes before this returns.
    pub async fn run<R, W, S>(self, input: R, output: W, shutdown: S) -> anyhow::Result<NodeReport>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
        S: Future<Output = ()>,
    {
        tracing::info!("Starting Rally node...");
        let registry = prometheus::Registry::new();
        let (outbox, outbound_rx) = Outbox::new();
        let writer = tokio::spawn(write_outbound(outbound_rx, output));

        let mut router = Router::new();
        let mut engines = Vec::new();
        for (settings, credentials) in &self.credentials {
            let (inbox_tx, inbox_rx) = mpsc::channel(self.config.ingest.channel_capacity);
            let metrics = EngineMetrics::with_registry(registry.clone(), settings.platform.as_str())?;

            let handle = match settings.platform {
                Platform::Discord => {
                    let adapter = DiscordAdapter::new(settings, credentials, outbox.clone());
                    self.start_engine(adapter, metrics, inbox_rx).await?
                }
                Platform::Telegram => {
                    let adapter = TelegramAdapter::new(settings, credentials, outbox.clone());
                    self.start_engine(adapter, metrics, inbox_rx).await?
                }
            };
            router.add_route(settings.platform, inbox_tx);
            engines.push(handle);
        }
        // Adapters hold the remaining senders; the writer ends with the last engine
        drop(outbox);

        let metrics_handle = if self.config.metrics.enabled {
            let server = MetricsServer::bind(&self.config.metrics, registry.clone()).await?;
            Some(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    tracing::error!("Metrics server error: {}", e);
                }
            }))
        } else {
            None
        };

        tracing::info!(platforms = ?router.platforms(), "Rally node running");

        tokio::pin!(shutdown);
        let ingest = tokio::select! {
            stats = router.pump(input) => Some(stats?),
            _ = &mut shutdown => None,
        };
        if ingest.is_some() && self.config.ingest.keep_running {
            tracing::info!("Input exhausted, waiting for shutdown signal");
            shutdown.await;
        }

        tracing::info!("Shutting down...");
        drop(router);

        // After a plain end of input the engines drain their closed inboxes
        // and stop on their own; otherwise they are told to stop now.
        let drain_inputs = ingest.is_some() && !self.config.ingest.keep_running;
        let mut report = NodeReport {
            ingest,
            ..Default::default()
        };
        for engine in engines {
            if !drain_inputs {
                let _ = engine.shutdown_tx.send(()).await;
            }
            match engine.task.await {
                Ok(flush) => report.final_flushes.push((engine.platform, flush)),
                Err(e) => tracing::error!(platform = %engine.platform, "Engine task failed: {}", e),
            }
        }

        report.outbound = writer.await?;
        if let Some(handle) = metrics_handle {
            handle.abort();
        }

        if let Some(path) = &self.config.store.snapshot_path {
            self.store.save_snapshot(path)?;
            tracing::info!("Store snapshot written to {:?}", path);
        }

        tracing::info!("Node stopped");
        Ok(report)
    }

    async fn start_engine<A>(
        &self,
        adapter: A,
        metrics: EngineMetrics,
        inbox: mpsc::Receiver<EngineInput<Value>>,
    ) -> anyhow::Result<EngineHandle>
    where
        A: PlatformAdapter<Raw = Value> + 'static,
    {
        let platform = adapter.platform();
        let engine = RewardEngine::new(
            self.config.engine.clone(),
            adapter,
            self.store.clone(),
            metrics,
        )?;
        engine.bootstrap().await;

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(async move { engine.run(inbox, shutdown_rx).await });

        Ok(EngineHandle {
            platform,
            shutdown_tx,
            task,
        })
    }
}

/// Write outbound actions as JSON lines until every adapter is gone.
/// Returns the number of actions written.
async fn write_outbound<W>(mut rx: mpsc::UnboundedReceiver<Outbound>, mut output: W) -> u64
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(action) = rx.recv().await {
        let mut line = match serde_json::to_string(&action) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to encode outbound action: {}", e);
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = output.write_all(line.as_bytes()).await {
            tracing::warn!("Failed to write outbound action: {}", e);
            continue;
        }
        written += 1;
    }
    if let Err(e) = output.flush().await {
        tracing::warn!("Failed to flush outbound writer: {}", e);
    }
    written
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
