use std::sync::Arc;

use palaver_cluster::Cluster;
use palaver_engine::{Hub, SessionStore};
use palaver_store::{MemoryStore, QueuedPush, TrivialAuth};

use crate::config::ServerConfig;

/// The assembled application: storage, hub, optional cluster layer, and
/// the session registry, initialized in that order and torn down in
/// reverse.
pub struct App {
    pub hub: Arc<Hub>,
    pub sessions: Arc<SessionStore>,
    pub cluster: Option<Arc<Cluster>>,
    pub config: ServerConfig,
}

impl App {
    pub async fn start(config: ServerConfig) -> std::io::Result<Arc<Self>> {
        let store = Arc::new(MemoryStore::new());
        let auth = Arc::new(TrivialAuth);
        let (push, mut push_rx) = QueuedPush::new(1024);
        tokio::spawn(async move {
            while let Some(receipt) = push_rx.recv().await {
                tracing::debug!(
                    topic = %receipt.topic,
                    seq = receipt.seq,
                    recipients = receipt.recipients.len(),
                    "push receipt"
                );
            }
        });

        let hub = Hub::new(store, auth, Arc::new(push), config.engine_config());
        let sessions = Arc::new(SessionStore::new());

        let cluster = match config.cluster_config() {
            Some(cc) => {
                let cluster = Cluster::new(cc, &hub, Arc::clone(&sessions));
                cluster.start().await?;
                Some(cluster)
            }
            None => None,
        };

        Ok(Arc::new(Self {
            hub,
            sessions,
            cluster,
            config,
        }))
    }

    /// Drain every topic, drop cluster links, then evict remaining
    /// sessions.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down");
        self.hub.shutdown().await;
        if let Some(cluster) = &self.cluster {
            cluster.stop().await;
        }
        self.sessions.shutdown().await;
    }
}
