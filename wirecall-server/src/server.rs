//! Server assembly: one dispatcher exposed over the HTTP binding and,
//! optionally, the framed channel.

use std::sync::Arc;
use tokio::net::TcpListener;
use wirecall_core::Dispatcher;
use wirecall_transport::serve_channel;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Channel listener port; `None` leaves the channel binding off.
    pub channel_port: Option<u16>,
    /// Mount point of the HTTP binding.
    pub rpc_root: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            http_port: 8080,
            channel_port: None,
            rpc_root: "/rpc".to_string(),
        }
    }
}

pub struct Server {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .finish()
    }
}

impl Server {
    pub fn new(config: ServerConfig, dispatcher: Dispatcher) -> Self {
        Server {
            config,
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Bind and serve until the process is stopped.
    pub async fn run(self) -> anyhow::Result<()> {
        for md in self.dispatcher.methods() {
            tracing::info!(
                method = %md.full_name,
                kind = ?md.kind,
                signature = %md.signature(),
                "method mounted"
            );
        }

        if let Some(port) = self.config.channel_port {
            let addr = format!("{}:{}", self.config.host, port);
            let listener = TcpListener::bind(&addr).await?;
            tracing::info!("channel binding listening on {addr}");
            tokio::spawn(serve_channel(listener, Arc::clone(&self.dispatcher)));
        }

        let app = crate::http::router(Arc::clone(&self.dispatcher), &self.config.rpc_root);
        let addr = format!("{}:{}", self.config.host, self.config.http_port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(
            "http binding listening on http://{addr}{}",
            self.config.rpc_root
        );
        axum::serve(listener, app).await?;
        Ok(())
    }
}
