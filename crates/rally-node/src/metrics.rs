//! Prometheus metrics server

use crate::config::MetricsConfig;
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Metrics server
pub struct MetricsServer {
    listener: TcpListener,
    /// Registry shared by every engine
    registry: Registry,
}

impl MetricsServer {
    /// Bind the configured address
    pub async fn bind(config: &MetricsConfig, registry: Registry) -> anyhow::Result<Self> {
        let addr: SocketAddr = config.address.parse()?;
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the metrics server
    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!("Starting metrics server on {}", self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, &registry).await {
                            tracing::debug!("Metrics connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            }
        }
    }
}

async fn serve(mut stream: TcpStream, registry: &Registry) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let response = respond(&request, registry);
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// HTTP response for a raw request
pub fn respond(request: &str, registry: &Registry) -> String {
    if request.starts_with("GET /metrics") {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        match encoder.encode(&registry.gather(), &mut buffer) {
            Ok(()) => format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
                encoder.format_type(),
                buffer.len(),
                String::from_utf8_lossy(&buffer)
            ),
            Err(e) => {
                tracing::error!("Failed to encode metrics: {}", e);
                "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n".to_string()
            }
        }
    } else if request.starts_with("GET /health") {
        let body = "{\"status\":\"healthy\"}";
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string()
    }
}
