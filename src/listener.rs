//! Listening socket with TLS/plain-HTTP multiplexing
//!
//! In HTTPS mode the one proxy port still has to accept plain `http://`
//! connections (health checks and tooling hitting `http://127.0.0.1:P`).
//! Each accepted connection is dispatched by peeking at its first byte
//! without consuming it: a TLS ClientHello always starts with the
//! handshake record type `0x16`, anything else is treated as cleartext
//! HTTP/1.1. Both branches run the same proxy engine.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::proxy::ProxyEngine;

/// First byte of a TLS record carrying a ClientHello.
const TLS_HANDSHAKE_BYTE: u8 = 0x16;

/// Accept loop for the proxy port. With a TLS acceptor configured the port
/// serves both `https://` and `http://`; without one it is plain HTTP.
pub struct ProxyListener {
    listener: TcpListener,
    engine: ProxyEngine,
    tls_acceptor: Option<TlsAcceptor>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyListener {
    /// Bind the proxy port, translating the two common failures into
    /// actionable messages.
    pub async fn bind(
        addr: SocketAddr,
        engine: ProxyEngine,
        tls_config: Option<Arc<rustls::ServerConfig>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse => anyhow::anyhow!(
                "port {} is already in use; run `portless proxy stop` if an old proxy is still around",
                addr.port()
            ),
            std::io::ErrorKind::PermissionDenied => anyhow::anyhow!(
                "permission denied binding port {}; ports below 1024 need sudo, or pick a higher port with -p",
                addr.port()
            ),
            _ => anyhow::Error::new(e).context(format!("failed to bind {addr}")),
        })?;

        Ok(Self {
            listener,
            engine,
            tls_acceptor: tls_config.map(TlsAcceptor::from),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read listener address")
    }

    /// Run until the shutdown signal flips. Connections already accepted
    /// finish on their own tasks.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let protocol = if self.tls_acceptor.is_some() {
            "HTTPS+HTTP"
        } else {
            "HTTP"
        };
        info!(addr = %self.local_addr()?, protocol, "proxy listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let engine = self.engine.clone();
                            let acceptor = self.tls_acceptor.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, addr, engine, acceptor).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: ProxyEngine,
    acceptor: Option<TlsAcceptor>,
) {
    let Some(acceptor) = acceptor else {
        serve(stream, addr, engine, false).await;
        return;
    };

    // peek() waits for readability and leaves the byte in the socket
    // buffer, so whichever inner server wins sees the full stream.
    let mut first = [0u8; 1];
    let n = match stream.peek(&mut first).await {
        Ok(n) => n,
        Err(e) => {
            debug!(%addr, error = %e, "failed to peek connection");
            return;
        }
    };
    if n == 0 {
        return;
    }

    if first[0] == TLS_HANDSHAKE_BYTE {
        match acceptor.accept(stream).await {
            Ok(tls_stream) => serve(tls_stream, addr, engine, true).await,
            Err(e) => {
                debug!(%addr, error = %e, "TLS handshake failed");
            }
        }
    } else {
        serve(stream, addr, engine, false).await;
    }
}

/// Drive one connection through hyper's auto builder: HTTP/2 (h2 over TLS
/// via ALPN) and HTTP/1.1 with upgrade support share the same handler.
async fn serve<S>(stream: S, addr: SocketAddr, engine: ProxyEngine, via_tls: bool)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let engine = engine.clone();
        async move { engine.handle(req, addr, via_tls).await }
    });

    if let Err(e) = AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
    {
        debug!(%addr, error = %e, "connection closed with error");
    }
}
