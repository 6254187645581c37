use anyhow::{Context, Result};
use rustls::pki_types::ServerName;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::relay::{self, Tee, WriterTee};
use crate::stream::{InboundStream, StreamType};
use crate::tls;

struct Outbound {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// Everything a connection needs, shared read-only across all of them.
pub struct Forwarder {
    config: Config,
    acceptor: Option<TlsAcceptor>,
    outbound: Option<Outbound>,
    tee: Option<Arc<dyn Tee>>,
}

impl Forwarder {
    /// A plain forwarder: no TLS on either side, no dumping.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            acceptor: None,
            outbound: None,
            tee: None,
        }
    }

    /// Loads all TLS material the configuration asks for.
    pub fn from_config(config: Config) -> Result<Self> {
        let inbound = config
            .inbound_tls
            .as_ref()
            .map(tls::load_server_config)
            .transpose()
            .context("Failed to load keypair")?;
        let outbound = config
            .outbound_tls
            .as_ref()
            .map(|outbound| tls::load_client_config(&outbound.trust))
            .transpose()
            .context("Failed to load CA certificates")?;
        let dump = config.dump;

        let mut forwarder = Self::new(config);
        if let Some(server_config) = inbound {
            forwarder = forwarder.with_inbound_tls(server_config);
        }
        if let Some(client_config) = outbound {
            forwarder = forwarder.with_outbound_tls(client_config)?;
        }
        if dump {
            forwarder = forwarder.with_tee(Arc::new(WriterTee::stdout()));
        }
        Ok(forwarder)
    }

    #[must_use]
    pub fn with_inbound_tls(mut self, server_config: rustls::ServerConfig) -> Self {
        self.acceptor = Some(TlsAcceptor::from(Arc::new(server_config)));
        self
    }

    /// Remote certificates are verified against the configured remote host.
    pub fn with_outbound_tls(mut self, client_config: rustls::ClientConfig) -> Result<Self> {
        let server_name = tls::server_name(&self.config.remote_host)?;
        self.outbound = Some(Outbound {
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name,
        });
        Ok(self)
    }

    #[must_use]
    pub fn with_tee(mut self, tee: Arc<dyn Tee>) -> Self {
        self.tee = Some(tee);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Name outbound certificates must match, if outbound TLS is on.
    #[must_use]
    pub fn expected_server_name(&self) -> Option<&ServerName<'static>> {
        self.outbound.as_ref().map(|outbound| &outbound.server_name)
    }
}

/// Binds the listen address and serves until an accept fails.
pub async fn run(forwarder: Forwarder) -> Result<()> {
    let listen_addr = forwarder.config.listen.clone();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Cannot listen on {listen_addr}"))?;

    info!(
        listen_addr = %listen_addr,
        remote_addr = %forwarder.config.remote,
        "Forwarder listening"
    );

    serve(listener, Arc::new(forwarder)).await
}

pub async fn serve(listener: TcpListener, forwarder: Arc<Forwarder>) -> Result<()> {
    loop {
        let (stream, client_addr) = listener.accept().await.context("Accept failed")?;
        let forwarder = forwarder.clone();
        tokio::spawn(async move { process_connection(stream, client_addr, &forwarder).await });
    }
}

/// Runs one connection to completion; in verbose mode every "Connected" line
/// gets a matching "Disconnected", whichever way the connection ends.
async fn process_connection(stream: TcpStream, client_addr: SocketAddr, forwarder: &Forwarder) {
    let verbose = forwarder.config.verbose;
    if verbose {
        info!(client_addr = %client_addr, "Connected");
    }

    if let Err(e) = handle_connection(stream, client_addr, forwarder).await {
        let error = format!("{e:#}");
        error!(client_addr = %client_addr, error = %error, "Connection failed");
    }

    if verbose {
        info!(client_addr = %client_addr, "Disconnected");
    }
}

#[tracing::instrument(skip(stream, forwarder))]
pub async fn handle_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    forwarder: &Forwarder,
) -> Result<()> {
    let config = &forwarder.config;
    let local = InboundStream::wrap(stream, forwarder.acceptor.as_ref());

    debug!(remote_addr = %config.remote, inbound_tls = local.is_tls(), "Connecting to remote");
    let tcp_stream = TcpStream::connect(&config.remote)
        .await
        .with_context(|| format!("Failed to connect to {}", config.remote))?;

    let remote = match &forwarder.outbound {
        Some(outbound) => {
            let tls_stream = outbound
                .connector
                .connect(outbound.server_name.clone(), tcp_stream)
                .await
                .with_context(|| {
                    format!(
                        "TLS certificate not validated for {}",
                        config.remote_host
                    )
                })?;
            StreamType::ClientTls(Box::new(tls_stream))
        }
        None => StreamType::Plain(tcp_stream),
    };
    debug!(remote_addr = %config.remote, "Connected to remote");

    // Inbound handshake failures end the session like any other relay error.
    let local = match local.establish().await {
        Ok(local) => local,
        Err(e) => {
            debug!(error = %e, "Inbound TLS handshake failed");
            return Ok(());
        }
    };

    let relay = relay::spawn(local, remote, forwarder.tee.clone());
    if config.verbose {
        let totals = relay.join().await;
        debug!(
            upstream_bytes = totals.upstream,
            downstream_bytes = totals.downstream,
            "Relay finished"
        );
    }
    Ok(())
}
