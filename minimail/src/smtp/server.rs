use crate::config::Config;
use crate::error::Result;
use crate::security::auth::AuthStore;
use crate::security::tls::TlsConfig;
use crate::smtp::relay::RelayJob;
use crate::smtp::session::SmtpSession;
use crate::storage::MailStore;
use crate::transport::Transport;
use crate::utils::dkim::DkimSigner;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// SMTP front end: a plaintext listener (optionally STARTTLS-capable) and
/// an implicit-TLS listener, each independently enabled. One session task
/// per accepted connection.
pub struct SmtpServer {
    config: Arc<Config>,
    store: Arc<MailStore>,
    auth: AuthStore,
    signer: Option<Arc<DkimSigner>>,
    relay_tx: mpsc::UnboundedSender<RelayJob>,
}

impl SmtpServer {
    pub fn new(
        config: Arc<Config>,
        store: Arc<MailStore>,
        auth: AuthStore,
        signer: Option<Arc<DkimSigner>>,
        relay_tx: mpsc::UnboundedSender<RelayJob>,
    ) -> Self {
        Self {
            config,
            store,
            auth,
            signer,
            relay_tx,
        }
    }

    /// Bind the configured listeners. A listener that fails to bind or
    /// whose certificate cannot be loaded is disabled with a warning.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let inbound = self.config.smtp.inbound.clone();
        let mut handles = Vec::new();

        if inbound.enable_plain {
            let starttls = if inbound.plain_enable_starttls {
                match TlsConfig::from_pem_files(&inbound.starttls_cert_path, &inbound.starttls_key_path)
                {
                    Ok(tls) => {
                        info!("smtp STARTTLS enabled");
                        Some(tls.acceptor())
                    }
                    Err(e) => {
                        warn!("smtp STARTTLS enable failure: {}", e);
                        None
                    }
                }
            } else {
                None
            };
            match TcpListener::bind(&inbound.plain_listen_addr).await {
                Ok(listener) => {
                    info!("smtp server listening on {}", inbound.plain_listen_addr);
                    let server = self.clone();
                    handles.push(tokio::spawn(server.accept_plain(listener, starttls)));
                }
                Err(e) => warn!("smtp plain listener disabled: {}", e),
            }
        }

        if inbound.enable_tls {
            match TlsConfig::from_pem_files(&inbound.tls_cert_path, &inbound.tls_key_path) {
                Ok(tls) => match TcpListener::bind(&inbound.tls_listen_addr).await {
                    Ok(listener) => {
                        info!("smtp tls server listening on {}", inbound.tls_listen_addr);
                        let server = self.clone();
                        handles.push(tokio::spawn(server.accept_tls(listener, tls.acceptor())));
                    }
                    Err(e) => warn!("smtp tls listener disabled: {}", e),
                },
                Err(e) => warn!("smtp tls enable failure: {}", e),
            }
        }

        if handles.is_empty() {
            warn!("smtp server will not start up");
            return Ok(());
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    fn session(&self, starttls: Option<TlsAcceptor>) -> SmtpSession {
        SmtpSession::new(
            self.config.clone(),
            self.store.clone(),
            self.auth.clone(),
            self.signer.clone(),
            self.relay_tx.clone(),
            starttls,
        )
    }

    async fn accept_plain(self: Arc<Self>, listener: TcpListener, starttls: Option<TlsAcceptor>) {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    debug!("smtp connection from {}", peer);
                    let session = self.session(starttls.clone());
                    tokio::spawn(async move {
                        if let Err(e) = session.handle(Transport::plain(socket)).await {
                            debug!("smtp session from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => error!("smtp accept error: {}", e),
            }
        }
    }

    async fn accept_tls(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    debug!("smtp tls connection from {}", peer);
                    let session = self.session(None);
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(socket).await {
                            Ok(stream) => {
                                if let Err(e) = session.handle(Transport::server_tls(stream)).await
                                {
                                    debug!("smtp session from {} ended: {}", peer, e);
                                }
                            }
                            Err(e) => warn!("smtp tls handshake with {} failed: {}", peer, e),
                        }
                    });
                }
                Err(e) => error!("smtp accept error: {}", e),
            }
        }
    }
}
