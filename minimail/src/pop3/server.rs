use crate::config::Config;
use crate::error::Result;
use crate::pop3::session::Pop3Session;
use crate::security::auth::AuthStore;
use crate::security::tls::TlsConfig;
use crate::storage::MailStore;
use crate::transport::Transport;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// POP3 front end, mirroring the SMTP listener arrangement: plaintext
/// (optionally STLS-capable) and implicit TLS.
pub struct Pop3Server {
    config: Arc<Config>,
    store: Arc<MailStore>,
    auth: AuthStore,
}

impl Pop3Server {
    pub fn new(config: Arc<Config>, store: Arc<MailStore>, auth: AuthStore) -> Self {
        Self {
            config,
            store,
            auth,
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listen = self.config.pop3.clone();
        let mut handles = Vec::new();

        if listen.enable_plain {
            let starttls = if listen.plain_enable_starttls {
                match TlsConfig::from_pem_files(&listen.starttls_cert_path, &listen.starttls_key_path)
                {
                    Ok(tls) => {
                        info!("pop3 STLS enabled");
                        Some(tls.acceptor())
                    }
                    Err(e) => {
                        warn!("pop3 STLS enable failure: {}", e);
                        None
                    }
                }
            } else {
                None
            };
            match TcpListener::bind(&listen.plain_listen_addr).await {
                Ok(listener) => {
                    info!("pop3 server listening on {}", listen.plain_listen_addr);
                    let server = self.clone();
                    handles.push(tokio::spawn(server.accept_plain(listener, starttls)));
                }
                Err(e) => warn!("pop3 plain listener disabled: {}", e),
            }
        }

        if listen.enable_tls {
            match TlsConfig::from_pem_files(&listen.tls_cert_path, &listen.tls_key_path) {
                Ok(tls) => match TcpListener::bind(&listen.tls_listen_addr).await {
                    Ok(listener) => {
                        info!("pop3 tls server listening on {}", listen.tls_listen_addr);
                        let server = self.clone();
                        handles.push(tokio::spawn(server.accept_tls(listener, tls.acceptor())));
                    }
                    Err(e) => warn!("pop3 tls listener disabled: {}", e),
                },
                Err(e) => warn!("pop3 tls enable failure: {}", e),
            }
        }

        if handles.is_empty() {
            warn!("pop3 server will not start up");
            return Ok(());
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    fn session(&self, starttls: Option<TlsAcceptor>) -> Pop3Session {
        Pop3Session::new(
            self.config.clone(),
            self.store.clone(),
            self.auth.clone(),
            starttls,
        )
    }

    async fn accept_plain(self: Arc<Self>, listener: TcpListener, starttls: Option<TlsAcceptor>) {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    debug!("pop3 connection from {}", peer);
                    let session = self.session(starttls.clone());
                    tokio::spawn(async move {
                        if let Err(e) = session.handle(Transport::plain(socket)).await {
                            debug!("pop3 session from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => error!("pop3 accept error: {}", e),
            }
        }
    }

    async fn accept_tls(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    debug!("pop3 tls connection from {}", peer);
                    let session = self.session(None);
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(socket).await {
                            Ok(stream) => {
                                if let Err(e) = session.handle(Transport::server_tls(stream)).await
                                {
                                    debug!("pop3 session from {} ended: {}", peer, e);
                                }
                            }
                            Err(e) => warn!("pop3 tls handshake with {} failed: {}", peer, e),
                        }
                    });
                }
                Err(e) => error!("pop3 accept error: {}", e),
            }
        }
    }
}
