//! Connection transport abstraction
//!
//! A [`Transport`] owns exactly one TCP socket and presents it through
//! `AsyncRead`/`AsyncWrite` regardless of whether the stream is plaintext or
//! TLS. The plaintext variant can be upgraded in place exactly once
//! (STARTTLS), on either side of a connection; the handshake starts from the
//! next byte after the upgrade call.

use crate::error::{MailError, Result};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub enum Transport {
    Plain(TcpStream),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    /// Temporary state while an upgrade is in flight - never observable
    Upgrading,
}

impl Transport {
    pub fn plain(stream: TcpStream) -> Self {
        Transport::Plain(stream)
    }

    pub fn server_tls(stream: tokio_rustls::server::TlsStream<TcpStream>) -> Self {
        Transport::ServerTls(Box::new(stream))
    }

    pub fn is_secure(&self) -> bool {
        !matches!(self, Transport::Plain(_))
    }

    /// Upgrade the server side of a plaintext connection to TLS.
    ///
    /// Fails with a sequencing error if the transport is already secured;
    /// the underlying socket is untouched in that case.
    pub async fn upgrade_accept(&mut self, acceptor: &TlsAcceptor) -> Result<()> {
        match std::mem::replace(self, Transport::Upgrading) {
            Transport::Plain(tcp) => {
                let tls = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| MailError::Tls(format!("TLS handshake failed: {}", e)))?;
                *self = Transport::ServerTls(Box::new(tls));
                Ok(())
            }
            other => {
                *self = other;
                Err(MailError::Tls("transport already secured".to_string()))
            }
        }
    }

    /// Upgrade the client side of a plaintext connection to TLS.
    pub async fn upgrade_connect(
        &mut self,
        connector: &TlsConnector,
        server_name: rustls::ServerName,
    ) -> Result<()> {
        match std::mem::replace(self, Transport::Upgrading) {
            Transport::Plain(tcp) => {
                let tls = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| MailError::Tls(format!("TLS handshake failed: {}", e)))?;
                *self = Transport::ClientTls(Box::new(tls));
                Ok(())
            }
            other => {
                *self = other;
                Err(MailError::Tls("transport already secured".to_string()))
            }
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::ServerTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            Transport::ClientTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            Transport::Upgrading => panic!("I/O on transport during TLS upgrade"),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::ServerTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            Transport::ClientTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            Transport::Upgrading => panic!("I/O on transport during TLS upgrade"),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::ServerTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            Transport::ClientTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            Transport::Upgrading => panic!("I/O on transport during TLS upgrade"),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::ServerTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            Transport::ClientTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            Transport::Upgrading => panic!("I/O on transport during TLS upgrade"),
        }
    }
}
