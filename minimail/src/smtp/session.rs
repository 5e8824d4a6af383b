//! Inbound SMTP session state machine
//!
//! One session per accepted connection. A session decides between two modes
//! on `MAIL FROM`: a local sender means relay ("send") mode, which requires
//! a prior AUTH owning the claimed address; any other sender means deliver
//! ("receive") mode, where recipients must be local mailboxes. `DATA` either
//! persists the message into every recipient mailbox (deliver) or stages it
//! once, signs it, and hands it to the relay worker (relay).

use crate::config::Config;
use crate::error::{MailError, Result};
use crate::framer::read_line;
use crate::security::auth::{decode_login_credential, AuthStore};
use crate::smtp::commands::SmtpCommand;
use crate::smtp::relay::RelayJob;
use crate::storage::{MailStore, StagedFile};
use crate::transport::Transport;
use crate::utils::dkim::{canonicalize_header_list, BodyHasher, DkimSigner};
use crate::utils::{domain_of, validate_email};
use chrono::Utc;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

const DISK_FULL_REPLY: &[u8] =
    b"431 The Recipient's Mail Server Is Experiencing a Disk Full Condition\r\n";

#[derive(Debug, Clone, Copy, PartialEq)]
enum SmtpState {
    Fresh,
    Greeted,
    MailFrom,
    RcptTo,
}

pub struct SmtpSession {
    config: Arc<Config>,
    store: Arc<MailStore>,
    auth: AuthStore,
    signer: Option<Arc<DkimSigner>>,
    relay_tx: mpsc::UnboundedSender<RelayJob>,
    starttls: Option<TlsAcceptor>,
    state: SmtpState,
    helo_host: Option<String>,
    authenticated_user: Option<String>,
    from: Option<String>,
    recipients: Vec<String>,
    relay_mode: bool,
}

async fn reply(transport: &mut Transport, message: &[u8]) -> Result<()> {
    transport.write_all(message).await?;
    transport.flush().await?;
    Ok(())
}

impl SmtpSession {
    pub fn new(
        config: Arc<Config>,
        store: Arc<MailStore>,
        auth: AuthStore,
        signer: Option<Arc<DkimSigner>>,
        relay_tx: mpsc::UnboundedSender<RelayJob>,
        starttls: Option<TlsAcceptor>,
    ) -> Self {
        Self {
            config,
            store,
            auth,
            signer,
            relay_tx,
            starttls,
            state: SmtpState::Fresh,
            helo_host: None,
            authenticated_user: None,
            from: None,
            recipients: Vec::new(),
            relay_mode: false,
        }
    }

    pub async fn handle(mut self, mut transport: Transport) -> Result<()> {
        reply(
            &mut transport,
            format!(
                "220 {} ESMTP {}\r\n",
                self.config.general.server_address,
                crate::SERVER_NAME
            )
            .as_bytes(),
        )
        .await?;

        loop {
            let Some(line) = read_line(&mut transport).await? else {
                debug!("client disconnected");
                return Ok(());
            };
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim_end();
            debug!("received: {}", trimmed);

            let command = match SmtpCommand::parse(trimmed) {
                Ok(command) => command,
                Err(_) => {
                    reply(&mut transport, b"500 Error: bad syntax\r\n").await?;
                    continue;
                }
            };

            match command {
                SmtpCommand::Helo(host) => {
                    self.greet(host);
                    reply(&mut transport, b"250 OK\r\n").await?;
                }
                SmtpCommand::Ehlo(host) => {
                    self.greet(host);
                    let mut response = format!("250-{}\r\n250-AUTH LOGIN\r\n250-AUTH=LOGIN\r\n", self.config.general.server_address);
                    if self.starttls.is_some() && !transport.is_secure() {
                        response.push_str("250-STARTTLS\r\n");
                    }
                    response.push_str("250 8BITMIME\r\n");
                    reply(&mut transport, response.as_bytes()).await?;
                }
                SmtpCommand::Auth(args) => {
                    if !self.handle_auth(&args, &mut transport).await? {
                        return Ok(());
                    }
                }
                SmtpCommand::Starttls => {
                    self.handle_starttls(&mut transport).await?;
                }
                SmtpCommand::MailFrom(address) => {
                    self.handle_mail(address, &mut transport).await?;
                }
                SmtpCommand::RcptTo(address) => {
                    self.handle_rcpt(address, &mut transport).await?;
                }
                SmtpCommand::Data => {
                    self.handle_data(&mut transport).await?;
                }
                SmtpCommand::Rset => {
                    self.from = None;
                    self.recipients.clear();
                    self.relay_mode = false;
                    self.state = if self.helo_host.is_some() {
                        SmtpState::Greeted
                    } else {
                        SmtpState::Fresh
                    };
                    reply(&mut transport, b"250 OK\r\n").await?;
                }
                SmtpCommand::Noop => {
                    reply(&mut transport, b"250 OK\r\n").await?;
                }
                SmtpCommand::Quit => {
                    reply(&mut transport, b"221 Bye\r\n").await?;
                    let _ = transport.shutdown().await;
                    return Ok(());
                }
                SmtpCommand::Unknown(command) => {
                    debug!("unknown command: {}", command);
                    reply(&mut transport, b"502 Error: command not implemented\r\n").await?;
                }
            }
        }
    }

    fn greet(&mut self, host: String) {
        self.helo_host = Some(host);
        self.from = None;
        self.recipients.clear();
        self.relay_mode = false;
        self.state = SmtpState::Greeted;
    }

    /// AUTH LOGIN challenge-response. Returns false if the client went away
    /// mid-exchange.
    async fn handle_auth(&mut self, args: &str, transport: &mut Transport) -> Result<bool> {
        if self.state == SmtpState::Fresh {
            reply(transport, b"503 Error: send HELO/EHLO first\r\n").await?;
            return Ok(true);
        }
        if self.authenticated_user.is_some() {
            reply(transport, b"503 Already authenticated\r\n").await?;
            return Ok(true);
        }
        let mechanism = args.split_whitespace().next().unwrap_or("");
        if mechanism != "LOGIN" {
            reply(transport, b"504 Unrecognized authentication type\r\n").await?;
            return Ok(true);
        }

        // base64 "Username:"
        reply(transport, b"334 VXNlcm5hbWU6\r\n").await?;
        let Some(username_line) = read_line(transport).await? else {
            return Ok(false);
        };
        // base64 "Password:"
        reply(transport, b"334 UGFzc3dvcmQ6\r\n").await?;
        let Some(password_line) = read_line(transport).await? else {
            return Ok(false);
        };

        let username =
            match decode_login_credential(String::from_utf8_lossy(&username_line).trim_end()) {
                Ok(username) => username,
                Err(_) => {
                    reply(transport, b"535 Error: authentication failed\r\n").await?;
                    return Ok(true);
                }
            };
        let password =
            match decode_login_credential(String::from_utf8_lossy(&password_line).trim_end()) {
                Ok(password) => password,
                Err(_) => {
                    reply(transport, b"535 Error: authentication failed\r\n").await?;
                    return Ok(true);
                }
            };

        if self.auth.verify_credentials(&username, &password).await {
            info!("authentication successful for {}", username);
            self.authenticated_user = Some(username);
            reply(transport, b"235 Authentication successful\r\n").await?;
        } else {
            warn!("authentication failed for {}", username);
            reply(transport, b"535 Error: authentication failed\r\n").await?;
        }
        Ok(true)
    }

    /// STARTTLS: valid once, before authentication, plaintext only. After a
    /// successful upgrade the client must greet again.
    async fn handle_starttls(&mut self, transport: &mut Transport) -> Result<()> {
        if self.starttls.is_none() {
            reply(transport, b"502 Error: command not implemented\r\n").await?;
            return Ok(());
        }
        if transport.is_secure() {
            reply(transport, b"503 Error: command not permitted when TLS active\r\n").await?;
            return Ok(());
        }
        if self.authenticated_user.is_some() {
            reply(transport, b"503 bad sequence of commands\r\n").await?;
            return Ok(());
        }
        let Some(acceptor) = self.starttls.clone() else {
            return Ok(());
        };

        reply(transport, b"220 Go ahead\r\n").await?;
        transport.upgrade_accept(&acceptor).await?;
        info!("STARTTLS upgrade completed");

        self.state = SmtpState::Fresh;
        self.helo_host = None;
        self.from = None;
        self.recipients.clear();
        self.relay_mode = false;
        Ok(())
    }

    async fn handle_mail(&mut self, address: String, transport: &mut Transport) -> Result<()> {
        if !matches!(
            self.state,
            SmtpState::Greeted | SmtpState::MailFrom | SmtpState::RcptTo
        ) {
            reply(transport, b"503 Error: send HELO/EHLO first\r\n").await?;
            return Ok(());
        }
        if validate_email(&address).is_err() {
            reply(transport, b"550 Invalid User\r\n").await?;
            return Ok(());
        }

        let domain = domain_of(&address).unwrap_or_default();
        if domain == self.config.general.mail_domain {
            // Local sender: relay mode, gated on an AUTH identity owning
            // the claimed address
            match &self.authenticated_user {
                None => {
                    reply(transport, b"553 authentication is required\r\n").await?;
                    return Ok(());
                }
                Some(user) => {
                    if !self.auth.user_owns_address(user, &address).await {
                        reply(transport, b"553 Mail from must equal authorized user\r\n").await?;
                        return Ok(());
                    }
                }
            }
            self.relay_mode = true;
        } else {
            self.relay_mode = false;
        }

        info!("MAIL FROM: {}", address);
        self.from = Some(address);
        self.recipients.clear();
        self.state = SmtpState::MailFrom;
        reply(transport, b"250 Mail OK\r\n").await?;
        Ok(())
    }

    async fn handle_rcpt(&mut self, address: String, transport: &mut Transport) -> Result<()> {
        if !matches!(self.state, SmtpState::MailFrom | SmtpState::RcptTo) {
            reply(transport, b"503 bad sequence of commands\r\n").await?;
            return Ok(());
        }
        if validate_email(&address).is_err() {
            reply(transport, b"550 Invalid User\r\n").await?;
            return Ok(());
        }

        let domain = domain_of(&address).unwrap_or_default();
        if domain == self.config.general.mail_domain {
            if !self.auth.address_exists(&address).await {
                reply(
                    transport,
                    format!("550 User not found: {}\r\n", address).as_bytes(),
                )
                .await?;
                return Ok(());
            }
        } else if !self.relay_mode {
            reply(transport, b"550 Invalid User\r\n").await?;
            return Ok(());
        }

        info!("RCPT TO: {}", address);
        self.recipients.push(address);
        self.state = SmtpState::RcptTo;
        reply(transport, b"250 Mail OK\r\n").await?;
        Ok(())
    }

    async fn handle_data(&mut self, transport: &mut Transport) -> Result<()> {
        if self.state != SmtpState::RcptTo || self.from.is_none() || self.recipients.is_empty() {
            reply(transport, b"503 bad sequence of commands\r\n").await?;
            return Ok(());
        }

        reply(transport, b"354 End data with <CR><LF>.<CR><LF>\r\n").await?;

        if self.relay_mode {
            self.receive_relay(transport).await?;
        } else {
            self.receive_deliver(transport).await?;
        }

        self.from = None;
        self.recipients.clear();
        self.relay_mode = false;
        self.state = SmtpState::Greeted;
        Ok(())
    }

    /// Deliver mode: stage one cache file per declared recipient, inject
    /// the synthetic Date/Sender headers at the header/body boundary, then
    /// commit every staged file. A write failure discards everything and
    /// reports a transient disk-full condition; the session goes on.
    async fn receive_deliver(&mut self, transport: &mut Transport) -> Result<()> {
        let sender = self.from.clone().unwrap_or_default();

        let mut dests = Vec::new();
        let mut staged = Vec::new();
        let mut failed = false;
        for recipient in &self.recipients {
            match self.store.new_message_path(recipient).await {
                Ok(dest) => dests.push(dest),
                Err(e) => {
                    warn!("staging failed for {}: {}", recipient, e);
                    failed = true;
                    break;
                }
            }
        }
        if !failed {
            for _ in &self.recipients {
                match StagedFile::create(self.store.new_cache_path()).await {
                    Ok(file) => staged.push(file),
                    Err(e) => {
                        warn!("staging failed: {}", e);
                        failed = true;
                        break;
                    }
                }
            }
        }

        let mut in_headers = true;
        loop {
            let Some(line) = read_line(transport).await? else {
                return Err(MailError::SmtpProtocol(
                    "connection closed during DATA".to_string(),
                ));
            };
            if line == b".\r\n" {
                break;
            }
            if failed {
                continue;
            }
            if in_headers && line == b"\r\n" {
                in_headers = false;
                let stamp = format!(
                    "Date: {}\r\nSender: {}\r\n\r\n",
                    Utc::now().to_rfc2822(),
                    sender
                );
                for file in &mut staged {
                    if file.write_all(stamp.as_bytes()).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                continue;
            }
            for file in &mut staged {
                if file.write_all(&line).await.is_err() {
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            // Staged files are removed when dropped
            reply(transport, DISK_FULL_REPLY).await?;
            return Ok(());
        }

        for (file, dest) in staged.into_iter().zip(dests) {
            if file.commit(&dest).await.is_err() {
                failed = true;
            }
        }
        if failed {
            reply(transport, DISK_FULL_REPLY).await?;
        } else {
            info!("message delivered to {} recipient(s)", self.recipients.len());
            reply(transport, b"250 Mail OK\r\n").await?;
        }
        Ok(())
    }

    /// Relay mode: buffer into one shared cache file, accumulating the DKIM
    /// header list and rolling body hash when signing is enabled. The
    /// client gets its 250 as soon as the terminator arrives; remote
    /// delivery happens on the relay worker.
    async fn receive_relay(&mut self, transport: &mut Transport) -> Result<()> {
        let sender = self.from.clone().unwrap_or_default();

        let mut staged = match StagedFile::create(self.store.new_cache_path()).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("staging failed: {}", e);
                None
            }
        };
        let mut failed = staged.is_none();

        let dkim_enabled = self.signer.is_some();
        let mut body_hash = BodyHasher::new();
        let mut raw_headers: Vec<String> = Vec::new();
        let mut in_headers = true;

        loop {
            let Some(line) = read_line(transport).await? else {
                return Err(MailError::SmtpProtocol(
                    "connection closed during DATA".to_string(),
                ));
            };
            if line == b".\r\n" {
                break;
            }
            if in_headers && line == b"\r\n" {
                in_headers = false;
                if !failed {
                    if let Some(file) = staged.as_mut() {
                        if file.write_all(b"\r\n").await.is_err() {
                            failed = true;
                        }
                    }
                }
                continue;
            }
            if dkim_enabled {
                if in_headers {
                    let text = String::from_utf8_lossy(&line)
                        .trim_end_matches("\r\n")
                        .to_string();
                    // Folded continuation lines belong to the previous header
                    if matches!(line.first(), Some(&b' ') | Some(&b'\t')) {
                        match raw_headers.last_mut() {
                            Some(last) => last.push_str(&text),
                            None => raw_headers.push(text),
                        }
                    } else {
                        raw_headers.push(text);
                    }
                } else {
                    body_hash.update_line(&line);
                }
            }
            if !failed {
                if let Some(file) = staged.as_mut() {
                    if file.write_all(&line).await.is_err() {
                        failed = true;
                    }
                }
            }
        }

        let Some(staged) = staged.filter(|_| !failed) else {
            reply(transport, DISK_FULL_REPLY).await?;
            return Ok(());
        };

        let dkim_header = if let Some(signer) = &self.signer {
            let mut names = Vec::new();
            let mut kept = Vec::new();
            for header in &raw_headers {
                if let Some((name, _)) = header.split_once(':') {
                    names.push(name.trim().to_lowercase());
                    kept.push(header.clone());
                }
            }
            let canonicalized = canonicalize_header_list(&kept);
            match signer.sign(&canonicalized, &names, &body_hash.finish_base64()) {
                Ok(header) => Some(header),
                Err(e) => {
                    warn!("DKIM signing failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        // Acknowledge before remote delivery; the relay worker takes over
        reply(transport, b"250 Mail OK\r\n").await?;

        let job = RelayJob {
            sender,
            recipients: self.recipients.clone(),
            cache_path: staged.keep(),
            dkim_header,
        };
        if let Err(e) = self.relay_tx.send(job) {
            warn!("relay worker unavailable, dropping message");
            let _ = tokio::fs::remove_file(&e.0.cache_path).await;
        }
        Ok(())
    }
}
