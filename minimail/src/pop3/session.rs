//! POP3 session
//!
//! Line-oriented list/fetch/delete over the same transport, framer,
//! storage and auth contracts the SMTP side uses. The mailbox enumeration
//! is snapshotted at login; ordinals stay valid for the whole session.
//! Deletions are marked with DELE and applied at QUIT.

use crate::config::Config;
use crate::error::Result;
use crate::framer::read_line;
use crate::security::auth::AuthStore;
use crate::storage::{MailStore, MessageInfo};
use crate::transport::Transport;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

pub struct Pop3Session {
    config: Arc<Config>,
    store: Arc<MailStore>,
    auth: AuthStore,
    starttls: Option<TlsAcceptor>,
    username: Option<String>,
    verified: bool,
    messages: Vec<MessageInfo>,
    pending_delete: Vec<PathBuf>,
}

async fn reply(transport: &mut Transport, message: &[u8]) -> Result<()> {
    transport.write_all(message).await?;
    transport.flush().await?;
    Ok(())
}

impl Pop3Session {
    pub fn new(
        config: Arc<Config>,
        store: Arc<MailStore>,
        auth: AuthStore,
        starttls: Option<TlsAcceptor>,
    ) -> Self {
        Self {
            config,
            store,
            auth,
            starttls,
            username: None,
            verified: false,
            messages: Vec::new(),
            pending_delete: Vec::new(),
        }
    }

    pub async fn handle(mut self, mut transport: Transport) -> Result<()> {
        reply(
            &mut transport,
            format!(
                "+OK Welcome to {} pop3 server ({})\r\n",
                crate::SERVER_NAME,
                self.config.general.server_address
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
            let mut parts = trimmed.split(' ');
            let command = parts.next().unwrap_or("").to_lowercase();
            let args: Vec<&str> = parts.collect();

            match command.as_str() {
                "capa" => {
                    let mut response = String::from(
                        "+OK Capability list follows\r\nUSER\r\nPASS\r\nSTAT\r\nLIST\r\nUIDL\r\nRETR\r\nDELE\r\nRSET\r\n",
                    );
                    if self.starttls.is_some() {
                        response.push_str("STLS\r\n");
                    }
                    response.push_str(".\r\n");
                    reply(&mut transport, response.as_bytes()).await?;
                }
                "stls" => {
                    if self.starttls.is_none() {
                        reply(&mut transport, b"-ERR Unknown command\r\n").await?;
                        continue;
                    }
                    if self.verified {
                        reply(&mut transport, b"-ERR Have authenticated\r\n").await?;
                        continue;
                    }
                    if transport.is_secure() {
                        reply(&mut transport, b"-ERR Command not permitted when TLS active\r\n")
                            .await?;
                        continue;
                    }
                    let Some(acceptor) = self.starttls.clone() else {
                        continue;
                    };
                    reply(&mut transport, b"+OK Begin TLS negotiation\r\n").await?;
                    transport.upgrade_accept(&acceptor).await?;
                    info!("STLS upgrade completed");
                }
                "user" => {
                    if self.verified {
                        reply(&mut transport, b"-ERR Have authenticated\r\n").await?;
                        continue;
                    }
                    if args.is_empty() {
                        reply(&mut transport, b"-ERR Wrong syntax\r\n").await?;
                        continue;
                    }
                    self.username = Some(args.join(" "));
                    reply(
                        &mut transport,
                        format!("+OK {}\r\n", crate::SERVER_NAME).as_bytes(),
                    )
                    .await?;
                }
                "pass" => {
                    if self.verified {
                        reply(&mut transport, b"-ERR Have authenticated\r\n").await?;
                        continue;
                    }
                    if args.is_empty() {
                        reply(&mut transport, b"-ERR Wrong syntax\r\n").await?;
                        continue;
                    }
                    let Some(username) = self.username.clone() else {
                        reply(&mut transport, b"-ERR Haven't set user yet\r\n").await?;
                        continue;
                    };
                    let password = args.join(" ");
                    if !self.auth.verify_credentials(&username, &password).await {
                        self.username = None;
                        reply(&mut transport, b"-ERR Unable to log on\r\n").await?;
                        continue;
                    }

                    let addresses = self.auth.addresses_for_user(&username).await;
                    match self.store.list_messages_for(&addresses).await {
                        Ok(messages) => {
                            info!("pop3 login for {}", username);
                            self.verified = true;
                            let total: u64 = messages.iter().map(|m| m.size).sum();
                            let count = messages.len();
                            self.messages = messages;
                            reply(
                                &mut transport,
                                format!("+OK {} message(s) [{} byte(s)]\r\n", count, total)
                                    .as_bytes(),
                            )
                            .await?;
                        }
                        Err(e) => {
                            reply(&mut transport, format!("-ERR {}\r\n", e).as_bytes()).await?;
                        }
                    }
                }
                "stat" => {
                    if !self.require_auth(&mut transport).await? {
                        continue;
                    }
                    let total: u64 = self.messages.iter().map(|m| m.size).sum();
                    reply(
                        &mut transport,
                        format!(
                            "+OK {} message(s) [{} byte(s)]\r\n",
                            self.messages.len(),
                            total
                        )
                        .as_bytes(),
                    )
                    .await?;
                }
                "list" => {
                    if !self.require_auth(&mut transport).await? {
                        continue;
                    }
                    match self.lookup(&args, &mut transport).await? {
                        Lookup::All => {
                            let total: u64 = self.messages.iter().map(|m| m.size).sum();
                            let mut response =
                                format!("+OK {} {}\r\n", self.messages.len(), total);
                            for message in &self.messages {
                                response
                                    .push_str(&format!("{} {}\r\n", message.ordinal, message.size));
                            }
                            response.push_str(".\r\n");
                            reply(&mut transport, response.as_bytes()).await?;
                        }
                        Lookup::One(index) => {
                            let message = &self.messages[index];
                            reply(
                                &mut transport,
                                format!("+OK {} {}\r\n", message.ordinal, message.size).as_bytes(),
                            )
                            .await?;
                        }
                        Lookup::Invalid => {}
                    }
                }
                "uidl" => {
                    if !self.require_auth(&mut transport).await? {
                        continue;
                    }
                    match self.lookup(&args, &mut transport).await? {
                        Lookup::All => {
                            let total: u64 = self.messages.iter().map(|m| m.size).sum();
                            let mut response =
                                format!("+OK {} {}\r\n", self.messages.len(), total);
                            for message in &self.messages {
                                response.push_str(&format!(
                                    "{} {}\r\n",
                                    message.ordinal, message.unique_id
                                ));
                            }
                            response.push_str(".\r\n");
                            reply(&mut transport, response.as_bytes()).await?;
                        }
                        Lookup::One(index) => {
                            let message = &self.messages[index];
                            reply(
                                &mut transport,
                                format!("+OK {} {}\r\n", message.ordinal, message.unique_id)
                                    .as_bytes(),
                            )
                            .await?;
                        }
                        Lookup::Invalid => {}
                    }
                }
                "retr" => {
                    if !self.require_auth(&mut transport).await? {
                        continue;
                    }
                    let Lookup::One(index) = self.lookup_required(&args, &mut transport).await?
                    else {
                        continue;
                    };
                    let message = self.messages[index].clone();
                    self.send_message(&message, &mut transport).await?;
                }
                "dele" => {
                    if !self.require_auth(&mut transport).await? {
                        continue;
                    }
                    let Lookup::One(index) = self.lookup_required(&args, &mut transport).await?
                    else {
                        continue;
                    };
                    self.pending_delete.push(self.messages[index].path.clone());
                    reply(
                        &mut transport,
                        format!("+OK {}\r\n", crate::SERVER_NAME).as_bytes(),
                    )
                    .await?;
                }
                "rset" => {
                    if !self.require_auth(&mut transport).await? {
                        continue;
                    }
                    self.pending_delete.clear();
                    reply(
                        &mut transport,
                        format!("+OK {}\r\n", crate::SERVER_NAME).as_bytes(),
                    )
                    .await?;
                }
                "quit" => {
                    for path in &self.pending_delete {
                        let _ = self.store.delete_message(path).await;
                    }
                    reply(
                        &mut transport,
                        format!("+OK {}\r\n", crate::SERVER_NAME).as_bytes(),
                    )
                    .await?;
                    let _ = transport.shutdown().await;
                    return Ok(());
                }
                _ => {
                    reply(&mut transport, b"-ERR Unknown command\r\n").await?;
                }
            }
        }
    }

    async fn require_auth(&mut self, transport: &mut Transport) -> Result<bool> {
        if self.verified {
            return Ok(true);
        }
        reply(transport, b"-ERR Haven't authenticated\r\n").await?;
        Ok(false)
    }

    /// Resolve an optional ordinal argument against the login snapshot.
    async fn lookup(&self, args: &[&str], transport: &mut Transport) -> Result<Lookup> {
        if args.is_empty() {
            return Ok(Lookup::All);
        }
        self.lookup_required(args, transport).await
    }

    async fn lookup_required(&self, args: &[&str], transport: &mut Transport) -> Result<Lookup> {
        let parsed = args.first().and_then(|s| s.parse::<usize>().ok());
        match parsed {
            Some(number) if number >= 1 && number <= self.messages.len() => {
                Ok(Lookup::One(number - 1))
            }
            _ => {
                reply(transport, b"-ERR Unknown message\r\n").await?;
                Ok(Lookup::Invalid)
            }
        }
    }

    async fn send_message(
        &self,
        message: &MessageInfo,
        transport: &mut Transport,
    ) -> Result<()> {
        let mut file = match tokio::fs::File::open(&message.path).await {
            Ok(file) => file,
            Err(_) => {
                reply(transport, b"-ERR Unknown message\r\n").await?;
                return Ok(());
            }
        };

        reply(
            transport,
            format!("+OK {} octets\r\n", message.size).as_bytes(),
        )
        .await?;
        loop {
            match read_line(&mut file).await {
                Ok(Some(line)) => transport.write_all(&line).await?,
                Ok(None) => {
                    reply(transport, b".\r\n").await?;
                    return Ok(());
                }
                Err(_) => {
                    reply(transport, b"-ERR Unknown message\r\n").await?;
                    return Ok(());
                }
            }
        }
    }
}

enum Lookup {
    All,
    One(usize),
    Invalid,
}
