//! Outbound relay
//!
//! The inbound session enqueues a [`RelayJob`] and returns to its client;
//! the [`RelayWorker`] consumes jobs and runs each delivery in its own
//! task. Within one delivery, recipients are partitioned by destination
//! domain: same-domain recipients become direct mailbox copies, every other
//! domain gets its own MX-resolved connection. Domains fail independently;
//! the failures that remain at the end are aggregated into a bounce message
//! written into the sender's own mailbox.

use crate::config::{Config, OutboundConfig};
use crate::error::{MailError, Result};
use crate::framer::read_line;
use crate::security::tls;
use crate::storage::{MailStore, StagedFile};
use crate::transport::Transport;
use crate::utils::{dns, domain_of};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Upgrade requests attempted against an exchange that advertises STARTTLS
const STARTTLS_ATTEMPTS: usize = 5;

const INTERNAL_COPY_FAILURE: &str =
    "DATA failed: 431 The Recipient's Mail Server Is Experiencing a Disk Full Condition";

/// Everything the relay needs for one message, handed over from the
/// inbound session. The job owns the cache file and is responsible for
/// deleting it.
#[derive(Debug)]
pub struct RelayJob {
    pub sender: String,
    pub recipients: Vec<String>,
    pub cache_path: PathBuf,
    pub dkim_header: Option<String>,
}

/// Long-lived consumer of relay jobs; one delivery task per job.
pub struct RelayWorker {
    config: Arc<Config>,
    store: Arc<MailStore>,
    rx: mpsc::UnboundedReceiver<RelayJob>,
}

impl RelayWorker {
    pub fn new(
        config: Arc<Config>,
        store: Arc<MailStore>,
    ) -> (Self, mpsc::UnboundedSender<RelayJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { config, store, rx }, tx)
    }

    pub async fn run(mut self) {
        info!("relay worker started");
        while let Some(job) = self.rx.recv().await {
            let config = self.config.clone();
            let store = self.store.clone();
            tokio::spawn(async move {
                deliver(config, store, job).await;
            });
        }
    }
}

/// Deliver one staged message to every destination domain, then bounce the
/// failures. The shared cache file is deleted no matter what happened.
pub async fn deliver(config: Arc<Config>, store: Arc<MailStore>, job: RelayJob) {
    let local_domain = config.general.mail_domain.as_str();
    let mut failures: BTreeMap<String, String> = BTreeMap::new();

    let mut remote: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut internal: Vec<String> = Vec::new();
    for address in &job.recipients {
        match domain_of(address) {
            Some(domain) if domain == local_domain => internal.push(address.clone()),
            Some(domain) => remote
                .entry(domain.to_string())
                .or_default()
                .push(address.clone()),
            None => {}
        }
    }

    deliver_internal(&store, local_domain, &internal, &job.cache_path, &mut failures).await;

    let mut connections: Vec<(String, Transport)> = Vec::new();
    for (domain, addresses) in &remote {
        let exchanges = match dns::lookup_mx(domain).await {
            Ok(hosts) => hosts
                .into_iter()
                .map(|host| format!("{}:25", host))
                .collect::<Vec<_>>(),
            Err(e) => {
                failures.insert(domain.clone(), e.to_string());
                continue;
            }
        };
        match connect_exchange(
            &exchanges,
            &config.smtp.outbound,
            &config.general.server_address,
            &job.sender,
            addresses,
        )
        .await
        {
            Ok(transport) => connections.push((domain.clone(), transport)),
            Err(e) => {
                warn!("relay to {} failed: {}", domain, e);
                failures.insert(domain.clone(), e.to_string());
            }
        }
    }

    // The DKIM header goes out ahead of the stored message
    if let Some(header) = &job.dkim_header {
        let mut kept = Vec::new();
        for (domain, mut transport) in connections {
            if transport.write_all(header.as_bytes()).await.is_err() {
                failures.insert(domain, "network error".to_string());
            } else {
                kept.push((domain, transport));
            }
        }
        connections = kept;
    }

    // Stream the cache file line by line to every surviving connection; a
    // failed domain drops out without disturbing the others
    match tokio::fs::File::open(&job.cache_path).await {
        Ok(mut file) => loop {
            let line = match read_line(&mut file).await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("cache read failed: {}", e);
                    break;
                }
            };
            let mut kept = Vec::new();
            for (domain, mut transport) in connections {
                if transport.write_all(&line).await.is_err() {
                    failures.insert(domain, "network error".to_string());
                } else {
                    kept.push((domain, transport));
                }
            }
            connections = kept;
        },
        Err(e) => {
            for (domain, _) in connections.drain(..) {
                failures.insert(domain, format!("cache read failed: {}", e));
            }
        }
    }

    let _ = tokio::fs::remove_file(&job.cache_path).await;

    for (domain, mut transport) in connections {
        if let Err(e) = end_body(&mut transport).await {
            failures.insert(domain, e.to_string());
        } else {
            debug!("relay to {} complete", domain);
        }
    }

    if !failures.is_empty() {
        info!(
            "relay for {} finished with {} failed domain(s)",
            job.sender,
            failures.len()
        );
        write_bounce(&store, &job.sender, &failures).await;
    }
}

/// Same-domain recipients bypass the network: the cache file is duplicated
/// straight into each mailbox. A copy failure fails the local domain and
/// rolls back every copy already staged for this message.
async fn deliver_internal(
    store: &MailStore,
    local_domain: &str,
    recipients: &[String],
    cache_path: &std::path::Path,
    failures: &mut BTreeMap<String, String>,
) {
    if recipients.is_empty() {
        return;
    }

    let mut staged: Vec<(PathBuf, PathBuf)> = Vec::new();
    for address in recipients {
        let copy_path = store.new_cache_path();
        let dest = match store.new_message_path(address).await {
            Ok(dest) => dest,
            Err(_) => {
                failures.insert(local_domain.to_string(), INTERNAL_COPY_FAILURE.to_string());
                for (copy, _) in &staged {
                    let _ = tokio::fs::remove_file(copy).await;
                }
                return;
            }
        };
        if tokio::fs::copy(cache_path, &copy_path).await.is_err() {
            failures.insert(local_domain.to_string(), INTERNAL_COPY_FAILURE.to_string());
            for (copy, _) in &staged {
                let _ = tokio::fs::remove_file(copy).await;
            }
            return;
        }
        staged.push((copy_path, dest));
    }
    for (copy_path, dest) in staged {
        let _ = tokio::fs::rename(&copy_path, &dest).await;
    }
}

async fn read_reply(transport: &mut Transport) -> Result<String> {
    match read_line(transport).await? {
        Some(line) => Ok(String::from_utf8_lossy(&line).to_string()),
        None => Err(MailError::SmtpProtocol(
            "connection closed by remote server".to_string(),
        )),
    }
}

async fn write_line(transport: &mut Transport, line: &str) -> Result<()> {
    debug!("> {}", line);
    transport.write_all(format!("{}\r\n", line).as_bytes()).await?;
    transport.flush().await?;
    Ok(())
}

async fn command(
    transport: &mut Transport,
    line: &str,
    expect: &str,
    label: &str,
) -> Result<String> {
    write_line(transport, line).await?;
    let response = read_reply(transport).await?;
    if !response.starts_with(expect) {
        return Err(MailError::SmtpProtocol(format!(
            "{} failed: {}",
            label,
            response.trim_end()
        )));
    }
    Ok(response)
}

/// Read a (possibly multi-line) EHLO response; reports whether the peer
/// advertises STARTTLS.
async fn read_ehlo(transport: &mut Transport) -> Result<bool> {
    let mut supports_starttls = false;
    loop {
        let response = read_reply(transport).await?;
        if !response.starts_with("250") {
            return Err(MailError::SmtpProtocol(format!(
                "EHLO failed: {}",
                response.trim_end()
            )));
        }
        if response.len() > 4 && response[4..].trim().eq_ignore_ascii_case("STARTTLS") {
            supports_starttls = true;
        }
        if response.as_bytes().get(3) != Some(&b'-') {
            break;
        }
    }
    Ok(supports_starttls)
}

/// Dial a destination domain's exchanges in preference order and run the
/// handshake through DATA: greeting, EHLO, opportunistic STARTTLS, origin
/// and per-recipient acceptance. Returns a connection ready to receive the
/// message body.
pub async fn connect_exchange(
    exchanges: &[String],
    outbound: &OutboundConfig,
    helo_name: &str,
    sender: &str,
    recipients: &[String],
) -> Result<Transport> {
    let dial_timeout = Duration::from_millis(outbound.remote_connect_timeout_ms);

    let mut connected = None;
    'dial: for exchange in exchanges {
        for _ in 0..outbound.remote_connect_retry_times {
            if let Ok(Ok(stream)) =
                timeout(dial_timeout, TcpStream::connect(exchange.as_str())).await
            {
                connected = Some((exchange.clone(), stream));
                break 'dial;
            }
        }
    }
    let Some((exchange, stream)) = connected else {
        return Err(MailError::SmtpProtocol(
            "cannot connect to remote smtp server".to_string(),
        ));
    };
    let mut transport = Transport::plain(stream);

    let greeting = read_reply(&mut transport).await?;
    if !greeting.starts_with("220") {
        return Err(MailError::SmtpProtocol(format!(
            "connect failed: {}",
            greeting.trim_end()
        )));
    }

    write_line(&mut transport, &format!("EHLO {}", helo_name)).await?;
    let supports_starttls = read_ehlo(&mut transport).await?;

    if supports_starttls && !transport.is_secure() {
        let connector = tls::insecure_client_connector();
        for _ in 0..STARTTLS_ATTEMPTS {
            write_line(&mut transport, "STARTTLS").await?;
            let response = read_reply(&mut transport).await?;
            if response.starts_with("454") {
                sleep(Duration::from_millis(10)).await;
                continue;
            }
            if !response.starts_with("220") {
                // Upgrade refused; relay continues in plaintext
                debug!("STARTTLS refused by {}: {}", exchange, response.trim_end());
                break;
            }
            let name = tls::server_name(&exchange)?;
            transport.upgrade_connect(&connector, name).await?;
            write_line(&mut transport, &format!("EHLO {}", helo_name)).await?;
            read_ehlo(&mut transport).await?;
            break;
        }
    }

    command(
        &mut transport,
        &format!("MAIL FROM:<{}>", sender),
        "250",
        "MAIL FROM",
    )
    .await?;
    for address in recipients {
        command(
            &mut transport,
            &format!("RCPT TO:<{}>", address),
            "250",
            "RCPT TO",
        )
        .await?;
    }
    command(&mut transport, "DATA", "354", "DATA").await?;

    Ok(transport)
}

/// Terminate the body, confirm acceptance and quit.
pub async fn end_body(transport: &mut Transport) -> Result<()> {
    transport.write_all(b".\r\n").await?;
    transport.flush().await?;
    let response = read_reply(transport).await?;
    if !response.starts_with("250") {
        return Err(MailError::SmtpProtocol(format!(
            "DATA failed: {}",
            response.trim_end()
        )));
    }

    write_line(transport, "QUIT").await?;
    let response = read_reply(transport).await?;
    if !response.starts_with("221") {
        return Err(MailError::SmtpProtocol(format!(
            "QUIT failed: {}",
            response.trim_end()
        )));
    }

    let _ = transport.shutdown().await;
    Ok(())
}

/// Best-effort bounce into the sender's own mailbox naming every failed
/// domain and its reason.
async fn write_bounce(store: &MailStore, sender: &str, failures: &BTreeMap<String, String>) {
    let Ok(mut staged) = StagedFile::create(store.new_cache_path()).await else {
        return;
    };

    let mut content = format!(
        "Subject: Mail can't be delivered\r\nFrom: {}\r\nTo: {}\r\n\r\n",
        crate::SERVER_NAME,
        sender
    );
    for (domain, reason) in failures {
        content.push_str(&format!("{}: {}\r\n", domain, reason));
    }

    if staged.write_all(content.as_bytes()).await.is_err() {
        return;
    }
    let Ok(dest) = store.new_message_path(sender).await else {
        return;
    };
    let _ = staged.commit(&dest).await;
}
