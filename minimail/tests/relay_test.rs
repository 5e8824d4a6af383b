//! Outbound relay tests against a scripted fake exchange

use minimail::config::{
    AuthConfig, Config, GeneralConfig, ListenerConfig, OutboundConfig, SmtpConfig,
};
use minimail::smtp::relay::{self, RelayJob, RelayWorker};
use minimail::storage::MailStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

fn disabled_listener() -> ListenerConfig {
    ListenerConfig {
        enable_plain: false,
        plain_listen_addr: String::new(),
        plain_enable_starttls: false,
        starttls_cert_path: String::new(),
        starttls_key_path: String::new(),
        enable_tls: false,
        tls_listen_addr: String::new(),
        tls_cert_path: String::new(),
        tls_key_path: String::new(),
    }
}

fn outbound() -> OutboundConfig {
    OutboundConfig {
        remote_connect_retry_times: 1,
        remote_connect_timeout_ms: 500,
        enable_dkim: false,
        dkim_private_key_pem_path: String::new(),
        dkim_domain: String::new(),
        dkim_selector: String::new(),
    }
}

fn test_config(tmp: &TempDir) -> Config {
    Config {
        general: GeneralConfig {
            server_address: "mx.example.com".to_string(),
            mail_domain: "example.com".to_string(),
            mail_storage_path: tmp.path().join("mail").to_string_lossy().to_string(),
            cache_path: tmp.path().join("cache").to_string_lossy().to_string(),
        },
        smtp: SmtpConfig {
            inbound: disabled_listener(),
            outbound: outbound(),
        },
        pop3: disabled_listener(),
        auth: AuthConfig {
            database_url: "sqlite::memory:".to_string(),
        },
    }
}

async fn test_store(tmp: &TempDir) -> Arc<MailStore> {
    let store = Arc::new(MailStore::new(tmp.path().join("mail"), tmp.path().join("cache")));
    store.init().await.unwrap();
    store
}

/// A one-connection fake exchange that accepts everything and records the
/// commands and body it received.
async fn fake_exchange() -> (String, JoinHandle<(Vec<String>, Vec<String>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(socket);
        let mut commands = Vec::new();
        let mut body = Vec::new();

        reader
            .get_mut()
            .write_all(b"220 fake.test ESMTP\r\n")
            .await
            .unwrap();

        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let trimmed = line.trim_end().to_string();
            let verb = trimmed
                .split(' ')
                .next()
                .unwrap_or("")
                .to_uppercase();
            commands.push(trimmed.clone());
            match verb.as_str() {
                "EHLO" => {
                    reader
                        .get_mut()
                        .write_all(b"250-fake.test\r\n250 8BITMIME\r\n")
                        .await
                        .unwrap();
                }
                "MAIL" | "RCPT" => {
                    reader.get_mut().write_all(b"250 OK\r\n").await.unwrap();
                }
                "DATA" => {
                    reader.get_mut().write_all(b"354 go ahead\r\n").await.unwrap();
                    loop {
                        let mut data_line = String::new();
                        if reader.read_line(&mut data_line).await.unwrap() == 0 {
                            break;
                        }
                        if data_line == ".\r\n" {
                            break;
                        }
                        body.push(data_line.trim_end().to_string());
                    }
                    reader.get_mut().write_all(b"250 OK\r\n").await.unwrap();
                }
                "QUIT" => {
                    reader.get_mut().write_all(b"221 Bye\r\n").await.unwrap();
                    break;
                }
                _ => {
                    reader.get_mut().write_all(b"250 OK\r\n").await.unwrap();
                }
            }
        }
        (commands, body)
    });

    (addr, handle)
}

#[tokio::test]
async fn handshake_streams_and_quits() {
    let (addr, handle) = fake_exchange().await;

    let mut transport = relay::connect_exchange(
        &[addr],
        &outbound(),
        "mx.example.com",
        "alice@example.com",
        &[
            "bob@fake.test".to_string(),
            "carol@fake.test".to_string(),
        ],
    )
    .await
    .unwrap();

    transport
        .write_all(b"Subject: outbound\r\n\r\nrelayed body\r\n")
        .await
        .unwrap();
    relay::end_body(&mut transport).await.unwrap();

    let (commands, body) = handle.await.unwrap();
    assert!(commands.contains(&"EHLO mx.example.com".to_string()));
    assert!(commands.contains(&"MAIL FROM:<alice@example.com>".to_string()));
    assert!(commands.contains(&"RCPT TO:<bob@fake.test>".to_string()));
    assert!(commands.contains(&"RCPT TO:<carol@fake.test>".to_string()));
    assert!(commands.contains(&"QUIT".to_string()));
    assert_eq!(body, vec!["Subject: outbound", "", "relayed body"]);
}

#[tokio::test]
async fn unreachable_exchange_fails_after_retries() {
    // Port 1 refuses connections; every exchange in the list is tried
    let result = relay::connect_exchange(
        &["127.0.0.1:1".to_string()],
        &outbound(),
        "mx.example.com",
        "alice@example.com",
        &["bob@fake.test".to_string()],
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn internal_recipients_bypass_the_network() {
    let tmp = TempDir::new().unwrap();
    let config = Arc::new(test_config(&tmp));
    let store = test_store(&tmp).await;

    let cache_path = store.new_cache_path();
    tokio::fs::write(&cache_path, b"Subject: internal\r\n\r\nlocal copy\r\n")
        .await
        .unwrap();

    let job = RelayJob {
        sender: "alice@example.com".to_string(),
        recipients: vec![
            "alice@example.com".to_string(),
            "carol@example.com".to_string(),
        ],
        cache_path: cache_path.clone(),
        dkim_header: None,
    };
    relay::deliver(config, store.clone(), job).await;

    for mailbox in ["alice@example.com", "carol@example.com"] {
        let messages = store.list_messages(mailbox).await.unwrap();
        assert_eq!(messages.len(), 1, "{} should have the copy", mailbox);
        let content = std::fs::read_to_string(&messages[0].path).unwrap();
        assert!(content.contains("local copy"));
    }

    // The shared cache file is gone regardless of outcome
    assert!(!cache_path.exists());
}

#[tokio::test]
async fn unresolvable_domain_produces_a_bounce() {
    let tmp = TempDir::new().unwrap();
    let config = Arc::new(test_config(&tmp));
    let store = test_store(&tmp).await;

    let cache_path = store.new_cache_path();
    tokio::fs::write(&cache_path, b"Subject: doomed\r\n\r\nwill not arrive\r\n")
        .await
        .unwrap();

    let job = RelayJob {
        sender: "alice@example.com".to_string(),
        recipients: vec!["someone@no-such-mail-domain.invalid".to_string()],
        cache_path: cache_path.clone(),
        dkim_header: None,
    };
    relay::deliver(config, store.clone(), job).await;

    let messages = store.list_messages("alice@example.com").await.unwrap();
    assert_eq!(messages.len(), 1, "bounce should land in sender's mailbox");
    let bounce = std::fs::read_to_string(&messages[0].path).unwrap();
    assert!(bounce.contains("Subject: Mail can't be delivered\r\n"));
    assert!(bounce.contains("To: alice@example.com\r\n"));
    assert!(bounce.contains("no-such-mail-domain.invalid: "));
    assert!(!cache_path.exists());
}

#[tokio::test]
async fn partial_failure_bounces_only_the_failed_domain() {
    // One internal copy succeeds while the remote domain fails; the bounce
    // names only the failed domain and the sender is never blocked
    let tmp = TempDir::new().unwrap();
    let config = Arc::new(test_config(&tmp));
    let store = test_store(&tmp).await;

    let cache_path = store.new_cache_path();
    tokio::fs::write(&cache_path, b"Subject: mixed\r\n\r\nbody\r\n")
        .await
        .unwrap();

    let job = RelayJob {
        sender: "alice@example.com".to_string(),
        recipients: vec![
            "carol@example.com".to_string(),
            "someone@no-such-mail-domain.invalid".to_string(),
        ],
        cache_path,
        dkim_header: None,
    };
    relay::deliver(config, store.clone(), job).await;

    let delivered = store.list_messages("carol@example.com").await.unwrap();
    assert_eq!(delivered.len(), 1);

    let sender_box = store.list_messages("alice@example.com").await.unwrap();
    assert_eq!(sender_box.len(), 1);
    let bounce = std::fs::read_to_string(&sender_box[0].path).unwrap();
    assert!(bounce.contains("no-such-mail-domain.invalid"));
    assert!(!bounce.contains("example.com:"), "local domain did not fail");
}

#[tokio::test]
async fn worker_consumes_queued_jobs() {
    let tmp = TempDir::new().unwrap();
    let config = Arc::new(test_config(&tmp));
    let store = test_store(&tmp).await;

    let (worker, tx) = RelayWorker::new(config, store.clone());
    tokio::spawn(worker.run());

    let cache_path = store.new_cache_path();
    tokio::fs::write(&cache_path, b"Subject: queued\r\n\r\nvia worker\r\n")
        .await
        .unwrap();
    tx.send(RelayJob {
        sender: "alice@example.com".to_string(),
        recipients: vec!["carol@example.com".to_string()],
        cache_path,
        dkim_header: None,
    })
    .unwrap();

    // The worker runs the delivery in the background
    for _ in 0..50 {
        if !store
            .list_messages("carol@example.com")
            .await
            .unwrap()
            .is_empty()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let messages = store.list_messages("carol@example.com").await.unwrap();
    assert_eq!(messages.len(), 1);
    let content = std::fs::read_to_string(&messages[0].path).unwrap();
    assert!(content.contains("via worker"));
}
