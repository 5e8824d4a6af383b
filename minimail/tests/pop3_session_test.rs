//! POP3 session tests over real sockets

use minimail::config::{
    AuthConfig, Config, GeneralConfig, ListenerConfig, OutboundConfig, SmtpConfig,
};
use minimail::pop3::Pop3Session;
use minimail::security::auth::AuthStore;
use minimail::storage::MailStore;
use minimail::transport::Transport;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

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
            outbound: OutboundConfig {
                remote_connect_retry_times: 1,
                remote_connect_timeout_ms: 200,
                enable_dkim: false,
                dkim_private_key_pem_path: String::new(),
                dkim_domain: String::new(),
                dkim_selector: String::new(),
            },
        },
        pop3: disabled_listener(),
        auth: AuthConfig {
            database_url: format!(
                "sqlite://{}?mode=rwc",
                tmp.path().join("auth.db").to_string_lossy()
            ),
        },
    }
}

struct Harness {
    config: Arc<Config>,
    store: Arc<MailStore>,
    auth: AuthStore,
    _tmp: TempDir,
}

/// Account "bob" owns two mailboxes holding three messages with staggered
/// timestamps, so the merged ordering is exercised.
async fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = Arc::new(test_config(&tmp));
    let store = Arc::new(MailStore::new(
        config.general.mail_storage_path.as_str(),
        config.general.cache_path.as_str(),
    ));
    store.init().await.unwrap();

    let auth = AuthStore::connect(&config.auth.database_url).await.unwrap();
    auth.add_user("bob", "bob@example.com", "secret").await.unwrap();
    auth.add_address("bob", "postmaster@example.com").await.unwrap();

    let bob = store.mailbox_dir("bob@example.com").await.unwrap();
    let postmaster = store.mailbox_dir("postmaster@example.com").await.unwrap();
    tokio::fs::write(bob.join("100-first"), b"Subject: one\r\n\r\noldest\r\n")
        .await
        .unwrap();
    tokio::fs::write(
        postmaster.join("200-second"),
        b"Subject: two\r\n\r\nmiddle\r\n",
    )
    .await
    .unwrap();
    tokio::fs::write(bob.join("300-third"), b"Subject: three\r\n\r\nnewest\r\n")
        .await
        .unwrap();

    Harness {
        config,
        store,
        auth,
        _tmp: tmp,
    }
}

async fn start_session(h: &Harness) -> BufReader<TcpStream> {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let session = Pop3Session::new(h.config.clone(), h.store.clone(), h.auth.clone(), None);
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let _ = session.handle(Transport::plain(socket)).await;
    });

    let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
    let greeting = recv(&mut client).await;
    assert!(greeting.starts_with("+OK Welcome"), "{}", greeting);
    client
}

async fn send(client: &mut BufReader<TcpStream>, line: &str) {
    client
        .get_mut()
        .write_all(format!("{}\r\n", line).as_bytes())
        .await
        .unwrap();
    client.get_mut().flush().await.unwrap();
}

async fn recv(client: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    client.read_line(&mut line).await.unwrap();
    line
}

/// Read multi-line payload up to the lone-dot terminator.
async fn recv_until_dot(client: &mut BufReader<TcpStream>) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let line = recv(client).await;
        if line == ".\r\n" {
            return lines;
        }
        lines.push(line.trim_end().to_string());
    }
}

async fn login(client: &mut BufReader<TcpStream>) -> String {
    send(client, "USER bob").await;
    assert!(recv(client).await.starts_with("+OK"));
    send(client, "PASS secret").await;
    recv(client).await
}

#[tokio::test]
async fn login_reports_totals_across_addresses() {
    let h = harness().await;
    let mut client = start_session(&h).await;

    let reply = login(&mut client).await;
    assert!(reply.starts_with("+OK 3 message(s)"), "{}", reply);

    send(&mut client, "STAT").await;
    assert!(recv(&mut client).await.starts_with("+OK 3 message(s)"));
}

#[tokio::test]
async fn commands_require_authentication() {
    let h = harness().await;
    let mut client = start_session(&h).await;

    for command in ["STAT", "LIST", "UIDL", "RETR 1", "DELE 1"] {
        send(&mut client, command).await;
        assert!(
            recv(&mut client).await.starts_with("-ERR"),
            "{} should require auth",
            command
        );
    }
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let h = harness().await;
    let mut client = start_session(&h).await;

    send(&mut client, "USER bob").await;
    recv(&mut client).await;
    send(&mut client, "PASS nope").await;
    assert_eq!(recv(&mut client).await, "-ERR Unable to log on\r\n");

    // The username was forgotten with the failed attempt
    send(&mut client, "PASS secret").await;
    assert_eq!(recv(&mut client).await, "-ERR Haven't set user yet\r\n");
}

#[tokio::test]
async fn list_and_uidl_follow_timestamp_order() {
    let h = harness().await;
    let mut client = start_session(&h).await;
    login(&mut client).await;

    send(&mut client, "LIST").await;
    let header = recv(&mut client).await;
    assert!(header.starts_with("+OK 3 "), "{}", header);
    let listing = recv_until_dot(&mut client).await;
    assert_eq!(listing.len(), 3);
    assert!(listing[0].starts_with("1 "));
    assert!(listing[2].starts_with("3 "));

    send(&mut client, "UIDL").await;
    recv(&mut client).await;
    let uidl = recv_until_dot(&mut client).await;
    assert_eq!(
        uidl,
        vec!["1 first", "2 second", "3 third"],
        "merged listing must interleave mailboxes by timestamp"
    );

    send(&mut client, "LIST 2").await;
    let one = recv(&mut client).await;
    assert!(one.starts_with("+OK 2 "), "{}", one);

    send(&mut client, "LIST 4").await;
    assert_eq!(recv(&mut client).await, "-ERR Unknown message\r\n");
    send(&mut client, "LIST 0").await;
    assert_eq!(recv(&mut client).await, "-ERR Unknown message\r\n");
}

#[tokio::test]
async fn retr_streams_the_stored_message() {
    let h = harness().await;
    let mut client = start_session(&h).await;
    login(&mut client).await;

    send(&mut client, "RETR 1").await;
    let header = recv(&mut client).await;
    assert!(header.starts_with("+OK "), "{}", header);
    assert!(header.ends_with(" octets\r\n"));
    let content = recv_until_dot(&mut client).await;
    assert_eq!(content, vec!["Subject: one", "", "oldest"]);

    send(&mut client, "RETR 99").await;
    assert_eq!(recv(&mut client).await, "-ERR Unknown message\r\n");
}

#[tokio::test]
async fn dele_applies_at_quit_and_rset_clears() {
    let h = harness().await;
    let mut client = start_session(&h).await;
    login(&mut client).await;

    // Marked then unmarked: nothing is deleted
    send(&mut client, "DELE 1").await;
    assert!(recv(&mut client).await.starts_with("+OK"));
    send(&mut client, "RSET").await;
    assert!(recv(&mut client).await.starts_with("+OK"));

    send(&mut client, "DELE 2").await;
    assert!(recv(&mut client).await.starts_with("+OK"));

    // Still present until QUIT commits the marks
    assert_eq!(
        h.store
            .list_messages_for(&[
                "bob@example.com".to_string(),
                "postmaster@example.com".to_string()
            ])
            .await
            .unwrap()
            .len(),
        3
    );

    send(&mut client, "QUIT").await;
    assert!(recv(&mut client).await.starts_with("+OK"));

    // Ordinal 2 was the postmaster message
    for _ in 0..50 {
        if h.store
            .list_messages("postmaster@example.com")
            .await
            .unwrap()
            .is_empty()
        {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(h
        .store
        .list_messages("postmaster@example.com")
        .await
        .unwrap()
        .is_empty());
    assert_eq!(h.store.list_messages("bob@example.com").await.unwrap().len(), 2);
}

#[tokio::test]
async fn capa_lists_commands() {
    let h = harness().await;
    let mut client = start_session(&h).await;

    send(&mut client, "CAPA").await;
    let header = recv(&mut client).await;
    assert!(header.starts_with("+OK"));
    let caps = recv_until_dot(&mut client).await;
    assert!(caps.contains(&"UIDL".to_string()));
    assert!(!caps.contains(&"STLS".to_string()), "no STLS without certs");
}

#[tokio::test]
async fn unknown_command_is_an_error() {
    let h = harness().await;
    let mut client = start_session(&h).await;

    send(&mut client, "XYZZY").await;
    assert_eq!(recv(&mut client).await, "-ERR Unknown command\r\n");
}
