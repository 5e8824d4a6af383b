use anyhow::Context;
use clap::{Parser, Subcommand};
use minimail::config::{Config, EXAMPLE_CONFIG};
use minimail::pop3::Pop3Server;
use minimail::security::auth::AuthStore;
use minimail::smtp::relay::RelayWorker;
use minimail::smtp::server::SmtpServer;
use minimail::storage::MailStore;
use minimail::utils::dkim::DkimSigner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = minimail::SERVER_NAME, about = "Minimal SMTP + POP3 mail server")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "minimail.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the mail server
    Start,
    /// Add a user with an initial mail address
    AddUser {
        username: String,
        address: String,
        password: String,
    },
    /// Delete a user and all of its addresses
    DelUser { username: String },
    /// Attach another mail address to an existing user
    AddAddress { username: String, address: String },
    /// Detach a mail address from a user
    DelAddress { username: String, address: String },
    /// Delete all stored mail for an address
    PurgeMailbox { address: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if !cli.config.exists() {
        let example_path = "./minimail-example.toml";
        std::fs::write(example_path, EXAMPLE_CONFIG)?;
        anyhow::bail!(
            "config file {} not found; example written to {}",
            cli.config.display(),
            example_path
        );
    }
    let mut config = Config::from_file(&cli.config)?;
    config.validate()?;
    let config = Arc::new(config);

    // An unusable account store is fatal at startup
    let auth = AuthStore::connect(&config.auth.database_url)
        .await
        .context("auth database open failure")?;

    match cli.command.unwrap_or(Command::Start) {
        Command::Start => start(config, auth).await,
        Command::AddUser {
            username,
            address,
            password,
        } => {
            auth.add_user(&username, &address, &password).await?;
            println!("Add user successful");
            Ok(())
        }
        Command::DelUser { username } => {
            auth.delete_user(&username).await?;
            println!("Delete user successful");
            Ok(())
        }
        Command::AddAddress { username, address } => {
            auth.add_address(&username, &address).await?;
            println!("Add mail address successful");
            Ok(())
        }
        Command::DelAddress { username, address } => {
            auth.delete_address(&username, &address).await?;
            println!("Delete mail address successful");
            Ok(())
        }
        Command::PurgeMailbox { address } => {
            let mailbox = Path::new(&config.general.mail_storage_path).join(&address);
            match tokio::fs::remove_dir_all(&mailbox).await {
                Ok(()) => println!("Delete mail files successful"),
                Err(e) => println!("Delete mail files failed: {}", e),
            }
            Ok(())
        }
    }
}

async fn start(config: Arc<Config>, auth: AuthStore) -> anyhow::Result<()> {
    info!("starting {}", minimail::SERVER_NAME);

    let store = Arc::new(MailStore::new(
        config.general.mail_storage_path.as_str(),
        config.general.cache_path.as_str(),
    ));
    store.init().await.context("create storage directories")?;

    // A broken DKIM key disables signing for the process, nothing else
    let signer = if config.smtp.outbound.enable_dkim {
        let outbound = &config.smtp.outbound;
        let loaded = std::fs::read_to_string(&outbound.dkim_private_key_pem_path)
            .map_err(|e| minimail::MailError::Config(format!("read DKIM key: {}", e)))
            .and_then(|pem| {
                DkimSigner::from_pem(&outbound.dkim_domain, &outbound.dkim_selector, &pem)
            });
        match loaded {
            Ok(signer) => Some(Arc::new(signer)),
            Err(e) => {
                warn!("smtp DKIM enable failure: {}", e);
                None
            }
        }
    } else {
        None
    };

    let (relay_worker, relay_tx) = RelayWorker::new(config.clone(), store.clone());
    tokio::spawn(relay_worker.run());

    let smtp = Arc::new(SmtpServer::new(
        config.clone(),
        store.clone(),
        auth.clone(),
        signer,
        relay_tx,
    ));
    let pop3 = Arc::new(Pop3Server::new(config.clone(), store.clone(), auth));

    let (smtp_result, pop3_result) = tokio::join!(smtp.run(), pop3.run());
    smtp_result?;
    pop3_result?;
    Ok(())
}
