use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line too long")]
    LineTooLong,

    #[error("SMTP protocol error: {0}")]
    SmtpProtocol(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("DNS lookup failed: {0}")]
    DnsLookup(String),

    #[error("invalid email address: {0}")]
    InvalidEmail(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("signing error: {0}")]
    Signing(String),
}

pub type Result<T> = std::result::Result<T, MailError>;
