//! Account store
//!
//! SQLite table of (username, mail address, password hash) rows; an account
//! owning several addresses has one row per address. Passwords are hashed
//! with Argon2. All lookup queries fail closed: a database error reads as
//! authentication failure or address-not-found.

use crate::error::{MailError, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sqlx::SqlitePool;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AuthStore {
    db: SqlitePool,
}

impl AuthStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let db = SqlitePool::connect(database_url).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                username TEXT NOT NULL,
                mail_address TEXT NOT NULL,
                password_hash TEXT NOT NULL
            )
            "#,
        )
        .execute(&db)
        .await?;

        Ok(Self { db })
    }

    /// Check a username/password pair. Any of the account's rows verifying
    /// is enough.
    pub async fn verify_credentials(&self, username: &str, password: &str) -> bool {
        let hashes: Vec<String> = match sqlx::query_scalar(
            "SELECT password_hash FROM accounts WHERE username = ?",
        )
        .bind(username)
        .fetch_all(&self.db)
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("auth database query failure: {}", e);
                return false;
            }
        };

        hashes.iter().any(|hash| verify_password(password, hash))
    }

    /// All mail addresses owned by an account.
    pub async fn addresses_for_user(&self, username: &str) -> Vec<String> {
        match sqlx::query_scalar("SELECT mail_address FROM accounts WHERE username = ?")
            .bind(username)
            .fetch_all(&self.db)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("auth database query failure: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn user_owns_address(&self, username: &str, address: &str) -> bool {
        match sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM accounts WHERE username = ? AND mail_address = ?",
        )
        .bind(username)
        .bind(address)
        .fetch_one(&self.db)
        .await
        {
            Ok(count) => count > 0,
            Err(e) => {
                warn!("auth database query failure: {}", e);
                false
            }
        }
    }

    pub async fn address_exists(&self, address: &str) -> bool {
        match sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM accounts WHERE mail_address = ?",
        )
        .bind(address)
        .fetch_one(&self.db)
        .await
        {
            Ok(count) => count > 0,
            Err(e) => {
                warn!("auth database query failure: {}", e);
                false
            }
        }
    }

    pub async fn add_user(&self, username: &str, address: &str, password: &str) -> Result<()> {
        let hash = hash_password(password)?;
        sqlx::query(
            "INSERT INTO accounts (username, mail_address, password_hash) VALUES (?, ?, ?)",
        )
        .bind(username)
        .bind(address)
        .bind(&hash)
        .execute(&self.db)
        .await?;
        info!("added user {} with address {}", username, address);
        Ok(())
    }

    pub async fn delete_user(&self, username: &str) -> Result<()> {
        sqlx::query("DELETE FROM accounts WHERE username = ?")
            .bind(username)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Attach another address to an existing account, reusing its password
    /// hash.
    pub async fn add_address(&self, username: &str, address: &str) -> Result<()> {
        let hash: Option<String> = sqlx::query_scalar(
            "SELECT password_hash FROM accounts WHERE username = ? LIMIT 1",
        )
        .bind(username)
        .fetch_optional(&self.db)
        .await?;
        let Some(hash) = hash else {
            return Err(MailError::Config(format!("user {} does not exist", username)));
        };

        sqlx::query(
            "INSERT INTO accounts (username, mail_address, password_hash) VALUES (?, ?, ?)",
        )
        .bind(username)
        .bind(address)
        .bind(&hash)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn delete_address(&self, username: &str, address: &str) -> Result<()> {
        sqlx::query("DELETE FROM accounts WHERE username = ? AND mail_address = ?")
            .bind(username)
            .bind(address)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| MailError::Config(format!("hash password: {}", e)))
}

fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Decode one base64 line of an AUTH LOGIN exchange.
pub fn decode_login_credential(credential: &str) -> Result<String> {
    let decoded = BASE64
        .decode(credential.trim())
        .map_err(|e| MailError::SmtpProtocol(format!("invalid base64: {}", e)))?;
    String::from_utf8(decoded).map_err(|e| MailError::SmtpProtocol(format!("invalid UTF-8: {}", e)))
}
