use crate::error::{MailError, Result};

/// Basic email validation
pub fn validate_email(email: &str) -> Result<()> {
    if email.is_empty() {
        return Err(MailError::InvalidEmail("email is empty".to_string()));
    }

    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 {
        return Err(MailError::InvalidEmail("invalid email format".to_string()));
    }

    if parts[0].is_empty() || parts[1].is_empty() {
        return Err(MailError::InvalidEmail(
            "email parts cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Domain part of an address, if any.
pub fn domain_of(address: &str) -> Option<&str> {
    address.rsplit_once('@').map(|(_, domain)| domain)
}
