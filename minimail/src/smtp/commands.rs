use crate::error::{MailError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    Auth(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Starttls,
    Quit,
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(MailError::SmtpProtocol("empty command".to_string()));
        }

        let parts: Vec<&str> = line.splitn(2, ' ').collect();
        let command = parts[0].to_uppercase();
        let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

        match command.as_str() {
            "HELO" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("HELO requires a host name".to_string()));
                }
                Ok(SmtpCommand::Helo(args.to_string()))
            }
            "EHLO" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("EHLO requires a host name".to_string()));
                }
                Ok(SmtpCommand::Ehlo(args.to_string()))
            }
            "AUTH" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("AUTH requires a mechanism".to_string()));
                }
                Ok(SmtpCommand::Auth(args.to_uppercase()))
            }
            "MAIL" => Ok(SmtpCommand::MailFrom(Self::parse_path(args, "FROM:")?)),
            "RCPT" => Ok(SmtpCommand::RcptTo(Self::parse_path(args, "TO:")?)),
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "NOOP" => Ok(SmtpCommand::Noop),
            "STARTTLS" => Ok(SmtpCommand::Starttls),
            "QUIT" => Ok(SmtpCommand::Quit),
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    /// Parse `FROM:<addr>` / `TO:<addr>`; the angle brackets are optional.
    fn parse_path(args: &str, keyword: &str) -> Result<String> {
        if !args.to_uppercase().starts_with(keyword) {
            return Err(MailError::SmtpProtocol(format!(
                "expected {}<address>",
                keyword
            )));
        }

        let address = args[keyword.len()..].trim();
        let address = if address.starts_with('<') && address.ends_with('>') && address.len() >= 2 {
            &address[1..address.len() - 1]
        } else {
            address
        };

        Ok(address.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_helo() {
        let cmd = SmtpCommand::parse("HELO example.com").unwrap();
        assert_eq!(cmd, SmtpCommand::Helo("example.com".to_string()));
    }

    #[test]
    fn parse_ehlo_case_insensitive() {
        let cmd = SmtpCommand::parse("ehlo example.com").unwrap();
        assert_eq!(cmd, SmtpCommand::Ehlo("example.com".to_string()));
    }

    #[test]
    fn parse_mail_from() {
        let cmd = SmtpCommand::parse("MAIL FROM:<sender@example.com>").unwrap();
        assert_eq!(cmd, SmtpCommand::MailFrom("sender@example.com".to_string()));
    }

    #[test]
    fn parse_mail_from_without_brackets() {
        let cmd = SmtpCommand::parse("mail from: sender@example.com").unwrap();
        assert_eq!(cmd, SmtpCommand::MailFrom("sender@example.com".to_string()));
    }

    #[test]
    fn parse_rcpt_to() {
        let cmd = SmtpCommand::parse("RCPT TO:<recipient@example.com>").unwrap();
        assert_eq!(cmd, SmtpCommand::RcptTo("recipient@example.com".to_string()));
    }

    #[test]
    fn parse_auth_login() {
        let cmd = SmtpCommand::parse("AUTH login").unwrap();
        assert_eq!(cmd, SmtpCommand::Auth("LOGIN".to_string()));
    }

    #[test]
    fn parse_starttls() {
        assert_eq!(SmtpCommand::parse("STARTTLS").unwrap(), SmtpCommand::Starttls);
    }

    #[test]
    fn mail_without_keyword_is_an_error() {
        assert!(SmtpCommand::parse("MAIL sender@example.com").is_err());
    }

    #[test]
    fn unknown_command_passes_through() {
        assert_eq!(
            SmtpCommand::parse("VRFY someone").unwrap(),
            SmtpCommand::Unknown("VRFY".to_string())
        );
    }
}
