//! DNS lookups for the outbound relay

use crate::error::{MailError, Result};
use tracing::debug;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Resolve the mail exchanges for a domain, sorted by ascending preference.
pub async fn lookup_mx(domain: &str) -> Result<Vec<String>> {
    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

    let lookup = resolver
        .mx_lookup(domain)
        .await
        .map_err(|e| MailError::DnsLookup(format!("cannot lookup MX records for {}: {}", domain, e)))?;

    let mut records: Vec<(u16, String)> = lookup
        .iter()
        .map(|mx| {
            (
                mx.preference(),
                mx.exchange().to_string().trim_end_matches('.').to_string(),
            )
        })
        .collect();
    records.sort_by_key(|(preference, _)| *preference);

    if records.is_empty() {
        return Err(MailError::DnsLookup(format!("no MX records for {}", domain)));
    }

    debug!("{} MX record(s) for {}", records.len(), domain);
    Ok(records.into_iter().map(|(_, host)| host).collect())
}
