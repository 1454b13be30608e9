//! The remote audit collector: a JSON-over-HTTP sink for session, request
//! and transfer records. When a collector is configured the bastion keeps
//! only the terminal recording on local disk.

use chrono::{Local, SecondsFormat};
use serde::Serialize;

/// Error talking to the collector. Callers treat any of these as an audit
/// write failure, which tears the session down.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// Transport-level failure or non-2xx response.
    #[error("audit collector request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Serialize)]
struct Record<'a> {
    timestamp: String,
    logger: &'a str,
    user: &'a str,
    ip: &'a str,
    message: &'a str,
}

/// A handle for pushing one session's records to the collector endpoint.
#[derive(Debug, Clone)]
pub struct Collector {
    url: String,
    user: String,
    ip: String,
    client: reqwest::Client,
}

impl Collector {
    /// A collector handle stamping every record with `user` and `ip`.
    pub fn new(url: &str, user: &str, ip: &str) -> Self {
        Collector {
            url: url.to_string(),
            user: user.to_string(),
            ip: ip.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// POST one record. `logger` is one of `daemon`, `session`, `request`
    /// or `data_transfer`.
    pub async fn send(&self, logger: &str, message: &str) -> Result<(), CollectorError> {
        let record = Record {
            timestamp: Local::now().to_rfc3339_opts(SecondsFormat::Nanos, false),
            logger,
            user: &self.user,
            ip: &self.ip,
            message,
        };
        self.client
            .post(&self.url)
            .json(&record)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Load-time reachability check: a plain GET against the collector URL.
/// A failure here fails startup, so a misconfigured collector is caught
/// before the first session rather than on its first audit record.
pub async fn probe(url: &str) -> Result<(), CollectorError> {
    reqwest::Client::new().get(url).send().await?;
    Ok(())
}
