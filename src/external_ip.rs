use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;

const PROBE_URL: &str = "http://api.ipify.org";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Ask a public echo service for the IP our traffic originates from.
/// Opportunistic: callers log a warning on failure and move on.
pub async fn detect_external_ip() -> Result<Ipv4Addr> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .context("failed to build external ip probe client")?;
    let body = client
        .get(PROBE_URL)
        .send()
        .await
        .context("external ip probe request failed")?
        .text()
        .await
        .context("external ip probe response was unreadable")?;
    body.trim()
        .parse::<Ipv4Addr>()
        .with_context(|| format!("external ip probe returned a non-address: {body:?}"))
}
