use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

use crate::models::node::Address;

/// Parse a textual address into an [`Address`]. Accepts `host:port`,
/// bracketed IPv6 `[::1]:9735`, bare IPv6 literals, `.onion` names, and bare
/// hosts (which get `default_port`).
pub fn parse_address(s: &str, default_port: u16) -> Result<Address> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty address");
    }

    if let Some(rest) = s.strip_prefix('[') {
        let (host, port) = rest
            .split_once(']')
            .context("unterminated '[' in address")?;
        let port = match port.strip_prefix(':') {
            Some(p) => p.parse::<u16>().context("invalid port")?,
            None if port.is_empty() => default_port,
            None => bail!("unexpected characters after ']'"),
        };
        if host.is_empty() {
            bail!("empty host");
        }
        return Ok(Address::new(host, port));
    }

    match s.matches(':').count() {
        0 => Ok(Address::new(s, default_port)),
        1 => {
            let (host, port) = s.split_once(':').unwrap();
            if host.is_empty() {
                bail!("empty host");
            }
            let port = port.parse::<u16>().context("invalid port")?;
            Ok(Address::new(host, port))
        }
        // An unbracketed IPv6 literal.
        _ => Ok(Address::new(s, default_port)),
    }
}

/// Order addresses most-recently-connected first; never-connected last.
pub fn sort_by_last_connected(addresses: &mut [Address]) {
    addresses.sort_by(|a, b| b.last_connected.cmp(&a.last_connected));
}

/// Remove duplicate addresses (by host and port), keeping the first
/// occurrence.
pub fn dedupe(addresses: Vec<Address>) -> Vec<Address> {
    let mut seen: Vec<Address> = Vec::with_capacity(addresses.len());
    for address in addresses {
        if !seen.contains(&address) {
            seen.push(address);
        }
    }
    seen
}

/// Whether `address` is one of our own advertised addresses.
pub fn is_own_address(address: &Address, advertised: &[Address]) -> bool {
    advertised.contains(address)
}
