//! Guard against outbound fetches aimed at internal networks.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use reqwest::Url;

use crate::error::ServerError;

pub fn is_forbidden_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_unspecified()
        || ip.is_multicast()
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xc0) == 64)
}

pub fn is_forbidden_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_forbidden_ipv4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (first == 0x2001 && ip.segments()[1] == 0x0db8)
}

pub fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_forbidden_ipv4(v4),
        IpAddr::V6(v6) => is_forbidden_ipv6(v6),
    }
}

#[derive(Clone)]
pub struct SsrfGuard {
    resolver: TokioAsyncResolver,
    allow_private: bool,
}

impl SsrfGuard {
    pub fn new(allow_private: bool) -> Self {
        if allow_private {
            tracing::warn!("private-address fetch guard disabled");
        }
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare_https(), ResolverOpts::default());
        Self {
            resolver,
            allow_private,
        }
    }

    /// Parse `raw` and make sure it points at a public http(s) host.
    pub async fn check_url(&self, raw: &str) -> Result<Url, ServerError> {
        let url = Url::parse(raw).map_err(|e| ServerError::BadRequest(format!("Invalid URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ServerError::Forbidden(format!(
                "Unsupported URL scheme: {}",
                url.scheme()
            )));
        }
        if self.allow_private {
            return Ok(url);
        }

        let host = url
            .host_str()
            .ok_or_else(|| ServerError::BadRequest("URL has no host".to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']');

        if let Ok(ip) = host.parse::<IpAddr>() {
            return if is_forbidden_ip(ip) {
                Err(ServerError::Forbidden("URL targets a private address".to_string()))
            } else {
                Ok(url)
            };
        }

        let lower = host.to_ascii_lowercase();
        if lower == "localhost" || lower.ends_with(".localhost") {
            return Err(ServerError::Forbidden("URL targets a private address".to_string()));
        }

        let lookup = self
            .resolver
            .lookup_ip(lower.as_str())
            .await
            .map_err(|e| ServerError::Network(format!("DNS lookup for {lower} failed: {e}")))?;

        let mut any = false;
        for ip in lookup.iter() {
            any = true;
            if is_forbidden_ip(ip) {
                tracing::warn!(host = %lower, %ip, "blocked fetch to private address");
                return Err(ServerError::Forbidden("URL targets a private address".to_string()));
            }
        }
        if !any {
            return Err(ServerError::Network(format!("{lower} has no addresses")));
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_ranges() {
        for ip in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "169.254.169.254",
            "100.64.0.1",
            "0.0.0.0",
            "224.0.0.1",
            "::1",
            "fc00::1",
            "fe80::1",
            "::ffff:127.0.0.1",
            "2001:db8::1",
        ] {
            assert!(is_forbidden_ip(ip.parse().unwrap()), "{ip} should be forbidden");
        }
    }

    #[test]
    fn test_public_addresses_allowed() {
        for ip in ["93.184.216.34", "1.1.1.1", "100.128.0.1", "2606:4700::1111"] {
            assert!(!is_forbidden_ip(ip.parse().unwrap()), "{ip} should be allowed");
        }
    }

    #[tokio::test]
    async fn test_check_url_rejects_literals_and_schemes() {
        let guard = SsrfGuard::new(false);
        assert!(guard.check_url("http://127.0.0.1/a.png").await.is_err());
        assert!(guard.check_url("http://[::1]:8080/a.png").await.is_err());
        assert!(guard.check_url("http://localhost/a.png").await.is_err());
        assert!(guard.check_url("file:///etc/passwd").await.is_err());
        assert!(guard.check_url("https://93.184.216.34/a.png").await.is_ok());
    }

    #[tokio::test]
    async fn test_allow_private_bypass() {
        let guard = SsrfGuard::new(true);
        assert!(guard.check_url("http://127.0.0.1:9000/a.png").await.is_ok());
        assert!(guard.check_url("ftp://127.0.0.1/a.png").await.is_err());
    }
}
