//! C6 — URL validator. Rejects non-HTTPS, private, and metadata endpoints for provider base
//! URLs. Grounded on the teacher's SSRF deny-list (`tools/http_client.rs::is_ssrf_ip`), extended
//! with the IPv6 ULA range and applied both at the request boundary and again by each provider
//! adapter before a network call.

use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRejection(pub String);

impl std::fmt::Display for UrlRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `Validate(url) → ok | reject(reason)`.
pub fn validate(url: &str) -> Result<(), UrlRejection> {
    if url.is_empty() {
        return Err(UrlRejection("url is empty".to_string()));
    }

    let (scheme, rest) = match url.split_once("://") {
        Some(parts) => parts,
        None => return Err(UrlRejection("url has no recognizable scheme".to_string())),
    };

    let authority = rest.split('/').next().unwrap_or("");
    let authority = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    let host = if let Some(bracketed) = authority.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or("")
    } else {
        authority.split(':').next().unwrap_or(authority)
    };
    if host.is_empty() {
        return Err(UrlRejection("url has no host".to_string()));
    }

    let is_localhost = host == "localhost" || host == "127.0.0.1" || host == "::1";

    match scheme {
        "https" => {}
        "http" if is_localhost => {}
        "http" => {
            return Err(UrlRejection(
                "http scheme is only permitted for localhost/127.0.0.1/::1".to_string(),
            ))
        }
        other => return Err(UrlRejection(format!("unsupported scheme '{}'", other))),
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_blocked_ip(ip) {
            return Err(UrlRejection(format!(
                "host resolves to a disallowed address range: {}",
                ip
            )));
        }
    }

    if host == "169.254.169.254" {
        return Err(UrlRejection("metadata endpoint is not permitted".to_string()));
    }

    Ok(())
}

/// `true` for literal IPv4 private ranges (10/8, 172.16/12, 192.168/16) and IPv6 ULA
/// (`fc00::/7`), matching §4.6 exactly. The validator does not itself resolve hostnames; see
/// the design notes' accepted DNS-rebinding residual risk.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            if o[0] == 10 {
                return true;
            }
            if o[0] == 172 && (16..=31).contains(&o[1]) {
                return true;
            }
            if o[0] == 192 && o[1] == 168 {
                return true;
            }
            if o[0] == 169 && o[1] == 254 {
                return true;
            }
            if o[0] == 127 {
                return true;
            }
            false
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return true;
            }
            // fc00::/7 — unique local addresses
            let segments = v6.segments();
            (segments[0] & 0xfe00) == 0xfc00
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty() {
        assert!(validate("").is_err());
    }

    #[test]
    fn accepts_https() {
        assert!(validate("https://api.openai.com/v1").is_ok());
    }

    #[test]
    fn rejects_plain_http_for_non_localhost() {
        assert!(validate("http://api.openai.com/v1").is_err());
    }

    #[test]
    fn accepts_http_for_localhost() {
        assert!(validate("http://127.0.0.1:11434/api").is_ok());
        assert!(validate("http://localhost:11434/api").is_ok());
    }

    #[test]
    fn rejects_private_v4_ranges() {
        assert!(validate("https://10.1.2.3/").is_err());
        assert!(validate("https://172.16.0.1/").is_err());
        assert!(validate("https://172.31.255.255/").is_err());
        assert!(validate("https://192.168.1.1/").is_err());
    }

    #[test]
    fn rejects_metadata_address() {
        assert!(validate("https://169.254.169.254/latest/meta-data").is_err());
    }

    #[test]
    fn rejects_ipv6_ula() {
        assert!(validate("https://[fc00::1]/").is_err());
        assert!(validate("https://[fd12:3456::1]/").is_err());
    }

    #[test]
    fn rejects_unrecognized_scheme() {
        assert!(validate("ftp://example.com/").is_err());
        assert!(validate("not-a-url").is_err());
    }

    #[test]
    fn is_blocked_ip_boundaries() {
        assert!(!is_blocked_ip("172.15.255.255".parse().unwrap()));
        assert!(is_blocked_ip("172.16.0.0".parse().unwrap()));
        assert!(is_blocked_ip("172.31.255.255".parse().unwrap()));
        assert!(!is_blocked_ip("172.32.0.0".parse().unwrap()));
    }
}
