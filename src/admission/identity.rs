//! Client identity resolution.
//!
//! Every admission decision uses three related identifiers:
//! - the *full fingerprint* (`fp:<challenge>:<hash>` or an IP literal),
//!   used as the idempotency member for sliding windows;
//! - the *stable identifier* (the trailing hash, or the IP), used as the
//!   bucket key so rotating challenges cannot evade limits;
//! - the *IP*, extracted from a trusted header chain, used for progressive
//!   bans only (a ban must survive fingerprint changes).

use std::net::IpAddr;

use axum::http::HeaderMap;

/// Resolved identifier triple for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// `X-Fingerprint` value when present, else the client IP.
    pub full_fingerprint: String,
    /// Bucket key: the hash tail of a fingerprint, or the IP.
    pub stable_id: String,
    /// Client IP (`"unknown"` when nothing validates).
    pub ip: String,
    /// Challenge id embedded in the fingerprint, when well-formed.
    pub challenge_id: Option<String>,
}

/// Validate an IP string (IPv4 or IPv6).
fn is_valid_ip(s: &str) -> bool {
    s.trim().parse::<IpAddr>().is_ok()
}

/// Extract the client IP with spoofing protection.
///
/// Priority: `CF-Connecting-IP` (always trusted when present and valid) →
/// `X-Forwarded-For` leftmost entry (only when `trust_x_forwarded_for`) →
/// the transport remote address. Anything that fails to parse as an IP is
/// skipped; `"unknown"` is the last resort.
pub fn extract_ip(
    headers: &HeaderMap,
    remote_addr: Option<IpAddr>,
    trust_x_forwarded_for: bool,
) -> String {
    if let Some(cf) = header_str(headers, "cf-connecting-ip") {
        let cf = cf.trim();
        if is_valid_ip(cf) {
            return cf.to_string();
        }
    }

    if trust_x_forwarded_for {
        if let Some(xff) = header_str(headers, "x-forwarded-for") {
            // Leftmost entry is the original client.
            if let Some(first) = xff.split(',').next() {
                let first = first.trim();
                if is_valid_ip(first) {
                    return first.to_string();
                }
            }
        }
    }

    if let Some(addr) = remote_addr {
        return addr.to_string();
    }
    "unknown".to_string()
}

/// Split a fingerprint into `(challenge_id, stable_id)`.
///
/// Only values starting with `fp:` are split; IPv6 literals also contain
/// colons and must pass through untouched. The challenge id is returned only
/// for the exact `fp:<challenge>:<hash>` shape with both parts non-empty.
pub fn split_fingerprint(fingerprint: &str) -> (Option<String>, String) {
    if !fingerprint.starts_with("fp:") {
        return (None, fingerprint.to_string());
    }
    let parts: Vec<&str> = fingerprint.split(':').collect();
    let stable = parts.last().copied().unwrap_or(fingerprint).to_string();
    if parts.len() == 3 && !parts[1].is_empty() && !parts[2].is_empty() {
        (Some(parts[1].to_string()), stable)
    } else {
        (None, stable)
    }
}

/// Resolve the identifier triple for a request.
pub fn resolve(
    headers: &HeaderMap,
    remote_addr: Option<IpAddr>,
    trust_x_forwarded_for: bool,
) -> ClientIdentity {
    let ip = extract_ip(headers, remote_addr, trust_x_forwarded_for);
    match header_str(headers, "x-fingerprint") {
        Some(fp) if !fp.trim().is_empty() => {
            let fp = fp.trim().to_string();
            let (challenge_id, stable_id) = split_fingerprint(&fp);
            ClientIdentity {
                full_fingerprint: fp,
                stable_id,
                ip,
                challenge_id,
            }
        }
        _ => ClientIdentity {
            full_fingerprint: ip.clone(),
            stable_id: ip.clone(),
            ip,
            challenge_id: None,
        },
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    // -- IP extraction ------------------------------------------------------

    #[test]
    fn test_cf_connecting_ip_always_trusted() {
        let h = headers(&[
            ("cf-connecting-ip", "203.0.113.9"),
            ("x-forwarded-for", "10.0.0.1"),
        ]);
        assert_eq!(extract_ip(&h, None, true), "203.0.113.9");
    }

    #[test]
    fn test_xff_ignored_without_trust_flag() {
        // IP-source trust invariant: with the flag off, XFF never wins.
        let h = headers(&[("x-forwarded-for", "10.0.0.1")]);
        let remote: IpAddr = "192.0.2.7".parse().unwrap();
        assert_eq!(extract_ip(&h, Some(remote), false), "192.0.2.7");
        assert_eq!(extract_ip(&h, None, false), "unknown");
    }

    #[test]
    fn test_xff_leftmost_when_trusted() {
        let h = headers(&[("x-forwarded-for", "198.51.100.4, 10.0.0.1, 10.0.0.2")]);
        assert_eq!(extract_ip(&h, None, true), "198.51.100.4");
    }

    #[test]
    fn test_invalid_xff_falls_through() {
        let h = headers(&[("x-forwarded-for", "not-an-ip")]);
        let remote: IpAddr = "192.0.2.7".parse().unwrap();
        assert_eq!(extract_ip(&h, Some(remote), true), "192.0.2.7");
    }

    #[test]
    fn test_invalid_cf_header_falls_through() {
        let h = headers(&[("cf-connecting-ip", "garbage")]);
        assert_eq!(extract_ip(&h, None, false), "unknown");
    }

    #[test]
    fn test_ipv6_remote_addr() {
        let remote: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(extract_ip(&HeaderMap::new(), Some(remote), false), "2001:db8::1");
    }

    // -- Fingerprint splitting ----------------------------------------------

    #[test]
    fn test_split_well_formed_fingerprint() {
        let (challenge, stable) = split_fingerprint("fp:abc123:userhash");
        assert_eq!(challenge.as_deref(), Some("abc123"));
        assert_eq!(stable, "userhash");
    }

    #[test]
    fn test_split_ipv6_is_not_a_fingerprint() {
        let (challenge, stable) = split_fingerprint("2001:db8::1");
        assert!(challenge.is_none());
        assert_eq!(stable, "2001:db8::1", "IPv6 literals never get split");
    }

    #[test]
    fn test_split_fingerprint_without_challenge() {
        let (challenge, stable) = split_fingerprint("fp::hash");
        assert!(challenge.is_none());
        assert_eq!(stable, "hash");
    }

    #[test]
    fn test_split_bare_hash() {
        let (challenge, stable) = split_fingerprint("justahash");
        assert!(challenge.is_none());
        assert_eq!(stable, "justahash");
    }

    // -- Triple resolution --------------------------------------------------

    #[test]
    fn test_resolve_with_fingerprint_header() {
        let h = headers(&[
            ("x-fingerprint", "fp:c1:stable9"),
            ("cf-connecting-ip", "203.0.113.9"),
        ]);
        let id = resolve(&h, None, false);
        assert_eq!(id.full_fingerprint, "fp:c1:stable9");
        assert_eq!(id.stable_id, "stable9");
        assert_eq!(id.ip, "203.0.113.9");
        assert_eq!(id.challenge_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_resolve_without_fingerprint_uses_ip_everywhere() {
        let remote: IpAddr = "192.0.2.7".parse().unwrap();
        let id = resolve(&HeaderMap::new(), Some(remote), false);
        assert_eq!(id.full_fingerprint, "192.0.2.7");
        assert_eq!(id.stable_id, "192.0.2.7");
        assert_eq!(id.ip, "192.0.2.7");
        assert!(id.challenge_id.is_none());
    }
}
