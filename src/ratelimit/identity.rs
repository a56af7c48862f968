//! Client keys and caller identification.

use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use axum::http::{Extensions, HeaderMap, HeaderName, Request};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tracing::trace;

use crate::config::ServerConfig;
use crate::error::GatekeeperError;

const USER_PREFIX: &str = "user:";
const IP_PREFIX: &str = "ip:";
const UNKNOWN: &str = "unknown";

/// A stable key identifying the caller a counter belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientKey {
    /// An authenticated principal
    User(String),
    /// A network origin address
    Ip(IpAddr),
    /// No identifiable origin; all such callers share one bucket
    Unknown,
}

impl ClientKey {
    /// The embedded user id, if this key identifies a principal.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            ClientKey::User(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientKey::User(id) => write!(f, "{}{}", USER_PREFIX, id),
            ClientKey::Ip(ip) => write!(f, "{}{}", IP_PREFIX, ip),
            ClientKey::Unknown => write!(f, "{}{}", IP_PREFIX, UNKNOWN),
        }
    }
}

impl FromStr for ClientKey {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(id) = s.strip_prefix(USER_PREFIX) {
            if id.trim().is_empty() {
                return Err(GatekeeperError::InvalidClientKey(s.to_string()));
            }
            return Ok(ClientKey::User(id.to_string()));
        }
        if let Some(addr) = s.strip_prefix(IP_PREFIX) {
            if addr == UNKNOWN {
                return Ok(ClientKey::Unknown);
            }
            return normalize_addr(addr)
                .map(ClientKey::Ip)
                .ok_or_else(|| GatekeeperError::InvalidClientKey(s.to_string()));
        }
        Err(GatekeeperError::InvalidClientKey(s.to_string()))
    }
}

/// The key of one counter: a client within one operation class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    pub client: ClientKey,
    pub class: String,
}

impl CompositeKey {
    pub fn new(client: ClientKey, class: impl Into<String>) -> Self {
        Self {
            client,
            class: class.into(),
        }
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.client, self.class)
    }
}

/// Derives client keys from requests.
#[derive(Debug, Clone)]
pub struct ClientIdentifier {
    trust_forwarded: bool,
    forwarded_header: HeaderName,
    trusted_proxies: Vec<IpAddr>,
}

impl Default for ClientIdentifier {
    fn default() -> Self {
        Self {
            trust_forwarded: true,
            forwarded_header: HeaderName::from_static("x-forwarded-for"),
            trusted_proxies: Vec::new(),
        }
    }
}

impl ClientIdentifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an identifier from server configuration.
    ///
    /// An invalid header name falls back to `x-forwarded-for`.
    pub fn from_config(config: &ServerConfig) -> Self {
        let forwarded_header = HeaderName::from_str(&config.forwarded_header)
            .unwrap_or_else(|_| HeaderName::from_static("x-forwarded-for"));
        Self {
            trust_forwarded: config.trust_forwarded_headers,
            forwarded_header,
            trusted_proxies: config.trusted_proxies.clone(),
        }
    }

    /// Never trust forwarded headers; identify by peer address only.
    pub fn without_forwarded_headers(mut self) -> Self {
        self.trust_forwarded = false;
        self
    }

    /// Only honour forwarded headers set by these peers.
    pub fn with_trusted_proxies(mut self, proxies: Vec<IpAddr>) -> Self {
        self.trusted_proxies = proxies;
        self
    }

    /// Derive the client key for a caller.
    pub fn identify(
        &self,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        user_id: Option<&str>,
    ) -> ClientKey {
        if let Some(id) = user_id.map(str::trim).filter(|id| !id.is_empty()) {
            return ClientKey::User(id.to_string());
        }

        let peer_ip = peer.map(|addr| canonical(addr.ip()));

        if self.forwarded_trusted_from(peer_ip) {
            if let Some(ip) = self.leftmost_forwarded(headers) {
                trace!(client_ip = %ip, "Identified client from forwarded header");
                return ClientKey::Ip(ip);
            }
        }

        match peer_ip {
            Some(ip) => ClientKey::Ip(ip),
            None => ClientKey::Unknown,
        }
    }

    /// Derive the client key for an axum request, reading the peer from `ConnectInfo`.
    pub fn identify_request<B>(&self, request: &Request<B>, user_id: Option<&str>) -> ClientKey {
        self.identify(request.headers(), peer_addr(request.extensions()), user_id)
    }

    /// Same as [`identify_request`](Self::identify_request) for a request split into parts.
    pub fn identify_parts(&self, parts: &Parts, user_id: Option<&str>) -> ClientKey {
        self.identify(&parts.headers, peer_addr(&parts.extensions), user_id)
    }

    fn forwarded_trusted_from(&self, peer: Option<IpAddr>) -> bool {
        if !self.trust_forwarded {
            return false;
        }
        if self.trusted_proxies.is_empty() {
            return true;
        }
        peer.is_some_and(|ip| self.trusted_proxies.contains(&ip))
    }

    fn leftmost_forwarded(&self, headers: &HeaderMap) -> Option<IpAddr> {
        headers
            .get(&self.forwarded_header)?
            .to_str()
            .ok()?
            .split(',')
            .next()
            .and_then(normalize_addr)
    }
}

fn peer_addr(extensions: &Extensions) -> Option<SocketAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Parse an address as it appears in a header: trims whitespace and strips any port.
fn normalize_addr(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(canonical(ip));
    }
    raw.parse::<SocketAddr>().ok().map(|addr| canonical(addr.ip()))
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::HeaderValue;

    fn headers(xff: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_str(xff).unwrap());
        headers
    }

    fn peer(addr: &str) -> Option<SocketAddr> {
        Some(addr.parse().unwrap())
    }

    #[test]
    fn test_user_id_wins() {
        let identifier = ClientIdentifier::new();
        let key = identifier.identify(&headers("1.2.3.4"), peer("10.0.0.1:80"), Some("42"));
        assert_eq!(key, ClientKey::User("42".to_string()));
        assert_eq!(key.to_string(), "user:42");
    }

    #[test]
    fn test_blank_user_id_is_anonymous() {
        let identifier = ClientIdentifier::new();
        let key = identifier.identify(&HeaderMap::new(), peer("10.0.0.1:80"), Some("  "));
        assert_eq!(key.to_string(), "ip:10.0.0.1");
    }

    #[test]
    fn test_leftmost_forwarded_entry() {
        let identifier = ClientIdentifier::new();
        let key = identifier.identify(
            &headers("203.0.113.7, 10.1.1.1, 10.2.2.2"),
            peer("10.2.2.2:443"),
            None,
        );
        assert_eq!(key.to_string(), "ip:203.0.113.7");
    }

    #[test]
    fn test_forwarded_entry_with_port() {
        let identifier = ClientIdentifier::new();
        let key = identifier.identify(&headers("198.51.100.2:5123"), None, None);
        assert_eq!(key.to_string(), "ip:198.51.100.2");

        let key = identifier.identify(&headers("[2001:db8::1]:443"), None, None);
        assert_eq!(key.to_string(), "ip:2001:db8::1");
    }

    #[test]
    fn test_garbage_forwarded_falls_back_to_peer() {
        let identifier = ClientIdentifier::new();
        let key = identifier.identify(&headers("not-an-ip"), peer("192.0.2.9:1000"), None);
        assert_eq!(key.to_string(), "ip:192.0.2.9");
    }

    #[test]
    fn test_unknown_when_nothing_available() {
        let identifier = ClientIdentifier::new();
        let key = identifier.identify(&HeaderMap::new(), None, None);
        assert_eq!(key, ClientKey::Unknown);
        assert_eq!(key.to_string(), "ip:unknown");
    }

    #[test]
    fn test_ipv4_mapped_peer_is_normalized() {
        let identifier = ClientIdentifier::new();
        let key = identifier.identify(&HeaderMap::new(), peer("[::ffff:10.0.0.1]:8080"), None);
        assert_eq!(key.to_string(), "ip:10.0.0.1");
    }

    #[test]
    fn test_untrusted_forwarded_header_ignored() {
        let identifier = ClientIdentifier::new().without_forwarded_headers();
        let key = identifier.identify(&headers("203.0.113.7"), peer("10.0.0.5:80"), None);
        assert_eq!(key.to_string(), "ip:10.0.0.5");
    }

    #[test]
    fn test_trusted_proxies() {
        let proxy: IpAddr = "10.0.0.1".parse().unwrap();
        let identifier = ClientIdentifier::new().with_trusted_proxies(vec![proxy]);

        let via_proxy = identifier.identify(&headers("203.0.113.7"), peer("10.0.0.1:80"), None);
        assert_eq!(via_proxy.to_string(), "ip:203.0.113.7");

        let direct = identifier.identify(&headers("203.0.113.7"), peer("10.9.9.9:80"), None);
        assert_eq!(direct.to_string(), "ip:10.9.9.9");
    }

    #[test]
    fn test_identify_request_uses_connect_info() {
        let identifier = ClientIdentifier::new();
        let mut request = Request::builder().uri("/").body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("172.16.0.3:9999".parse().unwrap()));

        let key = identifier.identify_request(&request, None);
        assert_eq!(key.to_string(), "ip:172.16.0.3");
    }

    #[test]
    fn test_client_key_round_trip_from_str() {
        for raw in ["user:abc", "ip:10.0.0.1", "ip:unknown", "ip:2001:db8::1"] {
            let key: ClientKey = raw.parse().unwrap();
            assert_eq!(key.to_string(), raw);
        }
        assert!("10.0.0.1".parse::<ClientKey>().is_err());
        assert!("ip:nope".parse::<ClientKey>().is_err());
        assert!("user:".parse::<ClientKey>().is_err());
    }

    #[test]
    fn test_composite_key_display() {
        let key = CompositeKey::new(ClientKey::User("7".into()), "write");
        assert_eq!(key.to_string(), "user:7|write");
    }
}
