//! Request-shaped facts that client keys are derived from.

use std::collections::HashMap;
use std::net::IpAddr;

/// Header consulted for the original client address behind proxies.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// What the key resolver may ask about an inbound request.
pub trait RequestFact: Send + Sync {
    /// Address of the directly connected peer.
    fn peer_addr(&self) -> Option<&str>;

    /// Value of a header, matched case-insensitively.
    fn header(&self, name: &str) -> Option<&str>;

    /// Value of an arbitrary request attribute (path parameter, user id, ...).
    fn attribute(&self, name: &str) -> Option<&str>;

    /// Identifier of the matched route, e.g. its template `/orders/{id}`.
    fn route_scope(&self) -> &str;

    /// The originating client address: the first hop of `X-Forwarded-For`
    /// when present, otherwise the peer address.
    fn client_ip(&self) -> Option<&str> {
        self.header(FORWARDED_FOR_HEADER)
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .or_else(|| self.peer_addr().filter(|ip| !ip.is_empty()))
    }
}

/// Plain owned [`RequestFact`] built by the route-binding layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpFact {
    route: String,
    peer_addr: Option<String>,
    headers: HashMap<String, String>,
    attributes: HashMap<String, String>,
}

impl HttpFact {
    /// A fact for a request matched to `route`.
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            ..Self::default()
        }
    }

    pub fn with_peer(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr.to_string());
        self
    }

    pub fn with_peer_str(mut self, addr: impl Into<String>) -> Self {
        self.peer_addr = Some(addr.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

impl RequestFact for HttpFact {
    fn peer_addr(&self) -> Option<&str> {
        self.peer_addr.as_deref()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    fn route_scope(&self) -> &str {
        &self.route
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_case_insensitive() {
        let fact = HttpFact::new("/a").with_header("X-API-KEY", "secret");
        assert_eq!(fact.header("x-api-key"), Some("secret"));
        assert_eq!(fact.header("X-Api-Key"), Some("secret"));
        assert_eq!(fact.header("other"), None);
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let fact = HttpFact::new("/a")
            .with_peer_str("10.0.0.1")
            .with_header("X-Forwarded-For", " 1.2.3.4 , 10.0.0.9");
        assert_eq!(fact.client_ip(), Some("1.2.3.4"));
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        let fact = HttpFact::new("/a")
            .with_peer("10.0.0.1".parse().unwrap())
            .with_header("X-Forwarded-For", "");
        assert_eq!(fact.client_ip(), Some("10.0.0.1"));

        assert_eq!(HttpFact::new("/a").client_ip(), None);
    }
}
