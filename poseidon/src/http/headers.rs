use std::fmt::Write as _;

/// An ordered multimap of header fields. Lookup is case-insensitive;
/// insertion order is preserved on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    fields: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Replaces every occurrence of `name` with a single field.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.fields.push((name.to_string(), value.into()));
    }

    /// The first field with this name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether a comma-separated header field contains `token`
    /// (case-insensitively), e.g. `Connection: keep-alive, upgrade`.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|part| part.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn encode_into(&self, out: &mut String) {
        for (name, value) in &self.fields {
            let _ = write!(out, "{}: {}\r\n", name, value);
        }
    }
}

/// The request line and header block of an HTTP/1.1 request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeaders {
    pub method: String,
    pub uri: String,
    pub headers: HeaderMap,
}

impl RequestHeaders {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Serialises the request head, including the final empty line.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(128);
        let _ = write!(out, "{} {} HTTP/1.1\r\n", self.method, self.uri);
        self.headers.encode_into(&mut out);
        out.push_str("\r\n");
        out
    }
}

/// The status line and header block of an HTTP/1.1 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeaders {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

impl Default for ResponseHeaders {
    fn default() -> Self {
        Self::new(200)
    }
}

impl ResponseHeaders {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: super::reason_phrase(status).to_string(),
            headers: HeaderMap::new(),
        }
    }

    /// Serialises the response head, including the final empty line.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(128);
        let _ = write!(out, "HTTP/1.1 {} {}\r\n", self.status, self.reason);
        self.headers.encode_into(&mut out);
        out.push_str("\r\n");
        out
    }

    /// Whether a response with this status carries no body at all.
    pub fn body_forbidden(&self) -> bool {
        matches!(self.status, 100..=199 | 204 | 304)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.push("Content-Type", "text/html");
        assert_eq!(headers.get("content-type"), Some("text/html"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));
        assert!(!headers.contains("content-length"));
    }

    #[test]
    fn test_set_replaces_all_occurrences() {
        let mut headers = HeaderMap::new();
        headers.push("X-Tag", "one");
        headers.push("x-tag", "two");
        headers.set("X-Tag", "three");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-tag"), Some("three"));
    }

    #[test]
    fn test_token_membership() {
        let mut headers = HeaderMap::new();
        headers.push("Connection", "keep-alive, Upgrade");
        assert!(headers.contains_token("connection", "upgrade"));
        assert!(headers.contains_token("connection", "keep-alive"));
        assert!(!headers.contains_token("connection", "close"));
    }

    #[test]
    fn test_request_encoding() {
        let mut req = RequestHeaders::new("GET", "/");
        req.headers.push("Host", "www.example.org");
        req.headers.push("Connection", "close");
        assert_eq!(
            req.encode(),
            "GET / HTTP/1.1\r\nHost: www.example.org\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn test_response_encoding() {
        let mut resp = ResponseHeaders::new(404);
        resp.headers.push("Content-Length", "0");
        assert_eq!(
            resp.encode(),
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n"
        );
    }
}
