//! Protocol message: a string header map plus an opaque body.

use std::collections::HashMap;

/// A single protocol message.
///
/// Requests carry a `cmd` header naming the operation; responses echo `cmd`
/// and carry a `status` header. Bulk payloads (file chunks, directory
/// listings) travel in the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Message {
    /// Creates a body-less message from `(key, value)` pairs.
    pub fn new<K, V>(headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            body: Vec::new(),
        }
    }

    /// Creates a message carrying a body.
    pub fn with_body<K, V>(headers: impl IntoIterator<Item = (K, V)>, body: Vec<u8>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut msg = Self::new(headers);
        msg.body = body;
        msg
    }

    /// Returns the value of `key`, if present.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Returns the value of `key`, or `fallback` when absent.
    pub fn header_or<'a>(&'a self, key: &str, fallback: &'a str) -> &'a str {
        self.header(key).unwrap_or(fallback)
    }

    /// The `cmd` header, if present.
    pub fn command(&self) -> Option<&str> {
        self.header("cmd")
    }

    /// The `status` header, if present.
    pub fn status(&self) -> Option<&str> {
        self.header("status")
    }

    /// Inserts or replaces a header.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_collects_headers() {
        let msg = Message::new([("cmd", "LOGIN"), ("username", "alice")]);
        assert_eq!(msg.command(), Some("LOGIN"));
        assert_eq!(msg.header("username"), Some("alice"));
        assert!(msg.body.is_empty());
    }

    #[test]
    fn header_or_falls_back() {
        let msg = Message::new([("cmd", "DIR_LIST")]);
        assert_eq!(msg.header_or("path", "."), ".");
        assert_eq!(msg.header_or("cmd", "x"), "DIR_LIST");
    }

    #[test]
    fn with_body_keeps_payload() {
        let msg = Message::with_body([("cmd", "FILE_UPLOAD_CHUNK")], vec![1, 2, 3]);
        assert_eq!(msg.body, [1, 2, 3]);
    }

    #[test]
    fn set_header_replaces() {
        let mut msg = Message::new([("status", "ok")]);
        msg.set_header("status", "done");
        assert_eq!(msg.status(), Some("done"));
    }
}
