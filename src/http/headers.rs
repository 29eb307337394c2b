//! HTTP header map with case-insensitive name lookup.
//!
//! HTTP headers are order-preserving and case-insensitive per RFC 9110 §5. The gateway
//! writes most of its headers with [`Headers::set`] (one value per name, last write
//! wins) and only uses [`Headers::insert`] where a field may legitimately repeat, such
//! as `Vary`.

use std::fmt;

/// A case-insensitive, multi-value HTTP header map.
///
/// # Examples
///
/// ```
/// use rpcgate::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.set("Content-Type", "text/plain");
/// headers.set("content-type", "application/json");
/// headers.insert("Vary", "Origin");
/// headers.insert("Vary", "Access-Control-Request-Headers");
///
/// assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json"));
/// assert_eq!(headers.get_all("vary").count(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with pre-allocated capacity for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Appends a header entry. Multiple values for the same name are preserved.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Replaces every value of `name` with a single `value`.
    ///
    /// The replaced entry keeps its original position; a new name is appended.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .inner
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some(pos) => {
                self.inner[pos] = (name.clone(), value);
                let mut index = 0;
                self.inner.retain(|(k, _)| {
                    let keep = index <= pos || !k.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });
            }
            None => self.inner.push((name, value)),
        }
    }

    /// Returns the first value for the given header name (case-insensitive), or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns an iterator over all values for the given header name (case-insensitive).
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Removes all entries with the given header name (case-insensitive).
    ///
    /// Returns `true` if any entries were removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    /// Returns `true` if the map contains at least one entry with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Copies every entry of `other` into this map with [`set`](Self::set) semantics,
    /// except for `Vary`, whose values accumulate.
    pub fn merge(&mut self, other: &Headers) {
        for (name, value) in other.iter() {
            if name.eq_ignore_ascii_case("vary") {
                self.insert(name, value);
            } else {
                self.set(name, value);
            }
        }
    }

    /// Returns the total number of header entries (not unique names).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no header entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.inner {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_get() {
        let mut h = Headers::new();
        h.insert("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn set_replaces_every_value_in_place() {
        let mut h = Headers::new();
        h.insert("X-Rate-Limit-Remaining", "2");
        h.insert("Connection", "keep-alive");
        h.insert("x-rate-limit-remaining", "9");
        h.set("X-Rate-Limit-Remaining", "1");

        let pairs: Vec<_> = h.iter().collect();
        assert_eq!(
            pairs,
            vec![("X-Rate-Limit-Remaining", "1"), ("Connection", "keep-alive")]
        );
    }

    #[test]
    fn merge_accumulates_vary_only() {
        let mut base = Headers::new();
        base.set("Access-Control-Allow-Origin", "*");
        base.insert("Vary", "Origin");

        let mut extra = Headers::new();
        extra.set("Access-Control-Allow-Origin", "http://a.com");
        extra.insert("Vary", "Access-Control-Request-Headers");

        base.merge(&extra);
        assert_eq!(base.get("access-control-allow-origin"), Some("http://a.com"));
        let vary: Vec<_> = base.get_all("vary").collect();
        assert_eq!(vary, vec!["Origin", "Access-Control-Request-Headers"]);
    }

    #[test]
    fn remove() {
        let mut h = Headers::new();
        h.insert("Transfer-Encoding", "chunked");
        assert!(h.remove("transfer-encoding"));
        assert!(h.is_empty());
        assert!(!h.remove("transfer-encoding"));
    }
}
