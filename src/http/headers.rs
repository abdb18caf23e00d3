//! HTTP header map with case-insensitive name lookup.
//!
//! HTTP headers are order-preserving and case-insensitive per [RFC 9110 §5].

/// A case-insensitive, multi-value HTTP header map.
///
/// Preserves insertion order and allows multiple values per header name,
/// matching the semantics of HTTP/1.1 header fields (RFC 9110 §5.3).
///
/// # Examples
///
/// ```
/// use tapestry::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Accept-Language", "en");
/// headers.insert("Cookie", "a=1");
/// headers.insert("Cookie", "b=2");
///
/// assert_eq!(headers.get("accept-language"), Some("en"));
/// let all: Vec<_> = headers.get_all("cookie").collect();
/// assert_eq!(all, vec!["a=1", "b=2"]);
/// ```
#[derive(Debug, Clone, Default)]
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

    /// Returns `true` if the map contains at least one entry with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns a copy holding only the entries whose name appears in `allowed`
    /// (case-insensitive), preserving order and repeated values.
    pub fn filtered<S: AsRef<str>>(&self, allowed: &[S]) -> Headers {
        let inner = self
            .inner
            .iter()
            .filter(|(k, _)| allowed.iter().any(|a| k.eq_ignore_ascii_case(a.as_ref())))
            .cloned()
            .collect();
        Headers { inner }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_get() {
        let mut h = Headers::new();
        h.insert("Content-Type", "text/html");
        assert_eq!(h.get("content-type"), Some("text/html"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/html"));
        assert!(h.contains("Content-type"));
        assert!(!h.contains("x-missing"));
    }

    #[test]
    fn filtered_keeps_only_allowed_names() {
        let mut h = Headers::new();
        h.insert("Host", "layout.local");
        h.insert("Cookie", "session=1");
        h.insert("Accept-Language", "fr");
        h.insert("cookie", "theme=dark");

        let kept = h.filtered(&["COOKIE", "accept-language"]);
        let pairs: Vec<_> = kept.iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("Cookie", "session=1"),
                ("Accept-Language", "fr"),
                ("cookie", "theme=dark"),
            ]
        );
    }

    #[test]
    fn filtered_with_empty_allow_list_is_empty() {
        let mut h = Headers::new();
        h.insert("Cookie", "a=1");
        assert!(h.filtered::<&str>(&[]).is_empty());
    }
}
