//! Per-request context and request parameters.
//!
//! [`Parameters`] holds string parameters captured from a matched route
//! pattern or merged from the query string; [`Context`] bundles them with the
//! [`Request`] for [`Router`](crate::router::Router) handlers.

use std::collections::BTreeMap;

use crate::Request;

/// Named string parameters, e.g. `id → "42"` captured from `/characters/:id`.
///
/// Backed by an ordered map so iteration (and anything logged from it) is
/// deterministic.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    map: BTreeMap<String, String>,
}

impl Parameters {
    /// Create a new empty parameters map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous value for `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    /// Get a value from the parameters map
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Copies every entry of `other` into `self`; entries of `other` win.
    pub fn extend_from(&mut self, other: &Parameters) {
        for (k, v) in &other.map {
            self.map.insert(k.clone(), v.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Parameters::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// A request together with the parameters its route captured.
pub struct Context {
    request: Request,
    params: Parameters,
}

impl Context {
    pub fn with_params(request: Request, params: Parameters) -> Self {
        Self { request, params }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }
}
