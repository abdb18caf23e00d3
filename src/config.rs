//! JSON configuration.
//!
//! The file is read once at startup, validated in full, and converted into
//! immutable runtime types. Any problem is a [`ConfigError`] and the process
//! refuses to start.
//!
//! ```json
//! {
//!   "layout": { "listen": "127.0.0.1:8080", "forward_headers": ["accept-language"] },
//!   "fetch": { "max_retries": 1 },
//!   "templates": [
//!     {
//!       "id": "index",
//!       "route": "/index",
//!       "html": "<html><fragment name=\"nav\"/></html>",
//!       "slots": [{ "name": "nav", "url": "http://127.0.0.1:8081/", "fallback": "<nav/>" }]
//!     }
//!   ],
//!   "fragment_server": { "fragments": { "/*": "<nav>home</nav>" } }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::compose::{Composer, DEFAULT_MARGIN};
use crate::error::ConfigError;
use crate::fetch::{HttpFetcher, RetryPolicy};
use crate::fragments;
use crate::http::{Method, StatusCode};
use crate::layout::{CompositionServer, DEFAULT_INDEX_ROUTE};
use crate::router::Router;
use crate::template::{DEFAULT_SLOT_TIMEOUT, Segment, Slot, Template, TemplateResolver};

/// Environment variable consulted when no path is given on the command line.
pub const CONFIG_ENV: &str = "TAPESTRY_CONFIG";

/// Path used when neither the command line nor [`CONFIG_ENV`] names one.
pub const DEFAULT_CONFIG_PATH: &str = "tapestry.json";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub layout: LayoutConfig,
    pub fetch: FetchConfig,
    pub templates: Vec<TemplateConfig>,
    pub fragment_server: Option<FragmentServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayoutConfig {
    pub listen: String,
    pub index_route: String,
    pub failure_status: u16,
    pub composition_margin_ms: u64,
    pub forward_headers: Vec<String>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_owned(),
            index_route: DEFAULT_INDEX_ROUTE.to_owned(),
            failure_status: StatusCode::BadGateway.as_u16(),
            composition_margin_ms: DEFAULT_MARGIN.as_millis() as u64,
            forward_headers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_base_ms: 50,
            connect_timeout_ms: 1000,
        }
    }
}

/// A template given either as `segments` or as `html` with `slots`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateConfig {
    pub id: String,
    pub route: String,
    #[serde(default)]
    pub segments: Option<Vec<SegmentConfig>>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub slots: Vec<SlotConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum SegmentConfig {
    Literal(String),
    Slot(SlotConfig),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub fallback: Option<String>,
}

fn default_method() -> String {
    Method::Get.as_str().to_owned()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_SLOT_TIMEOUT.as_millis() as u64
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FragmentServerConfig {
    pub listen: String,
    pub fragments: BTreeMap<String, String>,
}

impl Default for FragmentServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8081".to_owned(),
            fragments: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Reads and validates the file at `path`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] if the file cannot be read, otherwise any error
    /// from [`Config::from_json`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed JSON or unknown keys, or the first
    /// validation failure.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks everything that can be checked without building an HTTP client.
    ///
    /// # Errors
    ///
    /// The first invalid template, route, status or retry setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resolver()?;
        self.failure_status()?;
        self.index_route()?;
        self.retry_policy()?;
        self.fragment_router()?;
        Ok(())
    }

    /// Builds every template, in file order.
    ///
    /// # Errors
    ///
    /// The first template that violates an invariant.
    pub fn templates(&self) -> Result<Vec<Template>, ConfigError> {
        self.templates.iter().map(TemplateConfig::build).collect()
    }

    /// # Errors
    ///
    /// Any template error, or duplicate ids and routes.
    pub fn resolver(&self) -> Result<TemplateResolver, ConfigError> {
        TemplateResolver::new(self.templates()?)
    }

    /// # Errors
    ///
    /// [`ConfigError::FailureStatus`] unless the code is a known 5xx status.
    pub fn failure_status(&self) -> Result<StatusCode, ConfigError> {
        let code = self.layout.failure_status;
        StatusCode::from_u16(code)
            .filter(|status| status.is_server_error())
            .ok_or(ConfigError::FailureStatus(code))
    }

    fn index_route(&self) -> Result<&str, ConfigError> {
        let route = self.layout.index_route.as_str();
        if route.starts_with('/') && route != "/" {
            Ok(route)
        } else {
            Err(ConfigError::IndexRoute(route.to_owned()))
        }
    }

    /// # Errors
    ///
    /// [`ConfigError::TooManyRetries`] above the supported maximum.
    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        RetryPolicy::new(
            self.fetch.max_retries,
            Duration::from_millis(self.fetch.backoff_base_ms),
        )
    }

    /// # Errors
    ///
    /// Invalid retry settings or a failure to build the HTTP client.
    pub fn fetcher(&self) -> Result<HttpFetcher, ConfigError> {
        HttpFetcher::new(
            self.retry_policy()?,
            Duration::from_millis(self.fetch.connect_timeout_ms),
        )
    }

    /// Assembles the composition server with an [`HttpFetcher`].
    ///
    /// # Errors
    ///
    /// Any error from the individual builders.
    pub fn composition_server(&self) -> Result<CompositionServer, ConfigError> {
        let composer = Composer::new(Arc::new(self.fetcher()?))
            .margin(Duration::from_millis(self.layout.composition_margin_ms))
            .failure_status(self.failure_status()?);
        Ok(CompositionServer::new(self.resolver()?, composer)
            .index_route(self.index_route()?)
            .forward_headers(self.layout.forward_headers.iter().cloned()))
    }

    /// The static fragment router, if a fragment server is configured.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FragmentRoute`] for an invalid pattern.
    pub fn fragment_router(&self) -> Result<Option<Router>, ConfigError> {
        self.fragment_server
            .as_ref()
            .map(|server| fragments::router(server.fragments.clone()))
            .transpose()
    }
}

impl TemplateConfig {
    fn build(&self) -> Result<Template, ConfigError> {
        match (&self.segments, &self.html) {
            (Some(segments), None) if self.slots.is_empty() => {
                let segments = segments
                    .iter()
                    .map(|segment| match segment {
                        SegmentConfig::Literal(html) => Ok(Segment::literal(html.clone())),
                        SegmentConfig::Slot(slot) => slot.build(&self.id).map(Segment::slot),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Template::new(self.id.clone(), &self.route, segments)
            }
            (None, Some(html)) => {
                let slots = self
                    .slots
                    .iter()
                    .map(|slot| slot.build(&self.id))
                    .collect::<Result<Vec<_>, _>>()?;
                Template::from_markup(self.id.clone(), &self.route, html, slots)
            }
            _ => Err(ConfigError::AmbiguousBody(self.id.clone())),
        }
    }
}

impl SlotConfig {
    fn build(&self, template: &str) -> Result<Slot, ConfigError> {
        if reqwest::Method::from_bytes(self.method.as_bytes()).is_err() {
            return Err(ConfigError::InvalidMethod {
                template: template.to_owned(),
                slot: self.name.clone(),
                method: self.method.clone(),
            });
        }
        let Ok(method) = self.method.parse::<Method>();

        let mut slot = Slot::new(self.name.clone(), self.url.clone())
            .method(method)
            .timeout(Duration::from_millis(self.timeout_ms))
            .required(self.required);
        if let Some(fallback) = &self.fallback {
            slot = slot.fallback(fallback.clone());
        }
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "templates": [{
            "id": "index",
            "route": "/index",
            "segments": [
                { "literal": "<html>" },
                { "slot": { "name": "nav", "url": "http://127.0.0.1:8081/", "timeout_ms": 250, "fallback": "<nav/>" } },
                { "literal": "</html>" }
            ]
        }]
    }"#;

    fn with_template(template: &str) -> String {
        format!(r#"{{ "templates": [{template}] }}"#)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::from_json(MINIMAL).unwrap();
        assert_eq!(config.layout.listen, "127.0.0.1:8080");
        assert_eq!(config.layout.index_route, "/index");
        assert_eq!(config.failure_status().unwrap(), StatusCode::BadGateway);
        assert_eq!(config.retry_policy().unwrap().max_retries(), 0);
        assert!(config.fragment_server.is_none());

        let templates = config.templates().unwrap();
        let slot = templates[0].slots().next().unwrap();
        assert_eq!(slot.fetch_timeout(), Duration::from_millis(250));
        assert_eq!(slot.http_method(), &Method::Get);
        assert!(!slot.is_required());
    }

    #[test]
    fn markup_templates_are_supported() {
        let config = Config::from_json(&with_template(
            r#"{
                "id": "page",
                "route": "/page/:id",
                "html": "<main><fragment name='body'/></main>",
                "slots": [{ "name": "body", "url": "http://x/{id}", "required": true }]
            }"#,
        ))
        .unwrap();
        let resolver = config.resolver().unwrap();
        let resolved = resolver.resolve("/page/7").unwrap();
        assert_eq!(resolved.template.segments().len(), 3);
        assert_eq!(resolved.params.get("id"), Some("7"));
    }

    #[test]
    fn fragment_server_section_builds_a_router() {
        let config = Config::from_json(
            r#"{ "fragment_server": { "listen": "127.0.0.1:0", "fragments": { "/*": "<nav/>" } } }"#,
        )
        .unwrap();
        assert_eq!(config.fragment_router().unwrap().unwrap().len(), 1);
    }

    #[test]
    fn malformed_and_unknown_keys_are_parse_errors() {
        assert!(matches!(
            Config::from_json("{ not json").unwrap_err(),
            ConfigError::Parse(_)
        ));
        assert!(matches!(
            Config::from_json(r#"{ "layuot": {} }"#).unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn duplicate_slots_are_rejected() {
        let err = Config::from_json(&with_template(
            r#"{
                "id": "t", "route": "/t",
                "segments": [
                    { "slot": { "name": "a", "url": "http://x", "required": true } },
                    { "slot": { "name": "a", "url": "http://y", "required": true } }
                ]
            }"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateSlot { .. }));
    }

    #[test]
    fn duplicate_templates_and_routes_are_rejected() {
        let doc = r#"{ "templates": [
            { "id": "a", "route": "/a", "segments": [] },
            { "id": "a", "route": "/b", "segments": [] }
        ] }"#;
        assert!(matches!(
            Config::from_json(doc).unwrap_err(),
            ConfigError::DuplicateTemplate(_)
        ));

        let doc = r#"{ "templates": [
            { "id": "a", "route": "/same/", "segments": [] },
            { "id": "b", "route": "/same", "segments": [] }
        ] }"#;
        assert!(matches!(
            Config::from_json(doc).unwrap_err(),
            ConfigError::DuplicateRoute { .. }
        ));
    }

    #[test]
    fn optional_slot_without_fallback_is_rejected() {
        let err = Config::from_json(&with_template(
            r#"{ "id": "t", "route": "/t", "segments": [{ "slot": { "name": "a", "url": "http://x" } }] }"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingFallback { .. }));
    }

    #[test]
    fn template_body_must_be_unambiguous() {
        for template in [
            r#"{ "id": "t", "route": "/t" }"#,
            r#"{ "id": "t", "route": "/t", "segments": [], "html": "" }"#,
            r#"{ "id": "t", "route": "/t", "segments": [], "slots": [{ "name": "a", "url": "http://x", "required": true }] }"#,
        ] {
            let err = Config::from_json(&with_template(template)).unwrap_err();
            assert!(matches!(err, ConfigError::AmbiguousBody(_)), "{template}");
        }
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let cases = [
            r#"{ "layout": { "failure_status": 404 } }"#,
            r#"{ "layout": { "failure_status": 599 } }"#,
            r#"{ "layout": { "index_route": "index" } }"#,
            r#"{ "fetch": { "max_retries": 3 } }"#,
        ];
        let errors: Vec<_> = cases
            .iter()
            .map(|doc| Config::from_json(doc).unwrap_err())
            .collect();
        assert!(matches!(errors[0], ConfigError::FailureStatus(404)));
        assert!(matches!(errors[1], ConfigError::FailureStatus(599)));
        assert!(matches!(errors[2], ConfigError::IndexRoute(_)));
        assert!(matches!(
            errors[3],
            ConfigError::TooManyRetries { max: 2, got: 3 }
        ));
    }

    #[test]
    fn invalid_method_and_zero_timeout_are_rejected() {
        let err = Config::from_json(&with_template(
            r#"{ "id": "t", "route": "/t", "segments": [
                { "slot": { "name": "a", "url": "http://x", "method": "GE T", "required": true } }
            ] }"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMethod { ref method, .. } if method == "GE T"));

        let err = Config::from_json(&with_template(
            r#"{ "id": "t", "route": "/t", "segments": [
                { "slot": { "name": "a", "url": "http://x", "timeout_ms": 0, "required": true } }
            ] }"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroTimeout { .. }));
    }

    #[test]
    fn bundled_config_is_valid() {
        let config = Config::load(concat!(env!("CARGO_MANIFEST_DIR"), "/tapestry.json")).unwrap();
        let resolver = config.resolver().unwrap();
        assert_eq!(resolver.len(), 3);
        assert_eq!(
            resolver.resolve("/characters/luke").unwrap().template.id(),
            "character"
        );
        assert_eq!(config.fragment_router().unwrap().unwrap().len(), 3);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::load("/definitely/not/here/tapestry.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
