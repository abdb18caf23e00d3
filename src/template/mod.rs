//! Page templates: ordered literal HTML chunks and named slots.
//!
//! A [`Template`] is built once at startup and never mutated; it is shared
//! between requests behind an [`Arc`]. Construction enforces the template
//! invariants:
//!
//! - slot names are unique within a template,
//! - every optional slot carries fallback HTML (possibly empty),
//! - every slot has a non-zero timeout,
//! - the route is a valid [`RoutePattern`].
//!
//! Templates can be written as an explicit segment list or as HTML with
//! self-closing `<fragment name="..."/>` placeholders (see [`Template::from_markup`]).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::ConfigError;
use crate::http::Method;
use crate::router::RoutePattern;

mod markup;
pub mod resolver;

pub use resolver::{Resolved, TemplateResolver};

/// Timeout applied to slots that do not set one.
pub const DEFAULT_SLOT_TIMEOUT: Duration = Duration::from_secs(3);

/// A named placeholder filled with a fragment fetched from an upstream service.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tapestry::template::Slot;
///
/// let nav = Slot::new("nav", "http://127.0.0.1:8081/nav?lang={lang}")
///     .timeout(Duration::from_millis(500))
///     .fallback("<nav/>");
/// assert!(!nav.is_required());
/// assert_eq!(nav.fallback_html().map(|b| &b[..]), Some(&b"<nav/>"[..]));
/// ```
#[derive(Debug, Clone)]
pub struct Slot {
    name: String,
    url: String,
    method: Method,
    timeout: Duration,
    required: bool,
    fallback: Option<Bytes>,
}

impl Slot {
    /// Creates an optional `GET` slot with the default timeout and no fallback yet.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            method: Method::Get,
            timeout: DEFAULT_SLOT_TIMEOUT,
            required: false,
            fallback: None,
        }
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Marks the slot as required: if it fails, the whole page fails.
    #[must_use]
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// HTML used in place of the fragment when an optional fetch fails.
    #[must_use]
    pub fn fallback(mut self, html: impl Into<Bytes>) -> Self {
        self.fallback = Some(html.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The URL, possibly still containing `{param}` placeholders.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn http_method(&self) -> &Method {
        &self.method
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn fallback_html(&self) -> Option<&Bytes> {
        self.fallback.as_ref()
    }
}

/// One piece of a template, in output order.
#[derive(Debug, Clone)]
pub enum Segment {
    Literal(Bytes),
    Slot(Arc<Slot>),
}

impl Segment {
    pub fn literal(html: impl Into<Bytes>) -> Self {
        Segment::Literal(html.into())
    }

    pub fn slot(slot: Slot) -> Self {
        Segment::Slot(Arc::new(slot))
    }
}

/// An immutable page template bound to a route.
#[derive(Debug)]
pub struct Template {
    id: String,
    route: RoutePattern,
    segments: Vec<Segment>,
}

impl Template {
    /// Builds a template from an explicit segment list.
    ///
    /// Empty literals are dropped.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the route is invalid or any template
    /// invariant is violated.
    ///
    /// # Examples
    ///
    /// ```
    /// use tapestry::template::{Segment, Slot, Template};
    ///
    /// let index = Template::new("index", "/index", vec![
    ///     Segment::literal("<html>"),
    ///     Segment::slot(Slot::new("nav", "http://127.0.0.1:8081/").fallback("<nav/>")),
    ///     Segment::literal("</html>"),
    /// ]).unwrap();
    /// assert_eq!(index.slots().count(), 1);
    /// ```
    pub fn new(
        id: impl Into<String>,
        route: &str,
        segments: Vec<Segment>,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        let route = RoutePattern::parse(route).map_err(|source| ConfigError::Route {
            template: id.clone(),
            source,
        })?;

        let mut seen = HashSet::new();
        for segment in &segments {
            let Segment::Slot(slot) = segment else {
                continue;
            };
            if !seen.insert(slot.name()) {
                return Err(ConfigError::DuplicateSlot {
                    template: id,
                    slot: slot.name().to_owned(),
                });
            }
            if !slot.is_required() && slot.fallback_html().is_none() {
                return Err(ConfigError::MissingFallback {
                    template: id,
                    slot: slot.name().to_owned(),
                });
            }
            if slot.fetch_timeout().is_zero() {
                return Err(ConfigError::ZeroTimeout {
                    template: id,
                    slot: slot.name().to_owned(),
                });
            }
        }

        let segments = segments
            .into_iter()
            .filter(|s| !matches!(s, Segment::Literal(b) if b.is_empty()))
            .collect();

        Ok(Self {
            id,
            route,
            segments,
        })
    }

    /// Builds a template from HTML containing `<fragment name="..."/>`
    /// placeholders, each replaced by the slot of that name.
    ///
    /// # Errors
    ///
    /// In addition to the errors of [`Template::new`], fails when a
    /// placeholder is malformed, names an undefined slot, or when a defined
    /// slot is never placed.
    ///
    /// # Examples
    ///
    /// ```
    /// use tapestry::template::{Slot, Template};
    ///
    /// let page = Template::from_markup(
    ///     "index",
    ///     "/index",
    ///     r#"<html><fragment name="nav"/><main>hi</main></html>"#,
    ///     vec![Slot::new("nav", "http://127.0.0.1:8081/").fallback("<nav/>")],
    /// ).unwrap();
    /// assert_eq!(page.segments().len(), 3);
    /// ```
    pub fn from_markup(
        id: impl Into<String>,
        route: &str,
        html: &str,
        slots: Vec<Slot>,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        let segments = markup::assemble(&id, html, slots)?;
        Self::new(id, route, segments)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn route(&self) -> &RoutePattern {
        &self.route
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Iterates the slots in template order.
    pub fn slots(&self) -> impl Iterator<Item = &Arc<Slot>> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Slot(slot) => Some(slot),
            Segment::Literal(_) => None,
        })
    }

    /// Upper bound on a whole composition: the slowest slot timeout plus
    /// `margin`. A template without slots needs no time at all.
    pub fn composition_timeout(&self, margin: Duration) -> Duration {
        self.slots()
            .map(|s| s.fetch_timeout())
            .max()
            .map_or(Duration::ZERO, |slowest| slowest + margin)
    }
}
