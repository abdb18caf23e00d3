//! Request routing: map URL patterns to handlers or templates.
//!
//! [`RoutePattern`] is the matching engine shared by the [`Router`] (used by
//! the static fragment server) and the template resolver. Three pattern
//! styles are supported:
//!
//! | Pattern              | Example match              | Captured params                 |
//! |----------------------|----------------------------|---------------------------------|
//! | `/index`             | `/index`                   | *(none)*                        |
//! | `/characters/:id`    | `/characters/42`           | `id → "42"`                     |
//! | `/docs/*`            | `/docs/intro/setup`        | `wildcard → "/intro/setup"`     |
//!
//! Trailing slashes are normalized on both patterns and incoming paths, so `/users/` and
//! `/users` are treated as equivalent.
//!
//! When several patterns match a path, the most specific one wins (see
//! [`Specificity`]); registration order never matters.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use thiserror::Error;

use crate::context::{Context, Parameters};
use crate::{Method, Request, Response, StatusCode};

/// Parameter name under which a wildcard pattern stores the matched remainder.
pub const WILDCARD_PARAM: &str = "wildcard";

/// Reasons a route pattern string is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("route pattern `{0}` must start with `/`")]
    NotAbsolute(String),

    #[error("route pattern `{0}` has a parameter without a name")]
    UnnamedParameter(String),

    #[error("route pattern `{0}` may only use `*` as its final `/*` segment")]
    MisplacedWildcard(String),
}

/// A single path segment, either a literal string or a named capture (`:name`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Static(String),
    Parameter(String),
}

/// A compiled route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePattern {
    /// Matches one exact path string, e.g. `/index`.
    Exact(String),
    /// Matches a fixed number of segments where some are named captures, e.g. `/characters/:id`.
    Parameterized { segments: Vec<Segment> },
    /// Matches the prefix itself and anything below it, e.g. `/docs/*`.
    /// `/*` compiles to an empty prefix and matches every path.
    Wildcard(String),
}

/// Total order of how specific a pattern is; larger wins.
///
/// Exact beats parameterized beats wildcard. Parameterized patterns compare by
/// segment count, then by where their static segments sit (a static segment
/// earlier in the path is more specific). Wildcards compare by prefix depth.
///
/// Two distinct patterns that can match the same path never compare equal,
/// unless they share a [canonical shape](RoutePattern::canonical).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Specificity {
    Wildcard { depth: usize, len: usize },
    Parameterized { segments: usize, statics: Vec<bool> },
    Exact,
}

// Captured values are handed out decoded; `+` is literal in a path.
fn decode(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

fn normalize(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

impl RoutePattern {
    /// Parse a route pattern string.
    ///
    /// The pattern is classified as follows (checked in order):
    ///
    /// 1. Ends with `/*` → [`RoutePattern::Wildcard`].
    /// 2. Contains `:` → [`RoutePattern::Parameterized`].
    /// 3. Otherwise → [`RoutePattern::Exact`].
    ///
    /// A trailing slash (other than on the root `/`) is stripped before classification so
    /// that `/users/` and `/users` compile to identical patterns.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] for relative patterns, `:` without a name,
    /// or a `*` anywhere except a final `/*`.
    ///
    /// # Examples
    ///
    /// ```
    /// use tapestry::router::RoutePattern;
    ///
    /// let pattern = RoutePattern::parse("/characters/:id").unwrap();
    /// let params = pattern.matches("/characters/7").unwrap();
    /// assert_eq!(params.get("id"), Some("7"));
    /// ```
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if !pattern.starts_with('/') {
            return Err(PatternError::NotAbsolute(pattern.to_owned()));
        }

        if let Some(prefix) = pattern.strip_suffix("/*") {
            if prefix.contains('*') || prefix.contains(':') {
                return Err(PatternError::MisplacedWildcard(pattern.to_owned()));
            }
            return Ok(RoutePattern::Wildcard(normalize(prefix).to_owned()));
        }
        if pattern.contains('*') {
            return Err(PatternError::MisplacedWildcard(pattern.to_owned()));
        }

        let normalized = normalize(pattern);

        if normalized.contains(':') {
            let mut segments = Vec::new();
            for s in normalized.split('/').filter(|s| !s.is_empty()) {
                match s.strip_prefix(':') {
                    Some("") => return Err(PatternError::UnnamedParameter(pattern.to_owned())),
                    Some(name) => segments.push(Segment::Parameter(name.to_owned())),
                    None => segments.push(Segment::Static(s.to_owned())),
                }
            }
            return Ok(RoutePattern::Parameterized { segments });
        }

        Ok(RoutePattern::Exact(normalized.to_owned()))
    }

    /// Try to match `path`, returning the captured [`Parameters`] on success.
    pub fn matches(&self, path: &str) -> Option<Parameters> {
        let path = normalize(path);

        match self {
            RoutePattern::Exact(p) => (p == path).then(Parameters::new),
            RoutePattern::Parameterized { segments } => {
                let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
                if segments.len() != path_segments.len() {
                    return None;
                }

                let mut params = Parameters::new();
                for (seg, path_seg) in segments.iter().zip(path_segments) {
                    match seg {
                        Segment::Static(s) if s != path_seg => return None,
                        Segment::Static(_) => {}
                        Segment::Parameter(name) => params.insert(name.as_str(), decode(path_seg)),
                    }
                }
                Some(params)
            }
            RoutePattern::Wildcard(prefix) => {
                let rest = path.strip_prefix(prefix.as_str())?;
                // `/docs/*` must not match `/docsets`.
                if !(rest.is_empty() || rest.starts_with('/') || prefix.is_empty()) {
                    return None;
                }
                let mut params = Parameters::new();
                params.insert(WILDCARD_PARAM, decode(rest));
                Some(params)
            }
        }
    }

    /// Returns this pattern's rank among competing matches.
    pub fn specificity(&self) -> Specificity {
        match self {
            RoutePattern::Exact(_) => Specificity::Exact,
            RoutePattern::Parameterized { segments } => Specificity::Parameterized {
                segments: segments.len(),
                statics: segments
                    .iter()
                    .map(|s| matches!(s, Segment::Static(_)))
                    .collect(),
            },
            RoutePattern::Wildcard(prefix) => Specificity::Wildcard {
                depth: prefix.split('/').filter(|s| !s.is_empty()).count(),
                len: prefix.len(),
            },
        }
    }

    /// A string that is equal for two patterns exactly when they match the
    /// same set of paths; parameter names are erased.
    pub fn canonical(&self) -> String {
        match self {
            RoutePattern::Exact(p) => p.clone(),
            RoutePattern::Parameterized { segments } => {
                let mut out = String::new();
                for seg in segments {
                    out.push('/');
                    match seg {
                        Segment::Static(s) => out.push_str(s),
                        Segment::Parameter(_) => out.push(':'),
                    }
                }
                out
            }
            RoutePattern::Wildcard(prefix) => format!("{prefix}/*"),
        }
    }
}

/// Type-erased, heap-allocated async handler that processes a [`Context`] and returns a
/// [`Response`].
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait automatically via the blanket impl
/// below.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx))
    }
}

// A single registered route binding a method + pattern to a handler.
struct Route {
    method: Method,
    pattern: RoutePattern,
    handler: Handler,
}

/// HTTP request router that dispatches `GET` requests to registered handlers.
///
/// The most specific matching pattern wins. Requests with no matching route
/// get `404 Not Found`; a path that matches only under another method gets
/// `405 Method Not Allowed`.
///
/// # Examples
///
/// ```rust,no_run
/// use tapestry::{Router, Response, StatusCode};
///
/// let mut router = Router::new();
/// router.get("/*", |_ctx| async { Response::new(StatusCode::Ok).body("<nav/>") }).unwrap();
/// router.get("/footer", |_ctx| async { Response::new(StatusCode::Ok).body("<footer/>") }).unwrap();
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.len())
            .finish()
    }
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register a handler for `GET` requests matching `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] if `path` is not a valid route pattern.
    pub fn get(&mut self, path: &str, handler: impl IntoHandler) -> Result<(), PatternError> {
        self.add_route(Method::Get, path, handler)
    }

    // Erase the concrete handler type and store it as a `Handler` trait object.
    fn add_route(
        &mut self,
        method: Method,
        path: &str,
        handler: impl IntoHandler,
    ) -> Result<(), PatternError> {
        let pattern = RoutePattern::parse(path)?;
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));
        self.routes.push(Route {
            method,
            pattern,
            handler,
        });
        Ok(())
    }

    /// Return the number of routes registered in this router.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatch `request` to the most specific matching route.
    pub async fn route(&self, request: Request) -> Response {
        let path = request.path();
        let mut path_matched = false;
        let mut best: Option<(&Route, Parameters)> = None;

        for route in &self.routes {
            let Some(params) = route.pattern.matches(path) else {
                continue;
            };
            path_matched = true;
            if &route.method != request.method() {
                continue;
            }
            let better = best.as_ref().is_none_or(|(current, _)| {
                route.pattern.specificity() > current.pattern.specificity()
            });
            if better {
                best = Some((route, params));
            }
        }

        match best {
            Some((route, params)) => (route.handler)(Context::with_params(request, params)).await,
            None if path_matched => {
                Response::new(StatusCode::MethodNotAllowed).header("Allow", "GET")
            }
            None => Response::new(StatusCode::NotFound),
        }
    }
}
