//! Maps request paths to templates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::trace;

use super::Template;
use crate::context::Parameters;
use crate::error::{ConfigError, RouteNotFound};

/// A template matched for a path, with the parameters its route captured.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub template: Arc<Template>,
    pub params: Parameters,
}

/// Immutable route → template table.
///
/// Templates are ordered once, most specific route first, so the first match
/// is always the best one and the result never depends on the order in which
/// templates were registered. Lookups take `&self` and need no locking.
///
/// # Examples
///
/// ```
/// use tapestry::template::{Segment, Template, TemplateResolver};
///
/// let resolver = TemplateResolver::new(vec![
///     Template::new("catch-all", "/*", vec![Segment::literal("<p>any</p>")]).unwrap(),
///     Template::new("index", "/index", vec![Segment::literal("<p>home</p>")]).unwrap(),
/// ]).unwrap();
///
/// assert_eq!(resolver.resolve("/index").unwrap().template.id(), "index");
/// assert_eq!(resolver.resolve("/elsewhere").unwrap().template.id(), "catch-all");
/// ```
#[derive(Debug, Default)]
pub struct TemplateResolver {
    templates: Vec<Arc<Template>>,
}

impl TemplateResolver {
    /// Builds the table.
    ///
    /// # Errors
    ///
    /// [`ConfigError::DuplicateTemplate`] when two templates share an id and
    /// [`ConfigError::DuplicateRoute`] when two routes match exactly the same
    /// set of paths.
    pub fn new(templates: impl IntoIterator<Item = Template>) -> Result<Self, ConfigError> {
        let mut ids = HashSet::new();
        let mut shapes: HashMap<String, String> = HashMap::new();
        let mut table = Vec::new();

        for template in templates {
            if !ids.insert(template.id().to_owned()) {
                return Err(ConfigError::DuplicateTemplate(template.id().to_owned()));
            }
            let shape = template.route().canonical();
            if let Some(first) = shapes.insert(shape.clone(), template.id().to_owned()) {
                return Err(ConfigError::DuplicateRoute {
                    route: shape,
                    first,
                    second: template.id().to_owned(),
                });
            }
            table.push(Arc::new(template));
        }

        table.sort_by(|a, b| {
            b.route()
                .specificity()
                .cmp(&a.route().specificity())
                .then_with(|| a.route().canonical().cmp(&b.route().canonical()))
        });

        Ok(Self { templates: table })
    }

    /// Finds the template for `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteNotFound`] when no route matches.
    pub fn resolve(&self, path: &str) -> Result<Resolved, RouteNotFound> {
        for template in &self.templates {
            if let Some(params) = template.route().matches(path) {
                trace!(path, template = template.id(), "route resolved");
                return Ok(Resolved {
                    template: Arc::clone(template),
                    params,
                });
            }
        }
        Err(RouteNotFound {
            path: path.to_owned(),
        })
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Segment;

    fn page(id: &str, route: &str) -> Template {
        Template::new(id, route, vec![Segment::literal(id.to_owned())]).unwrap()
    }

    fn ids(resolver: &TemplateResolver, path: &str) -> Option<String> {
        resolver
            .resolve(path)
            .ok()
            .map(|r| r.template.id().to_owned())
    }

    #[test]
    fn resolution_is_independent_of_registration_order() {
        let forward = vec![
            ("all", "/*"),
            ("chars", "/characters/*"),
            ("char", "/characters/:id"),
            ("list", "/characters/list"),
        ];
        let mut backward = forward.clone();
        backward.reverse();

        for order in [forward, backward] {
            let resolver =
                TemplateResolver::new(order.iter().map(|(id, route)| page(id, route))).unwrap();
            assert_eq!(ids(&resolver, "/characters/list").as_deref(), Some("list"));
            assert_eq!(ids(&resolver, "/characters/7").as_deref(), Some("char"));
            assert_eq!(ids(&resolver, "/characters/7/films").as_deref(), Some("chars"));
            assert_eq!(ids(&resolver, "/characters").as_deref(), Some("chars"));
            assert_eq!(ids(&resolver, "/films").as_deref(), Some("all"));
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let resolver =
            TemplateResolver::new(vec![page("docs", "/docs/*"), page("api", "/docs/api/*")])
                .unwrap();
        assert_eq!(ids(&resolver, "/docs/api/v1").as_deref(), Some("api"));
        assert_eq!(ids(&resolver, "/docs/guide").as_deref(), Some("docs"));
    }

    #[test]
    fn captured_params_are_returned() {
        let resolver = TemplateResolver::new(vec![page("char", "/characters/:id")]).unwrap();
        let resolved = resolver.resolve("/characters/luke").unwrap();
        assert_eq!(resolved.params.get("id"), Some("luke"));
    }

    #[test]
    fn unknown_route_is_not_found() {
        let resolver = TemplateResolver::new(vec![page("index", "/index")]).unwrap();
        assert_eq!(
            resolver.resolve("/missing").unwrap_err(),
            RouteNotFound {
                path: "/missing".into()
            }
        );
    }

    #[test]
    fn duplicate_ids_and_routes_are_rejected() {
        let err = TemplateResolver::new(vec![page("a", "/a"), page("a", "/b")]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTemplate(id) if id == "a"));

        let err =
            TemplateResolver::new(vec![page("a", "/u/:id"), page("b", "/u/:name")]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateRoute { .. }));
    }
}
