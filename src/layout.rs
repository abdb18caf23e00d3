//! The composition server: turns an inbound `GET` into a composed page.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::compose::{Composer, CompositionRequest, error_page};
use crate::context::Parameters;
use crate::http::{Body, Method, Request, Response, StatusCode};
use crate::server::{Server, ServerError};
use crate::template::TemplateResolver;

/// Route that `/` is rewritten to unless configured otherwise.
pub const DEFAULT_INDEX_ROUTE: &str = "/index";

const HTML: &str = "text/html; charset=utf-8";

/// Resolves requests to templates and answers them with composed pages.
pub struct CompositionServer {
    resolver: TemplateResolver,
    composer: Composer,
    index_route: String,
    forward_headers: Vec<String>,
}

impl CompositionServer {
    pub fn new(resolver: TemplateResolver, composer: Composer) -> Self {
        Self {
            resolver,
            composer,
            index_route: DEFAULT_INDEX_ROUTE.to_owned(),
            forward_headers: Vec::new(),
        }
    }

    /// Route served for requests to `/`.
    #[must_use]
    pub fn index_route(mut self, route: impl Into<String>) -> Self {
        self.index_route = route.into();
        self
    }

    /// Inbound headers passed on to fragment servers. Everything else is dropped.
    #[must_use]
    pub fn forward_headers<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.forward_headers = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn resolver(&self) -> &TemplateResolver {
        &self.resolver
    }

    /// Answers one request. The status and headers are final when this
    /// returns; a successful page body may still be streaming.
    pub async fn handle(&self, request: Request) -> Response {
        let started = Instant::now();
        let response = self.respond(&request).await;
        info!(
            method = %request.method(),
            path = %request.path(),
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request"
        );
        response
    }

    async fn respond(&self, request: &Request) -> Response {
        if request.method() != &Method::Get {
            return html(StatusCode::MethodNotAllowed).header("Allow", "GET");
        }

        let route = match request.path() {
            "/" => self.index_route.as_str(),
            path => path,
        };

        let resolved = match self.resolver.resolve(route) {
            Ok(resolved) => resolved,
            Err(e) => {
                debug!(error = %e, "no template");
                return html(StatusCode::NotFound);
            }
        };

        let mut params: Parameters = request.query_params().collect();
        params.extend_from(&resolved.params);

        let composition = self
            .composer
            .compose(
                resolved.template,
                CompositionRequest {
                    route: route.to_owned(),
                    params,
                    headers: request.headers().filtered(&self.forward_headers),
                },
            )
            .await;

        let response = Response::new(composition.status).header("Content-Type", HTML);
        match composition.body {
            Body::Full(bytes) => response.body_bytes(bytes),
            Body::Stream(stream) => response.body_stream(stream),
        }
    }

    /// Serves requests on `server` until the listener fails.
    ///
    /// # Errors
    ///
    /// Propagates [`ServerError`] from the accept loop.
    pub async fn run(self, server: Server) -> Result<(), ServerError> {
        let app = Arc::new(self);
        server
            .run(move |request| {
                let app = Arc::clone(&app);
                async move { app.handle(request).await }
            })
            .await
    }
}

fn html(status: StatusCode) -> Response {
    Response::new(status)
        .header("Content-Type", HTML)
        .body_bytes(error_page(status))
}
