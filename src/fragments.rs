//! A static fragment server: fixed HTML bodies behind route patterns.
//!
//! Useful as a local upstream for composed pages, e.g. a navigation bar
//! served for every path with `"/*": "<nav>...</nav>"`.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::info;

use crate::error::ConfigError;
use crate::http::{Response, StatusCode};
use crate::router::Router;
use crate::server::{Server, ServerError};

/// Builds a router answering each pattern with its HTML.
///
/// # Errors
///
/// [`ConfigError::FragmentRoute`] when a pattern is invalid.
///
/// # Examples
///
/// ```
/// let router = tapestry::fragments::router([("/*", "<nav>home</nav>")]).unwrap();
/// assert_eq!(router.len(), 1);
/// ```
pub fn router<P, H>(fragments: impl IntoIterator<Item = (P, H)>) -> Result<Router, ConfigError>
where
    P: AsRef<str>,
    H: Into<Bytes>,
{
    let mut router = Router::new();
    for (pattern, html) in fragments {
        let html: Bytes = html.into();
        router
            .get(pattern.as_ref(), move |_ctx| {
                let html = html.clone();
                async move {
                    Response::new(StatusCode::Ok)
                        .header("Content-Type", "text/html; charset=utf-8")
                        .body_bytes(html)
                }
            })
            .map_err(ConfigError::FragmentRoute)?;
    }
    Ok(router)
}

/// Serves `router` on `server` until the listener fails.
///
/// # Errors
///
/// Propagates [`ServerError`] from the accept loop.
pub async fn serve(router: Router, server: Server) -> Result<(), ServerError> {
    let router = Arc::new(router);
    server
        .run(move |request| {
            let router = Arc::clone(&router);
            async move {
                let started = Instant::now();
                let method = request.method().clone();
                let path = request.path().to_owned();
                let response = router.route(request).await;
                info!(
                    %method,
                    %path,
                    status = response.status().as_u16(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "fragment"
                );
                response
            }
        })
        .await
}
