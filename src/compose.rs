//! Page composition: fan out one fetch per slot, then stream the page in
//! template order.
//!
//! Composition runs in two phases:
//!
//! 1. **Commit.** Every slot fetch is spawned at once. The composer waits for
//!    the *required* slots only, bounded by the template's overall deadline
//!    (slowest slot timeout plus a margin). If any required slot fails, the
//!    request fails with the configured status and a generic error page; no
//!    byte of the page has been produced at that point.
//! 2. **Stream.** The status is now known to be `200`. A writer task emits
//!    segments strictly in template order. Literals and required slots are
//!    already available; each optional slot is written once its own fetch
//!    finishes, or replaced by its fallback when the fetch fails or the
//!    deadline passes. Segment `N` is never written before `0..N`, whatever
//!    order the fetches complete in.
//!
//! Fetch tasks live in a [`JoinSet`] owned by whichever phase is running.
//! When a composition fails, finishes, or its client disconnects (the body
//! receiver is dropped), the set is dropped and outstanding fetches are
//! aborted.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, error};

use crate::context::Parameters;
use crate::error::{CompositionFailure, FetchError};
use crate::fetch::{Fetch, FragmentResult, Outcome};
use crate::http::{Body, ByteStream, Headers, StatusCode};
use crate::template::{Segment, Slot, Template};

/// Extra time granted on top of the slowest slot timeout.
pub const DEFAULT_MARGIN: Duration = Duration::from_millis(100);

/// Number of segments buffered between the writer task and the connection.
const STREAM_BUFFER: usize = 16;

/// Everything a composition needs to know about the inbound request.
#[derive(Debug, Clone, Default)]
pub struct CompositionRequest {
    /// The route the template was resolved for, after root rewriting.
    pub route: String,
    /// Query parameters merged with captured path parameters.
    pub params: Parameters,
    /// Inbound headers that may be forwarded to fragment servers.
    pub headers: Headers,
}

/// The outcome of composing one page.
#[derive(Debug)]
pub struct Composition {
    pub status: StatusCode,
    pub body: Body,
}

/// Assembles templates from fetched fragments.
#[derive(Clone)]
pub struct Composer {
    fetcher: Arc<dyn Fetch>,
    margin: Duration,
    failure_status: StatusCode,
}

enum SlotState {
    Literal,
    Waiting(oneshot::Receiver<FragmentResult>),
    Ready(Bytes),
}

impl Composer {
    /// Creates a composer with [`DEFAULT_MARGIN`] and a `502` failure status.
    pub fn new(fetcher: Arc<dyn Fetch>) -> Self {
        Self {
            fetcher,
            margin: DEFAULT_MARGIN,
            failure_status: StatusCode::BadGateway,
        }
    }

    #[must_use]
    pub fn margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    /// Status returned when a required slot fails.
    #[must_use]
    pub fn failure_status(mut self, status: StatusCode) -> Self {
        self.failure_status = status;
        self
    }

    /// Composes `template` for `request`.
    ///
    /// Returns `200` with a streamed body, or the failure status with a
    /// generic error page when a required slot could not be fetched.
    pub async fn compose(
        &self,
        template: Arc<Template>,
        request: CompositionRequest,
    ) -> Composition {
        let id = template.id().to_owned();
        match self.try_compose(template, request).await {
            Ok(stream) => Composition {
                status: StatusCode::Ok,
                body: Body::Stream(stream),
            },
            Err(failure) => {
                error!(
                    template = %id,
                    slot = %failure.slot,
                    cause = %failure.cause,
                    "composition failed"
                );
                Composition {
                    status: self.failure_status,
                    body: Body::Full(error_page(self.failure_status)),
                }
            }
        }
    }

    /// Runs the commit phase and, on success, returns the page stream.
    ///
    /// # Errors
    ///
    /// [`CompositionFailure`] naming the first required slot (in template
    /// order) that failed.
    pub async fn try_compose(
        &self,
        template: Arc<Template>,
        request: CompositionRequest,
    ) -> Result<ByteStream, CompositionFailure> {
        let started = Instant::now();
        let deadline = started + template.composition_timeout(self.margin);
        let request = Arc::new(request);

        let mut tasks = JoinSet::new();
        let mut states: Vec<SlotState> = template
            .segments()
            .iter()
            .map(|segment| match segment {
                Segment::Literal(_) => SlotState::Literal,
                Segment::Slot(slot) => {
                    SlotState::Waiting(self.spawn_fetch(&mut tasks, slot, &request))
                }
            })
            .collect();

        for (segment, state) in template.segments().iter().zip(states.iter_mut()) {
            let Segment::Slot(slot) = segment else {
                continue;
            };
            if !slot.is_required() {
                continue;
            }
            let SlotState::Waiting(rx) = std::mem::replace(state, SlotState::Literal) else {
                continue;
            };

            let result = await_slot(slot, rx, deadline, started).await;
            match result.outcome {
                Outcome::Ok(body) => *state = SlotState::Ready(body),
                Outcome::Timeout => {
                    return Err(CompositionFailure::timed_out(
                        slot.name(),
                        result.latency,
                    ));
                }
                Outcome::Error(e) => {
                    return Err(CompositionFailure {
                        slot: slot.name().to_owned(),
                        cause: e.to_string(),
                    });
                }
            }
        }

        debug!(
            template = template.id(),
            route = %request.route,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "required slots ready, streaming"
        );

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(stream_segments(template, states, tasks, deadline, started, tx));
        Ok(rx)
    }

    fn spawn_fetch(
        &self,
        tasks: &mut JoinSet<()>,
        slot: &Arc<Slot>,
        request: &Arc<CompositionRequest>,
    ) -> oneshot::Receiver<FragmentResult> {
        let (tx, rx) = oneshot::channel();
        let fetcher = Arc::clone(&self.fetcher);
        let slot = Arc::clone(slot);
        let request = Arc::clone(request);

        tasks.spawn(async move {
            let started = Instant::now();
            let result = match timeout(slot.fetch_timeout(), fetcher.fetch(&slot, &request)).await
            {
                Ok(result) => result,
                Err(_) => FragmentResult::new(slot.name(), Outcome::Timeout, started.elapsed()),
            };
            // The composer may already have given up on this slot.
            let _ = tx.send(result);
        });
        rx
    }
}

async fn await_slot(
    slot: &Slot,
    rx: oneshot::Receiver<FragmentResult>,
    deadline: Instant,
    started: Instant,
) -> FragmentResult {
    match timeout_at(deadline, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => FragmentResult::new(
            slot.name(),
            Outcome::Error(FetchError::TaskEnded),
            started.elapsed(),
        ),
        Err(_) => FragmentResult::new(slot.name(), Outcome::Timeout, started.elapsed()),
    }
}

/// Writes every segment, in order, into `tx`.
///
/// Owns `tasks` so that outstanding fetches are aborted as soon as this
/// returns, including when the client hangs up mid-page.
async fn stream_segments(
    template: Arc<Template>,
    mut states: Vec<SlotState>,
    tasks: JoinSet<()>,
    deadline: Instant,
    started: Instant,
    tx: mpsc::Sender<Bytes>,
) {
    let _tasks = tasks;

    for (segment, state) in template.segments().iter().zip(states.iter_mut()) {
        let chunk = match (segment, std::mem::replace(state, SlotState::Literal)) {
            (Segment::Literal(html), _) => html.clone(),
            (Segment::Slot(_), SlotState::Ready(body)) => body,
            (Segment::Slot(slot), SlotState::Waiting(rx)) => {
                let result = tokio::select! {
                    result = await_slot(slot, rx, deadline, started) => result,
                    () = tx.closed() => {
                        debug!(template = template.id(), "client went away, abandoning composition");
                        return;
                    }
                };
                match result.outcome {
                    Outcome::Ok(body) => body,
                    failed => {
                        debug!(
                            template = template.id(),
                            slot = slot.name(),
                            outcome = %failed,
                            "using fallback"
                        );
                        slot.fallback_html().cloned().unwrap_or_default()
                    }
                }
            }
            (Segment::Slot(slot), SlotState::Literal) => {
                slot.fallback_html().cloned().unwrap_or_default()
            }
        };

        if chunk.is_empty() {
            continue;
        }
        if tx.send(chunk).await.is_err() {
            debug!(template = template.id(), "client went away, abandoning composition");
            return;
        }
    }

    debug!(
        template = template.id(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "composition complete"
    );
}

/// Generic HTML body for a failed request; it never reveals which slot failed.
pub fn error_page(status: StatusCode) -> Bytes {
    Bytes::from(format!(
        "<!DOCTYPE html><html><head><title>{status}</title></head>\
         <body><h1>{}</h1></body></html>",
        status.canonical_reason()
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Clone, Copy)]
    enum Reply {
        Html(&'static str),
        Fail,
    }

    /// Replies after a fixed delay and counts fetches that were cancelled
    /// before completing.
    #[derive(Default)]
    struct Stub {
        replies: HashMap<&'static str, (u64, Reply)>,
        cancelled: Arc<AtomicUsize>,
        started: Arc<AtomicUsize>,
    }

    impl Stub {
        fn reply(mut self, slot: &'static str, delay_ms: u64, reply: Reply) -> Self {
            self.replies.insert(slot, (delay_ms, reply));
            self
        }
    }

    struct InFlight {
        cancelled: Arc<AtomicUsize>,
        done: bool,
    }

    impl Drop for InFlight {
        fn drop(&mut self) {
            if !self.done {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl Fetch for Stub {
        fn fetch<'a>(
            &'a self,
            slot: &'a Slot,
            _request: &'a CompositionRequest,
        ) -> Pin<Box<dyn Future<Output = FragmentResult> + Send + 'a>> {
            Box::pin(async move {
                self.started.fetch_add(1, Ordering::SeqCst);
                let mut guard = InFlight {
                    cancelled: Arc::clone(&self.cancelled),
                    done: false,
                };
                let begun = Instant::now();
                let (delay, reply) = self.replies[slot.name()];
                tokio::time::sleep(Duration::from_millis(delay)).await;
                guard.done = true;
                let outcome = match reply {
                    Reply::Html(html) => Outcome::Ok(Bytes::from_static(html.as_bytes())),
                    Reply::Fail => Outcome::Error(FetchError::Status(500)),
                };
                FragmentResult::new(slot.name(), outcome, begun.elapsed())
            })
        }
    }

    fn slot(name: &str, timeout_ms: u64) -> Slot {
        Slot::new(name, format!("http://fragments/{name}"))
            .timeout(Duration::from_millis(timeout_ms))
    }

    fn composer(stub: Stub) -> Composer {
        Composer::new(Arc::new(stub)).margin(Duration::from_millis(50))
    }

    async fn body_string(composition: Composition) -> String {
        String::from_utf8(composition.body.collect().await.to_vec()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn literal_only_template_composes_immediately() {
        let template = Arc::new(
            Template::new(
                "static",
                "/static",
                vec![Segment::literal("<html>"), Segment::literal("</html>")],
            )
            .unwrap(),
        );
        let started = Instant::now();
        let composition = composer(Stub::default())
            .compose(template, CompositionRequest::default())
            .await;

        assert_eq!(composition.status, StatusCode::Ok);
        assert_eq!(body_string(composition).await, "<html></html>");
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn output_follows_template_order_not_completion_order() {
        let stub = Stub::default()
            .reply("a", 300, Reply::Html("<a/>"))
            .reply("b", 10, Reply::Html("<b/>"))
            .reply("c", 100, Reply::Html("<c/>"));
        let template = Arc::new(
            Template::new(
                "page",
                "/page",
                vec![
                    Segment::literal("<body>"),
                    Segment::slot(slot("a", 1000).required(true)),
                    Segment::literal("|"),
                    Segment::slot(slot("b", 1000).fallback("")),
                    Segment::slot(slot("c", 1000).required(true)),
                    Segment::literal("</body>"),
                ],
            )
            .unwrap(),
        );

        let started = Instant::now();
        let composition = composer(stub)
            .compose(template, CompositionRequest::default())
            .await;
        assert_eq!(composition.status, StatusCode::Ok);
        assert_eq!(body_string(composition).await, "<body><a/>|<b/><c/></body>");
        // Fetches ran concurrently: total time is the slowest, not the sum.
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn optional_failure_uses_fallback_verbatim() {
        let stub = Stub::default()
            .reply("nav", 5, Reply::Fail)
            .reply("main", 5, Reply::Html("<main/>"));
        let template = Arc::new(
            Template::new(
                "page",
                "/page",
                vec![
                    Segment::slot(slot("nav", 100).fallback("<nav>offline</nav>")),
                    Segment::slot(slot("main", 100).required(true)),
                ],
            )
            .unwrap(),
        );

        let composition = composer(stub)
            .compose(template, CompositionRequest::default())
            .await;
        assert_eq!(composition.status, StatusCode::Ok);
        assert_eq!(body_string(composition).await, "<nav>offline</nav><main/>");
    }

    #[tokio::test(start_paused = true)]
    async fn optional_timeout_yields_fallback_in_position() {
        let stub = Stub::default().reply("nav", 10_000, Reply::Html("<nav>late</nav>"));
        let template = Arc::new(
            Template::new(
                "index",
                "/index",
                vec![
                    Segment::literal("<html>"),
                    Segment::slot(slot("nav", 200).fallback("<nav/>")),
                    Segment::literal("</html>"),
                ],
            )
            .unwrap(),
        );

        let started = Instant::now();
        let composition = composer(stub)
            .compose(template, CompositionRequest::default())
            .await;
        assert_eq!(composition.status, StatusCode::Ok);
        assert_eq!(body_string(composition).await, "<html><nav/></html>");
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn required_timeout_fails_whole_page() {
        let stub = Stub::default()
            .reply("header", 5, Reply::Html("<header/>"))
            .reply("main", 10_000, Reply::Html("<main/>"));
        let template = Arc::new(
            Template::new(
                "page",
                "/page",
                vec![
                    Segment::literal("<html>SECRET"),
                    Segment::slot(slot("header", 100).required(true)),
                    Segment::slot(slot("main", 300).required(true)),
                ],
            )
            .unwrap(),
        );

        let composition = composer(stub)
            .failure_status(StatusCode::ServiceUnavailable)
            .compose(template, CompositionRequest::default())
            .await;
        assert_eq!(composition.status, StatusCode::ServiceUnavailable);
        assert!(matches!(composition.body, Body::Full(_)));
        let body = body_string(composition).await;
        assert!(body.contains("Service Unavailable"));
        assert!(!body.contains("SECRET"));
        assert!(!body.contains("<header/>"));
    }

    /// Blocks its worker thread inside a single poll, so the per-slot
    /// `timeout` around it never gets a chance to fire.
    struct Stuck(Duration);

    impl Fetch for Stuck {
        fn fetch<'a>(
            &'a self,
            slot: &'a Slot,
            _request: &'a CompositionRequest,
        ) -> Pin<Box<dyn Future<Output = FragmentResult> + Send + 'a>> {
            Box::pin(async move {
                std::thread::sleep(self.0);
                FragmentResult::new(slot.name(), Outcome::Ok(Bytes::from_static(b"late")), self.0)
            })
        }
    }

    fn stuck_template(required: bool) -> Arc<Template> {
        let main = slot("main", 100).required(required);
        let main = if required { main } else { main.fallback("<p>fallback</p>") };
        Arc::new(
            Template::new(
                "page",
                "/page",
                vec![Segment::literal("<html>"), Segment::slot(main)],
            )
            .unwrap(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overall_deadline_fails_required_slot_that_ignores_its_timeout() {
        let composer = Composer::new(Arc::new(Stuck(Duration::from_millis(600))))
            .margin(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let failure = composer
            .try_compose(stuck_template(true), CompositionRequest::default())
            .await
            .unwrap_err();

        assert_eq!(failure.slot, "main");
        assert!(failure.cause.starts_with("timed out"), "{}", failure.cause);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overall_deadline_falls_back_for_optional_slot_that_ignores_its_timeout() {
        let composer = Composer::new(Arc::new(Stuck(Duration::from_millis(600))))
            .margin(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let composition = composer
            .compose(stuck_template(false), CompositionRequest::default())
            .await;

        assert_eq!(composition.status, StatusCode::Ok);
        assert_eq!(body_string(composition).await, "<html><p>fallback</p>");
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn required_failure_reports_slot_and_cancels_other_fetches() {
        let stub = Stub::default()
            .reply("main", 5, Reply::Fail)
            .reply("ads", 5_000, Reply::Html("<ads/>"));
        let cancelled = Arc::clone(&stub.cancelled);
        let template = Arc::new(
            Template::new(
                "page",
                "/page",
                vec![
                    Segment::slot(slot("main", 100).required(true)),
                    Segment::slot(slot("ads", 10_000).fallback("")),
                ],
            )
            .unwrap(),
        );

        let failure = composer(stub)
            .try_compose(template, CompositionRequest::default())
            .await
            .unwrap_err();
        assert_eq!(failure.slot, "main");
        assert!(failure.cause.contains("500"));

        // Let the runtime process the aborts.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leading_segments_stream_before_trailing_slot_finishes() {
        let stub = Stub::default()
            .reply("head", 20, Reply::Html("<head/>"))
            .reply("footer", 500, Reply::Html("<footer/>"));
        let template = Arc::new(
            Template::new(
                "page",
                "/page",
                vec![
                    Segment::slot(slot("head", 100).required(true)),
                    Segment::literal("<body>"),
                    Segment::slot(slot("footer", 1000).fallback("")),
                ],
            )
            .unwrap(),
        );

        let started = Instant::now();
        let mut stream = composer(stub)
            .try_compose(template, CompositionRequest::default())
            .await
            .unwrap();

        assert_eq!(stream.recv().await.unwrap(), Bytes::from_static(b"<head/>"));
        assert_eq!(stream.recv().await.unwrap(), Bytes::from_static(b"<body>"));
        assert_eq!(started.elapsed(), Duration::from_millis(20));

        assert_eq!(stream.recv().await.unwrap(), Bytes::from_static(b"<footer/>"));
        assert_eq!(started.elapsed(), Duration::from_millis(500));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_stream_cancels_pending_fetches() {
        let stub = Stub::default()
            .reply("a", 1, Reply::Html("<a/>"))
            .reply("slow", 5_000, Reply::Html("<slow/>"));
        let cancelled = Arc::clone(&stub.cancelled);
        let template = Arc::new(
            Template::new(
                "page",
                "/page",
                vec![
                    Segment::slot(slot("a", 100).required(true)),
                    Segment::slot(slot("slow", 10_000).fallback("")),
                ],
            )
            .unwrap(),
        );

        let mut stream = composer(stub)
            .try_compose(template, CompositionRequest::default())
            .await
            .unwrap();
        assert_eq!(stream.recv().await.unwrap(), Bytes::from_static(b"<a/>"));
        drop(stream);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn every_slot_is_fetched_once() {
        let stub = Stub::default()
            .reply("a", 1, Reply::Html("a"))
            .reply("b", 1, Reply::Html("b"));
        let started = Arc::clone(&stub.started);
        let template = Arc::new(
            Template::new(
                "page",
                "/page",
                vec![
                    Segment::slot(slot("a", 100).required(true)),
                    Segment::slot(slot("b", 100).fallback("")),
                ],
            )
            .unwrap(),
        );

        let composition = composer(stub)
            .compose(template, CompositionRequest::default())
            .await;
        assert_eq!(body_string(composition).await, "ab");
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn error_page_is_generic() {
        let page = std::str::from_utf8(&error_page(StatusCode::BadGateway)).unwrap().to_owned();
        assert!(page.contains("<h1>Bad Gateway</h1>"));
        assert!(page.starts_with("<!DOCTYPE html>"));
    }
}
