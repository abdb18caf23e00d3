//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses and
//! serializing them to the wire. A response body is either buffered in full
//! (sent with `Content-Length`) or a [`ByteStream`] whose chunks are written
//! as they arrive (sent with `Transfer-Encoding: chunked`).

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;

use super::{Headers, StatusCode};

/// Receiving half of a streamed response body.
///
/// Each received [`Bytes`] is written to the client in order; the body ends
/// when every sender has been dropped.
pub type ByteStream = mpsc::Receiver<Bytes>;

/// A response body.
#[derive(Debug)]
pub enum Body {
    /// The whole body is known up front.
    Full(Bytes),
    /// The body is produced incrementally.
    Stream(ByteStream),
}

impl Body {
    /// An empty, fully buffered body.
    pub fn empty() -> Self {
        Self::Full(Bytes::new())
    }

    /// Drains the body into a single buffer.
    ///
    /// For streamed bodies this waits until the producing side finishes.
    pub async fn collect(self) -> Bytes {
        match self {
            Self::Full(bytes) => bytes,
            Self::Stream(mut rx) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = rx.recv().await {
                    buf.put(chunk);
                }
                buf.freeze()
            }
        }
    }
}

/// How a body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `Content-Length` for full bodies.
    Length,
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// No length information; the body ends when the connection closes.
    Close,
}

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use tapestry::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "text/html; charset=utf-8")
///     .body("<nav/>");
///
/// let (head, stream) = response.into_wire(false);
/// let text = std::str::from_utf8(&head).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 6\r\n"));
/// assert!(stream.is_none());
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::empty(),
            keep_alive: true,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets a fully buffered body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Full(Bytes::from(body.into()));
        self
    }

    /// Sets a fully buffered body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Sets a streamed body. Headers are final once the response is handed to
    /// the server; only the body continues to flow afterwards.
    #[must_use]
    pub fn body_stream(mut self, stream: ByteStream) -> Self {
        self.body = Body::Stream(stream);
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers set so far.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns `true` if the body is streamed.
    pub fn is_streaming(&self) -> bool {
        matches!(self.body, Body::Stream(_))
    }

    /// Consumes the response and returns its body.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Returns `true` if the connection may be reused after this response.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Serializes the status line, headers and (for full bodies) the body.
    ///
    /// Streamed bodies are returned separately so the caller can forward them
    /// chunk by chunk. `http10` selects close-delimited framing for streams,
    /// since HTTP/1.0 peers do not understand chunked encoding; that also
    /// forces `Connection: close`.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if the body is non-empty or
    ///   streamed and no `Content-Type` header was set.
    /// - `Content-Length`, `Transfer-Encoding: chunked`, or nothing, per [`Framing`].
    /// - `Connection: keep-alive` or `Connection: close`.
    pub fn into_wire(mut self, http10: bool) -> (BytesMut, Option<ByteStream>) {
        let (framing, full, stream) = match self.body {
            Body::Full(bytes) => (Framing::Length, bytes, None),
            Body::Stream(rx) if http10 => (Framing::Close, Bytes::new(), Some(rx)),
            Body::Stream(rx) => (Framing::Chunked, Bytes::new(), Some(rx)),
        };
        if framing == Framing::Close {
            self.keep_alive = false;
        }

        if (!full.is_empty() || stream.is_some()) && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.insert("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + full.len();
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        match framing {
            Framing::Length => {
                buf.put(format!("Content-Length: {}\r\n", full.len()).as_bytes());
            }
            Framing::Chunked => buf.put(&b"Transfer-Encoding: chunked\r\n"[..]),
            Framing::Close => {}
        }

        buf.put(&b"\r\n"[..]);

        if !full.is_empty() {
            buf.put(full);
        }

        (buf, stream)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

/// Frames one chunk for `Transfer-Encoding: chunked`.
///
/// Empty input produces an empty buffer, since a zero-length chunk would
/// terminate the body early.
pub fn encode_chunk(data: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(data.len() + 12);
    if data.is_empty() {
        return buf;
    }
    buf.put(format!("{:x}\r\n", data.len()).as_bytes());
    buf.put(data);
    buf.put(&b"\r\n"[..]);
    buf
}

/// The terminating zero-length chunk of a chunked body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";
