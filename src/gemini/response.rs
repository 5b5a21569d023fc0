use std::io::Read;

/// Gemini response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    /// Request input. Meta is a user readable prompt.
    Input = 10,
    /// Request input that the client should not display onscreen.
    SensitiveInput = 11,
    /// Send data. Meta is the MIME type; a body follows.
    Success = 20,
    /// Redirect to the URL in meta.
    Redirect = 30,
    /// Permanent redirect to the URL in meta.
    RedirectPermanent = 31,
    /// An error occurred. Meta is a user readable error.
    TemporaryFailure = 40,
    /// Server is not available.
    ServerUnavailable = 41,
    /// Dynamic page generation error.
    CgiError = 42,
    /// Proxy request failed.
    ProxyError = 43,
    /// Rate limited. Meta is the number of seconds to wait.
    SlowDown = 44,
    /// An error occurred and retrying will not help.
    PermanentFailure = 50,
    /// File not found.
    NotFound = 51,
    /// File not found and will not be available again.
    Gone = 52,
    /// Server does not accept proxy requests.
    ProxyRequestRefused = 53,
    /// Malformed client request.
    BadRequest = 59,
    /// The client needs a certificate.
    CertificateRequired = 60,
    /// The client's certificate is not authorised.
    CertificateNotAuthorised = 61,
    /// The client's certificate is invalid.
    CertificateNotValid = 62,
}

impl ResponseCode {
    /// The two-digit number sent on the wire.
    pub fn value(self) -> u8 {
        self as u8
    }

    /// True for the 20-29 range, the only codes a body may follow.
    pub fn is_success(self) -> bool {
        (20..=29).contains(&(self as u8))
    }
}

/// Response body. Either held in memory or streamed from a reader until EOF.
pub enum Body {
    Bytes(Vec<u8>),
    Stream(Box<dyn Read + Send>),
}

/// A response the handler sends back: a code, a meta line and an optional
/// body. Only 2x responses may carry a body; the server refuses to transmit
/// anything else with one. This type does no I/O itself.
pub struct Response {
    code: ResponseCode,
    meta: String,
    body: Option<Body>,
}

impl Response {
    /// A response without a body.
    pub fn new(code: ResponseCode, meta: impl Into<String>) -> Response {
        Response {
            code,
            meta: meta.into(),
            body: None,
        }
    }

    /// A response with an in-memory body. Only meaningful with 2x codes.
    pub fn with_bytes(code: ResponseCode, meta: impl Into<String>, data: Vec<u8>) -> Response {
        Response {
            code,
            meta: meta.into(),
            body: Some(Body::Bytes(data)),
        }
    }

    /// A response with a UTF-8 text body. Only meaningful with 2x codes.
    pub fn with_text(code: ResponseCode, meta: impl Into<String>, text: &str) -> Response {
        Self::with_bytes(code, meta, text.as_bytes().to_vec())
    }

    /// A response whose body is streamed from a reader until EOF. Only
    /// meaningful with 2x codes.
    pub fn with_stream(
        code: ResponseCode,
        meta: impl Into<String>,
        stream: impl Read + Send + 'static,
    ) -> Response {
        Response {
            code,
            meta: meta.into(),
            body: Some(Body::Stream(Box::new(stream))),
        }
    }

    pub fn code(&self) -> ResponseCode {
        self.code
    }

    pub fn set_code(&mut self, code: ResponseCode) {
        self.code = code;
    }

    pub fn meta(&self) -> &str {
        &self.meta
    }

    pub fn set_meta(&mut self, meta: impl Into<String>) {
        self.meta = meta.into();
    }

    pub fn set_bytes(&mut self, data: Vec<u8>) {
        self.body = Some(Body::Bytes(data));
    }

    pub fn set_stream(&mut self, stream: impl Read + Send + 'static) {
        self.body = Some(Body::Stream(Box::new(stream)));
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn clear_body(&mut self) {
        self.body = None;
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub(crate) fn into_parts(self) -> (ResponseCode, String, Option<Body>) {
        (self.code, self.meta, self.body)
    }
}
