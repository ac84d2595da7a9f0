//! HTTP/1.1 protocol types, parsing and the response sink.
//!
//! This module provides the core HTTP primitives:
//! [`Method`], [`StatusCode`], [`Headers`], [`Request`], [`Response`], and the
//! incremental [`ResponseWriter`] handed to handlers.

use std::fmt;

pub mod headers;
pub mod request;
pub mod response;
pub mod writer;

pub use headers::Headers;
pub use request::Request;
pub use response::Response;
pub use writer::{ResponseWriter, SharedWriter, WriteError};

macro_rules! status_codes {
    ($($(#[$doc:meta])* $name:ident = $code:literal => $reason:literal,)+) => {
        /// An HTTP response status code.
        ///
        /// # Examples
        ///
        /// ```
        /// use switchyard::http::StatusCode;
        ///
        /// let status = StatusCode::Ok;
        /// assert_eq!(status.as_u16(), 200);
        /// assert_eq!(status.canonical_reason(), "OK");
        /// assert!(status.is_success());
        /// ```
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u16)]
        pub enum StatusCode {
            $($(#[$doc])* $name = $code,)+
        }

        impl StatusCode {
            /// Returns the canonical reason phrase for this status code.
            pub fn canonical_reason(self) -> &'static str {
                match self {
                    $(Self::$name => $reason,)+
                }
            }

            /// Looks up the status code for a numeric value, if it is a registered one.
            pub fn from_u16(code: u16) -> Option<Self> {
                match code {
                    $($code => Some(Self::$name),)+
                    _ => None,
                }
            }
        }
    };
}

status_codes! {
    // 1xx Informational
    Continue = 100 => "Continue",
    SwitchingProtocols = 101 => "Switching Protocols",
    Processing = 102 => "Processing",
    EarlyHints = 103 => "Early Hints",

    // 2xx Success
    Ok = 200 => "OK",
    Created = 201 => "Created",
    Accepted = 202 => "Accepted",
    NonAuthoritativeInformation = 203 => "Non-Authoritative Information",
    NoContent = 204 => "No Content",
    ResetContent = 205 => "Reset Content",
    PartialContent = 206 => "Partial Content",
    MultiStatus = 207 => "Multi-Status",
    AlreadyReported = 208 => "Already Reported",
    ImUsed = 226 => "IM Used",

    // 3xx Redirection
    MultipleChoices = 300 => "Multiple Choices",
    MovedPermanently = 301 => "Moved Permanently",
    Found = 302 => "Found",
    SeeOther = 303 => "See Other",
    NotModified = 304 => "Not Modified",
    UseProxy = 305 => "Use Proxy",
    TemporaryRedirect = 307 => "Temporary Redirect",
    PermanentRedirect = 308 => "Permanent Redirect",

    // 4xx Client Error
    BadRequest = 400 => "Bad Request",
    Unauthorized = 401 => "Unauthorized",
    PaymentRequired = 402 => "Payment Required",
    Forbidden = 403 => "Forbidden",
    NotFound = 404 => "Not Found",
    MethodNotAllowed = 405 => "Method Not Allowed",
    NotAcceptable = 406 => "Not Acceptable",
    ProxyAuthenticationRequired = 407 => "Proxy Authentication Required",
    RequestTimeout = 408 => "Request Timeout",
    Conflict = 409 => "Conflict",
    Gone = 410 => "Gone",
    LengthRequired = 411 => "Length Required",
    PreconditionFailed = 412 => "Precondition Failed",
    PayloadTooLarge = 413 => "Payload Too Large",
    UriTooLong = 414 => "URI Too Long",
    UnsupportedMediaType = 415 => "Unsupported Media Type",
    RangeNotSatisfiable = 416 => "Range Not Satisfiable",
    ExpectationFailed = 417 => "Expectation Failed",
    ImATeapot = 418 => "I'm a teapot",
    MisdirectedRequest = 421 => "Misdirected Request",
    UnprocessableEntity = 422 => "Unprocessable Entity",
    Locked = 423 => "Locked",
    FailedDependency = 424 => "Failed Dependency",
    TooEarly = 425 => "Too Early",
    UpgradeRequired = 426 => "Upgrade Required",
    PreconditionRequired = 428 => "Precondition Required",
    TooManyRequests = 429 => "Too Many Requests",
    RequestHeaderFieldsTooLarge = 431 => "Request Header Fields Too Large",
    UnavailableForLegalReasons = 451 => "Unavailable For Legal Reasons",

    // 5xx Server Error
    InternalServerError = 500 => "Internal Server Error",
    NotImplemented = 501 => "Not Implemented",
    BadGateway = 502 => "Bad Gateway",
    ServiceUnavailable = 503 => "Service Unavailable",
    GatewayTimeout = 504 => "Gateway Timeout",
    HttpVersionNotSupported = 505 => "HTTP Version Not Supported",
    VariantAlsoNegotiates = 506 => "Variant Also Negotiates",
    InsufficientStorage = 507 => "Insufficient Storage",
    LoopDetected = 508 => "Loop Detected",
    NotExtended = 510 => "Not Extended",
    NetworkAuthenticationRequired = 511 => "Network Authentication Required",
}

impl StatusCode {
    /// Returns the numeric status code as a `u16`.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns `true` for 2xx codes.
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.as_u16())
    }

    /// Returns `true` for 4xx and 5xx codes.
    pub fn is_error(self) -> bool {
        self.as_u16() >= 400
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> u16 {
        code.as_u16()
    }
}

/// An HTTP request method.
///
/// Standard methods are represented as unit variants for zero-cost comparison.
/// Non-standard methods are captured in the `Custom` variant.
///
/// # Examples
///
/// ```
/// use switchyard::http::Method;
///
/// let method: Method = "GET".parse().unwrap();
/// assert_eq!(method, Method::Get);
/// assert_eq!(method.as_str(), "GET");
/// assert!(method.is_safe());
/// assert!(method.is_idempotent());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET: retrieve a representation of the target resource.
    Get,
    /// POST: perform resource-specific processing on the request payload.
    Post,
    /// PUT: replace the target resource's current representation.
    Put,
    /// DELETE: remove the association between the target resource and its functionality.
    Delete,
    /// HEAD: identical to GET but without a response body.
    Head,
    /// OPTIONS: describe the communication options for the target resource.
    Options,
    /// PATCH: apply partial modifications to a resource.
    Patch,
    /// CONNECT: establish a tunnel to the server identified by the target resource.
    Connect,
    /// TRACE: perform a message loop-back test along the path to the target resource.
    Trace,
    /// A non-standard extension method.
    Custom(String),
}

impl Method {
    /// Returns the method as a string slice.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Connect => "CONNECT",
            Self::Trace => "TRACE",
            Self::Custom(s) => s.as_str(),
        }
    }

    /// Returns `true` if this method is considered "safe" (no side effects per RFC 9110 §9.2.1).
    ///
    /// Safe methods: GET, HEAD, OPTIONS, TRACE.
    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Options | Self::Trace)
    }

    /// Returns `true` if this method is idempotent (RFC 9110 §9.2.2).
    ///
    /// Idempotent methods: GET, HEAD, PUT, DELETE, OPTIONS, TRACE.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Self::Get | Self::Head | Self::Put | Self::Delete | Self::Options | Self::Trace
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            "CONNECT" => Self::Connect,
            "TRACE" => Self::Trace,
            other => Self::Custom(other.to_owned()),
        })
    }
}

impl AsRef<str> for Method {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
