// keymux — error taxonomy and per-type retry strategy
//
// Two orthogonal axes: is the failure retryable, and is the credential at
// fault (exclude it from further attempts). The static table below drives
// the retry loop; `rate_limited` is the one entry overridden dynamically on
// the LLM route.

use std::fmt;

/// Classification of a failed upstream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    SocketHangup,
    Timeout,
    ServerError,
    RateLimited,
    ModelAtCapacity,
    ContextOverflow,
    ContextOverflowTransient,
    ConnectionRefused,
    DnsError,
    TlsError,
    AuthError,
    BrokenPipe,
    ConnectionAborted,
    StreamPrematureClose,
    HttpParseError,
    Aborted,
    Other,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::SocketHangup => "socket_hangup",
            ErrorType::Timeout => "timeout",
            ErrorType::ServerError => "server_error",
            ErrorType::RateLimited => "rate_limited",
            ErrorType::ModelAtCapacity => "model_at_capacity",
            ErrorType::ContextOverflow => "context_overflow",
            ErrorType::ContextOverflowTransient => "context_overflow_transient",
            ErrorType::ConnectionRefused => "connection_refused",
            ErrorType::DnsError => "dns_error",
            ErrorType::TlsError => "tls_error",
            ErrorType::AuthError => "auth_error",
            ErrorType::BrokenPipe => "broken_pipe",
            ErrorType::ConnectionAborted => "connection_aborted",
            ErrorType::StreamPrematureClose => "stream_premature_close",
            ErrorType::HttpParseError => "http_parse_error",
            ErrorType::Aborted => "aborted",
            ErrorType::Other => "other",
        }
    }

    /// Hangup-flavoured failures feed the connection health monitor.
    pub fn is_hangup(self) -> bool {
        matches!(
            self,
            ErrorType::SocketHangup | ErrorType::BrokenPipe | ErrorType::ConnectionAborted
        )
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the retry loop should do about a given error type.
#[derive(Debug, Clone, Copy)]
pub struct ErrorStrategy {
    pub should_retry: bool,
    pub exclude_key: bool,
    pub backoff_multiplier: f64,
    pub max_retries: u32,
    pub use_fresh_connection: bool,
}

impl ErrorStrategy {
    const fn new(
        should_retry: bool,
        exclude_key: bool,
        backoff_multiplier: f64,
        max_retries: u32,
        use_fresh_connection: bool,
    ) -> Self {
        Self {
            should_retry,
            exclude_key,
            backoff_multiplier,
            max_retries,
            use_fresh_connection,
        }
    }
}

/// Static strategy table. `rate_limited` is not retried here; the handler
/// overrides it dynamically when the router can still swap models.
pub fn strategy_for(error_type: ErrorType) -> ErrorStrategy {
    match error_type {
        ErrorType::SocketHangup => ErrorStrategy::new(true, false, 1.5, 3, true),
        ErrorType::Timeout => ErrorStrategy::new(true, true, 2.0, 2, false),
        ErrorType::ServerError => ErrorStrategy::new(true, true, 2.0, 3, false),
        ErrorType::RateLimited => ErrorStrategy::new(false, true, 1.0, 0, false),
        ErrorType::ModelAtCapacity => ErrorStrategy::new(true, false, 1.5, 4, false),
        ErrorType::ContextOverflow => ErrorStrategy::new(false, false, 1.0, 0, false),
        ErrorType::ContextOverflowTransient => ErrorStrategy::new(true, false, 2.0, 4, false),
        ErrorType::ConnectionRefused => ErrorStrategy::new(true, true, 2.0, 3, false),
        ErrorType::DnsError => ErrorStrategy::new(true, false, 2.0, 2, false),
        ErrorType::TlsError => ErrorStrategy::new(false, true, 1.0, 0, false),
        ErrorType::AuthError => ErrorStrategy::new(true, true, 1.0, 2, false),
        ErrorType::BrokenPipe => ErrorStrategy::new(true, false, 1.0, 3, true),
        ErrorType::ConnectionAborted => ErrorStrategy::new(true, false, 1.5, 3, true),
        ErrorType::StreamPrematureClose => ErrorStrategy::new(true, true, 2.0, 2, true),
        ErrorType::HttpParseError => ErrorStrategy::new(true, true, 2.0, 2, true),
        ErrorType::Aborted => ErrorStrategy::new(false, false, 1.0, 0, false),
        ErrorType::Other => ErrorStrategy::new(true, true, 2.0, 3, false),
    }
}

/// Walk a reqwest error (and its io source chain) into the taxonomy.
pub fn classify_reqwest(err: &reqwest::Error) -> ErrorType {
    if err.is_timeout() {
        return ErrorType::Timeout;
    }
    if err.is_decode() || err.is_body() {
        // Body died mid-stream or the framing was bad.
        if find_io_kind(err, std::io::ErrorKind::UnexpectedEof) {
            return ErrorType::StreamPrematureClose;
        }
        return ErrorType::HttpParseError;
    }
    if err.is_connect() {
        if let Some(kind) = io_kind(err) {
            match kind {
                std::io::ErrorKind::ConnectionRefused => return ErrorType::ConnectionRefused,
                std::io::ErrorKind::TimedOut => return ErrorType::Timeout,
                _ => {}
            }
        }
        let text = format!("{err:?}").to_ascii_lowercase();
        if text.contains("dns") || text.contains("resolve") {
            return ErrorType::DnsError;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return ErrorType::TlsError;
        }
        return ErrorType::ConnectionRefused;
    }
    if err.is_request() {
        if let Some(kind) = io_kind(err) {
            match kind {
                std::io::ErrorKind::BrokenPipe => return ErrorType::BrokenPipe,
                std::io::ErrorKind::ConnectionAborted => return ErrorType::ConnectionAborted,
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::UnexpectedEof => {
                    return ErrorType::SocketHangup
                }
                _ => {}
            }
        }
        let text = format!("{err:?}").to_ascii_lowercase();
        if text.contains("incompletemessage") || text.contains("connection closed") {
            return ErrorType::SocketHangup;
        }
    }
    ErrorType::Other
}

fn io_kind(err: &(dyn std::error::Error + 'static)) -> Option<std::io::ErrorKind> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = cause.source();
    }
    None
}

fn find_io_kind(err: &(dyn std::error::Error + 'static), kind: std::io::ErrorKind) -> bool {
    io_kind(err) == Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_statically_terminal() {
        let s = strategy_for(ErrorType::RateLimited);
        assert!(!s.should_retry);
        assert!(s.exclude_key);
        assert_eq!(s.max_retries, 0);
    }

    #[test]
    fn hangup_class_requests_fresh_connection() {
        for t in [
            ErrorType::SocketHangup,
            ErrorType::BrokenPipe,
            ErrorType::ConnectionAborted,
            ErrorType::StreamPrematureClose,
            ErrorType::HttpParseError,
        ] {
            assert!(strategy_for(t).use_fresh_connection, "{t} should bypass the pool");
        }
        assert!(!strategy_for(ErrorType::Timeout).use_fresh_connection);
    }

    #[test]
    fn hangups_do_not_blame_the_key() {
        for t in [
            ErrorType::SocketHangup,
            ErrorType::BrokenPipe,
            ErrorType::ConnectionAborted,
            ErrorType::DnsError,
        ] {
            assert!(!strategy_for(t).exclude_key, "{t} is not the key's fault");
        }
    }

    #[test]
    fn terminal_types_never_retry() {
        for t in [
            ErrorType::TlsError,
            ErrorType::ContextOverflow,
            ErrorType::Aborted,
        ] {
            assert!(!strategy_for(t).should_retry, "{t} must not retry");
        }
    }

    #[test]
    fn error_type_names_are_stable() {
        assert_eq!(ErrorType::StreamPrematureClose.as_str(), "stream_premature_close");
        assert_eq!(ErrorType::ModelAtCapacity.as_str(), "model_at_capacity");
        assert_eq!(ErrorType::ContextOverflowTransient.as_str(), "context_overflow_transient");
    }

    #[test]
    fn hangup_predicate_matches_socket_class() {
        assert!(ErrorType::SocketHangup.is_hangup());
        assert!(ErrorType::BrokenPipe.is_hangup());
        assert!(!ErrorType::Timeout.is_hangup());
        assert!(!ErrorType::ServerError.is_hangup());
    }
}
