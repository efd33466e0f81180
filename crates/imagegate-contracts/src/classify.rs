//! Maps raw provider and I/O failures onto [`ClassifiedError`].
//!
//! Status codes win over network codes when both are present. Anything not in
//! the table is `Unknown` and is never retried, since an unrecognized failure
//! may still be billed by the vendor.

use std::io;
use std::time::Duration;

use crate::errors::{truncate_text, ClassifiedError, ErrorKind, NetworkCode, RawProviderError};

const DETAIL_MAX_CHARS: usize = 512;

pub fn classify(raw: &RawProviderError, operation: &str) -> ClassifiedError {
    let provider = raw.provider.as_str();
    let classified = match (raw.status, raw.network.as_ref()) {
        (Some(401 | 403), _) => ClassifiedError::permanent(format!(
            "Authorization failed while {operation}. Check the API key configured for {provider} and try again."
        )),
        (Some(400), _) => ClassifiedError::permanent(format!(
            "{provider} rejected the request while {operation}. Adjust the prompt and try again."
        )),
        (Some(429), _) => rate_limited(raw, operation),
        (Some(500 | 502 | 503), _) => ClassifiedError::new(
            ErrorKind::Transient,
            format!(
                "{provider} is temporarily unavailable while {operation}. Try again in a few moments."
            ),
        ),
        (Some(_), _) => ClassifiedError::unknown(format!(
            "Unexpected response from {provider} while {operation}."
        )),
        (None, Some(NetworkCode::TimedOut)) => ClassifiedError::new(
            ErrorKind::Transient,
            format!(
                "Network timeout while {operation}. Check your internet connection and try again."
            ),
        ),
        (None, Some(NetworkCode::ConnectionRefused | NetworkCode::ConnectionReset)) => {
            ClassifiedError::new(
                ErrorKind::Transient,
                format!(
                    "Network error while {operation}. Check your internet connection and try again."
                ),
            )
        }
        (None, Some(NetworkCode::DnsFailure)) => ClassifiedError::new(
            ErrorKind::Transient,
            format!(
                "Network error while {operation}: could not resolve the {provider} host. Check your internet connection and try again."
            ),
        ),
        (None, Some(NetworkCode::Other(code))) => ClassifiedError::unknown(format!(
            "Unexpected network error ({code}) while {operation}."
        )),
        (None, None) => ClassifiedError::unknown(format!(
            "Unexpected error from {provider} while {operation}."
        )),
    };
    classified
        .with_provider(provider)
        .with_detail(truncate_text(&raw.message, DETAIL_MAX_CHARS))
}

fn rate_limited(raw: &RawProviderError, operation: &str) -> ClassifiedError {
    let provider = raw.provider.as_str();
    // The field is public, so a hint may not have passed through
    // `with_retry_after`; out-of-range values are dropped here.
    let retry_after = raw
        .retry_after_secs
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
    let message = match retry_after.map(|delay| delay.as_secs_f64()) {
        Some(secs) => format!(
            "Rate limited by {provider} while {operation}. The provider asked to wait {secs:.0}s before trying again."
        ),
        None => format!(
            "Rate limited by {provider} while {operation}. Wait a moment and try again."
        ),
    };
    let mut classified = ClassifiedError::new(ErrorKind::RateLimited, message);
    classified.retry_after = retry_after;
    classified
}

/// Error for an attempt that outlived its deadline.
pub fn timeout_error(provider: &str, deadline: Duration, operation: &str) -> ClassifiedError {
    ClassifiedError::new(
        ErrorKind::Timeout,
        format!(
            "{provider} did not respond within {:.0}s while {operation}. Try again or choose a different provider.",
            deadline.as_secs_f64()
        ),
    )
    .with_provider(provider)
}

/// Classifies a local filesystem failure (output directory, temp files).
pub fn classify_io(err: &io::Error, operation: &str) -> ClassifiedError {
    let classified = match err.kind() {
        io::ErrorKind::PermissionDenied => ClassifiedError::permanent(format!(
            "Permission denied while {operation}. Choose a writable output directory and try again."
        )),
        io::ErrorKind::ReadOnlyFilesystem => ClassifiedError::permanent(format!(
            "The output location is read-only while {operation}. Choose a writable output directory and try again."
        )),
        io::ErrorKind::StorageFull => ClassifiedError::permanent(format!(
            "The disk is full while {operation}. Free some space and try again."
        )),
        _ => ClassifiedError::unknown(format!("Unexpected file system error while {operation}.")),
    };
    classified.with_detail(err.to_string())
}

/// Classifies an `anyhow` chain by looking for the first `io::Error` in it.
pub fn classify_anyhow(err: &anyhow::Error, operation: &str) -> ClassifiedError {
    if let Some(io_err) = err.chain().find_map(|cause| cause.downcast_ref::<io::Error>()) {
        return classify_io(io_err, operation).with_detail(format!("{err:#}"));
    }
    ClassifiedError::unknown(format!("Unexpected error while {operation}."))
        .with_detail(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use anyhow::Context;

    use super::{classify, classify_anyhow, classify_io, timeout_error};
    use crate::errors::{ErrorKind, NetworkCode, RawProviderError};

    const OP: &str = "generating the image";

    fn status(code: u16) -> RawProviderError {
        RawProviderError::http("openai", code, format!("{{\"error\":\"{code}\"}}"))
    }

    fn network(code: NetworkCode) -> RawProviderError {
        RawProviderError::network("openai", code, "socket failure")
    }

    #[test]
    fn status_table_is_exact() {
        for code in [400, 401, 403] {
            assert_eq!(classify(&status(code), OP).kind, ErrorKind::Permanent, "{code}");
        }
        assert_eq!(classify(&status(429), OP).kind, ErrorKind::RateLimited);
        for code in [500, 502, 503] {
            assert_eq!(classify(&status(code), OP).kind, ErrorKind::Transient, "{code}");
        }
        for code in [404, 409, 418, 501, 504] {
            let classified = classify(&status(code), OP);
            assert_eq!(classified.kind, ErrorKind::Unknown, "{code}");
            assert!(!classified.user_message.contains(&code.to_string()), "{code}");
            assert!(classified.detail.as_deref().unwrap_or_default().contains(&code.to_string()));
        }
    }

    #[test]
    fn network_table_is_exact() {
        for code in [
            NetworkCode::TimedOut,
            NetworkCode::ConnectionRefused,
            NetworkCode::ConnectionReset,
            NetworkCode::DnsFailure,
        ] {
            assert_eq!(classify(&network(code.clone()), OP).kind, ErrorKind::Transient, "{code:?}");
        }
        assert_eq!(
            classify(&network(NetworkCode::Other("EPROTO".to_string())), OP).kind,
            ErrorKind::Unknown
        );
        assert_eq!(
            classify(&RawProviderError::other("openai", "weird"), OP).kind,
            ErrorKind::Unknown
        );
    }

    #[test]
    fn status_wins_over_network_code() {
        let mut raw = status(401);
        raw.network = Some(NetworkCode::ConnectionReset);
        assert_eq!(classify(&raw, OP).kind, ErrorKind::Permanent);
    }

    #[test]
    fn rate_limit_carries_vendor_hint_when_present() {
        let hinted = classify(&status(429).with_retry_after(Some(7.0)), OP);
        assert_eq!(hinted.retry_after, Some(Duration::from_secs(7)));
        assert!(hinted.user_message.contains("7s"));

        let bare = classify(&status(429), OP);
        assert_eq!(bare.retry_after, None);
    }

    #[test]
    fn unrepresentable_rate_limit_hint_is_ignored() {
        let mut raw = status(429);
        raw.retry_after_secs = Some(1e20);
        let classified = classify(&raw, OP);
        assert_eq!(classified.kind, ErrorKind::RateLimited);
        assert_eq!(classified.retry_after, None);

        let capped = classify(&status(429).with_retry_after(Some(1e20)), OP);
        assert_eq!(capped.retry_after, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn messages_are_actionable_and_hide_vendor_bodies() {
        let auth = classify(&status(401), OP);
        assert!(auth.user_message.contains("Authorization failed"));
        assert!(auth.user_message.contains("API key"));
        assert!(!auth.user_message.contains("401"));
        assert!(auth.detail.as_deref().unwrap_or_default().contains("401"));

        let timeout = classify(&network(NetworkCode::TimedOut), OP);
        assert_eq!(
            timeout.user_message,
            "Network timeout while generating the image. Check your internet connection and try again."
        );
        assert_eq!(timeout.provider.as_deref(), Some("openai"));
    }

    #[test]
    fn deadline_error_is_timeout_kind() {
        let err = timeout_error("stability", Duration::from_secs(60), OP);
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.is_retryable());
        assert!(err.user_message.contains("60s"));
    }

    #[test]
    fn io_errors_split_permanent_and_unknown() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(classify_io(&denied, "saving output").kind, ErrorKind::Permanent);

        let other = io::Error::new(io::ErrorKind::Other, "boom");
        assert_eq!(classify_io(&other, "saving output").kind, ErrorKind::Unknown);
    }

    #[test]
    fn anyhow_chain_is_searched_for_io_errors() {
        let err = Err::<(), _>(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
            .context("failed to create /out")
            .unwrap_err();
        let classified = classify_anyhow(&err, "saving output");
        assert_eq!(classified.kind, ErrorKind::Permanent);
        assert!(classified.detail.as_deref().unwrap_or_default().contains("/out"));
    }
}
