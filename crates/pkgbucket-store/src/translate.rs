//! Classification of native object-store failures into [`StoreError`] kinds.

use crate::StoreError;
use pkgbucket_remote::BackendError;

/// Map a native backend failure to a domain error.
///
/// The native code decides first; a response with no code at all (metadata-only
/// requests have no body to carry one) falls back to its HTTP status.
pub fn convert_backend_error(err: BackendError) -> StoreError {
    match err.code.as_deref() {
        Some("NoSuchKey" | "NotFound") => StoreError::not_found(),
        Some("StreamContentLengthMismatch") => StoreError::internal("content length mismatch"),
        Some("RequestAbortedError") => StoreError::aborted(),
        None if err.status == Some(404) => StoreError::not_found(),
        _ => {
            let status = err.status.unwrap_or(500);
            let message = if err.message.is_empty() {
                "unknown error".to_owned()
            } else {
                err.message
            };
            StoreError::Generic { status, message }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_such_key_is_not_found() {
        let e = convert_backend_error(BackendError::no_such_key("a/package.json"));
        assert!(e.is_not_found());
        assert_eq!(e.status(), 404);
    }

    #[test]
    fn not_found_code_is_not_found() {
        let e = convert_backend_error(BackendError::new(Some("NotFound"), Some(404), ""));
        assert!(e.is_not_found());
    }

    #[test]
    fn bare_404_is_not_found() {
        let e = convert_backend_error(BackendError::new(None, Some(404), "Not Found"));
        assert!(e.is_not_found());
    }

    #[test]
    fn length_mismatch_is_internal() {
        let e = convert_backend_error(BackendError::new(
            Some("StreamContentLengthMismatch"),
            None,
            "short body",
        ));
        assert_eq!(e.status(), 500);
        assert!(e.to_string().contains("content length mismatch"));
    }

    #[test]
    fn aborted_is_internal() {
        let e = convert_backend_error(BackendError::aborted());
        assert_eq!(e.status(), 500);
        assert!(e.to_string().contains("request aborted"));
    }

    #[test]
    fn unknown_code_keeps_status_and_message() {
        let e = convert_backend_error(BackendError::new(
            Some("AccessDenied"),
            Some(403),
            "Access Denied",
        ));
        match e {
            StoreError::Generic { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "Access Denied");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_status_and_message_get_defaults() {
        let e = convert_backend_error(BackendError::new(Some("Weird"), None, ""));
        match e {
            StoreError::Generic { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "unknown error");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
