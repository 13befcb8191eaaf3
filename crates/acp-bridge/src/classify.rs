// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pluggable RPC-error classification into the canonical error taxonomy.

use swb_core::ErrorCode;

use crate::codec::RpcError;

/// Maps a backend RPC error onto the canonical [`ErrorCode`] taxonomy.
///
/// One classifier per adapter profile; the wire protocols agree but the
/// vendors' error conventions do not.
pub trait ErrorClassifier: Send + Sync {
    /// Classify an RPC error object.
    fn classify(&self, error: &RpcError) -> ErrorCode;
}

fn classify_by_message(message: &str) -> Option<ErrorCode> {
    let lower = message.to_ascii_lowercase();
    if lower.contains("context") && (lower.contains("overflow") || lower.contains("length")) {
        Some(ErrorCode::ContextOverflow)
    } else if lower.contains("rate limit") || lower.contains("too many requests") {
        Some(ErrorCode::RateLimit)
    } else if lower.contains("unauthorized") || lower.contains("authentication") {
        Some(ErrorCode::ProviderAuth)
    } else if lower.contains("abort") || lower.contains("cancel") {
        Some(ErrorCode::Aborted)
    } else if lower.contains("max turns") {
        Some(ErrorCode::MaxTurns)
    } else if lower.contains("budget") {
        Some(ErrorCode::MaxBudget)
    } else {
        None
    }
}

/// Classifier for the reference ACP agent.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcpClassifier;

impl ErrorClassifier for AcpClassifier {
    fn classify(&self, error: &RpcError) -> ErrorCode {
        match error.code {
            401 => ErrorCode::ProviderAuth,
            429 => ErrorCode::RateLimit,
            // Server-defined range: trust the message.
            -32099..=-32000 => {
                classify_by_message(&error.message).unwrap_or(ErrorCode::ApiError)
            }
            _ => classify_by_message(&error.message).unwrap_or(ErrorCode::Unknown),
        }
    }
}

/// Classifier for the Gemini CLI profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiClassifier;

impl ErrorClassifier for GeminiClassifier {
    fn classify(&self, error: &RpcError) -> ErrorCode {
        match error.code {
            401 | 403 => ErrorCode::ProviderAuth,
            429 => ErrorCode::RateLimit,
            // RESOURCE_EXHAUSTED surfaces as 8 from some gRPC bridges.
            8 => ErrorCode::RateLimit,
            _ => classify_by_message(&error.message).unwrap_or(ErrorCode::ApiError),
        }
    }
}

/// Classifier for the Codex CLI profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodexClassifier;

impl ErrorClassifier for CodexClassifier {
    fn classify(&self, error: &RpcError) -> ErrorCode {
        match error.code {
            401 => ErrorCode::ProviderAuth,
            429 => ErrorCode::RateLimit,
            _ => {
                let lower = error.message.to_ascii_lowercase();
                if lower.contains("stream disconnected") {
                    ErrorCode::ApiError
                } else if lower.contains("output limit") {
                    ErrorCode::OutputLength
                } else {
                    classify_by_message(&error.message).unwrap_or(ErrorCode::Unknown)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(code: i64, message: &str) -> RpcError {
        RpcError {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[test]
    fn acp_maps_auth_and_rate_codes() {
        let c = AcpClassifier;
        assert_eq!(c.classify(&err(401, "nope")), ErrorCode::ProviderAuth);
        assert_eq!(c.classify(&err(429, "slow down")), ErrorCode::RateLimit);
    }

    #[test]
    fn acp_reads_server_defined_messages() {
        let c = AcpClassifier;
        assert_eq!(
            c.classify(&err(-32000, "context length exceeded")),
            ErrorCode::ContextOverflow
        );
        assert_eq!(c.classify(&err(-32001, "boom")), ErrorCode::ApiError);
    }

    #[test]
    fn unknown_falls_through() {
        let c = AcpClassifier;
        assert_eq!(c.classify(&err(5, "???")), ErrorCode::Unknown);
    }

    #[test]
    fn gemini_treats_resource_exhausted_as_rate_limit() {
        let c = GeminiClassifier;
        assert_eq!(c.classify(&err(8, "RESOURCE_EXHAUSTED")), ErrorCode::RateLimit);
        assert_eq!(c.classify(&err(403, "forbidden")), ErrorCode::ProviderAuth);
    }

    #[test]
    fn codex_output_limit() {
        let c = CodexClassifier;
        assert_eq!(
            c.classify(&err(-1, "output limit reached")),
            ErrorCode::OutputLength
        );
    }

    #[test]
    fn aborted_detected_from_message() {
        let c = AcpClassifier;
        assert_eq!(c.classify(&err(0, "request was cancelled")), ErrorCode::Aborted);
    }
}
