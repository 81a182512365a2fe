use serde::Serialize;

use crate::util::ServerId;

/// Body of every control endpoint (`/add`, `/remove`, `/set`).
///
/// Wire shape:
///
/// ```text
/// {"success":true,"result":[...]}
/// {"success":false,"message":"...","result":[...]}
/// ```
///
/// `result` always carries the current state (the tracked id list or
/// the effective interval), also on failure, so a caller can resync
/// without a second request.
///
/// DESIGN NOTES:
/// - `message` is omitted entirely on success.
/// - Field order is part of the wire format consumers already parse.
///
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ControlResponse<T> {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    pub result: T,
}

impl<T> ControlResponse<T> {
    pub fn ok(result: T) -> Self {
        Self {
            success: true,
            message: None,
            result,
        }
    }

    pub fn failed(message: impl Into<String>, result: T) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            result,
        }
    }
}

// ------------------------------------------------------------
// Concrete responses
// ------------------------------------------------------------

/// `/add` and `/remove`: the tracked server ids after the operation.
pub type ServerListResponse = ControlResponse<Vec<ServerId>>;

/// `/set`: the poll interval in seconds.
pub type IntervalResponse = ControlResponse<u64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_omits_message() {
        let body = serde_json::to_string(&IntervalResponse::ok(30)).unwrap();
        assert_eq!(body, r#"{"success":true,"result":30}"#);
    }

    #[test]
    fn failure_carries_message_and_state() {
        let ids = vec![ServerId::parse("10.0.0.5:9100").unwrap()];
        let body =
            serde_json::to_string(&ServerListResponse::failed("Server or port is not provided", ids))
                .unwrap();
        assert_eq!(
            body,
            r#"{"success":false,"message":"Server or port is not provided","result":["10.0.0.5:9100"]}"#
        );
    }
}
