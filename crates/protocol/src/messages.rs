use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Signing endpoint
// ---------------------------------------------------------------------------

/// Query string of `GET /sign`.
///
/// `static` is only sent when set, matching what the backend expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignQuery {
    #[serde(rename = "file-name")]
    pub file_name: String,
    #[serde(rename = "file-type")]
    pub file_type: String,
    #[serde(rename = "folder-name")]
    pub folder_name: String,
    #[serde(rename = "static", default, skip_serializing_if = "is_false")]
    pub is_static: bool,
}

/// Body returned by `GET /sign`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignResponse {
    /// Short-lived, pre-authorized write URL.
    pub signed_request: String,
    /// Permanent public URL of the object once written.
    pub url: String,
}

// ---------------------------------------------------------------------------
// Deletion endpoint
// ---------------------------------------------------------------------------

/// Body of `POST /delete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub folder: String,
    pub filename: String,
    #[serde(rename = "static", default)]
    pub is_static: bool,
}

// ---------------------------------------------------------------------------
// Record update
// ---------------------------------------------------------------------------

/// Payload handed to the remote record updater after an upload completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordUpdate {
    /// Identity of the task that produced the object.
    pub task_id: String,
    /// Public URL of the uploaded object (cache-busted for static assets).
    pub public_url: String,
    /// Caller-supplied metadata, forwarded untouched.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_query_omits_static_when_unset() {
        let q = SignQuery {
            file_name: "u1-round-7.mp4".into(),
            file_type: "video/mp4".into(),
            folder_name: "Videos".into(),
            is_static: false,
        };
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["file-name"], "u1-round-7.mp4");
        assert_eq!(json["folder-name"], "Videos");
        assert!(json.get("static").is_none());
    }

    #[test]
    fn sign_query_includes_static_when_set() {
        let q = SignQuery {
            file_name: "u1-avatar-1".into(),
            file_type: "image/jpeg".into(),
            folder_name: "ProfilePics".into(),
            is_static: true,
        };
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["static"], true);
    }

    #[test]
    fn sign_response_field_names() {
        let json = r#"{"signedRequest":"https://bucket/put?sig=abc","url":"https://cdn/Videos/a.mp4"}"#;
        let resp: SignResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.signed_request, "https://bucket/put?sig=abc");
        assert_eq!(resp.url, "https://cdn/Videos/a.mp4");
    }

    #[test]
    fn sign_response_missing_field_is_error() {
        let json = r#"{"url":"https://cdn/Videos/a.mp4"}"#;
        assert!(serde_json::from_str::<SignResponse>(json).is_err());
    }

    #[test]
    fn delete_request_uses_static_key() {
        let req = DeleteRequest {
            folder: "Videos".into(),
            filename: "m1-round.mp4".into(),
            is_static: false,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"static\":false"));
        assert!(json.contains("\"filename\":\"m1-round.mp4\""));
    }

    #[test]
    fn record_update_omits_null_metadata() {
        let update = RecordUpdate {
            task_id: "Videos/a".into(),
            public_url: "https://cdn/Videos/a".into(),
            metadata: serde_json::Value::Null,
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("publicUrl"));
        assert!(!json.contains("metadata"));
    }
}
