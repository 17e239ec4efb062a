use serde::{Deserialize, Serialize};

/// Lifecycle state of an upload task.
///
/// `Queued → Uploading → {Completed | Failed | Paused}`. `Failed` and
/// `Paused` may return to `Uploading`; `Completed` and `Cancelled` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Queued,
    Uploading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    /// Returns `true` if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        match (self, next) {
            (Queued, Uploading) => true,
            (Uploading, Completed | Failed | Paused) => true,
            (Failed, Uploading) => true,
            (Paused, Uploading) => true,
            // Anything not yet finished may be cancelled.
            (Queued | Uploading | Paused | Failed, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UploadStatus::Queued => "queued",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_status_serialization() {
        assert_eq!(
            serde_json::to_string(&UploadStatus::Uploading).unwrap(),
            "\"uploading\""
        );
        assert_eq!(
            serde_json::to_string(&UploadStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn legal_transitions() {
        use UploadStatus::*;
        assert!(Queued.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Completed));
        assert!(Uploading.can_transition_to(Failed));
        assert!(Uploading.can_transition_to(Paused));
        assert!(Failed.can_transition_to(Uploading));
        assert!(Paused.can_transition_to(Uploading));
    }

    #[test]
    fn illegal_transitions() {
        use UploadStatus::*;
        assert!(!Completed.can_transition_to(Uploading));
        assert!(!Cancelled.can_transition_to(Uploading));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Cancelled));
    }
}
