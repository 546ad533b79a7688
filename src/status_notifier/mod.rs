use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Idle,
    Recording,
    Responding,
}

impl Default for AppStatus {
    fn default() -> Self {
        Self::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeVariant {
    Default,
    Destructive,
}

/// A transient user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub variant: NoticeVariant,
    pub title: String,
    pub description: String,
}

impl Notice {
    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            variant: NoticeVariant::Destructive,
            title: title.into(),
            description: description.into(),
        }
    }

    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            variant: NoticeVariant::Default,
            title: title.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct StatusNotifier {
    current: AppStatus,
    notices: VecDeque<Notice>,
}

impl StatusNotifier {
    pub fn new() -> Self {
        Self {
            current: AppStatus::Idle,
            notices: VecDeque::new(),
        }
    }

    pub fn current(&self) -> AppStatus {
        self.current
    }

    pub fn set(&mut self, status: AppStatus) {
        if self.current != status {
            debug!(from = ?self.current, to = ?status, "status changed");
        }
        self.current = status;
    }

    pub fn notify(&mut self, notice: Notice) {
        if notice.variant == NoticeVariant::Destructive {
            warn!(title = %notice.title, description = %notice.description, "error notice raised");
        } else {
            debug!(title = %notice.title, "notice raised");
        }
        self.notices.push_back(notice);
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.notices.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notices_drain_in_arrival_order() {
        let mut notifier = StatusNotifier::new();
        notifier.notify(Notice::error("first", "a"));
        notifier.notify(Notice::info("second", "b"));

        let drained = notifier.take_notices();

        assert_eq!(
            drained.iter().map(|n| n.title.as_str()).collect::<Vec<_>>(),
            vec!["first", "second"]
        );
        assert!(notifier.take_notices().is_empty());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&AppStatus::Responding).expect("status should serialize"),
            "\"responding\""
        );
    }
}
