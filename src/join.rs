//! Join image poller
//!
//! The relay serves a small HTML snippet at `/api/qr` embedding an image
//! (`<img src='...'>`) that a second device scans to join. The reference is
//! refetched periodically and republished when it changes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};

/// Pull the single-quoted `src` attribute out of the snippet
pub fn extract_image_src(html: &str) -> Option<&str> {
    let start = html.find("src='")? + "src='".len();
    let len = html[start..].find('\'')?;
    let src = &html[start..start + len];
    (!src.is_empty()).then_some(src)
}

pub struct JoinImagePoller {
    client: reqwest::Client,
    url: String,
    refresh: Duration,
    events: Arc<EventBus>,
    current: watch::Sender<Option<String>>,
}

impl JoinImagePoller {
    pub fn new(url: impl Into<String>, refresh: Duration, events: Arc<EventBus>) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            refresh,
            events,
            current,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.current.subscribe()
    }

    pub fn current(&self) -> Option<String> {
        self.current.borrow().clone()
    }

    /// Fetch once; `Ok(true)` when the reference changed
    pub async fn refresh(&self) -> Result<bool> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(AppError::Internal(format!(
                "Join image endpoint returned {}",
                response.status()
            )));
        }
        let html = response.text().await?;
        let src = extract_image_src(&html)
            .ok_or_else(|| AppError::Internal("No image in join response".to_string()))?
            .to_string();
        Ok(self.apply(src))
    }

    fn apply(&self, src: String) -> bool {
        let changed = self.current.send_if_modified(|current| {
            if current.as_deref() == Some(src.as_str()) {
                false
            } else {
                *current = Some(src.clone());
                true
            }
        });
        if changed {
            info!("Join image updated");
            self.events.publish(SystemEvent::JoinImageUpdated { src });
        }
        changed
    }

    /// Poll until cancelled; failed fetches keep the last image
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.refresh.max(Duration::from_secs(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.refresh().await {
                        debug!("Join image refresh failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_src() {
        let html = "<img src='data:image/png;base64,iVBORw0KGgo=' alt='join'>";
        assert_eq!(
            extract_image_src(html),
            Some("data:image/png;base64,iVBORw0KGgo=")
        );
        assert_eq!(extract_image_src("<img src=''>"), None);
        assert_eq!(extract_image_src("<p>no image</p>"), None);
        assert_eq!(extract_image_src("<img src='unterminated"), None);
    }

    #[tokio::test]
    async fn test_publishes_only_on_change() {
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let poller = JoinImagePoller::new("http://127.0.0.1:9/api/qr", Duration::from_secs(60), events);

        assert!(poller.apply("a.png".to_string()));
        assert!(!poller.apply("a.png".to_string()));
        assert!(poller.apply("b.png".to_string()));
        assert_eq!(poller.current().as_deref(), Some("b.png"));

        let mut published = Vec::new();
        while let Ok(SystemEvent::JoinImageUpdated { src }) = rx.try_recv() {
            published.push(src);
        }
        assert_eq!(published, ["a.png", "b.png"]);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_previous() {
        let poller = JoinImagePoller::new(
            "http://127.0.0.1:9/api/qr",
            Duration::from_secs(60),
            Arc::new(EventBus::new()),
        );
        poller.apply("a.png".to_string());
        tokio_test::assert_err!(poller.refresh().await);
        assert_eq!(poller.current().as_deref(), Some("a.png"));
    }
}
