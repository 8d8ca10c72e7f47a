//! Notification delivery: the [`Notifier`] transport boundary, the Telegram
//! implementation, and the [`Dispatcher`] that paces and retries sends.
use crate::config;
use crate::model::Listing;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use teloxide::payloads::{SendMessageSetters, SendPhotoSetters};
use teloxide::prelude::*;
use teloxide::types::{InputFile, ParseMode};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("telegram send failed: {0}")]
    Telegram(#[from] teloxide::RequestError),
    #[error("notification send timed out")]
    Timeout,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one formatted listing notification.
    async fn send_listing(&self, listing: &Listing) -> Result<(), NotifyError>;

    /// Deliver a plain status message (lifecycle notices, test sends).
    async fn send_message(&self, text: &str) -> Result<(), NotifyError>;
}

pub struct TelegramNotifier {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: i64) -> Self {
        Self {
            bot: Bot::new(bot_token),
            chat_id: ChatId(chat_id),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_listing(&self, listing: &Listing) -> Result<(), NotifyError> {
        let message = format_listing_message(listing);

        // Prefer a photo card; fall back to text when the image upload fails.
        if let Some(image_url) = listing
            .image_url
            .as_deref()
            .and_then(|u| reqwest::Url::parse(u).ok())
        {
            match self
                .bot
                .send_photo(self.chat_id, InputFile::url(image_url))
                .caption(message.clone())
                .parse_mode(ParseMode::MarkdownV2)
                .await
            {
                Ok(_) => {
                    info!(listing_id = %listing.id, "telegram photo notification sent");
                    return Ok(());
                }
                Err(err) => {
                    warn!(?err, listing_id = %listing.id, "photo send failed; sending text");
                }
            }
        }

        self.bot
            .send_message(self.chat_id, message)
            .parse_mode(ParseMode::MarkdownV2)
            .await?;
        info!(listing_id = %listing.id, "telegram notification sent");
        Ok(())
    }

    async fn send_message(&self, text: &str) -> Result<(), NotifyError> {
        self.bot.send_message(self.chat_id, text.to_string()).await?;
        Ok(())
    }
}

/// Escape special characters for Telegram MarkdownV2.
pub fn escape_markdown(text: &str) -> String {
    const SPECIAL: &[char] = &[
        '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
    ];
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if SPECIAL.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Render a listing as a MarkdownV2 notification card.
pub fn format_listing_message(listing: &Listing) -> String {
    let mut lines = vec![
        "🆕 *New Marketplace Listing\\!*".to_string(),
        String::new(),
        format!("📦 *{}*", escape_markdown(&listing.title)),
        format!("💰 {}", escape_markdown(&listing.price)),
        format!("📍 {}", escape_markdown(&listing.location)),
    ];

    if let Some(desc) = &listing.description {
        let truncated: String = if desc.chars().count() > 200 {
            format!("{}...", desc.chars().take(200).collect::<String>())
        } else {
            desc.clone()
        };
        lines.push(format!("📝 {}", escape_markdown(&truncated)));
    }

    lines.push(String::new());
    lines.push(format!("🔗 [View Listing]({})", listing.url));

    lines.join("\n")
}

/// Send policy applied by the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub min_gap: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub send_timeout: Duration,
}

impl DispatchPolicy {
    pub fn from_config(cfg: &config::Notify) -> Self {
        Self {
            min_gap: Duration::from_millis(cfg.min_gap_ms),
            max_attempts: cfg.max_attempts,
            retry_delay: Duration::from_secs(cfg.retry_delay_secs),
            send_timeout: Duration::from_secs(cfg.send_timeout_secs),
        }
    }
}

/// Wraps a [`Notifier`] with a minimum inter-send gap and a small bounded
/// retry. Exhaustion surfaces the last error; it never panics the caller.
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    policy: DispatchPolicy,
    last_sent: Mutex<Option<Instant>>,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, policy: DispatchPolicy) -> Self {
        Self {
            notifier,
            policy,
            last_sent: Mutex::new(None),
        }
    }

    pub async fn notify_listing(&self, listing: &Listing) -> Result<(), NotifyError> {
        self.pace().await;
        let res = self
            .with_retries(|| self.notifier.send_listing(listing))
            .await;
        self.mark_sent().await;
        res
    }

    pub async fn send_message(&self, text: &str) -> Result<(), NotifyError> {
        self.pace().await;
        let res = self.with_retries(|| self.notifier.send_message(text)).await;
        self.mark_sent().await;
        res
    }

    async fn with_retries<F, Fut>(&self, mut attempt: F) -> Result<(), NotifyError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), NotifyError>>,
    {
        let mut last_err = NotifyError::Timeout;
        for n in 1..=self.policy.max_attempts {
            match tokio::time::timeout(self.policy.send_timeout, attempt()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => {
                    warn!(?err, attempt = n, "notification attempt failed");
                    last_err = err;
                }
                Err(_) => {
                    warn!(attempt = n, "notification attempt timed out");
                    last_err = NotifyError::Timeout;
                }
            }
            if n < self.policy.max_attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }
        Err(last_err)
    }

    /// Wait out the minimum gap since the previous send.
    async fn pace(&self) {
        let wait = {
            let guard = self.last_sent.lock().await;
            guard.map(|t| self.policy.min_gap.saturating_sub(t.elapsed()))
        };
        if let Some(wait) = wait {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }

    async fn mark_sent(&self) {
        *self.last_sent.lock().await = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyNotifier {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl FlakyNotifier {
        fn failing_first(n: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_first: n,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn send_listing(&self, _listing: &Listing) -> Result<(), NotifyError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(NotifyError::Timeout)
            } else {
                Ok(())
            }
        }

        async fn send_message(&self, _text: &str) -> Result<(), NotifyError> {
            self.send_listing(&sample_listing()).await
        }
    }

    fn sample_listing() -> Listing {
        Listing {
            id: "12345".into(),
            title: "iPhone 14 Pro - Like New".into(),
            price: "$750".into(),
            location: "Denver, CO".into(),
            url: "https://market.example/item/12345".into(),
            description: Some("Excellent condition, 256GB, unlocked.".into()),
            image_url: None,
        }
    }

    fn policy() -> DispatchPolicy {
        DispatchPolicy {
            min_gap: Duration::from_secs(1),
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            send_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn escape_markdown_escapes_specials() {
        assert_eq!(escape_markdown("a_b*c.d!"), "a\\_b\\*c\\.d\\!");
        assert_eq!(escape_markdown("plain text"), "plain text");
    }

    #[test]
    fn format_message_contains_fields_and_link() {
        let msg = format_listing_message(&sample_listing());
        assert!(msg.contains("iPhone 14 Pro \\- Like New"));
        assert!(msg.contains("💰 $750"));
        assert!(msg.contains("📍 Denver, CO"));
        assert!(msg.contains("[View Listing](https://market.example/item/12345)"));
    }

    #[test]
    fn format_message_truncates_long_description() {
        let mut l = sample_listing();
        l.description = Some("x".repeat(300));
        let msg = format_listing_message(&l);
        assert!(msg.contains(&format!("{}\\.\\.\\.", "x".repeat(200))));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let notifier = FlakyNotifier::failing_first(2);
        let dispatcher = Dispatcher::new(notifier.clone(), policy());

        let started = Instant::now();
        dispatcher.notify_listing(&sample_listing()).await.unwrap();
        assert_eq!(notifier.calls(), 3);
        // Two retry delays elapsed on the paused clock.
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_error_without_panicking() {
        let notifier = FlakyNotifier::failing_first(u32::MAX);
        let dispatcher = Dispatcher::new(notifier.clone(), policy());

        let err = dispatcher.notify_listing(&sample_listing()).await;
        assert!(err.is_err());
        assert_eq!(notifier.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn enforces_min_gap_between_sends() {
        let notifier = FlakyNotifier::failing_first(0);
        let dispatcher = Dispatcher::new(notifier.clone(), policy());

        dispatcher.notify_listing(&sample_listing()).await.unwrap();
        let before_second = Instant::now();
        dispatcher.notify_listing(&sample_listing()).await.unwrap();
        assert!(before_second.elapsed() >= Duration::from_secs(1));
        assert_eq!(notifier.calls(), 2);
    }
}
