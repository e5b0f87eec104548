//! Run-completion notifications.

pub mod email;

pub use email::{NotifierConfig, SmtpNotifier};

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::NotifyError;

pub const SUBJECT: &str = "Harvest results: your requested data";

/// Tells the job submitter how the run ended.
///
/// Implementations retry transient delivery failures themselves.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        recipient: &str,
        succeeded: bool,
        attachment: Option<&Path>,
    ) -> Result<(), NotifyError>;
}

/// Body text for a finished run.
pub fn body(succeeded: bool) -> String {
    if succeeded {
        "Hi there! Your harvested data is attached to this email.".to_string()
    } else {
        "Hi there, there was an issue with your last harvest request. Please check and try again."
            .to_string()
    }
}

/// Call `send` up to `attempts` times, sleeping `backoff` between failures.
pub async fn deliver_with_retry<F, Fut>(
    attempts: u32,
    backoff: Duration,
    mut send: F,
) -> Result<(), NotifyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), NotifyError>>,
{
    let attempts = attempts.max(1);
    let mut last = String::new();
    for attempt in 1..=attempts {
        match send().await {
            Ok(()) => {
                info!(attempt, "Notification delivered");
                return Ok(());
            }
            // A malformed message will not improve on retry.
            Err(
                e @ (NotifyError::InvalidAddress { .. }
                | NotifyError::Build(_)
                | NotifyError::Attachment { .. }),
            ) => return Err(e),
            Err(e) => {
                warn!(attempt, error = %e, "Notification attempt failed");
                last = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(NotifyError::Exhausted { attempts, last })
}
