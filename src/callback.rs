//! Notifying requestors when batches and batch orders finish.
//!
//! Callback URLs may carry the placeholders `{orderId}`, `{batchId}`,
//! `{orderState}` and `{batchState}`; [`HttpCallbackNotifier`] substitutes
//! them and pings the resulting URL with a GET. Delivery is attempted once.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::CallbackError;
use crate::state_machine::ProcessingState;

/// A finished batch or batch order, as reported to the requestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedNotice {
    pub batch_order_id: Uuid,
    pub batch_order_state: ProcessingState,
    /// Set when a single batch finished.
    pub batch: Option<(Uuid, ProcessingState)>,
    pub callback_url: Option<String>,
}

impl FinishedNotice {
    pub fn order(batch_order_id: Uuid, state: ProcessingState, callback_url: Option<String>) -> Self {
        Self {
            batch_order_id,
            batch_order_state: state,
            batch: None,
            callback_url,
        }
    }

    pub fn batch(
        batch_order_id: Uuid,
        batch_order_state: ProcessingState,
        batch_id: Uuid,
        batch_state: ProcessingState,
        callback_url: Option<String>,
    ) -> Self {
        Self {
            batch_order_id,
            batch_order_state,
            batch: Some((batch_id, batch_state)),
            callback_url,
        }
    }

    /// The callback URL with placeholders substituted, if one is registered.
    pub fn resolved_url(&self) -> Option<String> {
        let template = self.callback_url.as_deref().filter(|url| !url.trim().is_empty())?;
        let (batch_id, batch_state) = match self.batch {
            Some((id, state)) => (id.to_string(), state.to_string()),
            None => (String::new(), String::new()),
        };
        Some(
            template
                .replace("{orderId}", &self.batch_order_id.to_string())
                .replace("{orderState}", &self.batch_order_state.to_string())
                .replace("{batchId}", &batch_id)
                .replace("{batchState}", &batch_state),
        )
    }
}

#[async_trait]
pub trait CallbackNotifier: Send + Sync {
    async fn batch_finished(&self, notice: &FinishedNotice) -> Result<(), CallbackError>;

    async fn order_finished(&self, notice: &FinishedNotice) -> Result<(), CallbackError>;
}

pub struct HttpCallbackNotifier {
    client: Client,
}

impl HttpCallbackNotifier {
    pub fn new() -> Result<Self, CallbackError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    async fn ping(&self, notice: &FinishedNotice) -> Result<(), CallbackError> {
        let Some(url) = notice.resolved_url() else {
            return Ok(());
        };
        reqwest::Url::parse(&url).map_err(|_| CallbackError::InvalidUrl(url.clone()))?;

        info!(url = %url, order_id = %notice.batch_order_id, "pinging callback url");
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CallbackError::Status(status.as_u16()));
        }
        info!(status = status.as_u16(), order_id = %notice.batch_order_id, "callback url pinged");
        Ok(())
    }
}

#[async_trait]
impl CallbackNotifier for HttpCallbackNotifier {
    async fn batch_finished(&self, notice: &FinishedNotice) -> Result<(), CallbackError> {
        self.ping(notice).await
    }

    async fn order_finished(&self, notice: &FinishedNotice) -> Result<(), CallbackError> {
        self.ping(notice).await
    }
}

/// Notifier that only logs, used when no requestor needs pinging.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl CallbackNotifier for LogNotifier {
    async fn batch_finished(&self, notice: &FinishedNotice) -> Result<(), CallbackError> {
        if let Some((batch_id, state)) = notice.batch {
            info!(order_id = %notice.batch_order_id, %batch_id, %state, "batch finished");
        }
        Ok(())
    }

    async fn order_finished(&self, notice: &FinishedNotice) -> Result<(), CallbackError> {
        info!(order_id = %notice.batch_order_id, state = %notice.batch_order_state, "batch order finished");
        Ok(())
    }
}

/// Logs delivery failures; callers never retry.
pub(crate) fn log_delivery(result: Result<(), CallbackError>, notice: &FinishedNotice) {
    if let Err(e) = result {
        warn!(order_id = %notice.batch_order_id, error = %e, "callback delivery failed");
    }
}
