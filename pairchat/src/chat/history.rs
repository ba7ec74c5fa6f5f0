//! History backfill for a conversation.
//!
//! Defines the [`HistorySource`] trait for fetching past messages, the
//! [`HttpHistory`] implementation backed by the history endpoint, and
//! [`HistoryLoader`], which normalizes whatever the source returns into
//! ascending confirmed messages.
//!
//! The endpoint returns most-recent-first. A failed fetch is never fatal:
//! the loader degrades to an empty backfill, but logs it at `warn` so it can
//! be told apart from a conversation that simply has no history yet.

use std::time::Duration;

use pairchat_proto::address::{PairKey, ParticipantId};
use pairchat_proto::wire::WireMessage;

use super::store::ConfirmedMessage;
use crate::connection::Credential;

/// Errors that can occur while fetching history.
#[derive(Debug, thiserror::Error)]
pub enum HistoryFetchError {
    /// The request could not be sent or the response body not read.
    #[error("history request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("history endpoint returned HTTP {0}")]
    Status(u16),

    /// The configured base URL cannot be extended with the history path.
    #[error("invalid history url: {0}")]
    Url(String),

    /// The body was not an array of messages.
    #[error("malformed history body: {0}")]
    Body(#[from] pairchat_proto::wire::WireError),
}

/// Source of past messages for a conversation, most-recent-first.
pub trait HistorySource: Send + Sync {
    /// Fetch the history of `pair`, most recent message first.
    fn fetch(
        &self,
        pair: &PairKey,
    ) -> impl std::future::Future<Output = Result<Vec<WireMessage>, HistoryFetchError>> + Send;
}

/// [`HistorySource`] over the HTTP history endpoint:
/// `GET {base}/history/{a}/{b}?counterpart={id}` with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpHistory {
    client: reqwest::Client,
    base_url: url::Url,
    credential: Credential,
    own_id: ParticipantId,
}

impl HttpHistory {
    /// Create a history client.
    ///
    /// `own_id` is used to derive the counterpart filter for each pair.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryFetchError::Url`] if `base_url` does not parse, or
    /// [`HistoryFetchError::Request`] if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        credential: Credential,
        own_id: ParticipantId,
        timeout: Duration,
    ) -> Result<Self, HistoryFetchError> {
        let base_url =
            url::Url::parse(base_url).map_err(|e| HistoryFetchError::Url(format!("{base_url}: {e}")))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            credential,
            own_id,
        })
    }

    fn endpoint(&self, pair: &PairKey) -> Result<url::Url, HistoryFetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| HistoryFetchError::Url(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["history", pair.first().as_str(), pair.second().as_str()]);
        if let Some(role) = pair.role_of(&self.own_id) {
            url.query_pairs_mut()
                .append_pair("counterpart", pair.participant(role.counterpart()).as_str());
        }
        Ok(url)
    }
}

impl HistorySource for HttpHistory {
    async fn fetch(&self, pair: &PairKey) -> Result<Vec<WireMessage>, HistoryFetchError> {
        let url = self.endpoint(pair)?;
        let response = self
            .client
            .get(url)
            .bearer_auth(self.credential.token())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HistoryFetchError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        Ok(pairchat_proto::wire::decode_batch(&body)?)
    }
}

/// Turns a [`HistorySource`] into an ordered backfill.
#[derive(Debug, Clone)]
pub struct HistoryLoader<H> {
    source: H,
}

impl<H: HistorySource> HistoryLoader<H> {
    /// Wrap a history source.
    pub const fn new(source: H) -> Self {
        Self { source }
    }

    /// Fetch and normalize the history of `pair` into ascending order.
    ///
    /// Never fails: a fetch error yields an empty vector. Records without
    /// an id or timestamp are skipped.
    pub async fn load(&self, pair: &PairKey) -> Vec<ConfirmedMessage> {
        let records = match self.source.fetch(pair).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(pair = %pair, err = %e, "history fetch failed, continuing without backfill");
                return Vec::new();
            }
        };
        if records.is_empty() {
            tracing::debug!(pair = %pair, "no history yet");
            return Vec::new();
        }

        let total = records.len();
        let mut messages: Vec<ConfirmedMessage> = records
            .into_iter()
            .rev()
            .filter_map(|wire| match ConfirmedMessage::from_wire(wire, None) {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::warn!(pair = %pair, err = %e, "skipping incomplete history record");
                    None
                }
            })
            .collect();
        messages.sort_by_key(|m| m.created_at);
        tracing::info!(pair = %pair, loaded = messages.len(), total, "history loaded");
        messages
    }
}
