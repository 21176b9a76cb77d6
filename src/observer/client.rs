//! HTTP client for the public observer read API.
//!
//! No authentication: the read endpoints are universally public and
//! rate-limited identically for all callers.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::anchor::MerkleProof;
use crate::event::EventWire;
use crate::observer::EventSource;

#[derive(Debug, Clone, Deserialize)]
pub struct Pagination {
    pub limit: u64,
    pub offset: u64,
    pub total: u64,
    pub has_more: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsPage {
    pub events: Vec<EventWire>,
    pub pagination: Pagination,
    #[serde(default)]
    pub proof: Option<Value>,
}

pub struct ObserverClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl ObserverClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// One page of events ordered by sequence.
    pub fn events_page(
        &self,
        limit: u64,
        offset: u64,
        as_of_sequence: Option<u64>,
        include_proof: bool,
    ) -> anyhow::Result<EventsPage> {
        let mut query: Vec<(String, String)> = vec![
            ("limit".into(), limit.to_string()),
            ("offset".into(), offset.to_string()),
        ];
        if let Some(as_of) = as_of_sequence {
            query.push(("as_of_sequence".into(), as_of.to_string()));
            query.push(("include_proof".into(), include_proof.to_string()));
        }
        let page = self
            .http
            .get(self.url("/v1/observer/events"))
            .query(&query)
            .send()?
            .error_for_status()?
            .json()?;
        Ok(page)
    }

    /// All events in `start..=end`, paginating upstream as needed.
    pub fn get_events(
        &self,
        start_sequence: u64,
        end_sequence: u64,
        page_size: u64,
    ) -> anyhow::Result<Vec<EventWire>> {
        let mut events = Vec::new();
        let mut offset = start_sequence.saturating_sub(1);
        loop {
            let page = self.events_page(page_size, offset, None, false)?;
            let batch_len = page.events.len() as u64;
            for event in page.events {
                if event.sequence > end_sequence {
                    return Ok(events);
                }
                if event.sequence >= start_sequence {
                    events.push(event);
                }
            }
            if !page.pagination.has_more || batch_len == 0 {
                return Ok(events);
            }
            offset += batch_len;
        }
    }

    pub fn event_by_id(&self, event_id: &str) -> anyhow::Result<EventWire> {
        Ok(self
            .http
            .get(self.url(&format!("/v1/observer/events/{event_id}")))
            .send()?
            .error_for_status()?
            .json()?)
    }

    pub fn event_by_sequence(&self, sequence: u64) -> anyhow::Result<EventWire> {
        Ok(self
            .http
            .get(self.url(&format!("/v1/observer/events/sequence/{sequence}")))
            .send()?
            .error_for_status()?
            .json()?)
    }

    /// Inclusion proof for an event, or `None` while it sits in the
    /// unanchored tail (the API answers 404 there).
    pub fn merkle_proof(&self, sequence: u64) -> anyhow::Result<Option<MerkleProof>> {
        let response = self
            .http
            .get(self.url(&format!("/v1/observer/events/sequence/{sequence}/merkle-proof")))
            .send()?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json()?))
    }

    pub fn checkpoints(&self, limit: u64, offset: u64) -> anyhow::Result<Value> {
        Ok(self
            .http
            .get(self.url("/v1/observer/checkpoints"))
            .query(&[("limit", limit.to_string()), ("offset", offset.to_string())])
            .send()?
            .error_for_status()?
            .json()?)
    }

    /// The exact canonical-encoding rules and version tags the upstream
    /// hashes and signs with.
    pub fn verification_spec(&self) -> anyhow::Result<Value> {
        Ok(self
            .http
            .get(self.url("/v1/observer/verification-spec"))
            .send()?
            .error_for_status()?
            .json()?)
    }

    /// Streaming export body (JSONL or CSV).
    pub fn export(
        &self,
        format: &str,
        start_sequence: u64,
        end_sequence: u64,
        event_type: Option<&str>,
    ) -> anyhow::Result<String> {
        let mut query: Vec<(String, String)> = vec![
            ("format".into(), format.to_string()),
            ("start_sequence".into(), start_sequence.to_string()),
            ("end_sequence".into(), end_sequence.to_string()),
        ];
        if let Some(event_type) = event_type {
            query.push(("event_type".into(), event_type.to_string()));
        }
        Ok(self
            .http
            .get(self.url("/v1/observer/export"))
            .query(&query)
            .send()?
            .error_for_status()?
            .text()?)
    }

    pub fn attestation(&self, start_sequence: u64, end_sequence: u64) -> anyhow::Result<Value> {
        Ok(self
            .http
            .get(self.url("/v1/observer/export/attestation"))
            .query(&[
                ("start_sequence", start_sequence.to_string()),
                ("end_sequence", end_sequence.to_string()),
            ])
            .send()?
            .error_for_status()?
            .json()?)
    }
}

impl EventSource for ObserverClient {
    fn fetch(&self, from: u64, to: u64) -> anyhow::Result<Vec<EventWire>> {
        self.get_events(from, to, 1000)
    }
}
