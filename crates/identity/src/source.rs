//! The list+watch boundary to the external identity collection.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SourceConfig;
use crate::error::{IdentityError, Result};
use crate::object::IdentityObject;

/// One observed change to the watched collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "snake_case")]
pub enum WatchEvent {
    /// An object appeared.
    Added(IdentityObject),
    /// An object changed.
    Modified(IdentityObject),
    /// An object went away.
    Deleted(IdentityObject),
    /// The source re-sent its full state; replace everything.
    Resync(Vec<IdentityObject>),
}

/// A full listing plus the version to resume watching from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityList {
    /// Opaque version token for the subsequent watch.
    pub resource_version: String,
    /// Every object currently in the collection.
    pub items: Vec<IdentityObject>,
}

/// Stream of watch events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<WatchEvent>> + Send>>;

/// List+watch access to the identity collection.
///
/// The wire encoding is this crate's private business. The semantics are
/// the classic pair: a consistent list, then deltas from the listed
/// version until the stream breaks and the consumer re-lists.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Fetch the current collection.
    async fn list(&self) -> Result<IdentityList>;

    /// Stream deltas from `resource_version` onward.
    async fn watch(&self, resource_version: &str) -> Result<EventStream>;
}

/// HTTP implementation: NDJSON list+watch against
/// `{host}/identities`, authenticated by a bearer token, trusting the
/// configured CA.
pub struct HttpIdentitySource {
    client: reqwest::Client,
    host: String,
    token: String,
}

impl HttpIdentitySource {
    /// Build a source from the stored configuration.
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        config.validate()?;

        let mut builder = reqwest::Client::builder();
        if !config.ca_cert.is_empty() {
            let cert = reqwest::Certificate::from_pem(config.ca_cert.as_bytes())
                .map_err(|err| IdentityError::Config {
                    reason: format!("invalid CA certificate: {err}"),
                })?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|err| IdentityError::source_err("failed to build HTTP client", err))?;

        Ok(Self {
            client,
            host: config.host.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl IdentitySource for HttpIdentitySource {
    async fn list(&self) -> Result<IdentityList> {
        let url = format!("{}/identities", self.host);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| IdentityError::source_err("list request failed", err))?
            .error_for_status()
            .map_err(|err| IdentityError::source_err("list request rejected", err))?;

        response
            .json()
            .await
            .map_err(|err| IdentityError::source_err("malformed list response", err))
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream> {
        let url = format!("{}/identities", self.host);
        let response = self
            .client
            .get(&url)
            .query(&[("watch", "true"), ("resource_version", resource_version)])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| IdentityError::source_err("watch request failed", err))?
            .error_for_status()
            .map_err(|err| IdentityError::source_err("watch request rejected", err))?;

        debug!(resource_version, "watch stream established");
        Ok(ndjson_events(response.bytes_stream().boxed()))
    }
}

/// Turn a raw byte stream into newline-delimited [`WatchEvent`]s.
///
/// Partial lines are buffered across chunks; blank lines (keep-alives) are
/// skipped.
fn ndjson_events<E>(
    bytes: Pin<Box<dyn Stream<Item = std::result::Result<bytes::Bytes, E>> + Send>>,
) -> EventStream
where
    E: std::error::Error + Send + Sync + 'static,
{
    struct State<E> {
        bytes: Pin<Box<dyn Stream<Item = std::result::Result<bytes::Bytes, E>> + Send>>,
        buffer: Vec<u8>,
        done: bool,
    }

    let state = State {
        bytes,
        buffer: Vec::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.done {
                return None;
            }
            if let Some(newline) = state.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=newline).collect();
                let line = &line[..line.len() - 1];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let event = serde_json::from_slice::<WatchEvent>(line).map_err(|err| {
                    IdentityError::Source {
                        reason: format!("malformed watch event: {err}"),
                        source: Some(Box::new(err)),
                    }
                });
                return Some((event, state));
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    state.done = true;
                    return Some((
                        Err(IdentityError::source_err("watch stream failed", err)),
                        state,
                    ));
                }
                None => return None,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn object(name: &str) -> IdentityObject {
        IdentityObject {
            namespace: None,
            name: name.to_string(),
            annotations: std::collections::BTreeMap::new(),
        }
    }

    #[test]
    fn watch_event_wire_shape() {
        let json = serde_json::to_value(WatchEvent::Added(object("worker"))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "added", "object": {"name": "worker", "annotations": {}}})
        );
    }

    #[tokio::test]
    async fn ndjson_reassembles_split_lines() {
        let event = WatchEvent::Added(object("worker"));
        let mut encoded = serde_json::to_vec(&event).unwrap();
        encoded.push(b'\n');

        // Split mid-frame plus a keep-alive blank line.
        let half = encoded.len() / 2;
        let chunks: Vec<std::result::Result<bytes::Bytes, std::io::Error>> = vec![
            Ok(bytes::Bytes::copy_from_slice(&encoded[..half])),
            Ok(bytes::Bytes::copy_from_slice(&encoded[half..])),
            Ok(bytes::Bytes::from_static(b"\n")),
        ];

        let mut events = ndjson_events(futures::stream::iter(chunks).boxed());
        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first, event);
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn ndjson_surfaces_stream_errors_then_ends() {
        let chunks: Vec<std::result::Result<bytes::Bytes, std::io::Error>> = vec![Err(
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
        )];
        let mut events = ndjson_events(futures::stream::iter(chunks).boxed());

        assert!(events.next().await.unwrap().is_err());
        assert!(events.next().await.is_none());
    }
}
