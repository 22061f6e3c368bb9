//! etcd v2 keys API client
//!
//! Maps the store operations onto:
//! - `GET  /v2/keys/<prefix>?recursive=true`
//! - `GET  /v2/keys/<prefix>?wait=true&recursive=true&waitIndex=N`
//! - `PUT  /v2/keys/<key>?prevExist=false` (form: `value`, `ttl`)
//! - `PUT  /v2/keys/<key>` (form: `value`, `ttl`)
//!
//! Endpoints are tried in order; a connection failure falls through to the
//! next one.

use super::{ChangeEvent, CoordinationStore, Listing, StoreNode};
use crate::common::{Error, Result, StoreConfig};
use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

/// Percent-encoding set for a single key segment
const SEGMENT_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&');

const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";

const ERROR_KEY_NOT_FOUND: u64 = 100;
const ERROR_NODE_EXIST: u64 = 105;
const ERROR_EVENT_INDEX_CLEARED: u64 = 401;

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: String,
    #[serde(default)]
    node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdNode {
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
    #[serde(default)]
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdError {
    error_code: u64,
    message: String,
    #[serde(default)]
    cause: Option<String>,
    #[serde(default)]
    index: u64,
}

impl EtcdError {
    fn into_error(self, from_index: u64) -> Error {
        match self.error_code {
            ERROR_EVENT_INDEX_CLEARED => Error::IndexCleared { index: from_index },
            code => Error::Store {
                code,
                message: match self.cause {
                    Some(cause) => format!("{} ({})", self.message, cause),
                    None => self.message,
                },
            },
        }
    }
}

/// Collect leaf nodes depth-first
fn flatten(node: EtcdNode, out: &mut Vec<StoreNode>) {
    if node.dir {
        for child in node.nodes {
            flatten(child, out);
        }
    } else if let Some(key) = node.key {
        out.push(StoreNode {
            key,
            value: node.value.unwrap_or_default(),
            modified_index: node.modified_index,
        });
    }
}

fn encode_key_path(key: &str) -> String {
    key.trim_matches('/')
        .split('/')
        .map(|segment| utf8_percent_encode(segment, SEGMENT_ENCODE_SET).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// etcd TTLs are whole seconds; round up so a lease never ends early
fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

fn write_form(value: &str, ttl: Option<Duration>) -> Vec<(&'static str, String)> {
    let mut form = vec![("value", value.to_string())];
    if let Some(ttl) = ttl {
        form.push(("ttl", ttl_secs(ttl).to_string()));
    }
    form
}

fn parse_error(status: StatusCode, body: &str) -> Option<EtcdError> {
    if status.is_success() {
        return None;
    }
    serde_json::from_str(body).ok()
}

fn parse_response(body: &str) -> Result<EtcdResponse> {
    serde_json::from_str(body)
        .map_err(|e| Error::Transport(format!("invalid etcd response: {}", e)))
}

/// etcd v2 store client
pub struct EtcdStore {
    client: reqwest::Client,
    endpoints: Vec<String>,
    request_timeout: Duration,
}

impl EtcdStore {
    pub fn new(endpoints: Vec<String>, request_timeout: Duration) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::InvalidConfig("no etcd endpoints".into()));
        }
        // No client-wide timeout: watch calls are long polls bounded by the caller.
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            endpoints: endpoints
                .into_iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            request_timeout,
        })
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        Self::new(config.endpoints.clone(), config.request_timeout())
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, String)],
        form: Option<&[(&'static str, String)]>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let path = encode_key_path(key);
        let mut last_error = None;

        for endpoint in &self.endpoints {
            let mut request = self
                .client
                .request(method.clone(), format!("{}/v2/keys/{}", endpoint, path))
                .query(query);
            if let Some(form) = form {
                request = request.form(form);
            }
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() => {
                    tracing::debug!("etcd endpoint {} unreachable: {}", endpoint, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_error
            .map(Error::from)
            .unwrap_or_else(|| Error::Transport("no etcd endpoint reachable".into())))
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn list(&self, prefix: &str) -> Result<Listing> {
        let response = self
            .send(
                Method::GET,
                prefix,
                &[("recursive", "true".to_string())],
                None,
                Some(self.request_timeout),
            )
            .await?;

        let status = response.status();
        let header_index = response
            .headers()
            .get(ETCD_INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await?;

        if let Some(err) = parse_error(status, &body) {
            if err.error_code == ERROR_KEY_NOT_FOUND {
                return Ok(Listing {
                    nodes: Vec::new(),
                    index: header_index.unwrap_or(err.index),
                });
            }
            return Err(err.into_error(0));
        }
        if !status.is_success() {
            return Err(Error::Transport(format!("etcd list returned {}", status)));
        }

        let parsed = parse_response(&body)?;
        let mut nodes = Vec::new();
        if let Some(node) = parsed.node {
            flatten(node, &mut nodes);
        }
        let index = header_index
            .or_else(|| nodes.iter().map(|n| n.modified_index).max())
            .unwrap_or(0);
        Ok(Listing { nodes, index })
    }

    async fn watch(&self, prefix: &str, from_index: u64) -> Result<ChangeEvent> {
        let query = [
            ("wait", "true".to_string()),
            ("recursive", "true".to_string()),
            ("waitIndex", from_index.to_string()),
        ];
        let response = self.send(Method::GET, prefix, &query, None, None).await?;
        let status = response.status();
        let body = response.text().await?;

        if let Some(err) = parse_error(status, &body) {
            return Err(err.into_error(from_index));
        }
        if !status.is_success() {
            return Err(Error::Transport(format!("etcd watch returned {}", status)));
        }
        if body.trim().is_empty() {
            // etcd closes idle long polls with an empty body
            return Err(Error::Timeout("etcd closed the watch without an event".into()));
        }

        let parsed = parse_response(&body)?;
        let node = parsed
            .node
            .ok_or_else(|| Error::Transport("etcd watch event without node".into()))?;
        let index = node.modified_index;
        Ok(ChangeEvent {
            action: parsed.action,
            node: StoreNode {
                key: node.key.unwrap_or_default(),
                value: node.value.unwrap_or_default(),
                modified_index: index,
            },
            index,
        })
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let form = write_form(value, ttl);
        let response = self
            .send(
                Method::PUT,
                key,
                &[("prevExist", "false".to_string())],
                Some(form.as_slice()),
                Some(self.request_timeout),
            )
            .await?;
        let status = response.status();
        let body = response.text().await?;

        match parse_error(status, &body) {
            Some(err) if err.error_code == ERROR_NODE_EXIST => Ok(false),
            Some(err) => Err(err.into_error(0)),
            None if status.is_success() => Ok(true),
            None => Err(Error::Transport(format!("etcd create returned {}", status))),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let form = write_form(value, ttl);
        let response = self
            .send(Method::PUT, key, &[], Some(form.as_slice()), Some(self.request_timeout))
            .await?;
        let status = response.status();
        let body = response.text().await?;

        match parse_error(status, &body) {
            Some(err) => Err(err.into_error(0)),
            None if status.is_success() => Ok(()),
            None => Err(Error::Transport(format!("etcd set returned {}", status))),
        }
    }
}
