//! XML-RPC transport over validated HTTPS channels.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::Read;

use reqwest::blocking::Client;
use reqwest::header::{CONNECTION, CONTENT_TYPE};
use reqwest::StatusCode;
use url::{Host, Url};

use crate::connector::{request_error, Connector, ConnectorConfig};
use crate::types::{BofhError, BofhResult};
use crate::value::Value;
use crate::xmlrpc;

/// Something that can carry one XML-RPC call and return the raw result.
pub trait Transport {
    fn call(&mut self, method: &str, params: Vec<Value>) -> BofhResult<Value>;

    /// Drop any open connections.
    fn close(&mut self) {}
}

/// Where requests go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    /// Parse an `https://host[:port][/path]` URL.
    pub fn parse(raw: &str) -> BofhResult<Self> {
        let url = Url::parse(raw).map_err(|e| BofhError::InvalidUrl(format!("{raw}: {e}")))?;

        if url.scheme() != "https" {
            return Err(BofhError::UnsupportedTransport(format!(
                "'{}' URLs are not supported, use https",
                url.scheme()
            )));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(BofhError::InvalidUrl(format!("{raw}: missing host"))),
        };

        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            host,
            port: url.port_or_known_default().unwrap_or(443),
            path,
        })
    }

    /// Cache key for the channel map.
    pub fn destination(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Full request URL.
    pub fn url(&self) -> String {
        format!("https://{}{}", self.authority(), self.path)
    }
}

/// Largest response body accepted from the server.
pub const MAX_RESPONSE_BYTES: u64 = 64 * 1024 * 1024;

/// What came back on the channel, before XML-RPC decoding.
struct Reply {
    status: StatusCode,
    keep_alive: bool,
    body: Vec<u8>,
}

/// HTTPS transport owning its channels, keyed by destination (`host:port`).
///
/// A transport serves the single endpoint it was built for, so the map holds
/// at most one channel. A failed channel is dropped and the next call opens a
/// fresh one.
pub struct HttpsTransport {
    endpoint: Endpoint,
    connector: Connector,
    channels: HashMap<String, Client>,
}

impl HttpsTransport {
    pub fn new(url: &str, config: &ConnectorConfig) -> BofhResult<Self> {
        let endpoint = Endpoint::parse(url)?;
        let connector = Connector::new(config)?;
        Ok(Self {
            endpoint,
            connector,
            channels: HashMap::new(),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Number of cached channels.
    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    fn channel(&mut self) -> BofhResult<&Client> {
        match self.channels.entry(self.endpoint.destination()) {
            Entry::Occupied(entry) => Ok(&*entry.into_mut()),
            Entry::Vacant(entry) => {
                let client = self
                    .connector
                    .connect(&self.endpoint.host, self.endpoint.port)?;
                Ok(&*entry.insert(client))
            }
        }
    }

    fn exchange(&mut self, body: String) -> BofhResult<Reply> {
        let url = self.endpoint.url();
        let destination = self.endpoint.destination();
        let response = self
            .channel()?
            .post(url)
            .header(CONTENT_TYPE, "text/xml")
            .body(body)
            .send()
            .map_err(|e| request_error(&destination, &e))?;

        let status = response.status();
        let keep_alive = !response
            .headers()
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("close"));

        if response
            .content_length()
            .is_some_and(|len| len > MAX_RESPONSE_BYTES)
        {
            return Err(too_large());
        }

        let mut body = Vec::new();
        response
            .take(MAX_RESPONSE_BYTES + 1)
            .read_to_end(&mut body)
            .map_err(|e| BofhError::TransportFault(format!("Reading response failed: {e}")))?;
        if body.len() as u64 > MAX_RESPONSE_BYTES {
            return Err(too_large());
        }

        Ok(Reply {
            status,
            keep_alive,
            body,
        })
    }

    fn evict(&mut self) {
        let destination = self.endpoint.destination();
        if self.channels.remove(&destination).is_some() {
            tracing::debug!("Evicting channel to {destination}");
        }
    }
}

fn too_large() -> BofhError {
    BofhError::TransportFault(format!(
        "Response too large, the limit is {MAX_RESPONSE_BYTES} bytes"
    ))
}

impl Transport for HttpsTransport {
    fn call(&mut self, method: &str, params: Vec<Value>) -> BofhResult<Value> {
        let body = xmlrpc::encode_call(method, &params);
        tracing::debug!("Calling {method} with {} params", params.len());

        let reply = match self.exchange(body) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Call to {method} failed on the channel: {e}");
                self.evict();
                return Err(e);
            }
        };

        if !reply.keep_alive {
            self.evict();
        }

        if !reply.status.is_success() {
            return Err(BofhError::TransportFault(format!("HTTP {}", reply.status)));
        }

        let text = String::from_utf8(reply.body)
            .map_err(|_| BofhError::TransportFault("Response body is not UTF-8".to_string()))?;
        xmlrpc::decode_response(&text)
    }

    fn close(&mut self) {
        for (destination, _) in self.channels.drain() {
            tracing::debug!("Closing channel to {destination}");
        }
    }
}
