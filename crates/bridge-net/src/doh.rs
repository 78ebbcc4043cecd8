//! DNS-over-HTTPS TXT lookups (RFC 8484 GET form)

use crate::{Error, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

const DNS_CONTENT_TYPE: &str = "application/dns-message";

/// DoH resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnsProvider {
    /// Quad9 on 443
    Quad9,
    /// Quad9 on 5053, for networks blocking the usual port
    Quad9Port,
    /// Google Public DNS
    Google,
    /// Any other resolver URL
    Custom(String),
}

impl DnsProvider {
    /// Resolver endpoint
    pub fn url(&self) -> &str {
        match self {
            Self::Quad9 => "https://dns11.quad9.net/dns-query",
            Self::Quad9Port => "https://dns11.quad9.net:5053/dns-query",
            Self::Google => "https://dns.google/dns-query",
            Self::Custom(url) => url,
        }
    }

    /// Built-in resolvers in race order
    pub fn defaults() -> Vec<Self> {
        vec![Self::Quad9, Self::Quad9Port, Self::Google]
    }
}

impl fmt::Display for DnsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url())
    }
}

/// TXT lookup through one DoH resolver
#[async_trait]
pub trait DohLookup: Send + Sync {
    /// Every TXT string answered for `query`
    async fn lookup_txt(&self, query: &str, provider: &DnsProvider) -> Result<Vec<String>>;
}

/// [`DohLookup`] over `reqwest`
#[derive(Debug, Clone)]
pub struct DohClient {
    client: reqwest::Client,
}

impl DohClient {
    /// Create a client; `timeout` bounds each lookup
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Dns(format!("Failed to build DoH client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DohLookup for DohClient {
    async fn lookup_txt(&self, query: &str, provider: &DnsProvider) -> Result<Vec<String>> {
        let encoded = URL_SAFE_NO_PAD.encode(build_txt_query(query)?);
        debug!("Querying {} for TXT {}", provider, query);

        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                Error::Timeout(format!("DoH query to {} timed out", provider))
            } else {
                Error::Dns(format!("DoH request to {} failed: {}", provider, e))
            }
        };

        let response = self
            .client
            .get(provider.url())
            .query(&[("dns", encoded.as_str())])
            .header(reqwest::header::ACCEPT, DNS_CONTENT_TYPE)
            .send()
            .await
            .map_err(map_err)?;

        let status = response.status();
        if !status.is_success() {
            warn!(provider = %provider, status = %status, "DoH query rejected");
            return Err(Error::Dns(format!("{} answered {}", provider, status)));
        }

        let body = response.bytes().await.map_err(map_err)?;
        let records = parse_txt_answers(&body)?;

        info!(provider = %provider, records = ?records, "Received TXT records");
        Ok(records)
    }
}

/// Wire-format TXT query for `query` (made fully qualified), RD set
pub fn build_txt_query(query: &str) -> Result<Vec<u8>> {
    let fqdn = if query.ends_with('.') {
        query.to_string()
    } else {
        format!("{}.", query)
    };
    let name = Name::from_ascii(&fqdn)
        .map_err(|e| Error::Dns(format!("Invalid query name {}: {}", query, e)))?;

    let mut message = Message::new();
    message
        .set_id(rand::random::<u16>())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::TXT));

    message
        .to_vec()
        .map_err(|e| Error::Dns(format!("Failed to encode DNS query: {}", e)))
}

/// TXT strings from a wire-format response, in answer order
pub fn parse_txt_answers(bytes: &[u8]) -> Result<Vec<String>> {
    let message = Message::from_vec(bytes)
        .map_err(|e| Error::Dns(format!("Failed to decode DNS response: {}", e)))?;

    let mut records = Vec::new();
    for answer in message.answers() {
        if let Some(RData::TXT(txt)) = answer.data() {
            records.extend(
                txt.txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part).into_owned()),
            );
        }
    }

    Ok(records)
}
