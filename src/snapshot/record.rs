//! Connection records as reported by the proxy core's `/connections` stream.
//!
//! Field names follow the core's JSON wire format. Metadata keys the engine
//! does not interpret are carried through untouched so consumers see the
//! same document the core sent, plus the derived rate fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Rates below this many bytes per interval are not worth showing.
pub const VISIBLE_TRAFFIC_THRESHOLD: u64 = 100;

/// One full-state document from the snapshot source.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSnapshot {
    /// Cumulative bytes uploaded across all connections since core start.
    #[serde(default)]
    pub upload_total: u64,

    /// Cumulative bytes downloaded across all connections since core start.
    #[serde(default)]
    pub download_total: u64,

    /// Resident memory of the core, when reported.
    #[serde(default)]
    pub memory: Option<u64>,

    /// Currently open connections. `null` is treated as empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub connections: Vec<ConnectionRecord>,
}

/// A single proxied connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    /// Identifier assigned by the core, stable for the connection's lifetime.
    pub id: String,

    #[serde(default)]
    pub metadata: ConnectionMetadata,

    /// Cumulative bytes uploaded on this connection.
    #[serde(default)]
    pub upload: u64,

    /// Cumulative bytes downloaded on this connection.
    #[serde(default)]
    pub download: u64,

    /// Bytes uploaded since the previous reconciled snapshot.
    #[serde(rename = "curUpload", default, skip_deserializing)]
    pub upload_rate: u64,

    /// Bytes downloaded since the previous reconciled snapshot.
    #[serde(rename = "curDownload", default, skip_deserializing)]
    pub download_rate: u64,

    /// Connection start time as reported by the core (RFC 3339).
    #[serde(default)]
    pub start: String,

    /// Proxy chain, innermost hop first.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub chains: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_payload: Option<String>,
}

/// Destination and origin details. Opaque to the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetadata {
    #[serde(default)]
    pub network: String,

    #[serde(rename = "type", default)]
    pub conn_type: String,

    #[serde(default)]
    pub host: String,

    #[serde(rename = "destinationIP", default)]
    pub destination_ip: String,

    #[serde(default)]
    pub destination_port: String,

    #[serde(rename = "sourceIP", default)]
    pub source_ip: String,

    #[serde(default)]
    pub source_port: String,

    #[serde(default)]
    pub process: String,

    #[serde(default)]
    pub process_path: String,

    /// Keys not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConnectionRecord {
    /// Host name when known, otherwise the destination address.
    pub fn display_host(&self) -> &str {
        if self.metadata.host.is_empty() {
            &self.metadata.destination_ip
        } else {
            &self.metadata.host
        }
    }

    /// Proxy chain rendered outermost hop first, e.g. `"Proxy / HK-01"`.
    pub fn chain_label(&self) -> String {
        let hops: Vec<&str> = self.chains.iter().rev().map(String::as_str).collect();
        hops.join(" / ")
    }

    /// Whether either direction moved enough bytes in the last interval to display.
    pub fn has_visible_traffic(&self) -> bool {
        self.upload_rate >= VISIBLE_TRAFFIC_THRESHOLD
            || self.download_rate >= VISIBLE_TRAFFIC_THRESHOLD
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
