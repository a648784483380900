//! Control Protocol
//!
//! HTTP/JSON messages exchanged between peers on the control port, and the
//! route table both the server and the clients build URLs from.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Protocol version reported by `get-server-info`
pub const PROTOCOL_VERSION: u32 = 1;

/// Header carrying the sender's device id on uploads
pub const TRANSFER_ID_HEADER: &str = "x-transfer-id";

/// Route table
pub mod routes {
    pub const SERVER_INFO: &str = "/get-server-info";
    pub const CHECK_PAIRING: &str = "/check-pairing-requests";
    pub const REQUEST_CONNECT: &str = "/request-connect";
    pub const RESPOND_TO_CONNECTION: &str = "/respond-to-connection";
    pub const TRANSFER_STATUS: &str = "/transfer-status";
    pub const DOWNLOAD: &str = "/download";
    pub const UPLOAD: &str = "/upload";
    pub const TRANSFER_FINISH: &str = "/transfer-finish";
    pub const CANCEL_TRANSFER: &str = "/cancel-transfer";
    pub const CANCEL_PAIRING: &str = "/cancel-pairing";
}

/// Build an absolute URL for a route on a peer
pub fn peer_url(peer: SocketAddr, path: &str) -> String {
    format!("http://{}{}", peer, path)
}

/// URL of a per-device route such as `/transfer-status/{pollId}`
pub fn device_url(peer: SocketAddr, route: &str, device_id: &str) -> String {
    format!("http://{}{}/{}", peer, route, device_id)
}

/// URL of one file's download
pub fn download_url(peer: SocketAddr, device_id: &str, file_index: usize) -> String {
    format!("http://{}{}/{}/{}", peer, routes::DOWNLOAD, device_id, file_index)
}

/// Pairing and connection status as reported on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingStatus {
    Pending,
    Accepted,
    Declined,
    Cancelled,
    None,
}

impl fmt::Display for PairingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PairingStatus::Pending => "pending",
            PairingStatus::Accepted => "accepted",
            PairingStatus::Declined => "declined",
            PairingStatus::Cancelled => "cancelled",
            PairingStatus::None => "none",
        };
        f.write_str(s)
    }
}

/// One file in a manifest (no content)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default = "default_mime")]
    pub mime: String,
}

fn default_mime() -> String {
    "application/octet-stream".to_string()
}

/// Response of `get-server-info`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub device_id: String,
    pub platform: String,
    pub version: String,
    pub protocol_version: u32,
}

/// A request to pair, as seen by the device asked to accept it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    pub requestor_id: String,
    pub requestor_name: String,
    #[serde(default)]
    pub requestor_os: String,
    #[serde(default)]
    pub requestor_platform: String,
    #[serde(default)]
    pub files: Vec<ManifestEntry>,
    /// Address of the peer holding this request, attached by the poller
    #[serde(skip)]
    pub peer_address: Option<SocketAddr>,
}

impl PairingRequest {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Response of `check-pairing-requests/{pollId}`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PairingPoll {
    pub status: PairingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<PairingRequest>,
}

/// Body of `request-connect`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub device_id: String,
    pub name: String,
    pub platform: String,
    pub brand: String,
    pub total_files: usize,
    pub total_size: u64,
    pub files: Vec<ManifestEntry>,
}

impl ConnectRequest {
    /// How the receiving side presents this request
    pub fn to_pairing_request(&self) -> PairingRequest {
        PairingRequest {
            requestor_id: self.device_id.clone(),
            requestor_name: self.name.clone(),
            requestor_os: self.platform.clone(),
            requestor_platform: self.brand.clone(),
            files: self.files.clone(),
            peer_address: None,
        }
    }
}

/// Response of `request-connect`, and generic `{status}` replies
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: PairingStatus,
}

/// Body of `respond-to-connection`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondToConnection {
    pub device_id: String,
    pub accepted: bool,
}

/// Transfer readiness on the hosting peer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyStatus {
    Ready,
    None,
}

/// Response of `transfer-status/{pollId}`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferStatusReply {
    pub status: ReadyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<ManifestEntry>>,
}

/// Response of `upload`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadReply {
    pub status: String,
    pub name: String,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_request_wire_names() {
        let request = ConnectRequest {
            device_id: "050".to_string(),
            name: "Swift Otter".to_string(),
            platform: "linux".to_string(),
            brand: "desk".to_string(),
            total_files: 1,
            total_size: 1000,
            files: vec![ManifestEntry {
                name: "a.jpg".to_string(),
                size: 1000,
                mime: "image/jpeg".to_string(),
            }],
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["deviceId"], "050");
        assert_eq!(json["totalFiles"], 1);
        assert_eq!(json["totalSize"], 1000);
        assert_eq!(json["files"][0]["type"], "image/jpeg");
    }

    #[test]
    fn test_pairing_poll_parses_without_request() {
        let poll: PairingPoll = serde_json::from_str(r#"{"status":"none"}"#).unwrap();
        assert_eq!(poll.status, PairingStatus::None);
        assert!(poll.request.is_none());

        let poll: PairingPoll = serde_json::from_str(
            r#"{"status":"pending","request":{"requestorId":"12","requestorName":"Calm Fox","files":[{"name":"b.pdf","size":2000}]}}"#,
        )
        .unwrap();
        let request = poll.request.unwrap();
        assert_eq!(request.requestor_id, "12");
        assert_eq!(request.files[0].mime, "application/octet-stream");
        assert_eq!(request.total_size(), 2000);
    }

    #[test]
    fn test_urls() {
        let peer: SocketAddr = "192.168.1.20:3030".parse().unwrap();
        assert_eq!(
            download_url(peer, "050", 2),
            "http://192.168.1.20:3030/download/050/2"
        );
        assert_eq!(
            device_url(peer, routes::CANCEL_TRANSFER, "050"),
            "http://192.168.1.20:3030/cancel-transfer/050"
        );
    }
}
