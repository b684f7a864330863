//! Wire types for the cloud control hub.
//!
//! The in-band message channel carries one JSON envelope per frame. The
//! envelope's `type` field selects how `body` should be interpreted, but the
//! hub does not require every `type` to have a registered shape: unknown
//! types pass `body` through untouched (see `kind` below and the hub's
//! default-branch fan-out).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Frozen `type` strings used by the in-band envelope.
///
/// These are plain string constants rather than a closed enum because the
/// hub must also forward `type` values it has never heard of (a device's
/// custom event, for instance) without failing to deserialize.
pub mod kind {
    pub const CONTROL_DEVICES: &str = "control/devices";
    pub const CONTROL_REFRESH: &str = "control/refresh";
    pub const CONTROL_COMMAND: &str = "control/command";
    pub const CONTROL_COMMANDS: &str = "control/commands";
    pub const CONTROL_HTTP: &str = "control/http";
    pub const CONTROL_HTTP_BIN: &str = "control/http-bin";
    pub const CONTROL_LOG_SUBSCRIBE: &str = "control/log/subscribe";
    pub const CONTROL_LOG_UNSUBSCRIBE: &str = "control/log/unsubscribe";
    pub const APP_STATE: &str = "app/state";
    pub const SYSTEM_LOG_PUSH: &str = "system/log/push";
    pub const SYSTEM_LOG_SUBSCRIBE: &str = "system/log/subscribe";
    pub const SYSTEM_LOG_UNSUBSCRIBE: &str = "system/log/unsubscribe";
    pub const HTTP_RESPONSE_BIN: &str = "http/response-bin";
    pub const FILE_PUT: &str = "file/put";
    pub const TRANSFER_FETCH: &str = "transfer/fetch";
    pub const TRANSFER_FETCH_COMPLETE: &str = "transfer/fetch/complete";
    pub const TRANSFER_SEND: &str = "transfer/send";
    pub const TRANSFER_PROGRESS: &str = "transfer/progress";
    pub const SCRIPT_RUN: &str = "script/run";
    pub const DEVICE_MESSAGE: &str = "device/message";
}

/// Frozen error codes reported in `ErrorMessage.code` and in the HTTP
/// error envelope's `code` field.
pub mod error_codes {
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const MALFORMED_MESSAGE: &str = "MALFORMED_MESSAGE";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const EXPIRED: &str = "EXPIRED";
    pub const DIRECTION_MISMATCH: &str = "DIRECTION_MISMATCH";
    pub const CONFLICT: &str = "CONFLICT";
    pub const DEVICE_OFFLINE: &str = "DEVICE_OFFLINE";
    pub const IO_ERROR: &str = "IO_ERROR";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INVALID_PATH: &str = "INVALID_PATH";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
}

/// The in-band message envelope (§6 of the spec).
///
/// `ts`/`nonce`/`sign` are present on authenticated control frames;
/// `udid` is stamped by the hub on frames it fans out from a device;
/// `request_id` correlates request/response and fetch/complete pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default = "default_body")]
    pub body: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sign: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udid: Option<String>,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_body() -> serde_json::Value {
    serde_json::Value::Null
}

impl Envelope {
    pub fn new(msg_type: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            body,
            ts: None,
            nonce: None,
            sign: None,
            udid: None,
            request_id: None,
            error: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_udid(mut self, udid: impl Into<String>) -> Self {
        self.udid = Some(udid.into());
        self
    }

    /// Decode `body` into a typed struct. Handlers that only route frames
    /// (the default branch, `app/state`, `system/log/push`) should use
    /// `self.body` directly instead of calling this.
    pub fn decode_body<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.body.clone())
    }
}

// ---------------------------------------------------------------------------
// control/command, control/commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub devices: Vec<String>,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsRequest {
    pub devices: Vec<String>,
    pub commands: Vec<CommandSpec>,
}

/// The frame a device actually receives for a single command: the `devices`
/// list is stripped, leaving just the command itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCommand {
    #[serde(rename = "type")]
    pub command_type: String,
    pub body: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Maps a known user-visible command type to a short status template used
/// in the `device/message` broadcast that precedes dispatch. `{device}` is
/// substituted with the target UDID.
pub fn command_status_template(command_type: &str) -> Option<&'static str> {
    match command_type {
        "run" => Some("Running command on {device}"),
        "stop" => Some("Stopping {device}"),
        "reboot" => Some("Rebooting {device}"),
        "lock" => Some("Locking {device}"),
        "shutdown" => Some("Shutting down {device}"),
        "wipe" => Some("Wiping {device}"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// control/log/subscribe, control/log/unsubscribe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSubscriptionRequest {
    pub device: String,
}

// ---------------------------------------------------------------------------
// control/http, control/http-bin
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpProxyRequest {
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Base64-encoded body, present for both text and binary proxy frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpProxyResponse {
    pub request_id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// `http/response-bin` from a device: `body_size == 0` marks the terminal
/// frame for the conversation, at which point the binary route is torn down.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponseBin {
    pub request_id: String,
    pub body_size: u64,
}

// ---------------------------------------------------------------------------
// file/put, transfer/fetch, transfer/fetch/complete, transfer/send
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePut {
    pub target_path: String,
    /// Base64-encoded file contents.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFetch {
    pub request_id: String,
    pub url: String,
    pub target_path: String,
    pub md5: String,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSend {
    pub request_id: String,
    pub url: String,
    pub source_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFetchComplete {
    #[serde(default)]
    pub request_id: Option<String>,
    /// Legacy fallback match key when `request_id` is absent.
    #[serde(default)]
    pub target_path: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub token: String,
    pub bytes_sent: u64,
    pub total_bytes: u64,
    pub percent: u8,
}

// ---------------------------------------------------------------------------
// script/run, device/message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRun {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udid: Option<String>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Binary frame header (§4.6)
// ---------------------------------------------------------------------------

pub const BINARY_HEADER_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryFrameHeader {
    pub request_id: [u8; 16],
    pub seq: u32,
    pub total: u32,
}

impl BinaryFrameHeader {
    pub fn is_last(&self) -> bool {
        self.seq + 1 >= self.total
    }

    pub fn request_id_hex(&self) -> String {
        self.request_id.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Splits a raw binary frame into its fixed header and trailing payload.
/// Returns `None` when the frame is shorter than `BINARY_HEADER_LEN`.
pub fn parse_binary_frame(bytes: &[u8]) -> Option<(BinaryFrameHeader, &[u8])> {
    if bytes.len() < BINARY_HEADER_LEN {
        return None;
    }
    let mut request_id = [0u8; 16];
    request_id.copy_from_slice(&bytes[0..16]);
    let seq = u32::from_be_bytes(bytes[16..20].try_into().ok()?);
    let total = u32::from_be_bytes(bytes[20..24].try_into().ok()?);
    Some((
        BinaryFrameHeader {
            request_id,
            seq,
            total,
        },
        &bytes[BINARY_HEADER_LEN..],
    ))
}

/// Encodes a header + payload back into a single binary frame.
pub fn encode_binary_frame(header: BinaryFrameHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BINARY_HEADER_LEN + payload.len());
    out.extend_from_slice(&header.request_id);
    out.extend_from_slice(&header.seq.to_be_bytes());
    out.extend_from_slice(&header.total.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

// ---------------------------------------------------------------------------
// HTTP surface (§6)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTokenRequest {
    #[serde(rename = "type")]
    pub direction: TokenDirection,
    pub device_sn: String,
    #[serde(default)]
    pub category: Option<String>,
    pub path: String,
    #[serde(default)]
    pub target_path: Option<String>,
    #[serde(default)]
    pub expire_secs: Option<u64>,
    #[serde(default)]
    pub one_time: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenDirection {
    Download,
    Upload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTokenResponse {
    pub token: String,
    pub url: String,
    #[serde(rename = "type")]
    pub direction: TokenDirection,
    pub expires_at: String,
    pub total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    pub bytes: u64,
    pub md5: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushToDeviceRequest {
    pub device_sn: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub path: String,
    #[serde(default)]
    pub target_path: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub server_base_url: Option<String>,
    #[serde(default)]
    pub shared_source_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullFromDeviceRequest {
    pub device_sn: String,
    pub path: String,
    #[serde(default)]
    pub server_base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptDispatchRequest {
    pub devices: Vec<String>,
    pub script_name: String,
    #[serde(default)]
    pub config_overlay: Option<serde_json::Value>,
    #[serde(default)]
    pub server_base_url: Option<String>,
}

/// Frozen HTTP error envelope used by all non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
