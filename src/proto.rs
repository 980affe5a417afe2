//! Control-plane wire messages.
//!
//! Every frame exchanged between the gateway and an agent is a
//! protobuf-encoded [`Envelope`] carried as a single WebSocket binary
//! message. The payload is a tagged oneof; receivers dispatch on the tag and
//! discard frames whose tag they do not know, which keeps the protocol
//! forward-compatible.
//!
//! Messages are hand-tagged prost structs rather than build-time codegen so
//! the wire schema lives next to the code that speaks it.

use chrono::Utc;
use uuid::Uuid;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    /// Sender identity. Must match any agent_id embedded in the payload.
    #[prost(string, tag = "1")]
    pub agent_id: String,
    /// Opaque correlation token, echoed in replies.
    #[prost(string, tag = "2")]
    pub request_id: String,
    /// Wall-clock milliseconds at send time.
    #[prost(int64, tag = "3")]
    pub timestamp_ms: i64,
    #[prost(oneof = "envelope::Payload", tags = "10, 11, 12, 13, 14, 15, 16")]
    pub payload: Option<envelope::Payload>,
}

pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "10")]
        Register(super::Register),
        #[prost(message, tag = "11")]
        RegisterAck(super::RegisterAck),
        #[prost(message, tag = "12")]
        Heartbeat(super::Heartbeat),
        #[prost(message, tag = "13")]
        HeartbeatAck(super::HeartbeatAck),
        #[prost(message, tag = "14")]
        RequestJob(super::RequestJob),
        #[prost(message, tag = "15")]
        JobAssigned(super::JobAssigned),
        #[prost(message, tag = "16")]
        JobStatus(super::JobStatus),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Register {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(string, tag = "2")]
    pub agent_token: String,
    #[prost(string, tag = "3")]
    pub hostname: String,
    #[prost(int32, tag = "4")]
    pub max_concurrency: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterAck {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(uint32, tag = "3")]
    pub heartbeat_interval_sec: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Heartbeat {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(bool, tag = "2")]
    pub paused: bool,
    #[prost(int32, tag = "3")]
    pub running_jobs: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatAck {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestJob {
    #[prost(string, tag = "1")]
    pub agent_id: String,
}

/// Signed access to a single object. The presigned URL variant is usable by
/// a bare HTTP client; the STS variant is reserved and rejected by agents.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StorageAccess {
    #[prost(oneof = "storage_access::Auth", tags = "1, 2")]
    pub auth: Option<storage_access::Auth>,
}

pub mod storage_access {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Auth {
        #[prost(string, tag = "1")]
        PresignedUrl(String),
        #[prost(message, tag = "2")]
        Sts(super::StsCredential),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StsCredential {
    #[prost(string, tag = "1")]
    pub access_key_id: String,
    #[prost(string, tag = "2")]
    pub secret_access_key: String,
    #[prost(string, tag = "3")]
    pub session_token: String,
    #[prost(int64, tag = "4")]
    pub expires_at_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeaderPair {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ForwardHttpSpec {
    #[prost(string, tag = "1")]
    pub url: String,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(message, repeated, tag = "3")]
    pub headers: Vec<HeaderPair>,
    #[prost(bytes = "vec", tag = "4")]
    pub body: Vec<u8>,
    #[prost(uint32, tag = "5")]
    pub timeout_sec: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobAssigned {
    #[prost(string, tag = "1")]
    pub job_id: String,
    #[prost(int32, tag = "2")]
    pub attempt_id: i32,
    #[prost(string, tag = "3")]
    pub lease_id: String,
    #[prost(uint32, tag = "4")]
    pub lease_ttl_sec: u32,
    /// Absent when the job has no input object.
    #[prost(message, optional, tag = "5")]
    pub input_access: Option<StorageAccess>,
    #[prost(string, tag = "6")]
    pub input_key: String,
    #[prost(message, optional, tag = "7")]
    pub output_access: Option<StorageAccess>,
    #[prost(string, tag = "8")]
    pub output_prefix: String,
    #[prost(string, tag = "9")]
    pub output_key: String,
    #[prost(string, tag = "10")]
    pub command: String,
    #[prost(enumeration = "JobKind", tag = "11")]
    pub job_type: i32,
    #[prost(message, optional, tag = "12")]
    pub forward_http: Option<ForwardHttpSpec>,
    #[prost(enumeration = "InputForwardModeCode", tag = "13")]
    pub input_forward_mode: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobStatus {
    #[prost(string, tag = "1")]
    pub job_id: String,
    #[prost(int32, tag = "2")]
    pub attempt_id: i32,
    #[prost(enumeration = "JobState", tag = "3")]
    pub status: i32,
    #[prost(string, tag = "4")]
    pub message: String,
    #[prost(string, tag = "5")]
    pub output_key: String,
    #[prost(string, tag = "6")]
    pub stdout: String,
    #[prost(string, tag = "7")]
    pub stderr: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum JobState {
    Unspecified = 0,
    Pending = 1,
    Assigned = 2,
    Running = 3,
    Succeeded = 4,
    Failed = 5,
    Canceled = 6,
    Lost = 7,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum JobKind {
    Unspecified = 0,
    Command = 1,
    ForwardHttp = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum InputForwardModeCode {
    Unspecified = 0,
    Url = 1,
    LocalFile = 2,
}

/// Wall-clock milliseconds for envelope timestamps.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Wraps a payload in an envelope stamped with the sender identity.
pub fn envelope(agent_id: &str, payload: envelope::Payload) -> Envelope {
    Envelope {
        agent_id: agent_id.to_string(),
        request_id: new_request_id(),
        timestamp_ms: now_ms(),
        payload: Some(payload),
    }
}

/// Echo reply: keeps the caller's request_id for correlation.
pub fn reply(request_id: &str, payload: envelope::Payload) -> Envelope {
    Envelope {
        agent_id: String::new(),
        request_id: request_id.to_string(),
        timestamp_ms: now_ms(),
        payload: Some(payload),
    }
}

/// The agent identity embedded in a payload, for consistency checks against
/// the envelope. Payload kinds without an embedded identity return None.
pub fn payload_agent_id(payload: &envelope::Payload) -> Option<&str> {
    match payload {
        envelope::Payload::Register(r) => Some(&r.agent_id),
        envelope::Payload::Heartbeat(h) => Some(&h.agent_id),
        envelope::Payload::RequestJob(r) => Some(&r.agent_id),
        _ => None,
    }
}
