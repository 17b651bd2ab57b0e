//! Protocol message definitions for Ferry.
//!
//! Every control message is a single JSON text message carrying a `Type`
//! discriminant. Decoding reads the discriminant first and only then
//! interprets the remaining fields, so an unknown `Type` is reported as
//! [`Inbound::Unmapped`] rather than as a decode failure.
//!
//! Messages are split by direction: [`Request`] travels client to server and
//! [`Response`] travels server to client. File bytes never appear here; they
//! travel as binary messages (see [`crate::transfer`]).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Largest text message accepted from a peer (128 KiB).
pub const MAX_TEXT_MESSAGE: usize = 128 * 1024;

// =============================================================================
// Envelopes
// =============================================================================

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type", rename_all = "lowercase")]
pub enum Request {
    /// Ask for the greeting, status counters and bandwidth cap.
    Motd,
    /// Change the current directory.
    Cd(CdRequest),
    /// List the current directory.
    Ls,
    /// Download files matching a glob.
    Get(GetRequest),
    /// Announce files about to be uploaded.
    Put(PutRequest),
    /// Trailer following the bytes of one uploaded file.
    PutEnd(TransferEnd),
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type", rename_all = "lowercase")]
pub enum Response {
    /// The request failed; the connection stays usable.
    Error(ErrorResponse),
    /// Greeting and status.
    Motd(MotdResponse),
    /// Directory listing (also returned by a successful `cd`).
    Ls(LsResponse),
    /// Files about to be downloaded, in transfer order.
    Get(GetResponse),
    /// Trailer following the bytes of one downloaded file.
    GetEnd(TransferEnd),
}

/// Type discriminants understood by a message family.
pub trait Tagged {
    const TYPES: &'static [&'static str];

    /// The discriminant of this message.
    fn type_name(&self) -> &'static str;
}

impl Tagged for Request {
    const TYPES: &'static [&'static str] = &["motd", "cd", "ls", "get", "put", "putend"];

    fn type_name(&self) -> &'static str {
        match self {
            Request::Motd => "motd",
            Request::Cd(_) => "cd",
            Request::Ls => "ls",
            Request::Get(_) => "get",
            Request::Put(_) => "put",
            Request::PutEnd(_) => "putend",
        }
    }
}

impl Tagged for Response {
    const TYPES: &'static [&'static str] = &["error", "motd", "ls", "get", "getend"];

    fn type_name(&self) -> &'static str {
        match self {
            Response::Error(_) => "error",
            Response::Motd(_) => "motd",
            Response::Ls(_) => "ls",
            Response::Get(_) => "get",
            Response::GetEnd(_) => "getend",
        }
    }
}

impl Response {
    /// Builds an `Error` response with the given payload text.
    pub fn error(payload: impl Into<String>) -> Self {
        Response::Error(ErrorResponse {
            payload: payload.into(),
        })
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Request to change directory. `Target` is `..` or a child directory name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CdRequest {
    pub target: String,
}

/// Request to download every non-empty file matching a glob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetRequest {
    pub target: String,
}

/// Upload announcement listing files in the order their bytes will follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct PutRequest {
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

/// Download announcement listing files in the order their bytes will follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct GetResponse {
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

/// Trailer carrying the lowercase hex SHA-256 of the file just sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEnd {
    #[serde(rename = "HashSHA256")]
    pub hash_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorResponse {
    pub payload: String,
}

/// Greeting plus the server's current view of the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MotdResponse {
    pub message: String,
    pub current_directory: String,
    /// Advertised bandwidth cap; 0 means unlimited.
    pub megabit_per_second_limit: f64,
    pub status: StatusSnapshot,
}

/// Contents of the current directory. Collections are always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct LsResponse {
    pub current_directory: String,
    #[serde(default)]
    pub dirs: Vec<FileEntry>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

/// Point-in-time copy of the server's process-wide counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusSnapshot {
    #[serde(with = "timestamp")]
    pub start_time: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub binary_bytes_sent: u64,
    pub binary_bytes_received: u64,
    pub binary_gigabytes_sent: f64,
    pub binary_gigabytes_received: f64,
    pub text_messages_sent: u64,
    pub text_messages_received: u64,
}

impl StatusSnapshot {
    /// Builds a snapshot, deriving uptime and the decimal gigabyte figures.
    pub fn new(
        start_time: DateTime<Utc>,
        now: DateTime<Utc>,
        binary_bytes_sent: u64,
        binary_bytes_received: u64,
        text_messages_sent: u64,
        text_messages_received: u64,
    ) -> Self {
        let uptime_seconds = (now - start_time).num_seconds().max(0) as u64;
        Self {
            start_time,
            uptime_seconds,
            binary_bytes_sent,
            binary_bytes_received,
            binary_gigabytes_sent: binary_bytes_sent as f64 / 1e9,
            binary_gigabytes_received: binary_bytes_received as f64 / 1e9,
            text_messages_sent,
            text_messages_received,
        }
    }
}

// =============================================================================
// File entries
// =============================================================================

/// Kind of a listed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Dir,
    File,
}

/// A file or directory as it appears in listings and transfer announcements.
///
/// `Name` is relative to the directory the listing was taken in and always
/// uses `/` as separator. For directories `Length` is the recursive sum of
/// descendant file lengths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileEntry {
    pub name: String,
    #[serde(with = "timestamp")]
    pub modified: DateTime<Utc>,
    pub length: u64,
    pub kind: FileKind,
}

impl FileEntry {
    pub fn file(name: impl Into<String>, length: u64, modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            modified,
            length,
            kind: FileKind::File,
        }
    }

    pub fn dir(name: impl Into<String>, length: u64, modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            modified,
            length,
            kind: FileKind::Dir,
        }
    }
}

/// Fixed-width RFC 3339 timestamps (millisecond precision, `Z` suffix) so
/// that lexical order matches chronological order.
mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Result of decoding an incoming text message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound<T> {
    /// A message of a known type.
    Known(T),
    /// A well-formed message whose `Type` is not part of this family.
    Unmapped(String),
}

#[derive(Deserialize)]
struct Discriminant {
    #[serde(rename = "Type")]
    kind: String,
}

/// Decodes a text message, reading the `Type` discriminant first.
///
/// Oversized or malformed input is an error (fatal to the connection); an
/// unrecognised `Type` is not.
pub fn decode<T>(text: &str) -> Result<Inbound<T>>
where
    T: Tagged + DeserializeOwned,
{
    if text.len() > MAX_TEXT_MESSAGE {
        return Err(ProtocolError::MessageTooLarge {
            size: text.len(),
            max: MAX_TEXT_MESSAGE,
        });
    }

    let value: serde_json::Value = serde_json::from_str(text)?;
    let Discriminant { kind } = Discriminant::deserialize(&value)?;

    if !T::TYPES.contains(&kind.as_str()) {
        return Ok(Inbound::Unmapped(kind));
    }

    Ok(Inbound::Known(T::deserialize(value)?))
}

/// Encodes a message as a JSON string.
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    serde_json::to_string(message).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_request_wire_shape() {
        let cd = Request::Cd(CdRequest {
            target: "sub".into(),
        });
        assert_eq!(encode(&cd).unwrap(), r#"{"Type":"cd","Target":"sub"}"#);
        assert_eq!(encode(&Request::Motd).unwrap(), r#"{"Type":"motd"}"#);
        assert_eq!(
            encode(&Request::PutEnd(TransferEnd {
                hash_sha256: "ab".into()
            }))
            .unwrap(),
            r#"{"Type":"putend","HashSHA256":"ab"}"#
        );
    }

    #[test]
    fn test_empty_listing_serializes_arrays() {
        let ls = Response::Ls(LsResponse {
            current_directory: "/".into(),
            ..Default::default()
        });
        let json = encode(&ls).unwrap();
        assert_eq!(
            json,
            r#"{"Type":"ls","CurrentDirectory":"/","Dirs":[],"Files":[]}"#
        );
    }

    #[test]
    fn test_file_entry_shape() {
        let entry = FileEntry::file("a.txt", 10, at(0));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["Name"], "a.txt");
        assert_eq!(json["Length"], 10);
        assert_eq!(json["Kind"], "File");
        assert_eq!(json["Modified"], "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let early = serde_json::to_string(&FileEntry::file("a", 1, at(9))).unwrap();
        let late = serde_json::to_string(&FileEntry::file("a", 1, at(10))).unwrap();
        let stamp = |s: &str| s.split("\"Modified\":\"").nth(1).unwrap()[..24].to_string();
        assert!(stamp(&early) < stamp(&late));
    }

    #[test]
    fn test_decode_known_request() {
        let decoded: Inbound<Request> = decode(r#"{"Type":"get","Target":"*.txt"}"#).unwrap();
        assert_eq!(
            decoded,
            Inbound::Known(Request::Get(GetRequest {
                target: "*.txt".into()
            }))
        );
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let decoded: Inbound<Request> = decode(r#"{"Type":"ls","Payload":null}"#).unwrap();
        assert_eq!(decoded, Inbound::Known(Request::Ls));
    }

    #[test]
    fn test_decode_unmapped_type() {
        let decoded: Inbound<Request> = decode(r#"{"Type":"rm","Target":"x"}"#).unwrap();
        assert_eq!(decoded, Inbound::Unmapped("rm".into()));
    }

    #[test]
    fn test_response_type_is_unmapped_as_request() {
        let decoded: Inbound<Request> = decode(r#"{"Type":"getend","HashSHA256":"x"}"#).unwrap();
        assert_eq!(decoded, Inbound::Unmapped("getend".into()));
    }

    #[test]
    fn test_decode_malformed() {
        for text in ["not json", r#"{"Target":"x"}"#, r#"{"Type":"cd"}"#, "[1,2]"] {
            let result = decode::<Request>(text);
            assert!(
                matches!(result, Err(ProtocolError::MalformedMessage(_))),
                "{text}: {result:?}"
            );
        }
    }

    #[test]
    fn test_decode_oversized() {
        let text = format!(
            r#"{{"Type":"cd","Target":"{}"}}"#,
            "x".repeat(MAX_TEXT_MESSAGE)
        );
        assert!(matches!(
            decode::<Request>(&text),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_response_with_missing_collections() {
        let decoded: Inbound<Response> = decode(r#"{"Type":"get"}"#).unwrap();
        assert_eq!(decoded, Inbound::Known(Response::Get(GetResponse::default())));
    }

    #[test]
    fn test_status_snapshot_derived_fields() {
        let snapshot = StatusSnapshot::new(at(100), at(160), 2_500_000_000, 0, 3, 4);
        assert_eq!(snapshot.uptime_seconds, 60);
        assert!((snapshot.binary_gigabytes_sent - 2.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.binary_gigabytes_received, 0.0);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["TextMessagesSent"], 3);
        assert_eq!(json["StartTime"], "1970-01-01T00:01:40.000Z");
    }

    #[test]
    fn test_type_names_match_wire_tags() {
        let requests = [
            Request::Motd,
            Request::Ls,
            Request::Cd(CdRequest { target: "x".into() }),
            Request::Get(GetRequest { target: "x".into() }),
            Request::Put(PutRequest::default()),
            Request::PutEnd(TransferEnd {
                hash_sha256: "x".into(),
            }),
        ];
        for request in requests {
            let value = serde_json::to_value(&request).unwrap();
            assert_eq!(value["Type"], request.type_name());
            assert!(Request::TYPES.contains(&request.type_name()));
        }
    }
}
