use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Error produced when an ingest payload cannot be turned into an
/// [`AuditEvent`]. Decode failures are reported back to the host for
/// redelivery; they never stop the pipeline.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed audit event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("audit event has no region")]
    MissingRegion,
}

/// Identity of the principal that issued the recorded API call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserIdentity {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "principalId", default)]
    pub principal_id: String,
    #[serde(default)]
    pub arn: String,
}

/// A single cloud audit event, decoded from the host's delivery payload.
/// Immutable after decode; owned by the ingest pipeline until flushed.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditEvent {
    #[serde(rename = "eventVersion", default)]
    pub event_version: String,
    #[serde(rename = "userIdentity", default)]
    pub user_identity: UserIdentity,
    #[serde(rename = "eventTime")]
    pub event_time: DateTime<Utc>,
    #[serde(rename = "eventSource", default)]
    pub event_source: String,
    #[serde(rename = "eventName")]
    pub event_name: String,
    #[serde(rename = "awsRegion", default)]
    pub region: String,
    #[serde(rename = "sourceIPAddress", default)]
    pub source_ip: String,
    #[serde(rename = "userAgent", default)]
    pub user_agent: String,
    #[serde(rename = "requestID", default)]
    pub request_id: String,
    #[serde(rename = "eventID", default)]
    pub event_id: String,
}

impl AuditEvent {
    /// Decodes an audit event from a raw JSON payload. Events without a
    /// region tag cannot be sharded and are rejected.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let event: Self = serde_json::from_str(raw)?;
        if event.region.is_empty() {
            return Err(DecodeError::MissingRegion);
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "eventVersion": "1.08",
        "userIdentity": {"type": "AssumedRole", "principalId": "AROA123", "arn": "arn:aws:sts::123:assumed-role/ops"},
        "eventTime": "2024-05-01T10:15:30Z",
        "eventSource": "ec2.amazonaws.com",
        "eventName": "DescribeInstances",
        "awsRegion": "us-east-1",
        "sourceIPAddress": "10.0.0.1",
        "userAgent": "aws-cli/2.15",
        "requestID": "req-1",
        "eventID": "evt-1"
    }"#;

    #[test]
    fn test_decode_full_event() {
        let event = AuditEvent::decode(SAMPLE).expect("decode");
        assert_eq!(event.event_name, "DescribeInstances");
        assert_eq!(event.region, "us-east-1");
        assert_eq!(event.user_identity.kind, "AssumedRole");
        assert_eq!(event.event_time.timestamp(), 1_714_558_530);
    }

    #[test]
    fn test_decode_minimal_event() {
        let raw = r#"{"eventTime": "2024-05-01T00:00:00Z", "eventName": "ListBuckets", "awsRegion": "eu-west-1"}"#;
        let event = AuditEvent::decode(raw).expect("decode");
        assert_eq!(event.event_name, "ListBuckets");
        assert_eq!(event.region, "eu-west-1");
        assert!(event.event_source.is_empty());
    }

    #[test]
    fn test_decode_missing_region() {
        let raw = r#"{"eventTime": "2024-05-01T00:00:00Z", "eventName": "ListBuckets"}"#;
        let err = AuditEvent::decode(raw).unwrap_err();
        assert!(matches!(err, DecodeError::MissingRegion));
    }

    #[test]
    fn test_decode_malformed_json() {
        let err = AuditEvent::decode("{not json").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_decode_missing_time_is_malformed() {
        let raw = r#"{"eventName": "ListBuckets", "awsRegion": "eu-west-1"}"#;
        let err = AuditEvent::decode(raw).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }
}
