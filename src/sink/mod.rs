pub mod flush;
pub mod http;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};

use crate::region::RegionMap;

/// One log event as the sink accepts it: a millisecond timestamp plus the
/// serialized message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputLogEvent {
    pub timestamp_ms: i64,
    pub message: String,
}

/// A page of names from a cursor-paginated describe call.
#[derive(Debug, Clone, Default)]
pub struct DescribePage {
    pub names: Vec<String>,
    pub next_token: Option<String>,
}

/// Errors surfaced by a sink client.
///
/// `AlreadyExists` and `OperationAborted` are distinguished because the
/// bootstrap path treats both as success when racing another process for
/// group or stream creation.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("resource already exists")]
    AlreadyExists,

    #[error("operation aborted by a concurrent change")]
    OperationAborted,

    #[error("sink rejected the request: {0}")]
    Rejected(String),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Capability set the core consumes from a regional log sink.
///
/// Implementations vary per backend or test fake; the core depends only on
/// this trait. One client is bound to exactly one region.
#[async_trait]
pub trait LogsClient: Send + Sync {
    /// The region this client is bound to.
    fn region(&self) -> &str;

    /// Submits a batch of log events to a stream in one call. The sink
    /// accepts or rejects the batch atomically.
    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        events: Vec<InputLogEvent>,
    ) -> Result<(), SinkError>;

    /// Creates a log group.
    async fn create_log_group(&self, group: &str) -> Result<(), SinkError>;

    /// Creates a log stream inside a group.
    async fn create_log_stream(&self, group: &str, stream: &str) -> Result<(), SinkError>;

    /// Lists log group names matching a prefix, one page per call.
    async fn describe_log_groups(
        &self,
        prefix: &str,
        cursor: Option<&str>,
    ) -> Result<DescribePage, SinkError>;

    /// Lists log stream names in a group matching a prefix, one page per call.
    async fn describe_log_streams(
        &self,
        group: &str,
        prefix: &str,
        cursor: Option<&str>,
    ) -> Result<DescribePage, SinkError>;
}

/// Shared handle to a regional sink client.
pub type SharedLogsClient = Arc<dyn LogsClient>;

/// Pages through the group listing and creates the group when no exact
/// match exists. A creation race lost to another process is success.
pub async fn ensure_log_group(client: &dyn LogsClient, group: &str) -> Result<()> {
    let mut cursor: Option<String> = None;
    loop {
        let page = client
            .describe_log_groups(group, cursor.as_deref())
            .await
            .with_context(|| format!("[{}] describe log groups", client.region()))?;

        if page.names.iter().any(|name| name == group) {
            return Ok(());
        }

        match page.next_token {
            Some(token) => cursor = Some(token),
            None => break,
        }
    }

    match client.create_log_group(group).await {
        Ok(()) => Ok(()),
        Err(SinkError::AlreadyExists) | Err(SinkError::OperationAborted) => Ok(()),
        Err(e) => {
            Err(e).with_context(|| format!("[{}] create log group {group:?}", client.region()))
        }
    }
}

/// Same pattern as [`ensure_log_group`], for a stream inside a group.
pub async fn ensure_log_stream(client: &dyn LogsClient, group: &str, stream: &str) -> Result<()> {
    let mut cursor: Option<String> = None;
    loop {
        let page = client
            .describe_log_streams(group, stream, cursor.as_deref())
            .await
            .with_context(|| format!("[{}] describe log streams", client.region()))?;

        if page.names.iter().any(|name| name == stream) {
            return Ok(());
        }

        match page.next_token {
            Some(token) => cursor = Some(token),
            None => break,
        }
    }

    match client.create_log_stream(group, stream).await {
        Ok(()) => Ok(()),
        Err(SinkError::AlreadyExists) | Err(SinkError::OperationAborted) => Ok(()),
        Err(e) => {
            Err(e).with_context(|| format!("[{}] create log stream {stream:?}", client.region()))
        }
    }
}

/// For each configured region: build a client, ensure the log group and
/// stream exist, and store the client in the returned region map. Any
/// non-tolerated failure aborts boot.
pub async fn bootstrap_regions(
    regions: &[String],
    group: &str,
    stream: &str,
    factory: impl Fn(&str) -> Result<SharedLogsClient>,
) -> Result<RegionMap<SharedLogsClient>> {
    let clients = RegionMap::new();

    for region in regions {
        let client = factory(region).with_context(|| format!("[{region}] client init"))?;

        ensure_log_group(client.as_ref(), group).await?;
        ensure_log_stream(client.as_ref(), group, stream).await?;

        debug!(region = %region, group, stream, "sink resources ready");
        clients.insert(region.clone(), client);
    }

    info!(
        regions = clients.len(),
        group, stream, "sink bootstrap complete",
    );

    Ok(clients)
}

/// Region tags clients may be bound to.
const VALID_REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "af-south-1",
    "ap-east-1",
    "ap-south-1",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-northeast-3",
    "ap-southeast-1",
    "ap-southeast-2",
    "ca-central-1",
    "eu-central-1",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "eu-north-1",
    "me-south-1",
    "sa-east-1",
];

/// Returns true for a known region tag.
pub fn is_valid_region(region: &str) -> bool {
    VALID_REGIONS.contains(&region)
}

/// Builds a stream name unique to this process instance so that multiple
/// instances sharing a group do not collide: a sortable UTC timestamp
/// followed by the hostname.
pub fn stream_name() -> String {
    let ts = Utc::now().format("%Y/%m/%d/%H/%M/%S%.3f");
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{ts}-{host}")
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingClient;
    use super::*;

    #[tokio::test]
    async fn test_ensure_group_creates_when_absent() {
        let client = RecordingClient::new("us-east-1");
        ensure_log_group(&client, "quotas").await.expect("ensure");
        assert_eq!(*client.created_groups.lock().unwrap(), vec!["quotas"]);
    }

    #[tokio::test]
    async fn test_ensure_group_finds_across_pages() {
        let client = RecordingClient::new("us-east-1");
        client.group_pages.lock().unwrap().extend([
            DescribePage {
                names: vec!["quotas-other".to_string()],
                next_token: Some("page2".to_string()),
            },
            DescribePage {
                names: vec!["quotas".to_string()],
                next_token: None,
            },
        ]);

        ensure_log_group(&client, "quotas").await.expect("ensure");
        assert!(client.created_groups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_group_tolerates_creation_race() {
        let mut client = RecordingClient::new("us-east-1");
        client.create_error = Some(|| SinkError::AlreadyExists);
        ensure_log_group(&client, "quotas").await.expect("ensure");

        let mut client = RecordingClient::new("us-east-1");
        client.create_error = Some(|| SinkError::OperationAborted);
        ensure_log_group(&client, "quotas").await.expect("ensure");
    }

    #[tokio::test]
    async fn test_ensure_group_propagates_rejection() {
        let mut client = RecordingClient::new("us-east-1");
        client.create_error = Some(|| SinkError::Rejected("denied".to_string()));
        let err = ensure_log_group(&client, "quotas").await.unwrap_err();
        assert!(err.to_string().contains("create log group"));
    }

    #[tokio::test]
    async fn test_ensure_stream_creates_when_absent() {
        let client = RecordingClient::new("eu-west-1");
        ensure_log_stream(&client, "quotas", "s1")
            .await
            .expect("ensure");
        assert_eq!(*client.created_streams.lock().unwrap(), vec!["quotas/s1"]);
    }

    #[tokio::test]
    async fn test_bootstrap_builds_client_map() {
        let regions = vec!["us-east-1".to_string(), "eu-central-1".to_string()];
        let clients = bootstrap_regions(&regions, "quotas", "s1", |region| {
            Ok(Arc::new(RecordingClient::new(region)) as SharedLogsClient)
        })
        .await
        .expect("bootstrap");

        assert_eq!(clients.len(), 2);
        assert!(clients.contains("us-east-1"));
        assert!(clients.contains("eu-central-1"));
    }

    #[test]
    fn test_region_validation() {
        assert!(is_valid_region("us-east-1"));
        assert!(is_valid_region("ap-northeast-3"));
        assert!(!is_valid_region("us-moon-7"));
        assert!(!is_valid_region(""));
    }

    #[test]
    fn test_stream_name_is_sortable_prefix() {
        let name = stream_name();
        // "YYYY/MM/DD/HH/MM/SS.mmm-host"
        assert_eq!(&name[4..5], "/");
        assert!(name.contains('-'));
        assert!(name.len() >= 23);
    }
}
