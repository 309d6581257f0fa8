use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{DescribePage, InputLogEvent, LogsClient, SinkError};

/// Wire protocol target prefix for the log sink's JSON API.
const TARGET_PREFIX: &str = "Logs_20140328";

/// Connection settings for the HTTP sink client.
///
/// The endpoint is typically a regional gateway or proxy; `headers` carries
/// whatever static credentials that endpoint expects. Request signing is a
/// deployment concern and stays outside the core.
#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    pub endpoint: String,
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
}

impl Default for HttpSinkConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            headers: HashMap::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Sink client speaking the log service's JSON protocol over HTTP.
#[derive(Debug)]
pub struct HttpLogsClient {
    region: String,
    cfg: HttpSinkConfig,
    http: reqwest::Client,
}

impl HttpLogsClient {
    pub fn new(region: impl Into<String>, cfg: HttpSinkConfig) -> anyhow::Result<Self> {
        let region = region.into();
        if !super::is_valid_region(&region) {
            anyhow::bail!("invalid region: {region}");
        }

        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            region,
            cfg,
            http,
        })
    }

    /// Issues one JSON-RPC style call and decodes the response body.
    async fn call<Req, Resp>(&self, action: &str, request: &Req) -> Result<Resp, SinkError>
    where
        Req: Serialize,
        Resp: for<'de> Deserialize<'de> + Default,
    {
        let endpoint = self
            .cfg
            .endpoint
            .replace("{region}", &self.region);

        let mut builder = self
            .http
            .post(&endpoint)
            .header("Content-Type", "application/x-amz-json-1.1")
            .header("X-Amz-Target", format!("{TARGET_PREFIX}.{action}"))
            .json(request);

        for (key, value) in &self.cfg.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SinkError::Transport(anyhow!(e).context("sending sink request")))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| SinkError::Transport(anyhow!(e).context("reading sink response")))?;

        if !status.is_success() {
            return Err(classify_error_body(&body, status.as_u16()));
        }

        // Mutating calls may answer with an empty body.
        if body.is_empty() {
            return Ok(Resp::default());
        }

        serde_json::from_slice(&body)
            .map_err(|e| SinkError::Transport(anyhow!(e).context("decoding sink response")))
    }
}

/// Maps a service error body to a [`SinkError`].
///
/// The service reports the error kind in a `__type` field, optionally
/// namespace-qualified (`com.example#OperationAbortedException`).
fn classify_error_body(body: &[u8], status: u16) -> SinkError {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(rename = "__type", default)]
        kind: String,
        #[serde(default)]
        message: String,
    }

    let Ok(parsed) = serde_json::from_slice::<ErrorBody>(body) else {
        return SinkError::Rejected(format!("status {status}"));
    };

    let kind = parsed.kind.rsplit('#').next().unwrap_or("");
    match kind {
        "ResourceAlreadyExistsException" => SinkError::AlreadyExists,
        "OperationAbortedException" => SinkError::OperationAborted,
        _ => SinkError::Rejected(format!(
            "{} (status {status}): {}",
            if kind.is_empty() { "unknown error" } else { kind },
            parsed.message,
        )),
    }
}

// --- Wire types ---

#[derive(Serialize)]
struct WireLogEvent<'a> {
    timestamp: i64,
    message: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PutLogEventsRequest<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
    log_events: Vec<WireLogEvent<'a>>,
}

#[derive(Deserialize, Default)]
struct PutLogEventsResponse {}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLogGroupRequest<'a> {
    log_group_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLogStreamRequest<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
}

#[derive(Deserialize, Default)]
struct EmptyResponse {}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DescribeLogGroupsRequest<'a> {
    log_group_name_prefix: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DescribeLogGroupsResponse {
    #[serde(default)]
    log_groups: Vec<NamedLogGroup>,
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NamedLogGroup {
    log_group_name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DescribeLogStreamsRequest<'a> {
    log_group_name: &'a str,
    log_stream_name_prefix: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DescribeLogStreamsResponse {
    #[serde(default)]
    log_streams: Vec<NamedLogStream>,
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NamedLogStream {
    log_stream_name: String,
}

#[async_trait]
impl LogsClient for HttpLogsClient {
    fn region(&self) -> &str {
        &self.region
    }

    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        events: Vec<InputLogEvent>,
    ) -> Result<(), SinkError> {
        let request = PutLogEventsRequest {
            log_group_name: group,
            log_stream_name: stream,
            log_events: events
                .iter()
                .map(|event| WireLogEvent {
                    timestamp: event.timestamp_ms,
                    message: &event.message,
                })
                .collect(),
        };

        let _: PutLogEventsResponse = self.call("PutLogEvents", &request).await?;
        Ok(())
    }

    async fn create_log_group(&self, group: &str) -> Result<(), SinkError> {
        let request = CreateLogGroupRequest {
            log_group_name: group,
        };
        let _: EmptyResponse = self.call("CreateLogGroup", &request).await?;
        Ok(())
    }

    async fn create_log_stream(&self, group: &str, stream: &str) -> Result<(), SinkError> {
        let request = CreateLogStreamRequest {
            log_group_name: group,
            log_stream_name: stream,
        };
        let _: EmptyResponse = self.call("CreateLogStream", &request).await?;
        Ok(())
    }

    async fn describe_log_groups(
        &self,
        prefix: &str,
        cursor: Option<&str>,
    ) -> Result<DescribePage, SinkError> {
        let request = DescribeLogGroupsRequest {
            log_group_name_prefix: prefix,
            next_token: cursor,
        };

        let response: DescribeLogGroupsResponse = self.call("DescribeLogGroups", &request).await?;
        Ok(DescribePage {
            names: response
                .log_groups
                .into_iter()
                .map(|g| g.log_group_name)
                .collect(),
            next_token: response.next_token,
        })
    }

    async fn describe_log_streams(
        &self,
        group: &str,
        prefix: &str,
        cursor: Option<&str>,
    ) -> Result<DescribePage, SinkError> {
        let request = DescribeLogStreamsRequest {
            log_group_name: group,
            log_stream_name_prefix: prefix,
            next_token: cursor,
        };

        let response: DescribeLogStreamsResponse =
            self.call("DescribeLogStreams", &request).await?;
        Ok(DescribePage {
            names: response
                .log_streams
                .into_iter()
                .map(|s| s.log_stream_name)
                .collect(),
            next_token: response.next_token,
        })
    }
}
