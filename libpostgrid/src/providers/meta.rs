//! Behavior shared by the Meta Graph adapters (Instagram and Threads)

use serde_json::Value;
use tracing::debug;

use super::http::{poll_until, Classifier, PollPolicy, PollState, ProviderHttp};
use crate::error::Result;
use crate::types::HandledError;

/// Graph error codes and messages, checked in order
const GRAPH_ERRORS: &[(&str, Action, &str)] = &[
    ("Error validating access token", Action::Refresh, "Please re-authenticate your account"),
    ("2207050", Action::Refresh, "The account is restricted, please reconnect it"),
    ("1390008", Action::BadBody, "You are posting too fast, please slow down"),
    ("2207003", Action::BadBody, "Timeout downloading media, please try again"),
    ("2207020", Action::BadBody, "Media expired, please upload again"),
    ("2207032", Action::BadBody, "Failed to create media, please try again"),
    ("2207053", Action::BadBody, "Unknown upload error, please try again"),
    ("2207052", Action::BadBody, "Media fetch failed, please try again"),
    ("2207057", Action::BadBody, "Invalid thumbnail offset for video"),
    ("2207026", Action::BadBody, "Unsupported video format"),
    ("2207023", Action::BadBody, "Unknown media type"),
    ("2207006", Action::BadBody, "Media not found, please upload again"),
    ("2207008", Action::BadBody, "Media builder expired, please try again"),
    ("2207028", Action::BadBody, "Carousel validation failed"),
    ("2207010", Action::BadBody, "Caption is too long"),
    ("2207004", Action::BadBody, "Image is too large"),
    ("2207005", Action::BadBody, "Unsupported image format"),
    ("2207009", Action::BadBody, "Aspect ratio not supported, must be between 4:5 to 1.91:1"),
    ("2207042", Action::BadBody, "You have reached the maximum of 25 posts per day allowed for your account"),
    ("2207051", Action::BadBody, "Your request was blocked by the network"),
    ("2207001", Action::BadBody, "The post was detected as spam, please try again with different content"),
    ("2207027", Action::BadBody, "Unknown error, please try again later"),
    ("36003", Action::BadBody, "Aspect ratio not supported, must be between 4:5 to 1.91:1"),
    ("36001", Action::BadBody, "Invalid image resolution, max: 1920x1080px"),
    ("Page request limit reached", Action::BadBody, "Page posting for today is limited, please try again tomorrow"),
    ("Not enough permissions to post", Action::BadBody, "Not enough permissions to post"),
    ("An unknown error occurred", Action::Retry, "An unknown error occurred, please try again later"),
];

#[derive(Clone, Copy)]
enum Action {
    Refresh,
    BadBody,
    Retry,
}

/// Classify a Graph API error body
pub(super) fn classify_graph(body: &str) -> Option<HandledError> {
    GRAPH_ERRORS
        .iter()
        .find(|(needle, _, _)| body.contains(needle))
        .map(|(_, action, message)| match action {
            Action::Refresh => HandledError::refresh_token(*message),
            Action::BadBody => HandledError::bad_body(*message),
            Action::Retry => HandledError::retry(*message),
        })
}

/// Poll a media container until the Graph API reports it is ready
///
/// `status_field` is `status_code` on Instagram and `status` on Threads.
pub(super) async fn wait_for_container(
    http: &ProviderHttp,
    identifier: &str,
    container_url: &str,
    access_token: &str,
    status_field: &str,
    poll: PollPolicy,
    classify: Classifier,
) -> Result<()> {
    poll_until(identifier, poll, || async move {
        let fields = format!("{},error_message", status_field);
        let request = http
            .client()
            .get(container_url)
            .query(&[("fields", fields.as_str()), ("access_token", access_token)]);
        let status: Value = http.fetch(identifier, request, classify).await?.json().await?;
        let state = status
            .get(status_field)
            .and_then(|s| s.as_str())
            .unwrap_or_default();
        debug!(provider = identifier, state, "Container status");

        Ok(match state {
            "FINISHED" | "PUBLISHED" => PollState::Done(()),
            "ERROR" | "EXPIRED" => PollState::Failed(
                status
                    .get("error_message")
                    .and_then(|m| m.as_str())
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("Media container {}", state.to_lowercase())),
            ),
            _ => PollState::Pending,
        })
    })
    .await
}

/// Graph insight series to analytics points
///
/// Accepts both `values` time series and `total_value` aggregates.
pub(super) fn insights_to_analytics(data: &[Value]) -> Vec<crate::types::AnalyticsData> {
    use crate::types::{AnalyticsData, AnalyticsPoint};

    data.iter()
        .filter_map(|metric| {
            let label = metric
                .get("title")
                .or_else(|| metric.get("name"))
                .and_then(|t| t.as_str())?
                .to_string();

            let points = if let Some(values) = metric.get("values").and_then(|v| v.as_array()) {
                values
                    .iter()
                    .map(|value| AnalyticsPoint {
                        total: value.get("value").and_then(|v| v.as_i64()).unwrap_or(0),
                        date: value
                            .get("end_time")
                            .and_then(|d| d.as_str())
                            .map(|d| d.split('T').next().unwrap_or(d).to_string())
                            .unwrap_or_default(),
                    })
                    .collect()
            } else {
                let total = metric
                    .get("total_value")
                    .and_then(|t| t.get("value"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                vec![AnalyticsPoint {
                    total,
                    date: chrono::Utc::now().format("%Y-%m-%d").to_string(),
                }]
            };

            Some(AnalyticsData::from_points(label, points))
        })
        .collect()
}
