//! JSON-over-HTTP scheduler client.
//!
//! Endpoints, relative to the configured base URL:
//!
//! - `POST jobs` with an [`ArrayJobRequest`] body, answering `{"job_id": ...}`
//! - `POST jobs/describe` with `{"job_ids": [...]}`, answering `{"jobs": [...]}`

use super::{ArrayJobRequest, JobDescription, JobScheduler};
use crate::error::SchedulerError;
use anyhow::Context;
use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const SUBMIT_PATH: &str = "jobs";
const DESCRIBE_PATH: &str = "jobs/describe";

/// Largest id list sent in a single describe request.
const DESCRIBE_BATCH: usize = 100;

#[derive(Debug, Deserialize)]
struct SubmitJobResponse {
    job_id: String,
}

#[derive(Debug, Serialize)]
struct DescribeJobsRequest<'a> {
    job_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct DescribeJobsResponse {
    jobs: Vec<JobDescription>,
}

/// HTTP-backed scheduler client.
#[derive(Clone)]
pub struct HttpScheduler {
    client: Client,
    base_url: Url,
}

impl HttpScheduler {
    /// Build a client targeting `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        // Without a trailing slash Url::join would replace the last segment.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)
            .with_context(|| format!("Invalid scheduler endpoint '{}'", base_url))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build reqwest client")?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, SchedulerError> {
        self.base_url
            .join(path)
            .map_err(|err| SchedulerError::unavailable(err.to_string()))
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, SchedulerError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| SchedulerError::unavailable(err.to_string()))?;
        Self::decode_response(resp).await
    }

    async fn decode_response<T>(resp: Response) -> Result<T, SchedulerError>
    where
        T: DeserializeOwned,
    {
        let status = resp.status();
        if status.is_success() {
            resp.json::<T>()
                .await
                .map_err(|err| SchedulerError::unavailable(err.to_string()))
        } else {
            let reason = resp
                .text()
                .await
                .unwrap_or_else(|err| format!("scheduler response body error: {err}"));
            Err(classify_failure(status, reason))
        }
    }
}

/// Map a non-success HTTP status onto the scheduler error taxonomy.
fn classify_failure(status: StatusCode, reason: String) -> SchedulerError {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SchedulerError::Unavailable { reason }
        }
        _ if status.is_client_error() => SchedulerError::Rejected { reason },
        _ => SchedulerError::Unavailable { reason },
    }
}

#[async_trait]
impl JobScheduler for HttpScheduler {
    async fn submit_job(&self, request: &ArrayJobRequest) -> Result<String, SchedulerError> {
        let resp: SubmitJobResponse = self.post(SUBMIT_PATH, request).await?;
        Ok(resp.job_id)
    }

    async fn describe_jobs(&self, job_ids: &[String]) -> Result<Vec<JobDescription>, SchedulerError> {
        let batches = job_ids.chunks(DESCRIBE_BATCH).map(|ids| async move {
            let resp: DescribeJobsResponse = self
                .post(DESCRIBE_PATH, &DescribeJobsRequest { job_ids: ids })
                .await?;
            Ok::<_, SchedulerError>(resp.jobs)
        });

        let jobs = try_join_all(batches).await?;
        Ok(jobs.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{ElementSummary, JobStatus};
    use axum::extract::{Json, State};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::post;
    use axum::Router;
    use std::sync::{Arc, Mutex};

    /// Sizes of the describe requests a test server received.
    type Batches = Arc<Mutex<Vec<usize>>>;

    #[derive(Deserialize)]
    struct DescribeBody {
        job_ids: Vec<String>,
    }

    async fn submit_handler(Json(request): Json<ArrayJobRequest>) -> AxumResponse {
        if request.array_size == 0 {
            return (StatusCode::BAD_REQUEST, "array size must be > 0").into_response();
        }
        match request.job_name.as_str() {
            "Overloaded" => (StatusCode::SERVICE_UNAVAILABLE, "queue full").into_response(),
            "Slow" => (StatusCode::REQUEST_TIMEOUT, "request timed out").into_response(),
            name => Json(serde_json::json!({ "job_id": format!("job-{name}") })).into_response(),
        }
    }

    async fn describe_handler(
        State(batches): State<Batches>,
        Json(body): Json<DescribeBody>,
    ) -> Json<serde_json::Value> {
        batches.lock().unwrap().push(body.job_ids.len());
        let jobs: Vec<JobDescription> = body
            .job_ids
            .into_iter()
            .map(|job_id| JobDescription {
                job_id,
                job_name: "StepOneJob".to_string(),
                status: JobStatus::Succeeded,
                array_size: Some(1),
                elements: ElementSummary {
                    succeeded: 1,
                    ..Default::default()
                },
                status_reason: None,
            })
            .collect();
        Json(serde_json::json!({ "jobs": jobs }))
    }

    /// Serve a fake scheduler on a free local port; returns its base URL.
    async fn serve(batches: Batches) -> String {
        let app = Router::new()
            .route("/api/jobs", post(submit_handler))
            .route("/api/jobs/describe", post(describe_handler))
            .with_state(batches);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/api")
    }

    fn request(job_name: &str, array_size: usize) -> ArrayJobRequest {
        ArrayJobRequest {
            job_name: job_name.to_string(),
            job_definition: "get-data".to_string(),
            job_queue: "StepOneJobQueue".to_string(),
            array_size,
            depends_on: Vec::new(),
            environment: Default::default(),
        }
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let scheduler = HttpScheduler::new("http://scheduler.local/api", Duration::from_secs(1)).unwrap();
        assert_eq!(
            scheduler.endpoint(SUBMIT_PATH).unwrap().as_str(),
            "http://scheduler.local/api/jobs"
        );
        assert_eq!(
            scheduler.endpoint(DESCRIBE_PATH).unwrap().as_str(),
            "http://scheduler.local/api/jobs/describe"
        );
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(HttpScheduler::new("not a url", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, "array size".into()),
            SchedulerError::Rejected { .. }
        ));
        assert!(matches!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, "slow down".into()),
            SchedulerError::Unavailable { .. }
        ));
        assert!(matches!(
            classify_failure(StatusCode::REQUEST_TIMEOUT, "too slow".into()),
            SchedulerError::Unavailable { .. }
        ));
        assert!(matches!(
            classify_failure(StatusCode::CONFLICT, "duplicate".into()),
            SchedulerError::Rejected { .. }
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, "upstream".into()),
            SchedulerError::Unavailable { .. }
        ));
    }

    #[test]
    fn test_describe_response_decoding() {
        let body = r#"{"jobs":[{"job_id":"j-1","job_name":"StepOneJob","status":"RUNNING",
            "array_size":10,"elements":{"running":4,"succeeded":6}}]}"#;
        let resp: DescribeJobsResponse = serde_json::from_str(body).unwrap();
        let job = &resp.jobs[0];
        assert_eq!(job.elements.running, 4);
        assert_eq!(job.elements.succeeded, 6);
        assert_eq!(job.non_terminal_elements(), 4);
    }

    #[tokio::test]
    async fn test_submit_job_over_http() {
        let base = serve(Batches::default()).await;
        let scheduler = HttpScheduler::new(&base, Duration::from_secs(5)).unwrap();

        let job_id = scheduler.submit_job(&request("StepOneJob", 10)).await.unwrap();
        assert_eq!(job_id, "job-StepOneJob");
    }

    #[tokio::test]
    async fn test_submit_job_status_mapping() {
        let base = serve(Batches::default()).await;
        let scheduler = HttpScheduler::new(&base, Duration::from_secs(5)).unwrap();

        assert!(matches!(
            scheduler.submit_job(&request("StepOneJob", 0)).await,
            Err(SchedulerError::Rejected { .. })
        ));
        assert!(matches!(
            scheduler.submit_job(&request("Overloaded", 10)).await,
            Err(SchedulerError::Unavailable { .. })
        ));
        assert!(matches!(
            scheduler.submit_job(&request("Slow", 10)).await,
            Err(SchedulerError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_describe_jobs_in_batches() {
        let batches = Batches::default();
        let base = serve(batches.clone()).await;
        let scheduler = HttpScheduler::new(&base, Duration::from_secs(5)).unwrap();

        let job_ids: Vec<String> = (0..250).map(|i| format!("job-{i}")).collect();
        let jobs = scheduler.describe_jobs(&job_ids).await.unwrap();

        let returned: Vec<&str> = jobs.iter().map(|job| job.job_id.as_str()).collect();
        let expected: Vec<&str> = job_ids.iter().map(String::as_str).collect();
        assert_eq!(returned, expected);

        let mut sizes = batches.lock().unwrap().clone();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![50, 100, 100]);
    }

    #[tokio::test]
    async fn test_unreachable_scheduler_is_unavailable() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let scheduler =
            HttpScheduler::new(&format!("http://{addr}/api"), Duration::from_secs(5)).unwrap();
        assert!(matches!(
            scheduler.describe_jobs(&["job-1".to_string()]).await,
            Err(SchedulerError::Unavailable { .. })
        ));
    }
}
