// HTTP clients for the collaborator services
//
// JSON over HTTP. Every request races the caller's cancellation token; a 404
// means the subject (or deployment) is unknown to the service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use devloop_core::{
    CollaboratorError, DeploymentStatus, ExecutionKind, HealingReport, PreviewDeployer,
    PreviewDeployment, SandboxCommand, SandboxExecutor, SandboxRun, SelfHealer, SubjectDirectory,
};

/// Interval between status reads while a deployment converges
pub const DEPLOYMENT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Thin JSON client bound to one service
#[derive(Debug, Clone)]
struct JsonClient {
    service: &'static str,
    base_url: String,
    http: reqwest::Client,
}

impl JsonClient {
    fn new(service: &'static str, base_url: &str, http: reqwest::Client) -> Self {
        Self {
            service,
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// GET `path`; `None` on 404
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, CollaboratorError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(service = self.service, %url, "GET");
        self.send(self.http.get(&url), cancel).await
    }

    /// POST `body` to `path`; `None` on 404
    async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, CollaboratorError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(service = self.service, %url, "POST");
        self.send(self.http.post(&url).json(body), cancel).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, CollaboratorError> {
        let exchange = async {
            let response = request
                .send()
                .await
                .map_err(|e| CollaboratorError::request(self.service, e.to_string()))?;
            self.handle_response(response).await
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(CollaboratorError::Cancelled),
            result = exchange => result,
        }
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<Option<T>, CollaboratorError> {
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Status {
                service: self.service,
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .json()
            .await
            .map_err(|e| CollaboratorError::request(self.service, format!("invalid response body: {}", e)))?;
        Ok(Some(body))
    }
}

// ============================================================================
// Preview deployment service
// ============================================================================

#[derive(Debug, Serialize)]
struct DeployRequest<'a> {
    subject_id: Uuid,
    owner_id: &'a str,
}

/// `POST /deployments`, then `GET /deployments/{id}` until it leaves `deploying`
pub struct HttpPreviewDeployer {
    client: JsonClient,
    poll_interval: Duration,
}

impl HttpPreviewDeployer {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            client: JsonClient::new("preview service", base_url, http),
            poll_interval: DEPLOYMENT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl PreviewDeployer for HttpPreviewDeployer {
    async fn deploy(
        &self,
        subject_id: Uuid,
        owner_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PreviewDeployment, CollaboratorError> {
        let request = DeployRequest {
            subject_id,
            owner_id,
        };
        let mut deployment: PreviewDeployment = self
            .client
            .post("/deployments", &request, cancel)
            .await?
            .ok_or(CollaboratorError::SubjectNotFound(subject_id))?;

        while deployment.status == DeploymentStatus::Deploying {
            tokio::select! {
                _ = cancel.cancelled() => return Err(CollaboratorError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            deployment = self
                .client
                .get(&format!("/deployments/{}", deployment.id), cancel)
                .await?
                .ok_or_else(|| {
                    CollaboratorError::failed(format!("deployment {} disappeared", deployment.id))
                })?;
        }
        Ok(deployment)
    }

    async fn latest_deployment(
        &self,
        subject_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<PreviewDeployment>, CollaboratorError> {
        let latest: Option<PreviewDeployment> = self
            .client
            .get(&format!("/subjects/{}/deployments/latest", subject_id), cancel)
            .await?;
        Ok(latest.filter(PreviewDeployment::is_deployed))
    }
}

// ============================================================================
// Sandbox service
// ============================================================================

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    subject_id: Uuid,
    kind: ExecutionKind,
    command: &'a str,
    isolation: &'a str,
}

/// `POST /executions`; the service answers once the command has exited
pub struct HttpSandbox {
    client: JsonClient,
}

impl HttpSandbox {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            client: JsonClient::new("sandbox service", base_url, http),
        }
    }
}

#[async_trait]
impl SandboxExecutor for HttpSandbox {
    async fn execute(
        &self,
        subject_id: Uuid,
        command: &SandboxCommand,
        cancel: &CancellationToken,
    ) -> Result<SandboxRun, CollaboratorError> {
        let request = ExecuteRequest {
            subject_id,
            kind: command.kind,
            command: &command.command,
            isolation: &command.isolation,
        };
        self.client
            .post("/executions", &request, cancel)
            .await?
            .ok_or(CollaboratorError::SubjectNotFound(subject_id))
    }
}

// ============================================================================
// Self-healing service
// ============================================================================

/// `POST /subjects/{id}/heal`
pub struct HttpSelfHealer {
    client: JsonClient,
}

impl HttpSelfHealer {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            client: JsonClient::new("healing service", base_url, http),
        }
    }
}

#[async_trait]
impl SelfHealer for HttpSelfHealer {
    async fn analyze(
        &self,
        subject_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<HealingReport, CollaboratorError> {
        self.client
            .post(&format!("/subjects/{}/heal", subject_id), &serde_json::json!({}), cancel)
            .await?
            .ok_or(CollaboratorError::SubjectNotFound(subject_id))
    }
}

// ============================================================================
// Subject service
// ============================================================================

#[derive(Debug, Deserialize)]
struct SubjectResponse {
    owner_id: String,
}

/// `GET /subjects/{id}`
pub struct HttpSubjectDirectory {
    client: JsonClient,
}

impl HttpSubjectDirectory {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            client: JsonClient::new("subject service", base_url, http),
        }
    }
}

#[async_trait]
impl SubjectDirectory for HttpSubjectDirectory {
    async fn owner_of(
        &self,
        subject_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<String, CollaboratorError> {
        let subject: SubjectResponse = self
            .client
            .get(&format!("/subjects/{}", subject_id), cancel)
            .await?
            .ok_or(CollaboratorError::SubjectNotFound(subject_id))?;
        Ok(subject.owner_id)
    }
}
