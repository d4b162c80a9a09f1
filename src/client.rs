use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::{Method, Response, StatusCode, header};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::time::sleep;
use urlencoding::encode as url_encode;
use uuid::Uuid;

use crate::schemas::{
    Account, BlockDocument, Deployment, DeploymentCreate, DeploymentSchedule,
    DeploymentScheduleCreate, Flow, FlowRun, MANAGED_POOL_TYPE, Me, WorkPool, WorkPoolCreate,
    Workspace,
};

pub const DEFAULT_MANAGED_POOL: &str = "default-work-pool";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_RETRIES: u32 = 5;
const JITTER_FACTOR: f64 = 0.2;
/// Upper bound in seconds for a single retry wait, before jitter.
const MAX_RETRY_DELAY: f64 = 300.0;
const RETRY_STATUSES: [StatusCode; 4] = [
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
];

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("not found: {path}")]
    NotFound { path: String },
    #[error("Prefect Cloud rejected the API key (HTTP {status})")]
    Unauthorized { status: StatusCode },
    #[error("Prefect Cloud request failed with HTTP {status}: {detail}")]
    Status { status: StatusCode, detail: String },
    #[error("malformed response from Prefect Cloud: {0}")]
    Malformed(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }
}

pub type CloudResult<T> = Result<T, CloudError>;

/// The Prefect Cloud operations the commands rely on.
pub trait CloudApi {
    async fn me(&self) -> CloudResult<Me>;
    async fn accounts(&self) -> CloudResult<Vec<Account>>;
    async fn workspaces(&self) -> CloudResult<Vec<Workspace>>;

    async fn read_work_pools_by_type(&self, pool_type: &str) -> CloudResult<Vec<WorkPool>>;
    async fn read_work_pool(&self, name: &str) -> CloudResult<WorkPool>;
    async fn create_work_pool(&self, create: &WorkPoolCreate) -> CloudResult<WorkPool>;

    async fn read_secret_block(&self, name: &str) -> CloudResult<BlockDocument>;
    async fn update_secret_block(&self, id: Uuid, secret: &str) -> CloudResult<()>;
    async fn create_secret_block(&self, name: &str, secret: &str) -> CloudResult<BlockDocument>;

    async fn get_github_token(&self, owner: &str, repo: &str) -> CloudResult<Option<String>>;
    async fn get_github_repositories(&self) -> CloudResult<Vec<String>>;

    async fn create_flow(&self, name: &str) -> CloudResult<Uuid>;
    async fn read_flows(&self) -> CloudResult<Vec<Flow>>;

    async fn create_deployment(&self, create: &DeploymentCreate) -> CloudResult<Uuid>;
    async fn read_deployment(&self, id: Uuid) -> CloudResult<Deployment>;
    async fn read_deployment_by_name(&self, flow: &str, name: &str) -> CloudResult<Deployment>;
    async fn read_deployments(&self) -> CloudResult<Vec<Deployment>>;
    async fn delete_deployment(&self, id: Uuid) -> CloudResult<()>;

    async fn create_deployment_schedules(
        &self,
        id: Uuid,
        schedules: &[DeploymentScheduleCreate],
    ) -> CloudResult<Vec<DeploymentSchedule>>;
    async fn delete_deployment_schedule(&self, id: Uuid, schedule_id: Uuid) -> CloudResult<()>;
    async fn set_deployment_paused(&self, id: Uuid, paused: bool) -> CloudResult<()>;

    async fn create_flow_run_from_deployment(
        &self,
        id: Uuid,
        parameters: &BTreeMap<String, Value>,
    ) -> CloudResult<FlowRun>;
    async fn read_scheduled_runs(
        &self,
        deployment_ids: &[Uuid],
        after: DateTime<Utc>,
    ) -> CloudResult<Vec<FlowRun>>;

    async fn create_automation(&self, automation: &Value) -> CloudResult<Uuid>;
}

/// HTTP client bound to one workspace API URL.
#[derive(Debug, Clone)]
pub struct CloudClient {
    http: reqwest::Client,
    api_url: String,
    account_base: String,
}

impl CloudClient {
    pub fn new(api_url: &str, api_key: &str) -> CloudResult<Self> {
        let mut headers = header::HeaderMap::new();
        let mut auth = header::HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|_| CloudError::Malformed("API key contains invalid characters".into()))?;
        auth.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(8)
            // The Cloud load balancer drops idle connections after 30s.
            .pool_idle_timeout(Duration::from_secs(25))
            .user_agent(concat!("prefect-cloud/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let api_url = api_url.trim_end_matches('/').to_string();
        let account_base = account_base(&api_url);
        Ok(Self {
            http,
            api_url,
            account_base,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> CloudResult<T> {
        let resp = self.send(Method::GET, &self.url(path), None::<&()>).await?;
        decode(resp).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> CloudResult<T> {
        let resp = self.send(Method::POST, &self.url(path), Some(body)).await?;
        decode(resp).await
    }

    async fn send_no_content<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> CloudResult<()> {
        self.send(method, &self.url(path), body).await?;
        Ok(())
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> CloudResult<Response> {
        let mut attempt = 0;
        loop {
            let mut request = self.http.request(method.clone(), url);
            if let Some(body) = body {
                request = request.json(body);
            }
            tracing::debug!(%method, url, attempt, "cloud: request");

            let delay = match request.send().await {
                Ok(resp) if RETRY_STATUSES.contains(&resp.status()) && attempt < MAX_RETRIES => {
                    let retry_after = resp
                        .headers()
                        .get(header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.trim().parse::<f64>().ok());
                    let delay = retry_delay(attempt, retry_after);
                    tracing::warn!(
                        "cloud: {} {} returned {}; retrying in {:.1}s (attempt {}/{})",
                        method,
                        url,
                        resp.status(),
                        delay.as_secs_f64(),
                        attempt + 1,
                        MAX_RETRIES
                    );
                    delay
                }
                Ok(resp) => return check_status(resp, url).await,
                Err(err) if (err.is_connect() || err.is_timeout()) && attempt < MAX_RETRIES => {
                    let delay = retry_delay(attempt, None);
                    tracing::warn!(
                        "cloud: {} {} errored: {}; retrying in {:.1}s (attempt {}/{})",
                        method,
                        url,
                        err,
                        delay.as_secs_f64(),
                        attempt + 1,
                        MAX_RETRIES
                    );
                    delay
                }
                Err(err) => return Err(err.into()),
            };
            attempt += 1;
            sleep(delay).await;
        }
    }
}

impl CloudApi for CloudClient {
    async fn me(&self) -> CloudResult<Me> {
        let resp = self
            .send(Method::GET, &format!("{}/me/", self.account_base), None::<&()>)
            .await?;
        decode(resp).await
    }

    async fn accounts(&self) -> CloudResult<Vec<Account>> {
        let url = format!("{}/me/accounts", self.account_base);
        decode(self.send(Method::GET, &url, None::<&()>).await?).await
    }

    async fn workspaces(&self) -> CloudResult<Vec<Workspace>> {
        let url = format!("{}/me/workspaces", self.account_base);
        decode(self.send(Method::GET, &url, None::<&()>).await?).await
    }

    async fn read_work_pools_by_type(&self, pool_type: &str) -> CloudResult<Vec<WorkPool>> {
        let body = json!({"work_pools": {"type": {"any_": [pool_type]}}});
        self.post("/work_pools/filter", &body).await
    }

    async fn read_work_pool(&self, name: &str) -> CloudResult<WorkPool> {
        self.get(&format!("/work_pools/{}", url_encode(name))).await
    }

    async fn create_work_pool(&self, create: &WorkPoolCreate) -> CloudResult<WorkPool> {
        match self.post("/work_pools/", create).await {
            Err(CloudError::Status { status, .. }) if status == StatusCode::CONFLICT => {
                tracing::debug!(name = %create.name, "cloud: work pool exists, reading it");
                self.read_work_pool(&create.name).await
            }
            other => other,
        }
    }

    async fn read_secret_block(&self, name: &str) -> CloudResult<BlockDocument> {
        self.get(&format!(
            "/block_types/slug/secret/block_documents/name/{}?include_secrets=false",
            url_encode(name)
        ))
        .await
    }

    async fn update_secret_block(&self, id: Uuid, secret: &str) -> CloudResult<()> {
        let body = json!({"data": {"value": secret}, "merge_existing_data": false});
        self.send_no_content(Method::PATCH, &format!("/block_documents/{}", id), Some(&body))
            .await
    }

    async fn create_secret_block(&self, name: &str, secret: &str) -> CloudResult<BlockDocument> {
        let block_type: IdOnly = self.get("/block_types/slug/secret").await?;
        let schemas: Vec<IdOnly> = self
            .post(
                "/block_schemas/filter",
                &json!({"block_schemas": {"block_type_id": {"any_": [block_type.id]}}, "limit": 1}),
            )
            .await?;
        let schema = schemas.first().ok_or_else(|| {
            CloudError::Malformed("no block schema registered for the secret block type".into())
        })?;
        let body = json!({
            "name": name,
            "data": {"value": secret},
            "block_type_id": block_type.id,
            "block_schema_id": schema.id,
        });
        self.post("/block_documents/", &body).await
    }

    async fn get_github_token(&self, owner: &str, repo: &str) -> CloudResult<Option<String>> {
        #[derive(serde::Deserialize)]
        struct TokenResponse {
            token: Option<String>,
        }

        let body = json!({"owner": owner, "repository": repo});
        match self
            .post::<_, TokenResponse>("/integrations/github/installation-token", &body)
            .await
        {
            Ok(resp) => Ok(resp.token.filter(|t| !t.is_empty())),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn get_github_repositories(&self) -> CloudResult<Vec<String>> {
        self.get("/integrations/github/repositories").await
    }

    async fn create_flow(&self, name: &str) -> CloudResult<Uuid> {
        let flow: IdOnly = self.post("/flows/", &json!({"name": name})).await?;
        Ok(flow.id)
    }

    async fn read_flows(&self) -> CloudResult<Vec<Flow>> {
        self.post("/flows/filter", &json!({})).await
    }

    async fn create_deployment(&self, create: &DeploymentCreate) -> CloudResult<Uuid> {
        let deployment: IdOnly = self.post("/deployments/", create).await?;
        Ok(deployment.id)
    }

    async fn read_deployment(&self, id: Uuid) -> CloudResult<Deployment> {
        self.get(&format!("/deployments/{}", id)).await
    }

    async fn read_deployment_by_name(&self, flow: &str, name: &str) -> CloudResult<Deployment> {
        self.get(&format!(
            "/deployments/name/{}/{}",
            url_encode(flow),
            url_encode(name)
        ))
        .await
    }

    async fn read_deployments(&self) -> CloudResult<Vec<Deployment>> {
        self.post("/deployments/filter", &json!({"offset": 0})).await
    }

    async fn delete_deployment(&self, id: Uuid) -> CloudResult<()> {
        self.send_no_content(Method::DELETE, &format!("/deployments/{}", id), None::<&()>)
            .await
    }

    async fn create_deployment_schedules(
        &self,
        id: Uuid,
        schedules: &[DeploymentScheduleCreate],
    ) -> CloudResult<Vec<DeploymentSchedule>> {
        self.post(&format!("/deployments/{}/schedules", id), schedules)
            .await
    }

    async fn delete_deployment_schedule(&self, id: Uuid, schedule_id: Uuid) -> CloudResult<()> {
        self.send_no_content(
            Method::DELETE,
            &format!("/deployments/{}/schedules/{}", id, schedule_id),
            None::<&()>,
        )
        .await
    }

    async fn set_deployment_paused(&self, id: Uuid, paused: bool) -> CloudResult<()> {
        self.send_no_content(
            Method::PATCH,
            &format!("/deployments/{}", id),
            Some(&json!({"paused": paused})),
        )
        .await
    }

    async fn create_flow_run_from_deployment(
        &self,
        id: Uuid,
        parameters: &BTreeMap<String, Value>,
    ) -> CloudResult<FlowRun> {
        let body = json!({"state": {"type": "SCHEDULED"}, "parameters": parameters});
        self.post(&format!("/deployments/{}/create_flow_run", id), &body)
            .await
    }

    async fn read_scheduled_runs(
        &self,
        deployment_ids: &[Uuid],
        after: DateTime<Utc>,
    ) -> CloudResult<Vec<FlowRun>> {
        let body = json!({
            "flow_runs": {
                "deployment_id": {"any_": deployment_ids},
                "state": {"type": {"any_": ["SCHEDULED"]}},
                "expected_start_time": {"after_": after},
            },
            "sort": "EXPECTED_START_TIME_ASC",
        });
        self.post("/flow_runs/filter", &body).await
    }

    async fn create_automation(&self, automation: &Value) -> CloudResult<Uuid> {
        let created: IdOnly = self.post("/automations/", automation).await?;
        Ok(created.id)
    }
}

#[derive(Debug, serde::Deserialize)]
struct IdOnly {
    id: Uuid,
}

/// Return the first managed work pool, creating the default one if none exists.
pub async fn ensure_managed_work_pool<C: CloudApi>(api: &C) -> CloudResult<WorkPool> {
    let pools = api.read_work_pools_by_type(MANAGED_POOL_TYPE).await?;
    if let Some(pool) = pools.into_iter().next() {
        return Ok(pool);
    }
    tracing::info!("cloud: creating managed work pool {}", DEFAULT_MANAGED_POOL);
    api.create_work_pool(&WorkPoolCreate {
        name: DEFAULT_MANAGED_POOL.to_string(),
        pool_type: MANAGED_POOL_TYPE.to_string(),
        base_job_template: json!({}),
    })
    .await
}

/// Store `secret` under a block name derived from `name`, returning that block name.
pub async fn create_or_replace_secret<C: CloudApi>(
    api: &C,
    name: &str,
    secret: &str,
) -> CloudResult<String> {
    let block_name = safe_block_name(name);
    match api.read_secret_block(&block_name).await {
        Ok(existing) => api.update_secret_block(existing.id, secret).await?,
        Err(err) if err.is_not_found() => {
            api.create_secret_block(&block_name, secret).await?;
        }
        Err(err) => return Err(err),
    }
    Ok(block_name)
}

pub fn safe_block_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// `https://api.prefect.cloud/api/accounts/a/workspaces/w` -> `https://api.prefect.cloud/api`
fn account_base(api_url: &str) -> String {
    match api_url.find("/accounts/") {
        Some(idx) => api_url[..idx].to_string(),
        None => api_url.to_string(),
    }
}

fn retry_delay(attempt: u32, retry_after: Option<f64>) -> Duration {
    let mut rng = rand::thread_rng();
    let seconds = match retry_after.filter(|secs| secs.is_finite()) {
        // Never wait less than the server asked for, up to the cap.
        Some(secs) if secs > 0.0 => {
            let secs = secs.min(MAX_RETRY_DELAY);
            rng.gen_range(secs..=secs * (1.0 + JITTER_FACTOR))
        }
        Some(_) => 0.0,
        None => {
            let base = 2f64.powi(attempt as i32).min(MAX_RETRY_DELAY);
            rng.gen_range(base * (1.0 - JITTER_FACTOR)..=base * (1.0 + JITTER_FACTOR))
        }
    };
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO)
}

async fn check_status(resp: Response, url: &str) -> CloudResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status {
        StatusCode::NOT_FOUND => Err(CloudError::NotFound {
            path: url.to_string(),
        }),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CloudError::Unauthorized { status }),
        _ => {
            let text = resp.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("detail").map(|d| match d {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }))
                .unwrap_or(text);
            Err(CloudError::Status { status, detail })
        }
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> CloudResult<T> {
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|err| CloudError::Malformed(err.to_string()))
}
