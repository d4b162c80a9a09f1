//! In-memory stand-ins for Prefect Cloud and GitHub used by unit tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use uuid::Uuid;

use crate::client::{CloudApi, CloudError, CloudResult};
use crate::github::{CodeSource, FetchError, GitHubRepo};
use crate::schemas::{
    Account, BlockDocument, Deployment, DeploymentCreate, DeploymentSchedule,
    DeploymentScheduleCreate, Flow, FlowRun, Me, Schedule, WorkPool, WorkPoolCreate, Workspace,
};

/// Writes made against [`FakeCloud`], in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateWorkPool(String),
    CreateSecretBlock(String, String),
    UpdateSecretBlock(Uuid, String),
    CreateFlow(String),
    CreateDeployment(Value),
    DeleteDeployment(Uuid),
    CreateSchedules(Uuid, Vec<DeploymentScheduleCreate>),
    DeleteSchedule(Uuid, Uuid),
    SetPaused(Uuid, bool),
    CreateFlowRun(Uuid, BTreeMap<String, Value>),
    ReadScheduledRuns(Vec<Uuid>),
    CreateAutomation(Value),
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub unauthorized: bool,
    pub me_email: Option<String>,
    pub accounts: Vec<Account>,
    pub workspaces: Vec<Workspace>,
    pub work_pools: Vec<WorkPool>,
    pub secrets: BTreeMap<String, (Uuid, String)>,
    pub github_tokens: BTreeMap<String, String>,
    pub github_repositories: Vec<String>,
    pub flows: Vec<Flow>,
    pub deployments: Vec<Deployment>,
    pub scheduled_runs: Vec<FlowRun>,
    pub calls: Vec<Call>,
}

#[derive(Debug, Default)]
pub struct FakeCloud {
    state: Mutex<FakeState>,
}

impl FakeCloud {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn add_deployment(
        &self,
        flow: &str,
        name: &str,
        schedules: Vec<DeploymentSchedule>,
    ) -> Deployment {
        let mut state = self.state();
        let flow_id = match state.flows.iter().find(|f| f.name == flow) {
            Some(existing) => existing.id,
            None => {
                let id = Uuid::new_v4();
                state.flows.push(Flow {
                    id,
                    name: flow.to_string(),
                });
                id
            }
        };
        let deployment = Deployment {
            id: Uuid::new_v4(),
            name: name.to_string(),
            flow_id,
            schedules,
            work_pool_name: Some("default-work-pool".to_string()),
            parameters: BTreeMap::new(),
        };
        state.deployments.push(deployment.clone());
        deployment
    }

    pub fn add_scheduled_run(&self, deployment_id: Uuid, name: &str, at: DateTime<Utc>) {
        self.state().scheduled_runs.push(FlowRun {
            id: Uuid::new_v4(),
            name: name.to_string(),
            deployment_id: Some(deployment_id),
            expected_start_time: Some(at),
        });
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }

    fn check_auth(&self) -> CloudResult<()> {
        if self.state().unauthorized {
            return Err(CloudError::Unauthorized {
                status: StatusCode::UNAUTHORIZED,
            });
        }
        Ok(())
    }
}

fn not_found(path: impl Into<String>) -> CloudError {
    CloudError::NotFound { path: path.into() }
}

impl CloudApi for FakeCloud {
    async fn me(&self) -> CloudResult<Me> {
        self.check_auth()?;
        Ok(Me {
            id: Uuid::nil(),
            email: self.state().me_email.clone(),
            handle: "me".into(),
            first_name: "Marvin".into(),
            last_name: "Robot".into(),
        })
    }

    async fn accounts(&self) -> CloudResult<Vec<Account>> {
        self.check_auth()?;
        Ok(self.state().accounts.clone())
    }

    async fn workspaces(&self) -> CloudResult<Vec<Workspace>> {
        self.check_auth()?;
        Ok(self.state().workspaces.clone())
    }

    async fn read_work_pools_by_type(&self, pool_type: &str) -> CloudResult<Vec<WorkPool>> {
        Ok(self
            .state()
            .work_pools
            .iter()
            .filter(|p| p.pool_type == pool_type)
            .cloned()
            .collect())
    }

    async fn read_work_pool(&self, name: &str) -> CloudResult<WorkPool> {
        self.state()
            .work_pools
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| not_found(format!("/work_pools/{name}")))
    }

    async fn create_work_pool(&self, create: &WorkPoolCreate) -> CloudResult<WorkPool> {
        self.record(Call::CreateWorkPool(create.name.clone()));
        let pool = WorkPool {
            name: create.name.clone(),
            pool_type: create.pool_type.clone(),
            is_paused: false,
        };
        self.state().work_pools.push(pool.clone());
        Ok(pool)
    }

    async fn read_secret_block(&self, name: &str) -> CloudResult<BlockDocument> {
        self.state()
            .secrets
            .get(name)
            .map(|(id, _)| BlockDocument { id: *id })
            .ok_or_else(|| not_found(format!("/block_documents/name/{name}")))
    }

    async fn update_secret_block(&self, id: Uuid, secret: &str) -> CloudResult<()> {
        self.record(Call::UpdateSecretBlock(id, secret.to_string()));
        let mut state = self.state();
        let entry = state
            .secrets
            .values_mut()
            .find(|(existing, _)| *existing == id)
            .ok_or_else(|| not_found(format!("/block_documents/{id}")))?;
        entry.1 = secret.to_string();
        Ok(())
    }

    async fn create_secret_block(&self, name: &str, secret: &str) -> CloudResult<BlockDocument> {
        self.record(Call::CreateSecretBlock(name.to_string(), secret.to_string()));
        let id = Uuid::new_v4();
        self.state()
            .secrets
            .insert(name.to_string(), (id, secret.to_string()));
        Ok(BlockDocument { id })
    }

    async fn get_github_token(&self, owner: &str, repo: &str) -> CloudResult<Option<String>> {
        Ok(self
            .state()
            .github_tokens
            .get(&format!("{owner}/{repo}"))
            .cloned())
    }

    async fn get_github_repositories(&self) -> CloudResult<Vec<String>> {
        Ok(self.state().github_repositories.clone())
    }

    async fn create_flow(&self, name: &str) -> CloudResult<Uuid> {
        self.record(Call::CreateFlow(name.to_string()));
        let mut state = self.state();
        if let Some(existing) = state.flows.iter().find(|f| f.name == name) {
            return Ok(existing.id);
        }
        let id = Uuid::new_v4();
        state.flows.push(Flow {
            id,
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn read_flows(&self) -> CloudResult<Vec<Flow>> {
        Ok(self.state().flows.clone())
    }

    async fn create_deployment(&self, create: &DeploymentCreate) -> CloudResult<Uuid> {
        let body = serde_json::to_value(create).map_err(|e| CloudError::Malformed(e.to_string()))?;
        self.record(Call::CreateDeployment(body));
        let id = Uuid::new_v4();
        self.state().deployments.push(Deployment {
            id,
            name: create.name.clone(),
            flow_id: create.flow_id,
            schedules: Vec::new(),
            work_pool_name: Some(create.work_pool_name.clone()),
            parameters: create.parameters.clone(),
        });
        Ok(id)
    }

    async fn read_deployment(&self, id: Uuid) -> CloudResult<Deployment> {
        self.state()
            .deployments
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| not_found(format!("/deployments/{id}")))
    }

    async fn read_deployment_by_name(&self, flow: &str, name: &str) -> CloudResult<Deployment> {
        let state = self.state();
        let flow_id = state
            .flows
            .iter()
            .find(|f| f.name == flow)
            .map(|f| f.id)
            .ok_or_else(|| not_found(format!("/deployments/name/{flow}/{name}")))?;
        state
            .deployments
            .iter()
            .find(|d| d.flow_id == flow_id && d.name == name)
            .cloned()
            .ok_or_else(|| not_found(format!("/deployments/name/{flow}/{name}")))
    }

    async fn read_deployments(&self) -> CloudResult<Vec<Deployment>> {
        Ok(self.state().deployments.clone())
    }

    async fn delete_deployment(&self, id: Uuid) -> CloudResult<()> {
        self.record(Call::DeleteDeployment(id));
        self.state().deployments.retain(|d| d.id != id);
        Ok(())
    }

    async fn create_deployment_schedules(
        &self,
        id: Uuid,
        schedules: &[DeploymentScheduleCreate],
    ) -> CloudResult<Vec<DeploymentSchedule>> {
        self.record(Call::CreateSchedules(id, schedules.to_vec()));
        let created: Vec<DeploymentSchedule> = schedules
            .iter()
            .map(|s| DeploymentSchedule {
                id: Uuid::new_v4(),
                schedule: s.schedule.clone(),
                active: s.active,
            })
            .collect();
        let mut state = self.state();
        let deployment = state
            .deployments
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| not_found(format!("/deployments/{id}")))?;
        deployment.schedules.extend(created.iter().cloned());
        Ok(created)
    }

    async fn delete_deployment_schedule(&self, id: Uuid, schedule_id: Uuid) -> CloudResult<()> {
        self.record(Call::DeleteSchedule(id, schedule_id));
        if let Some(deployment) = self.state().deployments.iter_mut().find(|d| d.id == id) {
            deployment.schedules.retain(|s| s.id != schedule_id);
        }
        Ok(())
    }

    async fn set_deployment_paused(&self, id: Uuid, paused: bool) -> CloudResult<()> {
        self.record(Call::SetPaused(id, paused));
        if !self.state().deployments.iter().any(|d| d.id == id) {
            return Err(not_found(format!("/deployments/{id}")));
        }
        Ok(())
    }

    async fn create_flow_run_from_deployment(
        &self,
        id: Uuid,
        parameters: &BTreeMap<String, Value>,
    ) -> CloudResult<FlowRun> {
        self.record(Call::CreateFlowRun(id, parameters.clone()));
        let started = self
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::CreateFlowRun(..)))
            .count();
        Ok(FlowRun {
            id: Uuid::from_u128(0xf000 + started as u128),
            name: "crimson-fox".into(),
            deployment_id: Some(id),
            expected_start_time: Some(Utc::now()),
        })
    }

    async fn read_scheduled_runs(
        &self,
        deployment_ids: &[Uuid],
        after: DateTime<Utc>,
    ) -> CloudResult<Vec<FlowRun>> {
        self.record(Call::ReadScheduledRuns(deployment_ids.to_vec()));
        let mut runs: Vec<FlowRun> = self
            .state()
            .scheduled_runs
            .iter()
            .filter(|r| r.deployment_id.is_some_and(|d| deployment_ids.contains(&d)))
            .filter(|r| r.expected_start_time.is_some_and(|t| t > after))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.expected_start_time);
        Ok(runs)
    }

    async fn create_automation(&self, automation: &Value) -> CloudResult<Uuid> {
        self.record(Call::CreateAutomation(automation.clone()));
        Ok(Uuid::new_v4())
    }
}

/// Serves fixed files, optionally only to callers holding `token`.
#[derive(Debug, Default)]
pub struct FakeSource {
    files: BTreeMap<String, String>,
    token: Option<String>,
    used: Mutex<Vec<Option<String>>>,
}

impl FakeSource {
    pub fn with_file(path: &str, contents: &str) -> Self {
        Self {
            files: BTreeMap::from([(path.to_string(), contents.to_string())]),
            ..Self::default()
        }
    }

    pub fn requiring_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn tokens_used(&self) -> Vec<Option<String>> {
        self.used.lock().unwrap().clone()
    }
}

impl CodeSource for FakeSource {
    async fn file_contents(
        &self,
        repo: &GitHubRepo,
        path: &str,
        token: Option<&str>,
    ) -> Result<String, FetchError> {
        self.used.lock().unwrap().push(token.map(str::to_string));
        if self.token.is_some() && self.token.as_deref() != token {
            return Err(FetchError::FileNotFound(format!("{repo}/{path}")));
        }
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| FetchError::FileNotFound(format!("{repo}/{path}")))
    }
}

pub fn workspace(account: &str, handle: &str) -> Workspace {
    Workspace {
        account_id: Uuid::new_v4(),
        account_handle: account.to_string(),
        workspace_id: Uuid::new_v4(),
        workspace_handle: handle.to_string(),
    }
}

pub fn cron_schedule(cron: &str, active: bool) -> DeploymentSchedule {
    DeploymentSchedule {
        id: Uuid::new_v4(),
        schedule: Schedule::Cron {
            cron: cron.to_string(),
            timezone: Some("UTC".to_string()),
        },
        active,
    }
}
