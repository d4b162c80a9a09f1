use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result, bail};
use chrono::{Local, Utc};
use serde_json::Value;
use tabled::Tabled;
use uuid::Uuid;

use crate::client::{CloudApi, CloudError};
use crate::schemas::{
    Deployment, DeploymentSchedule, DeploymentScheduleCreate, Flow, FlowRun, Schedule,
};

pub const CRON_CHEATSHEET: &str = "* Cron cheatsheet: minute hour day-of-month month day-of-week";

/// How a deployment is named on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentRef {
    Id(Uuid),
    Name { flow: String, deployment: String },
}

impl DeploymentRef {
    pub fn parse(raw: &str) -> Result<Self> {
        if let Ok(id) = Uuid::parse_str(raw.trim()) {
            return Ok(DeploymentRef::Id(id));
        }
        match raw.split_once('/') {
            Some((flow, deployment))
                if !flow.is_empty() && !deployment.is_empty() && !deployment.contains('/') =>
            {
                Ok(DeploymentRef::Name {
                    flow: flow.to_string(),
                    deployment: deployment.to_string(),
                })
            }
            _ => bail!(
                "Invalid deployment name format: {}. Expected format: <FLOW_NAME>/<DEPLOYMENT_NAME>",
                raw
            ),
        }
    }
}

pub async fn get_deployment<C: CloudApi>(api: &C, raw: &str) -> Result<Deployment> {
    let result = match DeploymentRef::parse(raw)? {
        DeploymentRef::Id(id) => api.read_deployment(id).await,
        DeploymentRef::Name { flow, deployment } => {
            api.read_deployment_by_name(&flow, &deployment).await
        }
    };
    match result {
        Ok(deployment) => Ok(deployment),
        Err(CloudError::NotFound { .. }) => bail!("Deployment '{}' not found", raw),
        Err(err) => Err(err).with_context(|| format!("failed to read deployment {}", raw)),
    }
}

pub async fn run<C: CloudApi>(
    api: &C,
    raw: &str,
    parameters: &BTreeMap<String, Value>,
) -> Result<(Deployment, FlowRun)> {
    let deployment = get_deployment(api, raw).await?;
    let flow_run = api
        .create_flow_run_from_deployment(deployment.id, parameters)
        .await
        .context("failed to create flow run")?;
    tracing::info!(deployment = %deployment.id, flow_run = %flow_run.id, "deployments: run started");
    Ok((deployment, flow_run))
}

/// Whether the work pool a deployment runs on is paused.
pub async fn work_pool_paused<C: CloudApi>(api: &C, deployment: &Deployment) -> Result<bool> {
    let Some(pool) = &deployment.work_pool_name else {
        return Ok(false);
    };
    let pool = api
        .read_work_pool(pool)
        .await
        .with_context(|| format!("failed to read work pool {}", pool))?;
    Ok(pool.is_paused)
}

/// Replace every schedule of a deployment with one cron schedule, or none.
pub async fn schedule<C: CloudApi>(
    api: &C,
    raw: &str,
    expr: &str,
    parameters: &BTreeMap<String, Value>,
) -> Result<()> {
    let expr = expr.trim();
    let clearing = expr.eq_ignore_ascii_case("none");
    if !clearing {
        validate_cron(expr)?;
    }

    let deployment = get_deployment(api, raw).await?;
    for prior in &deployment.schedules {
        api.delete_deployment_schedule(deployment.id, prior.id)
            .await
            .with_context(|| format!("failed to delete schedule {}", prior.id))?;
    }
    if clearing {
        return Ok(());
    }

    let schedule = DeploymentScheduleCreate {
        schedule: Schedule::Cron {
            cron: expr.to_string(),
            timezone: Some(local_timezone_name()),
        },
        active: true,
        parameters: parameters.clone(),
    };
    api.create_deployment_schedules(deployment.id, &[schedule])
        .await
        .context("failed to create schedule")?;
    Ok(())
}

pub async fn unschedule<C: CloudApi>(api: &C, raw: &str) -> Result<()> {
    schedule(api, raw, "none", &BTreeMap::new()).await
}

pub async fn pause<C: CloudApi>(api: &C, raw: &str) -> Result<()> {
    let deployment = get_deployment(api, raw).await?;
    api.set_deployment_paused(deployment.id, true)
        .await
        .context("failed to pause deployment")
}

pub async fn resume<C: CloudApi>(api: &C, raw: &str) -> Result<()> {
    let deployment = get_deployment(api, raw).await?;
    api.set_deployment_paused(deployment.id, false)
        .await
        .context("failed to resume deployment")
}

pub async fn delete<C: CloudApi>(api: &C, raw: &str) -> Result<()> {
    let deployment = get_deployment(api, raw).await?;
    api.delete_deployment(deployment.id)
        .await
        .context("failed to delete deployment")
}

pub fn validate_cron(expr: &str) -> Result<()> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        bail!(
            "Invalid cron expression: {:?} has {} fields, expected 5 \
             (minute hour day-of-month month day-of-week)",
            expr,
            fields
        );
    }
    Ok(())
}

#[derive(Debug)]
pub struct DeploymentListContext {
    pub deployments: Vec<Deployment>,
    pub flows_by_id: HashMap<Uuid, Flow>,
    pub next_runs_by_deployment_id: HashMap<Uuid, FlowRun>,
}

pub async fn list<C: CloudApi>(api: &C) -> Result<DeploymentListContext> {
    let deployments = api
        .read_deployments()
        .await
        .context("failed to list deployments")?;
    let flows_by_id = api
        .read_flows()
        .await
        .context("failed to list flows")?
        .into_iter()
        .map(|flow| (flow.id, flow))
        .collect();

    let mut next_runs_by_deployment_id = HashMap::new();
    if !deployments.is_empty() {
        let ids: Vec<Uuid> = deployments.iter().map(|d| d.id).collect();
        let runs = api
            .read_scheduled_runs(&ids, Utc::now())
            .await
            .context("failed to read scheduled runs")?;
        for run in runs {
            if let Some(id) = run.deployment_id {
                next_runs_by_deployment_id.entry(id).or_insert(run);
            }
        }
    }

    Ok(DeploymentListContext {
        deployments,
        flows_by_id,
        next_runs_by_deployment_id,
    })
}

pub fn describe_schedule(schedule: &DeploymentSchedule) -> String {
    let prefix = if schedule.active { "✓" } else { " " };
    let description = match &schedule.schedule {
        Schedule::Cron { cron, timezone } => {
            format!("{} ({})", cron, timezone.as_deref().unwrap_or("UTC"))
        }
        Schedule::Interval { interval, .. } => format!("Every {} seconds", interval),
        Schedule::RRule { rrule, .. } => rrule.clone(),
    };
    format!("{} {}", prefix, description)
}

#[derive(Debug, Tabled)]
pub struct DeploymentRow {
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Schedule")]
    pub schedule: String,
    #[tabled(rename = "Next run")]
    pub next_run: String,
    #[tabled(rename = "ID")]
    pub id: String,
}

pub fn list_rows(context: &DeploymentListContext) -> Vec<DeploymentRow> {
    context
        .deployments
        .iter()
        .map(|deployment| {
            let flow = context
                .flows_by_id
                .get(&deployment.flow_id)
                .map(|f| f.name.as_str())
                .unwrap_or("?");
            let next_run = context
                .next_runs_by_deployment_id
                .get(&deployment.id)
                .and_then(|run| run.expected_start_time)
                .map(|t| {
                    t.with_timezone(&Local)
                        .format("%Y-%m-%d %H:%M:%S %Z")
                        .to_string()
                })
                .unwrap_or_default();
            DeploymentRow {
                name: format!("{}/{}", flow, deployment.name),
                schedule: deployment
                    .schedules
                    .iter()
                    .map(describe_schedule)
                    .collect::<Vec<_>>()
                    .join("\n"),
                next_run,
                id: deployment.id.to_string(),
            }
        })
        .collect()
}

/// IANA name of the local time zone, falling back to UTC.
pub fn local_timezone_name() -> String {
    zone_or_utc(iana_time_zone::get_timezone())
}

fn zone_or_utc(found: Result<String, iana_time_zone::GetTimezoneError>) -> String {
    match found {
        Ok(zone)
            if !zone.is_empty()
                && !zone.starts_with([':', '/'])
                && !zone.contains(|c: char| c == ',' || c.is_whitespace()) =>
        {
            zone
        }
        Ok(zone) => {
            tracing::debug!(zone = %zone, "deployments: unusable time zone, using UTC");
            "UTC".to_string()
        }
        Err(err) => {
            tracing::debug!(error = %err, "deployments: no local time zone, using UTC");
            "UTC".to_string()
        }
    }
}
