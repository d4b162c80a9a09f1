use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const MANAGED_POOL_TYPE: &str = "prefect:managed";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flow {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Schedule {
    Cron {
        cron: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    Interval {
        /// Seconds between runs.
        interval: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_date: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    RRule {
        rrule: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentSchedule {
    pub id: Uuid,
    pub schedule: Schedule,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeploymentScheduleCreate {
    pub schedule: Schedule,
    pub active: bool,
    pub parameters: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: Uuid,
    pub name: String,
    pub flow_id: Uuid,
    #[serde(default)]
    pub schedules: Vec<DeploymentSchedule>,
    #[serde(default)]
    pub work_pool_name: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentCreate {
    pub name: String,
    pub flow_id: Uuid,
    pub entrypoint: String,
    pub work_pool_name: String,
    pub pull_steps: Vec<Value>,
    pub parameter_openapi_schema: Value,
    pub parameters: BTreeMap<String, Value>,
    pub job_variables: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowRun {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub deployment_id: Option<Uuid>,
    #[serde(default)]
    pub expected_start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkPool {
    pub name: String,
    #[serde(rename = "type")]
    pub pool_type: String,
    #[serde(default)]
    pub is_paused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkPoolCreate {
    pub name: String,
    #[serde(rename = "type")]
    pub pool_type: String,
    pub base_job_template: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockDocument {
    pub id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Me {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub handle: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub account_id: Uuid,
    pub account_name: String,
    pub account_handle: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Workspace {
    pub account_id: Uuid,
    pub account_handle: String,
    pub workspace_id: Uuid,
    pub workspace_handle: String,
}

impl Workspace {
    pub fn full_handle(&self) -> String {
        format!("{}/{}", self.account_handle, self.workspace_handle)
    }
}

fn default_true() -> bool {
    true
}
