use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result, anyhow, bail};
use clap::ValueEnum;
use serde::Serialize;
use serde_json::{Value, json};
use tera::{Context as TeraContext, Tera};
use uuid::Uuid;

use crate::client::{self, CloudApi};
use crate::dependencies;
use crate::github::{CodeSource, FetchError, GitHubRepo};
use crate::output::{Printer, link};
use crate::params;
use crate::schemas::{DeploymentCreate, FlowRun, WorkPool};
use crate::signature;

const DEPLOYED_TEMPLATE: &str = include_str!("../templates/deployed.txt");

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum PythonVersion {
    #[value(name = "3.9")]
    Py39,
    #[value(name = "3.10")]
    Py310,
    #[value(name = "3.11")]
    Py311,
    #[default]
    #[value(name = "3.12")]
    Py312,
    #[value(name = "3.13")]
    Py313,
}

impl PythonVersion {
    pub fn image(self) -> String {
        format!("prefecthq/prefect-client:3-python{}", self)
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = match self {
            PythonVersion::Py39 => "3.9",
            PythonVersion::Py310 => "3.10",
            PythonVersion::Py311 => "3.11",
            PythonVersion::Py312 => "3.12",
            PythonVersion::Py313 => "3.13",
        };
        f.write_str(version)
    }
}

/// How the deployment's source is reached at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceAuth {
    Pat,
    App,
    Public,
}

impl fmt::Display for SourceAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceAuth::Pat => "GitHub PAT",
            SourceAuth::App => "GitHub App",
            SourceAuth::Public => "Public Repo",
        })
    }
}

#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// `path/to/file.py:function_name`
    pub function: String,
    pub repo: GitHubRepo,
    pub credentials: Option<String>,
    /// Requirements, already expanded from any files given with `--with`.
    pub dependencies: Vec<String>,
    pub with_requirements: Option<String>,
    pub python: PythonVersion,
    pub env: Vec<String>,
    pub secrets: Vec<String>,
    pub parameters: Vec<String>,
    pub name: Option<String>,
    pub run: bool,
}

#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub deployment_id: Uuid,
    pub deployment_name: String,
    pub flow_name: String,
    pub entrypoint: String,
    pub repo: GitHubRepo,
    pub auth: SourceAuth,
    pub work_pool: WorkPool,
    pub image: String,
    pub requirements: Option<String>,
    pub dependencies: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub secret_keys: Vec<String>,
    pub parameters: BTreeMap<String, Value>,
    pub flow_run: Option<FlowRun>,
}

/// Split `path/to/file.py:function` into the file path and function name.
pub fn split_function(function: &str) -> Result<(String, String)> {
    let invalid = || anyhow!("Invalid function. Expected path/to/file.py:function_name");
    let (path, name) = function.split_once(':').ok_or_else(invalid)?;
    if path.is_empty() || name.is_empty() || name.contains(':') {
        return Err(invalid());
    }
    Ok((path.trim_start_matches('/').to_string(), name.to_string()))
}

pub async fn deploy<C: CloudApi, S: CodeSource>(
    api: &C,
    source: &S,
    api_url: &str,
    request: &DeployRequest,
) -> Result<DeployOutcome> {
    let (filepath, function) = split_function(&request.function)?;

    let env = params::process_string_pairs(&request.env)?;
    let secrets = params::process_string_pairs(&request.secrets)?;
    let parameters = params::process_key_value_pairs(&request.parameters, true)?;

    let repo = &request.repo;
    let app_token = match &request.credentials {
        Some(_) => None,
        None => api
            .get_github_token(&repo.owner, &repo.repo)
            .await
            .context("failed to look up the Prefect Cloud GitHub integration")?,
    };
    let (auth, token) = match (&request.credentials, &app_token) {
        (Some(pat), _) => (SourceAuth::Pat, Some(pat.as_str())),
        (None, Some(app)) => (SourceAuth::App, Some(app.as_str())),
        (None, None) => (SourceAuth::Public, None),
    };
    tracing::info!(repo = %repo, path = %filepath, auth = %auth, "deploy: inspecting code");

    let contents = match source.file_contents(repo, &filepath, token).await {
        Ok(contents) => contents,
        Err(FetchError::FileNotFound(_)) => bail!(
            "Unable to access file {} in {}/{}. If the repository is private, \
             connect it with `prefect-cloud github setup` or retry with `--credentials`.",
            filepath,
            repo.owner,
            repo.repo
        ),
        Err(FetchError::Other(err)) => return Err(err),
    };

    let parameter_schema = signature::parameter_schema(&contents, &function)
        .map_err(|_| anyhow!("Could not find function '{}' in {}", function, filepath))?;

    let mut pull_steps = match (&auth, &request.credentials) {
        (SourceAuth::Pat, Some(pat)) => {
            let block = client::create_or_replace_secret(
                api,
                &format!("{}-{}-credentials", repo.owner, repo.repo),
                pat,
            )
            .await
            .context("failed to store repository credentials")?;
            repo.private_repo_via_block_pull_steps(&block)
        }
        (SourceAuth::App, _) => repo.private_repo_via_github_app_pull_steps(),
        _ => repo.public_repo_pull_steps(),
    };

    let mut secret_env = BTreeMap::new();
    for (key, value) in &secrets {
        let block = client::create_or_replace_secret(api, key, value)
            .await
            .with_context(|| format!("failed to store secret {}", key))?;
        secret_env.insert(key.clone(), format!("{{{{ prefect.blocks.secret.{} }}}}", block));
    }

    let work_pool = client::ensure_managed_work_pool(api)
        .await
        .context("failed to provision the managed work pool")?;

    if !request.dependencies.is_empty() {
        pull_steps.push(shell_step(&dependencies::install_script(&request.dependencies)));
    }
    if let Some(path) = &request.with_requirements {
        pull_steps.push(shell_step(&dependencies::requirements_script(path)));
    }

    let mut job_env: BTreeMap<String, String> = BTreeMap::new();
    job_env.insert("PREFECT_CLOUD_API_URL".into(), api_url.to_string());
    job_env.extend(env.clone());
    job_env.extend(secret_env);
    let image = request.python.image();

    let flow_id = api
        .create_flow(&function)
        .await
        .context("failed to create flow")?;
    let deployment_name = request.name.clone().unwrap_or_else(|| function.clone());
    let entrypoint = format!("{}:{}", filepath, function);
    let deployment_id = api
        .create_deployment(&DeploymentCreate {
            name: deployment_name.clone(),
            flow_id,
            entrypoint: entrypoint.clone(),
            work_pool_name: work_pool.name.clone(),
            pull_steps,
            parameter_openapi_schema: parameter_schema,
            parameters: parameters.clone(),
            job_variables: json!({"env": job_env, "image": image}),
        })
        .await
        .context("failed to create deployment")?;
    tracing::info!(deployment = %deployment_id, "deploy: deployment created");

    let flow_run = if request.run {
        Some(
            api.create_flow_run_from_deployment(deployment_id, &parameters)
                .await
                .context("failed to start flow run")?,
        )
    } else {
        None
    };

    Ok(DeployOutcome {
        deployment_id,
        deployment_name,
        flow_name: function,
        entrypoint,
        repo: repo.clone(),
        auth,
        work_pool,
        image,
        requirements: request.with_requirements.clone(),
        dependencies: request.dependencies.clone(),
        env,
        secret_keys: secrets.into_keys().collect(),
        parameters,
        flow_run,
    })
}

fn shell_step(script: &str) -> Value {
    json!({
        "prefect.deployments.steps.run_shell_script": {
            "directory": "{{ git-clone.directory }}",
            "script": script,
        }
    })
}

#[derive(Debug, Serialize)]
struct SummaryItem {
    key: String,
    value: String,
}

pub fn render_summary(outcome: &DeployOutcome) -> Result<String> {
    let mut env: Vec<SummaryItem> = outcome
        .env
        .iter()
        .map(|(key, value)| SummaryItem {
            key: key.clone(),
            value: value.clone(),
        })
        .collect();
    env.extend(outcome.secret_keys.iter().map(|key| SummaryItem {
        key: key.clone(),
        value: "*****".into(),
    }));
    let parameters: Vec<SummaryItem> = outcome
        .parameters
        .iter()
        .map(|(key, value)| SummaryItem {
            key: key.clone(),
            value: value.to_string(),
        })
        .collect();

    let mut ctx = TeraContext::new();
    ctx.insert("flow_name", &outcome.flow_name);
    ctx.insert("deployment_name", &outcome.deployment_name);
    ctx.insert("work_pool", &outcome.work_pool.name);
    ctx.insert("work_pool_paused", &outcome.work_pool.is_paused);
    ctx.insert("source", &outcome.repo.to_string());
    ctx.insert("auth", &outcome.auth.to_string());
    ctx.insert("entrypoint", &outcome.entrypoint);
    ctx.insert("image", &outcome.image);
    let dependencies: Vec<String> = outcome
        .requirements
        .iter()
        .map(|path| format!("from {}", path))
        .chain(outcome.dependencies.iter().cloned())
        .collect();
    ctx.insert("dependencies", &dependencies);
    ctx.insert("env", &env);
    ctx.insert("parameters", &parameters);

    Tera::one_off(DEPLOYED_TEMPLATE, &ctx, false)
        .map_err(|err| anyhow!("failed to render deployment summary: {}", err))
}

pub fn report(printer: &Printer, ui_url: &str, outcome: &DeployOutcome) -> Result<()> {
    printer.line(render_summary(outcome)?.trim_end());
    printer.line("");
    printer.line(format!(
        "View it at: {}",
        link(&format!("{}/deployments/deployment/{}", ui_url, outcome.deployment_id))
    ));
    printer.line(format!(
        "Run it with: prefect-cloud run {}/{}",
        outcome.flow_name, outcome.deployment_name
    ));
    if let Some(flow_run) = &outcome.flow_run {
        printer.success(format!(
            "Started flow run {}: {}",
            flow_run.name,
            link(&format!("{}/runs/flow-run/{}", ui_url, flow_run.id))
        ));
    }
    if outcome.work_pool.is_paused {
        printer.note(paused_pool_note(ui_url));
    }
    Ok(())
}

pub fn paused_pool_note(ui_url: &str) -> String {
    format!(
        "Your managed work pool is currently paused. This will prevent the deployment \
         from running until it is resumed. Visit {} to resume the work pool.",
        link(&format!("{}/work-pools", ui_url))
    )
}
