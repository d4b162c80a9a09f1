mod auth;
mod client;
mod config;
mod dependencies;
mod deploy;
mod deployments;
mod github;
mod notify;
mod output;
mod params;
mod schemas;
mod signature;
#[cfg(test)]
mod testing;

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use crate::client::CloudApi;
use crate::config::Settings;
use crate::deploy::{DeployRequest, PythonVersion};
use crate::github::{GitHubFileRef, GitHubRepo, GitHubSource};
use crate::output::{Printer, link};

#[derive(Parser, Debug)]
#[command(name = "prefect-cloud", version, about = "Deploy with Prefect Cloud", long_about = None)]
struct Cli {
    /// Suppress output
    #[arg(global = true, short, long, default_value_t = false)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct DeployOptions {
    /// GitHub credentials for accessing private repositories
    #[arg(short, long)]
    credentials: Option<String>,
    /// Python dependencies to include (can be used multiple times)
    #[arg(short = 'd', long = "with", value_name = "DEPENDENCY")]
    with: Vec<String>,
    /// Path to the repository's requirements file
    #[arg(long, value_name = "PATH")]
    with_requirements: Option<String>,
    /// Python version of the runtime image
    #[arg(long = "with-python", value_enum, default_value = "3.12")]
    python: PythonVersion,
    /// Environment variable in KEY=VALUE format (can be used multiple times)
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,
    /// Environment variable stored as a Prefect Cloud secret, in KEY=VALUE format
    #[arg(long = "secret", value_name = "KEY=VALUE")]
    secrets: Vec<String>,
    /// Default function parameter in NAME=VALUE format (can be used multiple times)
    #[arg(short, long = "parameter", value_name = "NAME=VALUE")]
    parameters: Vec<String>,
    /// Deployment name, defaults to the function name
    #[arg(short, long)]
    name: Option<String>,
    /// Start a flow run right after deploying
    #[arg(long, default_value_t = false)]
    run: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in to Prefect Cloud
    Login {
        /// Prefect Cloud API key
        #[arg(short, long)]
        key: Option<String>,
        /// Workspace ID or handle
        #[arg(short, long)]
        workspace: Option<String>,
    },
    /// Log out of Prefect Cloud
    Logout,
    /// Show current user and workspace information
    Whoami,
    /// Deploy a Python function from a GitHub repository
    Deploy {
        /// The function to deploy, as path/to/file.py:function_name
        function: String,
        /// GitHub repository: owner/repo, github.com/owner/repo or github.com/owner/repo/tree/<ref>
        #[arg(short, long = "from", value_name = "REPO")]
        from: Option<String>,
        #[command(flatten)]
        options: DeployOptions,
    },
    /// Deploy a function directly from a GitHub file URL
    GitDeploy {
        /// https://github.com/owner/repo/blob/<branch>/path.py or gh/owner/repo[@branch]/path.py
        url: String,
        /// Name of the function in that file
        function: String,
        #[command(flatten)]
        options: DeployOptions,
    },
    /// Run a deployment immediately
    Run {
        /// Deployment ID or FLOW_NAME/DEPLOYMENT_NAME
        deployment: String,
        /// Function parameter in NAME=VALUE format (can be used multiple times)
        #[arg(short, long = "parameter", value_name = "NAME=VALUE")]
        parameters: Vec<String>,
    },
    /// Set a deployment to run on a cron schedule, or `none` to clear it
    Schedule {
        deployment: String,
        schedule: String,
        #[arg(short, long = "parameter", value_name = "NAME=VALUE")]
        parameters: Vec<String>,
    },
    /// Remove deployment schedules
    Unschedule { deployment: String },
    /// Pause a deployment so none of its schedules create runs
    Pause { deployment: String },
    /// Resume a paused deployment
    Resume { deployment: String },
    /// List all deployments
    Ls,
    /// Delete a deployment
    Delete { deployment: String },
    /// E-mail when a deployment's flow runs fail
    Notify {
        deployment: String,
        /// Address to notify (can be used multiple times)
        #[arg(short, long = "email")]
        emails: Vec<String>,
        /// Do not notify the current user
        #[arg(long, default_value_t = false)]
        exclude_me: bool,
    },
    /// Prefect Cloud + GitHub
    Github {
        #[command(subcommand)]
        command: GithubCommands,
    },
}

#[derive(Subcommand, Debug)]
enum GithubCommands {
    /// Install the Prefect Cloud GitHub App
    Setup,
    /// List repositories the GitHub App can access
    Ls,
    /// Print an installation token for a repository
    Token {
        /// owner/repo
        repository: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("PREFECT_CLOUD_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_env()?;
    let printer = Printer::new(cli.quiet);

    match cli.command {
        Commands::Login { key, workspace } => {
            auth::login(&settings, &printer, key, workspace).await?;
        }
        Commands::Logout => auth::logout(&settings, &printer).await?,
        Commands::Whoami => auth::whoami(&settings, &printer).await?,
        Commands::Deploy {
            function,
            from,
            options,
        } => {
            deploy::split_function(&function)?;
            let from = match from {
                Some(from) => from,
                None => github::infer_repo_url().await?,
            };
            let repo = GitHubRepo::from_url(&from)?;
            run_deploy(&settings, &printer, function, repo, options).await?;
        }
        Commands::GitDeploy {
            url,
            function,
            options,
        } => {
            let file = GitHubFileRef::from_url(&url)?;
            tracing::debug!(file = %file, "git-deploy: resolved file reference");
            let function = format!("{}:{}", file.filepath, function);
            run_deploy(&settings, &printer, function, file.repo(), options).await?;
        }
        Commands::Run {
            deployment,
            parameters,
        } => {
            let parameters = params::process_key_value_pairs(&parameters, true)?;
            let (urls, api) = auth::cloud_client(&settings).await?;
            run_command(&api, &urls.ui_url, &printer, &deployment, &parameters).await?;
        }
        Commands::Schedule {
            deployment,
            schedule,
            parameters,
        } => {
            let parameters = params::process_key_value_pairs(&parameters, true)?;
            let (_, api) = auth::cloud_client(&settings).await?;
            schedule_command(&api, &printer, &deployment, &schedule, &parameters).await?;
        }
        Commands::Unschedule { deployment } => {
            let (_, api) = auth::cloud_client(&settings).await?;
            deployments::unschedule(&api, &deployment).await?;
            printer.success("Deployment unscheduled");
        }
        Commands::Pause { deployment } => {
            let (_, api) = auth::cloud_client(&settings).await?;
            deployments::pause(&api, &deployment).await?;
            printer.success("Deployment paused");
        }
        Commands::Resume { deployment } => {
            let (_, api) = auth::cloud_client(&settings).await?;
            deployments::resume(&api, &deployment).await?;
            printer.success("Deployment resumed");
        }
        Commands::Ls => {
            let (_, api) = auth::cloud_client(&settings).await?;
            ls_command(&api, &printer).await?;
        }
        Commands::Delete { deployment } => {
            let (_, api) = auth::cloud_client(&settings).await?;
            deployments::delete(&api, &deployment).await?;
            printer.success("Deployment deleted");
        }
        Commands::Notify {
            deployment,
            emails,
            exclude_me,
        } => {
            let (_, api) = auth::cloud_client(&settings).await?;
            notify::notify(&api, &deployment, &emails, exclude_me).await?;
            printer.success(format!("Failure notifications configured for {}", deployment));
        }
        Commands::Github { command } => match command {
            GithubCommands::Setup => {
                auth::cloud_urls_or_login(&settings).await?;
                github::setup(&printer);
            }
            GithubCommands::Ls => {
                let (_, api) = auth::cloud_client(&settings).await?;
                for repo in github::repositories(&api).await? {
                    printer.line(repo);
                }
            }
            GithubCommands::Token { repository } => {
                let (_, api) = auth::cloud_client(&settings).await?;
                printer.data(github::installation_token(&api, &repository).await?);
            }
        },
    }

    Ok(())
}

async fn run_command<C: CloudApi>(
    api: &C,
    ui_url: &str,
    printer: &Printer,
    deployment: &str,
    parameters: &BTreeMap<String, Value>,
) -> Result<()> {
    let (found, flow_run) = deployments::run(api, deployment, parameters).await?;
    printer.success(format!("Started flow run {}", flow_run.name));
    printer.line(format!(
        "└─► View: {}",
        link(&format!("{}/runs/flow-run/{}", ui_url, flow_run.id))
    ));
    if deployments::work_pool_paused(api, &found).await? {
        printer.note(deploy::paused_pool_note(ui_url));
    }
    Ok(())
}

async fn schedule_command<C: CloudApi>(
    api: &C,
    printer: &Printer,
    deployment: &str,
    schedule: &str,
    parameters: &BTreeMap<String, Value>,
) -> Result<()> {
    deployments::schedule(api, deployment, schedule, parameters).await?;
    printer.success("Deployment scheduled");
    Ok(())
}

async fn ls_command<C: CloudApi>(api: &C, printer: &Printer) -> Result<()> {
    let context = deployments::list(api).await?;
    printer.table("Deployments", deployments::list_rows(&context));
    printer.line(console::style(deployments::CRON_CHEATSHEET).dim());
    Ok(())
}

async fn run_deploy(
    settings: &Settings,
    printer: &Printer,
    function: String,
    repo: GitHubRepo,
    options: DeployOptions,
) -> Result<()> {
    let (urls, api) = auth::cloud_client(settings).await?;
    let cwd = std::env::current_dir().context("failed to read the working directory")?;
    let request = DeployRequest {
        function,
        repo,
        credentials: options.credentials,
        dependencies: dependencies::expand_dependencies(&options.with, &cwd).await?,
        with_requirements: options.with_requirements,
        python: options.python,
        env: options.env,
        secrets: options.secrets,
        parameters: options.parameters,
        name: options.name,
        run: options.run,
    };

    let outcome = deploy::deploy(&api, &GitHubSource, &urls.api_url, &request).await?;
    deploy::report(printer, &urls.ui_url, &outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::WorkPool;
    use crate::testing::{Call, FakeCloud, cron_schedule};
    use serde_json::json;
    use uuid::Uuid;

    const UI_URL: &str = "https://app.prefect.cloud/account/a/workspace/w";

    fn paused_pool(api: &FakeCloud, paused: bool) {
        api.state().work_pools.push(WorkPool {
            name: "default-work-pool".into(),
            pool_type: "prefect:managed".into(),
            is_paused: paused,
        });
    }

    #[tokio::test]
    async fn run_links_the_flow_run() {
        let api = FakeCloud::default();
        paused_pool(&api, false);
        let deployment = api.add_deployment("etl", "nightly", vec![]);
        let params = BTreeMap::from([("n".to_string(), json!(1))]);

        let printer = Printer::capturing();
        run_command(&api, UI_URL, &printer, "etl/nightly", &params).await.unwrap();
        insta::assert_snapshot!(printer.output(), @r"
        ✓ Started flow run crimson-fox
        └─► View: https://app.prefect.cloud/account/a/workspace/w/runs/flow-run/00000000-0000-0000-0000-00000000f001
        ");
        assert_eq!(api.calls(), vec![Call::CreateFlowRun(deployment.id, params)]);
    }

    #[tokio::test]
    async fn run_warns_about_a_paused_pool() {
        let api = FakeCloud::default();
        paused_pool(&api, true);
        api.add_deployment("etl", "nightly", vec![]);

        let printer = Printer::capturing();
        run_command(&api, UI_URL, &printer, "etl/nightly", &BTreeMap::new())
            .await
            .unwrap();
        insta::assert_snapshot!(printer.output(), @r"
        ✓ Started flow run crimson-fox
        └─► View: https://app.prefect.cloud/account/a/workspace/w/runs/flow-run/00000000-0000-0000-0000-00000000f001
        Note: Your managed work pool is currently paused. This will prevent the deployment from running until it is resumed. Visit https://app.prefect.cloud/account/a/workspace/w/work-pools to resume the work pool.
        ");
    }

    #[tokio::test]
    async fn schedule_confirms() {
        let api = FakeCloud::default();
        api.add_deployment("etl", "nightly", vec![cron_schedule("0 0 * * *", true)]);

        let printer = Printer::capturing();
        schedule_command(&api, &printer, "etl/nightly", "30 6 * * 1-5", &BTreeMap::new())
            .await
            .unwrap();
        insta::assert_snapshot!(printer.output(), @"✓ Deployment scheduled");

        let err = schedule_command(&api, &printer, "etl/nightly", "", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Invalid cron expression"));
    }

    #[tokio::test]
    async fn ls_prints_a_table_and_cheatsheet() {
        let api = FakeCloud::default();
        api.add_deployment("etl", "nightly", vec![cron_schedule("0 0 * * *", true)]);
        api.add_deployment("etl", "adhoc", vec![]);
        {
            let mut state = api.state();
            state.deployments[0].id = Uuid::from_u128(1);
            state.deployments[1].id = Uuid::from_u128(2);
        }

        let printer = Printer::capturing();
        ls_command(&api, &printer).await.unwrap();
        insta::assert_snapshot!(printer.output(), @r"
        Deployments
        ╭─────────────┬───────────────────┬──────────┬──────────────────────────────────────╮
        │ Name        │ Schedule          │ Next run │ ID                                   │
        ├─────────────┼───────────────────┼──────────┼──────────────────────────────────────┤
        │ etl/nightly │ ✓ 0 0 * * * (UTC) │          │ 00000000-0000-0000-0000-000000000001 │
        │ etl/adhoc   │                   │          │ 00000000-0000-0000-0000-000000000002 │
        ╰─────────────┴───────────────────┴──────────┴──────────────────────────────────────╯
        * Cron cheatsheet: minute hour day-of-month month day-of-week
        ");
    }
}
