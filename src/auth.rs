use std::collections::BTreeMap;
use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use uuid::Uuid;

use crate::client::{CloudApi, CloudClient, CloudError};
use crate::config::{CloudEnv, Settings};
use crate::output::Printer;
use crate::schemas::Workspace;

pub const NOT_LOGGED_IN: &str = "Not logged in. Run `prefect-cloud login` first.";

static WORKSPACE_API_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<scheme>https?://)(?P<host>[^/]+)(?P<prefix>(?:/[^/]+)*?)/api/accounts/(?P<account>[^/]+)/workspaces/(?P<workspace>[^/]+)/?$",
    )
    .unwrap()
});

/// Everything needed to talk to the active workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudUrls {
    pub ui_url: String,
    pub api_url: String,
    pub api_key: String,
}

pub fn workspace_api_url(env: CloudEnv, account_id: Uuid, workspace_id: Uuid) -> String {
    format!(
        "{}/accounts/{}/workspaces/{}",
        env.api_base(),
        account_id,
        workspace_id
    )
}

pub fn workspace_ui_url(env: CloudEnv, account_id: Uuid, workspace_id: Uuid) -> String {
    format!(
        "{}/account/{}/workspace/{}",
        env.ui_base(),
        account_id,
        workspace_id
    )
}

/// Map a workspace API URL to its dashboard URL.
pub fn ui_url_for(api_url: &str) -> Result<String> {
    let caps = WORKSPACE_API_URL
        .captures(api_url.trim())
        .ok_or_else(|| anyhow!("{} is not a Prefect Cloud workspace API URL", api_url))?;
    let host = &caps["host"];
    let host = match host.strip_prefix("api.") {
        Some(rest) => format!("app.{}", rest),
        None => host.to_string(),
    };
    Ok(format!(
        "{}{}{}/account/{}/workspace/{}",
        &caps["scheme"], host, &caps["prefix"], &caps["account"], &caps["workspace"]
    ))
}

/// Resolve the workspace from the environment override, else the active profile.
pub async fn cloud_urls(settings: &Settings) -> Result<Option<CloudUrls>> {
    let (api_url, api_key) = match (&settings.env_api_url, &settings.env_api_key) {
        (Some(url), Some(key)) => (Some(url.clone()), Some(key.clone())),
        _ => match settings.profiles().load_active().await? {
            Some((name, profile)) => {
                tracing::debug!(profile = %name, "auth: using active profile");
                (profile.api_url, profile.api_key)
            }
            None => (None, None),
        },
    };

    let (Some(api_url), Some(api_key)) = (api_url, api_key) else {
        return Ok(None);
    };
    let Ok(ui_url) = ui_url_for(&api_url) else {
        tracing::debug!(api_url, "auth: active API URL is not a Cloud workspace");
        return Ok(None);
    };
    Ok(Some(CloudUrls {
        ui_url,
        api_url,
        api_key,
    }))
}

pub async fn cloud_urls_or_login(settings: &Settings) -> Result<CloudUrls> {
    cloud_urls(settings).await?.ok_or_else(|| anyhow!(NOT_LOGGED_IN))
}

/// Client for the active workspace, together with its URLs.
pub async fn cloud_client(settings: &Settings) -> Result<(CloudUrls, CloudClient)> {
    let urls = cloud_urls_or_login(settings).await?;
    let client = CloudClient::new(&urls.api_url, &urls.api_key)?;
    Ok((urls, client))
}

pub async fn login(
    settings: &Settings,
    printer: &Printer,
    key: Option<String>,
    workspace: Option<String>,
) -> Result<()> {
    let key = match key.or_else(|| settings.env_api_key.clone()) {
        Some(key) => key,
        None => prompt_for_key()?,
    };
    let api = CloudClient::new(settings.cloud_env.api_base(), &key)?;
    let chosen = complete_login(&api, settings, &key, workspace.as_deref()).await?;
    printer.success(format!("Logged in to {}", chosen.full_handle()));
    Ok(())
}

/// Select a workspace with `key` and store it as the active profile.
pub async fn complete_login<C: CloudApi>(
    api: &C,
    settings: &Settings,
    key: &str,
    wanted: Option<&str>,
) -> Result<Workspace> {
    let workspaces = match api.workspaces().await {
        Err(CloudError::Unauthorized { .. }) => bail!("Invalid API key"),
        other => other.context("failed to list workspaces")?,
    };

    let chosen = match select_workspace(&workspaces, wanted)? {
        Some(workspace) => workspace.clone(),
        None => prompt_for_workspace(&workspaces)?,
    };

    let api_url = workspace_api_url(settings.cloud_env, chosen.account_id, chosen.workspace_id);
    let store = settings.profiles();
    store.save(&chosen.full_handle(), &api_url, key).await?;
    tracing::info!(
        workspace = %chosen.full_handle(),
        path = %store.path().display(),
        "auth: logged in"
    );
    Ok(chosen)
}

/// Pick a workspace without prompting; `None` means the user has to choose.
pub fn select_workspace<'a>(
    workspaces: &'a [Workspace],
    wanted: Option<&str>,
) -> Result<Option<&'a Workspace>> {
    if workspaces.is_empty() {
        bail!("No workspaces found for this API key. Create one at https://app.prefect.cloud");
    }

    let Some(wanted) = wanted else {
        return Ok(match workspaces {
            [only] => Some(only),
            _ => None,
        });
    };

    let found = workspaces.iter().find(|w| {
        w.workspace_id.to_string() == wanted
            || w.workspace_handle == wanted
            || w.full_handle() == wanted
    });
    match found {
        Some(workspace) => Ok(Some(workspace)),
        None => {
            let available: Vec<String> = workspaces.iter().map(Workspace::full_handle).collect();
            bail!(
                "Workspace {:?} not found. Available workspaces: {}",
                wanted,
                available.join(", ")
            )
        }
    }
}

fn prompt_for_key() -> Result<String> {
    if !io::stdin().is_terminal() {
        bail!("No API key given. Pass --key or set PREFECT_API_KEY");
    }
    eprint!("Paste your Prefect Cloud API key: ");
    io::stderr().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let key = line.trim().to_string();
    if key.is_empty() {
        bail!("API key cannot be empty");
    }
    Ok(key)
}

fn prompt_for_workspace(workspaces: &[Workspace]) -> Result<Workspace> {
    if !io::stdin().is_terminal() {
        bail!("Multiple workspaces are available; choose one with --workspace");
    }
    eprintln!("Select a workspace:");
    for (i, workspace) in workspaces.iter().enumerate() {
        eprintln!("  {}. {}", i + 1, workspace.full_handle());
    }
    eprint!("Workspace [1-{}]: ", workspaces.len());
    io::stderr().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let choice: usize = line
        .trim()
        .parse()
        .with_context(|| format!("{:?} is not a number", line.trim()))?;
    choice
        .checked_sub(1)
        .and_then(|i| workspaces.get(i))
        .cloned()
        .ok_or_else(|| anyhow!("no workspace numbered {}", choice))
}

pub async fn logout(settings: &Settings, printer: &Printer) -> Result<()> {
    match settings.profiles().clear_active_credentials().await? {
        Some(profile) => {
            tracing::info!(profile, "auth: credentials removed");
            printer.success("Logged out");
        }
        None => printer.line("Not logged in"),
    }
    Ok(())
}

pub async fn whoami(settings: &Settings, printer: &Printer) -> Result<()> {
    let (urls, api) = cloud_client(settings).await?;
    print_whoami(&api, &urls, printer).await
}

pub async fn print_whoami<C: CloudApi>(api: &C, urls: &CloudUrls, printer: &Printer) -> Result<()> {
    let me = api.me().await.context("failed to read the current user")?;
    let accounts = api.accounts().await.context("failed to list accounts")?;
    let workspaces = api.workspaces().await.context("failed to list workspaces")?;

    let name = format!("{} {}", me.first_name, me.last_name);
    printer.grid(
        "User",
        None,
        vec![
            vec!["Name".into(), name.trim().to_string()],
            vec!["Email".into(), me.email.unwrap_or_default()],
            vec!["Handle".into(), me.handle],
            vec!["ID".into(), me.id.to_string()],
            vec!["Dashboard".into(), urls.ui_url.clone()],
            vec!["API URL".into(), urls.api_url.clone()],
            vec!["API Key".into(), redacted(&urls.api_key)],
        ],
    );
    printer.line("");

    let mut by_account: BTreeMap<Uuid, Vec<&Workspace>> = BTreeMap::new();
    for workspace in &workspaces {
        by_account.entry(workspace.account_id).or_default().push(workspace);
    }

    let mut rows = Vec::new();
    for (i, account) in accounts.iter().enumerate() {
        if i > 0 {
            rows.push(vec![String::new(); 3]);
        }
        rows.push(vec![
            account.account_name.clone(),
            account.account_handle.clone(),
            account.account_id.to_string(),
        ]);
        let owned = by_account.get(&account.account_id).into_iter().flatten();
        for (j, workspace) in owned.enumerate() {
            let lead = if j == 0 && account.account_handle != account.account_name {
                account.account_handle.clone()
            } else {
                String::new()
            };
            rows.push(vec![
                lead,
                workspace.workspace_handle.clone(),
                workspace.workspace_id.to_string(),
            ]);
        }
    }
    printer.grid("Accounts and Workspaces", Some(&["Account", "Handle", "ID"]), rows);
    Ok(())
}

/// Mask an API key for display.
pub fn redacted(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 12 {
        return "********".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}
