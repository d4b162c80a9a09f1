use std::fmt;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use git2::Repository;
use octocrab::Octocrab;
use regex::Regex;
use reqwest::StatusCode;
use serde_json::{Value, json};

use crate::client::CloudApi;
use crate::output::{Printer, link};

pub const APP_INSTALL_URL: &str = "https://github.com/apps/prefect-cloud/installations/new";

static SSH_REMOTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^git@github\.com:(?P<owner>[^/]+)/(?P<repo>[^/]+?)(?:\.git)?/?$").unwrap()
});
static HTTPS_REMOTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:https?://)?(?:www\.)?github\.com/(?P<owner>[^/]+)/(?P<repo>[^/]+?)(?:\.git)?(?:/tree/(?P<ref>.+?))?/?$",
    )
    .unwrap()
});
static SHORT_REPO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<owner>[\w.-]+)/(?P<repo>[\w.-]+?)(?:\.git)?(?:/tree/(?P<ref>.+?))?/?$")
        .unwrap()
});

/// A GitHub repository, optionally pinned to a branch, tag or commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubRepo {
    pub owner: String,
    pub repo: String,
    pub reference: Option<String>,
}

impl GitHubRepo {
    pub fn from_url(url: &str) -> Result<Self> {
        let url = url.trim();
        let caps = SSH_REMOTE
            .captures(url)
            .or_else(|| HTTPS_REMOTE.captures(url))
            .or_else(|| SHORT_REPO.captures(url))
            .ok_or_else(|| {
                anyhow!(
                    "Invalid GitHub repository reference: {}. Expected owner/repo, \
                     github.com/owner/repo or github.com/owner/repo/tree/<ref>",
                    url
                )
            })?;
        Ok(GitHubRepo {
            owner: caps["owner"].to_string(),
            repo: caps["repo"].to_string(),
            reference: caps.name("ref").map(|m| m.as_str().to_string()),
        })
    }

    pub fn clone_url(&self) -> String {
        format!("https://github.com/{}/{}.git", self.owner, self.repo)
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    fn clone_step(&self, access_token: Option<String>) -> Value {
        let mut step = json!({
            "id": "git-clone",
            "repository": self.clone_url(),
        });
        if let Some(reference) = &self.reference {
            step["branch"] = json!(reference);
        }
        if let Some(token) = access_token {
            step["access_token"] = json!(token);
        }
        json!({ "prefect.deployments.steps.git_clone": step })
    }

    pub fn public_repo_pull_steps(&self) -> Vec<Value> {
        vec![self.clone_step(None)]
    }

    pub fn private_repo_via_block_pull_steps(&self, block_name: &str) -> Vec<Value> {
        vec![self.clone_step(Some(format!(
            "{{{{ prefect.blocks.secret.{} }}}}",
            block_name
        )))]
    }

    pub fn private_repo_via_github_app_pull_steps(&self) -> Vec<Value> {
        vec![
            json!({
                "prefect.deployments.steps.run_shell_script": {
                    "id": "get-github-token",
                    "script": format!("uvx prefect-cloud github token {}", self.full_name()),
                }
            }),
            self.clone_step(Some("{{ get-github-token.stdout }}".to_string())),
        ]
    }
}

impl fmt::Display for GitHubRepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "github.com/{}/{}", self.owner, self.repo)?;
        if let Some(reference) = &self.reference {
            write!(f, " @ {}", reference)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefType {
    Blob,
    Tree,
}

/// A single file on GitHub, as given to `git-deploy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubFileRef {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub filepath: String,
    pub ref_type: RefType,
}

impl GitHubFileRef {
    /// Parse `https://github.com/o/r/blob/<branch>/<path>` or `gh/o/r[@branch]/<path>`.
    pub fn from_url(url: &str) -> Result<Self> {
        let url = url.trim();
        if let Some(rest) = url.strip_prefix("gh/") {
            return Self::from_shorthand(url, rest);
        }

        let invalid = || anyhow!("Invalid GitHub URL: {:?}", url);
        let without_scheme = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .ok_or_else(invalid)?;
        let (host, path) = without_scheme.split_once('/').ok_or_else(invalid)?;
        if host != "github.com" {
            return Err(invalid());
        }

        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        if parts.len() < 5 {
            bail!(
                "Invalid GitHub URL: {:?}. Expected format: \
                 https://github.com/owner/repo/blob|tree/branch/path/to/file.py",
                url
            );
        }
        let ref_type = match parts[2] {
            "blob" => RefType::Blob,
            "tree" => RefType::Tree,
            other => bail!(
                "Invalid GitHub URL: {:?}. Reference type {:?} must be 'blob' or 'tree'",
                url,
                other
            ),
        };
        Ok(GitHubFileRef {
            owner: parts[0].to_string(),
            repo: parts[1].to_string(),
            branch: parts[3].to_string(),
            filepath: parts[4..].join("/"),
            ref_type,
        })
    }

    fn from_shorthand(url: &str, rest: &str) -> Result<Self> {
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() < 2 || parts[0].is_empty() || parts[1].is_empty() {
            bail!("Invalid GitHub URL: {:?}. Expected gh/owner/repo[@branch]/path", url);
        }
        let (mut owner, mut repo) = (parts[0].to_string(), parts[1].to_string());
        let mut branch = String::from("main");
        if let Some((o, b)) = parts[0].split_once('@') {
            owner = o.to_string();
            branch = b.to_string();
        } else if let Some((r, b)) = parts[1].split_once('@') {
            repo = r.to_string();
            branch = b.to_string();
        }
        Ok(GitHubFileRef {
            owner,
            repo,
            branch,
            filepath: parts[2..].join("/"),
            ref_type: RefType::Blob,
        })
    }

    pub fn repo(&self) -> GitHubRepo {
        GitHubRepo {
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            reference: Some(self.branch.clone()),
        }
    }
}

impl fmt::Display for GitHubFileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.ref_type {
            RefType::Blob => "blob",
            RefType::Tree => "tree",
        };
        write!(
            f,
            "https://github.com/{}/{}/{}/{}/{}",
            self.owner, self.repo, kind, self.branch, self.filepath
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Where deployable source code is read from.
pub trait CodeSource {
    async fn file_contents(
        &self,
        repo: &GitHubRepo,
        path: &str,
        token: Option<&str>,
    ) -> Result<String, FetchError>;
}

/// Reads files through the GitHub contents API.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitHubSource;

impl CodeSource for GitHubSource {
    async fn file_contents(
        &self,
        repo: &GitHubRepo,
        path: &str,
        token: Option<&str>,
    ) -> Result<String, FetchError> {
        let gh = client(token)?;
        let repos = gh.repos(repo.owner.clone(), repo.repo.clone());
        let mut request = repos.get_content().path(path);
        if let Some(reference) = &repo.reference {
            request = request.r#ref(reference);
        }
        tracing::debug!(repo = %repo, path, authenticated = token.is_some(), "github: fetching file");

        let mut contents = match request.send().await {
            Ok(contents) => contents,
            Err(err) if is_not_found(&err) => {
                return Err(FetchError::FileNotFound(format!("{}/{}", repo, path)));
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to fetch {} from {}", path, repo))
                    .into());
            }
        };

        let items = contents.take_items();
        match items.as_slice() {
            [item] if item.r#type == "file" => item
                .decoded_content()
                .ok_or_else(|| FetchError::FileNotFound(format!("{}/{}", repo, path))),
            _ => Err(FetchError::FileNotFound(format!("{}/{}", repo, path))),
        }
    }
}

/// Build a GitHub client, authenticated when a token is available.
pub fn client(token: Option<&str>) -> Result<Octocrab> {
    let builder = Octocrab::builder();
    let builder = match token {
        Some(token) => builder.personal_token(token.to_string()),
        None => builder,
    };
    builder.build().context("failed to build GitHub client")
}

fn is_not_found(err: &octocrab::Error) -> bool {
    if let octocrab::Error::GitHub { source, .. } = err {
        return source.status_code == StatusCode::NOT_FOUND;
    }
    false
}

/// Guess the `--from` value from the git repository around the working directory.
pub async fn infer_repo_url() -> Result<String> {
    tokio::task::spawn_blocking(|| {
        let repo = Repository::discover(".").context(
            "no --from given and the current directory is not inside a git repository",
        )?;
        let remotes = repo.remotes()?;
        let name = remotes
            .iter()
            .flatten()
            .find(|r| *r == "origin")
            .or_else(|| remotes.iter().flatten().next())
            .ok_or_else(|| anyhow!("no --from given and no git remotes found"))?
            .to_string();
        let remote = repo.find_remote(&name)?;
        let url = remote
            .url()
            .ok_or_else(|| anyhow!("remote {} has no URL", name))?;

        let parsed = GitHubRepo::from_url(url)
            .with_context(|| format!("remote {} is not a GitHub repository: {}", name, url))?;

        let branch = repo
            .head()
            .ok()
            .filter(|head| head.is_branch())
            .and_then(|head| head.shorthand().map(str::to_string));

        let mut inferred = format!("github.com/{}/{}", parsed.owner, parsed.repo);
        if let Some(branch) = branch {
            inferred.push_str("/tree/");
            inferred.push_str(&branch);
        }
        tracing::info!("github: inferred --from {}", inferred);
        Ok::<_, anyhow::Error>(inferred)
    })
    .await
    .map_err(|e| anyhow!("infer_repo_url task join error: {}", e))?
}

/// Point the user at the GitHub App installation page.
pub fn setup(printer: &Printer) {
    printer.line("Install the Prefect Cloud GitHub App on the repositories you want to deploy from:");
    printer.line(format!("  {}", link(APP_INSTALL_URL)));
    printer.line("");
    printer.line("Then check which repositories are connected with `prefect-cloud github ls`.");
}

/// Repositories reachable through the Prefect Cloud GitHub App.
pub async fn repositories<C: CloudApi>(api: &C) -> Result<Vec<String>> {
    let repos = api
        .get_github_repositories()
        .await
        .context("failed to list GitHub repositories")?;
    if repos.is_empty() {
        bail!(
            "No repositories found! Configure the Prefect Cloud GitHub integration \
             with `prefect-cloud github setup`."
        );
    }
    Ok(repos)
}

/// A short-lived installation token for `owner/repo`.
pub async fn installation_token<C: CloudApi>(api: &C, repository: &str) -> Result<String> {
    let repo = GitHubRepo::from_url(repository)?;
    api.get_github_token(&repo.owner, &repo.repo)
        .await
        .context("failed to request a GitHub token")?
        .ok_or_else(|| {
            anyhow!(
                "No GitHub App installation can access {}. Run `prefect-cloud github setup`.",
                repo.full_name()
            )
        })
}
