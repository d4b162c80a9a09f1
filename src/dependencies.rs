use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct PyProject {
    project: Option<PyProjectTable>,
}

#[derive(Debug, Deserialize)]
struct PyProjectTable {
    #[serde(default)]
    dependencies: Vec<String>,
}

/// Expand `--with` values into requirement strings.
///
/// A value naming a `requirements*.txt` or `pyproject.toml` (relative to
/// `base_dir`) contributes the requirements listed in that file, which must
/// exist. Anything else is taken as a requirement itself.
pub async fn expand_dependencies(values: &[String], base_dir: &Path) -> Result<Vec<String>> {
    let mut deps: Vec<String> = Vec::new();
    for value in values {
        let path = base_dir.join(value);
        let expanded = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if name == "pyproject.toml" || is_requirements_file(name) => {
                if !path.is_file() {
                    bail!("Dependency file {} not found", path.display());
                }
                if name == "pyproject.toml" {
                    read_pyproject(&path).await?
                } else {
                    read_requirements(&path).await?
                }
            }
            _ => vec![value.trim().to_string()],
        };
        for dep in expanded {
            if !dep.is_empty() && !deps.contains(&dep) {
                deps.push(dep);
            }
        }
    }
    Ok(deps)
}

fn is_requirements_file(name: &str) -> bool {
    name.starts_with("requirements") && name.ends_with(".txt")
}

async fn read_requirements(path: &Path) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(content
        .lines()
        .map(|line| line.split(" #").next().unwrap_or(line).trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('-'))
        .map(str::to_string)
        .collect())
}

async fn read_pyproject(path: &Path) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: PyProject = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(parsed
        .project
        .map(|p| p.dependencies)
        .unwrap_or_default())
}

/// Shell command installing `deps` with uv, each requirement single-quoted.
pub fn install_script(deps: &[String]) -> String {
    let quoted: Vec<String> = deps
        .iter()
        .map(|d| format!("'{}'", d.replace('\'', r"'\''")))
        .collect();
    format!("uv pip install {}", quoted.join(" "))
}

pub fn requirements_script(path: &str) -> String {
    format!("uv pip install -r {}", path)
}
