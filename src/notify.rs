use std::collections::BTreeSet;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::client::CloudApi;
use crate::deployments;
use crate::schemas::Deployment;

const EMAIL_BODY: &str = "Flow run {{ flow.name }}/{{ flow_run.name }} observed in state `{{ flow_run.state.name }}` at {{ flow_run.state.timestamp }}.\n\
Flow ID: {{ flow_run.flow_id }}\n\
Flow run ID: {{ flow_run.id }}\n\
Flow run URL: {{ flow_run|ui_url }}\n\
State message: {{ flow_run.state.message }}";

/// Send failure e-mails for a deployment's flow runs, returning the automation id.
pub async fn notify<C: CloudApi>(
    api: &C,
    raw: &str,
    emails: &[String],
    exclude_me: bool,
) -> Result<Uuid> {
    let mut recipients: BTreeSet<String> = emails
        .iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect();
    if !exclude_me {
        let me = api.me().await.context("failed to read the current user")?;
        if let Some(email) = me.email.filter(|e| !e.is_empty()) {
            recipients.insert(email);
        }
    }
    if recipients.is_empty() {
        bail!("One or more email addresses are required to configure notifications");
    }

    let deployment = deployments::get_deployment(api, raw).await?;
    let recipients: Vec<String> = recipients.into_iter().collect();
    let automation = failure_automation(&deployment, &recipients);
    let id = api
        .create_automation(&automation)
        .await
        .context("failed to create automation")?;
    tracing::info!(automation = %id, deployment = %deployment.id, "notify: automation created");
    Ok(id)
}

pub fn failure_automation(deployment: &Deployment, emails: &[String]) -> Value {
    json!({
        "name": title_case(&format!("{} Failed", deployment.name)),
        "trigger": {
            "type": "event",
            "match": {"prefect.resource.id": "prefect.flow-run.*"},
            "match_related": {
                "prefect.resource.role": "deployment",
                "prefect.resource.id": [format!("prefect.deployment.{}", deployment.id)],
            },
            "after": [],
            "expect": [
                "prefect.flow-run.Crashed",
                "prefect.flow-run.Failed",
                "prefect.flow-run.TimedOut",
            ],
            "for_each": ["prefect.resource.id"],
            "posture": "Reactive",
            "threshold": 1,
            "within": 0,
        },
        "actions": [{
            "type": "send-email-notification",
            "subject": "{{ deployment.name}} failed",
            "body": EMAIL_BODY,
            "emails": emails,
        }],
    })
}

/// Capitalise the first letter of every alphabetic run and lowercase the rest.
fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_word = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeCloud};

    #[test]
    fn titles() {
        assert_eq!(title_case("my_flow-run Failed"), "My_Flow-Run Failed");
        assert_eq!(title_case("ETL nightly2x Failed"), "Etl Nightly2X Failed");
    }

    #[tokio::test]
    async fn includes_caller_and_deduplicates() {
        let api = FakeCloud::default();
        api.state().me_email = Some("me@example.com".into());
        let deployment = api.add_deployment("etl", "nightly run", vec![]);

        let emails = vec![
            "ops@example.com".to_string(),
            "me@example.com".to_string(),
            "ops@example.com".to_string(),
        ];
        notify(&api, "etl/nightly run", &emails, false).await.unwrap();

        let calls = api.calls();
        let [Call::CreateAutomation(body)] = calls.as_slice() else {
            panic!("unexpected calls: {calls:?}");
        };
        assert_eq!(body["name"], "Nightly Run Failed");
        assert_eq!(
            body["actions"][0]["emails"],
            json!(["me@example.com", "ops@example.com"])
        );
        assert_eq!(
            body["trigger"]["match_related"]["prefect.resource.id"][0],
            format!("prefect.deployment.{}", deployment.id)
        );
    }

    #[tokio::test]
    async fn requires_at_least_one_address() {
        let api = FakeCloud::default();
        api.state().me_email = Some("me@example.com".into());
        api.add_deployment("etl", "nightly", vec![]);

        let err = notify(&api, "etl/nightly", &[], true).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "One or more email addresses are required to configure notifications"
        );
        assert!(api.calls().is_empty());
    }
}
