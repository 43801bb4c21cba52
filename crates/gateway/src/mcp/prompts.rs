//! Prompt templates — pure string expansions that produce MCP messages.
//!
//! Prompts never invoke tools; they hand the client a worked instruction
//! sequence referencing the tools by name.

use serde_json::{json, Value};

use fg_domain::{Error, Result};
use fg_mcp::{PromptArgument, PromptDef, PromptGetParams, PromptMessage, ToolContent};

fn catalog() -> Vec<PromptDef> {
    vec![
        PromptDef {
            name: "change_dns_workflow".into(),
            description: "Guided DNS change: dry run, review the diff, apply, verify.".into(),
            arguments: vec![
                PromptArgument {
                    name: "device".into(),
                    description: "Target device name".into(),
                    required: true,
                },
                PromptArgument {
                    name: "servers".into(),
                    description: "Comma-separated DNS servers".into(),
                    required: true,
                },
            ],
        },
        PromptDef {
            name: "incident_triage".into(),
            description: "Triage an unhealthy device: connectivity, resources, recent changes."
                .into(),
            arguments: vec![PromptArgument {
                name: "device".into(),
                description: "Device showing problems".into(),
                required: true,
            }],
        },
    ]
}

pub fn list() -> Result<Value> {
    Ok(json!({ "prompts": catalog() }))
}

pub fn get(params: PromptGetParams) -> Result<Value> {
    let arg = |key: &str| -> Result<String> {
        params
            .arguments
            .get(key)
            .cloned()
            .ok_or_else(|| Error::InvalidParams(format!("missing prompt argument '{key}'")))
    };

    let (description, text) = match params.name.as_str() {
        "change_dns_workflow" => {
            let device = arg("device")?;
            let servers = arg("servers")?;
            (
                "Guided DNS change with dry run and verification".to_string(),
                format!(
                    "Change DNS servers on device {device} to {servers}, safely:\n\
                     1. Call `dns_get` on {device} and note the current servers.\n\
                     2. Call `dns_set_servers` with servers=[{servers}] and dry_run=true; review the diff and risk level.\n\
                     3. If the diff matches the intent, call `dns_set_servers` again with dry_run=false.\n\
                     4. Verify with `dns_get` that {device} now resolves via {servers}.\n\
                     5. If anything looks wrong, report the plan id and per-device breakdown from step 3."
                ),
            )
        }
        "incident_triage" => {
            let device = arg("device")?;
            (
                "Structured triage for an unhealthy device".to_string(),
                format!(
                    "Device {device} is reported unhealthy. Triage it:\n\
                     1. Call `connectivity_check` on {device}; if unreachable, follow the remediation suggestions it returns.\n\
                     2. Call `device_health` and compare cpu/memory/temperature against their recent history.\n\
                     3. Read resource `audit://{device}` to see recent writes that may correlate.\n\
                     4. Summarize the probable cause and whether a rollback or an operator escalation is warranted."
                ),
            )
        }
        other => return Err(Error::MethodNotFound(format!("prompt '{other}'"))),
    };

    let result = json!({
        "description": description,
        "messages": [PromptMessage {
            role: "user".into(),
            content: ToolContent::text(text),
        }],
    });
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn list_names() {
        let value = list().unwrap();
        let names: Vec<&str> = value["prompts"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["change_dns_workflow", "incident_triage"]);
    }

    #[test]
    fn dns_prompt_expands_arguments() {
        let mut arguments = HashMap::new();
        arguments.insert("device".to_string(), "r1".to_string());
        arguments.insert("servers".to_string(), "1.1.1.1".to_string());
        let value = get(PromptGetParams {
            name: "change_dns_workflow".into(),
            arguments,
        })
        .unwrap();
        let text = value["messages"][0]["content"]["text"].as_str().unwrap();
        assert!(text.contains("r1"));
        assert!(text.contains("1.1.1.1"));
        assert!(text.contains("dry_run=true"));
    }

    #[test]
    fn missing_argument_is_invalid_params() {
        let err = get(PromptGetParams {
            name: "incident_triage".into(),
            arguments: HashMap::new(),
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
    }

    #[test]
    fn unknown_prompt_not_found() {
        let err = get(PromptGetParams {
            name: "bogus".into(),
            arguments: HashMap::new(),
        })
        .unwrap_err();
        assert!(matches!(err, Error::MethodNotFound(_)));
    }
}
