//! JSONL replay against the scripted runtime

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use lantern_core::channels::Channel;
use lantern_core::runtime::{ScriptedRuntime, ScriptedSession};
use lantern_core::{
    AgentRuntime, Attachment, CoreConfig, PlanDisposition, SessionController, SessionRole,
};

const CONTROL_PREFIX: &str = "lantern.";

/// One script line
#[derive(Debug, Deserialize)]
struct ScriptLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    /// Target session, defaults to the active one
    #[serde(default)]
    session: Option<SessionRole>,
}

#[derive(Debug, PartialEq)]
enum Step {
    Emit {
        session: Option<SessionRole>,
        kind: String,
        data: Value,
    },
    Send {
        text: String,
        attachments: Vec<String>,
    },
    EnterPlan,
    PresentPlan {
        summary: String,
    },
    AcceptPlan,
    RejectPlan,
    ExitPlan {
        accept: bool,
    },
    Abort,
    InvokeTool {
        session: Option<SessionRole>,
        tool_call_id: String,
        name: String,
        arguments: Value,
    },
}

fn parse_line(line: &str) -> Result<Step> {
    let line: ScriptLine = serde_json::from_str(line)?;
    let Some(control) = line.kind.strip_prefix(CONTROL_PREFIX) else {
        return Ok(Step::Emit {
            session: line.session,
            kind: line.kind,
            data: line.data,
        });
    };

    let text = |key: &str| line.data.get(key).and_then(Value::as_str).map(str::to_string);
    let step = match control {
        "send" => Step::Send {
            text: text("text").unwrap_or_default(),
            attachments: line
                .data
                .get("attachments")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        },
        "enter_plan" => Step::EnterPlan,
        "present_plan" => Step::PresentPlan {
            summary: text("summary").unwrap_or_default(),
        },
        "accept_plan" => Step::AcceptPlan,
        "reject_plan" => Step::RejectPlan,
        "exit_plan" => Step::ExitPlan {
            accept: line.data.get("accept").and_then(Value::as_bool).unwrap_or(false),
        },
        "abort" => Step::Abort,
        "invoke_tool" => Step::InvokeTool {
            session: line.session,
            tool_call_id: text("tool_call_id").context("invoke_tool needs tool_call_id")?,
            name: text("name").context("invoke_tool needs name")?,
            arguments: line.data.get("arguments").cloned().unwrap_or(json!({})),
        },
        other => bail!("Unknown control step '{}{}'", CONTROL_PREFIX, other),
    };
    Ok(step)
}

fn forward<T>(channel: &Channel<T>, out: mpsc::UnboundedSender<String>) -> Result<JoinHandle<()>>
where
    T: Serialize + Send + 'static,
{
    let name = channel.name();
    let mut rx = channel.subscribe()?;
    Ok(tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let line = json!({ "channel": name, "event": event }).to_string();
            if out.send(line).is_err() {
                break;
            }
        }
    }))
}

pub async fn run(
    config: CoreConfig,
    script: &Path,
    resume: Option<&str>,
    settle_ms: u64,
) -> Result<()> {
    let content = tokio::fs::read_to_string(script)
        .await
        .with_context(|| format!("Failed to read script: {}", script.display()))?;
    let steps = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .map(|(n, line)| parse_line(line).with_context(|| format!("line {}", n + 1)))
        .collect::<Result<Vec<_>>>()?;

    let runtime = Arc::new(ScriptedRuntime::new());
    if let Some(id) = resume {
        runtime.allow_resume(id);
    }
    let controller = SessionController::new(
        Arc::clone(&runtime) as Arc<dyn AgentRuntime>,
        config,
    )?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let channels = controller.channels();
    let forwarders = vec![
        forward(&channels.output, out_tx.clone())?,
        forward(&channels.reasoning, out_tx.clone())?,
        forward(&channels.error, out_tx.clone())?,
        forward(&channels.status, out_tx.clone())?,
        forward(&channels.tool_start, out_tx.clone())?,
        forward(&channels.tool_update, out_tx.clone())?,
        forward(&channels.tool_complete, out_tx.clone())?,
        forward(&channels.file_changed, out_tx.clone())?,
        forward(&channels.diff_available, out_tx.clone())?,
        forward(&channels.usage, out_tx.clone())?,
    ];
    drop(out_tx);

    let printer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            println!("{}", line);
        }
    });

    controller.start(resume).await?;
    for step in steps {
        apply(&controller, &runtime, step).await?;
    }

    tokio::time::sleep(Duration::from_millis(settle_ms)).await;
    controller.dispose().await;
    for forwarder in forwarders {
        forwarder.abort();
    }
    printer.await.context("Output printer failed")?;

    tracing::info!("Replay finished");
    Ok(())
}

async fn target(
    controller: &SessionController,
    runtime: &ScriptedRuntime,
    role: Option<SessionRole>,
) -> Result<Arc<ScriptedSession>> {
    let info = match role {
        None => controller.active_session().await,
        Some(SessionRole::Work) => controller.work_session().await,
        Some(SessionRole::Plan) => controller.plan_session().await,
    };
    let info = info.context("No session to target")?;
    runtime
        .session(&info.id)
        .with_context(|| format!("Session {} is not scripted", info.id))
}

/// Controller failures are already on the error channel; the replay goes on.
async fn apply(
    controller: &SessionController,
    runtime: &ScriptedRuntime,
    step: Step,
) -> Result<()> {
    let outcome = match step {
        Step::Emit {
            session,
            kind,
            data,
        } => {
            target(controller, runtime, session).await?.emit(&kind, data);
            Ok(())
        }
        Step::Send { text, attachments } => {
            let attachments = attachments.into_iter().map(Attachment::file).collect();
            controller.send_message(&text, attachments).await
        }
        Step::EnterPlan => controller.enter_plan_mode().await.map(|_| ()),
        Step::PresentPlan { summary } => controller.present_plan(&summary).await,
        Step::AcceptPlan => controller.accept_plan().await,
        Step::RejectPlan => controller.reject_plan().await,
        Step::ExitPlan { accept } => {
            let disposition = if accept {
                PlanDisposition::Accept
            } else {
                PlanDisposition::Reject
            };
            controller.exit_plan_mode(disposition).await
        }
        Step::Abort => controller.abort().await,
        Step::InvokeTool {
            session,
            tool_call_id,
            name,
            arguments,
        } => {
            let session = target(controller, runtime, session).await?;
            if session.invoke_tool(&tool_call_id, &name, arguments).await.is_none() {
                tracing::warn!(tool = %name, "Tool is not registered on the session");
            }
            Ok(())
        }
    };

    if let Err(e) = outcome {
        tracing::warn!("Replay step failed: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_events_pass_through() {
        let step = parse_line(
            r#"{"type": "assistant.message_delta", "data": {"delta_content": "hi"}, "session": "plan"}"#,
        )
        .unwrap();
        assert_eq!(
            step,
            Step::Emit {
                session: Some(SessionRole::Plan),
                kind: "assistant.message_delta".into(),
                data: json!({"delta_content": "hi"}),
            }
        );
    }

    #[test]
    fn control_steps_parse() {
        assert_eq!(
            parse_line(r#"{"type": "lantern.present_plan", "data": {"summary": "add logging"}}"#)
                .unwrap(),
            Step::PresentPlan {
                summary: "add logging".into()
            }
        );
        assert_eq!(
            parse_line(r#"{"type": "lantern.exit_plan", "data": {"accept": true}}"#).unwrap(),
            Step::ExitPlan { accept: true }
        );
        assert_eq!(
            parse_line(r#"{"type": "lantern.enter_plan"}"#).unwrap(),
            Step::EnterPlan
        );
    }

    #[test]
    fn invalid_control_steps_are_rejected() {
        assert!(parse_line(r#"{"type": "lantern.teleport"}"#).is_err());
        assert!(parse_line(r#"{"type": "lantern.invoke_tool", "data": {"name": "x"}}"#).is_err());
        assert!(parse_line("not json").is_err());
    }
}
