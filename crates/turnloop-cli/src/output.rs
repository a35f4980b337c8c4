//! Renders bus events to stdout/stderr, either as JSON lines or a short
//! human-readable line per event, mirroring the teacher's `--json`
//! output-mode split.

use turnloop_core::{Event, EventKind};

pub fn print_event(event: &Event, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
        }
        return;
    }

    match event.kind {
        EventKind::LlmResponseDelta => {
            if let Some(text) = event.payload.get("text").and_then(|v| v.as_str()) {
                print!("{text}");
                use std::io::Write;
                let _ = std::io::stdout().flush();
            }
        }
        EventKind::LlmResponseCompleted => println!(),
        EventKind::ApprovalRequired => {
            let approval_id = event.payload.get("approval_id").and_then(|v| v.as_str()).unwrap_or("?");
            let summary = event.payload.get("action_summary").and_then(|v| v.as_str()).unwrap_or("");
            let risk = event.payload.get("risk_level").and_then(|v| v.as_str()).unwrap_or("?");
            eprintln!("\n[approval required] {approval_id} ({risk}): {summary}");
            eprintln!("  run: /approve {approval_id}   or   /deny {approval_id}");
        }
        EventKind::ApprovalGranted => eprintln!("[approval granted]"),
        EventKind::ApprovalDenied => eprintln!("[approval denied]"),
        EventKind::ToolCallStart => {
            let summary = event.payload.get("summary").and_then(|v| v.as_str()).unwrap_or("");
            eprintln!("[tool] {summary}");
        }
        EventKind::ToolCallEnd => {
            let status = event.payload.get("status").and_then(|v| v.as_str()).unwrap_or("?");
            let tool = event.payload.get("tool_name").and_then(|v| v.as_str()).unwrap_or("?");
            eprintln!("[tool] {tool}: {status}");
        }
        EventKind::OperationFailed => {
            let error = event.payload.get("error").and_then(|v| v.as_str()).unwrap_or("");
            eprintln!("[error] {error}");
        }
        EventKind::OperationCancelled => eprintln!("[cancelled]"),
        EventKind::ModelResolutionFailed => {
            let error = event.payload.get("error").and_then(|v| v.as_str()).unwrap_or("");
            eprintln!("[model resolution failed] {error}");
        }
        _ => {}
    }
}
