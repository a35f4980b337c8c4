//! Drives ops into the orchestrator and drains the resulting events to
//! stdout, in either single-prompt or interactive-REPL mode.

use std::io::Write;
use std::sync::Arc;

use tokio::sync::mpsc;

use turnloop_core::{new_id, now_ts_ms, Event, Op, OpKind};
use turnloop_events::EventFilter;

use crate::bootstrap::CliContext;
use crate::output::print_event;

/// Subscribes a channel scoped to this op's session, hands `op` to the
/// orchestrator, then drains and prints whatever events it produced.
/// `handle()` awaits every `emit()` call before returning, so the full
/// event sequence for this op is already queued by the time it returns.
async fn dispatch(ctx: &mut CliContext, json: bool, op: Op) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let filter = EventFilter { session_id: Some(ctx.orchestrator.session_id.clone()), ..Default::default() };
    let event_bus = Arc::clone(&ctx.event_bus);
    let sub_id = event_bus.subscribe(
        filter,
        Box::new(move |event: &Event| {
            let _ = tx.send(event.clone());
        }),
    );

    let result = ctx.orchestrator.handle(op, None, None).await;
    event_bus.unsubscribe(sub_id);

    while let Ok(event) = rx.try_recv() {
        print_event(&event, json);
    }
    std::io::stdout().flush().ok();
    result.map_err(anyhow::Error::from)
}

pub async fn execute_once(ctx: &mut CliContext, text: &str, json: bool) -> anyhow::Result<()> {
    let session_id = ctx.orchestrator.session_id.clone();
    dispatch(ctx, json, chat_op(&session_id, text)).await
}

pub async fn run_repl(ctx: &mut CliContext, json: bool) -> anyhow::Result<()> {
    eprintln!("turnloop session {} (Ctrl-D to exit)", ctx.orchestrator.session_id);
    let stdin = std::io::stdin();
    loop {
        eprint!("> ");
        std::io::stderr().flush().ok();
        let mut line = String::new();
        let n = stdin.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let session_id = ctx.orchestrator.session_id.clone();
        if let Some(rest) = line.strip_prefix("/approve ") {
            dispatch(ctx, json, approval_op(&session_id, rest.trim(), "approve")).await?;
        } else if let Some(rest) = line.strip_prefix("/deny ") {
            dispatch(ctx, json, approval_op(&session_id, rest.trim(), "deny")).await?;
        } else if line == "/quit" || line == "/exit" {
            break;
        } else {
            dispatch(ctx, json, chat_op(&session_id, line)).await?;
        }
    }
    Ok(())
}

fn chat_op(session_id: &str, text: &str) -> Op {
    Op {
        kind: OpKind::Chat,
        payload: serde_json::json!({"text": text}),
        session_id: session_id.to_string(),
        request_id: new_id("req"),
        timestamp: now_ts_ms(),
        turn_id: None,
        mode: None,
        schema_version: None,
    }
}

fn approval_op(session_id: &str, arg: &str, decision: &str) -> Op {
    let mut parts = arg.splitn(2, ' ');
    let approval_id = parts.next().unwrap_or("").to_string();
    let note = parts.next().map(str::to_string);
    Op {
        kind: OpKind::ApprovalDecision,
        payload: serde_json::json!({"approval_id": approval_id, "decision": decision, "note": note}),
        session_id: session_id.to_string(),
        request_id: new_id("req"),
        timestamp: now_ts_ms(),
        turn_id: None,
        mode: None,
        schema_version: None,
    }
}
