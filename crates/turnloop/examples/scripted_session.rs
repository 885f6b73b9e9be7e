//! Scripted Session Example - tool loop without a provider
//!
//! A scripted engine asks for the `echo` tool once, then answers. Events are
//! printed as they stream through a channel sink; runtime settings come from
//! `TURNLOOP_*` environment variables (or a `.env` file).
//!
//! Run with: cargo run -p turnloop --example scripted_session

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use turnloop::engine::middleware::{SystemPromptMiddleware, TurnLoggingMiddleware};
use turnloop::events::{ChannelSink, Event};
use turnloop::tools::builtin::echo_tool;
use turnloop::{
    telemetry, Block, Engine, EventSink, FnEngine, Middleware, RunContext, RuntimeConfig,
    Session, ToolLoopEngineBuilder, ToolRegistry, Turn,
};

fn scripted_engine() -> Arc<dyn Engine> {
    let calls = Arc::new(AtomicUsize::new(0));
    Arc::new(FnEngine::new(move |ctx: RunContext, mut turn: Turn| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            let meta = ctx.event_metadata();
            ctx.publish(&Event::start(meta.clone())).await;
            if n == 0 {
                turn.append_block(Block::tool_call(
                    "call_1",
                    "echo",
                    json!({"message": "hello from the tool loop"}),
                ));
            } else {
                let answer = "The tool echoed the message back.";
                ctx.publish(&Event::partial(meta.clone(), answer, answer)).await;
                ctx.publish(&Event::final_text(meta, answer)).await;
                turn.append_block(Block::llm_text(answer));
            }
            Ok(turn)
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = RuntimeConfig::from_env()?;
    telemetry::init_tracing(&config.log_filter);

    let registry = Arc::new(ToolRegistry::builder().tool(echo_tool()).build()?);
    let (sink, mut events) = ChannelSink::new(64);
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let json = event.to_json()?;
            println!("event: {}", String::from_utf8_lossy(&json));
        }
        anyhow::Ok(())
    });

    let builder = ToolLoopEngineBuilder::new(scripted_engine())
        .with_middlewares([
            Arc::new(TurnLoggingMiddleware::new()) as Arc<dyn Middleware>,
            Arc::new(SystemPromptMiddleware::new("You are a terse assistant.")) as Arc<dyn Middleware>,
        ])
        .with_registry(registry)
        .with_tool_config(config.tool_config())
        .with_pause_timeout(config.step_pause_timeout)
        .with_event_sink(Arc::new(sink) as Arc<dyn EventSink>);

    let session = Session::new().with_builder(Arc::new(builder));
    session.append_new_turn_from_user_prompt("Please echo something.")?;

    let handle = session.start_inference(&RunContext::new()).await?;
    let turn = handle.wait().await?;

    // Dropping the session releases the builder and with it the last sender
    drop(session);
    printer.await??;

    println!("\n{}", turn.to_yaml()?);
    Ok(())
}
