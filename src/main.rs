use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tracing::info;

use realtime_voice_bridge::config::Config;
use realtime_voice_bridge::functions::FunctionRegistry;
use realtime_voice_bridge::server::{self, App};
use realtime_voice_bridge::stats::{self, Stats};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();

    let config = Config::parse();
    config.validate()?;

    info!(
        listen = config.listen_addr(),
        model = %config.model_id,
        voice = %config.voice,
        local_model = config.use_local_model,
        recording = config.record_calls,
        "🚀 realtime-voice-bridge starting"
    );

    let stats = Stats::new();

    // The registry is sealed before the first bridge is created.
    let registry = Arc::new(builtin_registry());
    info!(tools = registry.schemas().len(), "🔧 function registry ready");

    let stats_clone = stats.clone();
    let stats_interval = config.stats_interval_secs;
    tokio::spawn(async move {
        stats::stats_reporter(stats_clone, stats_interval).await;
    });

    let app = App::new(Arc::new(config), registry, stats);
    let server_handle = server::start_server(app).await?;

    info!("✅ All systems go — waiting for calls");

    server_handle.await?;
    Ok(())
}

/// Call-control tools every deployment gets; domain handlers are registered
/// next to these before startup.
fn builtin_registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();

    registry.register_fn(
        "wrap_up",
        json!({
            "type": "function",
            "name": "wrap_up",
            "description": "Finish the call once every caller request is handled. Say goodbye before calling this.",
            "parameters": {"type": "object", "properties": {}}
        }),
        |_args| async move { Ok(json!({"status": "success", "next_action": "end_call"})) },
    );

    registry.register_fn(
        "transfer_to_human",
        json!({
            "type": "function",
            "name": "transfer_to_human",
            "description": "Hand the caller to a human agent. Tell the caller first.",
            "parameters": {
                "type": "object",
                "properties": {
                    "reason": {"type": "string", "description": "Why the caller needs a human"}
                }
            }
        }),
        |args| async move {
            Ok(json!({
                "status": "success",
                "reason": args.get("reason").cloned().unwrap_or(json!("unspecified")),
            }))
        },
    );

    registry.register_fn(
        "hang_up",
        json!({
            "type": "function",
            "name": "hang_up",
            "description": "End the call immediately, e.g. when the caller asks to stop.",
            "parameters": {"type": "object", "properties": {}}
        }),
        |_args| async move { Ok(json!({"status": "success"})) },
    );

    registry
}
