use std::sync::Arc;

use crewlink::config::{AgentRole, RuntimeConfig};
use crewlink::executor::ShellExecutor;
use crewlink::runtime::AgentRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RuntimeConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export CREWLINK_NAS_ROOT=/mnt/nas");
        eprintln!("  export CREWLINK_AGENT_ID=codey");
        eprintln!("  export CREWLINK_ROLE=worker          # or orchestrator");
        std::process::exit(1);
    });

    // Initialize tracing; with CREWLINK_LOG_DIR set, logs go to a daily
    // rolling file instead of stderr.
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "crewlink.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    eprintln!("🔗 Crewlink v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agent: {} ({})", config.agent_id, config.role.as_str());
    eprintln!("   NAS root: {}", config.nas_root.display());
    eprintln!(
        "   Poll: {}ms, heartbeat: {}ms, park sweep: {}ms",
        config.poll_interval.as_millis(),
        config.heartbeat_interval.as_millis(),
        config.park_interval.as_millis()
    );
    if config.role == AgentRole::Orchestrator {
        eprintln!(
            "   Monitor: every {}ms (ack timeout {}ms, task timeout {}ms, {} retries)",
            config.monitor_interval.as_millis(),
            config.ack_timeout.as_millis(),
            config.task_timeout.as_millis(),
            config.max_retries
        );
    }
    if let Some(dir) = &config.log_dir {
        eprintln!("   Log: {}/crewlink.log (daily rolling)", dir.display());
    }
    eprintln!();

    let runtime = AgentRuntime::new(config, Arc::new(ShellExecutor::new()));
    runtime.run().await?;

    Ok(())
}
