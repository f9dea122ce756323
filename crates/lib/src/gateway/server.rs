//! Gateway runtime (single port for health).
//!
//! Channel connectors push [`ChannelEvent`]s into one mpsc queue; the dispatcher task
//! spawns an independent pipeline run per message.

use crate::channels::{ChannelClient, ChannelEvent, DiscordChannel};
use crate::config::{self, Config, DispatchConfig};
use crate::dispatch::{DispatchPipeline, SingleFlightGuard};
use crate::exec::ProcessExecutor;
use crate::task::ExternalTaskRunner;
use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

const EVENT_QUEUE_CAPACITY: usize = 64;

/// Shared state for the gateway (config, in-flight guard, active pipeline).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// In-flight message ids; survives pipeline rebuilds.
    pub guard: Arc<SingleFlightGuard>,
    /// Pipeline for the current handling identity. None until a connector reports ready.
    pub pipeline: Arc<RwLock<Option<Arc<DispatchPipeline>>>>,
    /// In-process channel connector tasks; awaited during graceful shutdown.
    pub channel_tasks: Arc<RwLock<Vec<JoinHandle<()>>>>,
}

impl GatewayState {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            guard: Arc::new(SingleFlightGuard::new()),
            pipeline: Arc::new(RwLock::new(None)),
            channel_tasks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register an in-process channel task to be awaited during graceful shutdown.
    pub async fn register_channel_task(&self, handle: JoinHandle<()>) {
        self.channel_tasks.write().await.push(handle);
    }
}

/// Build a pipeline for `self_id` from the dispatch section of `config`.
pub fn build_pipeline(
    config: &Config,
    self_id: &str,
    guard: Arc<SingleFlightGuard>,
    runner: ExternalTaskRunner,
    channel: Arc<dyn ChannelClient>,
) -> DispatchPipeline {
    DispatchPipeline::new(
        DispatchConfig::from(&config.dispatch),
        self_id,
        guard,
        runner,
        channel,
    )
}

/// Consume channel events: install a pipeline on `Ready`, spawn one run per `Message`.
/// Messages that arrive before the first `Ready` are dropped.
pub fn spawn_dispatcher(
    state: GatewayState,
    channel: Arc<dyn ChannelClient>,
    runner: ExternalTaskRunner,
    mut events_rx: mpsc::Receiver<ChannelEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                ChannelEvent::Ready { self_id } => {
                    let mut slot = state.pipeline.write().await;
                    if slot.as_ref().map(|p| p.self_id()) == Some(self_id.as_str()) {
                        log::debug!("gateway: {} ready again, keeping pipeline", channel.id());
                        continue;
                    }
                    log::info!("gateway: {} ready as {}", channel.id(), self_id);
                    *slot = Some(Arc::new(build_pipeline(
                        &state.config,
                        &self_id,
                        state.guard.clone(),
                        runner.clone(),
                        channel.clone(),
                    )));
                }
                ChannelEvent::Message(msg) => {
                    let pipeline = state.pipeline.read().await.clone();
                    let Some(pipeline) = pipeline else {
                        log::debug!("gateway: dropping {} received before ready", msg.id);
                        continue;
                    };
                    tokio::spawn(async move {
                        pipeline.handle(msg).await;
                    });
                }
            }
        }
        log::debug!("gateway: event queue closed, dispatcher stopped");
    })
}

/// Run the gateway: start the Discord connector (when a token is configured), dispatch
/// its messages, and serve health on config.gateway.bind:config.gateway.port.
/// Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_gateway(config: Config) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    let port = config.gateway.port;
    let discord_token = config::resolve_discord_token(&config);
    let runner = ExternalTaskRunner::new(Arc::new(ProcessExecutor::from_config(&config.task)));
    log::info!(
        "task command: {} {}",
        config.task.command,
        config.task.args.join(" ")
    );
    if config.dispatch.test_mode {
        log::warn!(
            "test mode on: automated caller {} accepted",
            config
                .dispatch
                .designated_test_caller_id
                .as_deref()
                .unwrap_or("(none)")
        );
    }

    let state = GatewayState::new(config);
    let discord = if let Some(token) = discord_token {
        let (events_tx, events_rx) = mpsc::channel::<ChannelEvent>(EVENT_QUEUE_CAPACITY);
        let discord = Arc::new(DiscordChannel::new(
            Some(token),
            state.config.channels.discord.api_base.clone(),
        ));
        let dispatcher = spawn_dispatcher(state.clone(), discord.clone(), runner, events_rx);
        let connector = discord.clone().start_inbound(events_tx);
        state.register_channel_task(connector).await;
        state.register_channel_task(dispatcher).await;
        log::info!("discord channel registered and gateway session loop started");
        Some(discord)
    } else {
        log::warn!("no discord bot token configured (channels.discord.botToken or DISCORD_BOT_TOKEN); serving health only");
        None
    };

    let channel_tasks = state.channel_tasks.clone();
    let app = Router::new()
        .route("/", get(health_http))
        .with_state(state);

    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(discord, channel_tasks))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Stops the channel connector, then awaits in-process channel tasks.
async fn shutdown_signal(
    discord: Option<Arc<DiscordChannel>>,
    channel_tasks: Arc<RwLock<Vec<JoinHandle<()>>>>,
) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, stopping channels");

    // Dropping the connector's sender ends the dispatcher once the connector stops.
    if let Some(d) = discord {
        d.stop();
    }

    let handles = {
        let mut g = channel_tasks.write().await;
        std::mem::take(&mut *g)
    };
    for h in handles {
        let _ = h.await;
    }
    log::info!("channel tasks finished");
}

/// GET /: liveness plus dispatch status.
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let pipeline = state.pipeline.read().await;
    Json(json!({
        "runtime": "running",
        "port": state.config.gateway.port,
        "ready": pipeline.is_some(),
        "selfId": pipeline.as_ref().map(|p| p.self_id().to_string()),
        "inFlight": state.guard.in_flight_count(),
        "testMode": state.config.dispatch.test_mode,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelError, HistoryMessage, InboundMessage};
    use crate::task::{RunningTask, TaskCompletion, TaskError, TaskExecutor};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collecting {
        replies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelClient for Collecting {
        fn id(&self) -> &str {
            "collecting"
        }

        async fn send(&self, _channel_id: &str, _text: &str) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn reply(&self, _c: &str, message_id: &str, _text: &str) -> Result<(), ChannelError> {
            self.replies.lock().unwrap().push(message_id.to_string());
            Ok(())
        }

        async fn fetch_history(
            &self,
            _channel_id: &str,
            _before_id: Option<&str>,
            _limit: usize,
        ) -> Result<Vec<HistoryMessage>, ChannelError> {
            Ok(Vec::new())
        }
    }

    struct Echo;

    struct Done(String);

    #[async_trait]
    impl RunningTask for Done {
        async fn wait(&mut self) -> Result<TaskCompletion, TaskError> {
            Ok(TaskCompletion {
                succeeded: true,
                exit_reason: "exit status: 0".to_string(),
                stdout: self.0.clone(),
                stderr: String::new(),
            })
        }

        fn terminate(&mut self) {}
    }

    #[async_trait]
    impl TaskExecutor for Echo {
        async fn start(&self, prompt: &str) -> Result<Box<dyn RunningTask>, TaskError> {
            Ok(Box::new(Done(prompt.to_string())))
        }
    }

    fn mention(id: &str, self_id: &str) -> ChannelEvent {
        ChannelEvent::Message(InboundMessage {
            id: id.to_string(),
            channel_id: "c1".to_string(),
            author_id: "u1".to_string(),
            author_name: "alice".to_string(),
            author_is_automated: false,
            text: "hello".to_string(),
            mentioned_user_ids: HashSet::from([self_id.to_string()]),
            created_at: "2024-05-01T12:00:00Z".to_string(),
        })
    }

    #[tokio::test]
    async fn messages_before_ready_are_dropped() {
        let state = GatewayState::new(Config::default());
        let channel = Arc::new(Collecting::default());
        let (tx, rx) = mpsc::channel(8);
        let dispatcher = spawn_dispatcher(
            state.clone(),
            channel.clone(),
            ExternalTaskRunner::new(Arc::new(Echo)),
            rx,
        );

        tx.send(mention("early", "100")).await.unwrap();
        tx.send(ChannelEvent::Ready {
            self_id: "100".to_string(),
        })
        .await
        .unwrap();
        tx.send(mention("late", "100")).await.unwrap();
        drop(tx);
        dispatcher.await.unwrap();

        for _ in 0..200 {
            if !channel.replies.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*channel.replies.lock().unwrap(), vec!["late".to_string()]);
        let pipeline = state.pipeline.read().await;
        assert_eq!(pipeline.as_ref().map(|p| p.self_id()), Some("100"));
    }

    async fn dispatch_all(state: &GatewayState, events: Vec<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let dispatcher = spawn_dispatcher(
            state.clone(),
            Arc::new(Collecting::default()),
            ExternalTaskRunner::new(Arc::new(Echo)),
            rx,
        );
        for event in events {
            tx.send(event).await.unwrap();
        }
        drop(tx);
        dispatcher.await.unwrap();
    }

    fn ready(id: &str) -> ChannelEvent {
        ChannelEvent::Ready {
            self_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn pipeline_is_rebuilt_only_when_identity_changes() {
        let state = GatewayState::new(Config::default());
        dispatch_all(&state, vec![ready("100")]).await;
        let first = state.pipeline.read().await.clone().unwrap();

        dispatch_all(&state, vec![ready("100")]).await;
        let again = state.pipeline.read().await.clone().unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        dispatch_all(&state, vec![ready("101")]).await;
        let changed = state.pipeline.read().await.clone().unwrap();
        assert!(!Arc::ptr_eq(&first, &changed));
        assert_eq!(changed.self_id(), "101");
        assert!(Arc::ptr_eq(changed.guard(), &state.guard));
    }
}
