//! Dispatch pipeline: classify → guard → context → prompt → task → chunk → deliver.
//!
//! One `handle` call per inbound message. Runs for different message ids may overlap;
//! the in-flight guard is the only state they share.

use std::sync::Arc;

use crate::channels::{ChannelClient, InboundMessage};
use crate::config::DispatchConfig;
use crate::dispatch::chunker::chunk_text;
use crate::dispatch::classifier::MessageClassifier;
use crate::dispatch::context::{build_prompt, ContextAssembler};
use crate::dispatch::delivery::DeliveryScheduler;
use crate::dispatch::error::DispatchError;
use crate::dispatch::guard::SingleFlightGuard;
use crate::task::{ExternalTaskRunner, FailureReason, TaskOutcome};

/// Stage a run failed in. Earlier stages only skip, they never fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Invoking,
    Chunking,
    Delivering,
}

/// How a run ended.
#[derive(Debug)]
pub enum DispatchReport {
    /// Not for us (own message, no mention, disallowed automated author).
    Skipped,
    /// Same message id already in flight.
    Duplicate,
    /// All chunks sent.
    Delivered { chunks: usize },
    /// The error was reported to the user (or the attempt failed and was logged).
    Failed {
        stage: Stage,
        error: DispatchError,
        notified: bool,
    },
}

/// Composes the dispatch components for one handling identity.
pub struct DispatchPipeline {
    config: DispatchConfig,
    classifier: MessageClassifier,
    guard: Arc<SingleFlightGuard>,
    assembler: ContextAssembler,
    runner: ExternalTaskRunner,
    scheduler: DeliveryScheduler,
    channel: Arc<dyn ChannelClient>,
}

impl DispatchPipeline {
    pub fn new(
        config: DispatchConfig,
        self_id: impl Into<String>,
        guard: Arc<SingleFlightGuard>,
        runner: ExternalTaskRunner,
        channel: Arc<dyn ChannelClient>,
    ) -> Self {
        let classifier = MessageClassifier::new(self_id, config.mode.clone());
        let assembler =
            ContextAssembler::new(config.max_history_messages, config.history_strategies.clone());
        let scheduler = DeliveryScheduler::new(
            config.outbound_rate_per_second,
            config.max_message_length,
            config.mention_reply,
            &config.continuation_marker,
        );
        Self {
            config,
            classifier,
            guard,
            assembler,
            runner,
            scheduler,
            channel,
        }
    }

    pub fn self_id(&self) -> &str {
        self.classifier.self_id()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn guard(&self) -> &Arc<SingleFlightGuard> {
        &self.guard
    }

    /// Run the whole pipeline for one message. Never returns an error: failures are
    /// reported to the channel once and summarised in the report.
    pub async fn handle(&self, message: InboundMessage) -> DispatchReport {
        if !self.classifier.should_process(&message) {
            return DispatchReport::Skipped;
        }

        let Some(_ticket) = self.guard.acquire(&message.id) else {
            log::debug!("dispatch: {} already in flight, ignoring duplicate", message.id);
            return DispatchReport::Duplicate;
        };

        log::info!(
            "dispatch: handling {} from {} in {}",
            message.id,
            message.author_name,
            message.channel_id
        );
        match self.run(&message).await {
            Ok(chunks) => {
                log::info!("dispatch: delivered {} chunk(s) for {}", chunks, message.id);
                DispatchReport::Delivered { chunks }
            }
            Err((stage, error)) => {
                let notified = self.report_error(&message, stage, &error).await;
                DispatchReport::Failed {
                    stage,
                    error,
                    notified,
                }
            }
        }
    }

    async fn run(&self, message: &InboundMessage) -> Result<usize, (Stage, DispatchError)> {
        let record = self
            .assembler
            .build_context(message, self.channel.as_ref())
            .await;
        let prompt = build_prompt(&record, self.config.prompt_preamble.as_deref());
        log::debug!(
            "dispatch: prompt for {} has {} entr{} ({} bytes)",
            message.id,
            record.len(),
            if record.len() == 1 { "y" } else { "ies" },
            prompt.len()
        );

        if let Err(e) = self.channel.typing(&message.channel_id).await {
            log::debug!("dispatch: typing indicator failed: {}", e);
        }

        let text = match self.runner.run(&prompt, self.config.task_timeout).await {
            TaskOutcome::Success(text) => text,
            TaskOutcome::Timeout => {
                return Err((
                    Stage::Invoking,
                    DispatchError::Timeout(self.config.task_timeout),
                ))
            }
            TaskOutcome::Failure { reason, detail } => {
                return Err((Stage::Invoking, DispatchError::TaskFailed { reason, detail }))
            }
        };

        let budget = self.scheduler.chunk_budget(message);
        let chunks = chunk_text(&text, budget);
        if chunks.is_empty() {
            return Err((
                Stage::Chunking,
                DispatchError::TaskFailed {
                    reason: FailureReason::EmptyResponse,
                    detail: String::new(),
                },
            ));
        }

        self.scheduler
            .deliver(self.channel.as_ref(), message, &chunks)
            .await
            .map_err(|e| (Stage::Delivering, DispatchError::from(e)))?;
        Ok(chunks.len())
    }

    /// One attempt to tell the user what happened. Failure here is only logged.
    async fn report_error(
        &self,
        message: &InboundMessage,
        stage: Stage,
        error: &DispatchError,
    ) -> bool {
        log::warn!("dispatch: {} failed at {:?}: {}", message.id, stage, error);
        let text = error.user_message();
        let sent = match error {
            DispatchError::Delivery(_) => self.channel.send(&message.channel_id, text).await,
            _ => {
                self.channel
                    .reply(&message.channel_id, &message.id, text)
                    .await
            }
        };
        match sent {
            Ok(()) => true,
            Err(e) => {
                log::error!("dispatch: failure notice for {} not sent: {}", message.id, e);
                false
            }
        }
    }
}
