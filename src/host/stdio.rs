//! Stdin/stdout JSON bridge for the scheduling engine.
//!
//! Reads newline-delimited JSON `CommandEnvelope` messages from stdin,
//! turns them into engine events, and writes `ResponseEnvelope` and
//! `EventEnvelope` messages as newline-delimited JSON to stdout.
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output (tracing, logs) must be routed to stderr.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::dispatch::{DeliveryAck, DeliveryChannel, NotificationDispatcher, OutboundMessage};
use crate::error::{EngineError, Result};
use crate::host::contract::{
    CommandEnvelope, CommandName, EventEnvelope, GoalCheckpointPayload, ResponseEnvelope,
    ScheduledTaskPayload, UserMessagePayload,
};
use crate::queue::{EventPayload, EventSource};
use crate::scheduler::{Collaborators, EngineHandle, SchedulingLoop};
use crate::store::StateStore;

type SharedWriter<W> = Arc<Mutex<W>>;

/// Delivery channel that writes notifications as `engine.notification`
/// events on the protocol stream.
pub struct StdoutChannel<W> {
    writer: SharedWriter<W>,
}

impl<W> StdoutChannel<W> {
    pub fn new(writer: SharedWriter<W>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> DeliveryChannel for StdoutChannel<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn id(&self) -> &str {
        "stdout"
    }

    async fn deliver(&self, subject_id: &str, message: &OutboundMessage) -> Result<DeliveryAck> {
        let message_ref = Uuid::new_v4().to_string();
        let envelope = EventEnvelope::new(
            "engine.notification",
            serde_json::json!({
                "subject_id": subject_id,
                "text": message.text,
                "concern_id": message.concern_id,
                "message_ref": message_ref,
            }),
        );
        let json = serde_json::to_string(&envelope)
            .map_err(|e| EngineError::Channel(format!("failed to serialize notification: {e}")))?;
        let mut w = self.writer.lock().await;
        write_line(&mut *w, &json).await?;
        Ok(DeliveryAck {
            message_ref: Some(message_ref),
        })
    }
}

/// Run the engine on stdin/stdout until stdin closes or `engine.stop`.
pub async fn run_stdio_bridge(config: EngineConfig, store: Arc<dyn StateStore>) -> Result<()> {
    let writer = Arc::new(Mutex::new(tokio::io::stdout()));
    run_bridge(
        tokio::io::stdin(),
        writer,
        config,
        store,
        Arc::new(SystemClock),
    )
    .await
}

/// Bridge over arbitrary streams.
///
/// Three tasks run concurrently: the scheduling loop, an output forwarder
/// that writes every `EngineOutput` as an event envelope, and the reader
/// (on the calling task) that answers commands. When the reader finishes the
/// loop is cancelled and the forwarder drains what is left.
pub async fn run_bridge<R, W>(
    input: R,
    writer: SharedWriter<W>,
    config: EngineConfig,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let dispatcher = NotificationDispatcher::new(config.retry.clone(), config.generation_timeout())
        .with_channel(Arc::new(StdoutChannel::new(Arc::clone(&writer))));
    let (engine, handle, mut outputs) =
        SchedulingLoop::new(config, store, clock, Collaborators::default(), dispatcher)?;
    let loop_task = engine.spawn();

    let event_writer = Arc::clone(&writer);
    let forwarder = tokio::spawn(async move {
        while let Some(output) = outputs.recv().await {
            let json = match EventEnvelope::from_output(&output)
                .and_then(|env| serde_json::to_string(&env))
            {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize engine output; skipping");
                    continue;
                }
            };
            let mut w = event_writer.lock().await;
            if let Err(e) = write_line(&mut *w, &json).await {
                tracing::warn!(error = %e, "failed to write engine output; stopping forwarder");
                break;
            }
        }
    });

    let reader_result = run_reader(input, &handle, Arc::clone(&writer)).await;

    handle.shutdown();
    let loop_result = match loop_task.await {
        Ok(result) => result,
        Err(e) => Err(EngineError::Channel(format!("scheduling loop task failed: {e}"))),
    };
    // The loop owned the output sender; the forwarder ends once it drains.
    if let Err(e) = forwarder.await {
        tracing::warn!(error = %e, "engine output forwarder task failed");
    }

    reader_result?;
    loop_result
}

async fn run_reader<R, W>(input: R, handle: &EngineHandle, writer: SharedWriter<W>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(input);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| EngineError::Channel(format!("failed to read from stdin: {e}")))?;
        if bytes_read == 0 {
            tracing::info!("stdin closed (EOF); shutting down");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let (response, stop) = match serde_json::from_str::<CommandEnvelope>(trimmed) {
            Ok(envelope) => {
                let stop = envelope.command == CommandName::Stop;
                (handle_command(handle, &envelope), stop)
            }
            Err(e) => {
                tracing::warn!(error = %e, raw_line = %trimmed, "failed to parse command envelope");
                (
                    ResponseEnvelope::error(
                        "parse-error",
                        format!("failed to parse command envelope: {e}"),
                    ),
                    false,
                )
            }
        };

        let json = serde_json::to_string(&response)
            .map_err(|e| EngineError::Channel(format!("failed to serialize response: {e}")))?;
        {
            let mut w = writer.lock().await;
            write_line(&mut *w, &json).await?;
        }

        if stop {
            tracing::info!("engine.stop received; shutting down");
            break;
        }
    }
    Ok(())
}

/// Answer one command. Never fails; problems become error responses.
pub fn handle_command(handle: &EngineHandle, envelope: &CommandEnvelope) -> ResponseEnvelope {
    let request_id = envelope.request_id.as_str();
    if let Err(msg) = envelope.validate() {
        return ResponseEnvelope::error(request_id, msg);
    }

    let submitted = match envelope.command {
        CommandName::UserMessage => parse_payload::<UserMessagePayload>(envelope)
            .map(|p| handle.user_message(p.subject_id, p.text)),
        CommandName::ScheduledTask => parse_payload::<ScheduledTaskPayload>(envelope).map(|p| {
            handle.submit_payload(
                EventPayload::ScheduledTask { task: p.task },
                EventSource::External("host".to_owned()),
            )
        }),
        CommandName::GoalCheckpoint => parse_payload::<GoalCheckpointPayload>(envelope).map(|p| {
            handle.submit_payload(
                EventPayload::GoalCheckpoint { goal: p.goal },
                EventSource::External("host".to_owned()),
            )
        }),
        CommandName::Snapshot => {
            return match serde_json::to_value(handle.snapshot()) {
                Ok(snapshot) => ResponseEnvelope::ok(request_id, snapshot),
                Err(e) => ResponseEnvelope::error(request_id, format!("snapshot failed: {e}")),
            };
        }
        CommandName::Stop => {
            handle.shutdown();
            return ResponseEnvelope::ok(request_id, serde_json::json!({ "stopping": true }));
        }
    };

    match submitted {
        Ok(event_id) => ResponseEnvelope::ok(request_id, serde_json::json!({ "event_id": event_id })),
        Err(msg) => ResponseEnvelope::error(request_id, msg),
    }
}

fn parse_payload<T: DeserializeOwned>(envelope: &CommandEnvelope) -> std::result::Result<T, String> {
    serde_json::from_value(envelope.payload.clone())
        .map_err(|e| format!("invalid {} payload: {e}", envelope.command.as_str()))
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, json: &str) -> Result<()> {
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
