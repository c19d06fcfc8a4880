//! Custom tracing layer for the child process.
//!
//! Ships structured tracing events over the control channel as `log`
//! notifications, preserving target and level, so the supervisor sees the
//! child's event stream without touching its stdio.

use tokio::sync::mpsc;
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::protocol::{ControlMessage, commands};

pub struct AgentTracingLayer {
    tx: mpsc::UnboundedSender<ControlMessage>,
}

impl AgentTracingLayer {
    pub fn new(tx: mpsc::UnboundedSender<ControlMessage>) -> Self {
        Self { tx }
    }

    fn level_to_string(level: &Level) -> &'static str {
        match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        }
    }
}

impl<S> Layer<S> for AgentTracingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();

        // Frames about frame encoding must not be shipped over IPC; that
        // would feed back into another log frame, and so on.
        if target.starts_with("hostlet::bridge") {
            return;
        }

        let level = Self::level_to_string(metadata.level());

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let _ = self.tx.send(ControlMessage::notify(
            commands::LOG,
            serde_json::json!({
                "target": target,
                "level": level,
                "message": visitor.message,
            }),
        ));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
            if self.message.starts_with('"') && self.message.ends_with('"') {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}
