//! Built-in control tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{parse_args, Tool, ToolError};
use crate::dispatch::Dispatcher;
use crate::jobs::builtin::BROADCAST_KIND;

/// Name used when a broadcast does not say who sent it.
pub const ANONYMOUS: &str = "anonymous";

/// Liveness check.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingTool;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PingArgs {
    msg: Option<String>,
}

#[async_trait]
impl Tool for PingTool {
    fn name(&self) -> &str {
        "ping"
    }

    fn description(&self) -> &str {
        "Test tool that replies with pong."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "msg": { "type": "string" } },
            "required": [],
            "additionalProperties": false
        })
    }

    async fn call(&self, args: Value) -> Result<String, ToolError> {
        let args: PingArgs = parse_args(args)?;
        Ok(format!("pong: {}", args.msg.as_deref().unwrap_or("ok")))
    }
}

/// Sends a chat message to every bridge client by dispatching the
/// broadcast job.
pub struct BroadcastMessageTool {
    dispatcher: Arc<Dispatcher>,
    job: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BroadcastArgs {
    name: Option<String>,
    text: String,
}

impl BroadcastMessageTool {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self::with_job(dispatcher, BROADCAST_KIND)
    }

    /// Dispatch under a job name other than `broadcast`.
    pub fn with_job(dispatcher: Arc<Dispatcher>, job: impl Into<String>) -> Self {
        Self {
            dispatcher,
            job: job.into(),
        }
    }
}

#[async_trait]
impl Tool for BroadcastMessageTool {
    fn name(&self) -> &str {
        "broadcastMessage"
    }

    fn description(&self) -> &str {
        "Send a message to every client connected to the bridge."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Sender name, defaults to anonymous" },
                "text": { "type": "string", "description": "Message text" }
            },
            "required": ["text"],
            "additionalProperties": false
        })
    }

    async fn call(&self, args: Value) -> Result<String, ToolError> {
        let args: BroadcastArgs = parse_args(args)?;
        if args.text.is_empty() {
            return Err(ToolError::InvalidArguments("text must not be empty".into()));
        }
        let name = args
            .name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| ANONYMOUS.to_string());

        let payload = json!({ "type": "message", "name": name, "text": args.text });
        self.dispatcher
            .dispatch(&self.job, payload)
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?;

        info!(job = %self.job, name = %name, "Broadcast message dispatched");
        Ok(format!("Message sent as \"{}\": {}", name, args.text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::dispatch::DispatchRoute;
    use crate::envelope::JobEnvelope;

    fn broadcast_tool(broker: &MemoryBroker) -> BroadcastMessageTool {
        let dispatcher = Dispatcher::new(Arc::new(broker.clone()), DispatchRoute::default());
        BroadcastMessageTool::new(Arc::new(dispatcher))
    }

    #[tokio::test]
    async fn test_ping_defaults_to_ok() {
        assert_eq!(PingTool.call(Value::Null).await.unwrap(), "pong: ok");
        assert_eq!(
            PingTool.call(json!({"msg": "hi"})).await.unwrap(),
            "pong: hi"
        );
    }

    #[tokio::test]
    async fn test_ping_rejects_extra_fields() {
        let err = PingTool.call(json!({"other": 1})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn test_broadcast_dispatches_message_job() {
        let broker = MemoryBroker::new();
        let tool = broadcast_tool(&broker);

        let text = tool
            .call(json!({"name": "ops", "text": "deploy done"}))
            .await
            .unwrap();

        assert_eq!(text, "Message sent as \"ops\": deploy done");
        let envelope = JobEnvelope::decode(&broker.published()[0].1).unwrap();
        assert_eq!(envelope.job, "broadcast");
        assert_eq!(
            envelope.payload,
            json!({"type": "message", "name": "ops", "text": "deploy done"})
        );
    }

    #[tokio::test]
    async fn test_broadcast_defaults_to_anonymous() {
        let broker = MemoryBroker::new();
        let tool = broadcast_tool(&broker);

        let text = tool.call(json!({"text": "hi"})).await.unwrap();

        assert_eq!(text, "Message sent as \"anonymous\": hi");
        let envelope = JobEnvelope::decode(&broker.published()[0].1).unwrap();
        assert_eq!(envelope.payload["name"], "anonymous");
    }

    #[tokio::test]
    async fn test_broadcast_requires_text() {
        let broker = MemoryBroker::new();
        let tool = broadcast_tool(&broker);

        let missing = tool.call(json!({"name": "x"})).await.unwrap_err();
        let empty = tool.call(json!({"text": ""})).await.unwrap_err();

        assert!(matches!(missing, ToolError::InvalidArguments(_)));
        assert!(matches!(empty, ToolError::InvalidArguments(_)));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_surfaces_dispatch_failure() {
        let broker = MemoryBroker::new();
        broker.set_fail_on_publish(true);
        let tool = broadcast_tool(&broker);

        let err = tool.call(json!({"text": "hi"})).await.unwrap_err();

        assert!(matches!(err, ToolError::Failed(_)));
    }
}
