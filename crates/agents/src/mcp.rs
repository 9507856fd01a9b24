//! Tool dispatch: MCP client seam plus built-in executor fallback.
//!
//! The gateway treats the MCP client as an injected capability; tool names
//! shaped `server__tool` route to it, everything else goes to the built-in
//! executor. A miss on both sides is an error *result*: the model sees it
//! and continues.

use std::sync::Arc;

use {async_trait::async_trait, serde_json::Value};

use crate::model::ToolDefinition;

/// Separates the MCP server namespace from the tool name.
pub const MCP_DELIMITER: &str = "__";

#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub result: Value,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: Value::String(message.into()),
            is_error: true,
        }
    }
}

/// Sub-process MCP client, managed outside the core.
#[async_trait]
pub trait McpClient: Send + Sync {
    /// Advertised tools, names already namespaced `server__tool`.
    async fn tool_list(&self) -> Vec<ToolDefinition>;
    async fn call(&self, namespaced_name: &str, args: Value) -> ToolOutcome;
}

/// In-process tools (demo `web_search`, host integrations).
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;
    async fn execute(&self, name: &str, args: &Value) -> Result<Value, String>;
}

/// Split `server__tool` on the first delimiter. Names without a delimiter
/// (or with an empty server part) are not MCP-routed.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    let (server, tool) = name.split_once(MCP_DELIMITER)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

/// Routes tool calls from the stream loop to MCP or built-ins.
#[derive(Clone, Default)]
pub struct ToolRouter {
    pub mcp: Option<Arc<dyn McpClient>>,
    pub builtin: Option<Arc<dyn ToolExecutor>>,
}

impl ToolRouter {
    /// Union of MCP and built-in tool definitions; may be empty.
    pub async fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = match &self.mcp {
            Some(mcp) => mcp.tool_list().await,
            None => vec![],
        };
        if let Some(builtin) = &self.builtin {
            defs.extend(builtin.definitions());
        }
        defs
    }

    pub async fn dispatch(&self, name: &str, args: Value) -> ToolOutcome {
        if split_namespaced(name).is_some()
            && let Some(mcp) = &self.mcp
        {
            return mcp.call(name, args).await;
        }
        if let Some(builtin) = &self.builtin {
            return match builtin.execute(name, &args).await {
                Ok(result) => ToolOutcome::ok(result),
                Err(message) => ToolOutcome::error(message),
            };
        }
        ToolOutcome::error(format!("Unknown tool: {name}"))
    }
}
