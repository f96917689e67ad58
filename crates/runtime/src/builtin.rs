//! Built-in tool registrations.
//!
//! Registered at boot: sandboxed shell execution, workspace file I/O, and
//! long-term memory append/search over `MEMORY.md`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use osa_domain::config::Config;
use osa_domain::error::{Error, Result};
use osa_domain::message::ToolDefinition;
use osa_tools::registry::{ToolHandler, ToolOutput};
use osa_tools::ToolRegistry;
use serde_json::Value;

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Other(format!("missing required argument: {key}")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ShellTool {
    config: Arc<Config>,
}

#[async_trait::async_trait]
impl ToolHandler for ShellTool {
    async fn execute(&self, args: &Value) -> Result<ToolOutput> {
        let command = str_arg(args, "command")?;
        let output = osa_tools::exec::shell_execute(
            command,
            &self.config.workspace_root,
            Duration::from_secs(self.config.tool_timeout_secs),
        )
        .await?;
        Ok(ToolOutput::Text(output))
    }
}

struct FileReadTool {
    config: Arc<Config>,
}

#[async_trait::async_trait]
impl ToolHandler for FileReadTool {
    async fn execute(&self, args: &Value) -> Result<ToolOutput> {
        let path = str_arg(args, "path")?;
        let offset = args.get("offset").and_then(|v| v.as_u64()).map(|v| v as usize);
        let limit = args.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize);
        let content =
            osa_tools::file_ops::file_read(&self.config.workspace_root, path, offset, limit)
                .await?;
        Ok(ToolOutput::Text(content))
    }
}

struct FileWriteTool {
    config: Arc<Config>,
}

#[async_trait::async_trait]
impl ToolHandler for FileWriteTool {
    async fn execute(&self, args: &Value) -> Result<ToolOutput> {
        let path = str_arg(args, "path")?;
        let content = str_arg(args, "content")?;
        osa_tools::file_ops::file_write(&self.config.workspace_root, path, content).await?;
        Ok(ToolOutput::Text(format!("wrote {} bytes to {path}", content.len())))
    }
}

struct FileListTool {
    config: Arc<Config>,
}

#[async_trait::async_trait]
impl ToolHandler for FileListTool {
    async fn execute(&self, args: &Value) -> Result<ToolOutput> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let names = osa_tools::file_ops::file_list(&self.config.workspace_root, path).await?;
        Ok(ToolOutput::Text(names.join("\n")))
    }
}

struct MemoryAppendTool {
    config: Arc<Config>,
}

#[async_trait::async_trait]
impl ToolHandler for MemoryAppendTool {
    async fn execute(&self, args: &Value) -> Result<ToolOutput> {
        let content = str_arg(args, "content")?;
        let category = args
            .get("category")
            .and_then(|v| v.as_str())
            .unwrap_or("note");

        let path = self.config.memory_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
        }
        let entry = format!(
            "\n## [{category}] {}\n{content}\n",
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        );
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(Error::Io)?;
        file.write_all(entry.as_bytes()).await.map_err(Error::Io)?;
        Ok(ToolOutput::Text(format!("remembered under [{category}]")))
    }
}

struct MemorySearchTool {
    config: Arc<Config>,
}

#[async_trait::async_trait]
impl ToolHandler for MemorySearchTool {
    async fn execute(&self, args: &Value) -> Result<ToolOutput> {
        let query = str_arg(args, "query")?.to_lowercase();
        let raw = tokio::fs::read_to_string(self.config.memory_path())
            .await
            .unwrap_or_default();
        let hits: Vec<String> = raw
            .split("\n## ")
            .filter(|entry| entry.to_lowercase().contains(&query))
            .map(|entry| format!("## {}", entry.trim()))
            .collect();
        if hits.is_empty() {
            Ok(ToolOutput::Text("no matching memory entries".into()))
        } else {
            Ok(ToolOutput::Text(hits.join("\n")))
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn register_all(registry: &ToolRegistry, config: Arc<Config>) {
    let mut shell = ToolDefinition::new(
        "shell_execute",
        "Run a shell command inside the workspace. Destructive commands are refused by policy.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command to execute" }
            },
            "required": ["command"]
        }),
    );
    shell.destructive = true;
    registry.register(shell, Arc::new(ShellTool { config: config.clone() }));

    registry.register(
        ToolDefinition::new(
            "file_read",
            "Read a file (workspace-relative or absolute), optionally a line window.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File path" },
                    "offset": { "type": "integer", "description": "First line (0-based)" },
                    "limit": { "type": "integer", "description": "Max lines to return" }
                },
                "required": ["path"]
            }),
        ),
        Arc::new(FileReadTool { config: config.clone() }),
    );

    let mut write = ToolDefinition::new(
        "file_write",
        "Write a file atomically. Only the workspace and /tmp are writable.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path" },
                "content": { "type": "string", "description": "Full file contents" }
            },
            "required": ["path", "content"]
        }),
    );
    write.destructive = true;
    registry.register(write, Arc::new(FileWriteTool { config: config.clone() }));

    registry.register(
        ToolDefinition::new(
            "file_list",
            "List a directory under the workspace.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Directory (default '.')" }
                }
            }),
        ),
        Arc::new(FileListTool { config: config.clone() }),
    );

    registry.register(
        ToolDefinition::new(
            "memory_append",
            "Store a fact in long-term memory (MEMORY.md).",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "content": { "type": "string", "description": "What to remember" },
                    "category": { "type": "string", "description": "Short category label" }
                },
                "required": ["content"]
            }),
        ),
        Arc::new(MemoryAppendTool { config: config.clone() }),
    );

    registry.register(
        ToolDefinition::new(
            "memory_search",
            "Search long-term memory entries by keyword.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" }
                },
                "required": ["query"]
            }),
        ),
        Arc::new(MemorySearchTool { config }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> Arc<Config> {
        let home = dir.join("home").to_string_lossy().to_string();
        let ws = dir.join("ws").to_string_lossy().to_string();
        std::fs::create_dir_all(dir.join("ws")).unwrap();
        Arc::new(Config::from_lookup(&move |key| match key {
            "OSA_HOME" => Some(home.clone()),
            "OSA_WORKSPACE" => Some(ws.clone()),
            _ => None,
        }))
    }

    #[tokio::test]
    async fn all_builtins_registered() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new();
        register_all(&registry, config(dir.path()));
        let names: Vec<String> = registry.list_direct().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                "file_list",
                "file_read",
                "file_write",
                "memory_append",
                "memory_search",
                "shell_execute",
            ]
        );
    }

    #[tokio::test]
    async fn file_tools_round_trip_through_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new();
        register_all(&registry, config(dir.path()));

        registry
            .execute_direct(
                "file_write",
                &serde_json::json!({"path": "a.txt", "content": "hello"}),
            )
            .await
            .unwrap();
        let out = registry
            .execute_direct("file_read", &serde_json::json!({"path": "a.txt"}))
            .await
            .unwrap();
        assert!(matches!(out, ToolOutput::Text(t) if t == "hello"));
    }

    #[tokio::test]
    async fn memory_append_then_search() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new();
        register_all(&registry, config(dir.path()));

        registry
            .execute_direct(
                "memory_append",
                &serde_json::json!({"content": "the user prefers dark roast coffee", "category": "preference"}),
            )
            .await
            .unwrap();

        let out = registry
            .execute_direct("memory_search", &serde_json::json!({"query": "coffee"}))
            .await
            .unwrap();
        match out {
            ToolOutput::Text(t) => {
                assert!(t.contains("dark roast"));
                assert!(t.contains("[preference]"));
            }
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn shell_tool_blocks_denied_commands() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new();
        register_all(&registry, config(dir.path()));

        let err = registry
            .execute_direct("shell_execute", &serde_json::json!({"command": "sudo id"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolBlocked(_)));
    }
}
