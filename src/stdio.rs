//! Stdio transport: one JSON-RPC message per newline-terminated line on
//! stdin, one response per line on stdout. All logging goes to stderr so
//! the wire stays clean. No authentication; the transport is only reachable
//! by whoever spawned the process.

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::mcp::McpDispatcher;

/// Serves requests sequentially until EOF or cancellation.
pub async fn run(dispatcher: Arc<McpDispatcher>, cancel: CancellationToken) -> Result<()> {
    info!("MCP server listening on stdio");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                info!("stdio transport cancelled");
                break;
            }
            line = lines.next_line() => line?,
        };

        let Some(line) = line else {
            debug!("stdin closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        if let Some(response) = dispatcher.handle_message(&line).await {
            let mut out = serde_json::to_string(&response).unwrap_or_else(|_| {
                r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal serialization error"}}"#
                    .to_string()
            });
            out.push('\n');
            stdout.write_all(out.as_bytes()).await?;
            stdout.flush().await?;
        }
    }

    Ok(())
}
