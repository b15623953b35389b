//! Codebox - sandboxed code execution with host-side model queries.
//!
//! Reads Lua blocks from stdin, separated by lines containing only `---`,
//! and runs them one after another in a single session configured by
//! `config/default.toml` and `CODEBOX__…` environment variables.

use std::io::Read;
use std::sync::Arc;

use anyhow::Context;
use codebox_bridge::{build_model, QueryHandler};
use codebox_core::config::AppConfig;
use codebox_core::tracing_layer::configure_tracing;
use codebox_core::{CodeBlock, TracingEventEmitter};
use codebox_session::{DefaultBackendFactory, SessionManager};

const BLOCK_SEPARATOR: &str = "---";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;
    configure_tracing(&config.logging)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), backend = %config.session.backend, "Starting codebox");

    // =========================================================================
    // Query handler and session manager
    // =========================================================================
    let model = build_model(config.model.as_ref())?;
    let handler = Arc::new(QueryHandler::from_config(model, &config.handler));
    tracing::info!(
        backend = handler.backend_name(),
        max_concurrent = handler.max_concurrent(),
        "Query handler initialized"
    );

    let manager = Arc::new(SessionManager::new(
        handler,
        Arc::new(TracingEventEmitter),
        Arc::new(DefaultBackendFactory),
    ));

    // =========================================================================
    // Run blocks from stdin
    // =========================================================================
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read blocks from stdin")?;
    let blocks = split_blocks(&input);

    let session = manager.create_session(config.session.clone()).await?;
    let mut failed = false;

    for code in blocks {
        let run = manager.execute(&session, &code);
        tokio::pin!(run);
        let block = tokio::select! {
            block = &mut run => block?,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, cancelling block");
                manager.cancel(&session)?;
                run.await?
            }
        };
        report(&block);
        if block.error.is_some() {
            failed = true;
        }
        if manager.state(&session)?.is_terminal() {
            break;
        }
    }

    manager.teardown(&session).await?;
    manager.shutdown().await;

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Split the input into non-blank blocks.
fn split_blocks(input: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    for line in input.lines() {
        if line.trim() == BLOCK_SEPARATOR {
            blocks.push(std::mem::take(&mut current));
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    blocks.push(current);
    blocks.retain(|b| !b.trim().is_empty());
    blocks
}

fn report(block: &CodeBlock) {
    print!("{}", block.stdout);
    if let Some(value) = &block.return_value {
        println!("=> {}", value);
    }
    if !block.stderr.is_empty() {
        eprint!("{}", block.stderr);
    }
    if let Some(error) = &block.error {
        eprintln!("[block {}] {:?}: {}", block.ordinal, error.kind, error.message);
    }
}
