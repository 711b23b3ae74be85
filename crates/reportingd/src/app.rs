//! Daemon runtime.

use crate::commands::handle_line;
use crate::config::Config;
use crate::paths::Paths;
use anyhow::Result;
use reporting_core::{Collaborators, ReportingContext};
use reporting_transport::{FileDelegate, HttpUploader, UploaderConfig};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{info, warn};

/// Builds the context from configuration: HTTP uploads and a state file.
pub fn build_context(config: &Config, paths: &Paths) -> Result<Arc<ReportingContext>> {
    let policy = config.policy.to_policy()?;
    let uploader = HttpUploader::new(UploaderConfig {
        timeout_secs: config.upload_timeout_secs,
        ..Default::default()
    })?;
    let delegate = FileDelegate::new(config.state_file(paths));

    let mut collaborators = Collaborators::new(Arc::new(uploader), Arc::new(delegate));
    if let Some(seed) = config.rng_seed {
        collaborators.rng_seed = seed;
    }
    Ok(Arc::new(ReportingContext::new(policy, collaborators)))
}

/// Runs until stdin closes or Ctrl-C, then shuts down gracefully.
pub async fn run(config: Config, paths: Paths) -> Result<()> {
    paths.ensure_dirs()?;
    let context = build_context(&config, &paths)?;
    context.start();
    info!(
        state_file = %config.state_file(&paths).display(),
        "reportingd started"
    );

    let input = BufReader::new(tokio::io::stdin());
    let output = tokio::io::stdout();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tokio::select! {
        result = serve(&context, input, output) => {
            if let Err(e) = result {
                warn!(error = %e, "Command feed failed");
            }
        }
        _ = &mut shutdown => {
            info!("Interrupted");
        }
    }

    let abandoned = context.shutdown(config.shutdown_grace()).await;
    info!(abandoned, "reportingd stopped");
    Ok(())
}

/// Answers each command line with one response line until EOF.
pub async fn serve<R, W>(context: &ReportingContext, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let response = handle_line(context, line);
        output.write_all(response.to_string().as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    Ok(())
}
