//! Local command handler (`sh://`)
//!
//! `sh:///path/to/program` runs the program directly (no shell), writes the
//! JSON-encoded [`ResourceArgs`] to its stdin and returns its stdout, read up
//! to `max_body_size`. A non-zero exit status is a failure, and so is output
//! past the limit. The child is killed when the fetch is dropped, which
//! covers both timeout and cancellation.

use super::{ResourceArgs, ResourceHandler, ResourceOptions, ResourceResponse};
use crate::error::{EsiError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

/// Bytes of stderr kept for the failure message
const STDERR_LIMIT: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct ShellHandler {
    /// Fixed program for alias use; otherwise taken from the URL
    program: Option<String>,
}

impl ShellHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_options(options: &ResourceOptions) -> Self {
        ShellHandler {
            program: Some(options.path.clone()).filter(|p| !p.is_empty()),
        }
    }

    fn program<'a>(&'a self, args: &'a ResourceArgs) -> Result<&'a str> {
        if let Some(program) = &self.program {
            return Ok(program);
        }
        let (_, rest) = super::split_scheme(&args.url)?;
        let program = rest.split('?').next().unwrap_or_default();
        if program.is_empty() {
            return Err(EsiError::NotValid(format!("no program in {:?}", args.url)));
        }
        Ok(program)
    }
}

#[async_trait]
impl ResourceHandler for ShellHandler {
    fn name(&self) -> &str {
        "sh"
    }

    async fn do_request(&self, args: &ResourceArgs) -> Result<ResourceResponse> {
        let program = self.program(args)?;
        let payload = serde_json::to_vec(&args.to_json())
            .map_err(|e| EsiError::InternalError(format!("encode args: {}", e)))?;

        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EsiError::BackendFatal(format!("spawn {}: {}", program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // the program may exit without reading its input
            let _ = stdin.write_all(&payload).await;
        }

        let (Some(stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(EsiError::InternalError(format!("{}: output not piped", program)));
        };
        let read_stdout = async {
            let mut content = Vec::new();
            stdout
                .take(args.max_body_size as u64 + 1)
                .read_to_end(&mut content)
                .await?;
            if content.len() > args.max_body_size {
                return Err(EsiError::IoError(format!(
                    "{} produced more than {} bytes",
                    program, args.max_body_size
                )));
            }
            Ok::<_, EsiError>(content)
        };
        let read_stderr = async {
            let mut errors = Vec::new();
            (&mut stderr)
                .take(STDERR_LIMIT as u64)
                .read_to_end(&mut errors)
                .await?;
            tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await?;
            Ok::<_, EsiError>(errors)
        };
        let run = async {
            let (content, errors) = tokio::try_join!(read_stdout, read_stderr)?;
            let status = child.wait().await?;
            Ok::<_, EsiError>((status, content, errors))
        };
        // dropping `child` on any early return kills the program
        let (status, content, errors) = if args.timeout.is_zero() {
            run.await?
        } else {
            tokio::time::timeout(args.timeout, run)
                .await
                .map_err(|_| EsiError::Timeout(format!("{} exceeded {:?}", program, args.timeout)))??
        };

        if !status.success() {
            return Err(EsiError::BackendFatal(format!(
                "{} exited with {}: {}",
                program,
                status,
                String::from_utf8_lossy(&errors).trim()
            )));
        }

        debug!("{} produced {} bytes", program, content.len());
        Ok(ResourceResponse::new(Bytes::from(content)))
    }
}
