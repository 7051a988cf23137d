//! Quote pipeline: runs the quote program, then pipes its output through the
//! render program.
//!
//! Both programs are opaque text filters. The quote program gets no input;
//! the render program reads the quote on stdin. Whatever the render program
//! prints is the response for one connection.
//!
//! ## Partial output
//!
//! A failing stage does not discard what was already produced. The error is
//! returned as a [`Partial`] carrying the bytes that should still reach the
//! client:
//!
//! ```text
//! quote fails to start      -> nothing
//! quote exits non-zero      -> quote stdout (render is skipped)
//! render fails to start     -> quote stdout, unrendered
//! render exits non-zero     -> render stdout
//! ```

use bytes::Bytes;
use serde::Deserialize;
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

/// An external program with its arguments.
///
/// The program is resolved against `PATH` each time it runs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Collaborator {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Collaborator {
    /// A program invoked without arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// A program invoked with the given arguments.
    pub fn with_args<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Which half of the pipeline failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Quote,
    Render,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Quote => f.write_str("quote"),
            Stage::Render => f.write_str("render"),
        }
    }
}

/// Pipeline failure causes
#[derive(Debug)]
pub enum PipelineError {
    /// The program could not be started (missing, not executable, ...).
    Spawn {
        stage: Stage,
        program: String,
        source: io::Error,
    },
    /// The program ran but exited unsuccessfully.
    Exit {
        stage: Stage,
        program: String,
        status: ExitStatus,
    },
    /// Collecting the program's output failed.
    Wait {
        stage: Stage,
        program: String,
        source: io::Error,
    },
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Spawn { stage, .. }
            | PipelineError::Exit { stage, .. }
            | PipelineError::Wait { stage, .. } => *stage,
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Spawn {
                stage,
                program,
                source,
            } => write!(f, "Failed to start {stage} program '{program}': {source}"),
            PipelineError::Exit {
                stage,
                program,
                status,
            } => write!(f, "{stage} program '{program}' {status}"),
            PipelineError::Wait {
                stage,
                program,
                source,
            } => write!(f, "Failed to collect output of {stage} program '{program}': {source}"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Spawn { source, .. } | PipelineError::Wait { source, .. } => {
                Some(source)
            }
            PipelineError::Exit { .. } => None,
        }
    }
}

/// A failed run together with the output that should still be delivered.
#[derive(Debug)]
pub struct Partial {
    pub output: Bytes,
    pub error: PipelineError,
}

impl fmt::Display for Partial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes salvaged)", self.error, self.output.len())
    }
}

impl std::error::Error for Partial {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// The two programs run for every connection.
#[derive(Debug, Clone)]
pub struct Pipeline {
    quote: Collaborator,
    render: Collaborator,
}

impl Pipeline {
    pub fn new(quote: Collaborator, render: Collaborator) -> Self {
        Self { quote, render }
    }

    /// Run the quote program and feed its output to the render program.
    ///
    /// Returns the render program's stdout, byte for byte.
    pub async fn run(&self) -> Result<Bytes, Partial> {
        let quote = run_stage(Stage::Quote, &self.quote, None).await?;
        trace!(bytes = quote.len(), "Quote generated");

        match run_stage(Stage::Render, &self.render, Some(quote.clone())).await {
            Ok(rendered) => Ok(rendered),
            // Render never produced anything usable: fall back to the raw quote.
            Err(Partial {
                error: error @ (PipelineError::Spawn { .. } | PipelineError::Wait { .. }),
                ..
            }) => Err(Partial {
                output: quote,
                error,
            }),
            Err(partial) => Err(partial),
        }
    }
}

/// Run one program to completion and capture its stdout.
///
/// With `input`, the bytes are written to the child's stdin from a separate
/// task so a child that fills its stdout pipe before draining stdin cannot
/// deadlock against us.
async fn run_stage(
    stage: Stage,
    collaborator: &Collaborator,
    input: Option<Bytes>,
) -> Result<Bytes, Partial> {
    let mut command = collaborator.command();
    command
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|source| Partial {
        output: Bytes::new(),
        error: PipelineError::Spawn {
            stage,
            program: collaborator.program.clone(),
            source,
        },
    })?;

    let feeder = match (input, child.stdin.take()) {
        (Some(input), Some(mut stdin)) => Some(tokio::spawn(async move {
            stdin.write_all(&input).await?;
            // Dropping stdin closes the pipe so the child sees EOF.
            drop(stdin);
            Ok::<_, io::Error>(())
        })),
        _ => None,
    };

    let output = child.wait_with_output().await.map_err(|source| Partial {
        output: Bytes::new(),
        error: PipelineError::Wait {
            stage,
            program: collaborator.program.clone(),
            source,
        },
    })?;

    if let Some(feeder) = feeder {
        match feeder.await {
            Ok(Ok(())) => {}
            // The child may exit without reading all of its input.
            Ok(Err(e)) => debug!(%stage, error = %e, "Child stopped reading stdin"),
            Err(e) => debug!(%stage, error = %e, "Stdin writer task failed"),
        }
    }

    if !output.stderr.is_empty() {
        debug!(
            %stage,
            program = %collaborator.program,
            stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
            "Child wrote to stderr"
        );
    }

    let stdout = Bytes::from(output.stdout);
    if output.status.success() {
        Ok(stdout)
    } else {
        Err(Partial {
            output: stdout,
            error: PipelineError::Exit {
                stage,
                program: collaborator.program.clone(),
                status: output.status,
            },
        })
    }
}
