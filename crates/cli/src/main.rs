//! Minimal pipeline front end.
//!
//! Stages are pre-split argument vectors separated by a literal `|`
//! argument; no shell parsing happens here. Adjacent stages are wired
//! stdout to stdin, the outer descriptors go to the parent's own stdio, and
//! the process exits with the last stage's status.
//!
//! ```text
//! pipework /bin/echo 'hello world' '|' /usr/bin/grep hello
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use pipework::{Command, InputEndpoint, OutputEndpoint, WaitStatus};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Launch a chain of commands with wired descriptors.")]
struct Cli {
    /// Absolute program paths with their arguments; separate stages with a
    /// literal "|" argument.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pipeline: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let stages: Vec<&[String]> = cli.pipeline.split(|arg| arg == "|").collect();

    let mut commands = Vec::with_capacity(stages.len());
    for stage in &stages {
        if stage.is_empty() {
            bail!("empty pipeline stage");
        }
        let command = Command::new(stage.iter().map(String::as_str))
            .with_context(|| format!("invalid command {stage:?}"))?;
        commands.push(command);
    }

    // Standalone endpoints borrow the parent's stdio; they have to outlive
    // every launch, so they live here rather than in the binding calls.
    let parent_stdin = OutputEndpoint::real_fd(0);
    let parent_stdout = InputEndpoint::real_fd(1);
    let mut parent_stderr = Vec::with_capacity(commands.len());

    for index in 0..commands.len() - 1 {
        let downstream = commands[index + 1].input(0);
        commands[index].bind_output(1, &downstream)?;
    }
    if let Some(first) = commands.first_mut() {
        first.bind_input(0, &parent_stdin)?;
    }
    if let Some(last) = commands.last_mut() {
        last.bind_output(1, &parent_stdout)?;
    }
    for command in &mut commands {
        let stderr = InputEndpoint::real_fd(2);
        command.bind_output(2, &stderr)?;
        parent_stderr.push(stderr);
    }

    tracing::debug!(stages = commands.len(), "pipeline assembled");
    for (index, command) in commands.iter_mut().enumerate() {
        command
            .run()
            .with_context(|| format!("failed to launch stage {index}"))?;
    }

    let mut code = 0;
    for command in &mut commands {
        match command.wait()? {
            WaitStatus::Exited(_, status) => code = status,
            WaitStatus::Signaled(_, signal, _) => code = 128 + signal as i32,
            _ => {}
        }
    }
    std::process::exit(code);
}
