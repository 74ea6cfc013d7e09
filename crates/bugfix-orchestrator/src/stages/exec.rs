use std::marker::PhantomData;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::stage::Stage;

/// Command-backed stage: the stage's work happens in an external program
/// speaking JSON — input on stdin, output on stdout.
///
/// A non-zero exit or unparseable output is a stage fault; the program
/// reports expected negative outcomes (e.g. failed verification) inside its
/// JSON output, not via its exit code.
pub struct ExecStage<I, O> {
    name: &'static str,
    program: String,
    args: Vec<String>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> ExecStage<I, O> {
    /// Build from a whitespace-separated command line.
    pub fn new(name: &'static str, command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(String::from);
        let program = parts
            .next()
            .with_context(|| format!("empty command configured for {name} stage"))?;
        Ok(Self {
            name,
            program,
            args: parts.collect(),
            _marker: PhantomData,
        })
    }
}

#[async_trait]
impl<I, O> Stage for ExecStage<I, O>
where
    I: Serialize + Send + Sync + 'static,
    O: DeserializeOwned + Send + 'static,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, input: I) -> Result<O> {
        let payload = serde_json::to_vec(&input)
            .with_context(|| format!("failed to serialize {} stage input", self.name))?;

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!("failed to spawn {} stage command `{}`", self.name, self.program)
            })?;

        let mut stdin = child
            .stdin
            .take()
            .with_context(|| format!("{} stage child has no stdin", self.name))?;
        stdin.write_all(&payload).await?;
        drop(stdin); // close so the child sees EOF

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} stage command exited with {}: {}",
                self.name,
                output.status,
                stderr.trim()
            );
        }

        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("failed to parse {} stage output", self.name))
    }
}
