//! External-process evaluator: spawn a program per window.

use super::{EvaluationError, Evaluator};
use crate::run::{format_ts, Window};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Runs `program args...` with `{start}` / `{end}` substituted in each arg
/// and `EVAL_WINDOW_START` / `EVAL_WINDOW_END` set in the environment.
///
/// Exit status 0 is success and the last non-empty stdout line becomes the
/// run summary. Anything else is a failure carrying stderr.
pub struct CommandEvaluator {
    name: String,
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandEvaluator {
    pub fn new(program: &str, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            name: format!("command:{program}"),
            program: program.to_string(),
            args,
            working_dir,
        }
    }

    fn render_args(&self, start: &str, end: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace("{start}", start).replace("{end}", end))
            .collect()
    }
}

#[async_trait::async_trait]
impl Evaluator for CommandEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, window: &Window) -> Result<Option<String>, EvaluationError> {
        let start = format_ts(window.start);
        let end = format_ts(window.end);

        let mut cmd = Command::new(&self.program);
        cmd.args(self.render_args(&start, &end))
            .env("EVAL_WINDOW_START", &start)
            .env("EVAL_WINDOW_END", &end)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(program = %self.program, %window, "spawning evaluator");
        let output = cmd
            .output()
            .await
            .map_err(|e| EvaluationError::failed(format!("failed to spawn {}: {e}", self.program)))?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(stdout
                .lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(EvaluationError::failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )))
        }
    }
}
