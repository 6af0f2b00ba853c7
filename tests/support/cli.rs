#![allow(dead_code)]

use std::path::Path;
use std::process::Command;

use anyhow::Result;

use super::workspace::TestProject;

/// Runner for CLI commands against a test project
pub struct CliRunner<'a> {
    project: &'a TestProject,
    args: Vec<String>,
}

impl<'a> CliRunner<'a> {
    pub fn new(project: &'a TestProject) -> Self {
        Self {
            project,
            args: Vec::new(),
        }
    }

    /// `query <operation>`
    pub fn query(mut self, operation: &str) -> Self {
        self.args.extend(["query".into(), operation.into()]);
        self
    }

    /// Position target, `file:line:column`
    pub fn at_file(mut self, path: impl AsRef<Path>, line: u32, column: u32) -> Self {
        let full_path = self.project.path(path);
        self.args
            .push(format!("{}:{}:{}", full_path.display(), line, column));
        self
    }

    /// File target without a position
    pub fn for_file(mut self, path: impl AsRef<Path>) -> Self {
        let full_path = self.project.path(path);
        self.args.push(full_path.to_string_lossy().into_owned());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn run(self) -> Result<CliOutput> {
        let output = Command::new(TestProject::cli_bin())
            .args(&self.args)
            .arg("--project")
            .arg(self.project.root())
            .arg("--cache-dir")
            .arg(self.project.path(".clangaroo-cache"))
            .arg("--no-watch")
            .current_dir(self.project.root())
            .output()?;

        Ok(CliOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status,
        })
    }
}

/// Output from a CLI command
pub struct CliOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: std::process::ExitStatus,
}

impl CliOutput {
    pub fn assert_success(&self) -> &Self {
        assert!(
            self.status.success(),
            "Command failed with status {:?}\nstderr: {}\nstdout: {}",
            self.status,
            self.stderr,
            self.stdout
        );
        self
    }

    pub fn assert_exit_code(&self, code: i32) -> &Self {
        assert_eq!(
            self.status.code(),
            Some(code),
            "unexpected exit status\nstderr: {}\nstdout: {}",
            self.stderr,
            self.stdout
        );
        self
    }

    pub fn assert_stderr_contains(&self, needle: &str) -> &Self {
        assert!(
            self.stderr.contains(needle),
            "Expected stderr to contain '{}', got:\n{}",
            needle,
            self.stderr
        );
        self
    }

    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.stdout)?)
    }
}
