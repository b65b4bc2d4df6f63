//! Environment of the external command.
//!
//! The orchestrator never touches the process environment. It publishes the
//! reattach information through a [`WorkingDir`], which owns the environment
//! the external command will be started with. Sessions sharing one
//! `WorkingDir` must not run concurrently.

use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    ffi::OsStr,
    path::{Path, PathBuf},
};
use tokio::process::Command;

/// The working directory collaborator of a test session.
pub trait WorkingDir: Send + Sync {
    /// Full plugin name, e.g. `terraform-provider-foo`.
    fn plugin_name(&self) -> &str;

    fn setenv(&self, key: &str, value: &str);

    fn unsetenv(&self, key: &str);
}

/// A [`WorkingDir`] that keeps its variables in memory and applies them to
/// every command it builds.
#[derive(Debug)]
pub struct CommandEnv {
    plugin_name: String,
    dir: Option<PathBuf>,
    vars: Mutex<BTreeMap<String, String>>,
}

impl CommandEnv {
    pub fn new(plugin_name: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            dir: None,
            vars: Mutex::new(BTreeMap::new()),
        }
    }

    /// Runs commands from `dir` instead of the current directory.
    #[must_use]
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.vars.lock().get(key).cloned()
    }

    /// A snapshot of every variable currently set.
    pub fn vars(&self) -> BTreeMap<String, String> {
        self.vars.lock().clone()
    }

    /// Builds a command for `program` carrying the current variables on top
    /// of the inherited environment.
    pub fn command<I, S>(&self, program: impl AsRef<OsStr>, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(program);
        command.args(args).envs(self.vars());
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }
        command
    }
}

impl WorkingDir for CommandEnv {
    fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    fn setenv(&self, key: &str, value: &str) {
        self.vars.lock().insert(key.to_string(), value.to_string());
    }

    fn unsetenv(&self, key: &str) {
        self.vars.lock().remove(key);
    }
}
