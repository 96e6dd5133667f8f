//! Ready-made executable nodes.

use std::process::Command;

use anyhow::{Context as _, bail};
use tracing::debug;

use crate::context::Context;
use crate::core::ExecutionHash;
use crate::node::{ExecutableBase, ExecutableNode};
use crate::plug::Plugs;
use crate::registry::Registry;
use crate::task::Task;

type HashFn = Box<dyn Fn(&Context) -> ExecutionHash + Send + Sync>;
type ExecuteFn = Box<dyn Fn(&[Context]) -> anyhow::Result<()> + Send + Sync>;
type RequirementsFn = Box<dyn Fn(&Context) -> Vec<Task> + Send + Sync>;

/// Executable node driven by closures.
///
/// Without any closures set, the node hashes its name together with the
/// context, executes nothing, and requires whatever is connected to its
/// requirement input.
pub struct FnNode {
    base: ExecutableBase,
    hash: Option<HashFn>,
    execute: Option<ExecuteFn>,
    requirements: Option<RequirementsFn>,
}

impl FnNode {
    pub fn builder(name: impl Into<String>) -> FnNodeBuilder {
        FnNodeBuilder {
            name: name.into(),
            plugs: Plugs::new(),
            hash: None,
            execute: None,
            requirements: None,
        }
    }
}

pub struct FnNodeBuilder {
    name: String,
    plugs: Plugs,
    hash: Option<HashFn>,
    execute: Option<ExecuteFn>,
    requirements: Option<RequirementsFn>,
}

impl FnNodeBuilder {
    pub fn hash<F>(mut self, hash: F) -> Self
    where
        F: Fn(&Context) -> ExecutionHash + Send + Sync + 'static,
    {
        self.hash = Some(Box::new(hash));
        self
    }

    pub fn execute<F>(mut self, execute: F) -> Self
    where
        F: Fn(&[Context]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.execute = Some(Box::new(execute));
        self
    }

    /// Replaces the default requirements, e.g. to remap the context.
    pub fn requirements<F>(mut self, requirements: F) -> Self
    where
        F: Fn(&Context) -> Vec<Task> + Send + Sync + 'static,
    {
        self.requirements = Some(Box::new(requirements));
        self
    }

    /// Configuration slots restored from saved state.
    pub fn plugs(mut self, plugs: Plugs) -> Self {
        self.plugs = plugs;
        self
    }

    pub fn build(self, registry: &Registry) -> FnNode {
        FnNode {
            base: ExecutableBase::restore(self.name, self.plugs, registry),
            hash: self.hash,
            execute: self.execute,
            requirements: self.requirements,
        }
    }
}

impl ExecutableNode for FnNode {
    fn base(&self) -> &ExecutableBase {
        &self.base
    }

    fn execution_requirements(&self, context: &Context) -> Vec<Task> {
        match &self.requirements {
            Some(requirements) => requirements(context),
            None => self.base.requirements().tasks(context),
        }
    }

    fn execution_hash(&self, context: &Context) -> ExecutionHash {
        match &self.hash {
            Some(hash) => hash(context),
            None => ExecutionHash::of(&(self.name(), context.hash())),
        }
    }

    fn execute(&self, contexts: &[Context]) -> anyhow::Result<()> {
        match &self.execute {
            Some(execute) => execute(contexts),
            None => Ok(()),
        }
    }
}

/// Runs a shell command once per context.
///
/// The command is a template expanded with [`Context::substitute`], so
/// `render -f ${frame}` runs with the frame of each context. The expanded
/// command line is the side effect fingerprint.
pub struct CommandNode {
    base: ExecutableBase,
    command: String,
}

impl CommandNode {
    pub fn new(name: impl AsRef<str>, command: impl Into<String>, registry: &Registry) -> Self {
        Self {
            base: ExecutableBase::new(name, registry),
            command: command.into(),
        }
    }

    pub fn command(&self, context: &Context) -> String {
        context.substitute(&self.command)
    }
}

impl ExecutableNode for CommandNode {
    fn base(&self) -> &ExecutableBase {
        &self.base
    }

    fn execution_hash(&self, context: &Context) -> ExecutionHash {
        ExecutionHash::of(&(self.name(), self.command(context)))
    }

    fn execute(&self, contexts: &[Context]) -> anyhow::Result<()> {
        for context in contexts {
            let command = self.command(context);
            debug!(node = self.name(), command = %command, "running command");

            let status = Command::new("sh")
                .arg("-c")
                .arg(&command)
                .status()
                .with_context(|| format!("Couldn't launch '{command}'"))?;

            if !status.success() {
                bail!("Command '{command}' failed with {status}");
            }
        }

        Ok(())
    }
}
