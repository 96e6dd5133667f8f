//! Executable nodes.
//!
//! An [`ExecutableNode`] is a graph node with external side effects, such as
//! writing a file or launching a renderer. Besides executing, it answers two
//! questions a dispatcher needs: which upstream work must finish first
//! ([`ExecutableNode::execution_requirements`]), and what fingerprint the side
//! effect carries ([`ExecutableNode::execution_hash`]).
//!
//! Requirements are wired through [`Requirements`], an array input that only
//! accepts the [`RequirementOutput`] of another executable node. The check
//! happens while the graph is being built, dispatch never looks at it again.

use std::sync::{Arc, PoisonError, RwLock};

use crate::context::Context;
use crate::core::{ArcStr, ExecutionHash};
use crate::error::GraphError;
use crate::plug::Plugs;
use crate::registry::Registry;
use crate::task::Task;

/// Name of the compound holding per-dispatcher settings on every node.
pub const DISPATCHER: &str = "dispatcher";

pub trait ExecutableNode: Send + Sync {
    fn base(&self) -> &ExecutableBase;

    fn name(&self) -> &str {
        self.base().name()
    }

    /// Tasks which must be completed before this node can execute under
    /// `context`. The default returns one task per connected requirement,
    /// evaluated under the same context.
    ///
    /// Overrides may remap the context, e.g. expanding a requirement across a
    /// frame range. They must not construct cycles.
    fn execution_requirements(&self, context: &Context) -> Vec<Task> {
        self.base().requirements().tasks(context)
    }

    /// Fingerprint of the side effects of executing under `context`.
    ///
    /// Must be pure and deterministic. Equal digests assert interchangeable
    /// side effects. [`ExecutionHash::Null`] means the side effect can't be
    /// represented, and the task will never be merged with another.
    fn execution_hash(&self, context: &Context) -> ExecutionHash;

    /// Performs the side effect for every context, in order. Either the whole
    /// batch succeeds or an error is returned, so a failed call can be retried
    /// as a whole.
    fn execute(&self, contexts: &[Context]) -> anyhow::Result<()>;
}

/// State shared by every executable node: its name, its requirement inputs
/// and its configuration slots.
pub struct ExecutableBase {
    name: ArcStr,
    requirements: Requirements,
    plugs: Plugs,
}

impl ExecutableBase {
    /// Creates the base of a new node, letting every registered dispatcher
    /// install its slots under [`DISPATCHER`].
    pub fn new(name: impl AsRef<str>, registry: &Registry) -> Self {
        Self::restore(name, Plugs::new(), registry)
    }

    /// Same as [`ExecutableBase::new`], for a node whose slots were saved
    /// earlier. Restored values are kept.
    pub fn restore(name: impl AsRef<str>, mut plugs: Plugs, registry: &Registry) -> Self {
        let name = ArcStr::from(name.as_ref());
        registry.setup_plugs(plugs.ensure_compound(DISPATCHER));

        Self {
            requirements: Requirements::new(name.clone()),
            name,
            plugs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn requirements(&self) -> &Requirements {
        &self.requirements
    }

    pub fn plugs(&self) -> &Plugs {
        &self.plugs
    }

    pub fn plugs_mut(&mut self) -> &mut Plugs {
        &mut self.plugs
    }

    /// Slots installed by the dispatcher registered under `name`.
    pub fn dispatcher_plugs(&self, name: &str) -> Option<&Plugs> {
        self.plugs.compound(DISPATCHER)?.compound(name)
    }
}

/// The output of an executable node, the only thing a [`Requirements`] input
/// can be connected to.
#[derive(Clone)]
pub struct RequirementOutput {
    node: Arc<dyn ExecutableNode>,
}

impl RequirementOutput {
    pub fn of(node: Arc<dyn ExecutableNode>) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &Arc<dyn ExecutableNode> {
        &self.node
    }
}

/// Anything that could be plugged into an input.
pub enum PlugInput {
    Requirement(RequirementOutput),
    /// An output of some other, non-executable node.
    Plug { node: String, plug: String },
}

type Slot = Option<Arc<dyn ExecutableNode>>;

/// Array input of upstream executable nodes.
pub struct Requirements {
    node: ArcStr,
    slots: RwLock<Vec<Slot>>,
}

impl Requirements {
    fn new(node: ArcStr) -> Self {
        Self {
            node,
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Whether `input` may be connected here.
    pub fn accepts_input(&self, input: &PlugInput) -> bool {
        matches!(input, PlugInput::Requirement(_))
    }

    /// Connects `output` to the first empty slot, growing the array when all
    /// are taken. Returns the slot index.
    pub fn connect(&self, output: RequirementOutput) -> usize {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);

        match slots.iter().position(Option::is_none) {
            Some(index) => {
                slots[index] = Some(output.node);
                index
            }
            None => {
                slots.push(Some(output.node));
                slots.len() - 1
            }
        }
    }

    /// Connects `input` to slot `index`, which may be at most one past the
    /// last slot.
    pub fn set_input(&self, index: usize, input: PlugInput) -> Result<(), GraphError> {
        let output = match input {
            PlugInput::Requirement(output) => output,
            PlugInput::Plug { node, plug } => {
                return Err(GraphError::RejectedInput {
                    node: self.node.to_string(),
                    source_node: node,
                    source_plug: plug,
                });
            }
        };

        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);

        match index.cmp(&slots.len()) {
            std::cmp::Ordering::Less => slots[index] = Some(output.node),
            std::cmp::Ordering::Equal => slots.push(Some(output.node)),
            std::cmp::Ordering::Greater => {
                return Err(GraphError::NoSuchInput {
                    node: self.node.to_string(),
                    index,
                });
            }
        }

        Ok(())
    }

    /// Empties slot `index`, returning what was connected.
    pub fn disconnect(&self, index: usize) -> Result<Option<Arc<dyn ExecutableNode>>, GraphError> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);

        match slots.get_mut(index) {
            Some(slot) => Ok(slot.take()),
            None => Err(GraphError::NoSuchInput {
                node: self.node.to_string(),
                index,
            }),
        }
    }

    /// Connected upstream nodes in slot order, empty slots skipped.
    pub fn inputs(&self) -> Vec<Arc<dyn ExecutableNode>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn tasks(&self, context: &Context) -> Vec<Task> {
        self.inputs()
            .into_iter()
            .map(|node| Task::new(node, context.clone()))
            .collect()
    }
}
