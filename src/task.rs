use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crate::context::Context;
use crate::core::{ExecutionHash, Hash32};
use crate::node::ExecutableNode;

static NEXT_UNIQUE: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
enum TaskKey {
    Digest(Hash32),
    Unique(u64),
}

/// One potential unit of dispatched work: a node evaluated under a context.
///
/// The execution hash is computed once, on construction, and is the sole
/// identity of the task. Equality, ordering and hashing all go through it, so
/// two tasks are "the same" exactly when they would collapse into the same
/// record. Tasks with a null hash get a process-unique identity instead: a
/// clone still equals its original, but two separately constructed null-hash
/// tasks never compare equal, even for the same node and context.
#[derive(Clone)]
pub struct Task {
    node: Arc<dyn ExecutableNode>,
    context: Context,
    hash: ExecutionHash,
    key: TaskKey,
}

impl Task {
    pub fn new(node: Arc<dyn ExecutableNode>, context: Context) -> Self {
        let hash = node.execution_hash(&context);
        let key = match hash {
            ExecutionHash::Digest(digest) => TaskKey::Digest(digest),
            ExecutionHash::Null => TaskKey::Unique(NEXT_UNIQUE.fetch_add(1, AtomicOrdering::Relaxed)),
        };

        Self {
            node,
            context,
            hash,
            key,
        }
    }

    pub fn node(&self) -> &Arc<dyn ExecutableNode> {
        &self.node
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The node's execution hash under this task's context.
    pub fn hash(&self) -> ExecutionHash {
        self.hash
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// Requirements of this task, as declared by its node.
    pub fn requirements(&self) -> Vec<Task> {
        self.node.execution_requirements(&self.context)
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("node", &self.node.name())
            .field("context", &self.context)
            .field("hash", &self.hash)
            .finish()
    }
}
