//! Flattening and deduplication of a requirement forest.
//!
//! [`unique_tasks`] walks the requirement graph reachable from a set of root
//! tasks and produces one [`TaskDescription`] per distinct side effect:
//!
//! * Tasks sharing a non-null execution hash collapse into a single record,
//!   whose requirements are the union of the requirements of every occurrence.
//! * Tasks with a null hash always get a record of their own.
//! * Records are ordered so that every requirement of record `i` sits at an
//!   index below `i`, which makes the output consumable front to back.
//!
//! Merging occurrences reached through different paths assumes that an equal
//! final hash makes any superset of the combined requirements a sufficient
//! precondition. This is a policy of the dispatching model, not something
//! derived here.
//!
//! The walk is iterative, so long requirement chains can't overflow the stack,
//! and it fails with [`DispatchError::Cycle`] on cyclic input.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::ops::Index;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{Graph, NodeIndex};
use tracing::debug;

use crate::core::Hash32;
use crate::error::DispatchError;
use crate::task::Task;

/// A deduplicated unit of work: one representative task and the records it
/// requires.
#[derive(Debug, Clone)]
pub struct TaskDescription {
    pub task: Task,
    /// Indices of required records within the owning [`TaskDescriptions`].
    pub requirements: BTreeSet<usize>,
}

/// Ordered output of [`unique_tasks`].
#[derive(Debug, Clone, Default)]
pub struct TaskDescriptions {
    records: Vec<TaskDescription>,
}

impl TaskDescriptions {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TaskDescription> {
        self.records.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TaskDescription> {
        self.records.iter()
    }

    /// The tasks required by record `index`.
    pub fn requirements(&self, index: usize) -> impl Iterator<Item = &Task> {
        self.records
            .get(index)
            .into_iter()
            .flat_map(|record| record.requirements.iter())
            .filter_map(|&i| self.records.get(i))
            .map(|record| &record.task)
    }

    /// The records as a graph, with an edge from every requirement to the
    /// record requiring it. Node `i` corresponds to record `i`.
    pub fn graph(&self) -> Graph<usize, ()> {
        graph_of(&self.records)
    }

    pub fn into_vec(self) -> Vec<TaskDescription> {
        self.records
    }
}

impl Index<usize> for TaskDescriptions {
    type Output = TaskDescription;

    fn index(&self, index: usize) -> &Self::Output {
        &self.records[index]
    }
}

impl<'a> IntoIterator for &'a TaskDescriptions {
    type Item = &'a TaskDescription;
    type IntoIter = std::slice::Iter<'a, TaskDescription>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Renders the records as a Mermaid diagram.
impl Display for TaskDescriptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for (index, record) in self.records.iter().enumerate() {
            let name = record.task.name().replace('"', "\\\"");
            let hash = match record.task.hash().digest() {
                Some(hash) => hash.to_hex()[..8].to_string(),
                None => "null".to_string(),
            };
            writeln!(f, "    {index}[\"{name} ({hash})\"]")?;
        }

        for (index, record) in self.records.iter().enumerate() {
            for requirement in &record.requirements {
                writeln!(f, "    {requirement} --> {index}")?;
            }
        }

        Ok(())
    }
}

/// Node identity plus context fingerprint, used to spot cycles and repeated
/// visits regardless of the execution hash.
type Identity = (usize, Hash32);

fn identity(task: &Task) -> Identity {
    let node = Arc::as_ptr(task.node()) as *const () as usize;
    (node, task.context().hash())
}

enum Step {
    Enter(Task),
    Exit { task: Task, count: usize },
}

/// Flattens the requirement graph of `tasks` into deduplicated records.
pub fn unique_tasks(tasks: &[Task]) -> Result<TaskDescriptions, DispatchError> {
    let mut records: Vec<TaskDescription> = Vec::new();
    // execution hash -> record
    let mut seen: HashMap<Hash32, usize> = HashMap::new();
    // fully resolved non-null tasks, requirements can't change on a revisit;
    // holding the task keeps its node address from being reused
    let mut done: HashMap<Identity, (Task, usize)> = HashMap::new();

    let mut path: HashSet<Identity> = HashSet::new();
    let mut path_hashes: HashSet<Hash32> = HashSet::new();

    let mut resolved: Vec<usize> = Vec::new();
    let mut stack: Vec<Step> = tasks.iter().rev().cloned().map(Step::Enter).collect();

    while let Some(step) = stack.pop() {
        match step {
            Step::Enter(task) => {
                let id = identity(&task);
                let digest = task.hash().digest();

                if path.contains(&id) || digest.is_some_and(|hash| path_hashes.contains(&hash)) {
                    return Err(DispatchError::Cycle(task.name().to_string()));
                }

                if digest.is_some()
                    && let Some((seen_task, index)) = done.get(&id)
                    && seen_task.hash() == task.hash()
                {
                    resolved.push(*index);
                    continue;
                }

                path.insert(id);
                if let Some(hash) = digest {
                    path_hashes.insert(hash);
                }

                let requirements = task.requirements();
                stack.push(Step::Exit {
                    task,
                    count: requirements.len(),
                });
                stack.extend(requirements.into_iter().rev().map(Step::Enter));
            }
            Step::Exit { task, count } => {
                let requirements: BTreeSet<usize> =
                    resolved.split_off(resolved.len() - count).into_iter().collect();

                let id = identity(&task);
                let digest = task.hash().digest();

                path.remove(&id);
                if let Some(hash) = digest {
                    path_hashes.remove(&hash);
                }

                let memo = digest.map(|_| task.clone());

                let index = match digest.and_then(|hash| seen.get(&hash).copied()) {
                    Some(index) => {
                        debug!(task = task.name(), record = index, "merging task into existing record");
                        records[index].requirements.extend(requirements);
                        index
                    }
                    None => {
                        let index = records.len();
                        debug!(task = task.name(), record = index, "new task record");
                        records.push(TaskDescription { task, requirements });
                        if let Some(hash) = digest {
                            seen.insert(hash, index);
                        }
                        index
                    }
                };

                if let Some(task) = memo {
                    done.insert(id, (task, index));
                }
                resolved.push(index);
            }
        }
    }

    Ok(TaskDescriptions {
        records: order(records)?,
    })
}

fn graph_of(records: &[TaskDescription]) -> Graph<usize, ()> {
    let mut graph = Graph::with_capacity(records.len(), 0);

    for index in 0..records.len() {
        graph.add_node(index);
    }

    for (index, record) in records.iter().enumerate() {
        for &requirement in &record.requirements {
            graph.add_edge(NodeIndex::new(requirement), NodeIndex::new(index), ());
        }
    }

    graph
}

/// Merging can attach a record created later as a requirement of an earlier
/// one. Reorders records so requirements always come first, keeping the
/// original order wherever possible.
fn order(records: Vec<TaskDescription>) -> Result<Vec<TaskDescription>, DispatchError> {
    let sorted = records
        .iter()
        .enumerate()
        .all(|(index, record)| record.requirements.iter().all(|&r| r < index));

    if sorted {
        return Ok(records);
    }

    let graph = graph_of(&records);

    if let Err(cycle) = toposort(&graph, None) {
        let name = records[cycle.node_id().index()].task.name().to_string();
        return Err(DispatchError::Cycle(name));
    }

    let mut pending: Vec<usize> = records.iter().map(|r| r.requirements.len()).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = pending
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(index, _)| Reverse(index))
        .collect();

    let mut position = vec![0; records.len()];
    let mut next = 0;

    while let Some(Reverse(index)) = ready.pop() {
        position[index] = next;
        next += 1;

        for dependent in graph.neighbors_directed(NodeIndex::new(index), Direction::Outgoing) {
            let dependent = dependent.index();
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    let mut records: Vec<(usize, TaskDescription)> = records
        .into_iter()
        .enumerate()
        .map(|(index, mut record)| {
            record.requirements = record.requirements.iter().map(|&r| position[r]).collect();
            (position[index], record)
        })
        .collect();

    records.sort_by_key(|(position, _)| *position);

    Ok(records.into_iter().map(|(_, record)| record).collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::Context;
    use crate::core::ExecutionHash;
    use crate::node::{ExecutableNode, RequirementOutput};
    use crate::nodes::FnNode;
    use crate::registry::Registry;

    fn node(registry: &Registry, name: &str) -> Arc<dyn ExecutableNode> {
        Arc::new(FnNode::builder(name).build(registry))
    }

    fn require(node: &Arc<dyn ExecutableNode>, upstream: &Arc<dyn ExecutableNode>) {
        node.base()
            .requirements()
            .connect(RequirementOutput::of(upstream.clone()));
    }

    fn names(descriptions: &TaskDescriptions) -> Vec<&str> {
        descriptions.iter().map(|r| r.task.name()).collect()
    }

    fn position(descriptions: &TaskDescriptions, name: &str) -> usize {
        descriptions
            .iter()
            .position(|r| r.task.name() == name)
            .unwrap()
    }

    fn assert_consumable(descriptions: &TaskDescriptions) {
        for (index, record) in descriptions.iter().enumerate() {
            for &requirement in &record.requirements {
                assert!(requirement < index, "record {index} requires later record {requirement}");
            }
        }
    }

    #[test]
    fn test_chain() {
        let registry = Registry::new();
        let a = node(&registry, "a");
        let b = node(&registry, "b");
        let c = node(&registry, "c");
        require(&c, &b);
        require(&b, &a);

        let descriptions = unique_tasks(&[Task::new(c, Context::new())]).unwrap();

        assert_eq!(names(&descriptions), ["a", "b", "c"]);
        assert!(descriptions[0].requirements.is_empty());
        assert_eq!(descriptions[1].requirements, BTreeSet::from([0]));
        assert_eq!(descriptions[2].requirements, BTreeSet::from([1]));
    }

    #[test]
    fn test_shared_requirement() {
        let registry = Registry::new();
        let s = node(&registry, "s");
        let x = node(&registry, "x");
        let y = node(&registry, "y");
        require(&x, &s);
        require(&y, &s);

        let context = Context::new().with_frame(1.0);
        let descriptions = unique_tasks(&[
            Task::new(x, context.clone()),
            Task::new(y, context.clone()),
        ])
        .unwrap();

        assert_eq!(names(&descriptions), ["s", "x", "y"]);
        let s = position(&descriptions, "s");
        assert_eq!(descriptions[position(&descriptions, "x")].requirements, BTreeSet::from([s]));
        assert_eq!(descriptions[position(&descriptions, "y")].requirements, BTreeSet::from([s]));
    }

    #[test]
    fn test_null_hash_never_merges() {
        let registry = Registry::new();
        let z: Arc<dyn ExecutableNode> = Arc::new(
            FnNode::builder("z")
                .hash(|_| ExecutionHash::Null)
                .build(&registry),
        );

        let c1 = Context::new().with_frame(1.0);
        let c2 = Context::new().with_frame(2.0);

        let descriptions =
            unique_tasks(&[Task::new(z.clone(), c1.clone()), Task::new(z.clone(), c2)]).unwrap();
        assert_eq!(descriptions.len(), 2);

        // even the very same node and context
        let descriptions =
            unique_tasks(&[Task::new(z.clone(), c1.clone()), Task::new(z, c1)]).unwrap();
        assert_eq!(descriptions.len(), 2);
    }

    #[test]
    fn test_null_hash_requirements_stay_distinct() {
        let registry = Registry::new();
        let z: Arc<dyn ExecutableNode> = Arc::new(
            FnNode::builder("z")
                .hash(|_| ExecutionHash::Null)
                .build(&registry),
        );

        // requires z twice under the same context
        let upstream = z.clone();
        let w: Arc<dyn ExecutableNode> = Arc::new(
            FnNode::builder("w")
                .requirements(move |context| {
                    vec![
                        Task::new(upstream.clone(), context.clone()),
                        Task::new(upstream.clone(), context.clone()),
                    ]
                })
                .build(&registry),
        );

        let descriptions = unique_tasks(&[Task::new(w, Context::new())]).unwrap();

        assert_eq!(names(&descriptions), ["z", "z", "w"]);
        assert_eq!(descriptions[2].requirements, BTreeSet::from([0, 1]));
    }

    #[test]
    fn test_merged_requirements_are_unioned() {
        let registry = Registry::new();
        let r1 = node(&registry, "r1");
        let r2 = node(&registry, "r2");

        // two distinct nodes sharing one side effect, with different requirements
        let n1: Arc<dyn ExecutableNode> = Arc::new(
            FnNode::builder("n1")
                .hash(|_| ExecutionHash::of("shared"))
                .build(&registry),
        );
        let n2: Arc<dyn ExecutableNode> = Arc::new(
            FnNode::builder("n2")
                .hash(|_| ExecutionHash::of("shared"))
                .build(&registry),
        );
        require(&n1, &r1);
        require(&n2, &r2);
        require(&n2, &r1);

        let context = Context::new();
        let descriptions =
            unique_tasks(&[Task::new(n1, context.clone()), Task::new(n2, context)]).unwrap();

        assert_eq!(descriptions.len(), 3);
        let merged = position(&descriptions, "n1");
        let expected = BTreeSet::from([position(&descriptions, "r1"), position(&descriptions, "r2")]);
        assert_eq!(descriptions[merged].requirements, expected);
        assert_consumable(&descriptions);
    }

    #[test]
    fn test_late_requirement_reorders() {
        let registry = Registry::new();
        let w = node(&registry, "w");
        let s1: Arc<dyn ExecutableNode> = Arc::new(
            FnNode::builder("s1")
                .hash(|_| ExecutionHash::of("s"))
                .build(&registry),
        );
        let s2: Arc<dyn ExecutableNode> = Arc::new(
            FnNode::builder("s2")
                .hash(|_| ExecutionHash::of("s"))
                .build(&registry),
        );
        let x = node(&registry, "x");
        let y = node(&registry, "y");
        require(&s2, &w);
        require(&x, &s1);
        require(&y, &s2);

        let context = Context::new();
        let descriptions =
            unique_tasks(&[Task::new(x, context.clone()), Task::new(y, context)]).unwrap();

        // s1 was recorded first but picked up w through s2
        assert_eq!(names(&descriptions), ["w", "s1", "x", "y"]);
        assert_eq!(descriptions[1].requirements, BTreeSet::from([0]));
        assert_consumable(&descriptions);
    }

    #[test]
    fn test_diamond_lattice_stays_small() {
        let registry = Registry::new();
        let mut level = vec![node(&registry, "base")];

        for depth in 0..24 {
            let next: Vec<_> = (0..2)
                .map(|i| node(&registry, &format!("n{depth}_{i}")))
                .collect();
            for n in &next {
                for upstream in &level {
                    require(n, upstream);
                }
            }
            level = next;
        }

        let roots: Vec<_> = level
            .into_iter()
            .map(|n| Task::new(n, Context::new()))
            .collect();
        let descriptions = unique_tasks(&roots).unwrap();

        assert_eq!(descriptions.len(), 1 + 24 * 2);
        assert_consumable(&descriptions);
    }

    #[test]
    fn test_frame_range_expansion() {
        let registry = Registry::new();
        let cache = node(&registry, "cache");

        let upstream = cache.clone();
        let render: Arc<dyn ExecutableNode> = Arc::new(
            FnNode::builder("render")
                .requirements(move |context| {
                    (1..=3)
                        .map(|frame| Task::new(upstream.clone(), context.with_frame(frame as f64)))
                        .collect()
                })
                .build(&registry),
        );

        let descriptions = unique_tasks(&[
            Task::new(render.clone(), Context::new().with_frame(1.0)),
            Task::new(render, Context::new().with_frame(2.0)),
        ])
        .unwrap();

        // three cache frames shared by two render frames
        assert_eq!(names(&descriptions), ["cache", "cache", "cache", "render", "render"]);
        assert_eq!(descriptions[3].requirements, BTreeSet::from([0, 1, 2]));
        assert_eq!(descriptions[4].requirements, BTreeSet::from([0, 1, 2]));
    }

    #[test]
    fn test_cycle_fails_fast() {
        let registry = Registry::new();
        let a = node(&registry, "a");
        let b = node(&registry, "b");
        require(&a, &b);
        require(&b, &a);

        let err = unique_tasks(&[Task::new(a, Context::new())]).unwrap_err();
        assert!(matches!(err, DispatchError::Cycle(_)));
    }

    #[test]
    fn test_cycle_created_by_merging() {
        let registry = Registry::new();
        let x: Arc<dyn ExecutableNode> = Arc::new(
            FnNode::builder("x")
                .hash(|_| ExecutionHash::of("h"))
                .build(&registry),
        );
        let w: Arc<dyn ExecutableNode> = Arc::new(
            FnNode::builder("w")
                .hash(|_| ExecutionHash::of("h"))
                .build(&registry),
        );
        let v = node(&registry, "v");
        require(&v, &x);
        require(&w, &v);

        // x and w collapse into one record which both requires and is required by v
        let context = Context::new();
        let err = unique_tasks(&[Task::new(v, context.clone()), Task::new(w, context)]).unwrap_err();
        assert!(matches!(err, DispatchError::Cycle(_)));
    }

    #[test]
    fn test_transient_nodes_keep_their_records() {
        let registry = Arc::new(Registry::new());
        let shared: Arc<dyn ExecutableNode> = Arc::new(
            FnNode::builder("shared")
                .hash(|_| ExecutionHash::of("s"))
                .build(&registry),
        );
        let p = node(&registry, "p");
        require(&p, &shared);

        // nodes built on the fly are dropped as soon as the walk is done with them
        let transient = registry.clone();
        let q: Arc<dyn ExecutableNode> = Arc::new(
            FnNode::builder("q")
                .requirements(move |context| {
                    let node: Arc<dyn ExecutableNode> = Arc::new(
                        FnNode::builder("copy")
                            .hash(|_| ExecutionHash::of("s"))
                            .build(&transient),
                    );
                    vec![Task::new(node, context.clone())]
                })
                .build(&registry),
        );

        let transient = registry.clone();
        let u: Arc<dyn ExecutableNode> = Arc::new(
            FnNode::builder("u")
                .requirements(move |context| {
                    let node: Arc<dyn ExecutableNode> = Arc::new(
                        FnNode::builder("fresh")
                            .hash(|_| ExecutionHash::of("fresh"))
                            .build(&transient),
                    );
                    vec![Task::new(node, context.clone())]
                })
                .build(&registry),
        );

        let context = Context::new();
        let descriptions = unique_tasks(&[
            Task::new(p, context.clone()),
            Task::new(q, context.clone()),
            Task::new(u, context),
        ])
        .unwrap();

        assert_eq!(names(&descriptions), ["shared", "p", "q", "fresh", "u"]);
        let fresh = position(&descriptions, "fresh");
        let u = position(&descriptions, "u");
        assert_eq!(descriptions[u].requirements, BTreeSet::from([fresh]));
        assert_consumable(&descriptions);
    }

    #[test]
    fn test_null_hash_cycle_fails_fast() {
        let registry = Registry::new();
        let a: Arc<dyn ExecutableNode> = Arc::new(
            FnNode::builder("a")
                .hash(|_| ExecutionHash::Null)
                .build(&registry),
        );
        require(&a, &a);

        let err = unique_tasks(&[Task::new(a, Context::new())]).unwrap_err();
        assert!(matches!(err, DispatchError::Cycle(name) if name == "a"));
    }

    #[test]
    fn test_empty_roots() {
        let descriptions = unique_tasks(&[]).unwrap();
        assert!(descriptions.is_empty());
    }

    #[test]
    fn test_mermaid() {
        let registry = Registry::new();
        let a = node(&registry, "a");
        let b = node(&registry, "b");
        require(&b, &a);

        let descriptions = unique_tasks(&[Task::new(b, Context::new())]).unwrap();
        let diagram = descriptions.to_string();

        assert!(diagram.starts_with("graph LR\n"));
        assert!(diagram.contains("    0 --> 1\n"));
        assert_eq!(descriptions.requirements(1).map(Task::name).collect::<Vec<_>>(), ["a"]);
    }
}
