#![forbid(unsafe_code)]
//! Dispatching of executable graph nodes.
//!
//! Nodes implementing [`ExecutableNode`] declare what they require under a
//! given [`Context`] and fingerprint the side effect they would produce with
//! an [`ExecutionHash`]. Dispatching a set of root nodes flattens everything
//! they require into an ordered list of unique [`Task`]s with
//! [`unique_tasks`], so work shared between roots is done exactly once, and
//! hands it to a [`Dispatcher`] strategy registered by name in a
//! [`Registry`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use okuri::{CommandNode, Context, ExecutableNode, JobSettings, LocalDispatcher, Registry};
//!
//! let mut registry = Registry::new();
//! registry.register("local", LocalDispatcher::new(JobSettings::default()));
//! registry.pre_dispatch().connect(|_, nodes| println!("dispatching {} nodes", nodes.len()));
//!
//! let render: Arc<dyn ExecutableNode> =
//!     Arc::new(CommandNode::new("render", "render -f ${frame}", &registry));
//!
//! let _scope = Context::new().with_frame(12.0).scope();
//! registry.dispatch("local", &[render])?;
//! # Ok::<(), okuri::DispatchError>(())
//! ```

mod context;
mod core;
mod dispatcher;
mod error;
mod local;
mod node;
mod nodes;
mod plug;
mod registry;
mod task;
mod unique;

pub use crate::context::{Context, FRAME, Scope, Value};
pub use crate::core::{Blake3Hasher, ExecutionHash, Hash32};
pub use crate::dispatcher::{Dispatch, Dispatcher, DispatcherConfig, JobSettings};
pub use crate::error::*;
pub use crate::local::{BATCH_SIZE, LocalDispatcher};
pub use crate::node::{DISPATCHER, ExecutableBase, ExecutableNode, PlugInput, RequirementOutput, Requirements};
pub use crate::nodes::{CommandNode, FnNode, FnNodeBuilder};
pub use crate::plug::{Plug, Plugs};
pub use crate::registry::{DispatchSignal, Registry, Subscription};
pub use crate::task::Task;
pub use crate::unique::{TaskDescription, TaskDescriptions, unique_tasks};

/// Installs a global `tracing` subscriber printing to stderr, filtered with
/// `RUST_LOG` (`info` by default), with progress bars for dispatch spans.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()?;

    Ok(())
}
