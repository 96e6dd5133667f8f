//! The dispatching service.
//!
//! A [`Registry`] owns every named [`Dispatcher`] of the process and the two
//! notification streams fired around each dispatch. It is meant to be built
//! once during a single-threaded startup phase, registering dispatchers and
//! subscribing observers, and only then shared for dispatching. Registration
//! and subscription take `&mut self`, so that contract is checked by the
//! borrow checker rather than by locks.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;

use tracing::{info, warn};

use crate::context::Context;
use crate::dispatcher::{Dispatch, Dispatcher};
use crate::error::DispatchError;
use crate::node::ExecutableNode;
use crate::plug::Plugs;

type DispatchSlot = Box<dyn Fn(&dyn Dispatcher, &[Arc<dyn ExecutableNode>]) + Send + Sync>;

/// Handle identifying one subscriber of a [`DispatchSignal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// Broadcast channel notifying every subscriber of a dispatch.
#[derive(Default)]
pub struct DispatchSignal {
    slots: Vec<(Subscription, DispatchSlot)>,
    next: u64,
}

impl DispatchSignal {
    /// Subscribes `slot`, which is called with the dispatcher and the root
    /// nodes of every dispatch.
    pub fn connect<F>(&mut self, slot: F) -> Subscription
    where
        F: Fn(&dyn Dispatcher, &[Arc<dyn ExecutableNode>]) + Send + Sync + 'static,
    {
        let subscription = Subscription(self.next);
        self.next += 1;
        self.slots.push((subscription, Box::new(slot)));
        subscription
    }

    pub fn disconnect(&mut self, subscription: Subscription) -> bool {
        let len = self.slots.len();
        self.slots.retain(|(s, _)| *s != subscription);
        self.slots.len() != len
    }

    /// Calls every subscriber, in subscription order.
    pub fn emit(&self, dispatcher: &dyn Dispatcher, nodes: &[Arc<dyn ExecutableNode>]) {
        for (_, slot) in &self.slots {
            slot(dispatcher, nodes);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl std::fmt::Debug for DispatchSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DispatchSignal({} slots)", self.slots.len())
    }
}

/// Process-wide registry of named dispatchers and dispatch notifications.
#[derive(Default)]
pub struct Registry {
    dispatchers: BTreeMap<String, Arc<dyn Dispatcher>>,
    pre_dispatch: DispatchSignal,
    post_dispatch: DispatchSignal,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `dispatcher` under `name`, replacing and returning any
    /// dispatcher registered under the same name before.
    pub fn register<D>(&mut self, name: impl Into<String>, dispatcher: D) -> Option<Arc<dyn Dispatcher>>
    where
        D: Dispatcher + 'static,
    {
        self.dispatchers.insert(name.into(), Arc::new(dispatcher))
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Dispatcher>, DispatchError> {
        self.dispatchers
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownDispatcher(name.to_string()))
    }

    /// Names of all registered dispatchers, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.dispatchers.keys().map(String::as_str).collect()
    }

    /// Notified right before any dispatcher starts dispatching.
    pub fn pre_dispatch(&mut self) -> &mut DispatchSignal {
        &mut self.pre_dispatch
    }

    /// Notified after any dispatcher finished dispatching, whether it
    /// succeeded or not.
    pub fn post_dispatch(&mut self) -> &mut DispatchSignal {
        &mut self.post_dispatch
    }

    /// Lets every registered dispatcher install its slots on a node, each in
    /// a compound named after its registration name.
    pub fn setup_plugs(&self, plugs: &mut Plugs) {
        for (name, dispatcher) in &self.dispatchers {
            dispatcher.setup_plugs(plugs.ensure_compound(name.as_str()));
        }
    }

    /// Dispatches `nodes` with the dispatcher registered under `name`, under
    /// the current context.
    ///
    /// The pre-dispatch notification fires before the dispatcher runs and the
    /// post-dispatch notification fires after it, even when it fails or
    /// panics. The failure reaches the caller only once post-dispatch fired.
    pub fn dispatch(&self, name: &str, nodes: &[Arc<dyn ExecutableNode>]) -> Result<(), DispatchError> {
        let dispatcher = self.lookup(name)?;
        let context = Context::current();

        info!(dispatcher = name, nodes = nodes.len(), "dispatching");
        self.pre_dispatch.emit(dispatcher.as_ref(), nodes);

        let request = Dispatch {
            name,
            context: &context,
            nodes,
        };
        let result = catch_unwind(AssertUnwindSafe(|| dispatcher.do_dispatch(&request)));

        self.post_dispatch.emit(dispatcher.as_ref(), nodes);

        match result {
            Ok(Ok(())) => {
                info!(dispatcher = name, "dispatch finished");
                Ok(())
            }
            Ok(Err(err)) => {
                warn!(dispatcher = name, "dispatch failed: {err}");
                Err(err)
            }
            Err(panic) => resume_unwind(panic),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("dispatchers", &self.dispatchers.keys().collect::<Vec<_>>())
            .field("pre_dispatch", &self.pre_dispatch)
            .field("post_dispatch", &self.post_dispatch)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;
    use crate::context::Value;
    use crate::dispatcher::JobSettings;
    use crate::nodes::FnNode;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recording {
        job: JobSettings,
        log: Log,
        fail: bool,
    }

    impl Recording {
        fn new(name: &str, log: &Log) -> Self {
            Self {
                job: JobSettings::new("jobs", name),
                log: log.clone(),
                fail: false,
            }
        }
    }

    impl Dispatcher for Recording {
        fn job(&self) -> &JobSettings {
            &self.job
        }

        fn do_dispatch(&self, request: &Dispatch) -> Result<(), DispatchError> {
            self.log.lock().unwrap().push(format!("dispatch {}", request.nodes.len()));
            if self.fail {
                return Err(anyhow::anyhow!("farm unreachable").into());
            }
            Ok(())
        }

        fn setup_plugs(&self, plugs: &mut Plugs) {
            plugs.ensure("priority", 50);
        }
    }

    fn observed(registry: &mut Registry, log: &Log) {
        let pre = log.clone();
        registry.pre_dispatch().connect(move |dispatcher, nodes| {
            pre.lock()
                .unwrap()
                .push(format!("pre {} {}", dispatcher.job().name, nodes.len()));
        });
        let post = log.clone();
        registry.post_dispatch().connect(move |dispatcher, nodes| {
            post.lock()
                .unwrap()
                .push(format!("post {} {}", dispatcher.job().name, nodes.len()));
        });
    }

    #[test]
    fn test_last_registration_wins() {
        let log = Log::default();
        let mut registry = Registry::new();

        assert!(registry.register("local", Recording::new("one", &log)).is_none());
        assert!(registry.register("local", Recording::new("two", &log)).is_some());
        registry.register("farm", Recording::new("farm", &log));

        assert_eq!(registry.lookup("local").unwrap().job().name, "two");
        assert_eq!(registry.names(), ["farm", "local"]);
    }

    #[test]
    fn test_unknown_dispatcher() {
        let log = Log::default();
        let mut registry = Registry::new();
        observed(&mut registry, &log);

        let err = registry.dispatch("missing", &[]).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownDispatcher(name) if name == "missing"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_signals_surround_dispatch() {
        let log = Log::default();
        let mut registry = Registry::new();
        registry.register("local", Recording::new("local", &log));
        observed(&mut registry, &log);

        let node: Arc<dyn ExecutableNode> = Arc::new(FnNode::builder("writer").build(&registry));
        registry.dispatch("local", &[node]).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            ["pre local 1", "dispatch 1", "post local 1"]
        );
    }

    #[test]
    fn test_post_dispatch_fires_on_failure() {
        let log = Log::default();
        let mut registry = Registry::new();
        let mut failing = Recording::new("local", &log);
        failing.fail = true;
        registry.register("local", failing);
        observed(&mut registry, &log);

        let err = registry.dispatch("local", &[]).unwrap_err();
        assert!(err.to_string().contains("farm unreachable"));
        assert_eq!(
            *log.lock().unwrap(),
            ["pre local 0", "dispatch 0", "post local 0"]
        );
    }

    #[test]
    fn test_post_dispatch_fires_on_panic() {
        struct Panicking(JobSettings);

        impl Dispatcher for Panicking {
            fn job(&self) -> &JobSettings {
                &self.0
            }

            fn do_dispatch(&self, _: &Dispatch) -> Result<(), DispatchError> {
                panic!("boom");
            }

            fn setup_plugs(&self, _: &mut Plugs) {}
        }

        let log = Log::default();
        let mut registry = Registry::new();
        registry.register("local", Panicking(JobSettings::new("jobs", "local")));
        observed(&mut registry, &log);

        let result = catch_unwind(AssertUnwindSafe(|| registry.dispatch("local", &[])));
        assert!(result.is_err());
        assert_eq!(*log.lock().unwrap(), ["pre local 0", "post local 0"]);
    }

    #[test]
    fn test_disconnect() {
        let mut signal = DispatchSignal::default();
        let a = signal.connect(|_, _| {});
        let b = signal.connect(|_, _| {});

        assert!(signal.disconnect(a));
        assert!(!signal.disconnect(a));
        assert_eq!(signal.len(), 1);
        assert!(signal.disconnect(b));
        assert!(signal.is_empty());
    }

    #[test]
    fn test_setup_plugs_per_dispatcher() {
        let log = Log::default();
        let mut registry = Registry::new();
        registry.register("local", Recording::new("local", &log));
        registry.register("farm", Recording::new("farm", &log));

        let mut plugs = Plugs::new();
        plugs.ensure_compound("farm").set("priority", 10);
        registry.setup_plugs(&mut plugs);

        assert_eq!(plugs.lookup("local.priority"), Some(&Value::Int(50)));
        assert_eq!(plugs.lookup("farm.priority"), Some(&Value::Int(10)));
    }
}
