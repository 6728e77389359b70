//! Subscription consolidation and notification fan-out.
//!
//! Many logical subscriptions share few wire subscriptions. The manager keeps
//! a ledger of wire paths in which no entry covers another; a new listener
//! below an existing wire path costs nothing on the wire, and a listener
//! above existing wire paths replaces them with one.
//!
//! Notification is two-phase. [`SubscriptionManager::collect`] picks the
//! affected listeners and reads their data; [`Dispatch::deliver`] runs the
//! callbacks. Callers holding a store lock collect under it, release it, then
//! deliver, so callbacks may read the store and may subscribe or unsubscribe.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use tracing::debug;
use treesync_protocol::Path;

/// Identifies one listener within its path.
pub type ListenerId = u64;

/// A listener callback. Receives the listener's path and the delivered data.
pub type Callback<D> = Arc<dyn Fn(&Path, &D) + Send + Sync>;

/// Wire side effects of the subscription ledger.
pub trait WireLink: Send + Sync {
    /// Starts a wire subscription.
    fn open(&self, path: &Path);

    /// Ends a wire subscription.
    fn close(&self, path: &Path);

    /// Re-sends an existing wire subscription after a reconnect.
    fn restore(&self, path: &Path);
}

/// A link with no wire behind it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedLink;

impl WireLink for DetachedLink {
    fn open(&self, _path: &Path) {}

    fn close(&self, _path: &Path) {}

    fn restore(&self, _path: &Path) {}
}

/// Which listeners a notification reaches besides the touched path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyOptions {
    /// Include listeners below the touched path.
    pub recursive_down: bool,
    /// Include listeners above the touched path, and `ancestor/*` key
    /// listeners.
    pub recursive_up: bool,
    /// Skip listeners at exactly the touched path.
    pub exclude_self: bool,
}

impl NotifyOptions {
    /// Only listeners at the touched path.
    pub fn exact() -> Self {
        Self::default()
    }

    /// Touched path, ancestors and descendants.
    pub fn both() -> Self {
        Self::default().down().up()
    }

    /// Adds descendants.
    pub fn down(mut self) -> Self {
        self.recursive_down = true;
        self
    }

    /// Adds ancestors.
    pub fn up(mut self) -> Self {
        self.recursive_up = true;
        self
    }

    /// Skips the touched path itself.
    pub fn excluding_self(mut self) -> Self {
        self.exclude_self = true;
        self
    }

    fn reaches(&self, touched: &Path, listener: &Path) -> bool {
        if listener == touched {
            return !self.exclude_self;
        }
        if self.recursive_down && touched.is_ancestor_of(listener) {
            return true;
        }
        self.recursive_up
            && (listener.is_ancestor_of(touched)
                || (listener.is_wildcard() && listener.anchor().is_ancestor_of(touched)))
    }
}

enum WireOp {
    Open(Path),
    Close(Path),
}

struct Ledger<D> {
    listeners: BTreeMap<Path, Vec<(ListenerId, Callback<D>)>>,
    wire: BTreeSet<Path>,
    next_id: ListenerId,
}

/// Consolidates listeners into wire subscriptions and fans out data.
///
/// Generic over the delivered data type so clients and servers can carry
/// different notification payloads.
pub struct SubscriptionManager<D> {
    ledger: Mutex<Ledger<D>>,
    link: Arc<dyn WireLink>,
}

impl<D> SubscriptionManager<D> {
    /// Creates a manager that drives `link`.
    pub fn new(link: Arc<dyn WireLink>) -> Arc<Self> {
        Arc::new(Self {
            ledger: Mutex::new(Ledger {
                listeners: BTreeMap::new(),
                wire: BTreeSet::new(),
                next_id: 0,
            }),
            link,
        })
    }

    /// Creates a manager with no wire behind it.
    pub fn detached() -> Arc<Self> {
        Self::new(Arc::new(DetachedLink))
    }

    /// Registers a listener.
    pub fn subscribe(self: &Arc<Self>, path: Path, callback: Callback<D>) -> Unsubscribe<D> {
        self.register(path, callback, None::<fn() -> Option<D>>)
    }

    /// Registers a listener and, when the path is already covered by a wire
    /// subscription, delivers `from_cache()` right away if it yields data.
    pub fn subscribe_cached<F>(
        self: &Arc<Self>,
        path: Path,
        callback: Callback<D>,
        from_cache: F,
    ) -> Unsubscribe<D>
    where
        F: FnOnce() -> Option<D>,
    {
        self.register(path, callback, Some(from_cache))
    }

    fn register<F>(
        self: &Arc<Self>,
        path: Path,
        callback: Callback<D>,
        from_cache: Option<F>,
    ) -> Unsubscribe<D>
    where
        F: FnOnce() -> Option<D>,
    {
        let mut ops = Vec::new();
        let (id, covered) = {
            let mut ledger = self.ledger.lock();
            let id = ledger.next_id;
            ledger.next_id += 1;
            ledger
                .listeners
                .entry(path.clone())
                .or_default()
                .push((id, Arc::clone(&callback)));

            let covered = ledger.wire.iter().any(|wire| wire.covers(&path));
            if !covered {
                let replaced: Vec<Path> = ledger
                    .wire
                    .iter()
                    .filter(|wire| path.is_ancestor_of(wire))
                    .cloned()
                    .collect();
                for wire in replaced {
                    ledger.wire.remove(&wire);
                    ops.push(WireOp::Close(wire));
                }
                ledger.wire.insert(path.clone());
                ops.push(WireOp::Open(path.clone()));
            }
            (id, covered)
        };

        self.apply(ops);
        if covered {
            if let Some(data) = from_cache.and_then(|read| read()) {
                callback(&path, &data);
            }
        }

        Unsubscribe {
            manager: Arc::downgrade(self),
            path,
            id,
        }
    }

    /// Removes one listener.
    ///
    /// When the path loses its last listener and held a wire subscription,
    /// the wire subscription is closed and the remaining listeners are
    /// re-covered with the fewest wire paths.
    pub fn unsubscribe(&self, path: &Path, id: ListenerId) {
        let ops = {
            let mut ledger = self.ledger.lock();
            let Some(entries) = ledger.listeners.get_mut(path) else {
                return;
            };
            entries.retain(|(listener, _)| *listener != id);
            if !entries.is_empty() {
                return;
            }
            ledger.listeners.remove(path);
            if !ledger.wire.remove(path) {
                return;
            }

            let mut ops = vec![WireOp::Close(path.clone())];
            let cover = minimal_cover(ledger.listeners.keys());
            for selected in cover {
                if ledger.wire.insert(selected.clone()) {
                    ops.push(WireOp::Open(selected));
                }
            }
            ops
        };
        self.apply(ops);
    }

    /// Re-sends every wire subscription.
    pub fn resubscribe(&self) {
        let wire: Vec<Path> = self.ledger.lock().wire.iter().cloned().collect();
        debug!(count = wire.len(), "restoring wire subscriptions");
        for path in &wire {
            self.link.restore(path);
        }
    }

    /// Picks the listeners a touch at `path` reaches and reads their data.
    pub fn collect<R>(&self, path: &Path, options: NotifyOptions, retriever: R) -> Dispatch<D>
    where
        R: FnMut(&Path) -> Option<D>,
    {
        self.collect_many(&[(path.clone(), options)], retriever)
    }

    /// Like [`collect`](Self::collect) for several touched paths at once.
    ///
    /// Each affected listener path is read once and delivered once, however
    /// many touched paths reach it. Listener paths for which `retriever`
    /// yields `None` are skipped.
    pub fn collect_many<R>(&self, touched: &[(Path, NotifyOptions)], mut retriever: R) -> Dispatch<D>
    where
        R: FnMut(&Path) -> Option<D>,
    {
        let targets: Vec<(Path, Vec<Callback<D>>)> = {
            let ledger = self.ledger.lock();
            ledger
                .listeners
                .iter()
                .filter(|(listener, _)| {
                    touched
                        .iter()
                        .any(|(path, options)| options.reaches(path, listener))
                })
                .map(|(listener, entries)| {
                    let callbacks = entries.iter().map(|(_, cb)| Arc::clone(cb)).collect();
                    (listener.clone(), callbacks)
                })
                .collect()
        };

        let deliveries = targets
            .into_iter()
            .filter_map(|(path, callbacks)| retriever(&path).map(|data| (path, data, callbacks)))
            .collect();
        Dispatch { deliveries }
    }

    /// Collects and delivers in one step.
    pub fn notify<R>(&self, path: &Path, options: NotifyOptions, retriever: R)
    where
        R: FnMut(&Path) -> Option<D>,
    {
        self.collect(path, options, retriever).deliver();
    }

    /// Returns the current wire subscriptions.
    pub fn wire_paths(&self) -> Vec<Path> {
        self.ledger.lock().wire.iter().cloned().collect()
    }

    /// Returns every path with at least one listener.
    pub fn listener_paths(&self) -> Vec<Path> {
        self.ledger.lock().listeners.keys().cloned().collect()
    }

    /// Returns the number of listeners at exactly `path`.
    pub fn listener_count(&self, path: &Path) -> usize {
        self.ledger
            .lock()
            .listeners
            .get(path)
            .map_or(0, Vec::len)
    }

    /// Returns true if a wire subscription covers `path`.
    pub fn is_covered(&self, path: &Path) -> bool {
        self.ledger.lock().wire.iter().any(|wire| wire.covers(path))
    }

    fn apply(&self, ops: Vec<WireOp>) {
        for op in ops {
            match op {
                WireOp::Open(path) => {
                    debug!(%path, "opening wire subscription");
                    self.link.open(&path);
                }
                WireOp::Close(path) => {
                    debug!(%path, "closing wire subscription");
                    self.link.close(&path);
                }
            }
        }
    }
}

/// Shortest-first selection of the paths not covered by an earlier pick.
fn minimal_cover<'a>(paths: impl Iterator<Item = &'a Path>) -> Vec<Path> {
    let mut candidates: Vec<&Path> = paths.collect();
    candidates.sort_by_key(|path| path.depth());
    let mut selected: Vec<Path> = Vec::new();
    for candidate in candidates {
        if !selected.iter().any(|s| s.covers(candidate)) {
            selected.push(candidate.clone());
        }
    }
    selected
}

/// Deliveries picked by [`SubscriptionManager::collect`], not yet run.
pub struct Dispatch<D> {
    deliveries: Vec<(Path, D, Vec<Callback<D>>)>,
}

impl<D> Dispatch<D> {
    /// Runs every callback. Parents are delivered before their descendants.
    pub fn deliver(self) {
        for (path, data, callbacks) in self.deliveries {
            for callback in callbacks {
                callback(&path, &data);
            }
        }
    }

    /// Returns the listener paths that will be called.
    pub fn paths(&self) -> Vec<&Path> {
        self.deliveries.iter().map(|(path, _, _)| path).collect()
    }

    /// Returns the number of listener paths.
    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    /// Returns true if nothing will be delivered.
    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }
}

/// Handle removing one listener.
pub struct Unsubscribe<D> {
    manager: Weak<SubscriptionManager<D>>,
    path: Path,
    id: ListenerId,
}

impl<D> Unsubscribe<D> {
    /// Returns the listener's path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the listener's id.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Removes the listener. Does nothing if the manager is gone.
    pub fn unsubscribe(self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.unsubscribe(&self.path, self.id);
        }
    }
}

impl<D> std::fmt::Debug for Unsubscribe<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("path", &self.path)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[derive(Default)]
    struct RecordingLink {
        ops: Mutex<Vec<String>>,
    }

    impl RecordingLink {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.ops.lock())
        }
    }

    impl WireLink for RecordingLink {
        fn open(&self, path: &Path) {
            self.ops.lock().push(format!("open {path}"));
        }

        fn close(&self, path: &Path) {
            self.ops.lock().push(format!("close {path}"));
        }

        fn restore(&self, path: &Path) {
            self.ops.lock().push(format!("restore {path}"));
        }
    }

    fn manager() -> (Arc<SubscriptionManager<String>>, Arc<RecordingLink>) {
        let link = Arc::new(RecordingLink::default());
        let manager = SubscriptionManager::new(link.clone() as Arc<dyn WireLink>);
        (manager, link)
    }

    fn noop() -> Callback<String> {
        Arc::new(|_: &Path, _: &String| {})
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Callback<String> {
        let log = Arc::clone(log);
        Arc::new(move |path: &Path, data: &String| log.lock().push(format!("{tag}:{path}={data}")))
    }

    #[test]
    fn covered_listener_opens_nothing() {
        let (manager, link) = manager();
        let _parent = manager.subscribe(p("players"), noop());
        let _child = manager.subscribe(p("players/1"), noop());
        assert_eq!(link.take(), vec!["open players"]);
        assert_eq!(manager.wire_paths(), vec![p("players")]);
    }

    #[test]
    fn ancestor_replaces_descendants() {
        let (manager, link) = manager();
        let _a = manager.subscribe(p("x/1"), noop());
        let _b = manager.subscribe(p("x/2/y"), noop());
        let _c = manager.subscribe(p("x"), noop());
        assert_eq!(
            link.take(),
            vec!["open x/1", "open x/2/y", "close x/1", "close x/2/y", "open x"]
        );
        assert_eq!(manager.wire_paths(), vec![p("x")]);
    }

    #[test]
    fn wildcard_is_covered_by_its_anchor() {
        let (manager, link) = manager();
        let _keys = manager.subscribe(p("a/*"), noop());
        let _value = manager.subscribe(p("a"), noop());
        assert_eq!(link.take(), vec!["open a/*", "close a/*", "open a"]);
    }

    #[test]
    fn covered_subscribe_reads_cache() {
        let (manager, _link) = manager();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _parent = manager.subscribe(p("a"), noop());
        let _child = manager.subscribe_cached(p("a/b"), recorder(&log, "cb"), || {
            Some("cached".to_string())
        });
        assert_eq!(*log.lock(), vec!["cb:a/b=cached"]);

        // an uncovered path waits for the wire
        let _other = manager.subscribe_cached(p("z"), recorder(&log, "cb"), || {
            Some("cached".to_string())
        });
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn unsubscribing_the_cover_reopens_children() {
        let (manager, link) = manager();
        let _a = manager.subscribe(p("r/a"), noop());
        let _b = manager.subscribe(p("r/b/c"), noop());
        let _b2 = manager.subscribe(p("r/b"), noop());
        let root = manager.subscribe(p("r"), noop());
        link.take();

        root.unsubscribe();
        assert_eq!(link.take(), vec!["close r", "open r/a", "open r/b"]);
        assert_eq!(manager.wire_paths(), vec![p("r/a"), p("r/b")]);
    }

    #[test]
    fn unsubscribing_a_covered_listener_is_silent() {
        let (manager, link) = manager();
        let _parent = manager.subscribe(p("a"), noop());
        let child = manager.subscribe(p("a/b"), noop());
        link.take();
        child.unsubscribe();
        assert!(link.take().is_empty());
        assert_eq!(manager.listener_paths(), vec![p("a")]);
    }

    #[test]
    fn shared_path_closes_with_the_last_listener() {
        let (manager, link) = manager();
        let first = manager.subscribe(p("a"), noop());
        let second = manager.subscribe(p("a"), noop());
        assert_eq!(manager.listener_count(&p("a")), 2);
        first.unsubscribe();
        assert_eq!(link.take(), vec!["open a"]);
        second.unsubscribe();
        assert_eq!(link.take(), vec!["close a"]);
        assert!(manager.wire_paths().is_empty());
    }

    #[test]
    fn resubscribe_restores_wire_paths() {
        let (manager, link) = manager();
        let _a = manager.subscribe(p("a"), noop());
        let _b = manager.subscribe(p("b/c"), noop());
        let _c = manager.subscribe(p("b/c/d"), noop());
        link.take();
        manager.resubscribe();
        assert_eq!(link.take(), vec!["restore a", "restore b/c"]);
    }

    #[test]
    fn notify_reaches_up_and_down() {
        let (manager, _link) = manager();
        let log = Arc::new(Mutex::new(Vec::new()));
        for path in ["", "a", "a/b", "a/b/c", "a/x", "a/*", "a/b/*", "q"] {
            let _ = manager.subscribe(p(path), recorder(&log, "l"));
        }

        let mut reads = Vec::new();
        manager.notify(&p("a/b"), NotifyOptions::both(), |path| {
            reads.push(path.to_string());
            Some("v".to_string())
        });

        let expected = vec!["", "a", "a/*", "a/b", "a/b/*", "a/b/c"];
        assert_eq!(reads, expected);
        let delivered: Vec<String> = log.lock().clone();
        assert_eq!(
            delivered,
            expected
                .iter()
                .map(|path| format!("l:{path}=v"))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn notify_options_filter() {
        let (manager, _link) = manager();
        for path in ["a", "a/b", "a/b/c"] {
            let _ = manager.subscribe(p(path), noop());
        }
        let some = |_: &Path| Some(String::new());

        let exact = manager.collect(&p("a/b"), NotifyOptions::exact(), some);
        assert_eq!(exact.paths(), vec![&p("a/b")]);

        let down = manager.collect(&p("a/b"), NotifyOptions::exact().down().excluding_self(), some);
        assert_eq!(down.paths(), vec![&p("a/b/c")]);

        let up = manager.collect(&p("a/b"), NotifyOptions::exact().up(), some);
        assert_eq!(up.paths(), vec![&p("a"), &p("a/b")]);

        let none = manager.collect(&p("a/b"), NotifyOptions::both(), |_| None);
        assert!(none.is_empty());
    }

    #[test]
    fn collect_many_reads_each_listener_once() {
        let (manager, _link) = manager();
        let _ = manager.subscribe(p("a"), noop());
        let _ = manager.subscribe(p("a/b"), noop());

        let mut reads = 0;
        let dispatch = manager.collect_many(
            &[
                (p("a/b"), NotifyOptions::both()),
                (p("a/c"), NotifyOptions::both()),
            ],
            |_| {
                reads += 1;
                Some(String::new())
            },
        );
        assert_eq!(reads, 2);
        assert_eq!(dispatch.len(), 2);
    }

    #[test]
    fn callbacks_may_reenter() {
        let (manager, _link) = manager();
        let slot: Arc<Mutex<Option<Unsubscribe<String>>>> = Arc::new(Mutex::new(None));
        let inner_manager = Arc::clone(&manager);
        let inner_slot = Arc::clone(&slot);
        let handle = manager.subscribe(
            p("a"),
            Arc::new(move |_: &Path, _: &String| {
                if let Some(handle) = inner_slot.lock().take() {
                    handle.unsubscribe();
                }
                let _ = inner_manager.subscribe(p("a/new"), Arc::new(|_: &Path, _: &String| {}));
            }),
        );
        *slot.lock() = Some(handle);

        manager.notify(&p("a"), NotifyOptions::exact(), |_| Some(String::new()));
        assert_eq!(manager.listener_paths(), vec![p("a/new")]);
        assert_eq!(manager.wire_paths(), vec![p("a/new")]);
    }

    fn subscription_path() -> impl Strategy<Value = Path> {
        (
            prop::collection::vec(prop_oneof![Just("a"), Just("b"), Just("c")], 0..4),
            any::<bool>(),
        )
            .prop_map(|(segments, wildcard)| {
                let mut raw = segments.join("/");
                if wildcard {
                    raw.push_str("/*");
                }
                Path::parse(&raw).unwrap()
            })
    }

    proptest! {
        #[test]
        fn wire_set_stays_a_minimal_cover(
            paths in prop::collection::vec(subscription_path(), 1..12),
            drops in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
        ) {
            let (manager, _link) = manager();
            let mut handles: Vec<Option<Unsubscribe<String>>> = paths
                .iter()
                .map(|path| Some(manager.subscribe(path.clone(), noop())))
                .collect();
            for index in drops {
                let len = handles.len();
                if let Some(handle) = handles[index.index(len)].take() {
                    handle.unsubscribe();
                }
            }

            let wire = manager.wire_paths();
            let listeners = manager.listener_paths();
            for a in &wire {
                for b in &wire {
                    prop_assert!(a == b || !a.covers(b));
                }
            }
            for listener in &listeners {
                prop_assert!(wire.iter().any(|w| w.covers(listener)));
            }
            for w in &wire {
                prop_assert!(listeners.contains(w));
            }
        }
    }
}
