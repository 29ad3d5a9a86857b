use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::path::TreePath;
use crate::store::{DeleteTransport, ListingClient, StoreError, StoreResult};

/// A node of the in-memory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Opaque value contributing `size` bytes to a delete request.
    Leaf(u64),
    Internal(BTreeMap<String, Node>),
}

impl Node {
    pub fn leaf(size: u64) -> Self {
        Self::Leaf(size)
    }

    pub fn internal<I, K>(children: I) -> Self
    where
        I: IntoIterator<Item = (K, Node)>,
        K: Into<String>,
    {
        Self::Internal(
            children
                .into_iter()
                .map(|(key, node)| (key.into(), node))
                .collect(),
        )
    }

    pub fn empty() -> Self {
        Self::Internal(BTreeMap::new())
    }

    /// Convert a JSON document into a tree. Scalars become leaves sized by
    /// their serialized length, objects and arrays become internal nodes and
    /// `null` members are dropped.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => Self::Internal(
                map.iter()
                    .filter(|(_, child)| !child.is_null())
                    .map(|(key, child)| (key.clone(), Self::from_json(child)))
                    .collect(),
            ),
            serde_json::Value::Array(items) => Self::Internal(
                items
                    .iter()
                    .enumerate()
                    .filter(|(_, child)| !child.is_null())
                    .map(|(index, child)| (index.to_string(), Self::from_json(child)))
                    .collect(),
            ),
            scalar => Self::Leaf(scalar.to_string().len() as u64),
        }
    }

    /// Bytes a delete of this subtree would carry: leaf sizes plus keys.
    pub fn payload_size(&self) -> u64 {
        match self {
            Self::Leaf(size) => *size,
            Self::Internal(children) => children
                .iter()
                .map(|(key, child)| key.len() as u64 + child.payload_size())
                .sum(),
        }
    }

    /// Number of leaves below this node.
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::Internal(children) => children.values().map(Node::leaf_count).sum(),
        }
    }

    fn get(&self, path: &TreePath) -> Option<&Node> {
        path.segments()
            .iter()
            .try_fold(self, |node, segment| match node {
                Self::Internal(children) => children.get(segment),
                Self::Leaf(_) => None,
            })
    }

    /// Remove the node at `path`. Internal nodes emptied by the removal
    /// disappear with it, since a node without data does not exist.
    fn remove(&mut self, path: &TreePath) {
        if path.is_root() {
            *self = Self::empty();
        } else {
            self.remove_in(path.segments());
        }
    }

    fn remove_in(&mut self, segments: &[String]) {
        let Self::Internal(children) = self else {
            return;
        };
        let Some((first, rest)) = segments.split_first() else {
            return;
        };
        if rest.is_empty() {
            children.remove(first);
        } else if let Some(child) = children.get_mut(first) {
            child.remove_in(rest);
            if matches!(child, Self::Internal(grandchildren) if grandchildren.is_empty()) {
                children.remove(first);
            }
        }
    }
}

/// Behaviour of a [`MemoryStore`], fixed at construction.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Largest subtree, in [`Node::payload_size`] bytes, one delete may remove.
    pub write_size_limit: u64,
    /// Simulated round-trip time of every call.
    pub latency: Duration,
    /// Subtrees the caller may neither list nor delete.
    pub denied: Vec<TreePath>,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            write_size_limit: u64::MAX,
            latency: Duration::ZERO,
            denied: Vec::new(),
        }
    }
}

impl MemoryStoreConfig {
    pub fn with_write_size_limit(mut self, limit: u64) -> Self {
        self.write_size_limit = limit;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_denied(mut self, path: impl Into<TreePath>) -> Self {
        self.denied.push(path.into());
        self
    }
}

/// A call received by the store, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    List {
        path: TreePath,
        num_children: usize,
        start_after: Option<String>,
    },
    Delete {
        path: TreePath,
    },
}

/// Scripted results for calls on one path; `None` lets a call through.
type FaultScript = HashMap<TreePath, VecDeque<Option<StoreError>>>;

/// In-memory tree implementing both store contracts.
#[derive(Debug)]
pub struct MemoryStore {
    root: Mutex<Node>,
    config: MemoryStoreConfig,
    list_faults: Mutex<FaultScript>,
    delete_faults: Mutex<FaultScript>,
    calls: Mutex<Vec<StoreCall>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryStore {
    pub fn new(root: Node, config: MemoryStoreConfig) -> Self {
        Self {
            root: Mutex::new(root),
            config,
            list_faults: Mutex::new(HashMap::new()),
            delete_faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn from_json(value: serde_json::Value, config: MemoryStoreConfig) -> Self {
        Self::new(Node::from_json(&value), config)
    }

    /// Script the next listing calls on `path`, one entry per call.
    pub fn with_list_faults<I>(self, path: impl Into<TreePath>, faults: I) -> Self
    where
        I: IntoIterator<Item = Option<StoreError>>,
    {
        lock(&self.list_faults)
            .entry(path.into())
            .or_default()
            .extend(faults);
        self
    }

    /// Script the next delete calls on `path`, one entry per call.
    pub fn with_delete_faults<I>(self, path: impl Into<TreePath>, faults: I) -> Self
    where
        I: IntoIterator<Item = Option<StoreError>>,
    {
        lock(&self.delete_faults)
            .entry(path.into())
            .or_default()
            .extend(faults);
        self
    }

    pub fn snapshot(&self) -> Node {
        lock(&self.root).clone()
    }

    pub fn exists(&self, path: &TreePath) -> bool {
        lock(&self.root).get(path).is_some()
    }

    pub fn is_empty(&self) -> bool {
        matches!(&*lock(&self.root), Node::Internal(children) if children.is_empty())
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        lock(&self.calls).clone()
    }

    pub fn list_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, StoreCall::List { .. }))
    }

    pub fn delete_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, StoreCall::Delete { .. }))
    }

    /// Listing calls issued for exactly `path`.
    pub fn list_calls_for(&self, path: &TreePath) -> usize {
        self.count_calls(|call| matches!(call, StoreCall::List { path: p, .. } if p == path))
    }

    /// Delete calls issued for exactly `path`.
    pub fn delete_calls_for(&self, path: &TreePath) -> usize {
        self.count_calls(|call| matches!(call, StoreCall::Delete { path: p } if p == path))
    }

    /// Highest number of calls that were being served at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn count_calls(&self, predicate: impl Fn(&StoreCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|call| predicate(call)).count()
    }

    fn is_denied(&self, path: &TreePath) -> bool {
        self.config.denied.iter().any(|denied| path.starts_with(denied))
    }

    fn next_fault(script: &Mutex<FaultScript>, path: &TreePath) -> Option<StoreError> {
        lock(script)
            .get_mut(path)
            .and_then(VecDeque::pop_front)
            .flatten()
    }

    /// Wait out the configured latency, failing deterministically when it
    /// exceeds the caller's deadline.
    async fn round_trip(&self, timeout: Option<Duration>) -> StoreResult<()> {
        match timeout {
            Some(deadline) if self.config.latency > deadline => {
                tokio::time::sleep(deadline).await;
                Err(StoreError::Timeout(deadline))
            }
            _ if self.config.latency.is_zero() => {
                tokio::task::yield_now().await;
                Ok(())
            }
            _ => {
                tokio::time::sleep(self.config.latency).await;
                Ok(())
            }
        }
    }

    fn enter(&self, call: StoreCall) -> InFlight<'_> {
        lock(&self.calls).push(call);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl ListingClient for MemoryStore {
    async fn list_path(
        &self,
        path: &TreePath,
        num_children: usize,
        start_after: Option<&str>,
        timeout: Option<Duration>,
    ) -> StoreResult<Vec<String>> {
        let _in_flight = self.enter(StoreCall::List {
            path: path.clone(),
            num_children,
            start_after: start_after.map(str::to_owned),
        });

        self.round_trip(timeout).await?;

        if let Some(fault) = Self::next_fault(&self.list_faults, path) {
            return Err(fault);
        }
        if self.is_denied(path) {
            return Err(StoreError::PermissionDenied(path.to_string()));
        }

        let root = lock(&self.root);
        let Some(Node::Internal(children)) = root.get(path) else {
            return Ok(Vec::new());
        };

        let lower = match start_after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        Ok(children
            .range::<str, _>((lower, Bound::Unbounded))
            .take(num_children)
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[async_trait]
impl DeleteTransport for MemoryStore {
    async fn delete_subtree(&self, path: &TreePath, timeout: Option<Duration>) -> StoreResult<()> {
        let _in_flight = self.enter(StoreCall::Delete { path: path.clone() });

        self.round_trip(timeout).await?;

        if let Some(fault) = Self::next_fault(&self.delete_faults, path) {
            return Err(fault);
        }
        if self.is_denied(path) {
            return Err(StoreError::PermissionDenied(path.to_string()));
        }

        let mut root = lock(&self.root);
        let size = root.get(path).map(Node::payload_size).unwrap_or(0);
        if size > self.config.write_size_limit {
            return Err(StoreError::PayloadTooLarge(format!(
                "{path}: {size} bytes exceeds limit of {} bytes",
                self.config.write_size_limit
            )));
        }
        root.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_children() -> MemoryStore {
        MemoryStore::new(
            Node::internal((1..=4).map(|i| (i.to_string(), Node::leaf(10)))),
            MemoryStoreConfig::default(),
        )
    }

    async fn list(
        store: &MemoryStore,
        num_children: usize,
        start_after: Option<&str>,
    ) -> Vec<String> {
        store
            .list_path(&TreePath::root(), num_children, start_after, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_filters_before_truncating() {
        let store = four_children();

        assert_eq!(list(&store, 4, None).await, ["1", "2", "3", "4"]);
        assert_eq!(list(&store, 2, None).await, ["1", "2"]);
        assert_eq!(list(&store, 4, Some("2")).await, ["3", "4"]);
        assert!(list(&store, 4, Some("4")).await.is_empty());
        assert_eq!(list(&store, 1, Some("3")).await, ["4"]);
        assert!(list(&store, 3, Some("4")).await.is_empty());
    }

    #[tokio::test]
    async fn test_list_start_after_between_keys() {
        let store = four_children();
        assert_eq!(list(&store, 10, Some("25")).await, ["3", "4"]);
        assert_eq!(list(&store, 10, Some("")).await, ["1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_delete_respects_size_limit() {
        let store = MemoryStore::new(
            Node::internal([
                ("small", Node::leaf(10)),
                ("big", Node::internal([("a", Node::leaf(60)), ("b", Node::leaf(60))])),
            ]),
            MemoryStoreConfig::default().with_write_size_limit(100),
        );

        let big = TreePath::parse("/big");
        let err = store.delete_subtree(&big, None).await.unwrap_err();
        assert!(matches!(err, StoreError::PayloadTooLarge(_)));
        assert!(store.exists(&big));

        store.delete_subtree(&big.child("a"), None).await.unwrap();
        store.delete_subtree(&big, None).await.unwrap();
        assert!(!store.exists(&big));
        assert!(store.exists(&TreePath::parse("/small")));
    }

    #[tokio::test]
    async fn test_emptied_parents_disappear() {
        let store = MemoryStore::new(
            Node::internal([(
                "a",
                Node::internal([("b", Node::internal([("c", Node::leaf(1))]))]),
            )]),
            MemoryStoreConfig::default(),
        );

        store
            .delete_subtree(&TreePath::parse("/a/b/c"), None)
            .await
            .unwrap();
        assert!(!store.exists(&TreePath::parse("/a")));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_path_is_noop() {
        let store = four_children();
        store
            .delete_subtree(&TreePath::parse("/9/deeper"), None)
            .await
            .unwrap();
        assert_eq!(store.snapshot().leaf_count(), 4);
    }

    #[tokio::test]
    async fn test_delete_root_empties_store() {
        let store = four_children();
        store.delete_subtree(&TreePath::root(), None).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_beyond_deadline_times_out() {
        let store = MemoryStore::new(
            Node::internal([("a", Node::leaf(1))]),
            MemoryStoreConfig::default().with_latency(Duration::from_secs(2)),
        );
        let path = TreePath::parse("/a");

        let err = store
            .delete_subtree(&path, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Timeout(Duration::from_secs(1)));
        assert!(store.exists(&path));

        store
            .delete_subtree(&path, Some(Duration::from_secs(3)))
            .await
            .unwrap();
        assert!(!store.exists(&path));
    }

    #[tokio::test]
    async fn test_denied_subtree() {
        let store = MemoryStore::new(
            Node::internal([("private", Node::internal([("x", Node::leaf(1))]))]),
            MemoryStoreConfig::default().with_denied("/private"),
        );
        let path = TreePath::parse("/private/x");
        assert!(matches!(
            store.delete_subtree(&path, None).await,
            Err(StoreError::PermissionDenied(_))
        ));
        assert!(matches!(
            store.list_path(&path, 5, None, None).await,
            Err(StoreError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_scripted_faults_are_consumed_in_order() {
        let path = TreePath::parse("/1");
        let store = four_children().with_delete_faults(
            path.clone(),
            [
                Some(StoreError::Transient("503".into())),
                None,
            ],
        );

        assert!(store.delete_subtree(&path, None).await.is_err());
        store.delete_subtree(&path, None).await.unwrap();
        assert_eq!(store.delete_calls_for(&path), 2);
    }

    #[test]
    fn test_from_json() {
        let node = Node::from_json(&serde_json::json!({
            "users": {"alice": "x", "bob": null},
            "list": [1, 2],
            "flag": true,
        }));

        let Node::Internal(children) = &node else {
            panic!("expected internal root");
        };
        assert_eq!(children.keys().collect::<Vec<_>>(), ["flag", "list", "users"]);
        assert_eq!(node.leaf_count(), 4);
        // "x" serializes to 3 bytes
        assert_eq!(node.get(&TreePath::parse("/users/alice")), Some(&Node::Leaf(3)));
        assert_eq!(node.get(&TreePath::parse("/users/bob")), None);
        assert_eq!(node.get(&TreePath::parse("/list/1")), Some(&Node::Leaf(1)));
    }

    #[test]
    fn test_payload_size_counts_keys() {
        let node = Node::internal([("ab", Node::leaf(5)), ("c", Node::internal([("d", Node::leaf(1))]))]);
        assert_eq!(node.payload_size(), 2 + 5 + 1 + 1 + 1);
    }
}
