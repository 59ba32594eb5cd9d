//! Hierarchical profile store.
//!
//! Aggregated samples land in a path-addressed tree of groups and typed
//! arrays, each carrying string/u64 metadata. The tree lives in memory and
//! is snapshotted to `profile.json` when the controller flushes it; plain
//! text artifacts (`threads.json`, `sources.json`, ...) are real files in
//! the node directory.
//!
//! Paths are segment vectors rather than joined strings so that symbol
//! names containing `/` cannot collide with the path structure.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};

/// Typed metadata value attached to a group or array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Meta {
    Str(String),
    U64(u64),
}

#[doc(hidden)]
#[derive(Debug)]
pub enum NodeData {
    Group,
    U64Array(Vec<u64>),
    PairArray(Vec<(u64, u64)>),
}

#[derive(Debug)]
struct Node {
    meta: HashMap<String, Meta>,
    data: NodeData,
}

impl Node {
    fn new(data: NodeData) -> Self {
        Node {
            meta: HashMap::new(),
            data,
        }
    }
}

#[derive(Debug)]
struct StoreInner {
    nodes: Mutex<HashMap<Vec<String>, Node>>,
    root_dir: PathBuf,
}

/// A shared handle to one profile store rooted at a node directory.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Store {
            inner: Arc::new(StoreInner {
                nodes: Mutex::new(HashMap::new()),
                root_dir: root_dir.into(),
            }),
        }
    }

    /// Directory backing the store's file entities.
    pub fn root_dir(&self) -> &Path {
        &self.inner.root_dir
    }

    /// Root group of the tree.
    pub fn root(&self) -> Group {
        self.ensure(&[], || NodeData::Group);
        Group {
            store: self.clone(),
            path: Vec::new(),
        }
    }

    /// Create (truncate) a text file entity in the node directory.
    pub fn create_file(&self, name: &str) -> Result<File> {
        let path = self.inner.root_dir.join(name);
        File::create(&path).with_context(|| format!("creating {}", path.display()))
    }

    /// Open a text file entity in append mode, creating it if needed.
    pub fn append_file(&self, name: &str) -> Result<File> {
        let path = self.inner.root_dir.join(name);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {} for append", path.display()))
    }

    /// Write the in-memory tree to `profile.json` under the node directory.
    pub fn flush(&self) -> Result<()> {
        let snapshot = self.snapshot();
        let path = self.inner.root_dir.join("profile.json");
        let mut file =
            File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer(&mut file, &snapshot)?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// JSON rendering of the whole tree, nested by path segments.
    pub fn snapshot(&self) -> Value {
        let nodes = self.inner.nodes.lock().unwrap();
        let mut root = Map::new();
        let mut paths: Vec<&Vec<String>> = nodes.keys().collect();
        paths.sort();

        for path in paths {
            let node = &nodes[path];
            let obj = node_to_json(node);
            insert_nested(&mut root, path, obj);
        }

        Value::Object(root)
    }

    fn ensure(&self, path: &[String], make: impl FnOnce() -> NodeData) {
        let mut nodes = self.inner.nodes.lock().unwrap();
        nodes
            .entry(path.to_vec())
            .or_insert_with(|| Node::new(make()));
    }

    fn with_node<R>(&self, path: &[String], f: impl FnOnce(&mut Node) -> R) -> R {
        let mut nodes = self.inner.nodes.lock().unwrap();
        let node = nodes
            .get_mut(path)
            .expect("store node accessed before creation");
        f(node)
    }
}

fn node_to_json(node: &Node) -> Value {
    let mut obj = Map::new();
    for (key, meta) in &node.meta {
        let value = match meta {
            Meta::Str(s) => json!(s),
            Meta::U64(n) => json!(n),
        };
        obj.insert(key.clone(), value);
    }
    match &node.data {
        NodeData::Group => {}
        NodeData::U64Array(items) => {
            obj.insert("items".into(), json!(items));
        }
        NodeData::PairArray(items) => {
            obj.insert("items".into(), json!(items));
        }
    }
    Value::Object(obj)
}

fn insert_nested(root: &mut Map<String, Value>, path: &[String], leaf: Value) {
    if path.is_empty() {
        if let Value::Object(obj) = leaf {
            for (k, v) in obj {
                root.insert(k, v);
            }
        }
        return;
    }

    let mut cursor = root;
    for segment in &path[..path.len() - 1] {
        let slot = cursor
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        // A node name can collide with a metadata key of its parent; the
        // node wins in the snapshot.
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        cursor = slot.as_object_mut().unwrap();
    }
    let last = path.last().unwrap().clone();
    match cursor.entry(last) {
        serde_json::map::Entry::Vacant(e) => {
            e.insert(leaf);
        }
        serde_json::map::Entry::Occupied(mut e) => {
            if let (Value::Object(dst), Value::Object(src)) = (e.get_mut(), leaf) {
                for (k, v) in src {
                    dst.insert(k, v);
                }
            }
        }
    }
}

/// Shared metadata operations for groups and arrays.
pub trait Entry {
    fn store(&self) -> &Store;
    fn path(&self) -> &[String];

    fn set_str(&self, key: &str, value: &str) {
        self.store().with_node(self.path(), |node| {
            node.meta.insert(key.to_string(), Meta::Str(value.to_string()));
        });
    }

    fn get_str(&self, key: &str) -> Option<String> {
        self.store().with_node(self.path(), |node| match node.meta.get(key) {
            Some(Meta::Str(s)) => Some(s.clone()),
            _ => None,
        })
    }

    fn set_u64(&self, key: &str, value: u64) {
        self.store().with_node(self.path(), |node| {
            node.meta.insert(key.to_string(), Meta::U64(value));
        });
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.store().with_node(self.path(), |node| match node.meta.get(key) {
            Some(Meta::U64(n)) => *n,
            _ => default,
        })
    }

    /// Read-modify-write add on a u64 metadata key (missing key counts as 0).
    fn add_u64(&self, key: &str, delta: u64) {
        self.store().with_node(self.path(), |node| {
            let cur = match node.meta.get(key) {
                Some(Meta::U64(n)) => *n,
                _ => 0,
            };
            node.meta.insert(key.to_string(), Meta::U64(cur + delta));
        });
    }
}

/// A group node: nested namespace with metadata.
#[derive(Debug, Clone)]
pub struct Group {
    store: Store,
    path: Vec<String>,
}

impl Entry for Group {
    fn store(&self) -> &Store {
        &self.store
    }
    fn path(&self) -> &[String] {
        &self.path
    }
}

impl Group {
    /// Open or create a child group.
    pub fn child(&self, name: &str) -> Group {
        let mut path = self.path.clone();
        path.push(name.to_string());
        self.store.ensure(&path, || NodeData::Group);
        Group {
            store: self.store.clone(),
            path,
        }
    }

    /// Open or create a child u64 array.
    pub fn u64_array(&self, name: &str) -> Array<u64> {
        self.array(name)
    }

    /// Open or create a child (u64, u64) array.
    pub fn pair_array(&self, name: &str) -> Array<(u64, u64)> {
        self.array(name)
    }

    fn array<T: Element>(&self, name: &str) -> Array<T> {
        let mut path = self.path.clone();
        path.push(name.to_string());
        self.store.ensure(&path, T::empty);
        Array {
            store: self.store.clone(),
            path,
            _marker: PhantomData,
        }
    }
}

/// Element types storable in an ordered array.
pub trait Element: Copy {
    fn empty() -> NodeData;
    fn push(data: &mut NodeData, value: Self);
    fn get(data: &NodeData, index: usize) -> Option<Self>;
    fn len(data: &NodeData) -> usize;
}

impl Element for u64 {
    fn empty() -> NodeData {
        NodeData::U64Array(Vec::new())
    }
    fn push(data: &mut NodeData, value: Self) {
        match data {
            NodeData::U64Array(v) => v.push(value),
            _ => panic!("array element type mismatch"),
        }
    }
    fn get(data: &NodeData, index: usize) -> Option<Self> {
        match data {
            NodeData::U64Array(v) => v.get(index).copied(),
            _ => None,
        }
    }
    fn len(data: &NodeData) -> usize {
        match data {
            NodeData::U64Array(v) => v.len(),
            _ => 0,
        }
    }
}

impl Element for (u64, u64) {
    fn empty() -> NodeData {
        NodeData::PairArray(Vec::new())
    }
    fn push(data: &mut NodeData, value: Self) {
        match data {
            NodeData::PairArray(v) => v.push(value),
            _ => panic!("array element type mismatch"),
        }
    }
    fn get(data: &NodeData, index: usize) -> Option<Self> {
        match data {
            NodeData::PairArray(v) => v.get(index).copied(),
            _ => None,
        }
    }
    fn len(data: &NodeData) -> usize {
        match data {
            NodeData::PairArray(v) => v.len(),
            _ => 0,
        }
    }
}

/// An ordered array node with metadata.
#[derive(Debug, Clone)]
pub struct Array<T: Element> {
    store: Store,
    path: Vec<String>,
    _marker: PhantomData<T>,
}

impl<T: Element> Entry for Array<T> {
    fn store(&self) -> &Store {
        &self.store
    }
    fn path(&self) -> &[String] {
        &self.path
    }
}

impl<T: Element> Array<T> {
    pub fn push(&self, value: T) {
        self.store.with_node(&self.path, |node| {
            T::push(&mut node.data, value);
        });
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.store.with_node(&self.path, |node| T::get(&node.data, index))
    }

    pub fn len(&self) -> usize {
        self.store.with_node(&self.path, |node| T::len(&node.data))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<T> {
        let len = self.len();
        if len == 0 {
            None
        } else {
            self.get(len - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_metadata_roundtrip() {
        let store = Store::new("/tmp/unused");
        let group = store.root().child("walltime");
        group.set_str("title", "Wall time");
        group.set_u64("sampled_period", 10);
        group.add_u64("sampled_period", 5);

        assert_eq!(group.get_str("title").as_deref(), Some("Wall time"));
        assert_eq!(group.get_u64("sampled_period", 0), 15);
        assert_eq!(group.get_u64("missing", 7), 7);
        assert_eq!(group.get_str("missing"), None);
    }

    #[test]
    fn test_array_push_and_index() {
        let store = Store::new("/tmp/unused");
        let arr = store.root().child("timed").u64_array("all");
        assert!(arr.is_empty());
        arr.push(3);
        arr.push(9);
        assert_eq!(arr.len(), 2);
        assert_eq!(arr.get(0), Some(3));
        assert_eq!(arr.last(), Some(9));
        assert_eq!(arr.get(5), None);
    }

    #[test]
    fn test_pair_array() {
        let store = Store::new("/tmp/unused");
        let arr = store.root().child("100").child("100").pair_array("offcpu");
        arr.push((60, 40));
        assert_eq!(arr.get(0), Some((60, 40)));
    }

    #[test]
    fn test_reopen_preserves_contents() {
        let store = Store::new("/tmp/unused");
        let root = store.root().child("timed");
        root.u64_array("all").push(0);
        // A second handle to the same path must see the same node.
        assert_eq!(root.u64_array("all").len(), 1);
    }

    #[test]
    fn test_slash_in_segment_does_not_collide() {
        let store = Store::new("/tmp/unused");
        let untimed = store.root().child("untimed");
        untimed.child("a/b").set_u64("hot_value", 1);
        untimed.child("a").child("b").set_u64("hot_value", 2);
        assert_eq!(untimed.child("a/b").get_u64("hot_value", 0), 1);
        assert_eq!(untimed.child("a").child("b").get_u64("hot_value", 0), 2);
    }

    #[test]
    fn test_snapshot_nests_by_path() {
        let store = Store::new("/tmp/unused");
        let tid = store.root().child("100").child("101");
        tid.set_u64("sampled_period", 20);
        tid.child("untimed").child("all").set_u64("hot_value", 20);
        tid.child("timed").u64_array("all").push(0);

        let snap = store.snapshot();
        assert_eq!(snap["100"]["101"]["sampled_period"], 20);
        assert_eq!(snap["100"]["101"]["untimed"]["all"]["hot_value"], 20);
        assert_eq!(snap["100"]["101"]["timed"]["all"]["items"][0], 0);
    }

    #[test]
    fn test_file_entities() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        {
            let mut f = store.create_file("threads.json").unwrap();
            f.write_all(b"{}").unwrap();
        }
        {
            let mut f = store.append_file("callchains.json").unwrap();
            f.write_all(b"{\"a\":1}\n").unwrap();
        }
        {
            let mut f = store.append_file("callchains.json").unwrap();
            f.write_all(b"{\"b\":2}\n").unwrap();
        }
        let contents = std::fs::read_to_string(dir.path().join("callchains.json")).unwrap();
        assert_eq!(contents, "{\"a\":1}\n{\"b\":2}\n");
        assert!(dir.path().join("threads.json").exists());
    }
}
