//! Bounded breadth-first expansion of call and type hierarchies.
//!
//! Nodes live in a flat arena addressed by index; a visited map keyed by
//! (name, location) guarantees that no symbol is expanded twice, so cyclic
//! graphs terminate and the traversal never recurses.

use anyhow::bail;
use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

use crate::error::{AnalysisError, Result};
use crate::location::SymbolLocation;

pub const MAX_DEPTH_LIMIT: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalLimits {
    /// D: levels below the roots.
    pub max_depth: u32,
    /// N: total nodes, roots included.
    pub max_nodes: usize,
    /// L: expansions per level.
    pub max_per_level: usize,
    pub level_timeout: Duration,
}

impl Default for TraversalLimits {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_nodes: 100,
            max_per_level: 25,
            level_timeout: Duration::from_secs(10),
        }
    }
}

impl TraversalLimits {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_depth == 0 || self.max_depth > MAX_DEPTH_LIMIT {
            bail!(
                "hierarchy depth must be between 1 and {MAX_DEPTH_LIMIT}, got {}",
                self.max_depth
            );
        }
        if self.max_nodes == 0 {
            bail!("hierarchy node cap must be at least 1");
        }
        if self.max_per_level == 0 {
            bail!("hierarchy per-level cap must be at least 1");
        }
        if self.level_timeout.is_zero() {
            bail!("hierarchy level timeout must be positive");
        }
        Ok(())
    }

    /// Limits for one request; a requested depth is clamped into 1..=10.
    pub fn with_depth(&self, depth: Option<u32>) -> Self {
        let mut limits = self.clone();
        if let Some(depth) = depth {
            limits.max_depth = depth.clamp(1, MAX_DEPTH_LIMIT);
        }
        limits
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
    Supertypes,
    Subtypes,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
            Direction::Supertypes => "supertypes",
            Direction::Subtypes => "subtypes",
        }
    }

    pub fn is_call(self) -> bool {
        matches!(self, Direction::Incoming | Direction::Outgoing)
    }
}

/// A symbol in a hierarchy, as reported by the source that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct HierarchyItem {
    pub name: String,
    pub kind: Option<String>,
    pub detail: Option<String>,
    pub location: SymbolLocation,
    /// Source-specific token passed back on expansion.
    #[serde(skip)]
    pub handle: Value,
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub target: HierarchyItem,
    /// Where the call happens; empty for type edges.
    pub sites: Vec<SymbolLocation>,
}

/// One level of graph data. Implemented by the semantic and textual tiers.
#[async_trait]
pub trait HierarchySource: Send + Sync {
    /// Resolve the symbol at `location` into hierarchy roots.
    async fn prepare(&self, location: &SymbolLocation, direction: Direction)
        -> Result<Vec<HierarchyItem>>;

    /// Direct neighbours of `item` along `direction`.
    async fn expand(&self, item: &HierarchyItem, direction: Direction) -> Result<Vec<Edge>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct HierarchyNode {
    pub id: usize,
    pub parent: Option<usize>,
    pub depth: u32,
    #[serde(flatten)]
    pub item: HierarchyItem,
    pub call_sites: Vec<SymbolLocation>,
    /// Back-edge to a symbol that already appears elsewhere in the tree.
    pub already_visited: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// No node had further neighbours.
    Complete,
    MaxDepth,
    NodeLimit,
    LevelTimeout,
    ExpansionFailed,
}

impl StopReason {
    /// Cut short by a slow or failing source; the same query may get further next time.
    pub fn is_transient(self) -> bool {
        matches!(self, StopReason::LevelTimeout | StopReason::ExpansionFailed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HierarchyTree {
    pub direction: Direction,
    pub roots: Vec<usize>,
    pub nodes: Vec<HierarchyNode>,
    /// Deepest level reached.
    pub levels: u32,
    pub truncated: bool,
    pub stop_reason: StopReason,
    pub expansions_per_level: Vec<usize>,
}

impl HierarchyTree {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            roots: Vec::new(),
            nodes: Vec::new(),
            levels: 0,
            truncated: false,
            stop_reason: StopReason::Complete,
            expansions_per_level: Vec::new(),
        }
    }

    pub fn node(&self, id: usize) -> Option<&HierarchyNode> {
        self.nodes.get(id)
    }

    pub fn children(&self, id: usize) -> impl Iterator<Item = &HierarchyNode> {
        self.nodes.iter().filter(move |n| n.parent == Some(id))
    }

    fn push(
        &mut self,
        parent: Option<usize>,
        depth: u32,
        item: HierarchyItem,
        call_sites: Vec<SymbolLocation>,
        already_visited: bool,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(HierarchyNode {
            id,
            parent,
            depth,
            item,
            call_sites,
            already_visited,
        });
        self.levels = self.levels.max(depth);
        id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NodeKey {
    name: String,
    file: PathBuf,
    line: u32,
    column: u32,
}

impl NodeKey {
    fn of(item: &HierarchyItem) -> Self {
        Self {
            name: item.name.clone(),
            file: item.location.file.clone(),
            line: item.location.line,
            column: item.location.column,
        }
    }
}

pub struct HierarchyEngine {
    limits: TraversalLimits,
}

impl HierarchyEngine {
    pub fn new(limits: TraversalLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &TraversalLimits {
        &self.limits
    }

    /// Expand from the symbol at `location`. Returns `NotFound` when the
    /// source has no hierarchy root there; errors while expanding the roots
    /// are propagated, later failures truncate the tree instead.
    pub async fn traverse(
        &self,
        source: &dyn HierarchySource,
        location: &SymbolLocation,
        direction: Direction,
    ) -> Result<HierarchyTree> {
        let limits = &self.limits;
        let mut tree = HierarchyTree::new(direction);
        let mut visited: HashMap<NodeKey, usize> = HashMap::new();

        let roots = source.prepare(location, direction).await?;
        if roots.is_empty() {
            return Err(AnalysisError::NotFound(format!(
                "{} hierarchy at {location}",
                direction.as_str()
            )));
        }
        for item in roots {
            if tree.nodes.len() >= limits.max_nodes {
                tree.truncated = true;
                tree.stop_reason = StopReason::NodeLimit;
                return Ok(tree);
            }
            let key = NodeKey::of(&item);
            if visited.contains_key(&key) {
                continue;
            }
            let id = tree.push(None, 0, item, Vec::new(), false);
            visited.insert(key, id);
            tree.roots.push(id);
        }

        let mut frontier = tree.roots.clone();
        let mut depth = 0;
        while !frontier.is_empty() {
            if depth >= limits.max_depth {
                tree.stop_reason = StopReason::MaxDepth;
                return Ok(tree);
            }
            let deadline = Instant::now() + limits.level_timeout;
            let mut next = Vec::new();
            let mut expanded = 0;

            for &id in &frontier {
                if expanded >= limits.max_per_level {
                    debug!(
                        "level {depth}: {} nodes left unexpanded",
                        frontier.len() - expanded
                    );
                    tree.truncated = true;
                    break;
                }
                let item = tree.nodes[id].item.clone();
                expanded += 1;

                let edges = match timeout_at(deadline, source.expand(&item, direction)).await {
                    Ok(Ok(edges)) => edges,
                    Ok(Err(err)) if depth == 0 && !err.is_timeout() => {
                        // nothing has been collected beyond the roots yet
                        return Err(err);
                    }
                    Ok(Err(err)) => {
                        warn!("expanding {} failed: {err}", item.name);
                        tree.expansions_per_level.push(expanded);
                        tree.truncated = true;
                        tree.stop_reason = if err.is_timeout() {
                            StopReason::LevelTimeout
                        } else {
                            StopReason::ExpansionFailed
                        };
                        return Ok(tree);
                    }
                    Err(_) => {
                        warn!(
                            "hierarchy level {depth} exceeded {:?}; returning partial tree",
                            limits.level_timeout
                        );
                        tree.expansions_per_level.push(expanded);
                        tree.truncated = true;
                        tree.stop_reason = StopReason::LevelTimeout;
                        return Ok(tree);
                    }
                };

                for edge in edges {
                    if tree.nodes.len() >= limits.max_nodes {
                        tree.expansions_per_level.push(expanded);
                        tree.truncated = true;
                        tree.stop_reason = StopReason::NodeLimit;
                        return Ok(tree);
                    }
                    let key = NodeKey::of(&edge.target);
                    let seen = visited.contains_key(&key);
                    let child = tree.push(Some(id), depth + 1, edge.target, edge.sites, seen);
                    if !seen {
                        visited.insert(key, child);
                        next.push(child);
                    }
                }
            }

            tree.expansions_per_level.push(expanded);
            frontier = next;
            depth += 1;
        }

        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn item(name: &str, line: u32) -> HierarchyItem {
        HierarchyItem {
            name: name.to_string(),
            kind: Some("function".to_string()),
            detail: None,
            location: SymbolLocation::new("/p/graph.cpp", line, 5).unwrap(),
            handle: Value::Null,
        }
    }

    /// In-memory call graph: name -> callers.
    struct Graph {
        lines: HashMap<&'static str, u32>,
        edges: HashMap<&'static str, Vec<&'static str>>,
        delay: Option<(&'static str, Duration)>,
        expansions: AtomicUsize,
    }

    impl Graph {
        fn new(edges: &[(&'static str, &[&'static str])]) -> Self {
            let mut lines = HashMap::new();
            let mut map = HashMap::new();
            for (i, (name, targets)) in edges.iter().enumerate() {
                lines.insert(*name, (i as u32 + 1) * 10);
                map.insert(*name, targets.to_vec());
            }
            Self {
                lines,
                edges: map,
                delay: None,
                expansions: AtomicUsize::new(0),
            }
        }

        fn item(&self, name: &str) -> HierarchyItem {
            item(name, self.lines.get(name).copied().unwrap_or(1))
        }
    }

    #[async_trait]
    impl HierarchySource for Graph {
        async fn prepare(
            &self,
            location: &SymbolLocation,
            _direction: Direction,
        ) -> Result<Vec<HierarchyItem>> {
            Ok(self
                .lines
                .iter()
                .filter(|(_, line)| **line == location.line)
                .map(|(name, _)| self.item(name))
                .collect())
        }

        async fn expand(&self, item: &HierarchyItem, _direction: Direction) -> Result<Vec<Edge>> {
            self.expansions.fetch_add(1, Ordering::SeqCst);
            if let Some((slow, delay)) = self.delay {
                if item.name == slow {
                    tokio::time::sleep(delay).await;
                }
            }
            Ok(self
                .edges
                .get(item.name.as_str())
                .map(|targets| {
                    targets
                        .iter()
                        .map(|t| Edge {
                            target: self.item(t),
                            sites: Vec::new(),
                        })
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    fn at(line: u32) -> SymbolLocation {
        SymbolLocation::new("/p/graph.cpp", line, 5).unwrap()
    }

    #[tokio::test]
    async fn self_recursion_terminates_with_back_edge() {
        let graph = Graph::new(&[("factorial", &["factorial", "main"]), ("main", &[])]);
        let engine = HierarchyEngine::new(TraversalLimits::default().with_depth(Some(5)));
        let tree = engine
            .traverse(&graph, &at(10), Direction::Incoming)
            .await
            .unwrap();

        let back_edge = tree
            .nodes
            .iter()
            .find(|n| n.item.name == "factorial" && n.parent.is_some())
            .unwrap();
        assert!(back_edge.already_visited);
        assert_eq!(back_edge.depth, 1);
        assert_eq!(tree.stop_reason, StopReason::Complete);
        // factorial and main expanded once each
        assert_eq!(graph.expansions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn mutual_recursion_terminates() {
        let graph = Graph::new(&[("ping", &["pong"]), ("pong", &["ping"])]);
        let engine = HierarchyEngine::new(TraversalLimits::default().with_depth(Some(10)));
        let tree = engine
            .traverse(&graph, &at(10), Direction::Outgoing)
            .await
            .unwrap();
        assert_eq!(tree.nodes.len(), 3);
        assert!(tree.nodes[2].already_visited);
    }

    #[tokio::test]
    async fn respects_depth_node_and_level_caps() {
        // a wide tree: root -> a..f, each -> two leaves
        let graph = Graph::new(&[
            ("root", &["a", "b", "c", "d", "e", "f"]),
            ("a", &["a1", "a2"]),
            ("b", &["b1", "b2"]),
            ("c", &["c1", "c2"]),
            ("d", &["d1", "d2"]),
            ("e", &["e1", "e2"]),
            ("f", &["f1", "f2"]),
        ]);
        let cases = [(1, 100, 25), (2, 100, 3), (3, 5, 25), (2, 8, 2)];
        for (d, n, l) in cases {
            let limits = TraversalLimits {
                max_depth: d,
                max_nodes: n,
                max_per_level: l,
                level_timeout: Duration::from_secs(5),
            };
            let tree = HierarchyEngine::new(limits)
                .traverse(&graph, &at(10), Direction::Incoming)
                .await
                .unwrap();
            assert!(tree.nodes.len() <= n, "N={n}: {}", tree.nodes.len());
            assert!(tree.levels <= d, "D={d}: {}", tree.levels);
            assert!(tree.expansions_per_level.iter().all(|&e| e <= l), "L={l}");
        }

        let limits = TraversalLimits {
            max_depth: 1,
            ..TraversalLimits::default()
        };
        let tree = HierarchyEngine::new(limits)
            .traverse(&graph, &at(10), Direction::Incoming)
            .await
            .unwrap();
        assert_eq!(tree.nodes.len(), 7);
        assert_eq!(tree.stop_reason, StopReason::MaxDepth);
    }

    #[tokio::test]
    async fn level_timeout_keeps_earlier_levels() {
        let mut graph = Graph::new(&[("root", &["slow", "fast"]), ("slow", &["x"]), ("fast", &[])]);
        graph.delay = Some(("slow", Duration::from_secs(5)));
        let limits = TraversalLimits {
            level_timeout: Duration::from_millis(50),
            ..TraversalLimits::default()
        };
        let tree = HierarchyEngine::new(limits)
            .traverse(&graph, &at(10), Direction::Incoming)
            .await
            .unwrap();
        assert!(tree.truncated);
        assert_eq!(tree.stop_reason, StopReason::LevelTimeout);
        assert_eq!(tree.nodes.len(), 3);
        assert!(matches!(
            crate::tiers::TierOutcome::hierarchy(tree),
            Ok(crate::tiers::TierOutcome::Partial(_))
        ));
    }

    #[test]
    fn only_slow_or_failing_sources_make_a_tree_transient() {
        assert!(StopReason::LevelTimeout.is_transient());
        assert!(StopReason::ExpansionFailed.is_transient());
        assert!(!StopReason::NodeLimit.is_transient());
        assert!(!StopReason::MaxDepth.is_transient());
        assert!(!StopReason::Complete.is_transient());
    }

    #[tokio::test]
    async fn missing_root_is_not_found() {
        let graph = Graph::new(&[("root", &[])]);
        let err = HierarchyEngine::new(TraversalLimits::default())
            .traverse(&graph, &at(99), Direction::Supertypes)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn requested_depth_is_clamped() {
        let limits = TraversalLimits::default();
        assert_eq!(limits.with_depth(Some(0)).max_depth, 1);
        assert_eq!(limits.with_depth(Some(42)).max_depth, 10);
        assert_eq!(limits.with_depth(None).max_depth, 3);
        assert!(TraversalLimits { max_per_level: 0, ..limits }.validate().is_err());
    }
}
