//! Tool registry — the aggregated catalog used for routing.
//!
//! Provides:
//! - Lookup by qualified name (`namespace.backend.tool`), then by alias
//! - A stable listing: backend catalog order, then discovery order
//! - Per-backend atomic replacement of the tool set
//! - Alias ownership under the configured collision policy
//!
//! Readers clone an `Arc` of the current snapshot and never wait on a
//! writer for longer than the pointer swap. Writers are serialized and
//! build the next snapshot off to the side, so a reader sees one backend's
//! tool set either entirely before or entirely after a re-registration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::config::{CollisionPolicy, ProxyConfig};
use super::types::ToolDescriptor;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Result of a successful lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTool {
    pub descriptor: ToolDescriptor,
    /// Owning backend (the session id).
    pub backend: String,
    /// The name matched an alias rather than a qualified name.
    pub via_alias: bool,
}

#[derive(Debug, Clone)]
struct BackendEntry {
    name: String,
    /// As discovered, each carrying its candidate alias.
    tools: Vec<ToolDescriptor>,
    available: bool,
}

/// Immutable view of the registry. Replaced wholesale on every write.
#[derive(Debug, Default)]
struct Snapshot {
    backends: Vec<BackendEntry>,
    /// Available tools in listing order, `alias` set only on the owner.
    catalog: Vec<ToolDescriptor>,
    by_name: HashMap<String, usize>,
    by_alias: HashMap<String, usize>,
}

impl Snapshot {
    fn build(backends: Vec<BackendEntry>, collision: CollisionPolicy, aliasing: bool) -> Self {
        // Alias ownership is decided over every backend holding tools, not
        // just the available ones, so an owner going degraded does not hand
        // its alias to someone else.
        let mut owners: HashMap<(usize, usize), String> = HashMap::new();
        if aliasing {
            let mut claims: HashMap<&str, Vec<(usize, usize)>> = HashMap::new();
            for (bi, entry) in backends.iter().enumerate() {
                for (ti, tool) in entry.tools.iter().enumerate() {
                    if let Some(alias) = &tool.alias {
                        claims.entry(alias.as_str()).or_default().push((bi, ti));
                    }
                }
            }

            for (alias, claimants) in claims {
                let owner = match (collision, claimants.len()) {
                    (_, 1) | (CollisionPolicy::FirstWins, _) => claimants.first().copied(),
                    (CollisionPolicy::LastWins, _) => claimants.last().copied(),
                    (CollisionPolicy::Reject, _) => {
                        tracing::debug!(alias, claimants = claimants.len(), "alias collision, alias dropped");
                        None
                    }
                };
                if let Some(position) = owner {
                    owners.insert(position, alias.to_string());
                }
            }
        }

        let mut catalog = Vec::new();
        let mut by_name = HashMap::new();
        let mut by_alias = HashMap::new();
        for (bi, entry) in backends.iter().enumerate() {
            if !entry.available {
                continue;
            }
            for (ti, tool) in entry.tools.iter().enumerate() {
                let idx = catalog.len();
                let mut descriptor = tool.clone();
                descriptor.alias = owners.remove(&(bi, ti));
                if let Some(alias) = &descriptor.alias {
                    by_alias.insert(alias.clone(), idx);
                }
                by_name.insert(descriptor.qualified_name.clone(), idx);
                catalog.push(descriptor);
            }
        }

        Self {
            backends,
            catalog,
            by_name,
            by_alias,
        }
    }
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Aggregated tool registry across all backends.
///
/// Never owns a backend; it only indexes the tools sessions publish.
#[derive(Debug)]
pub struct ToolRegistry {
    collision: CollisionPolicy,
    aliasing: bool,
    /// Serializes writers; readers never take it.
    writer: Mutex<()>,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new(collision: CollisionPolicy, aliasing: bool) -> Self {
        Self {
            collision,
            aliasing,
            writer: Mutex::new(()),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(config.aliases.collision, config.aliases.enabled)
    }

    fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Apply `change` to a copy of the backend list and publish the result.
    fn update(&self, change: impl FnOnce(&mut Vec<BackendEntry>)) {
        let _writer = self.writer.lock();
        let mut backends = self.current().backends.clone();
        change(&mut backends);
        let next = Arc::new(Snapshot::build(backends, self.collision, self.aliasing));
        *self.snapshot.write() = next;
    }

    /// Reserve a backend's position in the catalog before its tools arrive.
    ///
    /// Backends start concurrently; declaring them up front in
    /// configuration order keeps the listing order independent of which
    /// one finishes its handshake first.
    pub fn declare(&self, backend: &str) {
        self.update(|backends| {
            if !backends.iter().any(|b| b.name == backend) {
                backends.push(BackendEntry {
                    name: backend.to_string(),
                    tools: Vec::new(),
                    available: false,
                });
            }
        });
    }

    /// Replace the whole tool set of `backend` and mark it available.
    ///
    /// Duplicate tool names within one backend keep the first occurrence.
    pub fn register(&self, backend: &str, descriptors: Vec<ToolDescriptor>) {
        let mut seen = HashSet::new();
        let mut tools = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if seen.insert(descriptor.original_name.clone()) {
                tools.push(descriptor);
            } else {
                tracing::warn!(
                    backend,
                    tool = %descriptor.original_name,
                    "backend reported duplicate tool, keeping the first"
                );
            }
        }
        let count = tools.len();

        self.update(|backends| match backends.iter_mut().find(|b| b.name == backend) {
            Some(entry) => {
                entry.tools = tools;
                entry.available = true;
            }
            None => backends.push(BackendEntry {
                name: backend.to_string(),
                tools,
                available: true,
            }),
        });
        tracing::info!(backend, tools = count, "registered backend tools");
    }

    /// Hide a backend's tools until it registers again.
    pub fn mark_unavailable(&self, backend: &str) {
        self.update(|backends| {
            if let Some(entry) = backends.iter_mut().find(|b| b.name == backend) {
                entry.available = false;
            }
        });
        tracing::info!(backend, "backend tools marked unavailable");
    }

    /// Drop a backend's tools for good. Its catalog slot is kept.
    pub fn deregister(&self, backend: &str) {
        self.update(|backends| {
            if let Some(entry) = backends.iter_mut().find(|b| b.name == backend) {
                entry.tools.clear();
                entry.available = false;
            }
        });
        tracing::info!(backend, "backend tools removed");
    }

    /// Look up a tool by qualified name, then by alias.
    pub fn resolve(&self, name: &str) -> Option<ResolvedTool> {
        let snapshot = self.current();
        let (idx, via_alias) = match snapshot.by_name.get(name) {
            Some(&idx) => (idx, false),
            None => (*snapshot.by_alias.get(name)?, true),
        };
        let descriptor = snapshot.catalog.get(idx)?.clone();
        Some(ResolvedTool {
            backend: descriptor.backend.clone(),
            descriptor,
            via_alias,
        })
    }

    /// All available tools: backends in catalog order, tools in discovery order.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.current().catalog.clone()
    }

    /// Number of available tools.
    pub fn len(&self) -> usize {
        self.current().catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current().catalog.is_empty()
    }

    /// Count available tools belonging to a specific backend.
    pub fn tools_for_backend(&self, backend: &str) -> usize {
        self.current()
            .catalog
            .iter()
            .filter(|t| t.backend == backend)
            .count()
    }

    /// Known backends in catalog order.
    pub fn backend_names(&self) -> Vec<String> {
        self.current().backends.iter().map(|b| b.name.clone()).collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
