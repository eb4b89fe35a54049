//! Locality-aware device ordering.
//!
//! For every NUMA node the table lists the devices attached to that node
//! first, then those attached to the next closest node, and so on. Without a
//! usable topology every query degrades to ascending device order.

use crate::error::{Error, Result};
use std::io;
use std::path::Path;

/// Source of NUMA distances.
pub trait NumaTopology: Send + Sync {
    /// Number of NUMA nodes.
    fn num_nodes(&self) -> usize;

    /// Relative access distance from `from` to `to`.
    fn distance(&self, from: usize, to: usize) -> u32;
}

/// Topology backed by an explicit distance matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticTopology {
    distances: Vec<Vec<u32>>,
}

impl StaticTopology {
    /// Create a topology from a square distance matrix.
    ///
    /// Missing cells read as `u32::MAX`.
    pub fn new(distances: Vec<Vec<u32>>) -> Self {
        Self { distances }
    }
}

impl NumaTopology for StaticTopology {
    fn num_nodes(&self) -> usize {
        self.distances.len()
    }

    fn distance(&self, from: usize, to: usize) -> u32 {
        self.distances
            .get(from)
            .and_then(|row| row.get(to))
            .copied()
            .unwrap_or(u32::MAX)
    }
}

/// Topology read from the Linux sysfs node directory.
///
/// Nodes are numbered by their position in ascending `node<N>` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysfsTopology {
    inner: StaticTopology,
}

impl SysfsTopology {
    /// Default sysfs node directory.
    pub const DEFAULT_ROOT: &'static str = "/sys/devices/system/node";

    /// Read the host topology, if the node directory exists.
    pub fn detect() -> Option<Self> {
        match Self::from_root(Self::DEFAULT_ROOT) {
            Ok(topology) => Some(topology),
            Err(err) => {
                tracing::debug!(error = %err, "NUMA topology not available");
                None
            }
        }
    }

    /// Read a topology from a sysfs-like directory.
    pub fn from_root(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut nodes: Vec<u32> = std::fs::read_dir(root)?
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                name.to_str()?.strip_prefix("node")?.parse().ok()
            })
            .collect();
        nodes.sort_unstable();
        if nodes.is_empty() {
            return Err(invalid(format!("no NUMA nodes under {}", root.display())));
        }

        let mut distances = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let path = root.join(format!("node{node}")).join("distance");
            let row = std::fs::read_to_string(&path)?
                .split_whitespace()
                .map(str::parse::<u32>)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| invalid(format!("{}: {e}", path.display())))?;
            if row.len() != nodes.len() {
                return Err(invalid(format!(
                    "{}: expected {} distances, found {}",
                    path.display(),
                    nodes.len(),
                    row.len()
                )));
            }
            distances.push(row);
        }

        Ok(Self {
            inner: StaticTopology::new(distances),
        })
    }
}

fn invalid(msg: String) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::InvalidData, msg))
}

impl NumaTopology for SysfsTopology {
    fn num_nodes(&self) -> usize {
        self.inner.num_nodes()
    }

    fn distance(&self, from: usize, to: usize) -> u32 {
        self.inner.distance(from, to)
    }
}

/// Precomputed device order per NUMA node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AffinityTable {
    /// No topology: queries return ascending device numbers.
    Unavailable,
    /// Orders computed from a topology.
    Available {
        /// For each node, every node sorted by `(distance, index)`.
        node_order: Vec<Vec<usize>>,
        /// For each node, devices of the nodes in `node_order`, concatenated.
        device_order: Vec<Vec<usize>>,
    },
}

impl AffinityTable {
    /// Build the table.
    ///
    /// `device_nodes[d]` is the node device `d` is attached to. Devices with
    /// an unknown or out-of-range node are appended after all placed devices
    /// for every node.
    pub fn build(topology: Option<&dyn NumaTopology>, device_nodes: &[Option<usize>]) -> Self {
        let Some(topology) = topology else {
            return Self::Unavailable;
        };
        let nodes = topology.num_nodes();
        if nodes == 0 {
            return Self::Unavailable;
        }
        tracing::debug!(nodes, devices = device_nodes.len(), "building NUMA affinity table");

        let node_order: Vec<Vec<usize>> = (0..nodes)
            .map(|from| {
                let mut order: Vec<usize> = (0..nodes).collect();
                order.sort_by_key(|&to| (topology.distance(from, to), to));
                order
            })
            .collect();

        Self::from_node_order(node_order, device_nodes)
    }

    /// Recompute the device order for a new device set, keeping the node
    /// order of `self`.
    pub fn with_devices(&self, device_nodes: &[Option<usize>]) -> Self {
        match self {
            Self::Available { node_order, .. } => {
                Self::from_node_order(node_order.clone(), device_nodes)
            }
            Self::Unavailable => Self::Unavailable,
        }
    }

    fn from_node_order(node_order: Vec<Vec<usize>>, device_nodes: &[Option<usize>]) -> Self {
        let nodes = node_order.len();
        let mut attached = vec![Vec::new(); nodes];
        let mut unplaced = Vec::new();
        for (device, node) in device_nodes.iter().enumerate() {
            match node {
                Some(node) if *node < nodes => attached[*node].push(device),
                _ => unplaced.push(device),
            }
        }

        let device_order: Vec<Vec<usize>> = node_order
            .iter()
            .map(|order| {
                order
                    .iter()
                    .flat_map(|&node| attached[node].iter().copied())
                    .chain(unplaced.iter().copied())
                    .collect()
            })
            .collect();

        for (node, order) in device_order.iter().enumerate() {
            tracing::debug!(node, nearest = ?node_order[node], devices = ?order, "NUMA order");
        }

        Self::Available {
            node_order,
            device_order,
        }
    }

    /// Number of devices the device order covers.
    pub fn num_devices(&self) -> usize {
        match self {
            Self::Available { device_order, .. } => device_order.first().map_or(0, Vec::len),
            Self::Unavailable => 0,
        }
    }

    /// Whether orders were computed from a topology.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available { .. })
    }

    /// Nodes sorted by distance from `node`.
    pub fn nearest_nodes(&self, node: usize) -> Option<&[usize]> {
        match self {
            Self::Available { node_order, .. } => node_order.get(node).map(Vec::as_slice),
            Self::Unavailable => None,
        }
    }

    /// Copy up to `min(count, total_devices)` device numbers ordered for
    /// `node` into `out`, returning how many were written.
    ///
    /// Unknown nodes and unavailable tables yield ascending numbers.
    pub fn devices_in_order(
        &self,
        node: usize,
        count: usize,
        total_devices: usize,
        out: &mut [usize],
    ) -> usize {
        let wanted = count.min(total_devices).min(out.len());
        match self {
            Self::Available { device_order, .. } if node < device_order.len() => {
                let order = &device_order[node];
                let n = wanted.min(order.len());
                out[..n].copy_from_slice(&order[..n]);
                // Devices the order does not cover yet come last.
                for (i, slot) in out[n..wanted].iter_mut().enumerate() {
                    *slot = order.len() + i;
                }
                wanted
            }
            _ => {
                for (i, slot) in out[..wanted].iter_mut().enumerate() {
                    *slot = i;
                }
                wanted
            }
        }
    }
}
