//! Registered ports and their ring buffers.

use crate::pipeline::RingBuffer;
use crate::server::{PortDirection, PortId};

/// Short name of the `index`-th (1-based) port: `{base}_{in|out}_{index}`.
pub fn port_short_name(base: &str, direction: PortDirection, index: usize) -> String {
    format!("{base}_{}_{index}", direction.suffix())
}

/// One registered audio port.
#[derive(Debug)]
pub struct Port {
    short_name: String,
    full_name: String,
    direction: PortDirection,
    id: PortId,
    buffer: RingBuffer,
}

impl Port {
    /// Creates a port entry with a fresh ring buffer.
    pub fn new(
        short_name: String,
        full_name: String,
        direction: PortDirection,
        id: PortId,
        capacity: usize,
    ) -> Self {
        Self {
            short_name,
            full_name,
            direction,
            id,
            buffer: RingBuffer::new(capacity),
        }
    }

    /// Name without the client prefix.
    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    /// Full `client:port` name.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Port direction.
    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    /// Server-side handle.
    pub fn id(&self) -> PortId {
        self.id
    }

    /// The port's ring buffer.
    pub fn buffer(&self) -> &RingBuffer {
        &self.buffer
    }
}

/// Ports of one direction, addressed by 0-based index.
#[derive(Debug)]
pub struct PortSet {
    direction: PortDirection,
    ports: Vec<Port>,
}

impl PortSet {
    /// Creates an empty set.
    pub fn new(direction: PortDirection) -> Self {
        Self {
            direction,
            ports: Vec::new(),
        }
    }

    /// Direction of every port in the set.
    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    /// Appends a port.
    pub fn push(&mut self, port: Port) {
        debug_assert_eq!(port.direction, self.direction);
        self.ports.push(port);
    }

    /// Port at `index`.
    pub fn get(&self, index: usize) -> Option<&Port> {
        self.ports.get(index)
    }

    /// Number of ports.
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Returns true if the set has no ports.
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Iterates ports in index order.
    pub fn iter(&self) -> std::slice::Iter<'_, Port> {
        self.ports.iter()
    }

    /// Full names in index order.
    pub fn full_names(&self) -> Vec<String> {
        self.ports.iter().map(|p| p.full_name.clone()).collect()
    }

    /// Removes and returns every port.
    pub fn drain(&mut self) -> std::vec::Drain<'_, Port> {
        self.ports.drain(..)
    }
}

/// The input and output port sets of one client.
///
/// Shared between the graph manager and the process callback behind a
/// `parking_lot::RwLock`.
#[derive(Debug)]
pub struct PortTable {
    /// Input ports.
    pub inputs: PortSet,
    /// Output ports.
    pub outputs: PortSet,
}

impl PortTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            inputs: PortSet::new(PortDirection::Input),
            outputs: PortSet::new(PortDirection::Output),
        }
    }

    /// The set for `direction`.
    pub fn set(&self, direction: PortDirection) -> &PortSet {
        match direction {
            PortDirection::Input => &self.inputs,
            PortDirection::Output => &self.outputs,
        }
    }

    /// Mutable set for `direction`.
    pub fn set_mut(&mut self, direction: PortDirection) -> &mut PortSet {
        match direction {
            PortDirection::Input => &mut self.inputs,
            PortDirection::Output => &mut self.outputs,
        }
    }

    /// Removes every port, returning their server handles.
    pub fn take_all(&mut self) -> Vec<PortId> {
        self.inputs
            .drain()
            .chain(self.outputs.drain())
            .map(|port| port.id)
            .collect()
    }

    /// Total samples dropped by overwrite-on-full across all ports.
    pub fn total_overruns(&self) -> u64 {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .map(|port| port.buffer.overruns())
            .sum()
    }
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}
