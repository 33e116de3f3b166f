//! The real-time process callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::pipeline::PortTable;
use crate::server::{ProcessHandler, ProcessScope};

/// Moves samples between server port buffers and the port ring buffers.
///
/// For each input port the period's samples are written into its ring; for
/// each output port the server buffer is filled from its ring. The port
/// table is reached with `try_read`: if the general-purpose side is
/// re-registering ports, the cycle is skipped and counted instead of
/// waiting, and every output is zero-filled through the scope.
pub struct PortProcessor {
    ports: Arc<RwLock<PortTable>>,
    skipped_cycles: Arc<AtomicU64>,
}

impl PortProcessor {
    /// Creates a processor over a shared port table.
    pub fn new(ports: Arc<RwLock<PortTable>>, skipped_cycles: Arc<AtomicU64>) -> Self {
        Self {
            ports,
            skipped_cycles,
        }
    }
}

impl ProcessHandler for PortProcessor {
    fn process(&mut self, scope: &mut dyn ProcessScope) {
        let Some(table) = self.ports.try_read() else {
            scope.silence_outputs();
            self.skipped_cycles.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let n_frames = scope.n_frames();

        for port in table.inputs.iter() {
            if let Some(samples) = scope.input(port.id()) {
                port.buffer().write(&samples[..n_frames.min(samples.len())]);
            }
        }

        for port in table.outputs.iter() {
            if let Some(out) = scope.output(port.id()) {
                let n = n_frames.min(out.len());
                port.buffer().read(&mut out[..n]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Port;
    use crate::server::{PortDirection, PortId};
    use std::collections::HashMap;

    struct FakeScope {
        n_frames: usize,
        inputs: HashMap<PortId, Vec<f32>>,
        outputs: HashMap<PortId, Vec<f32>>,
    }

    impl ProcessScope for FakeScope {
        fn n_frames(&self) -> usize {
            self.n_frames
        }

        fn input(&self, port: PortId) -> Option<&[f32]> {
            self.inputs.get(&port).map(Vec::as_slice)
        }

        fn output(&mut self, port: PortId) -> Option<&mut [f32]> {
            self.outputs.get_mut(&port).map(Vec::as_mut_slice)
        }

        fn silence_outputs(&mut self) {
            for buffer in self.outputs.values_mut() {
                buffer.fill(0.0);
            }
        }
    }

    fn table() -> Arc<RwLock<PortTable>> {
        let mut table = PortTable::new();
        table.inputs.push(Port::new(
            "in_1".into(),
            "app:in_1".into(),
            PortDirection::Input,
            PortId(0),
            1024,
        ));
        table.outputs.push(Port::new(
            "out_1".into(),
            "app:out_1".into(),
            PortDirection::Output,
            PortId(1),
            1024,
        ));
        Arc::new(RwLock::new(table))
    }

    fn scope(n_frames: usize, input: f32) -> FakeScope {
        FakeScope {
            n_frames,
            inputs: HashMap::from([(PortId(0), vec![input; n_frames])]),
            outputs: HashMap::from([(PortId(1), vec![7.0; n_frames])]),
        }
    }

    #[test]
    fn test_process_moves_samples() {
        let ports = table();
        let skipped = Arc::new(AtomicU64::new(0));
        let mut processor = PortProcessor::new(Arc::clone(&ports), Arc::clone(&skipped));

        ports.read().outputs.get(0).unwrap().buffer().write(&[0.1; 32]);
        let mut scope = scope(64, 0.5);
        processor.process(&mut scope);

        let table = ports.read();
        assert_eq!(table.inputs.get(0).unwrap().buffer().available_to_read(), 64);

        let out = &scope.outputs[&PortId(1)];
        assert!(out[..32].iter().all(|&s| s == 0.1));
        assert!(out[32..].iter().all(|&s| s == 0.0));
        assert_eq!(skipped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_process_skips_while_table_is_locked() {
        let ports = table();
        let skipped = Arc::new(AtomicU64::new(0));
        let mut processor = PortProcessor::new(Arc::clone(&ports), Arc::clone(&skipped));

        let guard = ports.write();
        let mut scope = scope(16, 0.5);
        processor.process(&mut scope);
        drop(guard);

        assert_eq!(skipped.load(Ordering::Relaxed), 1);
        assert_eq!(ports.read().inputs.get(0).unwrap().buffer().available_to_read(), 0);
    }

    #[test]
    fn test_skipped_cycle_overwrites_stale_output() {
        let ports = table();
        let skipped = Arc::new(AtomicU64::new(0));
        let mut processor = PortProcessor::new(Arc::clone(&ports), Arc::clone(&skipped));
        ports.read().outputs.get(0).unwrap().buffer().write(&[0.3; 4]);

        let guard = ports.write();
        let mut scope = scope(4, 0.5);
        processor.process(&mut scope);
        drop(guard);

        assert_eq!(scope.outputs[&PortId(1)], vec![0.0; 4]);
        // queued output is kept for the next cycle
        assert_eq!(ports.read().outputs.get(0).unwrap().buffer().available_to_read(), 4);
    }
}
