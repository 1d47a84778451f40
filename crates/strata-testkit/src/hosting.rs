//! Node-side hosting and replica fakes

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use futures::channel::oneshot;
use parking_lot::Mutex;
use strata_core::{FabricUpgradeSpecification, Result};
use strata_reconfig::{HostingEffects, ReplicaCloser};

/// Hosting call a test can script or hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostingStep {
    /// `download_fabric`
    Download,
    /// `validate_fabric_upgrade`
    Validate,
    /// `fabric_upgrade`
    Upgrade,
}

#[derive(Default)]
struct HostingScript {
    downloads: VecDeque<Result<()>>,
    validations: VecDeque<Result<bool>>,
    upgrades: VecDeque<Result<()>>,
    held: HashSet<HostingStep>,
    gates: Vec<oneshot::Sender<()>>,
    calls: HashMap<HostingStep, usize>,
}

/// [`HostingEffects`] answering from per-step queues
///
/// An empty queue answers `Ok`, and validation answers "no restart".
#[derive(Default)]
pub struct FakeHosting {
    script: Mutex<HostingScript>,
}

impl FakeHosting {
    /// Queue the next download result
    pub fn push_download(&self, result: Result<()>) {
        self.script.lock().downloads.push_back(result);
    }

    /// Queue the next validation result
    pub fn push_validate(&self, result: Result<bool>) {
        self.script.lock().validations.push_back(result);
    }

    /// Queue the next upgrade result
    pub fn push_upgrade(&self, result: Result<()>) {
        self.script.lock().upgrades.push_back(result);
    }

    /// Calls of `step` block until [`Self::release`]
    pub fn hold(&self, step: HostingStep) {
        self.script.lock().held.insert(step);
    }

    /// Unblock every held call
    pub fn release(&self) {
        let gates = {
            let mut script = self.script.lock();
            script.held.clear();
            std::mem::take(&mut script.gates)
        };
        for gate in gates {
            let _ = gate.send(());
        }
    }

    /// Calls made to `step`
    pub fn calls(&self, step: HostingStep) -> usize {
        self.script.lock().calls.get(&step).copied().unwrap_or(0)
    }

    async fn enter(&self, step: HostingStep) {
        let gate = {
            let mut script = self.script.lock();
            *script.calls.entry(step).or_default() += 1;
            if script.held.contains(&step) {
                let (tx, rx) = oneshot::channel();
                script.gates.push(tx);
                Some(rx)
            } else {
                None
            }
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
    }
}

#[async_trait]
impl HostingEffects for FakeHosting {
    async fn download_fabric(&self, _specification: &FabricUpgradeSpecification) -> Result<()> {
        self.enter(HostingStep::Download).await;
        self.script.lock().downloads.pop_front().unwrap_or(Ok(()))
    }

    async fn validate_fabric_upgrade(
        &self,
        _specification: &FabricUpgradeSpecification,
    ) -> Result<bool> {
        self.enter(HostingStep::Validate).await;
        self.script.lock().validations.pop_front().unwrap_or(Ok(false))
    }

    async fn fabric_upgrade(&self, _specification: &FabricUpgradeSpecification) -> Result<()> {
        self.enter(HostingStep::Upgrade).await;
        self.script.lock().upgrades.pop_front().unwrap_or(Ok(()))
    }
}

type Done = Box<dyn FnOnce() + Send>;

/// [`ReplicaCloser`] that closes at once or parks until released
#[derive(Default)]
pub struct FakeReplicaCloser {
    hold: Mutex<bool>,
    parked: Mutex<Vec<Done>>,
    calls: Mutex<usize>,
}

impl FakeReplicaCloser {
    /// Park close requests until [`Self::release`]
    pub fn hold(&self) {
        *self.hold.lock() = true;
    }

    /// Finish every parked close request and stop parking
    pub fn release(&self) {
        *self.hold.lock() = false;
        let parked = std::mem::take(&mut *self.parked.lock());
        for done in parked {
            done();
        }
    }

    /// Close requests received
    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

impl ReplicaCloser for FakeReplicaCloser {
    fn close_replicas(&self, activity_id: &str, done: Done) {
        *self.calls.lock() += 1;
        tracing::debug!(activity_id, "Closing replicas");
        if *self.hold.lock() {
            self.parked.lock().push(done);
        } else {
            done();
        }
    }
}
