//! # Strata Testkit
//!
//! Deterministic test infrastructure for the failover manager and the
//! reconfiguration agent.
//!
//! ## Architecture
//!
//! - **Runtime**: [`ManualRuntime`] runs posts, timers and futures only when
//!   a test drives it, on a virtual clock
//! - **Store**: [`MemoryStore`] records every write and injects failures
//! - **Fakes**: recording transports, placement and health sinks, scripted
//!   hosting and a scripted [`strata_reconfig::Upgrade`] strategy
//! - **Harnesses**: [`FmHarness`] and [`RaHarness`] wire it all together

#![allow(clippy::unwrap_used, clippy::expect_used)]

pub mod fixtures;
pub mod hosting;
pub mod recorders;
pub mod runtime;
pub mod store;
pub mod upgrade;

pub use fixtures::{node, node_instance, replica, request, spec, version, FmHarness, RaHarness};
pub use hosting::{FakeHosting, FakeReplicaCloser, HostingStep};
pub use recorders::{
    FakeInBuild, FakeSafetyCheck, FakeServices, RecordingFmTransport, RecordingHealthReporter,
    RecordingPlacement, RecordingSender,
};
pub use runtime::ManualRuntime;
pub use store::{MemoryStore, StoreOperation, UpgradeWrite};
pub use upgrade::{ScriptLog, ScriptedUpgrade};

/// Install a fmt subscriber once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
