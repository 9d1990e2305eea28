//! Mock construction helpers

use mockall::mock;
use scopeflow::graph::{FilterGraph, NodeId};
use scopeflow::instrument::{
    AcquisitionController, AcquisitionState, ChannelInfo, Coupling, Instrument, TransportDescriptor,
    TriggerMode, WaveformSet,
};
use scopeflow::Result;
use std::sync::Arc;

mock! {
    pub Scope {}

    impl Instrument for Scope {
        fn name(&self) -> String;
        fn driver_name(&self) -> String;
        fn transport(&self) -> TransportDescriptor;
        fn channel_count(&self) -> usize;
        fn channel_info(&self, i: usize) -> ChannelInfo;
        fn coupling(&self, i: usize) -> Coupling;
        fn set_coupling(&self, i: usize, coupling: Coupling) -> Result<()>;
        fn voltage_range(&self, i: usize, stream: usize) -> f64;
        fn set_voltage_range(&self, i: usize, stream: usize, range: f64) -> Result<()>;
        fn offset(&self, i: usize, stream: usize) -> f64;
        fn set_offset(&self, i: usize, stream: usize, offset: f64) -> Result<()>;
        fn start(&self) -> Result<()>;
        fn start_single_trigger(&self) -> Result<()>;
        fn stop(&self) -> Result<()>;
        fn force_trigger(&self) -> Result<()>;
        fn poll_trigger(&self) -> Result<TriggerMode>;
        fn acquire_data(&self) -> Result<WaveformSet>;
        fn is_trigger_armed(&self) -> bool;
        fn sample_rate(&self) -> u64;
        fn set_sample_rate(&self, rate: u64) -> Result<()>;
        fn sample_depth(&self) -> u64;
        fn set_sample_depth(&self, depth: u64) -> Result<()>;
    }
}

/// A mock with identity and channel layout filled in; acquisition calls are left to the test
pub fn mock_scope(channels: Vec<ChannelInfo>) -> MockScope {
    let mut scope = MockScope::new();
    scope.expect_name().return_const("mock".to_string());
    scope.expect_driver_name().return_const("mock".to_string());
    scope.expect_transport().returning(|| TransportDescriptor {
        name: "null".to_string(),
        connection_string: String::new(),
    });
    scope.expect_channel_count().return_const(channels.len());
    scope
        .expect_channel_info()
        .returning(move |i| channels[i].clone());
    scope
}

/// Three digital channels named for an SPI bus
pub fn spi_channels() -> Vec<ChannelInfo> {
    ["CLK", "CS", "MOSI"]
        .iter()
        .map(|name| ChannelInfo::digital(*name, "#ffffff"))
        .collect()
}

/// Attach a mock that delivers `set` on one single-shot trigger, and run the
/// acquisition until the set is queued. Returns the channel node ids.
pub fn acquire_once(graph: &mut FilterGraph, channels: Vec<ChannelInfo>, set: WaveformSet) -> Vec<NodeId> {
    let mut scope = mock_scope(channels);
    scope.expect_start_single_trigger().times(1).returning(|| Ok(()));
    scope
        .expect_poll_trigger()
        .returning(|| Ok(TriggerMode::Triggered));
    let mut set = Some(set);
    scope
        .expect_acquire_data()
        .times(1)
        .returning(move || Ok(set.take().unwrap()));

    let acq = Arc::new(AcquisitionController::new(Arc::new(scope), 4));
    let ids = graph.attach_instrument("mock", acq.clone(), None).unwrap();
    acq.start_single_trigger().unwrap();
    while acq.poll().unwrap() != AcquisitionState::Stopped {}
    assert_eq!(acq.pending_len(), 1);
    ids
}
