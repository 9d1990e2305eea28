//! Instruments feeding the graph through the acquisition controller.

mod common;

use common::builders::filter_after;
use common::mock_helpers::{acquire_once, mock_scope};
use common::{scalar, test_timeout, waveform};
use mockall::Sequence;
use scopeflow::filters::peak;
use scopeflow::graph::FilterGraph;
use scopeflow::instrument::{
    AcquisitionController, AcquisitionState, AcquisitionWorker, ChannelInfo, DemoOscilloscope,
    Instrument, TriggerMode, WaveformSet,
};
use scopeflow::scheduler::{RunnerCommand, Scheduler, SchedulerRunner};
use scopeflow::waveform::{UniformWaveform, Waveform};
use scopeflow::ScopeError;
use serial_test::serial;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn ramp_set(len: usize) -> WaveformSet {
    let samples: Vec<f32> = (0..len).map(|i| i as f32 / len as f32).collect();
    let mut set = WaveformSet::new();
    set.insert((0, 0), Waveform::from(UniformWaveform::from_samples(samples, 1_000_000)));
    set
}

#[test]
fn test_single_shot_reaches_filters() {
    let mut graph = FilterGraph::new();
    let channels = acquire_once(&mut graph, vec![ChannelInfo::analog("CH1", "#ffff00")], ramp_set(100));
    let pk = filter_after(&mut graph, peak::NAME, &[(channels[0], "data")]);

    let stats = Scheduler::cpu_only().refresh(&mut graph);
    assert_eq!(stats.acquisitions, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(waveform(&graph, channels[0], "data").unwrap().len(), 100);
    assert_eq!(scalar(&graph, pk, "max"), Some(0.99f32 as f64));
    assert_eq!(scalar(&graph, pk, "min"), Some(0.0));

    let acq = graph.instrument("mock").unwrap().acquisition.clone();
    assert_eq!(acq.pending_len(), 0);
    assert_eq!(acq.acquired_count(), 1);
}

#[test]
fn test_trigger_poll_error_stops_acquisition() {
    let mut scope = mock_scope(vec![ChannelInfo::analog("CH1", "#ffff00")]);
    scope.expect_start().times(2).returning(|| Ok(()));
    let mut seq = Sequence::new();
    scope
        .expect_poll_trigger()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|| Err(ScopeError::Transport("socket closed".to_string())));
    scope
        .expect_poll_trigger()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|| Ok(TriggerMode::Run));
    scope.expect_acquire_data().never();

    let acq = AcquisitionController::new(Arc::new(scope), 2);
    acq.start().unwrap();
    assert!(matches!(acq.poll(), Err(ScopeError::Transport(_))));
    assert_eq!(acq.state(), AcquisitionState::Stopped);
    assert!(acq.status().unwrap().contains("socket closed"));

    // Re-arming clears the status
    acq.start().unwrap();
    assert_eq!(acq.status(), None);
    assert_eq!(acq.poll().unwrap(), AcquisitionState::Armed);
}

#[test]
fn test_queue_stalls_until_consumer_catches_up() {
    let mut scope = mock_scope(vec![ChannelInfo::analog("CH1", "#ffff00")]);
    scope.expect_start().returning(|| Ok(()));
    scope
        .expect_poll_trigger()
        .returning(|| Ok(TriggerMode::Triggered));
    scope.expect_acquire_data().times(3).returning(|| Ok(ramp_set(8)));

    let mut graph = FilterGraph::new();
    let acq = Arc::new(AcquisitionController::new(Arc::new(scope), 2));
    let channels = graph.attach_instrument("mock", acq.clone(), None).unwrap();
    acq.start().unwrap();
    for _ in 0..20 {
        acq.poll().unwrap();
    }
    assert_eq!(acq.pending_len(), 2);
    assert_eq!(acq.state(), AcquisitionState::TriggeredDataNotReady);

    // One refresh consumes one set, freeing room for exactly one more
    let stats = Scheduler::cpu_only().refresh(&mut graph);
    assert_eq!(stats.acquisitions, 1);
    assert_eq!(waveform(&graph, channels[0], "data").unwrap().len(), 8);
    for _ in 0..20 {
        acq.poll().unwrap();
    }
    assert_eq!(acq.pending_len(), 2);
    assert_eq!(acq.acquired_count(), 3);
}

#[test]
#[serial]
fn test_background_threads_drive_the_graph() {
    let scope = Arc::new(DemoOscilloscope::new("demo"));
    scope.set_sample_depth(1000).unwrap();
    let acq = Arc::new(AcquisitionController::new(scope, 2));

    let mut graph = FilterGraph::new();
    let channels = graph.attach_instrument("demo", acq.clone(), None).unwrap();
    let pk = filter_after(&mut graph, peak::NAME, &[(channels[0], "data")]);
    let graph = Arc::new(Mutex::new(graph));

    acq.start().unwrap();
    let mut worker = AcquisitionWorker::spawn(acq.clone(), Duration::from_millis(1)).unwrap();
    assert!(acq.wait_for_trigger(Duration::from_secs(2)));

    let runner = SchedulerRunner::spawn(Scheduler::cpu_only(), graph.clone()).unwrap();
    runner.set_rate(0);
    runner.send(RunnerCommand::Refresh);
    let mut acquired = 0;
    while acquired == 0 {
        let stats = runner
            .stats()
            .recv_timeout(test_timeout() * 20)
            .expect("refresh stats");
        acquired += stats.acquisitions;
        if acquired == 0 {
            runner.refresh_now();
        }
    }
    assert!(runner.stop().is_some());
    worker.stop();
    acq.stop().unwrap();

    let graph = graph.lock().unwrap();
    let swing = scalar(&graph, pk, "pk-pk").unwrap();
    assert!(swing > 0.0, "peak-to-peak {}", swing);
}
