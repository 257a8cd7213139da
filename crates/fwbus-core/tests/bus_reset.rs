mod util;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fwbus_core::proto::csr::{CHANNELS_AVAILABLE_HI_INITIAL, CHANNELS_AVAILABLE_LO_INITIAL};
use fwbus_core::proto::header::{
    encode_packet, fill_async_read_quadlet, fill_async_read_quadlet_resp,
};
use fwbus_core::proto::{AckCode, NodeId, Rcode, Route, Speed};
use fwbus_core::{
    BusListener, BusPhase, DevCtl, FakeHostClock, Host, HostConfig, HostRegistry, ResetType,
};

use util::{chain_selfids, complete_reset, Harness, RecordingDriver};

const REMOTE: NodeId = NodeId::new(NodeId::LOCAL_BUS, 2);

#[derive(Default)]
struct ResetCounter {
    resets: AtomicUsize,
}

impl BusListener for ResetCounter {
    fn host_reset(&self, _host: &Host) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn generation_advances_once_per_completed_reset() {
    let h = Harness::new(3);
    let counter = Arc::new(ResetCounter::default());
    h.registry.register_listener(counter.clone());

    let selfids = chain_selfids(3, Speed::S400);
    for expected in 2..5 {
        h.host.bus_reset();
        assert!(h.host.in_bus_reset());
        assert_eq!(h.host.phase(), BusPhase::Collecting);
        assert_eq!(h.host.generation(), expected - 1);

        for &q in &selfids {
            h.host.selfid_received(q);
        }
        h.host.selfid_complete(0, false);
        assert_eq!(h.host.generation(), expected);
        assert!(!h.host.in_bus_reset());
        assert_eq!(h.host.phase(), BusPhase::Idle);
    }
    assert_eq!(counter.resets.load(Ordering::SeqCst), 3);

    // A second reset notification while one is in progress changes nothing.
    h.host.bus_reset();
    h.host.bus_reset();
    complete_reset_tail(&h.host, &selfids);
    assert_eq!(h.host.generation(), 5);
}

fn complete_reset_tail(host: &Host, selfids: &[u32]) {
    for &q in selfids {
        host.selfid_received(q);
    }
    host.selfid_complete(0, false);
}

#[test]
fn topology_and_roles_of_the_root() {
    let h = Harness::new(3);
    complete_reset(&h.host, &chain_selfids(3, Speed::S200), 2);

    let snapshot = h.host.node_snapshot();
    assert_eq!(snapshot.node_id, NodeId::new(NodeId::LOCAL_BUS, 2));
    let roles = h.host.roles();
    assert!(roles.is_root);
    assert!(roles.is_irm);
    assert!(roles.is_cycle_master);
    assert!(!roles.is_bus_manager);
    assert!(h.driver.devctls().contains(&DevCtl::ActCycleMaster(true)));

    let topology = h.host.topology();
    assert_eq!(topology.generation, snapshot.generation);
    assert_eq!(topology.node_count, 3);
    assert_eq!(topology.nodes_active, 3);
    assert_eq!(topology.irm, Some(NodeId::new(NodeId::LOCAL_BUS, 2)));
    assert_eq!(topology.speed_map.get(0, 2), Some(Speed::S200));

    let regs = h.host.csr().snapshot();
    assert_eq!(regs.node_ids, u32::from(snapshot.node_id.raw()) << 16);
    assert_eq!(regs.topology_map()[2], (3 << 16) | 3);
    assert_eq!(&regs.topology_map()[3..6], topology.selfids.as_slice());
}

#[test]
fn non_root_host_is_not_cycle_master() {
    let h = Harness::new(3);
    let roles = h.host.roles();
    assert!(!roles.is_root);
    assert!(!roles.is_irm);
    assert!(!roles.is_cycle_master);
    assert_eq!(h.host.topology().irm, Some(REMOTE));
}

#[test]
fn invalid_selfids_retry_a_bounded_number_of_times() {
    let h = Harness::new(3);
    let mut bad = chain_selfids(3, Speed::S400);
    bad.swap(1, 2);

    for retry in 1..=20 {
        complete_reset(&h.host, &bad, 0);
        assert_eq!(h.host.generation(), 1, "retry {retry} must not publish");
        assert_eq!(h.host.phase(), BusPhase::Resetting);
        assert_eq!(
            h.driver.count_devctl(DevCtl::ResetBus(ResetType::Long)),
            retry
        );
    }

    // The 21st failure is accepted as a best-effort topology.
    complete_reset(&h.host, &bad, 0);
    assert_eq!(h.host.generation(), 2);
    assert_eq!(h.driver.count_devctl(DevCtl::ResetBus(ResetType::Long)), 20);
    let topology = h.host.topology();
    assert_eq!(topology.node_count, 3);
    assert_eq!(topology.speed_map.get(0, 2), Some(Speed::S100));

    // A good stream afterwards starts a fresh retry budget.
    complete_reset(&h.host, &chain_selfids(3, Speed::S400), 0);
    assert_eq!(h.host.generation(), 3);
    complete_reset(&h.host, &bad, 0);
    assert_eq!(h.driver.count_devctl(DevCtl::ResetBus(ResetType::Long)), 21);
}

#[test]
fn selfid_pairs_failing_the_complement_check_are_dropped() {
    let h = Harness::new(3);
    let selfids = chain_selfids(3, Speed::S400);
    h.host.bus_reset();
    for &q in &selfids {
        h.host.selfid_received_pair(q, !q);
    }
    h.host.selfid_received_pair(0x8300_0000, 0);
    h.host.selfid_complete(0, false);

    let topology = h.host.topology();
    assert_eq!(topology.selfids, selfids);
    assert_eq!(topology.node_count, 3);
}

#[test]
fn selfids_outside_a_reset_are_ignored() {
    let h = Harness::new(3);
    let before = h.host.topology();
    h.host.selfid_received(0x8000_0000);
    h.host.selfid_complete(1, true);
    assert_eq!(h.host.topology(), before);
    assert_eq!(h.host.generation(), 1);
}

#[test]
fn reset_aborts_every_outstanding_request() {
    let h = Harness::new(3);
    let txns: Vec<_> = (0..5)
        .map(|_| h.host.read_async(REMOTE, 1, 0x1000, 4).unwrap())
        .collect();
    for txn in &txns[..3] {
        h.host.packet_sent(txn.id(), AckCode::Pending);
    }

    let cancels = h.driver.count_devctl(DevCtl::CancelRequests);
    h.host.bus_reset();
    assert_eq!(h.driver.count_devctl(DevCtl::CancelRequests), cancels + 1);
    assert_eq!(h.host.outstanding_requests(), 0);
    for txn in txns {
        assert_eq!(txn.wait().unwrap().ack, AckCode::Aborted);
    }
    assert_eq!(h.host.tlabels().outstanding(), 0);

    complete_reset_tail(&h.host, &chain_selfids(3, Speed::S400));

    // Stray responses to the aborted requests match nothing.
    for tlabel in 0..5 {
        let route = Route::new(h.host.node_id(), REMOTE, tlabel);
        let header = fill_async_read_quadlet_resp(route, Rcode::Complete, 7);
        h.host.packet_received(&encode_packet(&header, &[]), false);
    }
    assert_eq!(h.host.outstanding_requests(), 0);

    let txn = h.host.read_async(REMOTE, 2, 0x1000, 4).unwrap();
    assert_eq!(h.driver.last_sent().tlabel, Some(0));
    h.host.packet_sent(txn.id(), AckCode::Pending);
}

#[test]
fn requests_received_during_reset_are_dropped() {
    let h = Harness::new(3);
    h.host.bus_reset();
    let route = Route::new(h.host.node_id(), REMOTE, 3);
    let request = fill_async_read_quadlet(route, 0xffff_f000_0400);
    h.host.packet_received(&encode_packet(&request, &[]), false);
    assert!(h.driver.sent().is_empty());
}

#[test]
fn reset_bus_is_refused_while_resetting() {
    let h = Harness::new(3);
    assert!(h.host.reset_bus(ResetType::Short));
    assert_eq!(h.host.phase(), BusPhase::Resetting);
    h.host.bus_reset();
    assert!(!h.host.reset_bus(ResetType::Long));
    assert_eq!(h.driver.count_devctl(DevCtl::ResetBus(ResetType::Short)), 1);
    assert_eq!(h.driver.count_devctl(DevCtl::ResetBus(ResetType::Long)), 0);
}

#[test]
fn hardware_channel_registers_are_preset_once_the_host_is_irm() {
    let driver = Arc::new(RecordingDriver::with_hw_csr([
        0x3f,
        4915,
        CHANNELS_AVAILABLE_LO_INITIAL,
        CHANNELS_AVAILABLE_LO_INITIAL,
    ]));
    let registry = HostRegistry::with_clock(Arc::new(FakeHostClock::new(0)));
    let host = registry.add_host(driver.clone(), HostConfig::default()).unwrap();
    let channels_hi = || driver.hw_csr.as_ref().unwrap().lock().unwrap()[2];
    assert_eq!(channels_hi(), CHANNELS_AVAILABLE_LO_INITIAL);

    // A lone node is root and IRM.
    complete_reset(&host, &chain_selfids(1, Speed::S400), 0);
    assert!(host.roles().is_irm);
    assert_eq!(channels_hi(), CHANNELS_AVAILABLE_HI_INITIAL);
}
