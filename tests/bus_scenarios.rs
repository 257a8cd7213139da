use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fwbus::bus::{BusListener, FakeHostClock, Host, HostConfig, HostRegistry, SendError};
use fwbus::proto::csr::{CONFIG_ROM, CSR_BASE};
use fwbus::proto::header::{encode_packet, fill_async_read_quadlet_resp};
use fwbus::proto::{AckCode, NodeId, Rcode, Route};
use fwbus::sim::{NodeMode, NodeSpec, SimBus};

#[derive(Default)]
struct ResetCounter(AtomicUsize);

impl BusListener for ResetCounter {
    fn host_reset(&self, _host: &Host) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn rom() -> Vec<u8> {
    (0u8..32).map(|i| i.wrapping_mul(7)).collect()
}

fn bus() -> (HostRegistry, Arc<SimBus>) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();

    let registry = HostRegistry::with_clock(Arc::new(FakeHostClock::new(0)));
    let nodes = vec![
        NodeSpec::new(Some(2)),
        NodeSpec::new(Some(2)),
        NodeSpec::new(None).contender().rom(rom()),
    ];
    let bus = SimBus::build(&registry, nodes, HostConfig::default()).unwrap();
    (registry, bus)
}

#[test]
fn config_rom_read_after_two_more_resets() {
    let (registry, bus) = bus();
    let resets = Arc::new(ResetCounter::default());
    registry.register_listener(resets.clone());

    bus.reset();
    bus.reset();
    assert_eq!(resets.0.load(Ordering::SeqCst), 6);

    let host = bus.host(0).unwrap();
    assert_eq!(host.generation(), 3);
    let target = NodeId::local(2);
    let addr = CSR_BASE + CONFIG_ROM.start;

    assert_eq!(
        host.read_async(target, 2, addr, 16).unwrap_err(),
        SendError::StaleGeneration { packet: 2, host: 3 }
    );

    let txn = host.read_async(target, 3, addr, 16).unwrap();
    assert_eq!(pollster::block_on(txn.sent()), Some(AckCode::Pending));
    let completion = pollster::block_on(txn.completed()).unwrap();
    assert_eq!(completion.ack, AckCode::Pending);
    assert_eq!(completion.rcode(), Some(Rcode::Complete));
    assert_eq!(completion.data(), rom()[..16].to_vec());
    assert_eq!(host.outstanding_requests(), 0);
}

#[test]
fn bus_reset_aborts_pending_requests_and_ignores_late_responses() {
    let (_registry, bus) = bus();
    let host = bus.host(0).unwrap();
    let generation = host.generation();
    let deaf = NodeId::local(1);
    bus.set_mode(1, NodeMode::Deaf);

    let pending: Vec<_> = (0..5)
        .map(|i| host.read_async(deaf, generation, CSR_BASE + 4 * i, 4).unwrap())
        .collect();
    assert_eq!(host.outstanding_requests(), 5);

    bus.reset();
    assert_eq!(host.outstanding_requests(), 0);
    for txn in pending {
        assert_eq!(txn.wait().unwrap().ack, AckCode::Aborted);
    }

    // Responses to the aborted labels arrive after the reset and match nothing.
    for tlabel in 0..5 {
        let header = fill_async_read_quadlet_resp(
            Route::new(host.node_id(), deaf, tlabel),
            Rcode::Complete,
            0xdead_beef,
        );
        host.packet_received(&encode_packet(&header, &[]), false);
    }
    assert_eq!(host.outstanding_requests(), 0);

    bus.set_mode(1, NodeMode::Normal);
    let mut buf = [0u8; 4];
    host.read(NodeId::local(2), host.generation(), CSR_BASE + CONFIG_ROM.start, &mut buf)
        .unwrap();
    assert_eq!(buf.to_vec(), rom()[..4].to_vec());
}
