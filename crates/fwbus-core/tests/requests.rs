mod util;

use std::sync::{Arc, Mutex};

use fwbus_core::proto::csr::{
    BANDWIDTH_AVAILABLE, CONFIG_ROM, CSR_BASE, FCP_COMMAND, SPLIT_TIMEOUT_HI,
};
use fwbus_core::proto::header::{
    decode_packet, encode_packet, fill_async_lock, fill_async_read_block, fill_async_write_block,
    fill_async_write_quadlet, fill_iso,
};
use fwbus_core::proto::{ExtCode, NodeId, Rcode, Route, Tcode};
use fwbus_core::{
    AddressHandler, AddressOps, BusListener, Host, HostConfig, ListenerId, TransactionError,
};

use util::{Harness, RecordingDriver};

const REMOTE: NodeId = NodeId::new(NodeId::LOCAL_BUS, 2);

fn request_route(h: &Harness, tlabel: u8) -> Route {
    Route::new(h.host.node_id(), REMOTE, tlabel)
}

/// Decodes the last packet handed to the backend.
fn last_response(h: &Harness) -> (Tcode, Route, Option<Rcode>, Vec<u8>) {
    let sent = h.driver.last_sent();
    let parsed = decode_packet(&sent.wire).unwrap();
    let header = parsed.header;
    (
        parsed.tcode,
        Route::new(header.destination(), header.source(), header.tlabel()),
        header.rcode(),
        parsed.data().to_vec(),
    )
}

#[test]
fn remote_block_read_of_config_rom() {
    let h = Harness::new(3);
    let request = fill_async_read_block(request_route(&h, 9), CSR_BASE + CONFIG_ROM.start + 4, 8);
    h.host.packet_received(&encode_packet(&request, &[]), false);

    let (tcode, route, rcode, data) = last_response(&h);
    assert_eq!(tcode, Tcode::ReadBlockResponse);
    assert_eq!(route.destination, REMOTE);
    assert_eq!(route.source, h.host.node_id());
    assert_eq!(route.tlabel, 9);
    assert_eq!(rcode, Some(Rcode::Complete));
    assert_eq!(data, vec![4, 5, 6, 7, 8, 9, 10, 11]);
}

#[test]
fn read_past_the_rom_is_an_address_error() {
    let h = Harness::new(3);
    let request = fill_async_read_block(request_route(&h, 1), CSR_BASE + CONFIG_ROM.start + 28, 8);
    h.host.packet_received(&encode_packet(&request, &[]), false);

    let (tcode, _, rcode, data) = last_response(&h);
    assert_eq!(tcode, Tcode::ReadBlockResponse);
    assert_eq!(rcode, Some(Rcode::AddressError));
    assert!(data.is_empty());
}

#[test]
fn write_responses_follow_the_link_ack() {
    let h = Harness::new(3);
    let addr = CSR_BASE + BANDWIDTH_AVAILABLE;

    let request = fill_async_write_quadlet(request_route(&h, 2), addr, 1);
    h.host.packet_received(&encode_packet(&request, &[]), true);
    assert!(h.driver.sent().is_empty());

    h.host.packet_received(&encode_packet(&request, &[]), false);
    let (tcode, route, rcode, _) = last_response(&h);
    assert_eq!(tcode, Tcode::WriteResponse);
    assert_eq!(route.tlabel, 2);
    assert_eq!(rcode, Some(Rcode::TypeError));
}

#[test]
fn block_write_shorter_than_its_header_is_a_data_error() {
    let h = Harness::new(3);
    let before = h.host.csr().snapshot();

    let request = fill_async_write_block(request_route(&h, 3), CSR_BASE + SPLIT_TIMEOUT_HI, 8);
    h.host.packet_received(&encode_packet(&request, &[0, 0, 0, 1]), false);

    let (tcode, route, rcode, _) = last_response(&h);
    assert_eq!(tcode, Tcode::WriteResponse);
    assert_eq!(route.tlabel, 3);
    assert_eq!(rcode, Some(Rcode::DataError));
    let after = h.host.csr().snapshot();
    assert_eq!(after.split_timeout_hi, before.split_timeout_hi);
    assert_eq!(after.split_timeout_lo, before.split_timeout_lo);
}

#[test]
fn lock_shorter_than_its_header_is_a_data_error() {
    let h = Harness::new(3);
    let addr = CSR_BASE + BANDWIDTH_AVAILABLE;
    let header = fill_async_lock(request_route(&h, 8), addr, ExtCode::CompareSwap, 8);
    h.host
        .packet_received(&encode_packet(&header, &4915u32.to_be_bytes()), false);

    let (tcode, _, rcode, data) = last_response(&h);
    assert_eq!(tcode, Tcode::LockResponse);
    assert_eq!(rcode, Some(Rcode::DataError));
    assert!(data.is_empty());
    assert_eq!(h.host.csr().snapshot().bandwidth_available, 4915);
}

fn lock_request(h: &Harness, tlabel: u8, addr: u64, ext: ExtCode, payload: &[u32]) -> Vec<u8> {
    let bytes: Vec<u8> = payload.iter().flat_map(|q| q.to_be_bytes()).collect();
    let header = fill_async_lock(request_route(h, tlabel), addr, ext, bytes.len() as u16);
    encode_packet(&header, &bytes)
}

#[test]
fn compare_swap_on_bandwidth_available() {
    let h = Harness::new(3);
    let addr = CSR_BASE + BANDWIDTH_AVAILABLE;

    // Stale comparison value: old value returned, nothing installed.
    h.host
        .packet_received(&lock_request(&h, 4, addr, ExtCode::CompareSwap, &[4000, 100]), false);
    let (tcode, _, rcode, data) = last_response(&h);
    assert_eq!(tcode, Tcode::LockResponse);
    assert_eq!(rcode, Some(Rcode::Complete));
    assert_eq!(data, 4915u32.to_be_bytes().to_vec());
    assert_eq!(h.host.csr().snapshot().bandwidth_available, 4915);

    h.host
        .packet_received(&lock_request(&h, 5, addr, ExtCode::CompareSwap, &[4915, 100]), false);
    let (_, _, _, data) = last_response(&h);
    assert_eq!(data, 4915u32.to_be_bytes().to_vec());
    assert_eq!(h.host.csr().snapshot().bandwidth_available, 100);
}

#[test]
fn lock_with_wrong_operand_count_is_a_type_error() {
    let h = Harness::new(3);
    let addr = CSR_BASE + BANDWIDTH_AVAILABLE;
    h.host
        .packet_received(&lock_request(&h, 6, addr, ExtCode::CompareSwap, &[4915]), false);
    let (tcode, _, rcode, data) = last_response(&h);
    assert_eq!(tcode, Tcode::LockResponse);
    assert_eq!(rcode, Some(Rcode::TypeError));
    assert!(data.is_empty());
    assert_eq!(h.host.csr().snapshot().bandwidth_available, 4915);
}

#[test]
fn register_locks_check_the_offset_before_the_extended_code() {
    let h = Harness::new(3);

    // Unmapped offset inside the register file.
    h.host
        .packet_received(&lock_request(&h, 1, CSR_BASE + 0x300, ExtCode::FetchAdd, &[1]), false);
    let (_, _, rcode, _) = last_response(&h);
    assert_eq!(rcode, Some(Rcode::AddressError));

    h.host.packet_received(
        &lock_request(&h, 2, CSR_BASE + BANDWIDTH_AVAILABLE, ExtCode::FetchAdd, &[1]),
        false,
    );
    let (_, _, rcode, _) = last_response(&h);
    assert_eq!(rcode, Some(Rcode::TypeError));
    assert_eq!(h.host.csr().snapshot().bandwidth_available, 4915);
}

#[test]
fn local_compare_swap_goes_to_hardware_registers() {
    let driver = RecordingDriver::with_hw_csr([0x3f, 1234, 0, 0]);
    let h = Harness::with(driver, HostConfig::default(), 3);
    let me = h.host.node_id();
    let generation = h.host.generation();
    let addr = CSR_BASE + BANDWIDTH_AVAILABLE;

    let old = h
        .host
        .lock(me, generation, addr, ExtCode::CompareSwap, 1000, 1234)
        .unwrap();
    assert_eq!(old, 1234);
    assert_eq!(h.driver.hw_csr.as_ref().unwrap().lock().unwrap()[1], 1000);
    // The emulated copy is untouched.
    assert_eq!(h.host.csr().snapshot().bandwidth_available, 4915);

    let err = h
        .host
        .lock(me, generation, CSR_BASE, ExtCode::FetchAdd, 1, 0)
        .unwrap_err();
    assert_eq!(err, TransactionError::NotPermitted);
}

/// Byte-addressed scratch memory.
struct Memory {
    base: u64,
    bytes: Mutex<Vec<u8>>,
}

impl Memory {
    fn new(base: u64, len: usize, fill: u8) -> Arc<Self> {
        Arc::new(Self {
            base,
            bytes: Mutex::new(vec![fill; len]),
        })
    }
}

impl AddressHandler for Memory {
    fn ops(&self) -> AddressOps {
        AddressOps::READ | AddressOps::WRITE
    }

    fn read(&self, _host: &Host, _source: NodeId, buf: &mut [u8], addr: u64) -> Rcode {
        let start = (addr - self.base) as usize;
        buf.copy_from_slice(&self.bytes.lock().unwrap()[start..start + buf.len()]);
        Rcode::Complete
    }

    fn write(
        &self,
        _host: &Host,
        _source: NodeId,
        _destination: NodeId,
        data: &[u8],
        addr: u64,
    ) -> Rcode {
        let start = (addr - self.base) as usize;
        self.bytes.lock().unwrap()[start..start + data.len()].copy_from_slice(data);
        Rcode::Complete
    }
}

/// Read-only region.
struct Constant(u8);

impl AddressHandler for Constant {
    fn ops(&self) -> AddressOps {
        AddressOps::READ
    }

    fn read(&self, _host: &Host, _source: NodeId, buf: &mut [u8], _addr: u64) -> Rcode {
        buf.fill(self.0);
        Rcode::Complete
    }
}

struct Nobody;

impl BusListener for Nobody {}

fn owner(h: &Harness) -> ListenerId {
    h.registry.register_listener(Arc::new(Nobody))
}

#[test]
fn block_read_spans_adjacent_ranges() {
    let h = Harness::new(3);
    let owner = owner(&h);
    h.registry
        .register_address_space(&h.host, owner, 0x1000, 0x1008, Memory::new(0x1000, 8, 0xaa))
        .unwrap();
    h.registry
        .register_address_space(&h.host, owner, 0x1008, 0x1010, Arc::new(Constant(0xbb)))
        .unwrap();
    h.registry
        .register_address_space(&h.host, owner, 0x1020, 0x1030, Arc::new(Constant(0xcc)))
        .unwrap();

    let request = fill_async_read_block(request_route(&h, 0), 0x1004, 8);
    h.host.packet_received(&encode_packet(&request, &[]), false);
    let (_, _, rcode, data) = last_response(&h);
    assert_eq!(rcode, Some(Rcode::Complete));
    assert_eq!(data, vec![0xaa, 0xaa, 0xaa, 0xaa, 0xbb, 0xbb, 0xbb, 0xbb]);

    // Runs into the unmapped gap at 0x1010.
    let request = fill_async_read_block(request_route(&h, 1), 0x100c, 8);
    h.host.packet_received(&encode_packet(&request, &[]), false);
    let (_, _, rcode, _) = last_response(&h);
    assert_eq!(rcode, Some(Rcode::AddressError));

    // The first range accepts writes, the second does not.
    let request = fill_async_write_block(request_route(&h, 2), 0x1004, 8);
    h.host
        .packet_received(&encode_packet(&request, &[1, 2, 3, 4, 5, 6, 7, 8]), false);
    let (tcode, _, rcode, _) = last_response(&h);
    assert_eq!(tcode, Tcode::WriteResponse);
    assert_eq!(rcode, Some(Rcode::TypeError));

    let mut buf = [0u8; 8];
    h.host
        .read(h.host.node_id(), h.host.generation(), 0x1000, &mut buf)
        .unwrap();
    assert_eq!(buf, [0xaa, 0xaa, 0xaa, 0xaa, 1, 2, 3, 4]);
}

#[derive(Default)]
struct FrameSink {
    fcp: Mutex<Vec<(NodeId, bool, Vec<u8>)>>,
    iso: Mutex<Vec<(u8, usize)>>,
}

impl BusListener for FrameSink {
    fn fcp_request(&self, _host: &Host, source: NodeId, response: bool, frame: &[u8]) {
        self.fcp.lock().unwrap().push((source, response, frame.to_vec()));
    }

    fn iso_receive(&self, _host: &Host, channel: u8, packet: &[u8]) {
        self.iso.lock().unwrap().push((channel, packet.len()));
    }
}

#[test]
fn broadcast_fcp_write_reaches_listeners_without_a_response() {
    let h = Harness::new(3);
    let sink = Arc::new(FrameSink::default());
    h.registry.register_listener(sink.clone());

    let route = Route::new(NodeId::broadcast(NodeId::LOCAL_BUS), REMOTE, 7);
    let request = fill_async_write_block(route, CSR_BASE + FCP_COMMAND.start, 4);
    h.host.packet_received(&encode_packet(&request, &[0, 0x20, 0, 1]), false);

    assert!(h.driver.sent().is_empty());
    assert_eq!(
        *sink.fcp.lock().unwrap(),
        vec![(REMOTE, false, vec![0, 0x20, 0, 1])]
    );
}

#[test]
fn iso_packets_reach_listeners_of_their_channel() {
    let h = Harness::new(3);
    let sink = Arc::new(FrameSink::default());
    h.registry.register_listener(sink.clone());

    let packet = encode_packet(&fill_iso(8, 5, 1, 0), &[0; 8]);
    h.host.packet_received(&packet, false);
    assert!(sink.iso.lock().unwrap().is_empty());

    h.host.listen_channel(5).unwrap();
    h.host.listen_channel(5).unwrap();
    assert_eq!(h.driver.count_devctl(fwbus_core::DevCtl::IsoListenChannel(5)), 1);
    h.host.packet_received(&packet, false);
    assert_eq!(*sink.iso.lock().unwrap(), vec![(5, 12)]);

    h.host.unlisten_channel(5).unwrap();
    h.host.unlisten_channel(5).unwrap();
    assert_eq!(h.driver.count_devctl(fwbus_core::DevCtl::IsoUnlistenChannel(5)), 1);
    assert!(h.host.listen_channel(64).is_err());
}
