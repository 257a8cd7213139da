//! Asynchronous transaction layer: sending, response matching, request servicing, aborts and
//! timeouts.

use fwbus_proto::header::{
    decode_packet, fill_async_lock, fill_async_lock_resp, fill_async_read_block,
    fill_async_read_block_resp, fill_async_read_quadlet, fill_async_read_quadlet_resp,
    fill_async_write_block, fill_async_write_quadlet, fill_async_write_resp, fill_iso, fill_phy,
};
use fwbus_proto::{AckCode, AsyncHeader, ExtCode, NodeId, Rcode, Route, Speed, Tcode};

use crate::error::{SendError, TransactionError};
use crate::host::Host;
use crate::packet::{
    transaction, Completion, CompletionCallback, CompletionSink, Packet, PacketId, PacketKind,
    PacketState, Response, Transaction,
};
use crate::tlabel::Tlabel;

/// Largest async payload this layer builds.
pub const MAX_PAYLOAD: usize = 0xffff;

/// A packet the host is tracking until it completes.
struct InFlight {
    id: PacketId,
    tcode: Option<Tcode>,
    destination: NodeId,
    tlabel: Option<Tlabel>,
    expect_response: bool,
    state: PacketState,
    sent_at_ns: u64,
    sink: CompletionSink,
    callbacks: Vec<CompletionCallback>,
}

impl InFlight {
    fn label(&self) -> Option<u8> {
        self.tlabel.as_ref().map(Tlabel::value)
    }

    fn into_completion(mut self, ack: AckCode, response: Option<Response>) -> Completion {
        let completion = Completion {
            id: self.id,
            tcode: self.tcode,
            ack,
            response,
        };
        self.sink.resolve_sent(ack);
        for callback in self.callbacks.drain(..) {
            callback(&completion);
        }
        self.sink.resolve_completed(completion.clone());
        completion
    }
}

/// Packets handed to the backend and not yet complete, in send order.
#[derive(Default)]
pub(crate) struct TransactionTable {
    entries: Vec<InFlight>,
}

impl TransactionTable {
    fn position(&self, id: PacketId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }
}

fn read_be_u32(bytes: &[u8]) -> u32 {
    let mut q = [0u8; 4];
    q.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(q)
}

fn read_be_u64(bytes: &[u8]) -> u64 {
    let mut q = [0u8; 8];
    q.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(q)
}

impl Host {
    /// State of a packet this host has been handed.
    pub fn packet_state(&self, id: PacketId) -> PacketState {
        let table = self.lock_transactions();
        match table.position(id) {
            Some(pos) => table.entries[pos].state,
            None => PacketState::Unused,
        }
    }

    /// Number of requests still waiting for a send outcome or a response.
    pub fn outstanding_requests(&self) -> usize {
        self.lock_transactions().entries.len()
    }

    /// Earliest instant a timeout sweep can complete something, if anything is pending.
    pub fn next_timeout_ns(&self) -> Option<u64> {
        let timeout = self.csr().split_timeout_ns();
        self.lock_transactions()
            .entries
            .iter()
            .filter(|e| e.state == PacketState::Pending)
            .map(|e| e.sent_at_ns.saturating_add(timeout).saturating_add(1))
            .min()
    }

    fn lock_transactions(&self) -> std::sync::MutexGuard<'_, TransactionTable> {
        self.transactions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_sendable(&self, packet: &mut Packet) -> Result<NodeId, SendError> {
        if self.is_shutdown() {
            return Err(SendError::Shutdown);
        }
        let bus = self.lock_bus();
        if bus.in_bus_reset {
            return Err(SendError::InBusReset);
        }
        if packet.generation != bus.generation {
            return Err(SendError::StaleGeneration {
                packet: packet.generation,
                host: bus.generation,
            });
        }
        if packet.kind == PacketKind::Async {
            let destination = packet.destination();
            packet.speed = if destination.is_broadcast() {
                Speed::S100
            } else {
                bus.topology
                    .speed_map
                    .get(bus.node_id.phy(), destination.phy())
                    .unwrap_or(Speed::S100)
            };
            packet.header.set_source(bus.node_id);
        }
        Ok(bus.node_id)
    }

    /// Hands a packet to the backend and returns its completion handle.
    ///
    /// Fails without calling the backend when the host is mid-reset, removed, or the packet was
    /// built for another generation.
    pub fn send_packet(&self, packet: Packet) -> Result<Transaction, SendError> {
        let (sink, txn) = transaction(packet.id);
        self.send_tracked(packet, sink)?;
        Ok(txn)
    }

    /// Sends a packet nobody waits for, such as a response.
    pub fn send_packet_nocare(&self, packet: Packet) -> Result<(), SendError> {
        let (sink, _txn) = transaction(packet.id);
        self.send_tracked(packet, sink)
    }

    fn send_tracked(&self, mut packet: Packet, sink: CompletionSink) -> Result<(), SendError> {
        let node_id = self.check_sendable(&mut packet)?;
        let id = packet.id;
        let tlabel = packet.tlabel();

        let entry = InFlight {
            id,
            tcode: packet.tcode(),
            destination: packet.destination(),
            tlabel: packet.tlabel.take(),
            expect_response: packet.expect_response,
            state: PacketState::Queued,
            sent_at_ns: 0,
            sink,
            callbacks: std::mem::take(&mut packet.callbacks),
        };
        self.lock_transactions().entries.push(entry);

        tracing::debug!(
            host = %self.id(),
            packet = %id,
            tcode = ?packet.tcode(),
            destination = %packet.destination(),
            ?tlabel,
            generation = packet.generation,
            speed = %packet.speed,
            "sending packet"
        );

        if packet.kind == PacketKind::Async && packet.destination() == node_id {
            // Addressed to ourselves: skip the wire.
            let ack = if packet.expect_response {
                AckCode::Pending
            } else {
                AckCode::Complete
            };
            let wire = packet.to_wire();
            self.packet_sent(id, ack);
            self.packet_received(&wire, false);
            return Ok(());
        }

        if self.driver().transmit_packet(self, &packet) {
            return Ok(());
        }

        tracing::warn!(host = %self.id(), packet = %id, "backend rejected packet");
        let mut table = self.lock_transactions();
        if let Some(pos) = table.position(id) {
            table.entries.remove(pos);
        }
        Err(SendError::Rejected)
    }

    pub(crate) fn handle_packet_sent(&self, id: PacketId, ack: AckCode) {
        let now = self.clock().now_ns();
        let finished = {
            let mut table = self.lock_transactions();
            let Some(pos) = table.position(id) else {
                // Already completed by an early response, aborted, or never tracked.
                return;
            };
            let entry = &mut table.entries[pos];
            if entry.state != PacketState::Queued {
                return;
            }
            if ack != AckCode::Pending || !entry.expect_response {
                Some(table.entries.remove(pos))
            } else {
                entry.state = PacketState::Pending;
                entry.sent_at_ns = now;
                entry.sink.resolve_sent(ack);
                None
            }
        };

        match finished {
            Some(entry) => {
                tracing::debug!(host = %self.id(), packet = %id, ?ack, "packet complete on ack");
                entry.into_completion(ack, None);
            }
            None => {
                let timeout = self.csr().split_timeout_ns();
                self.schedule_sweep(now.saturating_add(timeout).saturating_add(1));
            }
        }
    }

    pub(crate) fn handle_packet_received(&self, data: &[u8], write_acked: bool) {
        if self.in_bus_reset() {
            tracing::info!(host = %self.id(), "received packet during reset, ignoring");
            return;
        }
        let parsed = match decode_packet(data) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(host = %self.id(), %err, "dropping malformed packet");
                return;
            }
        };
        let tcode = parsed.tcode;
        if tcode.is_response() {
            self.handle_response(tcode, parsed.header, parsed.data());
        } else if tcode.is_request() {
            self.handle_request(tcode, parsed.header, parsed.data(), write_acked);
        } else if tcode == Tcode::IsoData {
            self.listeners()
                .iso_receive(self, parsed.header.iso_channel(), data);
        }
    }

    fn handle_response(&self, tcode: Tcode, header: AsyncHeader, payload: &[u8]) {
        let tlabel = header.tlabel();
        let source = header.source();
        let entry = {
            let mut table = self.lock_transactions();
            let Some(pos) = table
                .entries
                .iter()
                .position(|e| e.expect_response && e.label() == Some(tlabel) && e.destination == source)
            else {
                tracing::warn!(
                    host = %self.id(),
                    tlabel,
                    source = %source,
                    ?tcode,
                    "unsolicited response packet received - no tlabel match"
                );
                return;
            };
            let request = table.entries[pos].tcode.and_then(Tcode::response);
            if request != Some(tcode) {
                tracing::warn!(
                    host = %self.id(),
                    tlabel,
                    source = %source,
                    ?tcode,
                    "unsolicited response packet received - tcode mismatch"
                );
                return;
            }
            table.entries.remove(pos)
        };

        let data = match tcode {
            Tcode::ReadBlockResponse => payload.to_vec(),
            Tcode::LockResponse => payload[..payload.len().min(8)].to_vec(),
            _ => Vec::new(),
        };
        tracing::debug!(host = %self.id(), packet = %entry.id, tlabel, rcode = ?header.rcode(), "response matched");
        // A response overtaking its ack implies the ack was pending.
        entry.into_completion(AckCode::Pending, Some(Response { header, data }));
    }

    fn handle_request(&self, tcode: Tcode, header: AsyncHeader, data: &[u8], write_acked: bool) {
        let source = header.source();
        let destination = header.destination();
        let addr = header.offset();
        let reply = Route::new(source, self.node_id(), header.tlabel());
        let router = self.router();

        let response = match tcode {
            Tcode::WriteQuadlet | Tcode::WriteBlock => {
                let rcode = if tcode == Tcode::WriteQuadlet {
                    let payload = header.quadlet_data().to_be_bytes();
                    router.write(self, source, destination, &payload, addr)
                } else if self.is_short_request(&header, data) {
                    Rcode::DataError
                } else {
                    router.write(self, source, destination, data, addr)
                };
                if write_acked {
                    return;
                }
                (fill_async_write_resp(reply, rcode), Vec::new())
            }
            Tcode::ReadQuadlet => {
                let mut buf = [0u8; 4];
                let rcode = router.read(self, source, &mut buf, addr);
                let header = fill_async_read_quadlet_resp(reply, rcode, u32::from_be_bytes(buf));
                (header, Vec::new())
            }
            Tcode::ReadBlock => {
                let mut buf = vec![0u8; header.data_length()];
                let rcode = router.read(self, source, &mut buf, addr);
                if !rcode.is_complete() {
                    buf.clear();
                }
                (fill_async_read_block_resp(reply, rcode, buf.len() as u16), buf)
            }
            Tcode::LockRequest => self.service_lock(reply, source, addr, &header, data),
            _ => return,
        };

        if destination.is_broadcast() {
            return;
        }
        let (header, data) = response;
        let mut packet = Packet::new(self.next_packet_id(), PacketKind::Async, header, data);
        packet.generation = self.generation();
        if let Err(err) = self.send_packet_nocare(packet) {
            tracing::debug!(host = %self.id(), %err, "could not send response");
        }
    }

    /// A request whose data block is shorter than its header declares.
    fn is_short_request(&self, header: &AsyncHeader, data: &[u8]) -> bool {
        let short = data.len() < header.data_length();
        if short {
            tracing::warn!(
                host = %self.id(),
                declared = header.data_length(),
                received = data.len(),
                "request data block shorter than its header"
            );
        }
        short
    }

    fn service_lock(
        &self,
        reply: Route,
        source: NodeId,
        addr: u64,
        header: &AsyncHeader,
        data: &[u8],
    ) -> (AsyncHeader, Vec<u8>) {
        let ext_raw = header.ext_code_raw();
        let Some(ext) = ExtCode::from_raw(ext_raw) else {
            tracing::warn!(host = %self.id(), ext_raw, "illegal extended transaction code");
            return (fill_async_lock_resp(reply, Rcode::TypeError, ext_raw, 0), Vec::new());
        };
        if self.is_short_request(header, data) {
            return (fill_async_lock_resp(reply, Rcode::DataError, ext_raw, 0), Vec::new());
        }
        let length = header.data_length();
        let router = self.router();

        let result = match (ext.has_single_operand(), length) {
            (true, 4) => router
                .lock(self, source, addr, ext, read_be_u32(data), 0)
                .map(|old| old.to_be_bytes().to_vec()),
            (true, 8) => router
                .lock64(self, source, addr, ext, read_be_u64(data), 0)
                .map(|old| old.to_be_bytes().to_vec()),
            (false, 8) => router
                .lock(self, source, addr, ext, read_be_u32(&data[4..]), read_be_u32(data))
                .map(|old| old.to_be_bytes().to_vec()),
            (false, 16) => router
                .lock64(self, source, addr, ext, read_be_u64(&data[8..]), read_be_u64(data))
                .map(|old| old.to_be_bytes().to_vec()),
            _ => Err(Rcode::TypeError),
        };

        match result {
            Ok(old) => (
                fill_async_lock_resp(reply, Rcode::Complete, ext_raw, old.len() as u16),
                old,
            ),
            Err(rcode) => (fill_async_lock_resp(reply, rcode, ext_raw, 0), Vec::new()),
        }
    }

    /// Completes every tracked packet with [`AckCode::Aborted`] after asking the backend to
    /// drop its queue.
    pub fn abort_requests(&self) {
        if let Err(err) = self.driver().devctl(self, crate::driver::DevCtl::CancelRequests) {
            tracing::debug!(host = %self.id(), %err, "backend could not cancel requests");
        }
        let aborted = std::mem::take(&mut self.lock_transactions().entries);
        if !aborted.is_empty() {
            tracing::info!(host = %self.id(), count = aborted.len(), "aborting outstanding requests");
        }
        for entry in aborted {
            entry.into_completion(AckCode::Aborted, None);
        }
    }

    /// Completes pending requests older than the split timeout with [`AckCode::Timeout`].
    pub fn abort_timedouts(&self) {
        let timeout = self.csr().split_timeout_ns();
        let now = self.clock().now_ns();
        let expired = {
            let mut table = self.lock_transactions();
            let mut expired = Vec::new();
            let mut i = 0;
            while i < table.entries.len() {
                let entry = &table.entries[i];
                if entry.state == PacketState::Pending
                    && entry.sent_at_ns.saturating_add(timeout) < now
                {
                    expired.push(table.entries.remove(i));
                } else {
                    i += 1;
                }
            }
            expired
        };
        for entry in expired {
            tracing::debug!(host = %self.id(), packet = %entry.id, tlabel = ?entry.label(), "request timed out");
            entry.into_completion(AckCode::Timeout, None);
        }

        if let Some(next) = self.next_timeout_ns() {
            self.schedule_sweep(next);
        }
    }

    fn request_tlabel(&self) -> Result<Tlabel, SendError> {
        self.tlabels
            .acquire(self.config().blocking_tlabels)
            .ok_or(SendError::NoTlabel)
    }

    fn request_packet(&self, generation: u32, tlabel: Tlabel, header: AsyncHeader, data: Vec<u8>) -> Packet {
        let mut packet = Packet::new(self.next_packet_id(), PacketKind::Async, header, data);
        packet.generation = generation;
        packet.tlabel = Some(tlabel);
        packet
    }

    fn route_to(&self, node: NodeId, tlabel: &Tlabel) -> Route {
        Route::new(node, self.node_id(), tlabel.value())
    }

    /// Builds a read request; 4-byte reads use the quadlet form.
    pub fn make_read_packet(
        &self,
        node: NodeId,
        generation: u32,
        addr: u64,
        length: usize,
    ) -> Result<Packet, SendError> {
        if length > MAX_PAYLOAD {
            return Err(SendError::PayloadTooLarge(length));
        }
        let tlabel = self.request_tlabel()?;
        let route = self.route_to(node, &tlabel);
        let header = if length == 4 {
            fill_async_read_quadlet(route, addr)
        } else {
            fill_async_read_block(route, addr, length as u16)
        };
        Ok(self.request_packet(generation, tlabel, header, Vec::new()))
    }

    /// Builds a write request; 4-byte writes use the quadlet form.
    pub fn make_write_packet(
        &self,
        node: NodeId,
        generation: u32,
        addr: u64,
        data: &[u8],
    ) -> Result<Packet, SendError> {
        if data.len() > MAX_PAYLOAD {
            return Err(SendError::PayloadTooLarge(data.len()));
        }
        let tlabel = self.request_tlabel()?;
        let route = self.route_to(node, &tlabel);
        let (header, payload) = if data.len() == 4 {
            (fill_async_write_quadlet(route, addr, read_be_u32(data)), Vec::new())
        } else {
            (fill_async_write_block(route, addr, data.len() as u16), data.to_vec())
        };
        Ok(self.request_packet(generation, tlabel, header, payload))
    }

    /// Builds a 32-bit lock request. Single-operand codes carry only `data`; the rest carry
    /// `arg` then `data`.
    pub fn make_lock_packet(
        &self,
        node: NodeId,
        generation: u32,
        addr: u64,
        ext: ExtCode,
        data: u32,
        arg: u32,
    ) -> Result<Packet, SendError> {
        let tlabel = self.request_tlabel()?;
        let route = self.route_to(node, &tlabel);
        let mut payload = Vec::with_capacity(8);
        if !ext.has_single_operand() {
            payload.extend_from_slice(&arg.to_be_bytes());
        }
        payload.extend_from_slice(&data.to_be_bytes());
        let header = fill_async_lock(route, addr, ext, payload.len() as u16);
        Ok(self.request_packet(generation, tlabel, header, payload))
    }

    /// 64-bit counterpart of [`Host::make_lock_packet`].
    pub fn make_lock64_packet(
        &self,
        node: NodeId,
        generation: u32,
        addr: u64,
        ext: ExtCode,
        data: u64,
        arg: u64,
    ) -> Result<Packet, SendError> {
        let tlabel = self.request_tlabel()?;
        let route = self.route_to(node, &tlabel);
        let mut payload = Vec::with_capacity(16);
        if !ext.has_single_operand() {
            payload.extend_from_slice(&arg.to_be_bytes());
        }
        payload.extend_from_slice(&data.to_be_bytes());
        let header = fill_async_lock(route, addr, ext, payload.len() as u16);
        Ok(self.request_packet(generation, tlabel, header, payload))
    }

    /// PHY packet for the current generation.
    pub fn make_phy_packet(&self, data: u32) -> Packet {
        let mut packet = Packet::new(self.next_packet_id(), PacketKind::Raw, fill_phy(data), Vec::new());
        packet.generation = self.generation();
        packet
    }

    /// Isochronous packet for the current generation.
    pub fn make_iso_packet(&self, channel: u8, tag: u8, sync: u8, data: &[u8]) -> Result<Packet, SendError> {
        if data.len() > MAX_PAYLOAD {
            return Err(SendError::PayloadTooLarge(data.len()));
        }
        let header = fill_iso(data.len() as u16, channel, tag, sync);
        let mut packet = Packet::new(self.next_packet_id(), PacketKind::Iso, header, data.to_vec());
        packet.generation = self.generation();
        Ok(packet)
    }

    pub fn read_async(
        &self,
        node: NodeId,
        generation: u32,
        addr: u64,
        length: usize,
    ) -> Result<Transaction, SendError> {
        let packet = self.make_read_packet(node, generation, addr, length)?;
        self.send_packet(packet)
    }

    pub fn write_async(
        &self,
        node: NodeId,
        generation: u32,
        addr: u64,
        data: &[u8],
    ) -> Result<Transaction, SendError> {
        let packet = self.make_write_packet(node, generation, addr, data)?;
        self.send_packet(packet)
    }

    fn finish(txn: Transaction) -> Result<Completion, TransactionError> {
        let completion = txn.wait().ok_or(TransactionError::Retry {
            ack: AckCode::Aborted,
            rcode: None,
        })?;
        completion.result()?;
        Ok(completion)
    }

    /// Reads `buf.len()` bytes at `addr` on `node`, blocking until the transaction completes.
    pub fn read(
        &self,
        node: NodeId,
        generation: u32,
        addr: u64,
        buf: &mut [u8],
    ) -> Result<(), TransactionError> {
        if buf.is_empty() {
            return Err(TransactionError::InvalidAddress);
        }
        let completion = Self::finish(self.read_async(node, generation, addr, buf.len())?)?;
        let data = completion.data();
        if data.len() < buf.len() {
            return Err(TransactionError::ShortResponse {
                expected: buf.len(),
                got: data.len(),
            });
        }
        buf.copy_from_slice(&data[..buf.len()]);
        Ok(())
    }

    /// Writes `data` at `addr` on `node`, blocking until the transaction completes.
    pub fn write(
        &self,
        node: NodeId,
        generation: u32,
        addr: u64,
        data: &[u8],
    ) -> Result<(), TransactionError> {
        if data.is_empty() {
            return Err(TransactionError::InvalidAddress);
        }
        Self::finish(self.write_async(node, generation, addr, data)?)?;
        Ok(())
    }

    /// 32-bit lock transaction returning the old value.
    pub fn lock(
        &self,
        node: NodeId,
        generation: u32,
        addr: u64,
        ext: ExtCode,
        data: u32,
        arg: u32,
    ) -> Result<u32, TransactionError> {
        let packet = self.make_lock_packet(node, generation, addr, ext, data, arg)?;
        let completion = Self::finish(self.send_packet(packet)?)?;
        let old = completion.data();
        if old.len() < 4 {
            return Err(TransactionError::ShortResponse {
                expected: 4,
                got: old.len(),
            });
        }
        Ok(read_be_u32(&old))
    }

    /// 64-bit lock transaction returning the old value.
    pub fn lock64(
        &self,
        node: NodeId,
        generation: u32,
        addr: u64,
        ext: ExtCode,
        data: u64,
        arg: u64,
    ) -> Result<u64, TransactionError> {
        let packet = self.make_lock64_packet(node, generation, addr, ext, data, arg)?;
        let completion = Self::finish(self.send_packet(packet)?)?;
        let old = completion.data();
        if old.len() < 8 {
            return Err(TransactionError::ShortResponse {
                expected: 8,
                got: old.len(),
            });
        }
        Ok(read_be_u64(&old))
    }
}
