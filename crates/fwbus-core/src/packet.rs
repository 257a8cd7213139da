//! Packets and their two-stage completion.

use std::fmt;

use futures_intrusive::channel::shared::{oneshot_channel, OneshotReceiver, OneshotSender};
use fwbus_proto::header::encode_packet;
use fwbus_proto::{AckCode, AsyncHeader, NodeId, Rcode, Speed, Tcode};

use crate::error::TransactionError;
use crate::tlabel::Tlabel;

/// Host-unique packet identifier, used by backends to report send outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(pub u64);

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Async,
    Iso,
    /// Raw PHY packet.
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    /// Not handed to the host (or already forgotten by it).
    Unused,
    /// Handed to the backend, no send outcome yet.
    Queued,
    /// Acked pending, waiting for the response.
    Pending,
    Complete,
}

pub type CompletionCallback = Box<dyn FnOnce(&Completion) + Send>;

/// One transaction unit as built by the host and handed to the backend.
pub struct Packet {
    pub(crate) id: PacketId,
    pub(crate) kind: PacketKind,
    pub(crate) header: AsyncHeader,
    pub(crate) data: Vec<u8>,
    pub(crate) generation: u32,
    pub(crate) speed: Speed,
    pub(crate) expect_response: bool,
    pub(crate) tlabel: Option<Tlabel>,
    pub(crate) callbacks: Vec<CompletionCallback>,
}

impl Packet {
    pub(crate) fn new(id: PacketId, kind: PacketKind, header: AsyncHeader, data: Vec<u8>) -> Self {
        let expect_response = kind == PacketKind::Async
            && header.tcode().is_some_and(Tcode::is_request)
            && !header.destination().is_broadcast();
        Self {
            id,
            kind,
            header,
            data,
            generation: 0,
            speed: Speed::S100,
            expect_response,
            tlabel: None,
            callbacks: Vec::new(),
        }
    }

    pub fn id(&self) -> PacketId {
        self.id
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn header(&self) -> &AsyncHeader {
        &self.header
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// `None` for PHY packets.
    pub fn tcode(&self) -> Option<Tcode> {
        match self.kind {
            PacketKind::Raw => None,
            _ => self.header.tcode(),
        }
    }

    /// Destination node of an async packet.
    pub fn destination(&self) -> NodeId {
        self.header.destination()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u32) {
        self.generation = generation;
    }

    /// Transmission speed, filled in from the speed map when the packet is sent.
    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn expect_response(&self) -> bool {
        self.expect_response
    }

    pub fn tlabel(&self) -> Option<u8> {
        self.tlabel.as_ref().map(Tlabel::value)
    }

    /// Registers a routine run once, after the packet completes.
    pub fn on_complete(&mut self, callback: impl FnOnce(&Completion) + Send + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    /// Header and data block in wire order.
    pub fn to_wire(&self) -> Vec<u8> {
        encode_packet(&self.header, &self.data)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("tcode", &self.tcode())
            .field("destination", &self.destination())
            .field("tlabel", &self.tlabel())
            .field("generation", &self.generation)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Response header and data block matched to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub header: AsyncHeader,
    pub data: Vec<u8>,
}

/// Final outcome of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: PacketId,
    /// Request tcode, `None` for PHY packets.
    pub tcode: Option<Tcode>,
    pub ack: AckCode,
    pub response: Option<Response>,
}

impl Completion {
    pub fn rcode(&self) -> Option<Rcode> {
        self.response.as_ref().and_then(|r| r.header.rcode())
    }

    pub fn result(&self) -> Result<(), TransactionError> {
        match self.tcode {
            Some(tcode) => TransactionError::classify(tcode, self.ack, self.rcode()),
            None => match self.ack {
                AckCode::Complete => Ok(()),
                ack => Err(TransactionError::Retry { ack, rcode: None }),
            },
        }
    }

    /// Response data block: the quadlet of a quadlet read response (in wire order) or the data
    /// block of a block read or lock response.
    pub fn data(&self) -> Vec<u8> {
        let Some(response) = &self.response else {
            return Vec::new();
        };
        match response.header.tcode() {
            Some(Tcode::ReadQuadletResponse) => response.header.quadlet_data().to_be_bytes().to_vec(),
            _ => response.data.clone(),
        }
    }
}

/// Host-side end of a packet's two completion stages.
pub(crate) struct CompletionSink {
    sent: Option<OneshotSender<AckCode>>,
    completed: Option<OneshotSender<Completion>>,
}

impl CompletionSink {
    pub(crate) fn resolve_sent(&mut self, ack: AckCode) {
        if let Some(sender) = self.sent.take() {
            sender.send(ack).ok();
        }
    }

    pub(crate) fn resolve_completed(&mut self, completion: Completion) {
        if let Some(sender) = self.completed.take() {
            sender.send(completion).ok();
        }
    }
}

/// Caller-side handle of a sent packet.
///
/// `sent` resolves with the ack once the backend reports the send outcome; `completed` resolves
/// with the final [`Completion`]. A final ack resolves both at once.
pub struct Transaction {
    id: PacketId,
    sent: OneshotReceiver<AckCode>,
    completed: OneshotReceiver<Completion>,
}

pub(crate) fn transaction(id: PacketId) -> (CompletionSink, Transaction) {
    let (sent_tx, sent_rx) = oneshot_channel();
    let (completed_tx, completed_rx) = oneshot_channel();
    (
        CompletionSink {
            sent: Some(sent_tx),
            completed: Some(completed_tx),
        },
        Transaction {
            id,
            sent: sent_rx,
            completed: completed_rx,
        },
    )
}

impl Transaction {
    pub fn id(&self) -> PacketId {
        self.id
    }

    /// Resolves with the send ack, or `None` if the host dropped the packet without one.
    pub async fn sent(&self) -> Option<AckCode> {
        self.sent.receive().await
    }

    pub async fn completed(&self) -> Option<Completion> {
        self.completed.receive().await
    }

    /// Blocks the calling thread until the packet completes.
    ///
    /// Must not be called from a listener or address handler running on the host's event
    /// path, since the completion may be delivered by that same thread.
    pub fn wait(self) -> Option<Completion> {
        pollster::block_on(self.completed.receive())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction").field("id", &self.id).finish()
    }
}
