use super::{CTRL_QUEUE_DEPTH, TX_QUEUE_DEPTH};
use crate::pdu::{ControlPayload, ControlPdu, Llid, Payload};
use crate::LlError;
use bo_tie_core::buffer::stack::QueueBuffer;

/// A payload from the host waiting to be sent
#[derive(Debug)]
pub(crate) struct TxPayload {
    pub(crate) llid: Llid,
    pub(crate) payload: Payload,
}

/// What a transmitted PDU carries
#[derive(Debug)]
pub(crate) enum TxKind {
    Empty,
    /// A fragment of the payload at the front of the data queue
    Data { llid: Llid, offset: usize, len: usize },
    Control { pdu: ControlPdu, bytes: ControlPayload },
}

/// The PDU in flight
///
/// A PDU is in flight from the moment it is first transmitted until the peer acknowledges it. The
/// sequence number and more data bit are fixed when the PDU is created, so a retransmission is
/// identical to the original transmission.
#[derive(Debug)]
pub(crate) struct TxPdu {
    pub(crate) kind: TxKind,
    pub(crate) sn: bool,
    pub(crate) md: bool,
}

impl TxPdu {
    pub(crate) fn llid(&self) -> Llid {
        match self.kind {
            TxKind::Empty => Llid::Continuation,
            TxKind::Data { llid, .. } => llid,
            TxKind::Control { .. } => Llid::Control,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match &self.kind {
            TxKind::Empty => 0,
            TxKind::Data { len, .. } => *len,
            TxKind::Control { bytes, .. } => bytes.len(),
        }
    }
}

/// The transmit queues of a connection
///
/// Control PDUs are always sent before data. Data payloads are sent in the order they were
/// enqueued, each one split into fragments no larger than the effective maximum transmit octets.
#[derive(Debug, Default)]
pub(crate) struct TxQueue {
    pub(crate) ctrl: QueueBuffer<ControlPdu, CTRL_QUEUE_DEPTH>,
    pub(crate) data: QueueBuffer<TxPayload, TX_QUEUE_DEPTH>,
    /// octets of the front payload already handed out as fragments
    pub(crate) sent_offset: usize,
    pub(crate) current: Option<TxPdu>,
    /// payloads fully acknowledged and not yet reported to the host
    pub(crate) completed: u16,
}

impl TxQueue {
    pub(crate) fn enqueue(&mut self, llid: Llid, bytes: &[u8]) -> Result<(), LlError> {
        if self.data.is_full() {
            return Err(LlError::QueueFull);
        }

        let payload = Payload::try_from_slice(bytes).map_err(|_| LlError::PayloadTooLarge)?;

        self.data
            .try_push(TxPayload { llid, payload })
            .map_err(|_| LlError::QueueFull)
    }

    /// Queue a control PDU
    ///
    /// False is returned if the control queue is full.
    pub(crate) fn push_ctrl(&mut self, pdu: ControlPdu) -> bool {
        self.ctrl.try_push(pdu).is_ok()
    }

    /// Take the next fragment of the data queue
    fn next_fragment(&mut self, max_octets: usize) -> Option<TxKind> {
        let front = self.data.front()?;

        let offset = self.sent_offset;

        let len = core::cmp::min(front.payload.len() - offset, max_octets);

        let llid = if offset == 0 { front.llid } else { Llid::Continuation };

        self.sent_offset += len;

        Some(TxKind::Data { llid, offset, len })
    }

    /// Create the next PDU to be put in flight
    pub(crate) fn next_kind(&mut self, max_octets: usize) -> TxKind {
        if let Ok(pdu) = self.ctrl.try_remove() {
            TxKind::Control {
                bytes: pdu.encode(),
                pdu,
            }
        } else {
            self.next_fragment(max_octets).unwrap_or(TxKind::Empty)
        }
    }

    /// Check if anything beyond the PDU in flight is waiting to be sent
    pub(crate) fn has_more(&self) -> bool {
        let unsent_front = self
            .data
            .front()
            .map(|front| self.sent_offset < front.payload.len())
            .unwrap_or_default();

        !self.ctrl.is_empty() || self.data.len() > 1 || unsent_front
    }

    /// Check if there is anything to send other than an empty PDU
    pub(crate) fn has_pending(&self) -> bool {
        let in_flight = match &self.current {
            None | Some(TxPdu { kind: TxKind::Empty, .. }) => false,
            Some(_) => true,
        };

        in_flight || self.has_more()
    }

    /// Get the payload of the PDU in flight
    pub(crate) fn current_payload(&self) -> &[u8] {
        match self.current.as_ref().map(|pdu| &pdu.kind) {
            Some(TxKind::Data { offset, len, .. }) => self
                .data
                .front()
                .map(|front| &front.payload[*offset..*offset + *len])
                .unwrap_or_default(),
            Some(TxKind::Control { bytes, .. }) => &bytes[..],
            Some(TxKind::Empty) | None => &[],
        }
    }

    /// Release a data fragment acknowledged by the peer
    ///
    /// The payload at the front of the data queue is removed once its last fragment is
    /// acknowledged.
    pub(crate) fn data_acked(&mut self, offset: usize, len: usize) {
        let done = self
            .data
            .front()
            .map(|front| offset + len >= front.payload.len())
            .unwrap_or_default();

        if done {
            self.data.try_remove().ok();

            self.sent_offset = 0;

            self.completed = self.completed.saturating_add(1);
        }
    }

    /// Take the number of payloads completed since the last call
    pub(crate) fn take_completed(&mut self) -> u16 {
        core::mem::take(&mut self.completed)
    }

    /// Drop the queued control PDUs that `keep` returns false for
    pub(crate) fn retain_ctrl<F>(&mut self, keep: F)
    where
        F: FnMut(&ControlPdu) -> bool,
    {
        self.ctrl.retain(keep)
    }
}
