//! Acknowledgment and flow control
//!
//! Data channel PDUs are acknowledged with a one bit stop-and-wait protocol. Every header carries
//! the sequence number (SN) of the PDU and the next expected sequence number (NESN) of the peer's
//! PDUs. A PDU stays in flight until the NESN of a received header differs from its SN, and a
//! received PDU is new only when its SN equals the local NESN.
//!
//! The PDU in flight is built once and kept as it is until acknowledged, so every retransmission
//! carries exactly the same header bits and payload as the original.

use crate::connection::{TxKind, TxPdu, TxQueue};
use crate::pdu::{ControlPdu, DataHeader};
use core::fmt;

/// Sequencing state of a connection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Sequencing {
    /// SN of the next new PDU transmitted
    pub(crate) tx_seqnum: bool,
    /// NESN sent to the peer
    pub(crate) next_exp_seqnum: bool,
    /// The MD bit of the last header received
    pub(crate) last_rxd_md: bool,
    /// Number of consecutive receptions with a CRC error
    pub(crate) cons_rxd_bad_crc: u8,
}

/// A PDU acknowledged by the peer
#[derive(Debug, PartialEq)]
pub(crate) enum Acked {
    Empty,
    Data,
    Control(ControlPdu),
}

/// The outcome of a received header
#[derive(Debug, PartialEq)]
pub(crate) struct Exchange {
    pub(crate) acked: Option<Acked>,
    /// The received PDU is not a retransmission
    pub(crate) is_new: bool,
}

/// The sequence bits of a received header are impossible
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SequenceError {
    /// The peer acknowledged a PDU that was never sent
    UnexpectedAck,
}

impl fmt::Display for SequenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceError::UnexpectedAck => f.write_str("acknowledgment without a PDU in flight"),
        }
    }
}

impl Sequencing {
    /// Get the header of the PDU to transmit
    ///
    /// The PDU in flight is retransmitted if there is one. Otherwise the next PDU is taken from the
    /// transmit queue (or an empty PDU is created if there is nothing to send).
    pub(crate) fn prepare_tx(&self, tx: &mut TxQueue, max_octets: usize) -> DataHeader {
        let pdu = match tx.current.take() {
            Some(pdu) => pdu,
            None => {
                let kind = tx.next_kind(max_octets);

                TxPdu {
                    kind,
                    sn: self.tx_seqnum,
                    md: tx.has_more(),
                }
            }
        };

        let header = DataHeader {
            llid: pdu.llid(),
            nesn: self.next_exp_seqnum,
            sn: pdu.sn,
            md: pdu.md,
            length: pdu.len() as u8,
        };

        tx.current = Some(pdu);

        header
    }

    /// Process the header of a PDU received with a valid CRC
    pub(crate) fn rx_exchange(&mut self, header: &DataHeader, tx: &mut TxQueue) -> Result<Exchange, SequenceError> {
        self.cons_rxd_bad_crc = 0;
        self.last_rxd_md = header.md;

        let acked = if header.nesn != self.tx_seqnum {
            let pdu = tx.current.take().ok_or(SequenceError::UnexpectedAck)?;

            self.tx_seqnum = !self.tx_seqnum;

            let acked = match pdu.kind {
                TxKind::Empty => Acked::Empty,
                TxKind::Data { offset, len, .. } => {
                    tx.data_acked(offset, len);

                    Acked::Data
                }
                TxKind::Control { pdu, .. } => Acked::Control(pdu),
            };

            Some(acked)
        } else {
            None
        };

        let is_new = header.sn == self.next_exp_seqnum;

        if is_new {
            self.next_exp_seqnum = !self.next_exp_seqnum;
        }

        Ok(Exchange { acked, is_new })
    }

    /// Record a reception with a CRC error
    ///
    /// The sequence bits are left unchanged. The number of consecutive CRC errors is returned.
    pub(crate) fn rx_crc_error(&mut self) -> u8 {
        self.cons_rxd_bad_crc = self.cons_rxd_bad_crc.saturating_add(1);

        self.cons_rxd_bad_crc
    }
}
