//! Link layer PDUs
//!
//! This contains the data channel PDU header, the link layer control PDUs, and the connection
//! request PDU (`CONNECT_IND`) sent on the advertising channel to create a connection.
//!
//! # Data Channel Header
//! ```notrust
//! LSB                                                                   MSB
//! +----------+---------+---------+---------+------------+----------------+
//! |   LLID   |  NESN   |   SN    |   MD    |     -      |     Length     |
//! | (2 bits) | (1 bit) | (1 bit) | (1 bit) |  (3 bits)  |    (8 bits)    |
//! +----------+---------+---------+---------+------------+----------------+
//! ```

use crate::channel::{ChannelMap, HopIncrement};
use crate::time::{ConnectionInterval, ConnectionParameters, SleepClockAccuracy, SlaveLatency, SupervisionTimeout};
use bo_tie_core::buffer::stack::LinearBuffer;
use bo_tie_core::errors::Error;
use bo_tie_core::{AddressType, BluetoothDeviceAddress};
use core::fmt;
use core::ops::Deref;

/// The largest payload of a data channel PDU
pub const MAX_PAYLOAD_OCTETS: usize = 251;

/// The payload size every device must support
pub const MIN_PAYLOAD_OCTETS: usize = 27;

/// The largest control PDU (opcode included)
pub const MAX_CONTROL_OCTETS: usize = 27;

/// A data channel payload buffer
pub type Payload = LinearBuffer<MAX_PAYLOAD_OCTETS, u8>;

/// Error when decoding a PDU
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PduError {
    /// The reserved LLID value was received
    ReservedLlid,
    /// The control PDU is empty
    MissingOpcode,
    /// The opcode is not supported
    UnsupportedOpcode(u8),
    /// The PDU length does not match the length required by its type
    InvalidLength { expected: usize, found: usize },
    /// The advertising PDU is not a connection request
    NotConnectInd(u8),
    /// A field contains a value outside of its valid range
    InvalidField(&'static str),
}

impl fmt::Display for PduError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PduError::ReservedLlid => f.write_str("reserved LLID"),
            PduError::MissingOpcode => f.write_str("control PDU without an opcode"),
            PduError::UnsupportedOpcode(op) => write!(f, "unsupported control opcode 0x{:02X}", op),
            PduError::InvalidLength { expected, found } => {
                write!(f, "invalid PDU length, expected {} found {}", expected, found)
            }
            PduError::NotConnectInd(ty) => write!(f, "advertising PDU type 0x{:X} is not CONNECT_IND", ty),
            PduError::InvalidField(field) => write!(f, "invalid field: {}", field),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PduError {}

/// The logical link identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Llid {
    /// Continuation fragment of a higher layer message, or an empty PDU
    Continuation,
    /// Start of a higher layer message (or a complete message)
    Start,
    /// Link layer control PDU
    Control,
}

impl Llid {
    pub fn get_raw_val(self) -> u8 {
        match self {
            Llid::Continuation => 0b01,
            Llid::Start => 0b10,
            Llid::Control => 0b11,
        }
    }

    pub fn try_from_raw(raw: u8) -> Result<Self, PduError> {
        match raw & 0b11 {
            0b01 => Ok(Llid::Continuation),
            0b10 => Ok(Llid::Start),
            0b11 => Ok(Llid::Control),
            _ => Err(PduError::ReservedLlid),
        }
    }
}

/// The header of a data channel PDU
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataHeader {
    pub llid: Llid,
    /// Next expected sequence number
    pub nesn: bool,
    /// Sequence number
    pub sn: bool,
    /// More data
    pub md: bool,
    pub length: u8,
}

impl DataHeader {
    /// Create the header of an empty PDU
    pub fn empty(nesn: bool, sn: bool, md: bool) -> Self {
        DataHeader {
            llid: Llid::Continuation,
            nesn,
            sn,
            md,
            length: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; 2] {
        let first =
            self.llid.get_raw_val() | (self.nesn as u8) << 2 | (self.sn as u8) << 3 | (self.md as u8) << 4;

        [first, self.length]
    }

    pub fn try_from_bytes(bytes: [u8; 2]) -> Result<Self, PduError> {
        Ok(DataHeader {
            llid: Llid::try_from_raw(bytes[0])?,
            nesn: bytes[0] & (1 << 2) != 0,
            sn: bytes[0] & (1 << 3) != 0,
            md: bytes[0] & (1 << 4) != 0,
            length: bytes[1],
        })
    }
}

/// Control PDU opcodes
pub mod opcode {
    pub const CONNECTION_UPDATE_IND: u8 = 0x00;
    pub const CHANNEL_MAP_IND: u8 = 0x01;
    pub const TERMINATE_IND: u8 = 0x02;
    pub const UNKNOWN_RSP: u8 = 0x07;
    pub const FEATURE_REQ: u8 = 0x08;
    pub const FEATURE_RSP: u8 = 0x09;
    pub const VERSION_IND: u8 = 0x0C;
    pub const REJECT_IND: u8 = 0x0D;
    pub const SLAVE_FEATURE_REQ: u8 = 0x0E;
    pub const CONNECTION_PARAM_REQ: u8 = 0x0F;
    pub const CONNECTION_PARAM_RSP: u8 = 0x10;
    pub const REJECT_EXT_IND: u8 = 0x11;
    pub const LENGTH_REQ: u8 = 0x14;
    pub const LENGTH_RSP: u8 = 0x15;
}

/// Fields of `LL_CONNECTION_UPDATE_IND`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionUpdate {
    pub win_size: u8,
    pub win_offset: u16,
    pub interval: u16,
    pub latency: u16,
    pub timeout: u16,
    pub instant: u16,
}

impl ConnectionUpdate {
    /// Get the connection parameters of this update
    pub fn parameters(&self) -> Result<ConnectionParameters, PduError> {
        let interval = ConnectionInterval::try_from_raw(self.interval).map_err(PduError::InvalidField)?;
        let latency = SlaveLatency::try_from_raw(self.latency).map_err(PduError::InvalidField)?;
        let timeout = SupervisionTimeout::try_from_raw(self.timeout).map_err(PduError::InvalidField)?;

        ConnectionParameters::new(interval, latency, timeout).map_err(PduError::InvalidField)
    }
}

/// Fields of `LL_CONNECTION_PARAM_REQ` and `LL_CONNECTION_PARAM_RSP`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionParam {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub timeout: u16,
    pub preferred_periodicity: u8,
    pub reference_event_counter: u16,
    pub offsets: [u16; 6],
}

/// Fields of `LL_VERSION_IND`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VersionInfo {
    pub version: u8,
    pub company_id: u16,
    pub sub_version: u16,
}

/// Fields of `LL_LENGTH_REQ` and `LL_LENGTH_RSP`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LengthParameters {
    pub max_rx_octets: u16,
    pub max_rx_time: u16,
    pub max_tx_octets: u16,
    pub max_tx_time: u16,
}

/// A link layer control PDU
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlPdu {
    ConnectionUpdateInd(ConnectionUpdate),
    ChannelMapInd { map: ChannelMap, instant: u16 },
    TerminateInd { reason: Error },
    UnknownRsp { unknown_type: u8 },
    FeatureReq { features: u64 },
    FeatureRsp { features: u64 },
    VersionInd(VersionInfo),
    RejectInd { reason: Error },
    SlaveFeatureReq { features: u64 },
    ConnectionParamReq(ConnectionParam),
    ConnectionParamRsp(ConnectionParam),
    RejectExtInd { reject_opcode: u8, reason: Error },
    LengthReq(LengthParameters),
    LengthRsp(LengthParameters),
}

/// An encoded control PDU payload
#[derive(Clone, Copy)]
pub struct ControlPayload {
    bytes: [u8; MAX_CONTROL_OCTETS],
    len: usize,
}

impl ControlPayload {
    fn new(opcode: u8) -> Self {
        let mut bytes = [0; MAX_CONTROL_OCTETS];

        bytes[0] = opcode;

        ControlPayload { bytes, len: 1 }
    }

    fn put(&mut self, data: &[u8]) {
        self.bytes[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
    }

    fn put_u16(&mut self, val: u16) {
        self.put(&val.to_le_bytes())
    }
}

impl Deref for ControlPayload {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes[..self.len]
    }
}

impl fmt::Debug for ControlPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.deref(), f)
    }
}

fn le16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];

    raw.copy_from_slice(&bytes[at..at + 8]);

    u64::from_le_bytes(raw)
}

impl ControlPdu {
    pub fn opcode(&self) -> u8 {
        match self {
            ControlPdu::ConnectionUpdateInd(_) => opcode::CONNECTION_UPDATE_IND,
            ControlPdu::ChannelMapInd { .. } => opcode::CHANNEL_MAP_IND,
            ControlPdu::TerminateInd { .. } => opcode::TERMINATE_IND,
            ControlPdu::UnknownRsp { .. } => opcode::UNKNOWN_RSP,
            ControlPdu::FeatureReq { .. } => opcode::FEATURE_REQ,
            ControlPdu::FeatureRsp { .. } => opcode::FEATURE_RSP,
            ControlPdu::VersionInd(_) => opcode::VERSION_IND,
            ControlPdu::RejectInd { .. } => opcode::REJECT_IND,
            ControlPdu::SlaveFeatureReq { .. } => opcode::SLAVE_FEATURE_REQ,
            ControlPdu::ConnectionParamReq(_) => opcode::CONNECTION_PARAM_REQ,
            ControlPdu::ConnectionParamRsp(_) => opcode::CONNECTION_PARAM_RSP,
            ControlPdu::RejectExtInd { .. } => opcode::REJECT_EXT_IND,
            ControlPdu::LengthReq(_) => opcode::LENGTH_REQ,
            ControlPdu::LengthRsp(_) => opcode::LENGTH_RSP,
        }
    }

    /// Get the length of the control PDU, opcode included
    fn length_of(opcode: u8) -> Option<usize> {
        let len = match opcode {
            opcode::CONNECTION_UPDATE_IND => 12,
            opcode::CHANNEL_MAP_IND => 8,
            opcode::TERMINATE_IND | opcode::UNKNOWN_RSP | opcode::REJECT_IND => 2,
            opcode::FEATURE_REQ | opcode::FEATURE_RSP | opcode::SLAVE_FEATURE_REQ => 9,
            opcode::VERSION_IND => 6,
            opcode::CONNECTION_PARAM_REQ | opcode::CONNECTION_PARAM_RSP => 24,
            opcode::REJECT_EXT_IND => 3,
            opcode::LENGTH_REQ | opcode::LENGTH_RSP => 9,
            _ => return None,
        };

        Some(len)
    }

    /// Encode this control PDU into the payload of a data channel PDU
    pub fn encode(&self) -> ControlPayload {
        let mut payload = ControlPayload::new(self.opcode());

        match self {
            ControlPdu::ConnectionUpdateInd(update) => {
                payload.put(&[update.win_size]);
                payload.put_u16(update.win_offset);
                payload.put_u16(update.interval);
                payload.put_u16(update.latency);
                payload.put_u16(update.timeout);
                payload.put_u16(update.instant);
            }
            ControlPdu::ChannelMapInd { map, instant } => {
                payload.put(&map.as_bytes());
                payload.put_u16(*instant);
            }
            ControlPdu::TerminateInd { reason } | ControlPdu::RejectInd { reason } => payload.put(&[reason.code()]),
            ControlPdu::UnknownRsp { unknown_type } => payload.put(&[*unknown_type]),
            ControlPdu::FeatureReq { features }
            | ControlPdu::FeatureRsp { features }
            | ControlPdu::SlaveFeatureReq { features } => payload.put(&features.to_le_bytes()),
            ControlPdu::VersionInd(version) => {
                payload.put(&[version.version]);
                payload.put_u16(version.company_id);
                payload.put_u16(version.sub_version);
            }
            ControlPdu::ConnectionParamReq(param) | ControlPdu::ConnectionParamRsp(param) => {
                payload.put_u16(param.interval_min);
                payload.put_u16(param.interval_max);
                payload.put_u16(param.latency);
                payload.put_u16(param.timeout);
                payload.put(&[param.preferred_periodicity]);
                payload.put_u16(param.reference_event_counter);
                param.offsets.iter().for_each(|offset| payload.put_u16(*offset));
            }
            ControlPdu::RejectExtInd { reject_opcode, reason } => payload.put(&[*reject_opcode, reason.code()]),
            ControlPdu::LengthReq(length) | ControlPdu::LengthRsp(length) => {
                payload.put_u16(length.max_rx_octets);
                payload.put_u16(length.max_rx_time);
                payload.put_u16(length.max_tx_octets);
                payload.put_u16(length.max_tx_time);
            }
        }

        debug_assert_eq!(Self::length_of(self.opcode()), Some(payload.len));

        payload
    }

    /// Decode a control PDU from the payload of a data channel PDU
    ///
    /// # Error
    /// `UnsupportedOpcode` is returned for an opcode this link layer does not know. A known opcode
    /// with the wrong payload length is `InvalidLength` and one with an invalid field (for now only
    /// the channel map) is `InvalidField`.
    pub fn try_from_payload(payload: &[u8]) -> Result<Self, PduError> {
        let op = *payload.first().ok_or(PduError::MissingOpcode)?;

        let expected = Self::length_of(op).ok_or(PduError::UnsupportedOpcode(op))?;

        if payload.len() != expected {
            return Err(PduError::InvalidLength {
                expected,
                found: payload.len(),
            });
        }

        let b = &payload[1..];

        let pdu = match op {
            opcode::CONNECTION_UPDATE_IND => ControlPdu::ConnectionUpdateInd(ConnectionUpdate {
                win_size: b[0],
                win_offset: le16(b, 1),
                interval: le16(b, 3),
                latency: le16(b, 5),
                timeout: le16(b, 7),
                instant: le16(b, 9),
            }),
            opcode::CHANNEL_MAP_IND => {
                let map = ChannelMap::try_from_bytes([b[0], b[1], b[2], b[3], b[4]])
                    .map_err(|_| PduError::InvalidField("channel map"))?;

                ControlPdu::ChannelMapInd {
                    map,
                    instant: le16(b, 5),
                }
            }
            opcode::TERMINATE_IND => ControlPdu::TerminateInd { reason: b[0].into() },
            opcode::UNKNOWN_RSP => ControlPdu::UnknownRsp { unknown_type: b[0] },
            opcode::FEATURE_REQ => ControlPdu::FeatureReq { features: le64(b, 0) },
            opcode::FEATURE_RSP => ControlPdu::FeatureRsp { features: le64(b, 0) },
            opcode::SLAVE_FEATURE_REQ => ControlPdu::SlaveFeatureReq { features: le64(b, 0) },
            opcode::VERSION_IND => ControlPdu::VersionInd(VersionInfo {
                version: b[0],
                company_id: le16(b, 1),
                sub_version: le16(b, 3),
            }),
            opcode::REJECT_IND => ControlPdu::RejectInd { reason: b[0].into() },
            opcode::CONNECTION_PARAM_REQ | opcode::CONNECTION_PARAM_RSP => {
                let mut offsets = [0u16; 6];

                offsets
                    .iter_mut()
                    .enumerate()
                    .for_each(|(i, offset)| *offset = le16(b, 11 + 2 * i));

                let param = ConnectionParam {
                    interval_min: le16(b, 0),
                    interval_max: le16(b, 2),
                    latency: le16(b, 4),
                    timeout: le16(b, 6),
                    preferred_periodicity: b[8],
                    reference_event_counter: le16(b, 9),
                    offsets,
                };

                if op == opcode::CONNECTION_PARAM_REQ {
                    ControlPdu::ConnectionParamReq(param)
                } else {
                    ControlPdu::ConnectionParamRsp(param)
                }
            }
            opcode::REJECT_EXT_IND => ControlPdu::RejectExtInd {
                reject_opcode: b[0],
                reason: b[1].into(),
            },
            _ => {
                let length = LengthParameters {
                    max_rx_octets: le16(b, 0),
                    max_rx_time: le16(b, 2),
                    max_tx_octets: le16(b, 4),
                    max_tx_time: le16(b, 6),
                };

                if op == opcode::LENGTH_REQ {
                    ControlPdu::LengthReq(length)
                } else {
                    ControlPdu::LengthRsp(length)
                }
            }
        };

        Ok(pdu)
    }
}

/// The LL data of a connection request
///
/// This is the 22 octet `LLData` field of a `CONNECT_IND` PDU. It contains everything the slave
/// needs to follow the master onto the data channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectRequestData {
    pub access_address: u32,
    /// The 24 bit CRC initialization value
    pub crc_init: u32,
    /// The transmit window size in units of 1.25ms
    pub win_size: u8,
    /// The transmit window offset in units of 1.25ms
    pub win_offset: u16,
    pub interval: ConnectionInterval,
    pub latency: SlaveLatency,
    pub timeout: SupervisionTimeout,
    pub channel_map: ChannelMap,
    pub hop: HopIncrement,
    pub sca: SleepClockAccuracy,
}

impl ConnectRequestData {
    pub const LEN: usize = 22;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];

        bytes[0..4].copy_from_slice(&self.access_address.to_le_bytes());
        bytes[4..7].copy_from_slice(&self.crc_init.to_le_bytes()[..3]);
        bytes[7] = self.win_size;
        bytes[8..10].copy_from_slice(&self.win_offset.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.interval.get_raw_val().to_le_bytes());
        bytes[12..14].copy_from_slice(&self.latency.get_latency().to_le_bytes());
        bytes[14..16].copy_from_slice(&self.timeout.get_raw_val().to_le_bytes());
        bytes[16..21].copy_from_slice(&self.channel_map.as_bytes());
        bytes[21] = self.hop.get_raw_val() | self.sca.get_raw_val() << 5;

        bytes
    }

    /// Decode and validate the LL data of a connection request
    ///
    /// # Error
    /// Any parameter outside of its allowed range invalidates the request.
    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, PduError> {
        if bytes.len() != Self::LEN {
            return Err(PduError::InvalidLength {
                expected: Self::LEN,
                found: bytes.len(),
            });
        }

        let interval = ConnectionInterval::try_from_raw(le16(bytes, 10)).map_err(PduError::InvalidField)?;
        let latency = SlaveLatency::try_from_raw(le16(bytes, 12)).map_err(PduError::InvalidField)?;
        let timeout = SupervisionTimeout::try_from_raw(le16(bytes, 14)).map_err(PduError::InvalidField)?;

        ConnectionParameters::new(interval, latency, timeout).map_err(PduError::InvalidField)?;

        let channel_map = ChannelMap::try_from_bytes([bytes[16], bytes[17], bytes[18], bytes[19], bytes[20]])
            .map_err(|_| PduError::InvalidField("channel map"))?;

        let hop = HopIncrement::try_new(bytes[21] & 0x1F).ok_or(PduError::InvalidField("hop increment"))?;

        let win_size = bytes[7];

        let max_win_size = core::cmp::min(8, interval.get_raw_val() - 1);

        if win_size == 0 || win_size as u16 > max_win_size {
            return Err(PduError::InvalidField("transmit window size"));
        }

        let win_offset = le16(bytes, 8);

        if win_offset > interval.get_raw_val() {
            return Err(PduError::InvalidField("transmit window offset"));
        }

        Ok(ConnectRequestData {
            access_address: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            crc_init: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], 0]),
            win_size,
            win_offset,
            interval,
            latency,
            timeout,
            channel_map,
            hop,
            sca: SleepClockAccuracy::from_raw(bytes[21] >> 5),
        })
    }

    pub fn parameters(&self) -> ConnectionParameters {
        ConnectionParameters {
            interval: self.interval,
            latency: self.latency,
            timeout: self.timeout,
        }
    }
}

/// A connection request PDU
///
/// This is the complete advertising channel PDU (header included) sent by an initiator in reply to
/// a connectable advertisement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectInd {
    pub initiator_address: BluetoothDeviceAddress,
    pub initiator_address_type: AddressType,
    pub advertiser_address: BluetoothDeviceAddress,
    pub advertiser_address_type: AddressType,
    pub data: ConnectRequestData,
}

impl ConnectInd {
    const PDU_TYPE: u8 = 0b0101;

    const PAYLOAD_LEN: usize = 6 + 6 + ConnectRequestData::LEN;

    /// The length of the PDU, header included
    pub const LEN: usize = 2 + Self::PAYLOAD_LEN;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];

        bytes[0] = Self::PDU_TYPE
            | (self.initiator_address_type.to_bit() as u8) << 6
            | (self.advertiser_address_type.to_bit() as u8) << 7;
        bytes[1] = Self::PAYLOAD_LEN as u8;
        bytes[2..8].copy_from_slice(&*self.initiator_address);
        bytes[8..14].copy_from_slice(&*self.advertiser_address);
        bytes[14..].copy_from_slice(&self.data.to_bytes());

        bytes
    }

    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, PduError> {
        if bytes.len() != Self::LEN || bytes[1] as usize != Self::PAYLOAD_LEN {
            return Err(PduError::InvalidLength {
                expected: Self::LEN,
                found: bytes.len(),
            });
        }

        if bytes[0] & 0xF != Self::PDU_TYPE {
            return Err(PduError::NotConnectInd(bytes[0] & 0xF));
        }

        let mut initiator = [0u8; 6];
        let mut advertiser = [0u8; 6];

        initiator.copy_from_slice(&bytes[2..8]);
        advertiser.copy_from_slice(&bytes[8..14]);

        Ok(ConnectInd {
            initiator_address: BluetoothDeviceAddress(initiator),
            initiator_address_type: AddressType::from_bit(bytes[0] & (1 << 6) != 0),
            advertiser_address: BluetoothDeviceAddress(advertiser),
            advertiser_address_type: AddressType::from_bit(bytes[0] & (1 << 7) != 0),
            data: ConnectRequestData::try_from_bytes(&bytes[14..])?,
        })
    }
}
