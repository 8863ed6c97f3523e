//! The connection state machine
//!
//! A [`Connection`] is the record of one link. It is created in the state [`State::Idle`] by the
//! master when the host asks for a connection, moves to [`State::Created`] once the connection
//! request is sent (or received by a slave), and is [`State::Established`] after the first packet
//! is received from the peer.
//!
//! The record is only mutated from the timer and radio callbacks of the
//! [`LinkLayer`](crate::LinkLayer) and the host API methods, all of which take the link layer by
//! mutable reference.

pub mod access_address;
mod flags;
mod timing;
mod tx;

pub use flags::{Flag, Flags};
pub(crate) use timing::{Applied, Timing, T_IFS};
pub(crate) use tx::{TxKind, TxPdu, TxQueue};

use crate::ack::Sequencing;
use crate::channel::{remap, unmapped_channel, ChannelMap, DataChannelIndex, HopIncrement};
use crate::config::{Config, MIN_PDU_TIME};
use crate::ctrl::ControlState;
use crate::pdu::{ConnectRequestData, LengthParameters, VersionInfo, MIN_PAYLOAD_OCTETS};
use crate::time::{ConnectionParameters, Instant, SleepClockAccuracy};
use bo_tie_core::errors::Error;
use bo_tie_core::{AddressType, BluetoothDeviceAddress};
use core::fmt;
use core::time::Duration;

/// The number of payloads the host can queue on a connection
pub const TX_QUEUE_DEPTH: usize = 8;

/// The number of control PDUs that can wait for transmission
pub const CTRL_QUEUE_DEPTH: usize = 4;

/// The transmit window size used by this device as a master (in units of 1.25ms)
pub(crate) const MASTER_WIN_SIZE: u8 = 1;

/// The transmit window offset used by this device as a master (in units of 1.25ms)
pub(crate) const MASTER_WIN_OFFSET: u16 = 0;

/// The RSSI reported before anything was received on a connection
pub const RSSI_UNAVAILABLE: i8 = 127;

/// The time from the end of the connection request to the start of the transmit window offset
pub(crate) const CONN_REQ_TO_WINDOW: Duration = Duration::from_micros(1250);

/// The connection handle
///
/// This is used as an identifier of a connection by both the host and the link layer. It is
/// assigned when the connection is allocated and stays the same for the lifetime of the
/// connection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionHandle {
    handle: u16,
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.handle)
    }
}

impl fmt::LowerHex for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.handle)
    }
}

impl fmt::UpperHex for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:X}", self.handle)
    }
}

impl ConnectionHandle {
    pub const MAX: u16 = 0x0EFF;

    const ERROR: &'static str = "Raw connection handle value larger then the maximum (0x0EFF)";

    pub fn get_raw_handle(&self) -> u16 {
        self.handle
    }

    /// Handles are one more than the index of the slot within the connection pool
    pub(crate) fn from_slot(slot: usize) -> Self {
        debug_assert!(slot < ConnectionHandle::MAX as usize);

        ConnectionHandle {
            handle: slot as u16 + 1,
        }
    }

    pub(crate) fn slot(&self) -> Option<usize> {
        (self.handle as usize).checked_sub(1)
    }
}

impl TryFrom<u16> for ConnectionHandle {
    type Error = &'static str;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        if raw <= ConnectionHandle::MAX {
            Ok(ConnectionHandle { handle: raw })
        } else {
            Err(Self::ERROR)
        }
    }
}

/// The role of this device within a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Role {
    Master,
    Slave,
}

/// The state of a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum State {
    /// Waiting for the connection request to be sent
    Idle,
    /// The connection request was sent or received but nothing was received from the peer yet
    Created,
    Established,
}

/// Maximum data lengths
///
/// The local values are what this device supports, the remote values are from the last
/// `LL_LENGTH_REQ` or `LL_LENGTH_RSP` of the peer, and the effective values are the smaller of the
/// two for each direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DataLength {
    pub(crate) local: LengthParameters,
    pub(crate) remote: LengthParameters,
    pub(crate) effective: LengthParameters,
}

impl DataLength {
    const DEFAULT: LengthParameters = LengthParameters {
        max_rx_octets: MIN_PAYLOAD_OCTETS as u16,
        max_rx_time: MIN_PDU_TIME,
        max_tx_octets: MIN_PAYLOAD_OCTETS as u16,
        max_tx_time: MIN_PDU_TIME,
    };

    fn new(config: &Config) -> Self {
        let local = LengthParameters {
            max_rx_octets: config.supported_max_rx_octets,
            max_rx_time: config.supported_max_rx_time,
            max_tx_octets: config.supported_max_tx_octets,
            max_tx_time: config.supported_max_tx_time,
        };

        DataLength {
            local,
            remote: Self::DEFAULT,
            effective: Self::DEFAULT,
        }
    }

    fn recompute(&mut self) -> bool {
        let effective = LengthParameters {
            max_rx_octets: self.local.max_rx_octets.min(self.remote.max_tx_octets),
            max_rx_time: self.local.max_rx_time.min(self.remote.max_tx_time),
            max_tx_octets: self.local.max_tx_octets.min(self.remote.max_rx_octets),
            max_tx_time: self.local.max_tx_time.min(self.remote.max_rx_time),
        };

        let changed = effective != self.effective;

        self.effective = effective;

        changed
    }

    /// Set the values received from the peer
    ///
    /// Values below the minimum every device supports are raised to that minimum. True is returned
    /// if the effective values changed.
    pub(crate) fn set_remote(&mut self, remote: &LengthParameters) -> bool {
        self.remote = LengthParameters {
            max_rx_octets: remote.max_rx_octets.max(MIN_PAYLOAD_OCTETS as u16),
            max_rx_time: remote.max_rx_time.max(MIN_PDU_TIME),
            max_tx_octets: remote.max_tx_octets.max(MIN_PAYLOAD_OCTETS as u16),
            max_tx_time: remote.max_tx_time.max(MIN_PDU_TIME),
        };

        self.recompute()
    }

    /// Set the local transmit values requested by the host
    ///
    /// The effective values are not changed until the peer has responded with its own values.
    pub(crate) fn set_local_tx(&mut self, octets: u16, time: u16) {
        self.local.max_tx_octets = octets;
        self.local.max_tx_time = time;
    }
}

/// A snapshot of the state of a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub handle: ConnectionHandle,
    pub role: Role,
    pub state: State,
    pub peer: BluetoothDeviceAddress,
    pub peer_address_type: AddressType,
    pub parameters: ConnectionParameters,
    pub channel_map: ChannelMap,
    pub data_channel: DataChannelIndex,
    pub event_counter: u16,
    pub max_tx_octets: u16,
    pub max_tx_time: u16,
    pub max_rx_octets: u16,
    pub max_rx_time: u16,
}

/// A connection parameter update scheduled for an instant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PendingUpdate {
    pub(crate) parameters: ConnectionParameters,
    pub(crate) win_offset: u16,
    pub(crate) win_size: u8,
    pub(crate) instant: u16,
}

/// A channel map update scheduled for an instant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PendingMap {
    pub(crate) map: ChannelMap,
    pub(crate) instant: u16,
}

/// The record of a connection
#[derive(Debug)]
pub struct Connection {
    pub(crate) handle: ConnectionHandle,
    pub(crate) role: Role,
    pub(crate) state: State,
    pub(crate) flags: Flags,
    pub(crate) peer: BluetoothDeviceAddress,
    pub(crate) peer_address_type: AddressType,
    pub(crate) access_address: u32,
    pub(crate) crc_init: u32,
    pub(crate) channel_map: ChannelMap,
    pub(crate) hop: HopIncrement,
    pub(crate) last_unmapped: u8,
    pub(crate) data_channel: DataChannelIndex,
    pub(crate) timing: Timing,
    pub(crate) seq: Sequencing,
    pub(crate) tx: TxQueue,
    pub(crate) ctrl: ControlState,
    pub(crate) data_length: DataLength,
    pub(crate) remote_features: u64,
    pub(crate) remote_version: VersionInfo,
    pub(crate) pending_update: Option<PendingUpdate>,
    pub(crate) pending_map: Option<PendingMap>,
    /// The RSSI of the last PDU received with a valid CRC
    pub(crate) rssi: i8,
    /// Set once the connection must be closed at the end of the current event
    pub(crate) end_reason: Option<Error>,
}

impl Connection {
    fn new(
        handle: ConnectionHandle,
        role: Role,
        peer: BluetoothDeviceAddress,
        peer_address_type: AddressType,
        request: &ConnectRequestData,
        config: &Config,
    ) -> Self {
        let last_unmapped = unmapped_channel(0, request.hop);

        Connection {
            handle,
            role,
            state: State::Idle,
            flags: Flags::new(),
            peer,
            peer_address_type,
            access_address: request.access_address,
            crc_init: request.crc_init,
            channel_map: request.channel_map,
            hop: request.hop,
            last_unmapped,
            data_channel: remap(last_unmapped, &request.channel_map),
            timing: Timing::new(request.parameters(), request.sca),
            seq: Sequencing::default(),
            tx: TxQueue::default(),
            ctrl: ControlState::default(),
            data_length: DataLength::new(config),
            remote_features: 0,
            remote_version: VersionInfo::default(),
            pending_update: None,
            pending_map: None,
            rssi: RSSI_UNAVAILABLE,
            end_reason: None,
        }
    }

    /// Create the connection of a master
    ///
    /// The connection is idle until the connection request is sent.
    pub(crate) fn new_master(
        handle: ConnectionHandle,
        peer: BluetoothDeviceAddress,
        peer_address_type: AddressType,
        request: &ConnectRequestData,
        config: &Config,
    ) -> Self {
        Connection::new(handle, Role::Master, peer, peer_address_type, request, config)
    }

    /// Create the connection of a slave from a validated connection request
    ///
    /// `conn_req_end` is the time the connection request ended.
    pub(crate) fn new_slave(
        handle: ConnectionHandle,
        peer: BluetoothDeviceAddress,
        peer_address_type: AddressType,
        request: &ConnectRequestData,
        conn_req_end: Instant,
        config: &Config,
    ) -> Self {
        let mut connection = Connection::new(handle, Role::Slave, peer, peer_address_type, request, config);

        connection.start(request, conn_req_end, config.sleep_clock_accuracy);

        connection
    }

    /// Start the connection after the connection request was sent or received
    pub(crate) fn start(&mut self, request: &ConnectRequestData, conn_req_end: Instant, local_sca: SleepClockAccuracy) {
        let window_start = conn_req_end + CONN_REQ_TO_WINDOW + unit_1250(request.win_offset);

        self.timing.first_anchor = window_start;
        self.timing.anchor = window_start;
        self.timing.last_sync = conn_req_end;
        self.timing.tx_window = unit_1250(request.win_size as u16);

        self.state = State::Created;

        if self.role == Role::Slave {
            self.update_widening(local_sca);
        }
    }

    /// Rebuild the LL data of the connection request
    pub(crate) fn connect_request_data(&self, sca: SleepClockAccuracy) -> ConnectRequestData {
        ConnectRequestData {
            access_address: self.access_address,
            crc_init: self.crc_init,
            win_size: MASTER_WIN_SIZE,
            win_offset: MASTER_WIN_OFFSET,
            interval: self.timing.parameters.interval,
            latency: self.timing.parameters.latency,
            timeout: self.timing.parameters.timeout,
            channel_map: self.channel_map,
            hop: self.hop,
            sca,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn parameters(&self) -> ConnectionParameters {
        self.timing.parameters
    }

    /// Get the current local sequence number and the expected sequence number of the peer
    pub fn sequence_bits(&self) -> (bool, bool) {
        (self.seq.tx_seqnum, self.seq.next_exp_seqnum)
    }

    /// Check if the connection is being scheduled onto the radio
    pub(crate) fn is_scheduled(&self) -> bool {
        self.state != State::Idle && self.end_reason.is_none()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            handle: self.handle,
            role: self.role,
            state: self.state,
            peer: self.peer,
            peer_address_type: self.peer_address_type,
            parameters: self.timing.parameters,
            channel_map: self.channel_map,
            data_channel: self.data_channel,
            event_counter: self.timing.event_counter,
            max_tx_octets: self.data_length.effective.max_tx_octets,
            max_tx_time: self.data_length.effective.max_tx_time,
            max_rx_octets: self.data_length.effective.max_rx_octets,
            max_rx_time: self.data_length.effective.max_rx_time,
        }
    }

    /// Move to the channel of the next connection event
    pub(crate) fn hop_channel(&mut self) {
        self.last_unmapped = unmapped_channel(self.last_unmapped, self.hop);

        self.data_channel = remap(self.last_unmapped, &self.channel_map);
    }
}

/// Convert a value in units of 1.25ms into a `Duration`
pub(crate) fn unit_1250(units: u16) -> Duration {
    Duration::from_micros(units as u64 * 1250)
}
