//! Bluetooth Low Energy link layer connections
//!
//! This crate is the connection engine of a Bluetooth LE link layer. It holds the state of every
//! connection, decides which connection gets the radio for its next connection event, runs the
//! acknowledgment protocol of the data channel PDUs, and runs the link layer control procedures.
//!
//! The engine is a [`LinkLayer`]. It does not drive a radio itself, instead it is given a radio
//! timeline implementing [`Phy`] and it is called by the platform when the timer armed through
//! the `Phy` fires ([`LinkLayer::timer_fired`]) and when the radio completes an operation
//! ([`LinkLayer::radio_complete`]). Everything the host must know about is delivered to a
//! [`HostSink`].
//!
//! The engine is single threaded. When the timer and radio callbacks are run from interrupt
//! handlers the link layer should be kept within a [`Shared`](shared::Shared) so that every access
//! to it happens within a critical section.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

mod ack;
pub mod channel;
pub mod config;
pub mod connection;
pub mod ctrl;
pub mod notify;
pub mod pdu;
pub mod phy;
pub mod pool;
mod sched;
pub mod shared;
pub mod time;

pub use bo_tie_core::errors::Error;
pub use bo_tie_core::{AddressType, BluetoothDeviceAddress};
pub use channel::ChannelMap;
pub use config::Config;
pub use connection::{ConnectionHandle, ConnectionInfo, Role, State, RSSI_UNAVAILABLE};
pub use ctrl::ParameterReply;
pub use notify::{HostSink, Notification};
pub use phy::Phy;

use channel::HopIncrement;
use connection::{access_address, Connection, Flag, MASTER_WIN_OFFSET, MASTER_WIN_SIZE};
use core::fmt;
use ctrl::{ControlRequest, ProcedureKind};
use pdu::{ConnectInd, ConnectRequestData, Llid, MAX_PAYLOAD_OCTETS, MIN_PAYLOAD_OCTETS};
use pool::ConnectionPool;
use rand_core::RngCore;
use sched::Scheduler;
use time::{ConnectionParameters, Instant, ParameterProposal};

/// Error returned by the host API of the link layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LlError {
    /// Every connection slot is in use
    OutOfSlots,
    /// There is no connection with the handle
    NotFound,
    /// A procedure of the same kind is already in progress
    Busy,
    /// The transmit queue of the connection is full
    QueueFull,
    /// There is no connection being created
    NotInProgress,
    InvalidParameter(&'static str),
    /// The operation is not allowed in the current state of the connection
    CommandDisallowed,
    /// The payload is larger than the maximum data channel payload
    PayloadTooLarge,
}

impl LlError {
    /// Get the controller error code the host controller interface reports for this error
    pub fn as_status(&self) -> Error {
        match self {
            LlError::OutOfSlots => Error::ConnectionLimitExceeded,
            LlError::NotFound => Error::UnknownConnectionIdentifier,
            LlError::Busy => Error::ControllerBusy,
            LlError::QueueFull => Error::MemoryCapacityExceeded,
            LlError::NotInProgress => Error::CommandDisallowed,
            LlError::InvalidParameter(_) => Error::InvalidHciCommandParameters,
            LlError::CommandDisallowed => Error::CommandDisallowed,
            LlError::PayloadTooLarge => Error::PacketTooLong,
        }
    }
}

impl fmt::Display for LlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlError::OutOfSlots => f.write_str("no free connection slot"),
            LlError::NotFound => f.write_str("no connection for the handle"),
            LlError::Busy => f.write_str("a procedure of the same kind is in progress"),
            LlError::QueueFull => f.write_str("transmit queue is full"),
            LlError::NotInProgress => f.write_str("no connection is being created"),
            LlError::InvalidParameter(reason) => write!(f, "invalid parameter, {}", reason),
            LlError::CommandDisallowed => f.write_str("command disallowed in the state of the connection"),
            LlError::PayloadTooLarge => write!(f, "payload larger than {} octets", MAX_PAYLOAD_OCTETS),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LlError {}

/// The link layer connection engine
///
/// `MAX_CONNECTIONS` is the number of connections that can exist at the same time.
pub struct LinkLayer<P, H, R, const MAX_CONNECTIONS: usize> {
    phy: P,
    host: H,
    rng: R,
    config: Config,
    address: BluetoothDeviceAddress,
    address_type: AddressType,
    pool: ConnectionPool<MAX_CONNECTIONS>,
    sched: Scheduler,
    /// The connection created by the host that has not been established yet
    initiating: Option<ConnectionHandle>,
    host_channel_map: ChannelMap,
}

impl<P, H, R, const MAX_CONNECTIONS: usize> LinkLayer<P, H, R, MAX_CONNECTIONS>
where
    P: Phy,
    H: HostSink,
    R: RngCore,
{
    /// Create a new `LinkLayer`
    ///
    /// `address` is the device address of this device used within connection requests.
    ///
    /// # Error
    /// The configuration is invalid.
    pub fn new(
        phy: P,
        host: H,
        rng: R,
        config: Config,
        address: BluetoothDeviceAddress,
        address_type: AddressType,
    ) -> Result<Self, LlError> {
        config.validate().map_err(LlError::InvalidParameter)?;

        Ok(LinkLayer {
            phy,
            host,
            rng,
            config,
            address,
            address_type,
            pool: ConnectionPool::new(),
            sched: Scheduler::default(),
            initiating: None,
            host_channel_map: ChannelMap::ALL,
        })
    }

    pub fn phy(&self) -> &P {
        &self.phy
    }

    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool<MAX_CONNECTIONS> {
        &self.pool
    }

    fn connection_mut(&mut self, handle: ConnectionHandle) -> Result<&mut Connection, LlError> {
        self.pool.get_mut(handle).ok_or(LlError::NotFound)
    }

    fn established_mut(&mut self, handle: ConnectionHandle) -> Result<&mut Connection, LlError> {
        let connection = self.connection_mut(handle)?;

        if connection.state != State::Established
            || connection.flags.contains(Flag::LocalTerminate)
            || connection.end_reason.is_some()
        {
            Err(LlError::CommandDisallowed)
        } else {
            Ok(connection)
        }
    }

    /// Create a connection to a peer
    ///
    /// This allocates the connection as a master. The connection is not scheduled until the
    /// connection request was sent to the advertising peer, see
    /// [`initiate_on_advertisement`](LinkLayer::initiate_on_advertisement).
    ///
    /// # Error
    /// * `CommandDisallowed` if another connection is being created
    /// * `InvalidParameter` if the supervision timeout is too small for the interval and latency
    /// * `OutOfSlots` if every connection slot is used
    pub fn create(
        &mut self,
        peer: BluetoothDeviceAddress,
        peer_address_type: AddressType,
        parameters: ConnectionParameters,
    ) -> Result<ConnectionHandle, LlError> {
        if self.initiating.is_some() {
            return Err(LlError::CommandDisallowed);
        }

        if !parameters.is_timeout_valid() {
            return Err(LlError::InvalidParameter("supervision timeout is too small"));
        }

        let hop_raw = HopIncrement::MIN + (self.rng.next_u32() % 12) as u8;

        let request = ConnectRequestData {
            access_address: access_address::generate(&mut self.rng),
            crc_init: self.rng.next_u32() & 0xFF_FFFF,
            win_size: MASTER_WIN_SIZE,
            win_offset: MASTER_WIN_OFFSET,
            interval: parameters.interval,
            latency: parameters.latency,
            timeout: parameters.timeout,
            channel_map: self.host_channel_map,
            hop: HopIncrement::try_new(hop_raw).ok_or(LlError::InvalidParameter("hop increment"))?,
            sca: self.config.sleep_clock_accuracy,
        };

        let handle = self
            .pool
            .allocate(|handle| Connection::new_master(handle, peer, peer_address_type, &request, &self.config))?;

        self.initiating = Some(handle);

        log::info!("(LL) connection {} to {} requested", handle, peer);

        Ok(handle)
    }

    /// Get the connection request PDU of the connection being created
    ///
    /// # Error
    /// * `NotFound` if there is no connection with the handle
    /// * `NotInProgress` if the connection is not being created or the request was already sent
    pub fn connect_ind_pdu(&self, handle: ConnectionHandle) -> Result<ConnectInd, LlError> {
        let connection = self.pool.get(handle).ok_or(LlError::NotFound)?;

        if self.initiating != Some(handle) || connection.state != State::Idle {
            return Err(LlError::NotInProgress);
        }

        Ok(ConnectInd {
            initiator_address: self.address,
            initiator_address_type: self.address_type,
            advertiser_address: connection.peer,
            advertiser_address_type: connection.peer_address_type,
            data: connection.connect_request_data(self.config.sleep_clock_accuracy),
        })
    }

    /// The connection request was sent to the peer
    ///
    /// This is called by the advertising channel collaborator once the `CONNECT_IND` from
    /// [`connect_ind_pdu`](LinkLayer::connect_ind_pdu) was sent in response to a connectable
    /// advertisement of `peer`. `conn_req_end` is the time the transmission of the request ended.
    ///
    /// # Error
    /// * `NotInProgress` if no connection is being created
    /// * `InvalidParameter` if `peer` is not the peer of the connection being created
    /// * `CommandDisallowed` if the connection request was already sent
    pub fn initiate_on_advertisement(
        &mut self,
        peer: BluetoothDeviceAddress,
        conn_req_end: Instant,
    ) -> Result<ConnectionHandle, LlError> {
        let handle = self.initiating.ok_or(LlError::NotInProgress)?;

        let sca = self.config.sleep_clock_accuracy;

        let connection = self.connection_mut(handle)?;

        if connection.peer != peer {
            return Err(LlError::InvalidParameter("advertisement is not from the peer"));
        }

        if connection.state != State::Idle {
            return Err(LlError::CommandDisallowed);
        }

        let request = connection.connect_request_data(sca);

        connection.start(&request, conn_req_end, sca);

        log::info!(
            "(LL) connection {} created, first anchor at {}",
            handle,
            connection.timing.anchor
        );

        self.rearm();

        Ok(handle)
    }

    /// Cancel the creation of a connection
    ///
    /// The connection can be cancelled until it is established. The host is sent a
    /// `ConnectionEstablished` notification with the status `UnknownConnectionIdentifier`.
    pub fn cancel_create(&mut self) -> Result<(), LlError> {
        let handle = self.initiating.ok_or(LlError::NotInProgress)?;

        let slot = handle.slot().ok_or(LlError::NotInProgress)?;

        log::info!("(LL) creation of connection {} cancelled", handle);

        self.end_connection(slot, Error::UnknownConnectionIdentifier);

        self.rearm();

        Ok(())
    }

    /// Start a connection as a slave
    ///
    /// `pdu` is a `CONNECT_IND` received (header included) in response to a connectable
    /// advertisement of this device, and `conn_req_end` is the time its reception ended. The
    /// request is validated before a connection slot is allocated for it.
    ///
    /// # Error
    /// * `InvalidParameter` if the request is malformed, has parameters outside of their valid
    ///   ranges, or is not addressed to this device
    /// * `OutOfSlots` if every connection slot is used
    pub fn slave_start(&mut self, pdu: &[u8], conn_req_end: Instant) -> Result<ConnectionHandle, LlError> {
        let connect_ind = ConnectInd::try_from_bytes(pdu).map_err(|e| {
            log::warn!("(LL) invalid connection request: {}", e);

            LlError::InvalidParameter("invalid connection request")
        })?;

        if connect_ind.advertiser_address != self.address {
            return Err(LlError::InvalidParameter("connection request not addressed to this device"));
        }

        let handle = self.pool.allocate(|handle| {
            Connection::new_slave(
                handle,
                connect_ind.initiator_address,
                connect_ind.initiator_address_type,
                &connect_ind.data,
                conn_req_end,
                &self.config,
            )
        })?;

        log::info!(
            "(LL) connection {} created by {}",
            handle,
            connect_ind.initiator_address
        );

        self.rearm();

        Ok(handle)
    }

    /// Terminate a connection
    ///
    /// The termination procedure is started at the next connection event. Terminating a
    /// connection that is already terminating does nothing.
    ///
    /// # Error
    /// * `NotFound` if there is no connection with the handle
    /// * `CommandDisallowed` if the connection request was not sent yet (use
    ///   [`cancel_create`](LinkLayer::cancel_create))
    /// * `InvalidParameter` if `reason` is `NoError`
    pub fn terminate(&mut self, handle: ConnectionHandle, reason: Error) -> Result<(), LlError> {
        if reason.is_ok() {
            return Err(LlError::InvalidParameter("termination reason cannot be NoError"));
        }

        let connection = self.connection_mut(handle)?;

        if connection.state == State::Idle {
            return Err(LlError::CommandDisallowed);
        }

        if connection.flags.contains(Flag::LocalTerminate) || connection.end_reason.is_some() {
            log::debug!("(LL) connection {} is already terminating", handle);

            return Ok(());
        }

        log::info!("(LL) terminating connection {}: {}", handle, reason);

        connection.flags.set(Flag::LocalTerminate);

        connection.request(ControlRequest::Terminate(reason), true);

        Ok(())
    }

    /// Update the parameters of a connection
    ///
    /// As a master the update is sent to the slave, as a slave the parameters are requested from
    /// the master. The host gets a `ConnectionUpdated` notification once the new parameters are
    /// in use.
    ///
    /// # Error
    /// * `NotFound` if there is no connection with the handle
    /// * `CommandDisallowed` if the connection is not established
    /// * `Busy` if an update is already in progress
    pub fn update_parameters(&mut self, handle: ConnectionHandle, proposal: ParameterProposal) -> Result<(), LlError> {
        proposal.validate().map_err(LlError::InvalidParameter)?;

        let connection = self.established_mut(handle)?;

        let busy = [ProcedureKind::ConnectionUpdate, ProcedureKind::ConnectionParameterRequest]
            .iter()
            .any(|kind| connection.ctrl.is_requested(*kind))
            || connection.ctrl.awaiting_reply.is_some()
            || connection.pending_update.is_some();

        if busy {
            return Err(LlError::Busy);
        }

        connection.request(ControlRequest::UpdateParameters(proposal), true);

        Ok(())
    }

    /// Reply to a connection parameter request of the peer
    ///
    /// This answers a `RemoteParameterRequest` notification, which is only sent when
    /// [`Config::host_replies_parameter_requests`] is set. Accepting makes a master start a
    /// connection update with the requested parameters and makes a slave answer with
    /// `LL_CONNECTION_PARAM_RSP`. Rejecting sends `LL_REJECT_EXT_IND` with the reason.
    ///
    /// # Error
    /// * `NotFound` if there is no connection with the handle
    /// * `CommandDisallowed` if the connection is not established or no request is waiting
    /// * `InvalidParameter` if the rejection reason is `NoError`
    pub fn reply_parameter_request(&mut self, handle: ConnectionHandle, reply: ParameterReply) -> Result<(), LlError> {
        self.established_mut(handle)?.reply_parameter_request(reply)
    }

    /// Queue a payload for transmission
    ///
    /// `llid` is either `Start` for the start of a higher layer message or `Continuation` for
    /// the remainder of one. The payload is sent in fragments no larger than the effective
    /// maximum transmit octets of the connection. Its queue entry is freed once the peer has
    /// acknowledged the last fragment, which the host learns of through `PacketsCompleted`.
    ///
    /// # Error
    /// * `NotFound` if there is no connection with the handle
    /// * `InvalidParameter` if the payload is empty or `llid` is `Control`
    /// * `CommandDisallowed` if the connection is not created or it is terminating
    /// * `PayloadTooLarge` if the payload is larger than 251 octets
    /// * `QueueFull` if the transmit queue of the connection is full
    pub fn enqueue_payload(&mut self, handle: ConnectionHandle, llid: Llid, payload: &[u8]) -> Result<(), LlError> {
        if llid == Llid::Control {
            return Err(LlError::InvalidParameter("control PDUs are sent by the link layer"));
        }

        if payload.is_empty() {
            return Err(LlError::InvalidParameter("empty payload"));
        }

        let connection = self.connection_mut(handle)?;

        if connection.state == State::Idle
            || connection.flags.contains(Flag::LocalTerminate)
            || connection.end_reason.is_some()
        {
            return Err(LlError::CommandDisallowed);
        }

        connection.tx.enqueue(llid, payload)?;

        log::trace!("(LL) connection {} queued {} octets", handle, payload.len());

        Ok(())
    }

    /// Read the features of the peer
    ///
    /// The host gets a `FeaturesExchanged` notification, immediately if the features are already
    /// known.
    pub fn read_remote_features(&mut self, handle: ConnectionHandle) -> Result<(), LlError> {
        let connection = self.established_mut(handle)?;

        if connection.flags.contains(Flag::FeaturesExchanged) {
            let features = connection.remote_features;

            self.host.notify(Notification::FeaturesExchanged { handle, features });
        } else {
            connection.request(ControlRequest::FeatureExchange, true);
        }

        Ok(())
    }

    /// Read the version information of the peer
    ///
    /// The version exchange is done at most once per connection, later reads are answered from
    /// what was received.
    pub fn read_remote_version(&mut self, handle: ConnectionHandle) -> Result<(), LlError> {
        let connection = self.established_mut(handle)?;

        if connection.flags.contains(Flag::RxdVersionInd) {
            let version = connection.remote_version;

            self.host.notify(Notification::VersionExchanged { handle, version });
        } else {
            connection.request(ControlRequest::VersionExchange, true);
        }

        Ok(())
    }

    /// Change the maximum transmit data length of a connection
    ///
    /// # Error
    /// `InvalidParameter` if the octets or time are outside of their valid range or larger than
    /// what this device supports.
    pub fn set_data_length(&mut self, handle: ConnectionHandle, tx_octets: u16, tx_time: u16) -> Result<(), LlError> {
        let octets = MIN_PAYLOAD_OCTETS as u16..=self.config.supported_max_tx_octets;
        let time = config::MIN_PDU_TIME..=self.config.supported_max_tx_time;

        if !octets.contains(&tx_octets) || !time.contains(&tx_time) {
            return Err(LlError::InvalidParameter("data length not supported"));
        }

        let connection = self.established_mut(handle)?;

        connection.request(ControlRequest::DataLengthUpdate { tx_octets, tx_time }, true);

        Ok(())
    }

    /// Set the channels the host allows
    ///
    /// The map is used for new connections, and is sent to the slave of every established
    /// connection where this device is the master.
    pub fn set_host_channel_map(&mut self, map: ChannelMap) {
        self.host_channel_map = map;

        for slot in 0..MAX_CONNECTIONS {
            if let Some(connection) = self.pool.by_slot_mut(slot) {
                if connection.role == Role::Master
                    && connection.state == State::Established
                    && connection.end_reason.is_none()
                    && connection.channel_map != map
                {
                    connection.request(ControlRequest::ChannelMapUpdate(map), false);
                }
            }
        }
    }

    pub fn read_channel_map(&self, handle: ConnectionHandle) -> Result<ChannelMap, LlError> {
        self.pool
            .get(handle)
            .map(|connection| connection.channel_map)
            .ok_or(LlError::NotFound)
    }

    /// Read the RSSI of the last packet received on a connection
    ///
    /// [`RSSI_UNAVAILABLE`] is returned if nothing was received yet.
    pub fn read_rssi(&self, handle: ConnectionHandle) -> Result<i8, LlError> {
        self.pool.get(handle).map(|connection| connection.rssi).ok_or(LlError::NotFound)
    }

    pub fn connection_info(&self, handle: ConnectionHandle) -> Result<ConnectionInfo, LlError> {
        self.pool.get(handle).map(|connection| connection.info()).ok_or(LlError::NotFound)
    }
}

#[cfg(feature = "sys-rand")]
impl<P, H, const MAX_CONNECTIONS: usize> LinkLayer<P, H, rand_core::OsRng, MAX_CONNECTIONS>
where
    P: Phy,
    H: HostSink,
{
    /// Create a new `LinkLayer` using the random number generator of the operating system
    pub fn with_os_rng(
        phy: P,
        host: H,
        config: Config,
        address: BluetoothDeviceAddress,
        address_type: AddressType,
    ) -> Result<Self, LlError> {
        Self::new(phy, host, rand_core::OsRng, config, address, address_type)
    }
}
