//! Link layer configuration

use crate::pdu::VersionInfo;
use crate::time::SleepClockAccuracy;
use core::time::Duration;

/// LE feature bits
pub mod features {
    pub const LE_ENCRYPTION: u64 = 1 << 0;
    pub const CONNECTION_PARAMETERS_REQUEST: u64 = 1 << 1;
    pub const EXTENDED_REJECT_INDICATION: u64 = 1 << 2;
    pub const SLAVE_INITIATED_FEATURES_EXCHANGE: u64 = 1 << 3;
    pub const LE_PING: u64 = 1 << 4;
    pub const DATA_PACKET_LENGTH_EXTENSION: u64 = 1 << 5;
}

/// The smallest maximum PDU time in microseconds
pub const MIN_PDU_TIME: u16 = 328;

/// The largest maximum PDU time in microseconds
pub const MAX_PDU_TIME: u16 = 2120;

/// Configuration of the link layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// The accuracy of the local sleep clock
    pub sleep_clock_accuracy: SleepClockAccuracy,
    /// The longest a single connection event may hold the radio
    pub max_event_duration: Duration,
    /// The number of consecutive CRC errors that ends a connection event
    pub max_consecutive_crc_errors: u8,
    /// The time the peer has to respond to a control procedure
    pub ctrl_procedure_timeout: Duration,
    pub supported_max_tx_octets: u16,
    pub supported_max_tx_time: u16,
    pub supported_max_rx_octets: u16,
    pub supported_max_rx_time: u16,
    /// The LE features supported by this device
    pub local_features: u64,
    /// The information sent within `LL_VERSION_IND`
    pub version: VersionInfo,
    /// Guard time kept free before the anchor point of another connection
    pub event_scheduling_margin: Duration,
    /// The transmit power used within connection events in dBm
    pub tx_power: i8,
    /// Let the host accept or reject a `LL_CONNECTION_PARAM_REQ` of the peer
    ///
    /// When this is false the request is accepted by the link layer if its parameters are valid.
    pub host_replies_parameter_requests: bool,
}

impl Config {
    /// Check the configuration for values outside of their allowed range
    pub fn validate(&self) -> Result<(), &'static str> {
        let octets = crate::pdu::MIN_PAYLOAD_OCTETS as u16..=crate::pdu::MAX_PAYLOAD_OCTETS as u16;
        let time = MIN_PDU_TIME..=MAX_PDU_TIME;

        if !octets.contains(&self.supported_max_tx_octets) || !octets.contains(&self.supported_max_rx_octets) {
            Err("supported maximum octets must be within 27..=251")
        } else if !time.contains(&self.supported_max_tx_time) || !time.contains(&self.supported_max_rx_time) {
            Err("supported maximum time must be within 328..=2120")
        } else if self.max_consecutive_crc_errors == 0 {
            Err("the maximum number of consecutive CRC errors cannot be zero")
        } else if self.max_event_duration.is_zero() {
            Err("the maximum event duration cannot be zero")
        } else {
            Ok(())
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sleep_clock_accuracy: SleepClockAccuracy::default(),
            max_event_duration: Duration::from_micros(7500),
            max_consecutive_crc_errors: 2,
            ctrl_procedure_timeout: Duration::from_secs(40),
            supported_max_tx_octets: crate::pdu::MAX_PAYLOAD_OCTETS as u16,
            supported_max_tx_time: MAX_PDU_TIME,
            supported_max_rx_octets: crate::pdu::MAX_PAYLOAD_OCTETS as u16,
            supported_max_rx_time: MAX_PDU_TIME,
            local_features: features::CONNECTION_PARAMETERS_REQUEST
                | features::EXTENDED_REJECT_INDICATION
                | features::SLAVE_INITIATED_FEATURES_EXCHANGE
                | features::DATA_PACKET_LENGTH_EXTENSION,
            version: VersionInfo {
                version: 0x09,
                company_id: 0xFFFF,
                sub_version: 0x0000,
            },
            event_scheduling_margin: Duration::from_micros(150),
            tx_power: 0,
            host_replies_parameter_requests: false,
        }
    }
}
