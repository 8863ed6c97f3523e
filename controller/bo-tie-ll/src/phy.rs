//! The radio timeline
//!
//! The link layer does not drive a radio itself. Everything it needs from the hardware is
//! described by the trait [`Phy`], which is implemented by the radio driver of the platform. The
//! driver calls back into the link layer through [`LinkLayer::timer_fired`] when the timer armed
//! with [`Phy::arm_timer`] expires and [`LinkLayer::radio_complete`] when a transmission or
//! reception has finished.
//!
//! [`LinkLayer::timer_fired`]: crate::LinkLayer::timer_fired
//! [`LinkLayer::radio_complete`]: crate::LinkLayer::radio_complete

use crate::channel::DataChannelIndex;
use crate::time::Instant;
use core::fmt;
use core::time::Duration;

/// What the radio does after a transmission
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxMode {
    /// Disable the radio once the PDU is sent
    TxOnly,
    /// Switch to receive 150us after the PDU is sent
    TxThenRx,
}

/// The outcome of a radio operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxStatus {
    /// A PDU was received with a valid CRC, or a transmission with [`TxMode::TxOnly`] finished
    Ok,
    /// A PDU was received but its CRC check failed
    CrcError,
    /// Nothing was received within the receive window
    Timeout,
}

/// A radio completion
///
/// This is delivered from the radio interrupt to [`LinkLayer::radio_complete`]. The `pdu` is the
/// received data channel PDU (header included) and is only present when `status` is
/// [`RxStatus::Ok`] and something was received.
///
/// [`LinkLayer::radio_complete`]: crate::LinkLayer::radio_complete
#[derive(Clone, Copy, Debug)]
pub struct Completion<'a> {
    pub status: RxStatus,
    /// The time the received PDU started (the end of the operation if nothing was received)
    pub timestamp: Instant,
    /// The signal strength of the received PDU in dBm
    pub rssi: i8,
    pub pdu: Option<&'a [u8]>,
}

/// The radio is already in use
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhyBusy;

impl fmt::Display for PhyBusy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("radio busy")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PhyBusy {}

/// The radio timeline capability
pub trait Phy {
    /// Get the current time
    fn now(&self) -> Instant;

    /// Arm the single timer of the link layer
    ///
    /// Arming the timer replaces any previously armed time.
    fn arm_timer(&mut self, at: Instant);

    fn disarm_timer(&mut self);

    fn set_channel(&mut self, channel: DataChannelIndex);

    /// Set the transmit power in dBm
    fn set_tx_power(&mut self, dbm: i8);

    fn set_access_address(&mut self, access_address: u32);

    fn set_crc_init(&mut self, crc_init: u32);

    /// Start transmitting a PDU now
    fn transmit(&mut self, header: [u8; 2], payload: &[u8], mode: TxMode) -> Result<(), PhyBusy>;

    /// Start receiving now for at most `window`
    fn receive(&mut self, window: Duration) -> Result<(), PhyBusy>;

    /// Abort whatever the radio is doing
    fn disable(&mut self);
}
