//! Core items shared by the `bo-tie` controller crates
//!
//! This contains the Bluetooth device address, the controller error codes used as status and
//! reason values, and the stack allocated buffers used where dynamic allocation is not available.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

pub mod buffer;
pub mod errors;

use core::fmt;

/// A Bluetooth device address
///
/// The address is stored in the order it is transmitted over the air (least significant octet
/// first). The `Display` implementation prints it in the usual most significant octet first form
/// (`AA:BB:CC:DD:EE:FF`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BluetoothDeviceAddress(pub [u8; 6]);

impl BluetoothDeviceAddress {
    /// Create an address of all zeros
    pub const fn zeroed() -> Self {
        BluetoothDeviceAddress([0; 6])
    }

    /// Create an address from the most significant octet first representation
    ///
    /// ```
    /// # use bo_tie_core::BluetoothDeviceAddress;
    /// let address = BluetoothDeviceAddress::from_be_bytes([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    ///
    /// assert_eq!(address.0, [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
    /// ```
    pub const fn from_be_bytes(bytes: [u8; 6]) -> Self {
        BluetoothDeviceAddress([bytes[5], bytes[4], bytes[3], bytes[2], bytes[1], bytes[0]])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl From<[u8; 6]> for BluetoothDeviceAddress {
    fn from(raw: [u8; 6]) -> Self {
        BluetoothDeviceAddress(raw)
    }
}

impl core::ops::Deref for BluetoothDeviceAddress {
    type Target = [u8; 6];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for BluetoothDeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[5], self.0[4], self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

/// The type of a device address
///
/// This is the `TxAdd`/`RxAdd` value within an advertising channel PDU header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

impl AddressType {
    /// Get the value of the address type bit
    pub fn to_bit(self) -> bool {
        match self {
            AddressType::Public => false,
            AddressType::Random => true,
        }
    }

    /// Create an `AddressType` from the address type bit
    pub fn from_bit(bit: bool) -> Self {
        if bit {
            AddressType::Random
        } else {
            AddressType::Public
        }
    }
}
