//! Controller Error Codes
//!
//! These are the error codes listed in volume one part F of the Bluetooth Core Specification that
//! are used by a link layer. They are the status of every notification sent to the host and the
//! reason code carried within the termination and reject control PDUs.

use core::fmt::{self, Display, Formatter};

macro_rules! error_codes {
    ( $( $name:ident = $code:literal, $desc:literal; )* ) => {
        /// A Controller Error
        ///
        /// `Error` is an enum for representing the controller error codes. `bo-tie` uses `Error`
        /// instead of the raw error codes because `Error` implements `Debug` and `Display` to print
        /// out the error *names* instead of just an error code.
        ///
        /// ### `NoError`
        /// The enum `NoError` is created from the error code zero. There is no official error for
        /// zero, but it is used as the status of a notification to signify there was no error.
        ///
        /// ### `Unknown`
        /// A peer device may send a reason code that is not part of the list supported by this
        /// library. These error codes get turned into the error `Unknown`.
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Error {
            $( $name, )*
            Unknown(u8),
        }

        impl Error {
            /// Get the raw error code
            pub fn code(self) -> u8 {
                match self {
                    $( Error::$name => $code, )*
                    Error::Unknown(raw) => raw,
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $( Error::$name => stringify!($name), )*
                    Error::Unknown(_) => "Unknown",
                }
            }

            fn description(self) -> &'static str {
                match self {
                    $( Error::$name => $desc, )*
                    Error::Unknown(_) => "unknown error code",
                }
            }
        }

        impl From<u8> for Error {
            fn from(raw: u8) -> Self {
                match raw {
                    $( $code => Error::$name, )*
                    _ => Error::Unknown(raw),
                }
            }
        }
    };
}

error_codes! {
    NoError = 0x00, "no error";
    UnknownConnectionIdentifier = 0x02, "unknown connection identifier";
    HardwareFailure = 0x03, "hardware failure";
    MemoryCapacityExceeded = 0x07, "memory capacity exceeded";
    ConnectionTimeout = 0x08, "connection timeout";
    ConnectionLimitExceeded = 0x09, "connection limit exceeded";
    ConnectionAlreadyExists = 0x0b, "connection already exists";
    CommandDisallowed = 0x0c, "command disallowed";
    ConnectionRejectedDueToLimitedResources = 0x0d, "connection rejected due to limited resources";
    UnsupportedFeatureOrParameterValue = 0x11, "unsupported feature or parameter value";
    InvalidHciCommandParameters = 0x12, "invalid HCI command parameters";
    RemoteUserTerminatedConnection = 0x13, "remote user terminated connection";
    RemoteDeviceTerminatedConnectionDueToLowResources = 0x14,
        "remote device terminated connection due to low resources";
    RemoteDeviceTerminatedConnectionDueToPowerOff = 0x15, "remote device terminated connection due to power off";
    ConnectionTerminatedByLocalHost = 0x16, "connection terminated by local host";
    UnknownLmpPdu = 0x19, "unknown LMP PDU";
    UnsupportedRemoteFeature = 0x1a, "unsupported remote feature";
    InvalidLmpParametersOrInvalidLlParameters = 0x1e, "invalid LMP parameters or invalid LL parameters";
    UnspecifiedError = 0x1f, "unspecified error";
    UnsupportedLmpParameterValueOrUnsupportedLlParameterValue = 0x20,
        "unsupported LMP parameter value or unsupported LL parameter value";
    LmpResponseTimeoutOrLlResponseTimeout = 0x22, "LMP response timeout or LL response timeout";
    LmpErrorTransactionCollisionOrLlProcedureCollision = 0x23,
        "LMP error transaction collision or LL procedure collision";
    LmpPduNotAllowed = 0x24, "LMP PDU not allowed";
    InstantPassed = 0x28, "instant passed";
    DifferentTransactionCollision = 0x2a, "different transaction collision";
    ParameterOutOfMandatoryRange = 0x30, "parameter out of mandatory range";
    ControllerBusy = 0x3a, "controller busy";
    UnacceptableConnectionParameters = 0x3b, "unacceptable connection parameters";
    ConnectionTerminatedDueToMicFailure = 0x3d, "connection terminated due to MIC failure";
    ConnectionFailedToBeEstablishedOrSynchronizationTimeout = 0x3e,
        "connection failed to be established or synchronization timeout";
    OperationCancelledByHost = 0x44, "operation cancelled by host";
    PacketTooLong = 0x45, "packet too long";
}

impl Error {
    /// Check if this is `NoError`
    pub fn is_ok(self) -> bool {
        self == Error::NoError
    }

}

impl From<Error> for u8 {
    fn from(error: Error) -> Self {
        error.code()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} (0x{:X})", self.name(), self.code())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Error::NoError => f.write_str("no error"),
            Error::Unknown(val) => write!(f, "unknown error code (0x{:X})", val),
            _ => {
                f.write_str("controller error: ")?;

                f.write_str(self.description())?;

                f.write_str(" (see the Bluetooth Core Specification vol 1, part F: Controller Error Codes)")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
