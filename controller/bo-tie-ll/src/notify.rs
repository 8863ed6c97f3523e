//! Notifications to the host
//!
//! Every outcome the host must learn about is delivered as a [`Notification`] to the [`HostSink`]
//! of the link layer. Notifications are sent from within the radio and timer callbacks, so a sink
//! must not block.

use crate::connection::{ConnectionHandle, Role};
use crate::ctrl::ProcedureKind;
use crate::pdu::{Llid, VersionInfo};
use crate::time::{ConnectionInterval, SlaveLatency, SupervisionTimeout};
use bo_tie_core::errors::Error;
use bo_tie_core::BluetoothDeviceAddress;

/// A notification to the host
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notification<'a> {
    /// A connection was established, or creating it failed
    ///
    /// The connection parameters are only meaningful when `status` is `NoError`.
    ConnectionEstablished {
        handle: ConnectionHandle,
        status: Error,
        role: Role,
        peer: BluetoothDeviceAddress,
        interval: ConnectionInterval,
        latency: SlaveLatency,
        timeout: SupervisionTimeout,
    },
    /// The connection parameters changed, or an update requested by the host completed
    ConnectionUpdated {
        handle: ConnectionHandle,
        interval: ConnectionInterval,
        latency: SlaveLatency,
        timeout: SupervisionTimeout,
    },
    /// The connection is closed
    ///
    /// This is sent exactly once per established connection and the handle is free to be reused
    /// afterwards.
    ConnectionTerminated { handle: ConnectionHandle, reason: Error },
    /// A control procedure requested by the host failed
    ///
    /// `status` is the reason carried by the rejection of the peer, or
    /// `LmpResponseTimeoutOrLlResponseTimeout` if the peer never answered.
    ControlProcedureFailed {
        handle: ConnectionHandle,
        procedure: ProcedureKind,
        status: Error,
    },
    /// A data PDU was received
    PayloadReceived {
        handle: ConnectionHandle,
        llid: Llid,
        payload: &'a [u8],
    },
    /// The features of the peer are known
    FeaturesExchanged { handle: ConnectionHandle, features: u64 },
    /// The version information of the peer is known
    VersionExchanged { handle: ConnectionHandle, version: VersionInfo },
    /// The effective data lengths changed
    DataLengthChanged {
        handle: ConnectionHandle,
        max_tx_octets: u16,
        max_tx_time: u16,
        max_rx_octets: u16,
        max_rx_time: u16,
    },
    /// The peer requested new connection parameters
    ///
    /// This is only sent when the host replies to these requests, and the host must answer with
    /// [`LinkLayer::reply_parameter_request`](crate::LinkLayer::reply_parameter_request).
    RemoteParameterRequest {
        handle: ConnectionHandle,
        interval_min: ConnectionInterval,
        interval_max: ConnectionInterval,
        latency: SlaveLatency,
        timeout: SupervisionTimeout,
    },
    /// Payloads queued by the host were acknowledged by the peer
    ///
    /// `count` is the number of payloads (not fragments) that completed, each of them freeing an
    /// entry of the transmit queue.
    PacketsCompleted { handle: ConnectionHandle, count: u16 },
}

impl Notification<'_> {
    /// Get the handle of the connection this notification is about
    pub fn handle(&self) -> ConnectionHandle {
        match self {
            Notification::ConnectionEstablished { handle, .. }
            | Notification::ConnectionUpdated { handle, .. }
            | Notification::ConnectionTerminated { handle, .. }
            | Notification::ControlProcedureFailed { handle, .. }
            | Notification::PayloadReceived { handle, .. }
            | Notification::FeaturesExchanged { handle, .. }
            | Notification::VersionExchanged { handle, .. }
            | Notification::DataLengthChanged { handle, .. }
            | Notification::RemoteParameterRequest { handle, .. }
            | Notification::PacketsCompleted { handle, .. } => *handle,
        }
    }
}

/// The receiver of host notifications
pub trait HostSink {
    fn notify(&mut self, notification: Notification<'_>);
}

impl<F> HostSink for F
where
    F: FnMut(Notification<'_>),
{
    fn notify(&mut self, notification: Notification<'_>) {
        self(notification)
    }
}
