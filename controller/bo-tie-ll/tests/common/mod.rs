//! Test scaffolding for the link layer
//!
//! The link layer is driven by a `MockPhy` that records everything asked of the radio, and its
//! notifications are kept by a `Recorder`. Tests play the role of the peer by completing the radio
//! operations with the PDUs the peer would send.

#![allow(dead_code)]

use bo_tie_ll::channel::DataChannelIndex;
use bo_tie_ll::pdu::{ControlPdu, DataHeader, Llid};
use bo_tie_ll::phy::{Completion, PhyBusy, RxStatus, TxMode};
use bo_tie_ll::time::{ConnectionInterval, ConnectionParameters, Instant, SlaveLatency, SupervisionTimeout};
use bo_tie_ll::{
    AddressType, BluetoothDeviceAddress, Config, ConnectionHandle, HostSink, LinkLayer, Notification, Phy,
};
use core::time::Duration;
use rand::rngs::StdRng;
use rand::SeedableRng;

pub const LOCAL: BluetoothDeviceAddress = BluetoothDeviceAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

pub const PEER: BluetoothDeviceAddress = BluetoothDeviceAddress([0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);

/// The time the connection request sent to `PEER` ends
pub const CONN_REQ_END: Instant = Instant::from_micros(1000);

/// The signal strength of every PDU received from the peer
pub const PEER_RSSI: i8 = -60;

/// A PDU passed to the radio for transmission
#[derive(Clone, Debug)]
pub struct Transmission {
    pub at: Instant,
    pub channel: Option<DataChannelIndex>,
    pub access_address: u32,
    pub header: DataHeader,
    pub payload: Vec<u8>,
    pub mode: TxMode,
}

#[derive(Debug, Default)]
pub struct MockPhy {
    pub now: Instant,
    pub armed: Option<Instant>,
    pub channel: Option<DataChannelIndex>,
    pub rf_channel: Option<u8>,
    pub access_address: u32,
    pub crc_init: u32,
    pub tx_power: i8,
    pub transmitted: Vec<Transmission>,
    /// The receive windows opened
    pub receives: Vec<(Instant, Duration)>,
    pub disabled: usize,
    /// Refuse every radio operation
    pub busy: bool,
}

impl MockPhy {
    /// Get the number of radio operations started
    pub fn operations(&self) -> usize {
        self.transmitted.len() + self.receives.len()
    }

    pub fn last_tx(&self) -> &Transmission {
        self.transmitted.last().expect("nothing was transmitted")
    }
}

impl Phy for MockPhy {
    fn now(&self) -> Instant {
        self.now
    }

    fn arm_timer(&mut self, at: Instant) {
        self.armed = Some(at)
    }

    fn disarm_timer(&mut self) {
        self.armed = None
    }

    fn set_channel(&mut self, channel: DataChannelIndex) {
        self.channel = Some(channel);
        self.rf_channel = Some(channel.rf_channel());
    }

    fn set_tx_power(&mut self, dbm: i8) {
        self.tx_power = dbm
    }

    fn set_access_address(&mut self, access_address: u32) {
        self.access_address = access_address
    }

    fn set_crc_init(&mut self, crc_init: u32) {
        self.crc_init = crc_init
    }

    fn transmit(&mut self, header: [u8; 2], payload: &[u8], mode: TxMode) -> Result<(), PhyBusy> {
        if self.busy {
            return Err(PhyBusy);
        }

        let header = DataHeader::try_from_bytes(header).expect("invalid header transmitted");

        assert_eq!(header.length as usize, payload.len(), "header length does not match payload");

        self.transmitted.push(Transmission {
            at: self.now,
            channel: self.channel,
            access_address: self.access_address,
            header,
            payload: payload.to_vec(),
            mode,
        });

        Ok(())
    }

    fn receive(&mut self, window: Duration) -> Result<(), PhyBusy> {
        if self.busy {
            return Err(PhyBusy);
        }

        self.receives.push((self.now, window));

        Ok(())
    }

    fn disable(&mut self) {
        self.disabled += 1
    }
}

/// An owned notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recorded {
    Notification(Notification<'static>),
    Payload {
        handle: ConnectionHandle,
        llid: Llid,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Default)]
pub struct Recorder {
    pub recorded: Vec<Recorded>,
}

impl Recorder {
    pub fn notifications(&self) -> impl Iterator<Item = &Notification<'static>> + '_ {
        self.recorded.iter().filter_map(|recorded| match recorded {
            Recorded::Notification(notification) => Some(notification),
            _ => None,
        })
    }

    /// Get the reasons of every `ConnectionTerminated` of a connection
    pub fn terminations(&self, of: ConnectionHandle) -> Vec<bo_tie_ll::Error> {
        self.notifications()
            .filter_map(|notification| match notification {
                Notification::ConnectionTerminated { handle, reason } if *handle == of => Some(*reason),
                _ => None,
            })
            .collect()
    }

    /// Get the status of every `ConnectionEstablished` of a connection
    pub fn establishments(&self, of: ConnectionHandle) -> Vec<bo_tie_ll::Error> {
        self.notifications()
            .filter_map(|notification| match notification {
                Notification::ConnectionEstablished { handle, status, .. } if *handle == of => Some(*status),
                _ => None,
            })
            .collect()
    }

    /// Get the counts of every `PacketsCompleted` of a connection
    pub fn completions(&self, of: ConnectionHandle) -> Vec<u16> {
        self.notifications()
            .filter_map(|notification| match notification {
                Notification::PacketsCompleted { handle, count } if *handle == of => Some(*count),
                _ => None,
            })
            .collect()
    }

    pub fn payloads(&self) -> Vec<u8> {
        self.recorded
            .iter()
            .filter_map(|recorded| match recorded {
                Recorded::Payload { payload, .. } => Some(payload.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }
}

impl HostSink for Recorder {
    fn notify(&mut self, notification: Notification<'_>) {
        let owned = match notification {
            Notification::PayloadReceived { handle, llid, payload } => {
                self.recorded.push(Recorded::Payload {
                    handle,
                    llid,
                    payload: payload.to_vec(),
                });

                return;
            }
            Notification::ConnectionEstablished {
                handle,
                status,
                role,
                peer,
                interval,
                latency,
                timeout,
            } => Notification::ConnectionEstablished {
                handle,
                status,
                role,
                peer,
                interval,
                latency,
                timeout,
            },
            Notification::ConnectionUpdated {
                handle,
                interval,
                latency,
                timeout,
            } => Notification::ConnectionUpdated {
                handle,
                interval,
                latency,
                timeout,
            },
            Notification::ConnectionTerminated { handle, reason } => {
                Notification::ConnectionTerminated { handle, reason }
            }
            Notification::ControlProcedureFailed {
                handle,
                procedure,
                status,
            } => Notification::ControlProcedureFailed {
                handle,
                procedure,
                status,
            },
            Notification::FeaturesExchanged { handle, features } => {
                Notification::FeaturesExchanged { handle, features }
            }
            Notification::VersionExchanged { handle, version } => Notification::VersionExchanged { handle, version },
            Notification::DataLengthChanged {
                handle,
                max_tx_octets,
                max_tx_time,
                max_rx_octets,
                max_rx_time,
            } => Notification::DataLengthChanged {
                handle,
                max_tx_octets,
                max_tx_time,
                max_rx_octets,
                max_rx_time,
            },
            Notification::RemoteParameterRequest {
                handle,
                interval_min,
                interval_max,
                latency,
                timeout,
            } => Notification::RemoteParameterRequest {
                handle,
                interval_min,
                interval_max,
                latency,
                timeout,
            },
            Notification::PacketsCompleted { handle, count } => Notification::PacketsCompleted { handle, count },
        };

        self.recorded.push(Recorded::Notification(owned))
    }
}

/// The sequence numbers of the peer
///
/// The peer follows the acknowledgment protocol of the link layer under test.
#[derive(Clone, Copy, Debug, Default)]
pub struct Peer {
    pub sn: bool,
    pub nesn: bool,
}

impl Peer {
    /// Receive a PDU from the link layer under test
    ///
    /// True is returned if the PDU was new.
    pub fn receive(&mut self, header: &DataHeader) -> bool {
        if header.nesn != self.sn {
            self.sn = header.nesn;
        }

        if header.sn == self.nesn {
            self.nesn = !self.nesn;

            true
        } else {
            false
        }
    }

    /// Build a PDU (header included) sent by the peer
    pub fn pdu(&self, llid: Llid, payload: &[u8], md: bool) -> Vec<u8> {
        let header = DataHeader {
            llid,
            nesn: self.nesn,
            sn: self.sn,
            md,
            length: payload.len() as u8,
        };

        let mut pdu = header.to_bytes().to_vec();

        pdu.extend_from_slice(payload);

        pdu
    }

    pub fn empty(&self) -> Vec<u8> {
        self.pdu(Llid::Continuation, &[], false)
    }

    pub fn control(&self, pdu: ControlPdu) -> Vec<u8> {
        self.pdu(Llid::Control, &pdu.encode(), false)
    }
}

pub type TestLinkLayer<const N: usize> = LinkLayer<MockPhy, Recorder, StdRng, N>;

pub fn init_logging() {
    let _ = simplelog::TestLogger::init(simplelog::LevelFilter::Trace, simplelog::Config::default());
}

pub fn link_layer<const N: usize>() -> TestLinkLayer<N> {
    link_layer_with(Config::default())
}

pub fn link_layer_with<const N: usize>(config: Config) -> TestLinkLayer<N> {
    init_logging();

    LinkLayer::new(
        MockPhy::default(),
        Recorder::default(),
        StdRng::seed_from_u64(0x5EED),
        config,
        LOCAL,
        AddressType::Public,
    )
    .unwrap()
}

/// Connection parameters with a 30ms interval and a one second supervision timeout
pub fn parameters() -> ConnectionParameters {
    ConnectionParameters::new(
        ConnectionInterval::try_from_raw(24).unwrap(),
        SlaveLatency::try_from_raw(0).unwrap(),
        SupervisionTimeout::try_from_raw(100).unwrap(),
    )
    .unwrap()
}

/// Fire the armed timer
///
/// True is returned if a radio operation was started.
pub fn fire<const N: usize>(ll: &mut TestLinkLayer<N>) -> bool {
    let at = ll.phy().armed.expect("timer is not armed");

    let operations = ll.phy().operations();

    ll.phy_mut().now = at;
    ll.phy_mut().armed = None;

    ll.timer_fired();

    ll.phy().operations() != operations
}

/// Complete the radio operation with a received PDU
pub fn complete<const N: usize>(ll: &mut TestLinkLayer<N>, pdu: &[u8]) {
    let timestamp = ll.phy().now;

    ll.radio_complete(Completion {
        status: RxStatus::Ok,
        timestamp,
        rssi: PEER_RSSI,
        pdu: Some(pdu),
    })
}

/// Complete the radio operation without receiving anything
pub fn complete_with<const N: usize>(ll: &mut TestLinkLayer<N>, status: RxStatus) {
    let timestamp = ll.phy().now;

    ll.radio_complete(Completion {
        status,
        timestamp,
        rssi: bo_tie_ll::RSSI_UNAVAILABLE,
        pdu: None,
    })
}

/// Create and establish a connection to `PEER` as the master
///
/// The first connection event is run with the peer answering with an empty PDU.
pub fn establish_master<const N: usize>(ll: &mut TestLinkLayer<N>, peer: &mut Peer) -> ConnectionHandle {
    let handle = ll.create(PEER, AddressType::Random, parameters()).unwrap();

    ll.initiate_on_advertisement(PEER, CONN_REQ_END).unwrap();

    assert!(fire(ll), "first connection event was not started");

    let header = ll.phy().last_tx().header;

    peer.receive(&header);

    complete(ll, &peer.empty());

    handle
}
