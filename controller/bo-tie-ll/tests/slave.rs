//! Connections accepted by this device

mod common;

use bo_tie_ll::channel::{ChannelMap, HopIncrement};
use bo_tie_ll::pdu::{ConnectInd, ConnectRequestData, ConnectionUpdate, ControlPdu, Llid};
use bo_tie_ll::phy::{RxStatus, TxMode};
use bo_tie_ll::time::{ConnectionInterval, Instant, SleepClockAccuracy, SlaveLatency, SupervisionTimeout};
use bo_tie_ll::{AddressType, Error, LlError, Notification, Role, State};
use common::*;
use core::time::Duration;

fn connect_ind(advertiser: bo_tie_ll::BluetoothDeviceAddress) -> ConnectInd {
    ConnectInd {
        initiator_address: PEER,
        initiator_address_type: AddressType::Random,
        advertiser_address: advertiser,
        advertiser_address_type: AddressType::Public,
        data: ConnectRequestData {
            access_address: 0x50654AD7,
            crc_init: 0x00AB_CDEF,
            win_size: 2,
            win_offset: 4,
            interval: ConnectionInterval::try_from_raw(24).unwrap(),
            latency: SlaveLatency::try_from_raw(0).unwrap(),
            timeout: SupervisionTimeout::try_from_raw(100).unwrap(),
            channel_map: ChannelMap::ALL,
            hop: HopIncrement::try_new(7).unwrap(),
            sca: SleepClockAccuracy::Ppm51To75,
        },
    }
}

/// Start a slave connection and receive the first packet of the master at `first_rx`
fn establish_slave(ll: &mut TestLinkLayer<1>, master: &mut Peer, first_rx: Instant) -> bo_tie_ll::ConnectionHandle {
    let handle = ll.slave_start(&connect_ind(LOCAL).to_bytes(), CONN_REQ_END).unwrap();

    assert!(fire(ll));

    ll.phy_mut().now = first_rx;

    complete(ll, &master.empty());

    let reply = ll.phy().last_tx().clone();

    assert_eq!(TxMode::TxOnly, reply.mode);

    master.receive(&reply.header);

    complete_with(ll, RxStatus::Ok);

    handle
}

#[test]
fn invalid_requests_take_no_slot() {
    let mut ll = link_layer::<1>();

    let mut truncated = connect_ind(LOCAL).to_bytes().to_vec();

    truncated.pop();

    assert!(matches!(ll.slave_start(&truncated, CONN_REQ_END), Err(LlError::InvalidParameter(_))));

    assert_eq!(
        Err(LlError::InvalidParameter("connection request not addressed to this device")),
        ll.slave_start(&connect_ind(PEER).to_bytes(), CONN_REQ_END)
    );

    // a hop increment of 4 is out of range
    let mut bad_hop = connect_ind(LOCAL).to_bytes();

    bad_hop[ConnectInd::LEN - 1] = (bad_hop[ConnectInd::LEN - 1] & 0xE0) | 4;

    assert!(matches!(ll.slave_start(&bad_hop, CONN_REQ_END), Err(LlError::InvalidParameter(_))));

    assert_eq!(1, ll.pool().free_count());
    assert_eq!(None, ll.phy().armed);

    assert!(ll.slave_start(&connect_ind(LOCAL).to_bytes(), CONN_REQ_END).is_ok());

    assert_eq!(
        Err(LlError::OutOfSlots),
        ll.slave_start(&connect_ind(LOCAL).to_bytes(), CONN_REQ_END)
    );
}

#[test]
fn first_window_and_synchronization() {
    let mut ll = link_layer::<1>();
    let master = Peer::default();

    let handle = ll.slave_start(&connect_ind(LOCAL).to_bytes(), CONN_REQ_END).unwrap();

    // the transmit window starts 1.25ms + 4 * 1.25ms after the request and is widened by
    // ceil(6250us * 150ppm) + 16us
    assert_eq!(Some(Instant::from_micros(7250 - 17)), ll.phy().armed);

    assert!(fire(&mut ll));

    assert_eq!(
        (Instant::from_micros(7233), Duration::from_micros(17 * 2 + 2500 + 40)),
        ll.phy().receives[0]
    );

    // the master transmits within its transmit window
    ll.phy_mut().now = Instant::from_micros(8000);

    complete(&mut ll, &master.empty());

    let reply = ll.phy().last_tx().clone();

    assert_eq!(TxMode::TxOnly, reply.mode);
    assert_eq!((false, true), (reply.header.sn, reply.header.nesn));

    complete_with(&mut ll, RxStatus::Ok);

    assert_eq!(State::Established, ll.connection_info(handle).unwrap().state);

    assert!(matches!(
        ll.host().notifications().next(),
        Some(Notification::ConnectionEstablished {
            status: Error::NoError,
            role: Role::Slave,
            ..
        })
    ));

    // the next anchor follows the packet of the master, widened by ceil(30ms * 150ppm) + 16us
    assert_eq!(Some(Instant::from_micros(38000 - 21)), ll.phy().armed);
}

#[test]
fn crc_error_before_synchronization_ends_the_event() {
    let mut ll = link_layer::<1>();

    ll.slave_start(&connect_ind(LOCAL).to_bytes(), CONN_REQ_END).unwrap();

    assert!(fire(&mut ll));

    complete_with(&mut ll, RxStatus::CrcError);

    assert!(ll.phy().transmitted.is_empty());
    assert_eq!(1, ll.phy().disabled);
}

#[test]
fn payload_from_master() {
    let mut ll = link_layer::<1>();
    let mut master = Peer::default();

    let handle = establish_slave(&mut ll, &mut master, Instant::from_micros(8000));

    ll.enqueue_payload(handle, Llid::Start, b"pong").unwrap();

    assert!(fire(&mut ll));

    ll.phy_mut().now = Instant::from_micros(38000);

    complete(&mut ll, &master.pdu(Llid::Start, b"ping", false));

    let reply = ll.phy().last_tx().clone();

    assert_eq!(b"pong".to_vec(), reply.payload);
    assert_eq!(b"ping".to_vec(), ll.host().payloads());

    // the master missed the reply and retransmits
    complete(&mut ll, &master.pdu(Llid::Start, b"ping", false));

    let resent = ll.phy().last_tx().clone();

    assert_eq!(b"ping".to_vec(), ll.host().payloads());
    assert_eq!(reply.header, resent.header);
    assert_eq!(b"pong".to_vec(), resent.payload);
}

#[test]
fn connection_update_at_instant() {
    let mut ll = link_layer::<1>();
    let mut master = Peer::default();

    let handle = establish_slave(&mut ll, &mut master, Instant::from_micros(8000));

    assert!(fire(&mut ll));

    ll.phy_mut().now = Instant::from_micros(38000);

    let update = ControlPdu::ConnectionUpdateInd(ConnectionUpdate {
        win_size: 1,
        win_offset: 0,
        interval: 40,
        latency: 0,
        timeout: 200,
        instant: 3,
    });

    complete(&mut ll, &master.control(update));

    let reply = ll.phy().last_tx().clone();

    master.receive(&reply.header);

    complete_with(&mut ll, RxStatus::Ok);

    assert!(fire(&mut ll));

    ll.phy_mut().now = Instant::from_micros(68000);

    complete(&mut ll, &master.empty());

    let reply = ll.phy().last_tx().clone();

    master.receive(&reply.header);

    complete_with(&mut ll, RxStatus::Ok);

    let info = ll.connection_info(handle).unwrap();

    assert_eq!(3, info.event_counter);
    assert_eq!(40, info.parameters.interval.get_raw_val());

    assert!(ll.host().notifications().any(|notification| matches!(
        notification,
        Notification::ConnectionUpdated { interval, .. } if interval.get_raw_val() == 40
    )));

    // the old interval is used up to the instant
    assert!(ll.phy().armed.unwrap() < Instant::from_micros(98000));
    assert!(ll.phy().armed.unwrap() > Instant::from_micros(98000 - 1250));
}

#[test]
fn update_with_passed_instant() {
    let mut ll = link_layer::<1>();
    let mut master = Peer::default();

    let handle = establish_slave(&mut ll, &mut master, Instant::from_micros(8000));

    assert!(fire(&mut ll));

    ll.phy_mut().now = Instant::from_micros(38000);

    let update = ControlPdu::ConnectionUpdateInd(ConnectionUpdate {
        win_size: 1,
        win_offset: 0,
        interval: 40,
        latency: 0,
        timeout: 200,
        instant: 1,
    });

    complete(&mut ll, &master.control(update));

    assert!(!ll.pool().is_active(handle));
    assert_eq!(vec![Error::InstantPassed], ll.host().terminations(handle));
}
