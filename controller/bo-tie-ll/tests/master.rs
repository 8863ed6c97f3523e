//! Connections created by this device

mod common;

use bo_tie_ll::channel::{remap, unmapped_channel, ChannelMap};
use bo_tie_ll::pdu::{opcode, ConnectionParam, ControlPdu, Llid};
use bo_tie_ll::phy::{RxStatus, TxMode};
use bo_tie_ll::time::{ConnectionInterval, Instant, ParameterProposal, SlaveLatency, SupervisionTimeout};
use bo_tie_ll::{
    AddressType, Config, Error, LlError, Notification, ParameterReply, Role, State, RSSI_UNAVAILABLE,
};
use common::*;

#[test]
fn connection_established() {
    let mut ll = link_layer::<2>();

    let handle = ll.create(PEER, AddressType::Random, parameters()).unwrap();

    let connect_ind = ll.connect_ind_pdu(handle).unwrap();

    assert_eq!(LOCAL, connect_ind.initiator_address);
    assert_eq!(PEER, connect_ind.advertiser_address);
    assert_eq!(24, connect_ind.data.interval.get_raw_val());
    assert_eq!(100, connect_ind.data.timeout.get_raw_val());

    // nothing is scheduled until the request is sent
    assert_eq!(None, ll.phy().armed);
    assert_eq!(State::Idle, ll.connection_info(handle).unwrap().state);
    assert_eq!(Ok(RSSI_UNAVAILABLE), ll.read_rssi(handle));

    assert_eq!(Ok(handle), ll.initiate_on_advertisement(PEER, CONN_REQ_END));

    // 1.25ms after the request, the window offset is zero
    assert_eq!(Some(Instant::from_micros(2250)), ll.phy().armed);

    assert!(fire(&mut ll));

    let first = ll.phy().last_tx().clone();

    assert_eq!(connect_ind.data.access_address, first.access_address);
    assert_eq!(Llid::Continuation, first.header.llid);
    assert_eq!((false, false, 0), (first.header.sn, first.header.nesn, first.header.length));
    assert_eq!(TxMode::TxThenRx, first.mode);

    let mut peer = Peer::default();

    peer.receive(&first.header);

    complete(&mut ll, &peer.empty());

    let info = ll.connection_info(handle).unwrap();

    assert_eq!(State::Established, info.state);
    assert_eq!(Role::Master, info.role);
    assert_eq!(1, info.event_counter);
    assert_eq!(Ok(PEER_RSSI), ll.read_rssi(handle));

    let established = ll.host().notifications().next().copied();

    assert_eq!(
        Some(Notification::ConnectionEstablished {
            handle,
            status: Error::NoError,
            role: Role::Master,
            peer: PEER,
            interval: parameters().interval,
            latency: parameters().latency,
            timeout: parameters().timeout,
        }),
        established
    );

    assert_eq!(Some(Instant::from_micros(2250 + 30_000)), ll.phy().armed);

    // another connection can be created now
    assert!(ll.create(PEER, AddressType::Random, parameters()).is_ok());
}

#[test]
fn only_one_connection_is_created_at_a_time() {
    let mut ll = link_layer::<2>();

    ll.create(PEER, AddressType::Random, parameters()).unwrap();

    assert_eq!(
        Err(LlError::CommandDisallowed),
        ll.create(PEER, AddressType::Random, parameters())
    );

    assert_eq!(
        Err(LlError::InvalidParameter("advertisement is not from the peer")),
        ll.initiate_on_advertisement(LOCAL, CONN_REQ_END)
    );
}

#[test]
fn channels_follow_the_hop_increment() {
    let mut ll = link_layer::<1>();

    let map = ChannelMap::from_channels([1, 8, 9, 20, 33]).unwrap();

    ll.set_host_channel_map(map);

    let handle = ll.create(PEER, AddressType::Random, parameters()).unwrap();

    let request = ll.connect_ind_pdu(handle).unwrap().data;

    assert_eq!(map, request.channel_map);

    ll.initiate_on_advertisement(PEER, CONN_REQ_END).unwrap();

    let mut peer = Peer::default();
    let mut unmapped = 0;

    for event in 0..20 {
        assert!(fire(&mut ll));

        let tx = ll.phy().last_tx().clone();

        unmapped = unmapped_channel(unmapped, request.hop);

        let channel = tx.channel.unwrap();

        assert_eq!(remap(unmapped, &map), channel, "event {}", event);
        assert!(map.is_used(channel.get_raw_val()));

        peer.receive(&tx.header);

        complete(&mut ll, &peer.empty());
    }

    assert_eq!(Ok(map), ll.read_channel_map(handle));
}

#[test]
fn crc_error_retransmits_the_same_pdu() {
    let mut ll = link_layer::<1>();
    let mut peer = Peer::default();

    let handle = establish_master(&mut ll, &mut peer);

    ll.enqueue_payload(handle, Llid::Start, b"hello").unwrap();

    assert!(fire(&mut ll));

    let sent = ll.phy().last_tx().clone();

    assert_eq!(b"hello".as_slice(), sent.payload.as_slice());

    complete_with(&mut ll, RxStatus::CrcError);

    let resent = ll.phy().last_tx().clone();

    assert_eq!(2, ll.phy().transmitted.iter().filter(|tx| tx.payload == b"hello").count());
    assert_eq!(sent.header, resent.header);

    // the second CRC error in a row closes the event
    let disabled = ll.phy().disabled;

    complete_with(&mut ll, RxStatus::CrcError);

    assert_eq!(disabled + 1, ll.phy().disabled);

    // and the payload is sent again in the next event
    assert!(fire(&mut ll));

    assert_eq!(sent.header, ll.phy().last_tx().header);
}

#[test]
fn fragments_are_sent_within_one_event() {
    let mut ll = link_layer::<1>();
    let mut peer = Peer::default();

    let handle = establish_master(&mut ll, &mut peer);

    let message: Vec<u8> = (0..60).collect();

    ll.enqueue_payload(handle, Llid::Start, &message).unwrap();

    assert!(fire(&mut ll));

    let mut fragments = Vec::new();

    for _ in 0..3 {
        let tx = ll.phy().last_tx().clone();

        assert!(peer.receive(&tx.header));

        fragments.push((tx.header.llid, tx.payload));

        complete(&mut ll, &peer.pdu(Llid::Start, b"ack", false));
    }

    assert_eq!(
        vec![Llid::Start, Llid::Continuation, Llid::Continuation],
        fragments.iter().map(|(llid, _)| *llid).collect::<Vec<_>>()
    );

    assert_eq!(
        vec![27, 27, 6],
        fragments.iter().map(|(_, payload)| payload.len()).collect::<Vec<_>>()
    );

    assert_eq!(message, fragments.into_iter().flat_map(|(_, payload)| payload).collect::<Vec<_>>());

    // every reply of the peer was new
    assert_eq!(b"ackackack".to_vec(), ll.host().payloads());

    // the payload completes with its last fragment, not with each one
    assert_eq!(vec![1], ll.host().completions(handle));
}

#[test]
fn supervision_timeout() {
    let mut ll = link_layer::<1>();
    let mut peer = Peer::default();

    let handle = establish_master(&mut ll, &mut peer);

    let mut events = 0;

    while ll.pool().is_active(handle) {
        if fire(&mut ll) {
            events += 1;

            complete_with(&mut ll, RxStatus::Timeout);
        }

        assert!(events < 100, "connection was never lost");
    }

    // the last packet was received at the first anchor, and 1s passes every 30ms
    assert_eq!(33, events);
    assert_eq!(Instant::from_micros(2250 + 1_000_000), ll.phy().now);

    assert_eq!(vec![Error::ConnectionTimeout], ll.host().terminations(handle));
    assert_eq!(1, ll.pool().free_count());
    assert_eq!(None, ll.phy().armed);
}

#[test]
fn establishment_failure() {
    let mut ll = link_layer::<1>();

    let handle = ll.create(PEER, AddressType::Random, parameters()).unwrap();

    ll.initiate_on_advertisement(PEER, CONN_REQ_END).unwrap();

    while ll.pool().is_active(handle) {
        if fire(&mut ll) {
            complete_with(&mut ll, RxStatus::Timeout);
        }
    }

    assert_eq!(6, ll.phy().transmitted.len());
    assert_eq!(
        vec![Error::ConnectionFailedToBeEstablishedOrSynchronizationTimeout],
        ll.host().establishments(handle)
    );
    assert!(ll.host().terminations(handle).is_empty());
}

#[test]
fn cancel_create() {
    let mut ll = link_layer::<1>();

    assert_eq!(Err(LlError::NotInProgress), ll.cancel_create());

    let handle = ll.create(PEER, AddressType::Random, parameters()).unwrap();

    ll.cancel_create().unwrap();

    assert_eq!(vec![Error::UnknownConnectionIdentifier], ll.host().establishments(handle));
    assert_eq!(Err(LlError::NotFound), ll.connect_ind_pdu(handle));
    assert_eq!(1, ll.pool().free_count());

    assert!(ll.create(PEER, AddressType::Random, parameters()).is_ok());
}

#[test]
fn local_termination_is_notified_once() {
    let mut ll = link_layer::<1>();
    let mut peer = Peer::default();

    let handle = establish_master(&mut ll, &mut peer);

    assert_eq!(
        Err(LlError::InvalidParameter("termination reason cannot be NoError")),
        ll.terminate(handle, Error::NoError)
    );

    ll.terminate(handle, Error::RemoteUserTerminatedConnection).unwrap();
    ll.terminate(handle, Error::RemoteUserTerminatedConnection).unwrap();

    assert_eq!(Err(LlError::CommandDisallowed), ll.enqueue_payload(handle, Llid::Start, b"late"));

    assert!(fire(&mut ll));

    let tx = ll.phy().last_tx().clone();

    assert_eq!(Llid::Control, tx.header.llid);
    assert_eq!(vec![opcode::TERMINATE_IND, 0x13], tx.payload);

    peer.receive(&tx.header);

    // the peer acknowledges with its own termination
    complete(
        &mut ll,
        &peer.control(ControlPdu::TerminateInd {
            reason: Error::RemoteUserTerminatedConnection,
        }),
    );

    // the termination of the peer is acknowledged before closing
    assert_eq!(TxMode::TxOnly, ll.phy().last_tx().mode);

    complete_with(&mut ll, RxStatus::Ok);

    assert!(!ll.pool().is_active(handle));
    assert_eq!(vec![Error::ConnectionTerminatedByLocalHost], ll.host().terminations(handle));

    assert_eq!(Err(LlError::NotFound), ll.terminate(handle, Error::RemoteUserTerminatedConnection));
}

#[test]
fn peer_termination() {
    let mut ll = link_layer::<1>();
    let mut peer = Peer::default();

    let handle = establish_master(&mut ll, &mut peer);

    assert!(fire(&mut ll));

    let header = ll.phy().last_tx().header;

    peer.receive(&header);

    complete(
        &mut ll,
        &peer.control(ControlPdu::TerminateInd {
            reason: Error::RemoteUserTerminatedConnection,
        }),
    );

    // the termination is acknowledged before the connection is closed
    let ack = ll.phy().last_tx().clone();

    assert_eq!(TxMode::TxOnly, ack.mode);
    assert_eq!(!header.nesn, ack.header.nesn);
    assert!(ll.host().terminations(handle).is_empty());

    complete_with(&mut ll, RxStatus::Ok);

    assert_eq!(vec![Error::RemoteUserTerminatedConnection], ll.host().terminations(handle));
    assert_eq!(0, ll.pool().active_count());
}

#[test]
fn remote_features_are_read_once() {
    let mut ll = link_layer::<1>();
    let mut peer = Peer::default();

    let handle = establish_master(&mut ll, &mut peer);

    ll.read_remote_features(handle).unwrap();
    ll.read_remote_version(handle).unwrap();

    assert!(fire(&mut ll));

    // one procedure at a time, features first
    let tx = ll.phy().last_tx().clone();

    assert_eq!(Some(&opcode::FEATURE_REQ), tx.payload.first());

    peer.receive(&tx.header);

    complete(&mut ll, &peer.control(ControlPdu::FeatureRsp { features: 0x21 }));

    let tx = ll.phy().last_tx().clone();

    assert_eq!(Some(&opcode::VERSION_IND), tx.payload.first());

    let features = ll
        .host()
        .notifications()
        .filter(|notification| matches!(notification, Notification::FeaturesExchanged { features: 0x21, .. }))
        .count();

    assert_eq!(1, features);

    // the features are known now
    ll.read_remote_features(handle).unwrap();

    let features = ll
        .host()
        .notifications()
        .filter(|notification| matches!(notification, Notification::FeaturesExchanged { .. }))
        .count();

    assert_eq!(2, features);
}

#[test]
fn concurrent_parameter_request_is_rejected() {
    let mut ll = link_layer::<1>();
    let mut peer = Peer::default();

    let handle = establish_master(&mut ll, &mut peer);

    let proposal = ParameterProposal::new(
        ConnectionInterval::try_from_raw(40).unwrap(),
        ConnectionInterval::try_from_raw(40).unwrap(),
        SlaveLatency::try_from_raw(0).unwrap(),
        SupervisionTimeout::try_from_raw(200).unwrap(),
    )
    .unwrap();

    ll.update_parameters(handle, proposal).unwrap();

    assert_eq!(Err(LlError::Busy), ll.update_parameters(handle, proposal));

    assert!(fire(&mut ll));

    let tx = ll.phy().last_tx().clone();

    assert_eq!(Some(&opcode::CONNECTION_UPDATE_IND), tx.payload.first());

    peer.receive(&tx.header);

    let request = ControlPdu::ConnectionParamReq(ConnectionParam {
        interval_min: 24,
        interval_max: 48,
        latency: 0,
        timeout: 100,
        preferred_periodicity: 0,
        reference_event_counter: 0,
        offsets: [0xFFFF; 6],
    });

    complete(&mut ll, &peer.control(request));

    let tx = ll.phy().last_tx().clone();

    assert_eq!(
        vec![opcode::REJECT_EXT_IND, opcode::CONNECTION_PARAM_REQ, 0x2A],
        tx.payload
    );

    // the update of this device carries on
    assert!(ll.pool().is_active(handle));
    assert!(ll.host().terminations(handle).is_empty());
}

#[test]
fn host_accepts_parameter_request() {
    let config = Config {
        host_replies_parameter_requests: true,
        tx_power: -8,
        ..Config::default()
    };

    let mut ll = link_layer_with::<1>(config);
    let mut peer = Peer::default();

    let handle = establish_master(&mut ll, &mut peer);

    assert_eq!(-8, ll.phy().tx_power);
    assert_eq!(
        ll.phy().channel.map(|channel| channel.rf_channel()),
        ll.phy().rf_channel
    );

    assert_eq!(
        Err(LlError::CommandDisallowed),
        ll.reply_parameter_request(handle, ParameterReply::Accept)
    );

    assert!(fire(&mut ll));

    peer.receive(&ll.phy().last_tx().header);

    let request = ControlPdu::ConnectionParamReq(ConnectionParam {
        interval_min: 24,
        interval_max: 48,
        latency: 0,
        timeout: 100,
        preferred_periodicity: 0,
        reference_event_counter: 0,
        offsets: [0xFFFF; 6],
    });

    complete(&mut ll, &peer.control(request));

    assert!(matches!(
        ll.host().notifications().last(),
        Some(Notification::RemoteParameterRequest { handle: h, interval_min, .. })
            if *h == handle && interval_min.get_raw_val() == 24
    ));

    // nothing is sent to the peer until the host replies
    assert!(ll.phy().transmitted.iter().all(|tx| tx.payload.is_empty()));

    ll.reply_parameter_request(handle, ParameterReply::Accept).unwrap();

    assert!(fire(&mut ll));

    assert_eq!(
        Some(&opcode::CONNECTION_UPDATE_IND),
        ll.phy().last_tx().payload.first()
    );
}
