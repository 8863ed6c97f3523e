//! Connection event timing
//!
//! The anchor point of every connection event is derived from the anchor of the previous event
//! and the connection interval. A master owns the timing of the connection, so its anchors are
//! exactly where it computed them. A slave only knows where the master should be within the
//! accuracy of both sleep clocks, so it opens its receive window early and keeps it open longer
//! by the *window widening*, and moves its anchor to the actual start of the first packet it
//! receives within an event.

use super::{unit_1250, Connection, Flag, Role, State, TxKind, TxPdu};
use crate::time::{ConnectionParameters, Instant, SleepClockAccuracy};
use core::time::Duration;

/// The number of connection intervals a created connection has to receive its first packet
const ESTABLISHMENT_INTERVALS: u32 = 6;

/// Widening always added for the jitter of the active clock
const WIDENING_JITTER: Duration = Duration::from_micros(16);

/// The inter frame space
pub(crate) const T_IFS: Duration = Duration::from_micros(150);

/// Time to receive the preamble and access address of a packet on the 1M PHY
const SYNC_TIME: Duration = Duration::from_micros(40);

/// Timing state of a connection
#[derive(Clone, Copy, Debug)]
pub(crate) struct Timing {
    pub(crate) parameters: ConnectionParameters,
    /// The counter of the connection event at `anchor`
    pub(crate) event_counter: u16,
    /// The anchor point of the current (or next) connection event
    pub(crate) anchor: Instant,
    /// The anchor of event zero
    pub(crate) first_anchor: Instant,
    /// The last time the slave synchronized to the master
    pub(crate) last_sync: Instant,
    pub(crate) window_widening: Duration,
    /// The size of the transmit window the slave must listen within
    pub(crate) tx_window: Duration,
    /// The sleep clock accuracy of the master
    pub(crate) master_sca: SleepClockAccuracy,
    /// The timestamp of the last packet received from the peer
    pub(crate) last_rx: Option<Instant>,
    /// Scheduler tick of the last event given the radio
    pub(crate) last_serviced: u64,
}

impl Timing {
    pub(crate) fn new(parameters: ConnectionParameters, master_sca: SleepClockAccuracy) -> Self {
        Timing {
            parameters,
            event_counter: 0,
            anchor: Instant::default(),
            first_anchor: Instant::default(),
            last_sync: Instant::default(),
            window_widening: Duration::ZERO,
            tx_window: Duration::ZERO,
            master_sca,
            last_rx: None,
            last_serviced: 0,
        }
    }

    pub(crate) fn interval(&self) -> Duration {
        self.parameters.interval.get_duration()
    }

    /// Calculate the window widening for the current anchor
    ///
    /// The widening is proportional to the time since the slave last synchronized and is limited
    /// so the receive windows of two consecutive events never overlap.
    fn widening(&self, local_sca: SleepClockAccuracy) -> Duration {
        let ppm = (self.master_sca.ppm() + local_sca.ppm()) as u64;

        let elapsed = self.anchor.saturating_duration_since(self.last_sync).as_micros() as u64;

        let drift = Duration::from_micros((elapsed * ppm + 999_999) / 1_000_000) + WIDENING_JITTER;

        let limit = (self.interval() / 2).saturating_sub(T_IFS);

        drift.min(limit)
    }
}

/// Instants that took effect when the connection moved to a new event
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Applied {
    pub(crate) map_applied: bool,
    /// The parameters in use before an update took effect
    pub(crate) update_applied: Option<ConnectionParameters>,
}

impl Connection {
    /// Get the time the radio must be ready for the connection event
    pub(crate) fn event_start(&self) -> Instant {
        match self.role {
            Role::Master => self.timing.anchor,
            Role::Slave => self.timing.anchor - self.timing.window_widening,
        }
    }

    /// Get how long the slave listens for the first packet of the master
    pub(crate) fn receive_window(&self) -> Duration {
        self.timing.window_widening * 2 + self.timing.tx_window + SYNC_TIME
    }

    pub(crate) fn update_widening(&mut self, local_sca: SleepClockAccuracy) {
        self.timing.window_widening = self.timing.widening(local_sca);
    }

    /// Synchronize to the first packet received from the master within an event
    pub(crate) fn sync_anchor(&mut self, timestamp: Instant) {
        self.timing.anchor = timestamp;
        self.timing.last_sync = timestamp;
        self.timing.window_widening = Duration::ZERO;
        self.timing.tx_window = Duration::ZERO;
    }

    /// Get the time the connection is lost if nothing more is received from the peer
    pub(crate) fn supervision_deadline(&self) -> Option<Instant> {
        match self.state {
            State::Idle => None,
            State::Created => Some(self.timing.first_anchor + self.timing.interval() * ESTABLISHMENT_INTERVALS),
            State::Established => Some(
                self.timing.last_rx.unwrap_or(self.timing.first_anchor)
                    + self.timing.parameters.timeout.get_duration(),
            ),
        }
    }

    /// Check if a slave may skip the connection events allowed by the slave latency
    fn can_skip_events(&self) -> bool {
        let nothing_in_flight = matches!(self.tx.current, None | Some(TxPdu { kind: TxKind::Empty, .. }));

        self.role == Role::Slave
            && self.state == State::Established
            && self.flags.contains(Flag::AllowSlaveLatency)
            && nothing_in_flight
            && !self.tx.has_more()
            && self.ctrl.is_idle()
            && self.pending_update.is_none()
            && self.pending_map.is_none()
    }

    /// Move the connection to the anchor of its next connection event
    ///
    /// The event counter is incremented once for every event passed, including the events skipped
    /// due to slave latency. Channel map and connection updates are applied at the event of their
    /// instant. `use_latency` is false when the event was lost to another connection, as that
    /// event still counts as attended by the peer.
    pub(crate) fn advance_event(&mut self, local_sca: SleepClockAccuracy, use_latency: bool) -> Applied {
        let steps = if use_latency && self.can_skip_events() {
            1 + self.timing.parameters.latency.get_latency()
        } else {
            1
        };

        let mut applied = Applied::default();

        for _ in 0..steps {
            self.timing.event_counter = self.timing.event_counter.wrapping_add(1);
            self.timing.anchor += self.timing.interval();

            let counter = self.timing.event_counter;

            if let Some(pending) = self.pending_map.filter(|pending| pending.instant == counter) {
                self.channel_map = pending.map;
                self.pending_map = None;

                applied.map_applied = true;
            }

            if let Some(update) = self.pending_update.filter(|update| update.instant == counter) {
                applied.update_applied = Some(self.timing.parameters);

                self.timing.anchor += unit_1250(update.win_offset);
                self.timing.tx_window = unit_1250(update.win_size as u16);
                self.timing.parameters = update.parameters;

                self.pending_update = None;
            }

            self.hop_channel();
        }

        if self.role == Role::Slave {
            self.update_widening(local_sca);
        }

        log::trace!(
            "(LL) connection {} event {} at {} on channel {}",
            self.handle,
            self.timing.event_counter,
            self.timing.anchor,
            self.data_channel
        );

        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelMap, HopIncrement};
    use crate::config::Config;
    use crate::connection::{ConnectionHandle, PendingUpdate};
    use crate::pdu::ConnectRequestData;
    use crate::time::{ConnectionInterval, SlaveLatency, SupervisionTimeout};
    use bo_tie_core::{AddressType, BluetoothDeviceAddress};

    fn request(latency: u16) -> ConnectRequestData {
        ConnectRequestData {
            access_address: 0x50654AD7,
            crc_init: 0x555555,
            win_size: 2,
            win_offset: 4,
            interval: ConnectionInterval::try_from_raw(40).unwrap(),
            latency: SlaveLatency::try_from_raw(latency).unwrap(),
            timeout: SupervisionTimeout::try_from_raw(400).unwrap(),
            channel_map: ChannelMap::ALL,
            hop: HopIncrement::try_new(7).unwrap(),
            sca: SleepClockAccuracy::Ppm251To500,
        }
    }

    fn slave(latency: u16) -> Connection {
        Connection::new_slave(
            ConnectionHandle::from_slot(0),
            BluetoothDeviceAddress([1, 2, 3, 4, 5, 6]),
            AddressType::Public,
            &request(latency),
            Instant::from_micros(1_000),
            &Config::default(),
        )
    }

    #[test]
    fn slave_first_window() {
        let connection = slave(0);

        // end of the request + 1.25ms + 4 * 1.25ms
        assert_eq!(Instant::from_micros(7_250), connection.timing.anchor);

        // 6.25ms since the request at 500 + 75 ppm is 3.6us rounded up, plus the 16us jitter
        assert_eq!(Duration::from_micros(20), connection.timing.window_widening);

        assert_eq!(Instant::from_micros(7_230), connection.event_start());

        assert_eq!(Duration::from_micros(40 + 2_500 + 40), connection.receive_window());

        assert_eq!(
            Some(Instant::from_micros(7_250 + 6 * 50_000)),
            connection.supervision_deadline()
        );
    }

    #[test]
    fn widening_grows_until_synchronized() {
        let mut connection = slave(0);

        let sca = SleepClockAccuracy::default();

        let mut last = connection.timing.window_widening;

        for _ in 0..10 {
            connection.advance_event(sca, true);

            assert!(connection.timing.window_widening > last);

            last = connection.timing.window_widening;
        }

        let anchor = connection.timing.anchor + Duration::from_micros(12);

        connection.sync_anchor(anchor);

        assert_eq!(Duration::ZERO, connection.timing.window_widening);

        connection.advance_event(sca, true);

        // 50ms at 575 ppm
        assert_eq!(Duration::from_micros(29 + 16), connection.timing.window_widening);
        assert_eq!(anchor + Duration::from_millis(50), connection.timing.anchor);
    }

    #[test]
    fn latency_skips_events_when_idle() {
        let mut connection = slave(3);

        connection.state = State::Established;

        let sca = SleepClockAccuracy::default();

        connection.advance_event(sca, true);

        // latency is only used once the master acknowledged something
        assert_eq!(1, connection.timing.event_counter);

        connection.flags.set(Flag::AllowSlaveLatency);

        connection.advance_event(sca, true);

        assert_eq!(5, connection.timing.event_counter);

        connection.advance_event(sca, false);

        assert_eq!(6, connection.timing.event_counter);

        connection.tx.enqueue(crate::pdu::Llid::Start, &[1]).unwrap();

        connection.advance_event(sca, true);

        assert_eq!(7, connection.timing.event_counter);
    }

    #[test]
    fn update_applied_at_instant() {
        let mut connection = slave(0);

        let old = connection.timing.parameters;

        let new = ConnectionParameters::new(
            ConnectionInterval::try_from_raw(80).unwrap(),
            SlaveLatency::default(),
            SupervisionTimeout::try_from_raw(400).unwrap(),
        )
        .unwrap();

        connection.pending_update = Some(PendingUpdate {
            parameters: new,
            win_offset: 2,
            win_size: 1,
            instant: 3,
        });

        let sca = SleepClockAccuracy::default();

        assert_eq!(Applied::default(), connection.advance_event(sca, true));
        assert_eq!(Applied::default(), connection.advance_event(sca, true));

        let before = connection.timing.anchor;

        let applied = connection.advance_event(sca, true);

        assert_eq!(Some(old), applied.update_applied);
        assert_eq!(new, connection.timing.parameters);
        assert_eq!(before + Duration::from_micros(50_000 + 2_500), connection.timing.anchor);
        assert_eq!(Duration::from_micros(1_250), connection.timing.tx_window);
        assert!(connection.pending_update.is_none());
    }
}
