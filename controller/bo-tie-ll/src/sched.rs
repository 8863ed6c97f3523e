//! Connection event scheduling
//!
//! Every connection has the start time of its next connection event. The scheduler arms the timer
//! of the radio timeline for the earliest of these times (or an earlier deadline) and when it
//! fires gives the radio to the connection whose event is due. When more than one event is due at
//! the same time the connection that was least recently given the radio wins. This tie break is a
//! policy of this link layer, not something required of it, and the events that lose are skipped.
//!
//! A connection event lasts until neither side has more data, the peer stops responding, too many
//! packets in a row fail their CRC, or the time reserved for the event runs out. The time reserved
//! is limited by the configured maximum event duration, the next anchor of the connection, and
//! the start of the next event of any other connection.

use crate::ack::Acked;
use crate::connection::{Connection, Flag, Role, State, T_IFS};
use crate::ctrl::Ctx;
use crate::notify::{HostSink, Notification};
use crate::pdu::{DataHeader, Llid};
use crate::phy::{Completion, Phy, PhyBusy, RxStatus, TxMode};
use crate::time::Instant;
use crate::{ConnectionHandle, LinkLayer};
use bo_tie_core::errors::Error;
use core::time::Duration;
use rand_core::RngCore;

/// What the radio is doing for the current connection event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RadioOp {
    Receive,
    Transmit(TxMode),
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct CurrentEvent {
    pub(crate) slot: usize,
    /// The event must be closed by this time
    pub(crate) end_by: Instant,
    pub(crate) op: RadioOp,
}

#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    pub(crate) current: Option<CurrentEvent>,
    /// The time the timer is armed for
    armed: Option<Instant>,
    /// Incremented every time an event is given the radio
    tick: u64,
}

/// A connection with a due event
#[derive(Clone, Copy, Debug)]
pub(crate) struct Candidate {
    pub(crate) slot: usize,
    pub(crate) start: Instant,
    pub(crate) last_serviced: u64,
}

/// Select the connection given the radio
///
/// The earliest start wins and ties are broken by the least recently serviced connection.
pub(crate) fn select<I>(candidates: I) -> Option<usize>
where
    I: IntoIterator<Item = Candidate>,
{
    candidates
        .into_iter()
        .min_by_key(|candidate| (candidate.start, candidate.last_serviced, candidate.slot))
        .map(|candidate| candidate.slot)
}

/// The time to transmit a maximum size PDU and receive one in return
fn exchange_time(connection: &Connection) -> Duration {
    let effective = connection.data_length.effective;

    Duration::from_micros(effective.max_tx_time as u64 + effective.max_rx_time as u64) + T_IFS * 2
}

/// Transmit the PDU in flight (or the next one) of a connection
fn transmit<P: Phy>(phy: &mut P, connection: &mut Connection, mode: TxMode) -> Result<(), PhyBusy> {
    let max_octets = connection.data_length.effective.max_tx_octets as usize;

    let header = connection.seq.prepare_tx(&mut connection.tx, max_octets);

    log::trace!(
        "(LL) connection {} tx {:?} sn {} nesn {} md {} len {}",
        connection.handle,
        header.llid,
        header.sn as u8,
        header.nesn as u8,
        header.md as u8,
        header.length
    );

    phy.transmit(header.to_bytes(), connection.tx.current_payload(), mode)
}

/// The next step of a connection event after a reception
enum Next {
    Close,
    Transmit(TxMode),
}

impl<P, H, R, const MAX_CONNECTIONS: usize> LinkLayer<P, H, R, MAX_CONNECTIONS>
where
    P: Phy,
    H: HostSink,
    R: RngCore,
{
    /// The timer armed through the radio timeline fired
    pub fn timer_fired(&mut self) {
        let now = self.phy.now();

        self.sched.armed = None;

        if let Some(current) = self.sched.current {
            if now >= current.end_by {
                log::debug!("(LL) event of slot {} reached the end of its time", current.slot);

                self.close_event();
            }
        }

        self.check_deadlines(now);

        if self.sched.current.is_none() {
            self.start_due_event(now);
        }

        self.rearm();
    }

    /// The radio completed an operation
    pub fn radio_complete(&mut self, completion: Completion<'_>) {
        let current = match self.sched.current {
            Some(current) => current,
            None => {
                log::warn!("(LL) radio completion without a connection event");

                return;
            }
        };

        match (current.op, completion.status) {
            (RadioOp::Transmit(TxMode::TxOnly), _) | (_, RxStatus::Timeout) => self.close_event(),
            (_, RxStatus::CrcError) => self.rx_crc_error(current),
            (_, RxStatus::Ok) => self.rx_ok(current, completion),
        }

        self.rearm();
    }

    /// End connections with an expired supervision or procedure timeout
    fn check_deadlines(&mut self, now: Instant) {
        let current = self.sched.current.map(|current| current.slot);

        for slot in (0..MAX_CONNECTIONS).filter(|slot| Some(*slot) != current) {
            let connection = match self.pool.by_slot_mut(slot) {
                Some(connection) if connection.state != State::Idle => connection,
                _ => continue,
            };

            let lost = match connection.supervision_deadline() {
                Some(deadline) if now >= deadline && connection.state == State::Created => {
                    Some(Error::ConnectionFailedToBeEstablishedOrSynchronizationTimeout)
                }
                Some(deadline) if now >= deadline => Some(Error::ConnectionTimeout),
                _ => None,
            };

            let mut ctx = Ctx {
                now,
                config: &self.config,
                host: &mut self.host,
            };

            let reason = lost
                .or_else(|| connection.check_procedure_timeout(&mut ctx))
                .or(connection.end_reason);

            if let Some(reason) = reason {
                log::info!("(LL) connection {} lost: {}", connection.handle, reason);

                self.end_connection(slot, reason);
            }
        }
    }

    /// Start the connection event that is due
    fn start_due_event(&mut self, now: Instant) {
        let margin = self.config.event_scheduling_margin;
        let sca = self.config.sleep_clock_accuracy;

        // events that should have started already are lost
        for slot in 0..MAX_CONNECTIONS {
            if let Some(connection) = self.pool.by_slot_mut(slot).filter(|c| c.is_scheduled()) {
                let mut ctx = Ctx {
                    now,
                    config: &self.config,
                    host: &mut self.host,
                };

                while connection.event_start() + margin < now {
                    log::debug!(
                        "(LL) connection {} missed event {}",
                        connection.handle,
                        connection.timing.event_counter
                    );

                    let applied = connection.advance_event(sca, false);

                    connection.instant_applied(applied, &mut ctx);
                }
            }
        }

        let due = (0..MAX_CONNECTIONS).filter_map(|slot| {
            self.pool
                .by_slot(slot)
                .filter(|connection| connection.is_scheduled() && connection.event_start() <= now)
                .map(|connection| Candidate {
                    slot,
                    start: connection.event_start(),
                    last_serviced: connection.timing.last_serviced,
                })
        });

        let winner = match select(due) {
            Some(winner) => winner,
            None => return,
        };

        for slot in (0..MAX_CONNECTIONS).filter(|slot| *slot != winner) {
            if let Some(connection) = self
                .pool
                .by_slot_mut(slot)
                .filter(|connection| connection.is_scheduled() && connection.event_start() <= now)
            {
                log::debug!(
                    "(LL) connection {} skipped event {}, the radio is used by slot {}",
                    connection.handle,
                    connection.timing.event_counter,
                    winner
                );

                let mut ctx = Ctx {
                    now,
                    config: &self.config,
                    host: &mut self.host,
                };

                let applied = connection.advance_event(sca, false);

                connection.instant_applied(applied, &mut ctx);
            }
        }

        self.start_event(winner, now);
    }

    /// Get the earliest event start of every connection other than the one at `except`
    fn next_other_start(&self, except: usize) -> Option<Instant> {
        (0..MAX_CONNECTIONS)
            .filter(|slot| *slot != except)
            .filter_map(|slot| self.pool.by_slot(slot))
            .filter(|connection| connection.is_scheduled())
            .map(|connection| connection.event_start())
            .min()
    }

    fn start_event(&mut self, slot: usize, now: Instant) {
        let margin = self.config.event_scheduling_margin;
        let other_start = self.next_other_start(slot);

        self.sched.tick += 1;

        let tick = self.sched.tick;

        let connection = match self.pool.by_slot_mut(slot) {
            Some(connection) => connection,
            None => return,
        };

        let mut ctx = Ctx {
            now,
            config: &self.config,
            host: &mut self.host,
        };

        connection.service_procedures(&mut ctx);

        connection.flags.clear(Flag::PktRxd);
        connection.seq.cons_rxd_bad_crc = 0;
        connection.timing.last_serviced = tick;

        let start = connection.event_start();

        let mut end_by = (start + self.config.max_event_duration)
            .min(connection.timing.anchor + connection.timing.interval() - margin);

        if let Some(other) = other_start {
            end_by = end_by.min(other - margin);
        }

        self.phy.set_channel(connection.data_channel);
        self.phy.set_tx_power(self.config.tx_power);
        self.phy.set_access_address(connection.access_address);
        self.phy.set_crc_init(connection.crc_init);

        log::trace!(
            "(LL) connection {} event {} on channel {}",
            connection.handle,
            connection.timing.event_counter,
            connection.data_channel
        );

        let started = match connection.role {
            Role::Master => {
                transmit(&mut self.phy, connection, TxMode::TxThenRx).map(|_| RadioOp::Transmit(TxMode::TxThenRx))
            }
            Role::Slave => self.phy.receive(connection.receive_window()).map(|_| RadioOp::Receive),
        };

        let handle = connection.handle;

        match started {
            Ok(op) => {
                self.pool.hold(handle);

                self.sched.current = Some(CurrentEvent { slot, end_by, op });
            }
            Err(PhyBusy) => {
                log::warn!("(LL) radio busy, connection {} skipped its event", handle);

                let sca = self.config.sleep_clock_accuracy;

                if let Some(connection) = self.pool.by_slot_mut(slot) {
                    let mut ctx = Ctx {
                        now,
                        config: &self.config,
                        host: &mut self.host,
                    };

                    let applied = connection.advance_event(sca, false);

                    connection.instant_applied(applied, &mut ctx);
                }
            }
        }
    }

    fn rx_crc_error(&mut self, current: CurrentEvent) {
        let now = self.phy.now();
        let max_crc_errors = self.config.max_consecutive_crc_errors;

        let next = match self.pool.by_slot_mut(current.slot) {
            Some(connection) => {
                let count = connection.seq.rx_crc_error();

                log::warn!("(LL) connection {} CRC error ({} in a row)", connection.handle, count);

                let synchronized = connection.role == Role::Master || connection.flags.contains(Flag::PktRxd);

                if count >= max_crc_errors || !synchronized || now + exchange_time(connection) > current.end_by {
                    Next::Close
                } else {
                    Next::Transmit(TxMode::TxThenRx)
                }
            }
            None => Next::Close,
        };

        self.continue_event(current, next);
    }

    fn rx_ok(&mut self, current: CurrentEvent, completion: Completion<'_>) {
        let now = self.phy.now();
        let pdu = completion.pdu.unwrap_or_default();

        let header = match pdu {
            [first, second, ..] => DataHeader::try_from_bytes([*first, *second]),
            _ => {
                log::warn!("(LL) received PDU without a header");

                return self.close_event();
            }
        };

        let connection = match self.pool.by_slot_mut(current.slot) {
            Some(connection) => connection,
            None => return self.close_event(),
        };

        let header = match header {
            Ok(header)
                if header.length as usize == pdu.len() - 2
                    && header.length as u16 <= connection.data_length.effective.max_rx_octets =>
            {
                header
            }
            Ok(header) => {
                log::warn!(
                    "(LL) connection {} received length {} in a PDU of {} octets",
                    connection.handle,
                    header.length,
                    pdu.len()
                );

                return self.close_event();
            }
            Err(e) => {
                log::warn!("(LL) connection {} received invalid header: {}", connection.handle, e);

                return self.close_event();
            }
        };

        let payload = &pdu[2..];

        if connection.role == Role::Slave && !connection.flags.contains(Flag::PktRxd) {
            connection.sync_anchor(completion.timestamp);
        }

        connection.flags.set(Flag::PktRxd);
        connection.timing.last_rx = Some(completion.timestamp);
        connection.rssi = completion.rssi;

        let handle = connection.handle;

        let mut ctx = Ctx {
            now,
            config: &self.config,
            host: &mut self.host,
        };

        if connection.state == State::Created {
            connection.state = State::Established;

            log::info!("(LL) connection {} established", handle);

            let parameters = connection.parameters();

            ctx.host.notify(Notification::ConnectionEstablished {
                handle,
                status: Error::NoError,
                role: connection.role,
                peer: connection.peer,
                interval: parameters.interval,
                latency: parameters.latency,
                timeout: parameters.timeout,
            });

            if self.initiating == Some(handle) {
                self.initiating = None;
            }
        }

        let exchange = match connection.seq.rx_exchange(&header, &mut connection.tx) {
            Ok(exchange) => exchange,
            Err(e) => {
                log::warn!("(LL) connection {} sequence error: {}", handle, e);

                return self.close_event();
            }
        };

        log::trace!(
            "(LL) connection {} rx {:?} sn {} nesn {} md {} len {} new {}",
            handle,
            header.llid,
            header.sn as u8,
            header.nesn as u8,
            header.md as u8,
            header.length,
            exchange.is_new
        );

        if let Some(acked) = exchange.acked {
            if connection.role == Role::Slave {
                connection.flags.set(Flag::AllowSlaveLatency);
            }

            if let Acked::Control(pdu) = acked {
                connection.ctrl_acked(&pdu, &mut ctx);
            }
        }

        if exchange.is_new && !payload.is_empty() {
            match header.llid {
                Llid::Control => connection.rx_control(payload, &mut ctx),
                llid => ctx.host.notify(Notification::PayloadReceived { handle, llid, payload }),
            }
        }

        let next = if connection.end_reason.is_some() {
            if connection.flags.contains(Flag::TerminateIndRxd) {
                // acknowledge the termination of the peer
                Next::Transmit(TxMode::TxOnly)
            } else {
                Next::Close
            }
        } else {
            let more = connection.seq.last_rxd_md || connection.tx.has_pending();

            let fits = now + exchange_time(connection) <= current.end_by;

            match connection.role {
                Role::Master if more && fits => Next::Transmit(TxMode::TxThenRx),
                Role::Master => Next::Close,
                Role::Slave if more && fits => Next::Transmit(TxMode::TxThenRx),
                Role::Slave => Next::Transmit(TxMode::TxOnly),
            }
        };

        self.continue_event(current, next)
    }

    fn continue_event(&mut self, current: CurrentEvent, next: Next) {
        let mode = match next {
            Next::Close => return self.close_event(),
            Next::Transmit(mode) => mode,
        };

        let result = match self.pool.by_slot_mut(current.slot) {
            Some(connection) => transmit(&mut self.phy, connection, mode),
            None => Err(PhyBusy),
        };

        match result {
            Ok(()) => {
                self.sched.current = Some(CurrentEvent {
                    op: RadioOp::Transmit(mode),
                    ..current
                })
            }
            Err(PhyBusy) => {
                log::warn!("(LL) radio busy within the event of slot {}", current.slot);

                self.close_event()
            }
        }
    }

    /// Close the current connection event
    fn close_event(&mut self) {
        let current = match self.sched.current.take() {
            Some(current) => current,
            None => return,
        };

        self.phy.disable();

        let handle = ConnectionHandle::from_slot(current.slot);

        self.pool.unhold(handle);

        let sca = self.config.sleep_clock_accuracy;
        let now = self.phy.now();

        let connection = match self.pool.by_slot_mut(current.slot) {
            Some(connection) => connection,
            None => return,
        };

        let completed = connection.tx.take_completed();

        if completed != 0 {
            log::trace!("(LL) connection {} completed {} payloads", handle, completed);

            self.host.notify(Notification::PacketsCompleted {
                handle,
                count: completed,
            });
        }

        if let Some(reason) = connection.end_reason {
            return self.end_connection(current.slot, reason);
        }

        let mut ctx = Ctx {
            now,
            config: &self.config,
            host: &mut self.host,
        };

        let applied = connection.advance_event(sca, true);

        connection.instant_applied(applied, &mut ctx);
    }

    /// End a connection and release its slot
    ///
    /// The host is sent `ConnectionTerminated` for an established connection and a failed
    /// `ConnectionEstablished` otherwise.
    pub(crate) fn end_connection(&mut self, slot: usize, reason: Error) {
        if self.sched.current.map(|current| current.slot) == Some(slot) {
            self.sched.current = None;

            self.phy.disable();

            self.pool.unhold(ConnectionHandle::from_slot(slot));
        }

        let connection = match self.pool.by_slot(slot) {
            Some(connection) => connection,
            None => return,
        };

        let handle = connection.handle;

        let notification = if connection.state == State::Established {
            log::info!("(LL) connection {} terminated: {}", handle, reason);

            Notification::ConnectionTerminated { handle, reason }
        } else {
            log::info!("(LL) connection {} failed to be established: {}", handle, reason);

            let parameters = connection.parameters();

            Notification::ConnectionEstablished {
                handle,
                status: reason,
                role: connection.role,
                peer: connection.peer,
                interval: parameters.interval,
                latency: parameters.latency,
                timeout: parameters.timeout,
            }
        };

        self.host.notify(notification);

        if self.initiating == Some(handle) {
            self.initiating = None;
        }

        self.pool.release(handle);
    }

    /// Arm the timer for the next event start or deadline
    pub(crate) fn rearm(&mut self) {
        let current = self.sched.current.map(|current| current.slot);

        let next = (0..MAX_CONNECTIONS)
            .filter(|slot| Some(*slot) != current)
            .filter_map(|slot| self.pool.by_slot(slot))
            .filter(|connection| connection.state != State::Idle)
            .flat_map(|connection| {
                let start = Some(connection.event_start()).filter(|_| connection.is_scheduled());

                [start, connection.supervision_deadline(), connection.procedure_deadline()]
            })
            .flatten()
            .chain(self.sched.current.map(|current| current.end_by))
            .min();

        match next {
            Some(at) if self.sched.armed != Some(at) => {
                self.phy.arm_timer(at);

                self.sched.armed = Some(at);
            }
            None if self.sched.armed.is_some() => {
                self.phy.disarm_timer();

                self.sched.armed = None;
            }
            _ => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_start_wins() {
        let candidates = [
            Candidate {
                slot: 0,
                start: Instant::from_micros(500),
                last_serviced: 1,
            },
            Candidate {
                slot: 1,
                start: Instant::from_micros(400),
                last_serviced: 9,
            },
        ];

        assert_eq!(Some(1), select(candidates));
    }

    #[test]
    fn ties_go_to_least_recently_serviced() {
        let start = Instant::from_micros(1000);

        let candidates = [
            Candidate {
                slot: 0,
                start,
                last_serviced: 7,
            },
            Candidate {
                slot: 1,
                start,
                last_serviced: 3,
            },
            Candidate {
                slot: 2,
                start,
                last_serviced: 5,
            },
        ];

        assert_eq!(Some(1), select(candidates));
        assert_eq!(None, select([]));
    }
}
