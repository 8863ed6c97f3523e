//! Control procedures
//!
//! A control procedure is a request and response exchange of link layer control PDUs that changes
//! something about the connection. Only one procedure initiated by this device may be active on a
//! connection at a time. Procedures requested while another is active are marked as pending and
//! are started in priority order once the active one is done. Termination has the highest
//! priority and cancels every other procedure.
//!
//! Procedures initiated by the peer are answered immediately and do not occupy the active slot,
//! with the exception of a `LL_CONNECTION_PARAM_REQ` received by the master, which becomes a
//! connection update procedure of the master. A `LL_CONNECTION_PARAM_REQ` can also be handed to
//! the host to be accepted or rejected, see [`Config::host_replies_parameter_requests`].

use crate::channel::ChannelMap;
use crate::config::Config;
use crate::connection::{
    Applied, Connection, Flag, PendingMap, PendingUpdate, Role, State, MASTER_WIN_OFFSET, MASTER_WIN_SIZE,
};
use crate::notify::{HostSink, Notification};
use crate::pdu::{opcode, ConnectionParam, ConnectionUpdate, ControlPdu, PduError};
use crate::time::{ConnectionInterval, Instant, ParameterProposal, SlaveLatency, SupervisionTimeout};
use crate::LlError;
use bo_tie_core::errors::Error;

/// The number of connection events between sending an update and its instant (beyond the latency)
const INSTANT_OFFSET: u16 = 6;

/// A control procedure
///
/// The order of the variants is the order in which pending procedures are started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProcedureKind {
    Termination,
    ConnectionUpdate,
    ChannelMapUpdate,
    ConnectionParameterRequest,
    FeatureExchange,
    VersionExchange,
    DataLengthUpdate,
}

impl ProcedureKind {
    const PRIORITY: [ProcedureKind; 7] = [
        ProcedureKind::Termination,
        ProcedureKind::ConnectionUpdate,
        ProcedureKind::ChannelMapUpdate,
        ProcedureKind::ConnectionParameterRequest,
        ProcedureKind::FeatureExchange,
        ProcedureKind::VersionExchange,
        ProcedureKind::DataLengthUpdate,
    ];

    fn mask(self) -> u8 {
        1 << self as u8
    }

    /// Get the opcode of the PDU that starts this procedure
    fn request_opcode(self, role: Role) -> u8 {
        match self {
            ProcedureKind::Termination => opcode::TERMINATE_IND,
            ProcedureKind::ConnectionUpdate => opcode::CONNECTION_UPDATE_IND,
            ProcedureKind::ChannelMapUpdate => opcode::CHANNEL_MAP_IND,
            ProcedureKind::ConnectionParameterRequest => opcode::CONNECTION_PARAM_REQ,
            ProcedureKind::FeatureExchange if role == Role::Master => opcode::FEATURE_REQ,
            ProcedureKind::FeatureExchange => opcode::SLAVE_FEATURE_REQ,
            ProcedureKind::VersionExchange => opcode::VERSION_IND,
            ProcedureKind::DataLengthUpdate => opcode::LENGTH_REQ,
        }
    }
}

/// A set of procedures
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct PendingProcedures(u8);

impl PendingProcedures {
    pub(crate) fn insert(&mut self, kind: ProcedureKind) {
        self.0 |= kind.mask()
    }

    pub(crate) fn remove(&mut self, kind: ProcedureKind) {
        self.0 &= !kind.mask()
    }

    pub(crate) fn contains(&self, kind: ProcedureKind) -> bool {
        self.0 & kind.mask() != 0
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Get the pending procedure with the highest priority
    pub(crate) fn first(&self) -> Option<ProcedureKind> {
        ProcedureKind::PRIORITY.iter().copied().find(|kind| self.contains(*kind))
    }
}

/// The phase of the active procedure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ProcedurePhase {
    /// The request PDU is queued or in flight
    Initiating,
    /// The request was acknowledged and the response of the peer has not been received
    AwaitingResponse,
    /// Waiting for the instant of the procedure
    Applying,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ActiveProcedure {
    pub(crate) kind: ProcedureKind,
    pub(crate) phase: ProcedurePhase,
    /// The response timeout
    pub(crate) deadline: Option<Instant>,
    /// The host requested this procedure
    pub(crate) host_initiated: bool,
}

/// The answer of the host to a connection parameter request of the peer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterReply {
    /// Use the parameters requested by the peer
    Accept,
    /// Reject the request with the reason
    Reject(Error),
}

/// A request to run a control procedure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ControlRequest {
    UpdateParameters(ParameterProposal),
    ChannelMapUpdate(ChannelMap),
    FeatureExchange,
    VersionExchange,
    DataLengthUpdate { tx_octets: u16, tx_time: u16 },
    Terminate(Error),
}

/// Control procedure state of a connection
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ControlState {
    pub(crate) pending: PendingProcedures,
    /// Procedures requested by the host that are pending or active
    pub(crate) host: PendingProcedures,
    pub(crate) active: Option<ActiveProcedure>,
    pub(crate) proposal: Option<ParameterProposal>,
    pub(crate) channel_map: Option<ChannelMap>,
    pub(crate) data_length: Option<(u16, u16)>,
    pub(crate) terminate_reason: Option<Error>,
    /// A `LL_CONNECTION_PARAM_REQ` of the peer waiting for the reply of the host
    pub(crate) awaiting_reply: Option<ConnectionParam>,
}

impl ControlState {
    /// Check that no procedure is active or pending
    pub(crate) fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }

    /// Check if a procedure is either pending or active
    pub(crate) fn is_requested(&self, kind: ProcedureKind) -> bool {
        self.pending.contains(kind) || self.active.map(|active| active.kind == kind).unwrap_or_default()
    }

    pub(crate) fn active_kind(&self) -> Option<ProcedureKind> {
        self.active.map(|active| active.kind)
    }
}

/// Context of the control procedure methods
pub(crate) struct Ctx<'a> {
    pub(crate) now: Instant,
    pub(crate) config: &'a Config,
    pub(crate) host: &'a mut dyn HostSink,
}

/// Check if the instant is not in the future of the event counter
fn instant_passed(instant: u16, event_counter: u16) -> bool {
    let ahead = instant.wrapping_sub(event_counter);

    ahead == 0 || ahead >= 0x8000
}

fn proposal_from_param(param: &ConnectionParam) -> Result<ParameterProposal, &'static str> {
    ParameterProposal::new(
        ConnectionInterval::try_from_raw(param.interval_min)?,
        ConnectionInterval::try_from_raw(param.interval_max)?,
        SlaveLatency::try_from_raw(param.latency)?,
        SupervisionTimeout::try_from_raw(param.timeout)?,
    )
}

impl Connection {
    /// Request a control procedure
    ///
    /// The procedure is started at the next connection event where no other procedure is active.
    pub(crate) fn request(&mut self, request: ControlRequest, host_initiated: bool) {
        let kind = match request {
            ControlRequest::UpdateParameters(proposal) => {
                self.ctrl.proposal = Some(proposal);

                match self.role {
                    Role::Master => ProcedureKind::ConnectionUpdate,
                    Role::Slave => ProcedureKind::ConnectionParameterRequest,
                }
            }
            ControlRequest::ChannelMapUpdate(map) => {
                self.ctrl.channel_map = Some(map);

                ProcedureKind::ChannelMapUpdate
            }
            ControlRequest::FeatureExchange => ProcedureKind::FeatureExchange,
            ControlRequest::VersionExchange => ProcedureKind::VersionExchange,
            ControlRequest::DataLengthUpdate { tx_octets, tx_time } => {
                self.ctrl.data_length = Some((tx_octets, tx_time));

                ProcedureKind::DataLengthUpdate
            }
            ControlRequest::Terminate(reason) => {
                self.ctrl.terminate_reason = Some(reason);

                ProcedureKind::Termination
            }
        };

        log::debug!("(LL) connection {} requested procedure {:?}", self.handle, kind);

        self.ctrl.pending.insert(kind);

        if host_initiated {
            self.ctrl.host.insert(kind);
        }
    }

    /// Start pending procedures
    ///
    /// This is called at the start of every connection event and whenever a procedure completes.
    pub(crate) fn service_procedures(&mut self, ctx: &mut Ctx<'_>) {
        if self.state == State::Idle || self.end_reason.is_some() {
            return;
        }

        if self.ctrl.pending.contains(ProcedureKind::Termination)
            && self.ctrl.active_kind() != Some(ProcedureKind::Termination)
        {
            self.cancel_procedures();

            self.start_procedure(ProcedureKind::Termination, ctx);

            return;
        }

        if self.state != State::Established {
            return;
        }

        while self.ctrl.active.is_none() {
            match self.ctrl.pending.first() {
                Some(kind) if self.start_procedure(kind, ctx) => (),
                _ => break,
            }
        }
    }

    /// Drop every procedure for termination
    fn cancel_procedures(&mut self) {
        if let Some(active) = self.ctrl.active.take() {
            log::debug!(
                "(LL) connection {} procedure {:?} cancelled by termination",
                self.handle,
                active.kind
            );
        }

        let terminate = self.ctrl.pending.contains(ProcedureKind::Termination);

        self.ctrl.pending = PendingProcedures::default();
        self.ctrl.host = PendingProcedures::default();
        self.ctrl.proposal = None;
        self.ctrl.channel_map = None;
        self.ctrl.data_length = None;

        if terminate {
            self.ctrl.pending.insert(ProcedureKind::Termination);
        }

        self.ctrl.awaiting_reply = None;

        let version_answered = self.flags.contains(Flag::RxdVersionInd);
        let mut update_dropped = false;
        let mut map_dropped = false;

        // responses owed to the peer are still sent
        self.tx.retain_ctrl(|pdu| match pdu {
            ControlPdu::ConnectionUpdateInd(_) => {
                update_dropped = true;
                false
            }
            ControlPdu::ChannelMapInd { .. } => {
                map_dropped = true;
                false
            }
            ControlPdu::FeatureReq { .. }
            | ControlPdu::SlaveFeatureReq { .. }
            | ControlPdu::ConnectionParamReq(_)
            | ControlPdu::LengthReq(_) => false,
            ControlPdu::VersionInd(_) => version_answered,
            _ => true,
        });

        // the peer never got the instant of these
        if update_dropped {
            self.pending_update = None;
        }

        if map_dropped {
            self.pending_map = None;
        }
    }

    /// Start a procedure
    ///
    /// False is returned if the procedure could not be started because the control queue is full.
    ///
    /// # Panic
    /// Starting a procedure while another is active corrupts the procedure state and is treated as
    /// a fatal error.
    fn start_procedure(&mut self, kind: ProcedureKind, ctx: &mut Ctx<'_>) -> bool {
        if let Some(active) = self.ctrl.active {
            log::error!(
                "(LL) connection {} cannot start {:?} while {:?} is active",
                self.handle,
                kind,
                active.kind
            );

            panic!("control procedure started while another is active");
        }

        let counter = self.timing.event_counter;
        let instant = counter.wrapping_add(self.timing.parameters.latency.get_latency() + INSTANT_OFFSET);

        let mut deadline = Some(ctx.now + ctx.config.ctrl_procedure_timeout);

        let pdu = match kind {
            ProcedureKind::Termination => {
                deadline = Some(ctx.now + self.timing.parameters.timeout.get_duration());

                ControlPdu::TerminateInd {
                    reason: self.ctrl.terminate_reason.unwrap_or(Error::RemoteUserTerminatedConnection),
                }
            }
            ProcedureKind::ConnectionUpdate => match self.ctrl.proposal {
                Some(proposal) => {
                    let parameters = proposal.choose(self.timing.parameters.interval);

                    ControlPdu::ConnectionUpdateInd(ConnectionUpdate {
                        win_size: MASTER_WIN_SIZE,
                        win_offset: MASTER_WIN_OFFSET,
                        interval: parameters.interval.get_raw_val(),
                        latency: parameters.latency.get_latency(),
                        timeout: parameters.timeout.get_raw_val(),
                        instant,
                    })
                }
                None => return self.drop_request(kind),
            },
            ProcedureKind::ChannelMapUpdate => match self.ctrl.channel_map {
                Some(map) => ControlPdu::ChannelMapInd { map, instant },
                None => return self.drop_request(kind),
            },
            ProcedureKind::ConnectionParameterRequest => match self.ctrl.proposal {
                Some(proposal) => ControlPdu::ConnectionParamReq(ConnectionParam {
                    interval_min: proposal.interval_min.get_raw_val(),
                    interval_max: proposal.interval_max.get_raw_val(),
                    latency: proposal.latency.get_latency(),
                    timeout: proposal.timeout.get_raw_val(),
                    preferred_periodicity: 0,
                    reference_event_counter: counter,
                    offsets: [0xFFFF; 6],
                }),
                None => return self.drop_request(kind),
            },
            ProcedureKind::FeatureExchange => {
                let features = ctx.config.local_features;

                match self.role {
                    Role::Master => ControlPdu::FeatureReq { features },
                    Role::Slave => ControlPdu::SlaveFeatureReq { features },
                }
            }
            ProcedureKind::VersionExchange => {
                if self.flags.contains(Flag::RxdVersionInd) {
                    // the version information is already known
                    self.ctrl.pending.remove(kind);

                    self.complete_version_exchange(self.ctrl.host.contains(kind), ctx);

                    self.ctrl.host.remove(kind);

                    return true;
                }

                if self.flags.contains(Flag::VersionIndSent) {
                    // the peer has not answered the version indication of this device yet
                    self.ctrl.pending.remove(kind);

                    self.ctrl.active = Some(ActiveProcedure {
                        kind,
                        phase: ProcedurePhase::AwaitingResponse,
                        deadline,
                        host_initiated: self.ctrl.host.contains(kind),
                    });

                    return true;
                }

                ControlPdu::VersionInd(ctx.config.version)
            }
            ProcedureKind::DataLengthUpdate => {
                if let Some((octets, time)) = self.ctrl.data_length.take() {
                    self.data_length.set_local_tx(octets, time);
                }

                ControlPdu::LengthReq(self.data_length.local)
            }
        };

        if !self.tx.push_ctrl(pdu) {
            log::warn!("(LL) connection {} control queue full, {:?} delayed", self.handle, kind);

            return false;
        }

        match pdu {
            ControlPdu::ConnectionUpdateInd(update) => {
                if let (Some(proposal), Ok(parameters)) = (self.ctrl.proposal.take(), update.parameters()) {
                    debug_assert_eq!(parameters, proposal.choose(self.timing.parameters.interval));

                    self.pending_update = Some(PendingUpdate {
                        parameters,
                        win_offset: update.win_offset,
                        win_size: update.win_size,
                        instant,
                    });
                }
            }
            ControlPdu::ChannelMapInd { map, instant } => {
                self.ctrl.channel_map = None;

                self.pending_map = Some(PendingMap { map, instant });
            }
            ControlPdu::VersionInd(_) => self.flags.set(Flag::VersionIndSent),
            _ => (),
        }

        self.ctrl.pending.remove(kind);

        self.ctrl.active = Some(ActiveProcedure {
            kind,
            phase: ProcedurePhase::Initiating,
            deadline,
            host_initiated: self.ctrl.host.contains(kind),
        });

        log::debug!("(LL) connection {} started procedure {:?}", self.handle, kind);

        true
    }

    /// Forget a pending procedure that has nothing left to do
    fn drop_request(&mut self, kind: ProcedureKind) -> bool {
        self.ctrl.pending.remove(kind);
        self.ctrl.host.remove(kind);

        true
    }

    /// Finish the active procedure
    fn finish_procedure(&mut self) -> Option<ActiveProcedure> {
        let active = self.ctrl.active.take()?;

        self.ctrl.host.remove(active.kind);

        log::debug!("(LL) connection {} finished procedure {:?}", self.handle, active.kind);

        Some(active)
    }

    /// Fail the active procedure
    ///
    /// The host is only told about the failure of a procedure it requested.
    pub(crate) fn fail_procedure(&mut self, status: Error, ctx: &mut Ctx<'_>) {
        if let Some(active) = self.finish_procedure() {
            log::debug!(
                "(LL) connection {} procedure {:?} failed: {}",
                self.handle,
                active.kind,
                status
            );

            if active.kind == ProcedureKind::ConnectionParameterRequest {
                self.ctrl.proposal = None;
            }

            if active.host_initiated {
                ctx.host.notify(Notification::ControlProcedureFailed {
                    handle: self.handle,
                    procedure: active.kind,
                    status,
                });
            }
        }
    }

    /// Set the phase of the active procedure if it is of the given kind
    fn set_phase(&mut self, kind: ProcedureKind, phase: ProcedurePhase) {
        if let Some(active) = self.ctrl.active.as_mut().filter(|active| active.kind == kind) {
            active.phase = phase;

            if phase == ProcedurePhase::Applying {
                active.deadline = None;
            }
        }
    }

    fn queue_response(&mut self, pdu: ControlPdu) {
        if !self.tx.push_ctrl(pdu) {
            log::warn!(
                "(LL) connection {} control queue full, dropped response {:?}",
                self.handle,
                pdu
            );
        }
    }

    fn end(&mut self, reason: Error) {
        log::info!("(LL) connection {} ending: {}", self.handle, reason);

        self.end_reason.get_or_insert(reason);
    }

    /// A control PDU sent by this device was acknowledged by the peer
    pub(crate) fn ctrl_acked(&mut self, pdu: &ControlPdu, ctx: &mut Ctx<'_>) {
        match pdu {
            ControlPdu::TerminateInd { .. } => self.end(Error::ConnectionTerminatedByLocalHost),
            ControlPdu::ConnectionUpdateInd(_) => {
                self.set_phase(ProcedureKind::ConnectionUpdate, ProcedurePhase::Applying)
            }
            ControlPdu::ChannelMapInd { .. } => {
                self.set_phase(ProcedureKind::ChannelMapUpdate, ProcedurePhase::Applying)
            }
            ControlPdu::FeatureReq { .. } | ControlPdu::SlaveFeatureReq { .. } => {
                self.set_phase(ProcedureKind::FeatureExchange, ProcedurePhase::AwaitingResponse)
            }
            ControlPdu::ConnectionParamReq(_) => self.set_phase(
                ProcedureKind::ConnectionParameterRequest,
                ProcedurePhase::AwaitingResponse,
            ),
            ControlPdu::LengthReq(_) => {
                self.set_phase(ProcedureKind::DataLengthUpdate, ProcedurePhase::AwaitingResponse)
            }
            ControlPdu::VersionInd(_) => {
                self.set_phase(ProcedureKind::VersionExchange, ProcedurePhase::AwaitingResponse)
            }
            _ => (),
        }

        self.service_procedures(ctx)
    }

    /// Process a control PDU received from the peer
    pub(crate) fn rx_control(&mut self, payload: &[u8], ctx: &mut Ctx<'_>) {
        let pdu = match ControlPdu::try_from_payload(payload) {
            Ok(pdu) => pdu,
            Err(e) => {
                log::warn!("(LL) connection {} received invalid control PDU: {}", self.handle, e);

                if let Some(op) = payload.first() {
                    self.rx_invalid_control(*op, e);
                }

                return;
            }
        };

        log::trace!("(LL) connection {} received {:?}", self.handle, pdu);

        match (self.role, pdu) {
            (Role::Slave, ControlPdu::ConnectionUpdateInd(update)) => self.rx_connection_update(update),
            (Role::Slave, ControlPdu::ChannelMapInd { map, instant }) => {
                if instant_passed(instant, self.timing.event_counter) {
                    self.end(Error::InstantPassed)
                } else {
                    self.pending_map = Some(PendingMap { map, instant })
                }
            }
            (_, ControlPdu::TerminateInd { reason }) => {
                self.flags.set(Flag::TerminateIndRxd);

                if self.flags.contains(Flag::LocalTerminate) {
                    self.end(Error::ConnectionTerminatedByLocalHost)
                } else {
                    self.end(reason)
                }

                self.cancel_procedures();
                self.ctrl.pending.remove(ProcedureKind::Termination);
            }
            (_, ControlPdu::UnknownRsp { unknown_type }) => {
                let requested = self.ctrl.active_kind().map(|kind| kind.request_opcode(self.role));

                if requested == Some(unknown_type) {
                    self.fail_procedure(Error::UnsupportedRemoteFeature, ctx)
                }
            }
            (Role::Slave, ControlPdu::FeatureReq { features })
            | (Role::Master, ControlPdu::SlaveFeatureReq { features }) => {
                self.set_remote_features(features);

                self.queue_response(ControlPdu::FeatureRsp {
                    features: ctx.config.local_features,
                });
            }
            (_, ControlPdu::FeatureRsp { features }) => {
                self.set_remote_features(features);

                let host_initiated = match self.ctrl.active_kind() {
                    Some(ProcedureKind::FeatureExchange) => self.finish_procedure().map(|active| active.host_initiated),
                    _ => None,
                };

                if host_initiated.unwrap_or_default() {
                    ctx.host.notify(Notification::FeaturesExchanged {
                        handle: self.handle,
                        features,
                    });
                }
            }
            (_, ControlPdu::VersionInd(version)) => {
                self.remote_version = version;
                self.flags.set(Flag::RxdVersionInd);

                if !self.flags.contains(Flag::VersionIndSent) {
                    self.flags.set(Flag::VersionIndSent);

                    self.queue_response(ControlPdu::VersionInd(ctx.config.version));
                } else if self.ctrl.active_kind() == Some(ProcedureKind::VersionExchange) {
                    let host_initiated = self.finish_procedure().map(|active| active.host_initiated);

                    self.complete_version_exchange(host_initiated.unwrap_or_default(), ctx);
                }
            }
            (_, ControlPdu::RejectInd { reason }) => self.fail_procedure(reason, ctx),
            (_, ControlPdu::RejectExtInd { reject_opcode, reason }) => {
                let requested = self.ctrl.active_kind().map(|kind| kind.request_opcode(self.role));

                if requested == Some(reject_opcode) {
                    self.fail_procedure(reason, ctx)
                } else {
                    log::warn!(
                        "(LL) connection {} rejection of opcode 0x{:02X} does not match a procedure",
                        self.handle,
                        reject_opcode
                    );
                }
            }
            (_, ControlPdu::ConnectionParamReq(param)) => self.rx_connection_param_req(param, ctx),
            (_, ControlPdu::LengthReq(remote)) => {
                let changed = self.data_length.set_remote(&remote);

                self.queue_response(ControlPdu::LengthRsp(self.data_length.local));

                if changed {
                    self.notify_data_length(ctx);
                }
            }
            (_, ControlPdu::LengthRsp(remote)) => {
                let changed = self.data_length.set_remote(&remote);

                if self.ctrl.active_kind() == Some(ProcedureKind::DataLengthUpdate) {
                    self.finish_procedure();
                }

                if changed {
                    self.notify_data_length(ctx);
                }
            }
            (role, pdu) => {
                log::warn!(
                    "(LL) connection {} unexpected control PDU {:?} as {:?}",
                    self.handle,
                    pdu,
                    role
                );

                self.queue_response(ControlPdu::UnknownRsp {
                    unknown_type: pdu.opcode(),
                });
            }
        }

        self.service_procedures(ctx)
    }

    /// Process a control PDU that could not be decoded
    ///
    /// An opcode this device does not support is answered with `LL_UNKNOWN_RSP`. A supported opcode
    /// with a malformed body is a protocol violation of the peer, a request is rejected and
    /// anything else ends the connection.
    fn rx_invalid_control(&mut self, op: u8, error: PduError) {
        match error {
            PduError::UnsupportedOpcode(unknown_type) => self.queue_response(ControlPdu::UnknownRsp { unknown_type }),
            PduError::InvalidLength { .. } | PduError::InvalidField(_) => match op {
                opcode::FEATURE_REQ | opcode::SLAVE_FEATURE_REQ | opcode::CONNECTION_PARAM_REQ | opcode::LENGTH_REQ => {
                    self.queue_response(ControlPdu::RejectExtInd {
                        reject_opcode: op,
                        reason: Error::InvalidLmpParametersOrInvalidLlParameters,
                    })
                }
                _ => self.end(Error::InvalidLmpParametersOrInvalidLlParameters),
            },
            _ => (),
        }
    }

    fn rx_connection_update(&mut self, update: ConnectionUpdate) {
        if instant_passed(update.instant, self.timing.event_counter) {
            self.end(Error::InstantPassed);

            return;
        }

        match update.parameters() {
            Ok(parameters) => {
                self.pending_update = Some(PendingUpdate {
                    parameters,
                    win_offset: update.win_offset,
                    win_size: update.win_size,
                    instant: update.instant,
                });

                // this is the answer of the master to the request of this device
                self.set_phase(ProcedureKind::ConnectionParameterRequest, ProcedurePhase::Applying);
            }
            Err(e) => {
                log::warn!("(LL) connection {} invalid connection update: {}", self.handle, e);

                self.end(Error::InvalidLmpParametersOrInvalidLlParameters)
            }
        }
    }

    /// Check if a connection parameter request of the peer collides with a procedure of this device
    fn update_collision(&self) -> bool {
        let collides = [
            ProcedureKind::ConnectionUpdate,
            ProcedureKind::ConnectionParameterRequest,
            ProcedureKind::ChannelMapUpdate,
        ];

        collides.iter().any(|kind| self.ctrl.is_requested(*kind))
            || self.ctrl.awaiting_reply.is_some()
            || self.pending_update.is_some()
            || self.pending_map.is_some()
    }

    /// Process `LL_CONNECTION_PARAM_REQ`
    ///
    /// A request from the peer while this device has a procedure in progress that changes the
    /// connection timing or channels is rejected. The procedure of this device is kept.
    fn rx_connection_param_req(&mut self, param: ConnectionParam, ctx: &mut Ctx<'_>) {
        let reject = |reason| ControlPdu::RejectExtInd {
            reject_opcode: opcode::CONNECTION_PARAM_REQ,
            reason,
        };

        if self.update_collision() {
            log::debug!(
                "(LL) connection {} rejected parameter request, procedure already in progress",
                self.handle
            );

            self.queue_response(reject(Error::DifferentTransactionCollision));

            return;
        }

        let proposal = match proposal_from_param(&param) {
            Ok(proposal) => proposal,
            Err(e) => {
                log::warn!("(LL) connection {} invalid parameter request: {}", self.handle, e);

                self.queue_response(reject(Error::InvalidLmpParametersOrInvalidLlParameters));

                return;
            }
        };

        if ctx.config.host_replies_parameter_requests {
            log::debug!("(LL) connection {} parameter request waiting for the host", self.handle);

            self.ctrl.awaiting_reply = Some(param);

            ctx.host.notify(Notification::RemoteParameterRequest {
                handle: self.handle,
                interval_min: proposal.interval_min,
                interval_max: proposal.interval_max,
                latency: proposal.latency,
                timeout: proposal.timeout,
            });
        } else {
            self.accept_parameter_request(param, proposal);
        }
    }

    fn accept_parameter_request(&mut self, param: ConnectionParam, proposal: ParameterProposal) {
        match self.role {
            Role::Master => {
                self.ctrl.proposal = Some(proposal);
                self.ctrl.pending.insert(ProcedureKind::ConnectionUpdate);
            }
            Role::Slave => self.queue_response(ControlPdu::ConnectionParamRsp(param)),
        }
    }

    /// Answer the `LL_CONNECTION_PARAM_REQ` of the peer that is waiting for the host
    ///
    /// # Error
    /// * `CommandDisallowed` if no request is waiting for a reply
    /// * `InvalidParameter` if the rejection reason is `NoError`
    pub(crate) fn reply_parameter_request(&mut self, reply: ParameterReply) -> Result<(), LlError> {
        let param = self.ctrl.awaiting_reply.ok_or(LlError::CommandDisallowed)?;

        match reply {
            ParameterReply::Accept => {
                let proposal = proposal_from_param(&param).map_err(LlError::InvalidParameter)?;

                log::debug!("(LL) connection {} host accepted the parameter request", self.handle);

                self.accept_parameter_request(param, proposal);
            }
            ParameterReply::Reject(reason) => {
                if reason.is_ok() {
                    return Err(LlError::InvalidParameter("rejection reason cannot be NoError"));
                }

                log::debug!("(LL) connection {} host rejected the parameter request: {}", self.handle, reason);

                self.queue_response(ControlPdu::RejectExtInd {
                    reject_opcode: opcode::CONNECTION_PARAM_REQ,
                    reason,
                });
            }
        }

        self.ctrl.awaiting_reply = None;

        Ok(())
    }

    fn set_remote_features(&mut self, features: u64) {
        self.remote_features = features;

        self.flags.set(Flag::FeaturesExchanged);
    }

    fn complete_version_exchange(&mut self, host_initiated: bool, ctx: &mut Ctx<'_>) {
        if host_initiated {
            ctx.host.notify(Notification::VersionExchanged {
                handle: self.handle,
                version: self.remote_version,
            });
        }
    }

    fn notify_data_length(&self, ctx: &mut Ctx<'_>) {
        let effective = self.data_length.effective;

        log::debug!("(LL) connection {} data length changed: {:?}", self.handle, effective);

        ctx.host.notify(Notification::DataLengthChanged {
            handle: self.handle,
            max_tx_octets: effective.max_tx_octets,
            max_tx_time: effective.max_tx_time,
            max_rx_octets: effective.max_rx_octets,
            max_rx_time: effective.max_rx_time,
        });
    }

    /// Complete the procedures whose instant was reached
    pub(crate) fn instant_applied(&mut self, applied: Applied, ctx: &mut Ctx<'_>) {
        if applied.map_applied {
            log::info!("(LL) connection {} channel map updated", self.handle);

            if self.ctrl.active_kind() == Some(ProcedureKind::ChannelMapUpdate) {
                self.finish_procedure();
            }
        }

        if let Some(old) = applied.update_applied {
            let parameters = self.timing.parameters;

            let host_initiated = match self.ctrl.active_kind() {
                Some(ProcedureKind::ConnectionUpdate) | Some(ProcedureKind::ConnectionParameterRequest) => {
                    self.finish_procedure().map(|active| active.host_initiated).unwrap_or_default()
                }
                _ => false,
            };

            log::info!(
                "(LL) connection {} updated: interval {:?}, latency {}, timeout {:?}",
                self.handle,
                parameters.interval.get_duration(),
                parameters.latency.get_latency(),
                parameters.timeout.get_duration()
            );

            if host_initiated || old != parameters {
                ctx.host.notify(Notification::ConnectionUpdated {
                    handle: self.handle,
                    interval: parameters.interval,
                    latency: parameters.latency,
                    timeout: parameters.timeout,
                });
            }
        }

        if applied != Applied::default() {
            self.service_procedures(ctx)
        }
    }

    /// Get the response timeout of the active procedure
    pub(crate) fn procedure_deadline(&self) -> Option<Instant> {
        self.ctrl.active.and_then(|active| active.deadline)
    }

    /// Check the response timeout of the active procedure
    ///
    /// The reason the connection must be closed with is returned when the peer did not respond in
    /// time.
    pub(crate) fn check_procedure_timeout(&mut self, ctx: &mut Ctx<'_>) -> Option<Error> {
        let deadline = self.procedure_deadline()?;

        if ctx.now < deadline {
            return None;
        }

        let reason = Error::LmpResponseTimeoutOrLlResponseTimeout;

        log::warn!(
            "(LL) connection {} procedure {:?} timed out",
            self.handle,
            self.ctrl.active_kind()
        );

        if self.ctrl.active_kind() != Some(ProcedureKind::Termination) {
            self.fail_procedure(reason, ctx);
        }

        Some(reason)
    }
}
