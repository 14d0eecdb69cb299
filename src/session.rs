//! The vending-session state machine, shared by both bus roles.
//!
//! One [`SessionMachine`] instance exists per peripheral address and owns all
//! mutable protocol state: the five-state lifecycle, the pending-action
//! flags, and the vend context. The peripheral responder feeds it received
//! commands through [`SessionMachine::handle_command`]; the VMC sequencer
//! mirrors the same lifecycle by feeding it poll replies through
//! [`SessionMachine::observe_reply`]. Nothing else mutates it.
//!
//! Time never comes from a clock inside this module. Callers pass `now` in,
//! so every timeout transition is reproducible in tests.

use embassy_time::{Duration, Instant};

use crate::command::{
    Identity, PollReply, ReaderConfig, VmcCommand, VmcConfig,
};

/// Which side of the bus this machine speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    /// The VMC: initiates every transaction.
    Master,
    /// A cashless reader: only ever answers.
    Peripheral,
}

/// The session lifecycle. Constructed in `Inactive`; only RESET returns
/// there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    /// Not yet configured (pre-SETUP), or reset.
    Inactive,
    /// Configured but not accepting sessions.
    Disabled,
    /// Accepting session begins.
    Enabled,
    /// A session is open; funds are available.
    Idle,
    /// A vend request is in flight.
    Vend,
}

/// Who decides a vend request's fate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VendPolicy {
    /// Approve locally when the item price fits the session funds.
    AutoApprove,
    /// Hold the request until a collaborator calls
    /// [`SessionMachine::approve_vend`] or [`SessionMachine::deny_vend`].
    Deferred,
}

/// Outgoing events not yet carried by a POLL response. Each flag is cleared
/// exactly once, by the POLL that communicates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PendingActions {
    pub out_of_sequence: bool,
    pub just_reset: bool,
    pub vend_approved: bool,
    pub vend_denied: bool,
    pub session_end: bool,
    pub session_begin: bool,
    pub session_cancel: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    OutOfSequence,
    JustReset,
    VendApproved,
    VendDenied,
    SessionEnd,
    SessionBegin,
    SessionCancel,
}

impl PendingActions {
    fn any(&self) -> bool {
        self.out_of_sequence
            || self.just_reset
            || self.vend_approved
            || self.vend_denied
            || self.session_end
            || self.session_begin
            || self.session_cancel
    }

    /// Clear and return the highest-priority set flag. The fixed order is
    /// part of the protocol contract: at most one event per POLL, losers
    /// stay pending.
    fn take_highest(&mut self) -> Option<PendingKind> {
        macro_rules! drain {
            ($($field:ident => $kind:ident),* $(,)?) => {
                $(if self.$field {
                    self.$field = false;
                    return Some(PendingKind::$kind);
                })*
            };
        }
        drain!(
            out_of_sequence => OutOfSequence,
            just_reset => JustReset,
            vend_approved => VendApproved,
            vend_denied => VendDenied,
            session_end => SessionEnd,
            session_begin => SessionBegin,
            session_cancel => SessionCancel,
        );
        None
    }
}

/// Item under negotiation. Valid only in `Idle`/`Vend`; prices in minor
/// currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VendContext {
    pub price: u16,
    pub item: u16,
}

/// Where the current vend stands. `Approved` means the approval has been
/// *communicated* on the wire, which changes what a RESET means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VendPhase {
    None,
    Requested,
    Approved,
}

/// Outbound events for external collaborators (BLE/MQTT bridge, telemetry).
/// Amounts are in minor currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionNotification {
    /// A vend completed and the product was dispensed.
    SaleCompleted { price: u16, item: u16 },
    /// A cash (coin/bill) sale was recorded for audit.
    CashSale { price: u16, item: u16 },
    /// The session closed; funds are no longer available.
    SessionEnded,
}

/// Static configuration of one session machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Capability record reported to SETUP/CONFIG_DATA, and the currency
    /// scaling used for the lifetime of the pairing.
    pub reader: ReaderConfig,
    /// Identification record for the EXPANSION/REQUEST_ID exchange.
    pub identity: Identity,
    pub vend_policy: VendPolicy,
    /// Open session with no progress before a cancel is synthesized.
    pub idle_timeout: Duration,
    /// Vend request with no outcome before a denial is synthesized.
    pub vend_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reader: ReaderConfig::default(),
            identity: Identity::new("UNK", "0", "READER", 0x0100),
            vend_policy: VendPolicy::AutoApprove,
            idle_timeout: Duration::from_secs(45),
            vend_timeout: Duration::from_secs(90),
        }
    }
}

/// What a handled command puts back on the bus and surfaces to the
/// application. `reply: None` means a bare ACK.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    pub reply: Option<PollReply>,
    pub notification: Option<SessionNotification>,
}

impl Outcome {
    const ACK: Self = Self {
        reply: None,
        notification: None,
    };

    fn reply(reply: PollReply) -> Self {
        Self {
            reply: Some(reply),
            notification: None,
        }
    }
}

/// The per-address protocol state machine.
pub struct SessionMachine {
    role: Role,
    config: SessionConfig,
    state: SessionState,
    pending: PendingActions,
    ctx: Option<VendContext>,
    phase: VendPhase,
    /// Remaining session funds, minor units.
    funds: u16,
    /// Learned from the peer. For the master this is the reader's capability
    /// record; the peripheral instead keeps [`Self::vmc_config`].
    peer_config: Option<ReaderConfig>,
    vmc_config: Option<VmcConfig>,
    peer_identity: Option<Identity>,
    /// Max/min vend prices announced by the VMC, wire-scaled.
    price_limits: Option<(u16, u16)>,
    entered_at: Instant,
}

impl SessionMachine {
    pub fn new(role: Role, config: SessionConfig, now: Instant) -> Self {
        Self {
            role,
            config,
            state: SessionState::Inactive,
            pending: PendingActions::default(),
            ctx: None,
            phase: VendPhase::None,
            funds: 0,
            peer_config: None,
            vmc_config: None,
            peer_identity: None,
            price_limits: None,
            entered_at: now,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pending(&self) -> PendingActions {
        self.pending
    }

    pub fn vend_context(&self) -> Option<VendContext> {
        self.ctx
    }

    pub fn funds(&self) -> u16 {
        self.funds
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Capability record learned from the peer (master role only).
    pub fn peer_config(&self) -> Option<ReaderConfig> {
        self.peer_config
    }

    pub fn peer_identity(&self) -> Option<Identity> {
        self.peer_identity
    }

    /// What the VMC announced about itself (peripheral role only).
    pub fn vmc_config(&self) -> Option<VmcConfig> {
        self.vmc_config
    }

    /// Wire-scaled max/min vend prices from SETUP/MAX_MIN_PRICES.
    pub fn price_limits(&self) -> Option<(u16, u16)> {
        self.price_limits
    }

    fn enter(&mut self, state: SessionState, now: Instant) {
        if self.state != state {
            debug!("session {:?} -> {:?}", self.state, state);
            self.state = state;
            self.entered_at = now;
        }
    }

    /// Full protocol reset. A reset that lands between a communicated vend
    /// approval and its success acknowledgment counts as a successful vend,
    /// so the sale is reported rather than lost.
    pub fn reset(&mut self, now: Instant) -> Option<SessionNotification> {
        let notification = match (self.phase, self.ctx) {
            (VendPhase::Approved, Some(ctx)) => {
                self.funds = self.funds.saturating_sub(ctx.price);
                Some(SessionNotification::SaleCompleted {
                    price: ctx.price,
                    item: ctx.item,
                })
            }
            _ => None,
        };
        self.pending = PendingActions {
            just_reset: true,
            ..PendingActions::default()
        };
        self.ctx = None;
        self.phase = VendPhase::None;
        self.funds = 0;
        self.vmc_config = None;
        self.price_limits = None;
        self.enter(SessionState::Inactive, now);
        notification
    }

    /// Synthesize timeout-driven pending actions. Harmless to call often;
    /// the responder runs it ahead of every POLL.
    pub fn tick(&mut self, now: Instant) {
        let elapsed = now.as_ticks().saturating_sub(self.entered_at.as_ticks());
        match self.state {
            SessionState::Idle if elapsed >= self.config.idle_timeout.as_ticks() => {
                info!("idle window elapsed, cancelling session");
                self.pending.session_cancel = true;
                self.entered_at = now;
            }
            SessionState::Vend if elapsed >= self.config.vend_timeout.as_ticks() => {
                info!("vend window elapsed, denying vend");
                self.pending.vend_approved = false;
                self.pending.vend_denied = true;
                self.phase = VendPhase::None;
                self.entered_at = now;
            }
            _ => {}
        }
    }

    // ---- external collaborator interface ------------------------------

    /// Open a session with the given funds (minor units) at the next POLL.
    /// Ignored unless the reader is enabled and no session is open.
    pub fn request_session(&mut self, funds: u16) {
        if self.state != SessionState::Enabled {
            warn!("session request ignored in {:?}", self.state);
            return;
        }
        self.funds = funds;
        self.pending.session_begin = true;
    }

    /// Approve the outstanding vend request (deferred policy).
    pub fn approve_vend(&mut self) {
        if self.phase != VendPhase::Requested {
            warn!("vend approval with no vend pending");
            return;
        }
        self.pending.vend_approved = true;
    }

    /// Deny the outstanding vend request (deferred policy).
    pub fn deny_vend(&mut self) {
        if self.phase != VendPhase::Requested {
            warn!("vend denial with no vend pending");
            return;
        }
        self.pending.vend_denied = true;
    }

    /// Ask the VMC to close the session.
    pub fn cancel_session(&mut self) {
        if matches!(self.state, SessionState::Idle | SessionState::Vend) {
            self.pending.session_cancel = true;
        }
    }

    // ---- peripheral role: received commands ---------------------------

    /// Apply one addressed, checksum-valid command. Returns what to answer
    /// and anything to tell the application. Malformed or misaddressed
    /// frames never reach this point.
    pub fn handle_command(&mut self, cmd: &VmcCommand, now: Instant) -> Outcome {
        self.tick(now);
        match *cmd {
            VmcCommand::Reset => Outcome {
                notification: self.reset(now),
                reply: None,
            },
            VmcCommand::SetupConfig(cfg) => {
                self.vmc_config = Some(cfg);
                self.enter(SessionState::Disabled, now);
                Outcome::reply(PollReply::ReaderConfig(self.config.reader))
            }
            VmcCommand::SetupPrices { max, min } => {
                info!("price limits: max {} min {}", max, min);
                self.price_limits = Some((max, min));
                Outcome::ACK
            }
            VmcCommand::Poll => self.drain_pending(now),
            VmcCommand::VendRequest { price, item } => self.handle_vend_request(price, item, now),
            VmcCommand::VendCancel => {
                if self.state == SessionState::Vend {
                    self.pending.vend_approved = false;
                    self.pending.vend_denied = true;
                    self.phase = VendPhase::None;
                    Outcome::ACK
                } else {
                    self.out_of_sequence()
                }
            }
            VmcCommand::VendSuccess { item } => self.handle_vend_success(item, now),
            VmcCommand::VendFailure => {
                if self.state == SessionState::Vend {
                    self.phase = VendPhase::None;
                    self.ctx = None;
                    self.enter(SessionState::Idle, now);
                    Outcome::ACK
                } else if self.state == SessionState::Idle && self.ctx.is_none() {
                    // Outcome already applied; the VMC resent it after a
                    // lost ACK.
                    Outcome::ACK
                } else {
                    self.out_of_sequence()
                }
            }
            VmcCommand::SessionComplete => {
                if matches!(self.state, SessionState::Idle | SessionState::Vend) {
                    self.pending.session_end = true;
                    Outcome::ACK
                } else {
                    self.out_of_sequence()
                }
            }
            VmcCommand::CashSale { price, item } => Outcome {
                reply: None,
                notification: Some(SessionNotification::CashSale {
                    price: self.config.reader.from_scaled(price),
                    item,
                }),
            },
            VmcCommand::ReaderDisable => {
                if self.state == SessionState::Inactive {
                    self.out_of_sequence()
                } else {
                    self.close_session();
                    self.enter(SessionState::Disabled, now);
                    Outcome::ACK
                }
            }
            VmcCommand::ReaderEnable => match self.state {
                SessionState::Disabled => {
                    self.enter(SessionState::Enabled, now);
                    Outcome::ACK
                }
                // Re-enabling an enabled reader is a retransmission.
                SessionState::Enabled => Outcome::ACK,
                _ => self.out_of_sequence(),
            },
            VmcCommand::ReaderCancel => {
                // Answered directly, not via a pending action.
                self.close_session();
                if self.state != SessionState::Inactive {
                    self.enter(SessionState::Enabled, now);
                }
                Outcome::reply(PollReply::Cancelled)
            }
            VmcCommand::RequestId(id) => {
                self.peer_identity = Some(id);
                Outcome::reply(PollReply::PeripheralId(self.config.identity))
            }
        }
    }

    fn handle_vend_request(&mut self, price: u16, item: u16, now: Instant) -> Outcome {
        let price = self.config.reader.from_scaled(price);
        // A lost reply makes the VMC resend; the repeat must be
        // indistinguishable from the first delivery.
        if self.state == SessionState::Vend
            && self.ctx == Some(VendContext { price, item })
        {
            return Outcome::ACK;
        }
        if self.state != SessionState::Idle {
            return self.out_of_sequence();
        }
        self.ctx = Some(VendContext { price, item });
        self.phase = VendPhase::Requested;
        self.enter(SessionState::Vend, now);
        match self.config.vend_policy {
            VendPolicy::AutoApprove => {
                if price <= self.funds {
                    self.pending.vend_approved = true;
                } else {
                    self.pending.vend_denied = true;
                }
            }
            VendPolicy::Deferred => {}
        }
        Outcome::ACK
    }

    fn handle_vend_success(&mut self, item: u16, now: Instant) -> Outcome {
        match (self.state, self.ctx) {
            (SessionState::Vend, Some(ctx)) => {
                self.funds = self.funds.saturating_sub(ctx.price);
                self.ctx = None;
                self.phase = VendPhase::None;
                self.enter(SessionState::Idle, now);
                Outcome {
                    reply: None,
                    notification: Some(SessionNotification::SaleCompleted {
                        price: ctx.price,
                        item,
                    }),
                }
            }
            // Outcome already applied; the VMC resent it after a lost ACK.
            (SessionState::Idle, None) => Outcome::ACK,
            _ => self.out_of_sequence(),
        }
    }

    fn out_of_sequence(&mut self) -> Outcome {
        warn!("command out of sequence in {:?}", self.state);
        self.pending.out_of_sequence = true;
        Outcome::ACK
    }

    fn close_session(&mut self) {
        self.ctx = None;
        self.phase = VendPhase::None;
        self.funds = 0;
        self.pending.vend_approved = false;
        self.pending.vend_denied = false;
        self.pending.session_begin = false;
        self.pending.session_cancel = false;
        self.pending.session_end = false;
    }

    /// Answer a POLL: at most one pending event, highest priority first.
    fn drain_pending(&mut self, now: Instant) -> Outcome {
        let Some(kind) = self.pending.take_highest() else {
            return Outcome::ACK;
        };
        match kind {
            PendingKind::OutOfSequence => {
                self.close_session();
                self.enter(SessionState::Inactive, now);
                Outcome::reply(PollReply::OutOfSequence)
            }
            PendingKind::JustReset => Outcome::reply(PollReply::JustReset),
            PendingKind::VendApproved => match self.ctx {
                Some(ctx) => {
                    self.phase = VendPhase::Approved;
                    Outcome::reply(PollReply::VendApproved {
                        amount: self.config.reader.to_scaled(ctx.price),
                    })
                }
                None => Outcome::ACK,
            },
            PendingKind::VendDenied => {
                self.ctx = None;
                self.phase = VendPhase::None;
                if self.state == SessionState::Vend {
                    self.enter(SessionState::Idle, now);
                }
                Outcome::reply(PollReply::VendDenied)
            }
            PendingKind::SessionEnd => {
                self.close_session();
                self.enter(SessionState::Enabled, now);
                Outcome {
                    reply: Some(PollReply::EndSession),
                    notification: Some(SessionNotification::SessionEnded),
                }
            }
            PendingKind::SessionBegin => {
                if self.state != SessionState::Enabled {
                    return Outcome::ACK;
                }
                self.enter(SessionState::Idle, now);
                Outcome::reply(PollReply::BeginSession {
                    funds: self.config.reader.to_scaled(self.funds),
                })
            }
            PendingKind::SessionCancel => Outcome::reply(PollReply::SessionCancelRequest),
        }
    }

    /// Whether the next POLL would carry an event.
    pub fn has_pending(&self) -> bool {
        self.pending.any()
    }

    // ---- master role: observed replies --------------------------------

    /// Mirror a peripheral's poll reply into the master-side lifecycle.
    pub fn observe_reply(&mut self, reply: &PollReply, now: Instant) -> Option<SessionNotification> {
        match *reply {
            PollReply::JustReset => {
                self.ctx = None;
                self.phase = VendPhase::None;
                self.funds = 0;
                self.enter(SessionState::Inactive, now);
                None
            }
            PollReply::ReaderConfig(cfg) => {
                self.peer_config = Some(cfg);
                self.enter(SessionState::Disabled, now);
                None
            }
            PollReply::PeripheralId(id) => {
                self.peer_identity = Some(id);
                None
            }
            PollReply::BeginSession { funds } => {
                self.funds = self.scaling().from_scaled(funds);
                self.enter(SessionState::Idle, now);
                None
            }
            PollReply::SessionCancelRequest => None,
            PollReply::VendApproved { .. } => {
                self.phase = VendPhase::Approved;
                None
            }
            PollReply::VendDenied => {
                self.ctx = None;
                self.phase = VendPhase::None;
                self.enter(SessionState::Idle, now);
                None
            }
            PollReply::EndSession => {
                self.close_session();
                self.enter(SessionState::Enabled, now);
                Some(SessionNotification::SessionEnded)
            }
            PollReply::Cancelled => {
                self.close_session();
                self.enter(SessionState::Enabled, now);
                None
            }
            PollReply::OutOfSequence => {
                self.close_session();
                self.enter(SessionState::Inactive, now);
                None
            }
        }
    }

    /// Master role: record the vend request it is about to transmit.
    pub fn begin_vend(&mut self, price: u16, item: u16, now: Instant) {
        self.ctx = Some(VendContext { price, item });
        self.phase = VendPhase::Requested;
        self.enter(SessionState::Vend, now);
    }

    /// Master role: the vend succeeded and VEND_SUCCESS went out.
    pub fn finish_vend(&mut self, now: Instant) -> Option<SessionNotification> {
        let ctx = self.ctx.take()?;
        self.phase = VendPhase::None;
        self.funds = self.funds.saturating_sub(ctx.price);
        self.enter(SessionState::Idle, now);
        Some(SessionNotification::SaleCompleted {
            price: ctx.price,
            item: ctx.item,
        })
    }

    /// Master role: mark the peripheral configured and enabled.
    pub fn mark_enabled(&mut self, now: Instant) {
        self.enter(SessionState::Enabled, now);
    }

    /// Master role: the peripheral stopped answering and is considered
    /// offline until it completes a fresh handshake.
    pub fn mark_inactive(&mut self, now: Instant) {
        self.close_session();
        self.peer_config = None;
        self.peer_identity = None;
        self.enter(SessionState::Inactive, now);
    }

    /// Currency scaling in force: the peer's record on the master side, our
    /// own on the peripheral side.
    pub fn scaling(&self) -> ReaderConfig {
        match self.role {
            Role::Master => self.peer_config.unwrap_or_default(),
            Role::Peripheral => self.config.reader,
        }
    }
}
