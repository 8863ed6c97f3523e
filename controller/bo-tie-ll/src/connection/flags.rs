/// A connection flag
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flag {
    /// A packet was received within the current connection event
    PktRxd,
    /// `LL_TERMINATE_IND` was received from the peer
    TerminateIndRxd,
    /// The slave may skip connection events
    AllowSlaveLatency,
    VersionIndSent,
    RxdVersionInd,
    /// The features of the peer are known
    FeaturesExchanged,
    /// The host requested the connection be terminated
    LocalTerminate,
}

impl Flag {
    fn mask(self) -> u16 {
        1 << self as u16
    }
}

/// The set of flags of a connection
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u16);

impl Flags {
    pub fn new() -> Self {
        Flags(0)
    }

    pub fn set(&mut self, flag: Flag) {
        self.0 |= flag.mask()
    }

    pub fn clear(&mut self, flag: Flag) {
        self.0 &= !flag.mask()
    }

    pub fn contains(&self, flag: Flag) -> bool {
        self.0 & flag.mask() != 0
    }
}

impl core::fmt::Debug for Flags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        const ALL: [Flag; 7] = [
            Flag::PktRxd,
            Flag::TerminateIndRxd,
            Flag::AllowSlaveLatency,
            Flag::VersionIndSent,
            Flag::RxdVersionInd,
            Flag::FeaturesExchanged,
            Flag::LocalTerminate,
        ];

        f.debug_set()
            .entries(ALL.iter().filter(|flag| self.contains(**flag)))
            .finish()
    }
}
