//! Time and connection timing parameters
//!
//! The link layer measures time in microseconds from an arbitrary epoch chosen by the radio
//! timeline (see [`Phy::now`](crate::phy::Phy::now)). Connection parameters are kept in the raw
//! units that are transmitted over the air and converted to a [`Duration`] where they are used for
//! scheduling.

use core::fmt;
use core::ops::{Add, AddAssign, Sub};
use core::time::Duration;

/// A point in time on the radio timeline
///
/// This is the number of microseconds since the epoch of the radio timer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Instant(u64);

impl Instant {
    pub const fn from_micros(micros: u64) -> Self {
        Instant(micros)
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Get the duration from `earlier` to `self`
    ///
    /// A zero duration is returned when `earlier` is after `self`.
    pub fn saturating_duration_since(self, earlier: Instant) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    pub fn checked_duration_since(self, earlier: Instant) -> Option<Duration> {
        self.0.checked_sub(earlier.0).map(Duration::from_micros)
    }
}

fn micros(duration: Duration) -> u64 {
    duration.as_micros() as u64
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        Instant(self.0 + micros(rhs))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += micros(rhs)
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Self::Output {
        Instant(self.0.saturating_sub(micros(rhs)))
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

macro_rules! make_interval {
    ( $(#[ $expl:meta ])*
        $name:ident,
        $raw_low:literal,
        $raw_hi:literal,
        $raw_default:literal,
        $micro_sec_conv:literal) =>
    {
        $(#[ $expl ])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $name {
            raw: u16,
        }

        impl $name {
            /// The smallest raw value
            pub const MIN: u16 = $raw_low;

            /// The largest raw value
            pub const MAX: u16 = $raw_hi;

            /// The number of microseconds within one unit of the raw value
            pub const UNIT_MICROS: u64 = $micro_sec_conv;

            /// Try to create a `
            #[doc = core::stringify!($name)]
            /// ` from a raw u16 value
            ///
            /// # Error
            /// Input `raw` is either greater than
            #[doc = core::stringify!($raw_hi)]
            /// or the value is less than
            #[doc = core::stringify!($raw_low)]
            /// .
            pub fn try_from_raw(raw: u16) -> Result<Self, &'static str> {
                if (Self::MIN..=Self::MAX).contains(&raw) {
                    Ok($name { raw })
                } else {
                    Err(concat!(stringify!($name), " raw value out of range: ", $raw_low, "..=", $raw_hi))
                }
            }

            /// Try to create a `
            #[doc = core::stringify!($name)]
            /// ` from a `Duration`
            ///
            /// The duration is rounded down to a whole number of units.
            ///
            /// # Error
            /// the value is out of bounds.
            pub fn try_from_duration(duration: Duration) -> Result<Self, &'static str> {
                let units = duration.as_micros() / Self::UNIT_MICROS as u128;

                if units > u16::MAX as u128 {
                    return Err(concat!(stringify!($name), " duration out of range"));
                }

                Self::try_from_raw(units as u16)
                    .map_err(|_| concat!(stringify!($name), " duration out of range"))
            }

            /// Get the raw value
            ///
            /// This is the value that is used to represent a `
            #[doc = core::stringify!($name)]
            /// ` within a link layer PDU.
            pub fn get_raw_val(&self) -> u16 {
                self.raw
            }

            /// Get the value as a `Duration`
            pub fn get_duration(&self) -> Duration {
                Duration::from_micros(self.raw as u64 * Self::UNIT_MICROS)
            }
        }

        impl TryFrom<u16> for $name {
            type Error = &'static str;

            fn try_from(v: u16) -> Result<Self, Self::Error> {
                $name::try_from_raw(v)
            }
        }

        impl TryFrom<Duration> for $name {
            type Error = &'static str;

            fn try_from(duration: Duration) -> Result<Self, Self::Error> {
                Self::try_from_duration(duration)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name { raw: $raw_default }
            }
        }
    };
}

make_interval!(
    /// The connection interval
    ///
    /// This is the time between the anchor points of two consecutive connection events, in units
    /// of 1.25 milliseconds. The range is 7.5 milliseconds to 4 seconds and the default is 30
    /// milliseconds.
    ConnectionInterval,
    0x0006,
    0x0C80,
    0x0018,
    1250
);

make_interval!(
    /// The supervision timeout
    ///
    /// This is the maximum time between two received packets before the connection is considered
    /// lost, in units of 10 milliseconds. The range is 100 milliseconds to 32 seconds and the
    /// default is 720 milliseconds.
    SupervisionTimeout,
    0x000A,
    0x0C80,
    0x0048,
    10000
);

/// The slave latency
///
/// The number of consecutive connection events the slave is allowed to skip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SlaveLatency {
    latency: u16,
}

impl SlaveLatency {
    pub const MAX: u16 = 0x01F3;

    /// Try to create a `SlaveLatency` from a raw u16 value
    ///
    /// # Error
    /// The input `raw` is greater then 0x01F3
    pub fn try_from_raw(raw: u16) -> Result<Self, &'static str> {
        if raw <= Self::MAX {
            Ok(Self { latency: raw })
        } else {
            Err("Slave latency cannot be greater than 0x01F3")
        }
    }

    pub fn get_latency(&self) -> u16 {
        self.latency
    }
}

impl TryFrom<u16> for SlaveLatency {
    type Error = &'static str;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::try_from_raw(value)
    }
}

/// The timing parameters of a connection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionParameters {
    pub interval: ConnectionInterval,
    pub latency: SlaveLatency,
    pub timeout: SupervisionTimeout,
}

impl ConnectionParameters {
    /// Create new `ConnectionParameters`
    ///
    /// # Error
    /// The supervision timeout must be larger than `(1 + latency) * interval * 2`.
    pub fn new(
        interval: ConnectionInterval,
        latency: SlaveLatency,
        timeout: SupervisionTimeout,
    ) -> Result<Self, &'static str> {
        let parameters = ConnectionParameters {
            interval,
            latency,
            timeout,
        };

        if parameters.is_timeout_valid() {
            Ok(parameters)
        } else {
            Err("supervision timeout is too small for the interval and latency")
        }
    }

    pub(crate) fn is_timeout_valid(&self) -> bool {
        timeout_is_valid(self.interval, self.latency, self.timeout)
    }
}

fn timeout_is_valid(interval: ConnectionInterval, latency: SlaveLatency, timeout: SupervisionTimeout) -> bool {
    let min = (1 + latency.get_latency() as u64) * micros(interval.get_duration()) * 2;

    micros(timeout.get_duration()) > min
}

/// A proposal for new connection parameters
///
/// This is the input to [`update_parameters`](crate::LinkLayer::update_parameters). The interval is
/// a range, the master picks the final interval from within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParameterProposal {
    pub interval_min: ConnectionInterval,
    pub interval_max: ConnectionInterval,
    pub latency: SlaveLatency,
    pub timeout: SupervisionTimeout,
}

impl ParameterProposal {
    /// Create a new `ParameterProposal`
    ///
    /// # Error
    /// `interval_min` is greater than `interval_max`, or the supervision timeout is too small for
    /// the maximum interval.
    pub fn new(
        interval_min: ConnectionInterval,
        interval_max: ConnectionInterval,
        latency: SlaveLatency,
        timeout: SupervisionTimeout,
    ) -> Result<Self, &'static str> {
        let proposal = ParameterProposal {
            interval_min,
            interval_max,
            latency,
            timeout,
        };

        proposal.validate()?;

        Ok(proposal)
    }

    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        if self.interval_min > self.interval_max {
            Err("minimum interval is greater than the maximum interval")
        } else if !timeout_is_valid(self.interval_max, self.latency, self.timeout) {
            Err("supervision timeout is too small for the interval and latency")
        } else {
            Ok(())
        }
    }

    /// Get the parameters the master uses for this proposal
    ///
    /// `current` is the interval presently in use. It is kept if it is within the proposed range,
    /// otherwise the closest bound of the range is used.
    pub(crate) fn choose(&self, current: ConnectionInterval) -> ConnectionParameters {
        let interval = current.clamp(self.interval_min, self.interval_max);

        ConnectionParameters {
            interval,
            latency: self.latency,
            timeout: self.timeout,
        }
    }
}

impl From<ConnectionParameters> for ParameterProposal {
    fn from(parameters: ConnectionParameters) -> Self {
        ParameterProposal {
            interval_min: parameters.interval,
            interval_max: parameters.interval,
            latency: parameters.latency,
            timeout: parameters.timeout,
        }
    }
}

/// Sleep clock accuracy
///
/// This is the three bit field sent by the master within the connection request. Each value is a
/// range of parts per million, the worst case of the range is used for window widening.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SleepClockAccuracy {
    Ppm251To500,
    Ppm151To250,
    Ppm101To150,
    Ppm76To100,
    Ppm51To75,
    Ppm31To50,
    Ppm21To30,
    Ppm0To20,
}

impl SleepClockAccuracy {
    const TABLE: [SleepClockAccuracy; 8] = [
        SleepClockAccuracy::Ppm251To500,
        SleepClockAccuracy::Ppm151To250,
        SleepClockAccuracy::Ppm101To150,
        SleepClockAccuracy::Ppm76To100,
        SleepClockAccuracy::Ppm51To75,
        SleepClockAccuracy::Ppm31To50,
        SleepClockAccuracy::Ppm21To30,
        SleepClockAccuracy::Ppm0To20,
    ];

    /// Create a `SleepClockAccuracy` from the three bit field value
    ///
    /// Only the lower three bits of `raw` are used.
    pub fn from_raw(raw: u8) -> Self {
        Self::TABLE[(raw & 0x7) as usize]
    }

    pub fn get_raw_val(self) -> u8 {
        self as u8
    }

    /// Get the worst case drift in parts per million
    pub fn ppm(self) -> u32 {
        match self {
            SleepClockAccuracy::Ppm251To500 => 500,
            SleepClockAccuracy::Ppm151To250 => 250,
            SleepClockAccuracy::Ppm101To150 => 150,
            SleepClockAccuracy::Ppm76To100 => 100,
            SleepClockAccuracy::Ppm51To75 => 75,
            SleepClockAccuracy::Ppm31To50 => 50,
            SleepClockAccuracy::Ppm21To30 => 30,
            SleepClockAccuracy::Ppm0To20 => 20,
        }
    }
}

impl Default for SleepClockAccuracy {
    fn default() -> Self {
        SleepClockAccuracy::Ppm51To75
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_bounds() {
        assert!(ConnectionInterval::try_from_raw(5).is_err());
        assert!(ConnectionInterval::try_from_raw(0x0C81).is_err());

        let interval = ConnectionInterval::try_from_duration(Duration::from_millis(30)).unwrap();

        assert_eq!(24, interval.get_raw_val());
        assert_eq!(Duration::from_millis(30), interval.get_duration());

        assert!(SupervisionTimeout::try_from_duration(Duration::from_millis(90)).is_err());
        assert_eq!(
            Duration::from_secs(32),
            SupervisionTimeout::try_from_raw(0x0C80).unwrap().get_duration()
        );

        assert!(SlaveLatency::try_from_raw(500).is_err());
    }

    #[test]
    fn timeout_must_cover_latency() {
        let interval = ConnectionInterval::try_from_duration(Duration::from_millis(50)).unwrap();
        let latency = SlaveLatency::try_from_raw(4).unwrap();

        // (1 + 4) * 50ms * 2 = 500ms
        let too_small = SupervisionTimeout::try_from_duration(Duration::from_millis(500)).unwrap();
        let large_enough = SupervisionTimeout::try_from_duration(Duration::from_millis(510)).unwrap();

        assert!(ConnectionParameters::new(interval, latency, too_small).is_err());
        assert!(ConnectionParameters::new(interval, latency, large_enough).is_ok());
    }

    #[test]
    fn proposal_choice_is_clamped() {
        let min = ConnectionInterval::try_from_raw(20).unwrap();
        let max = ConnectionInterval::try_from_raw(40).unwrap();

        let proposal = ParameterProposal::new(min, max, SlaveLatency::default(), SupervisionTimeout::default()).unwrap();

        assert_eq!(min, proposal.choose(ConnectionInterval::try_from_raw(6).unwrap()).interval);
        assert_eq!(max, proposal.choose(ConnectionInterval::try_from_raw(100).unwrap()).interval);
        assert_eq!(30, proposal.choose(ConnectionInterval::try_from_raw(30).unwrap()).interval.get_raw_val());

        assert!(ParameterProposal::new(max, min, SlaveLatency::default(), SupervisionTimeout::default()).is_err());
    }

    #[test]
    fn sleep_clock_accuracy_table() {
        for raw in 0..8 {
            assert_eq!(raw, SleepClockAccuracy::from_raw(raw).get_raw_val());
        }

        assert_eq!(500, SleepClockAccuracy::from_raw(0).ppm());
        assert_eq!(20, SleepClockAccuracy::from_raw(7).ppm());
    }

    #[test]
    fn instant_arithmetic() {
        let start = Instant::from_micros(1_000);

        let later = start + Duration::from_micros(250);

        assert_eq!(Duration::from_micros(250), later.saturating_duration_since(start));
        assert_eq!(Duration::ZERO, start.saturating_duration_since(later));
        assert_eq!(None, start.checked_duration_since(later));
        assert_eq!(Instant::from_micros(0), start - Duration::from_secs(1));
    }
}
