//! Data channels
//!
//! A connection hops between the 37 data channels, moving to a new channel at the start of every
//! connection event. The channel for an event is determined by channel selection algorithm #1
//! from the unmapped channel of the previous event, the hop increment, and the channel map.

use core::fmt;

/// The number of data channels
pub const DATA_CHANNEL_COUNT: u8 = 37;

/// The index of a data channel
///
/// This is a value between 0 and 36 (inclusive).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataChannelIndex(u8);

impl DataChannelIndex {
    /// Try to create a `DataChannelIndex`
    ///
    /// `None` is returned if `index` is larger than 36.
    pub fn try_new(index: u8) -> Option<Self> {
        (index < DATA_CHANNEL_COUNT).then_some(DataChannelIndex(index))
    }

    pub fn get_raw_val(self) -> u8 {
        self.0
    }

    /// Get the RF channel of this data channel
    ///
    /// RF channels 0, 12, and 39 are the advertising channels, the data channels are mapped onto
    /// RF channels 1-11 and 13-38.
    pub fn rf_channel(self) -> u8 {
        if self.0 <= 10 {
            self.0 + 1
        } else {
            self.0 + 2
        }
    }
}

impl fmt::Display for DataChannelIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Error for an invalid channel map
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelMapError {
    /// Fewer than two channels are marked as used
    TooFewChannels,
    /// A channel index is larger than 36
    InvalidChannel(u8),
}

impl fmt::Display for ChannelMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelMapError::TooFewChannels => f.write_str("a channel map must have at least two used channels"),
            ChannelMapError::InvalidChannel(ch) => write!(f, "{} is not a data channel index", ch),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ChannelMapError {}

/// A data channel map
///
/// This is the five octet field where the bit at position `n` marks data channel `n` as used. The
/// channel index is the octet index times eight plus the bit position within the octet. Only the
/// lower 37 bits are significant, and a valid map always has at least two used channels.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelMap([u8; 5]);

impl ChannelMap {
    /// A channel map with all 37 data channels used
    pub const ALL: ChannelMap = ChannelMap([0xFF, 0xFF, 0xFF, 0xFF, 0x1F]);

    /// Try to create a `ChannelMap` from its over the air representation
    ///
    /// The reserved upper three bits of the last octet are ignored.
    pub fn try_from_bytes(bytes: [u8; 5]) -> Result<Self, ChannelMapError> {
        let mut map = ChannelMap(bytes);

        map.0[4] &= 0x1F;

        if map.used_count() < 2 {
            Err(ChannelMapError::TooFewChannels)
        } else {
            Ok(map)
        }
    }

    /// Create a `ChannelMap` from a list of used channels
    pub fn from_channels<I>(channels: I) -> Result<Self, ChannelMapError>
    where
        I: IntoIterator<Item = u8>,
    {
        let mut bytes = [0u8; 5];

        for channel in channels {
            if channel >= DATA_CHANNEL_COUNT {
                return Err(ChannelMapError::InvalidChannel(channel));
            }

            bytes[channel as usize / 8] |= 1 << (channel % 8);
        }

        Self::try_from_bytes(bytes)
    }

    /// Get the over the air representation
    pub fn as_bytes(&self) -> [u8; 5] {
        self.0
    }

    /// Check if `channel` is marked as used
    pub fn is_used(&self, channel: u8) -> bool {
        channel < DATA_CHANNEL_COUNT && self.0[channel as usize / 8] & (1 << (channel % 8)) != 0
    }

    /// Get the number of used channels
    pub fn used_count(&self) -> u8 {
        self.0.iter().map(|byte| byte.count_ones() as u8).sum()
    }

    /// Iterate over the used channels in ascending order
    pub fn iter(&self) -> impl Iterator<Item = DataChannelIndex> + '_ {
        (0..DATA_CHANNEL_COUNT)
            .filter(move |channel| self.is_used(*channel))
            .map(DataChannelIndex)
    }

    /// Get the used channel at position `n` of the ascending list of used channels
    fn nth_used(&self, n: u8) -> Option<DataChannelIndex> {
        self.iter().nth(n as usize)
    }
}

impl Default for ChannelMap {
    fn default() -> Self {
        ChannelMap::ALL
    }
}

impl fmt::Debug for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChannelMap({:02X}{:02X}{:02X}{:02X}{:02X})",
            self.0[4], self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

/// The hop increment of a connection
///
/// This is a value between 5 and 16 (inclusive).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HopIncrement(u8);

impl HopIncrement {
    pub const MIN: u8 = 5;
    pub const MAX: u8 = 16;

    pub fn try_new(hop: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&hop).then_some(HopIncrement(hop))
    }

    pub fn get_raw_val(self) -> u8 {
        self.0
    }
}

/// Get the unmapped channel following `unmapped_prev`
pub fn unmapped_channel(unmapped_prev: u8, hop: HopIncrement) -> u8 {
    (unmapped_prev + hop.0) % DATA_CHANNEL_COUNT
}

/// Map an unmapped channel onto the channel map
///
/// A used channel maps to itself. An unused channel is remapped to the used channel at position
/// `unmapped % used_count` within the ascending list of used channels.
pub fn remap(unmapped: u8, map: &ChannelMap) -> DataChannelIndex {
    if map.is_used(unmapped) {
        DataChannelIndex(unmapped)
    } else {
        // a valid map always has at least two used channels
        map.nth_used(unmapped % map.used_count().max(1))
            .unwrap_or(DataChannelIndex(unmapped))
    }
}

/// Channel selection algorithm #1
///
/// Returns the data channel for the connection event following the event whose unmapped channel
/// was `unmapped_prev`. A connection must also keep the unmapped channel (see
/// [`unmapped_channel`]) as it is the input for the event after.
pub fn next_data_channel(unmapped_prev: u8, hop: HopIncrement, map: &ChannelMap) -> DataChannelIndex {
    remap(unmapped_channel(unmapped_prev, hop), map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn used_channel_is_not_remapped() {
        let map = ChannelMap::from_channels((0..37).filter(|ch| *ch != 3 && *ch != 10)).unwrap();

        let hop = HopIncrement::try_new(7).unwrap();

        assert_eq!(8, unmapped_channel(1, hop));

        assert_eq!(DataChannelIndex(8), next_data_channel(1, hop, &map));
    }

    #[test]
    fn unused_channel_is_remapped() {
        let map = ChannelMap::from_channels((0..37).filter(|ch| *ch != 3 && *ch != 10)).unwrap();

        // 3 % 35 = 3, the used channels are 0, 1, 2, 4, ... so the fourth used channel is 4
        assert_eq!(DataChannelIndex(4), remap(3, &map));

        // 10 % 35 = 10, with both 3 and 10 missing the eleventh used channel is 12
        assert_eq!(DataChannelIndex(12), remap(10, &map));

        let sparse = ChannelMap::from_channels([1, 9, 20]).unwrap();

        // 30 % 3 = 0 -> channel 1; 35 % 3 = 2 -> channel 20
        assert_eq!(DataChannelIndex(1), remap(30, &sparse));
        assert_eq!(DataChannelIndex(20), remap(35, &sparse));
    }

    #[test]
    fn channel_map_validation() {
        assert_eq!(Err(ChannelMapError::TooFewChannels), ChannelMap::from_channels([4]));
        assert_eq!(Err(ChannelMapError::InvalidChannel(37)), ChannelMap::from_channels([4, 37]));

        let map = ChannelMap::try_from_bytes([0, 0, 0, 0, 0xFF]).unwrap();

        assert_eq!([0, 0, 0, 0, 0x1F], map.as_bytes());
        assert_eq!(5, map.used_count());

        assert!(ChannelMap::try_from_bytes([0, 0, 0, 0, 0xE1]).is_err());

        assert_eq!(37, ChannelMap::ALL.used_count());
    }

    #[test]
    fn rf_channels() {
        assert_eq!(1, DataChannelIndex(0).rf_channel());
        assert_eq!(11, DataChannelIndex(10).rf_channel());
        assert_eq!(13, DataChannelIndex(11).rf_channel());
        assert_eq!(38, DataChannelIndex(36).rf_channel());
    }

    #[test]
    fn selection_is_deterministic_and_used() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);

        for _ in 0..2000 {
            let map = loop {
                let mut bytes = [0u8; 5];

                rng.fill(&mut bytes);

                if let Ok(map) = ChannelMap::try_from_bytes(bytes) {
                    break map;
                }
            };

            let hop = HopIncrement::try_new(rng.gen_range(5..=16)).unwrap();

            let prev = rng.gen_range(0..37);

            let first = next_data_channel(prev, hop, &map);

            assert_eq!(first, next_data_channel(prev, hop, &map));

            assert!(map.is_used(first.get_raw_val()), "{:?} selected unused {}", map, first);
        }
    }
}
