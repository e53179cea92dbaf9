//! Speaker positions and channel configurations.
//!
//! A [`ChannelConfig`] is a bitmask over [`ChannelPosition`]s where position
//! `p` occupies bit `1 << p`. Interleaved frames list the set positions in
//! ascending bit order.

use std::fmt;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelPosition {
    Unknown = 0,
    FrontLeft,
    FrontRight,
    FrontCenter,
    LFE,
    BackLeft,
    BackRight,
    FrontLeftOfCenter,
    FrontRightOfCenter,
    BackCenter,
    SideLeft,
    SideRight,
    TopCenter,
    TopFrontLeft,
    TopFrontCenter,
    TopFrontRight,
    TopBackLeft,
    TopBackCenter,
    TopBackRight,
    LFE2,
    TopSideLeft,
    TopSideRight,
    BottomFrontCenter,
    BottomFrontLeft,
    BottomFrontRight,
}

impl ChannelPosition {
    /// All named positions, in bit order.
    pub const ALL: [ChannelPosition; 24] = [
        Self::FrontLeft,
        Self::FrontRight,
        Self::FrontCenter,
        Self::LFE,
        Self::BackLeft,
        Self::BackRight,
        Self::FrontLeftOfCenter,
        Self::FrontRightOfCenter,
        Self::BackCenter,
        Self::SideLeft,
        Self::SideRight,
        Self::TopCenter,
        Self::TopFrontLeft,
        Self::TopFrontCenter,
        Self::TopFrontRight,
        Self::TopBackLeft,
        Self::TopBackCenter,
        Self::TopBackRight,
        Self::LFE2,
        Self::TopSideLeft,
        Self::TopSideRight,
        Self::BottomFrontCenter,
        Self::BottomFrontLeft,
        Self::BottomFrontRight,
    ];

    pub const fn bit(self) -> u32 {
        1 << self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::FrontLeft => "FrontLeft",
            Self::FrontRight => "FrontRight",
            Self::FrontCenter => "FrontCenter",
            Self::LFE => "LFE",
            Self::BackLeft => "BackLeft",
            Self::BackRight => "BackRight",
            Self::FrontLeftOfCenter => "FrontLeftOfCenter",
            Self::FrontRightOfCenter => "FrontRightOfCenter",
            Self::BackCenter => "BackCenter",
            Self::SideLeft => "SideLeft",
            Self::SideRight => "SideRight",
            Self::TopCenter => "TopCenter",
            Self::TopFrontLeft => "TopFrontLeft",
            Self::TopFrontCenter => "TopFrontCenter",
            Self::TopFrontRight => "TopFrontRight",
            Self::TopBackLeft => "TopBackLeft",
            Self::TopBackCenter => "TopBackCenter",
            Self::TopBackRight => "TopBackRight",
            Self::LFE2 => "LFE2",
            Self::TopSideLeft => "TopSideLeft",
            Self::TopSideRight => "TopSideRight",
            Self::BottomFrontCenter => "BottomFrontCenter",
            Self::BottomFrontLeft => "BottomFrontLeft",
            Self::BottomFrontRight => "BottomFrontRight",
        }
    }
}

impl fmt::Display for ChannelPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Positions addressable by a WAVE/WASAPI speaker mask, in mask bit order.
const SPEAKER_MASK_ORDER: [ChannelPosition; 18] = [
    ChannelPosition::FrontLeft,
    ChannelPosition::FrontRight,
    ChannelPosition::FrontCenter,
    ChannelPosition::LFE,
    ChannelPosition::BackLeft,
    ChannelPosition::BackRight,
    ChannelPosition::FrontLeftOfCenter,
    ChannelPosition::FrontRightOfCenter,
    ChannelPosition::BackCenter,
    ChannelPosition::SideLeft,
    ChannelPosition::SideRight,
    ChannelPosition::TopCenter,
    ChannelPosition::TopFrontLeft,
    ChannelPosition::TopFrontCenter,
    ChannelPosition::TopFrontRight,
    ChannelPosition::TopBackLeft,
    ChannelPosition::TopBackCenter,
    ChannelPosition::TopBackRight,
];

const fn mask(positions: &[ChannelPosition]) -> u32 {
    let mut bits = 0;
    let mut i = 0;
    while i < positions.len() {
        bits |= 1 << positions[i] as u32;
        i += 1;
    }
    bits
}

use ChannelPosition as P;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChannelConfig(u32);

impl ChannelConfig {
    pub const UNKNOWN: Self = Self(0);
    pub const MONO: Self = Self(mask(&[P::FrontCenter]));
    pub const STEREO: Self = Self(mask(&[P::FrontLeft, P::FrontRight]));
    pub const SURROUND_2_1: Self = Self(mask(&[P::FrontLeft, P::FrontRight, P::LFE]));
    pub const SURROUND_3_0: Self = Self(mask(&[P::FrontLeft, P::FrontRight, P::FrontCenter]));
    pub const SURROUND_3_1: Self = Self(mask(&[
        P::FrontLeft,
        P::FrontRight,
        P::FrontCenter,
        P::LFE,
    ]));
    pub const QUAD: Self = Self(mask(&[
        P::FrontLeft,
        P::FrontRight,
        P::BackLeft,
        P::BackRight,
    ]));
    pub const SURROUND_5_0: Self = Self(mask(&[
        P::FrontLeft,
        P::FrontRight,
        P::FrontCenter,
        P::BackLeft,
        P::BackRight,
    ]));
    pub const SURROUND_5_1: Self = Self(Self::SURROUND_5_0.0 | P::LFE.bit());
    pub const SURROUND_7_0: Self = Self(mask(&[
        P::FrontLeft,
        P::FrontRight,
        P::FrontCenter,
        P::BackLeft,
        P::BackRight,
        P::SideLeft,
        P::SideRight,
    ]));
    pub const SURROUND_7_1: Self = Self(Self::SURROUND_7_0.0 | P::LFE.bit());

    const PRESETS: [(Self, &'static str); 10] = [
        (Self::MONO, "Mono"),
        (Self::STEREO, "Stereo"),
        (Self::SURROUND_2_1, "2.1"),
        (Self::SURROUND_3_0, "3.0"),
        (Self::SURROUND_3_1, "3.1"),
        (Self::QUAD, "Quad"),
        (Self::SURROUND_5_0, "5.0"),
        (Self::SURROUND_5_1, "5.1"),
        (Self::SURROUND_7_0, "7.0"),
        (Self::SURROUND_7_1, "7.1"),
    ];

    pub fn from_bits(bits: u32) -> Self {
        Self(bits & !P::Unknown.bit())
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_positions(positions: &[ChannelPosition]) -> Self {
        Self::from_bits(positions.iter().fold(0, |bits, p| bits | p.bit()))
    }

    pub fn is_unknown(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, position: ChannelPosition) -> bool {
        position != P::Unknown && self.0 & position.bit() != 0
    }

    pub fn channel_count(self) -> u16 {
        self.0.count_ones() as u16
    }

    /// Index of `position` inside an interleaved frame.
    pub fn channel_offset(self, position: ChannelPosition) -> Option<usize> {
        if !self.contains(position) {
            return None;
        }
        Some((self.0 & (position.bit() - 1)).count_ones() as usize)
    }

    pub fn positions(self) -> impl Iterator<Item = ChannelPosition> {
        ChannelPosition::ALL
            .into_iter()
            .filter(move |p| self.contains(*p))
    }

    /// Conventional layout for a plain channel count.
    pub fn default_for_channel_count(channels: u16) -> Self {
        match channels {
            1 => Self::MONO,
            2 => Self::STEREO,
            3 => Self::SURROUND_2_1,
            4 => Self::SURROUND_3_1,
            5 => Self::SURROUND_5_0,
            6 => Self::SURROUND_5_1,
            7 => Self::SURROUND_7_0,
            8 => Self::SURROUND_7_1,
            _ => Self::UNKNOWN,
        }
    }

    pub fn preset_name(self) -> Option<&'static str> {
        Self::PRESETS
            .iter()
            .find(|(preset, _)| *preset == self)
            .map(|(_, name)| *name)
    }

    /// Translates to a WAVE_FORMAT_EXTENSIBLE speaker mask.
    ///
    /// Positions the mask cannot express are dropped.
    pub fn to_speaker_mask(self) -> u32 {
        SPEAKER_MASK_ORDER
            .iter()
            .enumerate()
            .filter(|(_, p)| self.contains(**p))
            .fold(0, |bits, (i, _)| bits | (1 << i))
    }

    pub fn from_speaker_mask(speaker_mask: u32) -> Self {
        let positions: u32 = SPEAKER_MASK_ORDER
            .iter()
            .enumerate()
            .filter(|(i, _)| speaker_mask & (1 << i) != 0)
            .fold(0, |bits, (_, p)| bits | p.bit());
        Self(positions)
    }
}

impl fmt::Display for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            return f.write_str("Unknown");
        }
        if let Some(name) = self.preset_name() {
            return f.write_str(name);
        }
        for (i, position) in self.positions().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(position.name())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_have_expected_counts() {
        assert_eq!(ChannelConfig::MONO.channel_count(), 1);
        assert_eq!(ChannelConfig::STEREO.channel_count(), 2);
        assert_eq!(ChannelConfig::SURROUND_2_1.channel_count(), 3);
        assert_eq!(ChannelConfig::QUAD.channel_count(), 4);
        assert_eq!(ChannelConfig::SURROUND_5_1.channel_count(), 6);
        assert_eq!(ChannelConfig::SURROUND_7_1.channel_count(), 8);
    }

    #[test]
    fn test_default_for_channel_count() {
        assert_eq!(ChannelConfig::default_for_channel_count(1), ChannelConfig::MONO);
        assert_eq!(
            ChannelConfig::default_for_channel_count(4),
            ChannelConfig::SURROUND_3_1
        );
        assert_eq!(
            ChannelConfig::default_for_channel_count(8),
            ChannelConfig::SURROUND_7_1
        );
        assert!(ChannelConfig::default_for_channel_count(0).is_unknown());
        assert!(ChannelConfig::default_for_channel_count(12).is_unknown());
    }

    #[test]
    fn test_display_uses_preset_name() {
        assert_eq!(ChannelConfig::SURROUND_5_1.to_string(), "5.1");
        assert_eq!(ChannelConfig::UNKNOWN.to_string(), "Unknown");
    }

    #[test]
    fn test_display_lists_positions_without_preset() {
        let config = ChannelConfig::from_positions(&[
            ChannelPosition::TopCenter,
            ChannelPosition::FrontLeft,
            ChannelPosition::LFE,
        ]);
        assert_eq!(config.preset_name(), None);
        assert_eq!(config.to_string(), "FrontLeft, LFE, TopCenter");
    }

    #[test]
    fn test_channel_offset() {
        let config = ChannelConfig::SURROUND_5_1;
        assert_eq!(config.channel_offset(ChannelPosition::FrontLeft), Some(0));
        assert_eq!(config.channel_offset(ChannelPosition::LFE), Some(3));
        assert_eq!(config.channel_offset(ChannelPosition::BackRight), Some(5));
        assert_eq!(config.channel_offset(ChannelPosition::SideLeft), None);
    }

    #[test]
    fn test_unknown_position_is_ignored() {
        let config = ChannelConfig::from_positions(&[ChannelPosition::Unknown]);
        assert!(config.is_unknown());
        assert!(!ChannelConfig::STEREO.contains(ChannelPosition::Unknown));
    }

    #[test]
    fn test_speaker_mask_translation() {
        // KSAUDIO_SPEAKER_5POINT1 is 0x3F, KSAUDIO_SPEAKER_7POINT1_SURROUND is 0x63F.
        assert_eq!(ChannelConfig::SURROUND_5_1.to_speaker_mask(), 0x3F);
        assert_eq!(ChannelConfig::SURROUND_7_1.to_speaker_mask(), 0x63F);
        assert_eq!(ChannelConfig::from_speaker_mask(0x3), ChannelConfig::STEREO);
        assert_eq!(ChannelConfig::from_speaker_mask(0x4), ChannelConfig::MONO);

        let bottom = ChannelConfig::from_positions(&[ChannelPosition::BottomFrontCenter]);
        assert_eq!(bottom.to_speaker_mask(), 0);
    }
}
