//! Formats advertised by registry nodes.
//!
//! A node answers a format enumeration with loosely typed payloads: each
//! property may be a single value, an enumerated choice or a range. Parsing
//! resolves every shape through [`PropValue::preferred`] and turns anything
//! malformed into `None`, which the monitor treats as "no usable format".

use crate::format::{AudioFormat, ChannelConfig, ChannelPosition, SampleFormat};

/// A negotiated property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue<T> {
    Scalar(T),
    Enum { default: T, alternatives: Vec<T> },
    Range { default: T, min: T, max: T },
}

impl<T: Clone> PropValue<T> {
    /// The value a node would pick without further negotiation.
    pub fn preferred(&self) -> T {
        match self {
            Self::Scalar(value) => value.clone(),
            Self::Enum { default, .. } => default.clone(),
            Self::Range { default, .. } => default.clone(),
        }
    }

    /// Every value the property can take, when that set is finite.
    pub fn choices(&self) -> Vec<T> {
        match self {
            Self::Scalar(value) => vec![value.clone()],
            Self::Enum {
                default,
                alternatives,
            } => {
                let mut all = vec![default.clone()];
                all.extend(alternatives.iter().cloned());
                all
            }
            Self::Range { default, .. } => vec![default.clone()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSubtype {
    Raw,
    Iec958,
    Other(String),
}

/// One raw answer to a format enumeration request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeFormatPayload {
    pub media_subtype: Option<MediaSubtype>,
    pub format: Option<PropValue<String>>,
    pub rate: Option<PropValue<i64>>,
    pub channels: Option<PropValue<i64>>,
    pub positions: Option<Vec<String>>,
    pub iec958_codec: Option<PropValue<String>>,
}

impl NodeFormatPayload {
    pub fn raw(format: &str, rate: i64, channels: i64) -> Self {
        Self {
            media_subtype: Some(MediaSubtype::Raw),
            format: Some(PropValue::Scalar(format.to_string())),
            rate: Some(PropValue::Scalar(rate)),
            channels: Some(PropValue::Scalar(channels)),
            ..Default::default()
        }
    }

    pub fn iec958(codec: &str, rate: i64) -> Self {
        Self {
            media_subtype: Some(MediaSubtype::Iec958),
            rate: Some(PropValue::Scalar(rate)),
            iec958_codec: Some(PropValue::Scalar(codec.to_string())),
            ..Default::default()
        }
    }

    pub fn with_positions(mut self, positions: &[&str]) -> Self {
        self.positions = Some(positions.iter().map(|p| p.to_string()).collect());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iec958Codec {
    Pcm,
    Dts,
    Ac3,
    Mpeg,
    Mpeg2Aac,
    Eac3,
    TrueHd,
    DtsHd,
    Unknown,
}

impl Iec958Codec {
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "PCM" => Self::Pcm,
            "DTS" => Self::Dts,
            "AC3" => Self::Ac3,
            "MPEG" => Self::Mpeg,
            "MPEG2-AAC" | "MPEG2AAC" => Self::Mpeg2Aac,
            "EAC3" => Self::Eac3,
            "TRUEHD" => Self::TrueHd,
            "DTSHD" | "DTS-HD" => Self::DtsHd,
            _ => Self::Unknown,
        }
    }
}

/// A parsed node format.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeAudioFormat {
    Raw {
        sample_format: SampleFormat,
        sample_rate: u32,
        channel_count: u16,
        channel_config: ChannelConfig,
    },
    /// IEC 60958 passthrough. Only the PCM codec carries plain audio.
    Iec958 { codec: Iec958Codec, sample_rate: u32 },
}

impl NodeAudioFormat {
    pub fn parse(payload: &NodeFormatPayload) -> Option<Self> {
        match payload.media_subtype.as_ref()? {
            MediaSubtype::Raw => parse_raw(payload),
            MediaSubtype::Iec958 => parse_iec958(payload),
            MediaSubtype::Other(_) => None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, Self::Iec958 { .. })
    }

    /// Plain PCM, either raw or wrapped in an IEC958 PCM frame.
    pub fn is_pcm(&self) -> bool {
        match self {
            Self::Raw { .. } => true,
            Self::Iec958 { codec, .. } => *codec == Iec958Codec::Pcm,
        }
    }

    /// IEC958 PCM is always presented as 16-bit stereo.
    pub fn to_audio_format(&self) -> AudioFormat {
        match *self {
            Self::Raw {
                sample_format,
                sample_rate,
                channel_count,
                channel_config,
            } => {
                let format = AudioFormat::new(sample_format, sample_rate, channel_count);
                if channel_config.channel_count() == channel_count {
                    format.with_channel_config(channel_config)
                } else {
                    format
                }
            }
            Self::Iec958 { sample_rate, .. } => {
                AudioFormat::new(SampleFormat::Int16, sample_rate, 2)
                    .with_channel_config(ChannelConfig::STEREO)
            }
        }
    }

    /// Picks the format to publish among everything a node offered.
    ///
    /// Encoded passthrough formats are dropped, and plain formats are preferred
    /// over IEC958 PCM. Ties keep the node's own order.
    pub fn select(candidates: &[NodeAudioFormat]) -> Option<NodeAudioFormat> {
        let mut usable: Vec<NodeAudioFormat> =
            candidates.iter().copied().filter(|f| f.is_pcm()).collect();
        usable.sort_by_key(|f| f.is_passthrough());
        usable.first().copied()
    }
}

fn parse_sample_format(name: &str) -> Option<SampleFormat> {
    match name.to_ascii_uppercase().as_str() {
        "U8" => Some(SampleFormat::UInt8),
        "S16" | "S16LE" | "S16_LE" => Some(SampleFormat::Int16),
        "S32" | "S32LE" | "S32_LE" => Some(SampleFormat::Int32),
        "F32" | "F32LE" | "F32_LE" => Some(SampleFormat::Float),
        _ => None,
    }
}

fn parse_position(name: &str) -> ChannelPosition {
    match name.to_ascii_uppercase().as_str() {
        "MONO" | "FC" => ChannelPosition::FrontCenter,
        "FL" => ChannelPosition::FrontLeft,
        "FR" => ChannelPosition::FrontRight,
        "LFE" => ChannelPosition::LFE,
        "RL" => ChannelPosition::BackLeft,
        "RR" => ChannelPosition::BackRight,
        "FLC" => ChannelPosition::FrontLeftOfCenter,
        "FRC" => ChannelPosition::FrontRightOfCenter,
        "RC" => ChannelPosition::BackCenter,
        "SL" => ChannelPosition::SideLeft,
        "SR" => ChannelPosition::SideRight,
        "TC" => ChannelPosition::TopCenter,
        "TFL" => ChannelPosition::TopFrontLeft,
        "TFC" => ChannelPosition::TopFrontCenter,
        "TFR" => ChannelPosition::TopFrontRight,
        "TRL" => ChannelPosition::TopBackLeft,
        "TRC" => ChannelPosition::TopBackCenter,
        "TRR" => ChannelPosition::TopBackRight,
        "LFE2" => ChannelPosition::LFE2,
        "TSL" => ChannelPosition::TopSideLeft,
        "TSR" => ChannelPosition::TopSideRight,
        "BC" => ChannelPosition::BottomFrontCenter,
        "BLC" => ChannelPosition::BottomFrontLeft,
        "BRC" => ChannelPosition::BottomFrontRight,
        _ => ChannelPosition::Unknown,
    }
}

fn positive_u32(value: i64) -> Option<u32> {
    u32::try_from(value).ok().filter(|v| *v > 0)
}

fn parse_raw(payload: &NodeFormatPayload) -> Option<NodeAudioFormat> {
    let sample_format = parse_sample_format(&payload.format.as_ref()?.preferred())?;
    let sample_rate = positive_u32(payload.rate.as_ref()?.preferred())?;
    let channel_count = u16::try_from(payload.channels.as_ref()?.preferred())
        .ok()
        .filter(|c| *c > 0)?;

    let channel_config = match &payload.positions {
        Some(names) => {
            if names.len() != channel_count as usize {
                return None;
            }
            let positions: Vec<ChannelPosition> = names.iter().map(|n| parse_position(n)).collect();
            ChannelConfig::from_positions(&positions)
        }
        None => ChannelConfig::UNKNOWN,
    };

    Some(NodeAudioFormat::Raw {
        sample_format,
        sample_rate,
        channel_count,
        channel_config,
    })
}

fn parse_iec958(payload: &NodeFormatPayload) -> Option<NodeAudioFormat> {
    let codecs = payload.iec958_codec.as_ref()?.choices();
    let codec = if codecs.iter().any(|c| Iec958Codec::parse(c) == Iec958Codec::Pcm) {
        Iec958Codec::Pcm
    } else {
        Iec958Codec::parse(codecs.first()?)
    };
    let sample_rate = positive_u32(payload.rate.as_ref()?.preferred())?;
    Some(NodeAudioFormat::Iec958 { codec, sample_rate })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw_scalar() {
        let payload = NodeFormatPayload::raw("S16LE", 48000, 2).with_positions(&["FL", "FR"]);
        let format = NodeAudioFormat::parse(&payload).unwrap();
        assert_eq!(
            format.to_audio_format(),
            AudioFormat::new(SampleFormat::Int16, 48000, 2)
                .with_channel_config(ChannelConfig::STEREO)
        );
    }

    #[test]
    fn test_parse_range_and_enum_use_default() {
        let payload = NodeFormatPayload {
            rate: Some(PropValue::Range {
                default: 44100,
                min: 8000,
                max: 192000,
            }),
            format: Some(PropValue::Enum {
                default: "F32LE".into(),
                alternatives: vec!["S16LE".into(), "S32LE".into()],
            }),
            ..NodeFormatPayload::raw("S16LE", 1, 6)
        };
        let format = NodeAudioFormat::parse(&payload).unwrap().to_audio_format();
        assert_eq!(format.sample_rate(), 44100);
        assert_eq!(format.sample_format(), SampleFormat::Float);
        assert_eq!(format.channel_count(), 6);
    }

    #[test]
    fn test_malformed_payloads_have_no_format() {
        assert!(NodeAudioFormat::parse(&NodeFormatPayload::default()).is_none());
        assert!(NodeAudioFormat::parse(&NodeFormatPayload::raw("S24_32", 48000, 2)).is_none());
        assert!(NodeAudioFormat::parse(&NodeFormatPayload::raw("S16LE", -1, 2)).is_none());
        assert!(NodeAudioFormat::parse(&NodeFormatPayload::raw("S16LE", 48000, 0)).is_none());

        let mismatched = NodeFormatPayload::raw("S16LE", 48000, 2).with_positions(&["MONO"]);
        assert!(NodeAudioFormat::parse(&mismatched).is_none());

        let video = NodeFormatPayload {
            media_subtype: Some(MediaSubtype::Other("h264".into())),
            ..NodeFormatPayload::raw("S16LE", 48000, 2)
        };
        assert!(NodeAudioFormat::parse(&video).is_none());
    }

    #[test]
    fn test_iec958_pcm_is_forced_to_stereo() {
        let format = NodeAudioFormat::parse(&NodeFormatPayload::iec958("PCM", 48000)).unwrap();
        assert!(format.is_pcm());
        let audio = format.to_audio_format();
        assert_eq!(audio.channel_count(), 2);
        assert_eq!(audio.sample_format(), SampleFormat::Int16);
    }

    #[test]
    fn test_select_prefers_plain_pcm_and_drops_encoded() {
        let ac3 = NodeAudioFormat::parse(&NodeFormatPayload::iec958("AC3", 48000)).unwrap();
        let pcm_passthrough =
            NodeAudioFormat::parse(&NodeFormatPayload::iec958("PCM", 48000)).unwrap();
        let raw = NodeAudioFormat::parse(&NodeFormatPayload::raw("F32LE", 48000, 2)).unwrap();

        assert_eq!(NodeAudioFormat::select(&[ac3]), None);
        assert_eq!(NodeAudioFormat::select(&[ac3, pcm_passthrough]), Some(pcm_passthrough));
        assert_eq!(NodeAudioFormat::select(&[pcm_passthrough, ac3, raw]), Some(raw));
    }
}
