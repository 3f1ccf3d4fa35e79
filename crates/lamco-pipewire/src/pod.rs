//! Param pod serialization
//!
//! Proposals and counter updates are serialized with libspa's
//! [`PodSerializer`] into a [`ParamBuffer`]. The buffer grows as needed but
//! refuses to exceed its byte limit, so a catalog with an unusually large
//! modifier list fails with [`PipeWireError::ParamOverflow`] instead of
//! being cut short.

use libspa::param::format::{FormatProperties, MediaSubtype, MediaType};
use libspa::param::ParamType;
use libspa::pod::serialize::PodSerializer;
use libspa::pod::{ChoiceValue, Object, Pod, Property, PropertyFlags, Value};
use libspa::utils::{Choice, ChoiceEnum, ChoiceFlags, Fraction, Id, Rectangle, SpaTypes};
use std::io::Cursor;
use tracing::debug;

use crate::error::{PipeWireError, Result};
use crate::negotiator::{CounterUpdate, FormatOffer};

/// Upper bound for all pods of one `connect`/`update_params` call
pub const MAX_PARAM_BYTES: usize = 64 * 1024;

/// SPA_POD_PROP_FLAG_MANDATORY | SPA_POD_PROP_FLAG_DONT_FIXATE
const MODIFIER_PROP_FLAGS: u32 = (1 << 3) | (1 << 4);

/// Serialized param pods with a size limit
#[derive(Debug, Clone)]
pub struct ParamBuffer {
    pods: Vec<Vec<u8>>,
    used: usize,
    limit: usize,
}

impl Default for ParamBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_PARAM_BYTES)
    }
}

impl ParamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self { pods: Vec::new(), used: 0, limit }
    }

    /// Serialize and append one pod
    ///
    /// On overflow nothing is appended.
    pub fn push(&mut self, value: &Value) -> Result<()> {
        let (cursor, _) = PodSerializer::serialize(Cursor::new(Vec::new()), value)
            .map_err(|e| PipeWireError::PodSerialization(format!("{e:?}")))?;
        let bytes = cursor.into_inner();

        let needed = self.used + bytes.len();
        if needed > self.limit {
            return Err(PipeWireError::ParamOverflow { needed, limit: self.limit });
        }

        self.used = needed;
        self.pods.push(bytes);
        Ok(())
    }

    /// Pod views for `Stream::connect` and `Stream::update_params`
    pub fn pods(&self) -> Vec<&Pod> {
        self.pods.iter().filter_map(|bytes| Pod::from_bytes(bytes)).collect()
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    pub fn bytes_used(&self) -> usize {
        self.used
    }
}

/// `EnumFormat` object for one offer
pub fn format_offer_value(offer: &FormatOffer) -> Value {
    let geometry = &offer.geometry;
    let mut properties = vec![
        Property {
            key: FormatProperties::MediaType.as_raw(),
            flags: PropertyFlags::empty(),
            value: Value::Id(Id(MediaType::Video.as_raw())),
        },
        Property {
            key: FormatProperties::MediaSubtype.as_raw(),
            flags: PropertyFlags::empty(),
            value: Value::Id(Id(MediaSubtype::Raw.as_raw())),
        },
        Property {
            key: FormatProperties::VideoFormat.as_raw(),
            flags: PropertyFlags::empty(),
            value: Value::Id(Id(offer.format.to_spa().as_raw())),
        },
    ];

    if let Some(&first) = offer.modifiers.first() {
        properties.push(Property {
            key: FormatProperties::VideoModifier.as_raw(),
            flags: PropertyFlags::from_bits_retain(MODIFIER_PROP_FLAGS),
            value: Value::Choice(ChoiceValue::Long(Choice(
                ChoiceFlags::empty(),
                ChoiceEnum::Enum {
                    default: first as i64,
                    alternatives: offer.modifiers.iter().map(|&m| m as i64).collect(),
                },
            ))),
        });
    }

    properties.push(Property {
        key: FormatProperties::VideoSize.as_raw(),
        flags: PropertyFlags::empty(),
        value: Value::Choice(ChoiceValue::Rectangle(Choice(
            ChoiceFlags::empty(),
            ChoiceEnum::Range {
                default: rectangle(geometry.target),
                min: rectangle(geometry.min),
                max: rectangle(geometry.max),
            },
        ))),
    });

    properties.push(Property {
        key: FormatProperties::VideoFramerate.as_raw(),
        flags: PropertyFlags::empty(),
        value: Value::Choice(ChoiceValue::Fraction(Choice(
            ChoiceFlags::empty(),
            ChoiceEnum::Range {
                default: fraction(geometry.framerate),
                min: Fraction { num: 0, denom: 1 },
                max: fraction(geometry.max_framerate),
            },
        ))),
    });

    Value::Object(Object {
        type_: SpaTypes::ObjectParamFormat.as_raw(),
        id: ParamType::EnumFormat.as_raw(),
        properties,
    })
}

/// Serialize a full proposal, in offer order
pub fn proposal_params(offers: &[FormatOffer]) -> Result<ParamBuffer> {
    let mut params = ParamBuffer::new();
    for offer in offers {
        params.push(&format_offer_value(offer))?;
    }

    debug!("Proposal: {} offers, {} bytes", params.len(), params.bytes_used());
    Ok(params)
}

/// Serialize the metas and buffer types sent after a format event
pub fn counter_params(update: &CounterUpdate) -> Result<ParamBuffer> {
    let mut params = ParamBuffer::new();

    params.push(&meta_value(
        libspa_sys::SPA_META_VideoCrop,
        Value::Int(update.crop_meta_size as i32),
    ))?;

    let (default, min, max) = update.cursor_meta_size;
    params.push(&meta_value(
        libspa_sys::SPA_META_Cursor,
        Value::Choice(ChoiceValue::Int(Choice(
            ChoiceFlags::empty(),
            ChoiceEnum::Range { default: default as i32, min: min as i32, max: max as i32 },
        ))),
    ))?;

    params.push(&Value::Object(Object {
        type_: SpaTypes::ObjectParamBuffers.as_raw(),
        id: ParamType::Buffers.as_raw(),
        properties: vec![Property {
            key: libspa_sys::SPA_PARAM_BUFFERS_dataType,
            flags: PropertyFlags::empty(),
            value: Value::Choice(ChoiceValue::Int(Choice(
                ChoiceFlags::empty(),
                ChoiceEnum::Flags { default: update.buffer_types.bits() as i32, flags: Vec::new() },
            ))),
        }],
    }))?;

    params.push(&meta_value(
        libspa_sys::SPA_META_Header,
        Value::Int(update.header_meta_size as i32),
    ))?;

    Ok(params)
}

fn meta_value(meta_type: u32, size: Value) -> Value {
    Value::Object(Object {
        type_: SpaTypes::ObjectParamMeta.as_raw(),
        id: ParamType::Meta.as_raw(),
        properties: vec![
            Property {
                key: libspa_sys::SPA_PARAM_META_type,
                flags: PropertyFlags::empty(),
                value: Value::Id(Id(meta_type)),
            },
            Property {
                key: libspa_sys::SPA_PARAM_META_size,
                flags: PropertyFlags::empty(),
                value: size,
            },
        ],
    })
}

fn rectangle((width, height): (u32, u32)) -> Rectangle {
    Rectangle { width, height }
}

fn fraction((num, denom): (u32, u32)) -> Fraction {
    Fraction { num, denom }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModifierTable;
    use crate::format::{PixelFormat, DRM_FORMAT_MOD_INVALID};
    use crate::negotiator::{build_proposal, StreamNegotiator, VideoGeometry};
    use libspa::param::format_utils;
    use libspa::param::video::VideoFormat;

    fn offer(modifiers: Vec<u64>) -> FormatOffer {
        FormatOffer { format: PixelFormat::BGRx, modifiers, geometry: VideoGeometry::default() }
    }

    #[test]
    fn test_format_pod_is_raw_video() {
        let mut params = ParamBuffer::new();
        params.push(&format_offer_value(&offer(vec![0x100, DRM_FORMAT_MOD_INVALID]))).unwrap();

        let pods = params.pods();
        assert_eq!(pods.len(), 1);
        let (media_type, media_subtype) = format_utils::parse_format(pods[0]).unwrap();
        assert_eq!(media_type, MediaType::Video);
        assert_eq!(media_subtype, MediaSubtype::Raw);
    }

    #[test]
    fn test_modifier_offer_is_larger() {
        let mut with = ParamBuffer::new();
        with.push(&format_offer_value(&offer(vec![0x100, 0x200]))).unwrap();

        let mut without = ParamBuffer::new();
        without.push(&format_offer_value(&offer(Vec::new()))).unwrap();

        assert!(with.bytes_used() > without.bytes_used());
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut params = ParamBuffer::with_limit(64);
        let err = params.push(&format_offer_value(&offer(vec![1, 2, 3, 4]))).unwrap_err();

        assert!(matches!(err, PipeWireError::ParamOverflow { limit: 64, .. }));
        assert!(params.is_empty());
        assert_eq!(params.bytes_used(), 0);
    }

    #[test]
    fn test_proposal_params() {
        let table = ModifierTable::for_raw_frames();
        let offers = build_proposal(&table, &VideoGeometry::default());
        let params = proposal_params(&offers).unwrap();

        assert_eq!(params.len(), 2);
        assert_eq!(params.pods().len(), 2);
    }

    #[test]
    fn test_counter_params() {
        let mut negotiator = StreamNegotiator::new(VideoGeometry::default(), true);
        let event = crate::negotiator::FormatEvent::raw_video(VideoFormat::BGRx, 640, 480);
        let update = negotiator.on_format_event(&event).unwrap();

        let params = counter_params(&update).unwrap();
        assert_eq!(params.len(), 4);
    }
}
