//! Buffer exchange loop
//!
//! [`BufferExchange::process`] runs once per producer `process` event:
//!
//! 1. Drain the queue. Every buffer but the newest goes straight back.
//! 2. Classify the newest: metadata only, DMA-BUF or memory.
//! 3. Hand the payload to the [`FrameConsumer`]. A failed import prunes the
//!    modifier and asks for renegotiation.
//! 4. Apply crop and cursor metadata, whatever happened in step 3.
//! 5. Return the buffer.
//!
//! Handles are moved into [`BufferQueue::enqueue`], so every dequeued buffer
//! is returned exactly once on every path.

use tracing::{debug, warn};

use crate::buffer::{BufferQueue, InflightBuffer};
use crate::catalog::ModifierTable;
use crate::consumer::{FrameConsumer, FrameOutcome};
use crate::crop::CropState;
use crate::error::ErrorType;
use crate::negotiator::{BufferTypes, FormatOffer, NegotiatedFormat, StreamNegotiator};
use crate::surface::DmaBufPlane;

/// DRM allows at most four planes per buffer
pub const MAX_DMABUF_PLANES: usize = 4;

const STATS_LOG_INTERVAL: u64 = 600;

/// Why a payload was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Negotiated format has no mapping for this consumer
    UnsupportedFormat,
    /// Buffer plane count differs from the negotiated format
    PlaneMismatch { expected: usize, actual: usize },
    /// Plane without fd or mapped data
    MissingData,
    /// DMA-BUF delivered although not negotiated
    UnexpectedDmaBuf,
    /// Consumer could not build its output
    ConsumerFailed,
}

impl DropReason {
    pub fn error_type(self) -> ErrorType {
        match self {
            Self::UnsupportedFormat => ErrorType::Format,
            Self::PlaneMismatch { .. } | Self::MissingData | Self::UnexpectedDmaBuf | Self::ConsumerFailed => {
                ErrorType::Buffer
            }
        }
    }
}

/// Result of one process cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Queue was empty
    Idle,
    /// Buffers returned, stream not negotiated yet
    NotNegotiated,
    /// Retained buffer only carried metadata
    MetadataOnly,
    /// Payload delivered to the consumer
    Delivered,
    /// Payload dropped, buffer returned
    Dropped(DropReason),
    /// Import failed; resubmit these offers on the same stream
    Renegotiate(Vec<FormatOffer>),
}

impl ProcessOutcome {
    /// Failure category, `None` when the cycle did not fail
    pub fn error_type(&self) -> Option<ErrorType> {
        match self {
            Self::Dropped(reason) => Some(reason.error_type()),
            Self::Renegotiate(_) => Some(ErrorType::Import),
            Self::Idle | Self::NotNegotiated | Self::MetadataOnly | Self::Delivered => None,
        }
    }
}

/// Exchange statistics
#[derive(Debug, Clone, Default)]
pub struct ExchangeStats {
    /// Retained buffers handled
    pub frames_processed: u64,
    /// Buffers returned unseen during drain
    pub superseded: u64,
    /// Retained buffers without payload
    pub metadata_only: u64,
    /// Payloads dropped
    pub dropped: u64,
    /// DMA-BUF imports that succeeded
    pub imported: u64,
    /// Memory payloads delivered
    pub uploaded: u64,
    /// DMA-BUF imports that failed
    pub import_failures: u64,
}

/// Per-stream exchange state
#[derive(Debug, Default)]
pub struct BufferExchange {
    crop: CropState,
    stats: ExchangeStats,
    warned_format: Option<u32>,
}

impl BufferExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn crop(&self) -> &CropState {
        &self.crop
    }

    pub fn stats(&self) -> &ExchangeStats {
        &self.stats
    }

    /// Forget per-format state after a new format was committed
    pub fn on_format_changed(&mut self) {
        self.crop.clear();
        self.warned_format = None;
    }

    /// Run one process cycle
    pub fn process<Q, C>(
        &mut self,
        queue: &mut Q,
        consumer: &mut C,
        negotiator: &mut StreamNegotiator,
        catalog: &mut ModifierTable,
    ) -> ProcessOutcome
    where
        Q: BufferQueue,
        C: FrameConsumer,
    {
        let Some(mut latest) = queue.dequeue() else {
            debug!("Out of buffers");
            return ProcessOutcome::Idle;
        };

        while let Some(next) = queue.dequeue() {
            queue.enqueue(latest);
            latest = next;
            self.stats.superseded += 1;
        }

        let outcome = {
            let buffer = queue.describe(&latest);
            self.handle(&buffer, consumer, negotiator, catalog)
        };
        queue.enqueue(latest);

        self.stats.frames_processed += 1;
        if self.stats.frames_processed % STATS_LOG_INTERVAL == 0 {
            debug!("Exchange stats: {:?}", self.stats);
        }

        outcome
    }

    fn handle<C: FrameConsumer>(
        &mut self,
        buffer: &InflightBuffer<'_>,
        consumer: &mut C,
        negotiator: &mut StreamNegotiator,
        catalog: &mut ModifierTable,
    ) -> ProcessOutcome {
        let Some(format) = negotiator.format().copied().filter(|_| negotiator.is_negotiated()) else {
            return ProcessOutcome::NotNegotiated;
        };

        let outcome = if !buffer.has_payload() {
            self.stats.metadata_only += 1;
            ProcessOutcome::MetadataOnly
        } else if buffer.is_dmabuf() {
            self.import(buffer, &format, consumer, negotiator, catalog)
        } else {
            self.upload(buffer, &format, consumer)
        };

        if let Some(region) = buffer.crop.filter(|r| r.is_well_formed()) {
            debug!("Crop region {:?}", region);
        }
        self.crop.apply(buffer.crop);
        consumer.update_cursor(buffer.cursor.as_ref());

        if let ProcessOutcome::Dropped(reason) = outcome {
            self.stats.dropped += 1;
            self.log_drop(reason, &format);
        }
        outcome
    }

    fn import<C: FrameConsumer>(
        &mut self,
        buffer: &InflightBuffer<'_>,
        format: &NegotiatedFormat,
        consumer: &mut C,
        negotiator: &mut StreamNegotiator,
        catalog: &mut ModifierTable,
    ) -> ProcessOutcome {
        if !format.buffer_types.contains(BufferTypes::DMA_BUF) {
            return ProcessOutcome::Dropped(DropReason::UnexpectedDmaBuf);
        }

        let actual = buffer.planes.len();
        let expected = format.expected_planes();
        if actual < expected || actual > MAX_DMABUF_PLANES {
            return ProcessOutcome::Dropped(DropReason::PlaneMismatch { expected, actual });
        }

        let planes: Option<Vec<DmaBufPlane>> = buffer
            .planes
            .iter()
            .map(|p| p.fd.map(|fd| DmaBufPlane { fd, offset: p.offset, stride: p.stride }))
            .collect();
        let Some(planes) = planes else {
            return ProcessOutcome::Dropped(DropReason::MissingData);
        };

        match consumer.import_dmabuf(format, &planes) {
            FrameOutcome::Delivered => {
                self.stats.imported += 1;
                ProcessOutcome::Delivered
            }
            FrameOutcome::ImportFailed => {
                self.stats.import_failures += 1;
                match (format.pixel_format, format.modifier) {
                    (Some(pixel_format), Some(modifier)) => {
                        warn!(
                            "DMA-BUF import failed for {} modifier {:#x}, renegotiating",
                            pixel_format, modifier
                        );
                        catalog.prune(pixel_format, modifier);
                        ProcessOutcome::Renegotiate(negotiator.request_renegotiation(catalog))
                    }
                    _ => ProcessOutcome::Dropped(DropReason::ConsumerFailed),
                }
            }
            FrameOutcome::Unsupported => ProcessOutcome::Dropped(DropReason::UnsupportedFormat),
            FrameOutcome::Dropped => ProcessOutcome::Dropped(DropReason::ConsumerFailed),
        }
    }

    fn upload<C: FrameConsumer>(
        &mut self,
        buffer: &InflightBuffer<'_>,
        format: &NegotiatedFormat,
        consumer: &mut C,
    ) -> ProcessOutcome {
        let actual = buffer.planes.len();
        let expected = format.expected_planes();
        if actual != expected {
            return ProcessOutcome::Dropped(DropReason::PlaneMismatch { expected, actual });
        }

        if buffer.planes[0].data.is_none() {
            return ProcessOutcome::Dropped(DropReason::MissingData);
        }

        match consumer.upload_memory(format, &buffer.planes) {
            FrameOutcome::Delivered => {
                self.stats.uploaded += 1;
                ProcessOutcome::Delivered
            }
            FrameOutcome::Unsupported => ProcessOutcome::Dropped(DropReason::UnsupportedFormat),
            FrameOutcome::ImportFailed | FrameOutcome::Dropped => ProcessOutcome::Dropped(DropReason::ConsumerFailed),
        }
    }

    fn log_drop(&mut self, reason: DropReason, format: &NegotiatedFormat) {
        match reason {
            DropReason::UnsupportedFormat => {
                if self.warned_format != Some(format.spa_format) {
                    self.warned_format = Some(format.spa_format);
                    warn!("Unsupported buffer format {}, dropping frames", format.spa_format);
                }
            }
            DropReason::PlaneMismatch { expected, actual } => {
                warn!("Plane mismatch: expected {}, got {}, dropping frame", expected, actual);
            }
            other => debug!("Dropped frame: {:?} ({:?})", other, other.error_type()),
        }
    }
}
