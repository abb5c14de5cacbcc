//! Frame delivery to an external message bus.
//!
//! A [`FrameStreamer`] walks a completed dataset, encodes each day through a
//! [`FrameSerializer`] and sends the bytes to a named topic on an injected
//! [`MessageBus`]. Send failures are retried a bounded number of times; a
//! failed flush triggers exactly one re-send, so a consumer may see a frame
//! twice but never loses one.

use crate::io::reader::{Frame, FrameStore};
use crate::types::{CancelToken, DayFrame, GapfillError, GapfillResult, Reflectance};
use chrono::NaiveDate;
use serde::Serialize;
use std::time::Duration;

/// One published frame: the calendar date, a compact summary and the full
/// reconstructed grid.
#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
    pub date: NaiveDate,
    /// Mean and population standard deviation over the finite frame values
    pub data: [Reflectance; 2],
    /// Row x col x band
    pub full_data: DayFrame,
}

impl FrameRecord {
    pub fn from_frame(frame: &Frame) -> Self {
        let summary = frame.summary();
        Self {
            date: frame.date,
            data: [summary.mean, summary.stddev],
            full_data: frame.data.clone(),
        }
    }
}

/// Encodes one record into the byte payload a bus consumer expects.
pub trait FrameSerializer {
    fn serialize(&self, record: &FrameRecord) -> GapfillResult<Vec<u8>>;
}

/// JSON wire encoding of [`FrameRecord`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFrameSerializer;

impl FrameSerializer for JsonFrameSerializer {
    fn serialize(&self, record: &FrameRecord) -> GapfillResult<Vec<u8>> {
        serde_json::to_vec(record)
            .map_err(|err| GapfillError::Processing(format!("frame encoding failed: {}", err)))
    }
}

/// Transport for encoded frames (message queue, socket, file tap).
pub trait MessageBus {
    /// Hand one payload to a topic. May fail transiently.
    fn send(&mut self, topic: &str, payload: &[u8]) -> GapfillResult<()>;

    /// Force delivery of everything previously sent.
    fn flush(&mut self) -> GapfillResult<()>;
}

/// Delivery tuning for [`FrameStreamer`].
#[derive(Debug, Clone)]
pub struct StreamerParams {
    /// Topic the frames are published under
    pub topic: String,
    /// Flush the bus after every frame
    pub flush_each: bool,
    /// Pause between consecutive frames
    pub throttle: Duration,
    /// Send attempts per frame before giving up (>= 1)
    pub max_send_attempts: u32,
}

impl Default for StreamerParams {
    fn default() -> Self {
        Self {
            topic: "PerceptiveSentinel".to_string(),
            flush_each: true,
            throttle: Duration::ZERO,
            max_send_attempts: 3,
        }
    }
}

/// Streams the frames of one reconstruction variant in day order.
pub struct FrameStreamer<B, S = JsonFrameSerializer> {
    bus: B,
    serializer: S,
    params: StreamerParams,
}

impl<B: MessageBus> FrameStreamer<B> {
    pub fn new(bus: B) -> Self {
        Self::with_params(bus, StreamerParams::default())
    }

    pub fn with_params(bus: B, params: StreamerParams) -> Self {
        Self::with_serializer(bus, JsonFrameSerializer, params)
    }
}

impl<B: MessageBus, S: FrameSerializer> FrameStreamer<B, S> {
    /// Swap the wire encoding, e.g. for a consumer that expects a binary
    /// format.
    pub fn with_serializer(bus: B, serializer: S, params: StreamerParams) -> Self {
        Self {
            bus,
            serializer,
            params,
        }
    }

    /// Recover the bus, e.g. to inspect a recording transport.
    pub fn into_inner(self) -> B {
        self.bus
    }

    /// Publish every frame from `start` onward, then flush the bus once more
    /// so nothing stays buffered. Returns the number of frames delivered.
    /// Resuming an interrupted stream is a matter of passing the next
    /// undelivered index.
    pub fn stream(
        &mut self,
        reader: &FrameStore,
        start: usize,
        cancel: &CancelToken,
    ) -> GapfillResult<usize> {
        log::info!(
            "Streaming {} frame(s) of the {} variant to `{}` starting at day {}",
            reader.len().saturating_sub(start),
            reader.variant(),
            self.params.topic,
            start
        );
        let mut delivered = 0usize;
        for frame in reader.iter_from(start) {
            cancel.check("streaming")?;
            let frame = frame?;
            self.deliver(&frame)?;
            delivered += 1;
            if !self.params.throttle.is_zero() {
                std::thread::sleep(self.params.throttle);
            }
        }
        self.bus.flush().map_err(|err| GapfillError::Delivery {
            day: reader.len().saturating_sub(1),
            attempts: 1,
            detail: format!("final flush failed: {}", err),
        })?;
        log::info!("Delivered {} frame(s)", delivered);
        Ok(delivered)
    }

    fn deliver(&mut self, frame: &Frame) -> GapfillResult<()> {
        let record = FrameRecord::from_frame(frame);
        let payload = self.serializer.serialize(&record)?;
        self.send_with_retry(&payload, frame.index)?;
        log::debug!(
            "Sent day {} ({}): mean {:.4}, stddev {:.4}",
            frame.index,
            record.date,
            record.data[0],
            record.data[1]
        );
        if !self.params.flush_each {
            return Ok(());
        }
        if let Err(err) = self.bus.flush() {
            // At most one re-send per frame: a duplicate is acceptable, a
            // silently dropped frame is not.
            log::warn!(
                "Flush failed for day {}: {}; re-sending once",
                frame.index,
                err
            );
            self.send_with_retry(&payload, frame.index)?;
            self.bus.flush().map_err(|err| GapfillError::Delivery {
                day: frame.index,
                attempts: 2,
                detail: format!("flush failed twice: {}", err),
            })?;
        }
        Ok(())
    }

    fn send_with_retry(&mut self, payload: &[u8], day: usize) -> GapfillResult<()> {
        let max = self.params.max_send_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.bus.send(&self.params.topic, payload) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < max => {
                    log::warn!(
                        "Send attempt {}/{} for day {} failed: {}",
                        attempt,
                        max,
                        day,
                        err
                    );
                }
                Err(err) => {
                    return Err(GapfillError::Delivery {
                        day,
                        attempts: attempt,
                        detail: err.to_string(),
                    });
                }
            }
        }
    }
}
