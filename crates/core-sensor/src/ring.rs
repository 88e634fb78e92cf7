//! Double-buffered frame handoff between a sensor callback and one
//! worker thread.
//!
//! Two fixed-size buffers circulate between an "empty" and a "full"
//! bounded channel. The producer (the sensor callback) takes an empty
//! buffer, copies the frame in, and posts it full; the consumer leases
//! the full buffer and recycles it on drop. Exactly one producer and
//! one consumer touch a ring.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::trace;

/// A filled buffer plus the sensor timestamp it arrived with.
pub struct Frame {
    data: Box<[u8]>,
    timestamp: u32,
}

pub(crate) enum Slot {
    Frame(Frame),
    /// Unblocks a waiting consumer during shutdown.
    Stop,
}

pub struct FrameRing;

impl FrameRing {
    /// Build a ring of two `frame_len` buffers. `producer_timeout` is
    /// how long the producer may wait for a free buffer before dropping
    /// the frame (`None` waits indefinitely).
    pub fn pair(
        frame_len: usize,
        producer_timeout: Option<Duration>,
    ) -> (FrameProducer, FrameConsumer) {
        let (empty_tx, empty_rx) = bounded::<Box<[u8]>>(2);
        // One extra slot so the shutdown sentinel always fits even with
        // both buffers queued full.
        let (full_tx, full_rx) = bounded::<Slot>(3);
        for _ in 0..2 {
            empty_tx
                .send(vec![0u8; frame_len].into_boxed_slice())
                .expect("seed ring buffers");
        }
        (
            FrameProducer {
                empty_rx,
                full_tx: full_tx.clone(),
                timeout: producer_timeout,
                busy: Arc::new(AtomicU64::new(0)),
                frame_len,
            },
            FrameConsumer {
                full_rx,
                full_tx,
                empty_tx,
            },
        )
    }
}

pub struct FrameProducer {
    empty_rx: Receiver<Box<[u8]>>,
    full_tx: Sender<Slot>,
    timeout: Option<Duration>,
    busy: Arc<AtomicU64>,
    frame_len: usize,
}

impl FrameProducer {
    /// Copy a frame into the ring. Returns `false` when the frame was
    /// dropped (consumer busy, or ring shut down).
    pub fn offer(&self, data: &[u8], timestamp: u32) -> bool {
        debug_assert_eq!(data.len(), self.frame_len);
        let mut buf = match self.timeout {
            Some(t) => match self.empty_rx.recv_timeout(t) {
                Ok(buf) => buf,
                Err(RecvTimeoutError::Timeout) => {
                    self.busy.fetch_add(1, Relaxed);
                    trace!(target: "sensor.ring", "frame_dropped_busy");
                    return false;
                }
                Err(RecvTimeoutError::Disconnected) => return false,
            },
            None => match self.empty_rx.recv() {
                Ok(buf) => buf,
                Err(_) => return false,
            },
        };
        buf.copy_from_slice(data);
        self.full_tx.send(Slot::Frame(Frame { data: buf, timestamp })).is_ok()
    }

    /// Frames dropped because no buffer freed up in time.
    pub fn busy_count(&self) -> u64 {
        self.busy.load(Relaxed)
    }

    /// Shareable handle onto the busy counter.
    pub fn busy_handle(&self) -> Arc<AtomicU64> {
        self.busy.clone()
    }
}

pub struct FrameConsumer {
    full_rx: Receiver<Slot>,
    full_tx: Sender<Slot>,
    empty_tx: Sender<Box<[u8]>>,
}

impl FrameConsumer {
    /// Block until the next frame. `None` means shutdown.
    pub fn recv(&self) -> Option<FrameLease<'_>> {
        match self.full_rx.recv() {
            Ok(Slot::Frame(frame)) => Some(FrameLease {
                frame: Some(frame),
                ring: self,
            }),
            Ok(Slot::Stop) | Err(_) => None,
        }
    }

    /// Handle that can wake a blocked [`recv`](Self::recv) for shutdown.
    pub fn stop_handle(&self) -> RingStop {
        RingStop {
            full_tx: self.full_tx.clone(),
        }
    }
}

/// Posts the shutdown sentinel into the full channel.
pub struct RingStop {
    full_tx: Sender<Slot>,
}

impl RingStop {
    pub fn post(&self) {
        let _ = self.full_tx.try_send(Slot::Stop);
    }
}

/// Borrowed view of a full buffer; recycles it back into the ring on
/// drop.
pub struct FrameLease<'a> {
    frame: Option<Frame>,
    ring: &'a FrameConsumer,
}

impl FrameLease<'_> {
    pub fn timestamp(&self) -> u32 {
        self.frame.as_ref().map(|f| f.timestamp).unwrap_or(0)
    }
}

impl std::ops::Deref for FrameLease<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.frame
            .as_ref()
            .map(|f| &*f.data)
            .unwrap_or(&[])
    }
}

impl Drop for FrameLease<'_> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            let _ = self.ring.empty_tx.try_send(frame.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn frames_flow_producer_to_consumer() {
        let (producer, consumer) = FrameRing::pair(8, Some(Duration::from_millis(1)));
        assert!(producer.offer(&[1u8; 8], 42));
        let lease = consumer.recv().expect("frame");
        assert_eq!(&lease[..], &[1u8; 8]);
        assert_eq!(lease.timestamp(), 42);
        drop(lease);
        // Buffer recycled; the ring accepts more frames.
        assert!(producer.offer(&[2u8; 8], 43));
        assert_eq!(&consumer.recv().expect("frame")[..], &[2u8; 8]);
    }

    #[test]
    fn producer_drops_when_both_buffers_held() {
        let (producer, consumer) = FrameRing::pair(4, Some(Duration::from_millis(1)));
        assert!(producer.offer(&[1u8; 4], 0));
        assert!(producer.offer(&[2u8; 4], 1));
        // Both buffers in flight and unreturned: the producer must give
        // up within its timeout and count the drop.
        assert!(!producer.offer(&[3u8; 4], 2));
        assert_eq!(producer.busy_count(), 1);
        // Consuming frees a slot again.
        drop(consumer.recv().expect("frame"));
        assert!(producer.offer(&[4u8; 4], 3));
        assert_eq!(producer.busy_count(), 1);
    }

    #[test]
    fn stop_sentinel_wakes_consumer() {
        let (_producer, consumer) = FrameRing::pair(4, None);
        let stop = consumer.stop_handle();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            stop.post();
        });
        assert!(consumer.recv().is_none());
        t.join().unwrap();
    }

    #[test]
    fn untimed_producer_waits_for_recycle() {
        let (producer, consumer) = FrameRing::pair(4, None);
        assert!(producer.offer(&[1u8; 4], 0));
        assert!(producer.offer(&[2u8; 4], 1));
        let waiter = std::thread::spawn(move || producer.offer(&[3u8; 4], 2));
        std::thread::sleep(Duration::from_millis(20));
        drop(consumer.recv().expect("frame"));
        assert!(waiter.join().unwrap());
    }
}
