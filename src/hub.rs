//! Live-viewer fan-out.
//!
//! The capture thread publishes every frame to the hub; each viewer owns an
//! independent bounded channel. Publishing never blocks: a viewer whose
//! channel is full loses its own oldest buffered frame, so one stalled
//! viewer cannot delay capture, recording, or any other viewer.
//!
//! A subscription yields frames until the hub closes (pipeline shutdown or
//! capture failure) or the viewer drops its stream, which unsubscribes it.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::frame::Frame;

/// Per-viewer buffer depth. Small on purpose: a viewer that falls this far
/// behind is served the freshest frames, not a growing backlog.
pub const VIEWER_CHANNEL_DEPTH: usize = 8;

struct Viewer {
    tx: Sender<Frame>,
    // Kept so `publish` can pop the oldest frame when the channel is full.
    rx: Receiver<Frame>,
}

#[derive(Default)]
struct HubInner {
    viewers: HashMap<u64, Viewer>,
    next_id: u64,
    closed: bool,
    frames_dropped: u64,
}

/// Fan-out point between the capture thread and live viewers.
#[derive(Default)]
pub struct FrameHub {
    inner: Mutex<HubInner>,
}

impl FrameHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new viewer. On a closed hub the returned stream yields no
    /// frames and ends immediately.
    pub fn subscribe(self: &Arc<Self>) -> FrameStream {
        let (tx, rx) = bounded(VIEWER_CHANNEL_DEPTH);
        let id = {
            let Ok(mut inner) = self.inner.lock() else {
                return FrameStream {
                    id: 0,
                    rx,
                    hub: Arc::clone(self),
                };
            };
            if inner.closed {
                // Drop the sender so the stream's first recv disconnects.
                drop(tx);
                return FrameStream {
                    id: 0,
                    rx,
                    hub: Arc::clone(self),
                };
            }
            inner.next_id += 1;
            let id = inner.next_id;
            inner.viewers.insert(
                id,
                Viewer {
                    tx,
                    rx: rx.clone(),
                },
            );
            id
        };
        log::debug!("hub: viewer {} subscribed", id);
        FrameStream {
            id,
            rx,
            hub: Arc::clone(self),
        }
    }

    /// Deliver one frame to every registered viewer without blocking. A full
    /// viewer channel drops that viewer's oldest buffered frame and retries
    /// once; if it is still full the new frame is dropped for that viewer.
    pub fn publish(&self, frame: &Frame) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.closed {
            return;
        }
        let mut dropped = 0u64;
        let mut gone = Vec::new();
        for (id, viewer) in &inner.viewers {
            match viewer.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(frame)) => {
                    let _ = viewer.rx.try_recv();
                    dropped += 1;
                    if viewer.tx.try_send(frame).is_err() {
                        // Disconnected mid-retry; reaped below.
                        gone.push(*id);
                    }
                }
                Err(TrySendError::Disconnected(_)) => gone.push(*id),
            }
        }
        inner.frames_dropped += dropped;
        for id in gone {
            inner.viewers.remove(&id);
        }
    }

    fn unsubscribe(&self, id: u64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.viewers.remove(&id).is_some() {
            log::debug!("hub: viewer {} unsubscribed", id);
        }
    }

    /// Tear down every subscription. Streams end after draining what their
    /// channels already hold. Idempotent.
    pub fn close(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if !inner.closed {
            inner.closed = true;
            inner.viewers.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|inner| inner.closed).unwrap_or(true)
    }

    pub fn viewer_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.viewers.len())
            .unwrap_or(0)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.inner
            .lock()
            .map(|inner| inner.frames_dropped)
            .unwrap_or(0)
    }
}

/// One viewer's lazy, non-restartable frame sequence. Iteration blocks until
/// the next frame and ends when the hub closes. Dropping the stream
/// unsubscribes the viewer.
pub struct FrameStream {
    id: u64,
    rx: Receiver<Frame>,
    hub: Arc<FrameHub>,
}

impl FrameStream {
    /// Non-blocking variant of `next` for callers that poll.
    pub fn try_next(&self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next frame.
    pub fn next_timeout(&self, timeout: std::time::Duration) -> Option<Frame> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Iterator for FrameStream {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.rx.recv().ok()
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> Frame {
        Frame::new(vec![0xFF, 0xD8, tag, 0xFF, 0xD9])
    }

    #[test]
    fn every_viewer_receives_published_frames() {
        let hub = FrameHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.viewer_count(), 2);

        hub.publish(&frame(1));
        hub.publish(&frame(2));

        assert_eq!(a.next().unwrap().jpeg()[2], 1);
        assert_eq!(a.next().unwrap().jpeg()[2], 2);
        assert_eq!(b.next().unwrap().jpeg()[2], 1);
        assert_eq!(b.next().unwrap().jpeg()[2], 2);
    }

    #[test]
    fn saturated_viewer_loses_only_its_oldest_frames() {
        let hub = FrameHub::new();
        let stalled = hub.subscribe();
        let mut live = hub.subscribe();

        for i in 0..(VIEWER_CHANNEL_DEPTH as u8 + 4) {
            hub.publish(&frame(i));
            // The live viewer keeps up.
            assert_eq!(live.next().unwrap().jpeg()[2], i);
        }
        assert!(hub.frames_dropped() >= 4);

        // The stalled viewer's buffer holds the newest frames, not the oldest.
        let first = stalled.try_next().expect("buffered frame");
        assert_eq!(first.jpeg()[2], 4);
    }

    #[test]
    fn dropping_a_stream_unsubscribes_it() {
        let hub = FrameHub::new();
        let stream = hub.subscribe();
        assert_eq!(hub.viewer_count(), 1);
        drop(stream);
        assert_eq!(hub.viewer_count(), 0);
    }

    #[test]
    fn close_ends_streams_and_rejects_new_subscribers() {
        let hub = FrameHub::new();
        let mut stream = hub.subscribe();
        hub.close();
        assert!(stream.next().is_none());

        let mut late = hub.subscribe();
        assert!(late.next().is_none());
        hub.publish(&frame(9));
        assert_eq!(hub.frames_dropped(), 0);
    }
}
