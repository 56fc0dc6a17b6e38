//! Periodic visual frame sampler
//!
//! Grabs an already-encoded JPEG on a fixed interval and hands it, base64
//! encoded, to the outbound channel.

use crate::device::DeviceError;
use crate::events::OutboundChannel;
use base64::Engine as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const FRAME_MIME: &str = "image/jpeg";

/// Source of JPEG frames (screen or camera).
pub trait FrameGrabber: Send + Sync {
    fn grab(&self) -> Result<Vec<u8>, DeviceError>;
}

/// Serves the same JPEG on every grab.
pub struct StillFrame(Vec<u8>);

impl StillFrame {
    pub fn new(jpeg: Vec<u8>) -> Self {
        Self(jpeg)
    }
}

impl FrameGrabber for StillFrame {
    fn grab(&self) -> Result<Vec<u8>, DeviceError> {
        if self.0.is_empty() {
            return Err(DeviceError::Unavailable("empty still frame".to_string()));
        }
        Ok(self.0.clone())
    }
}

/// Send one frame every `period` until the task is aborted.
///
/// The first frame goes out one period after spawning. A failed grab skips
/// that tick only.
pub fn spawn_sampler(
    grabber: Arc<dyn FrameGrabber>,
    outbound: Arc<dyn OutboundChannel>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Visual sampler started, one frame every {:?}", period);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sent = 0u64;

        loop {
            ticker.tick().await;
            match grabber.grab() {
                Ok(jpeg) => {
                    let encoded = base64::engine::general_purpose::STANDARD.encode(&jpeg);
                    outbound.send_image(encoded, FRAME_MIME);
                    sent += 1;
                    debug!("Visual frame {} sent ({} bytes)", sent, jpeg.len());
                }
                Err(e) => warn!("Frame grab failed: {}", e),
            }
        }
    })
}
