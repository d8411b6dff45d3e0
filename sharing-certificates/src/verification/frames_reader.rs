use prost::Message;
use sharing_common::{log_debug, log_warn, Logger};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::connection::FrameConnection;
use crate::proto::{Frame, FrameVersion, V1Frame, V1FrameType};

/// Decodes frames off a [`FrameConnection`] and hands them out by type.
///
/// Frames that arrive ahead of the one being waited for are buffered and
/// served to a later [`read_frame`](Self::read_frame) for their type.
pub struct IncomingFramesReader {
    connection: Arc<dyn FrameConnection>,
    buffered: Mutex<VecDeque<V1Frame>>,
    logger: Arc<Logger>,
}

impl IncomingFramesReader {
    pub fn new(connection: Arc<dyn FrameConnection>, logger: Arc<Logger>) -> Self {
        Self {
            connection,
            buffered: Mutex::new(VecDeque::new()),
            logger,
        }
    }

    /// First frame of `frame_type`, or `None` on timeout, a closed
    /// connection or an undecodable frame.
    pub async fn read_frame(&self, frame_type: V1FrameType, timeout: Duration) -> Option<V1Frame> {
        let mut buffered = self.buffered.lock().await;
        if let Some(position) = buffered.iter().position(|f| f.frame_type() == frame_type) {
            return buffered.remove(position);
        }

        match tokio::time::timeout(timeout, self.read_until(frame_type, &mut buffered)).await {
            Ok(frame) => frame,
            Err(_) => {
                log_warn!(
                    self.logger,
                    "Timed out after {:?} waiting for {:?} frame",
                    timeout,
                    frame_type
                );
                None
            }
        }
    }

    async fn read_until(
        &self,
        frame_type: V1FrameType,
        buffered: &mut VecDeque<V1Frame>,
    ) -> Option<V1Frame> {
        loop {
            let Some(bytes) = self.connection.read().await else {
                log_warn!(self.logger, "Connection closed waiting for {:?} frame", frame_type);
                return None;
            };
            let frame = match decode_v1(&bytes) {
                Some(frame) => frame,
                None => {
                    log_warn!(self.logger, "Dropping connection on malformed frame");
                    return None;
                }
            };
            if frame.frame_type() == frame_type {
                return Some(frame);
            }
            log_debug!(
                self.logger,
                "Buffering {:?} frame while waiting for {:?}",
                frame.frame_type(),
                frame_type
            );
            buffered.push_back(frame);
        }
    }
}

fn decode_v1(bytes: &[u8]) -> Option<V1Frame> {
    let frame = Frame::decode(bytes).ok()?;
    if frame.version != Some(FrameVersion::V1 as i32) {
        return None;
    }
    frame.v1
}
