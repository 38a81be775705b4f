//! Decoded-frame handoff between the decode thread and the render thread.

use std::sync::Mutex;

use vantage_proto::PoseF;

use crate::clock::MonotonicStamp;

/// One decoded video frame plus the metadata the server rendered it with.
///
/// Exactly one owner at a time: the decode thread until published, the render
/// thread after a pull, and back to the decoder's texture pool on hand-back.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    /// GL texture name holding the full side-by-side frame.
    pub texture: u32,
    /// GL texture target the frame was uploaded to.
    pub texture_target: u32,
    /// Predicted display poses the server rendered each eye with.
    pub view_poses: [PoseF; 2],
    /// Blend-mode tag from the down message; zero means "no change".
    pub env_blend_mode: u32,
    pub additive_black_threshold: f32,
    /// Strictly increasing within a session.
    pub frame_sequence_id: i64,
    /// When the decoder finished producing this frame (host monotonic).
    pub decode_complete_time: MonotonicStamp,
}

/// Single-slot latest-frame queue.
///
/// The decoder always publishes the freshest frame; the renderer consumes it
/// at most once. Displaced and handed-back samples travel back to the decode
/// side so their textures can be reused.
#[derive(Default)]
pub struct SampleQueue {
    pending: Mutex<Option<Sample>>,
    returned: Mutex<Vec<Sample>>,
}

impl SampleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pending sample. If one was already pending and unconsumed,
    /// it is returned to the caller (the decode thread) for reuse.
    pub fn publish(&self, sample: Sample) -> Option<Sample> {
        self.pending
            .lock()
            .expect("sample slot poisoned")
            .replace(sample)
    }

    /// Remove and return the pending sample, if any.
    pub fn try_pull(&self) -> Option<Sample> {
        self.pending.lock().expect("sample slot poisoned").take()
    }

    /// Release a previously pulled sample back toward the decoder's texture
    /// pool. Must be called exactly once per successful pull.
    pub fn hand_back(&self, sample: Sample) {
        self.returned
            .lock()
            .expect("sample return lane poisoned")
            .push(sample);
    }

    /// Decode-side drain of everything handed back since the last call.
    pub fn take_returned(&self) -> Vec<Sample> {
        std::mem::take(&mut self.returned.lock().expect("sample return lane poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_proto::PoseF;

    fn sample(seq: i64, texture: u32) -> Sample {
        Sample {
            texture,
            texture_target: glow::TEXTURE_2D,
            view_poses: [PoseF::IDENTITY; 2],
            env_blend_mode: 0,
            additive_black_threshold: 0.0,
            frame_sequence_id: seq,
            decode_complete_time: MonotonicStamp {
                tv_sec: seq,
                tv_nsec: 0,
            },
        }
    }

    #[test]
    fn queue_holds_at_most_one_sample() {
        let queue = SampleQueue::new();
        assert!(queue.publish(sample(1, 10)).is_none());
        let displaced = queue.publish(sample(2, 11)).expect("old sample returned");
        assert_eq!(displaced.frame_sequence_id, 1);

        let pulled = queue.try_pull().expect("latest pending");
        assert_eq!(pulled.frame_sequence_id, 2);
        assert!(queue.try_pull().is_none());
    }

    #[test]
    fn hand_back_reaches_the_decode_side() {
        let queue = SampleQueue::new();
        queue.publish(sample(1, 10));
        let pulled = queue.try_pull().unwrap();
        queue.hand_back(pulled);

        let returned = queue.take_returned();
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].texture, 10);
        assert!(queue.take_returned().is_empty());
    }

    #[test]
    fn pulled_sequence_ids_increase() {
        let queue = SampleQueue::new();
        let mut last = 0;
        for seq in 1..=5 {
            queue.publish(sample(seq, 10 + seq as u32));
            let pulled = queue.try_pull().unwrap();
            assert!(pulled.frame_sequence_id > last);
            last = pulled.frame_sequence_id;
            queue.hand_back(pulled);
        }
        assert_eq!(queue.take_returned().len(), 5);
    }
}
