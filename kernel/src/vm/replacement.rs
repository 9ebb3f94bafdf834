use super::frame::Frame;

/// Chooses which resident page gives up its frame.
pub trait ReplacementPolicy: Send {
    /// Index of the victim in `frames`, where `None` marks a vacant slot.
    /// Pinned frames are never chosen. Returns `None` if none is evictable
    /// at the moment; the caller retries once a pin is dropped.
    fn select_victim(&mut self, frames: &[Option<Frame>]) -> Option<usize>;
}

/// Second chance: sweep the frames in a circle, clearing accessed bits, and
/// take the first frame whose bit was already clear.
#[derive(Debug, Default)]
pub struct Clock {
    hand: usize,
}

impl Clock {
    pub fn hand(&self) -> usize {
        self.hand
    }
}

impl ReplacementPolicy for Clock {
    fn select_victim(&mut self, frames: &[Option<Frame>]) -> Option<usize> {
        if !frames.iter().flatten().any(|frame| !frame.is_pinned()) {
            return None;
        }
        loop {
            let idx = self.hand % frames.len();
            self.hand = (idx + 1) % frames.len();

            let Some(frame) = &frames[idx] else { continue };
            if frame.is_pinned() {
                continue;
            }
            let mut page_dir = frame.owner().page_dir();
            if page_dir.is_accessed(frame.upage()) {
                page_dir.set_accessed(frame.upage(), false);
            } else {
                return Some(idx);
            }
        }
    }
}
