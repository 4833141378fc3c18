//! Resize Negotiator: grows or shrinks the shared page in place, preserving
//! the control header across the remap.

use shm_segment::{Layout, MAX_SZ};

use crate::error::{ProducerError, ProducerResult};
use crate::record::ProducerRecord;

/// Below this fraction of the current size, a shrink request is a no-op
/// (avoids remap thrash).
const NO_THRASH_THRESHOLD: f64 = 0.8;

/// `resize(handle, w, h) -> bool`, per the resize negotiator's contract:
/// `Ok(true)` means the new size took effect or the request was a
/// short-circuited no-op; `Ok(false)` is never returned by this
/// implementation (an oversized request is an error, not a false result,
/// since the caller needs to distinguish "rejected" from "no-op").
pub fn resize(pr: &mut ProducerRecord, w: u32, h: u32) -> ProducerResult<bool> {
    let with_audio = pr.audio_size > 0;
    let layout = Layout::compute(w, h, with_audio);

    if layout.total_size > MAX_SZ {
        return Err(ProducerError::Segment(
            shm_segment::SegmentError::ResourceExhausted {
                requested: layout.total_size,
                max: MAX_SZ,
            },
        ));
    }

    let current_size = pr.shared_page.size();
    if (layout.total_size as f64) >= (current_size as f64) * NO_THRASH_THRESHOLD
        && layout.total_size <= current_size
    {
        // Within 80% of current size: short-circuit, no remap, header
        // unchanged.
        return Ok(true);
    }

    match pr.shared_page.remap(layout.total_size) {
        Ok(()) => {
            let header = pr.shared_page.header_mut();
            header.w = w;
            header.h = h;
            pr.audio_offset = layout.audio_offset;
            pr.audio_size = layout.audio_size;
            Ok(true)
        }
        Err(e) => {
            // On remap failure the PR is left with ptr == NULL and must be
            // treated as dead by the next poll.
            pr.alive = false;
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ProducerRecord;
    use shm_segment::Segment;
    use std::os::unix::net::UnixListener;

    fn make_pr() -> (ProducerRecord, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resize.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let segment = Segment::create(std::process::id(), 640, 480, true).unwrap();
        let pr = ProducerRecord::new_listener(segment, listener, path, Vec::new(), "tag".into());
        (pr, dir)
    }

    #[test]
    fn shrink_within_threshold_is_a_no_op() {
        let (mut pr, _dir) = make_pr();
        let original_size = pr.shared_page.size();

        // 0.9 * S in terms of video bytes roughly maps to a slightly
        // smaller w*h; pick dimensions whose total_size lands within 80%.
        let ok = resize(&mut pr, 640, 470).unwrap();
        assert!(ok);
        assert_eq!(pr.shared_page.size(), original_size);
    }

    #[test]
    fn grow_beyond_threshold_remaps_and_updates_header() {
        let (mut pr, _dir) = make_pr();
        let ok = resize(&mut pr, 1280, 960).unwrap();
        assert!(ok);
        assert_eq!(pr.shared_page.header().w, 1280);
        assert_eq!(pr.shared_page.header().h, 960);
        assert_eq!(
            pr.shared_page.header().segment_size.load(std::sync::atomic::Ordering::Acquire) as usize,
            pr.shared_page.size()
        );
    }

    #[test]
    fn oversized_request_is_rejected() {
        let (mut pr, _dir) = make_pr();
        let err = resize(&mut pr, shm_segment::MAX_W, shm_segment::MAX_H).unwrap_err();
        assert!(matches!(
            err,
            ProducerError::Segment(shm_segment::SegmentError::ResourceExhausted { .. })
        ));
    }
}
