//! End-to-end connect/verify/resize/subsegment/teardown sequence over real
//! Unix domain sockets and POSIX shared memory (no mocking).

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use producer_host::{resize, spawn_subsegment, Command, FeedState, ProducerRecord};
use shm_segment::Segment;

fn drive_until<F: Fn(&ProducerRecord) -> bool>(pr: &mut ProducerRecord, pred: F, max_ticks: u32) {
    for _ in 0..max_ticks {
        if pred(pr) {
            return;
        }
        pr.drive(Command::Poll).unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("predicate never became true within {max_ticks} ticks");
}

fn listener_pr(path: &std::path::Path, expected_key: &[u8]) -> ProducerRecord {
    let listener = std::os::unix::net::UnixListener::bind(path).unwrap();
    let segment = Segment::create(std::process::id(), 640, 480, true).unwrap();
    ProducerRecord::new_listener(
        segment,
        listener,
        path.to_path_buf(),
        expected_key.to_vec(),
        "primary".into(),
    )
}

#[test]
fn full_connect_verify_resize_subsegment_teardown_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("connpoint.sock");
    let mut pr = listener_pr(&path, b"s3cr3t");

    // Connect: a client dials the named connpoint.
    let mut client = UnixStream::connect(&path).unwrap();

    // Verify: client sends its key, host echoes the segment key back.
    client.write_all(b"s3cr3t\n").unwrap();
    drive_until(&mut pr, |pr| pr.feed_state == FeedState::Ready, 200);

    let mut response = String::new();
    client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    client.read_to_string(&mut response).unwrap();
    assert_eq!(response.trim_end(), pr.segment_key.as_str());
    assert!(!path.exists(), "connpoint path must be unlinked once claimed");

    // Resize: grow past the no-thrash threshold, header survives the remap.
    let original_parent_pid = pr.shared_page.header().parent_pid;
    resize::resize(&mut pr, 1280, 960).unwrap();
    assert_eq!(pr.shared_page.header().w, 1280);
    assert_eq!(pr.shared_page.header().h, 960);
    assert_eq!(pr.shared_page.header().parent_pid, original_parent_pid);

    // Subsegment: spawn an auxiliary output subsegment off the live parent,
    // with the fd-transfer-then-announce ordering observed on the parent's
    // outbound queue.
    let child = spawn_subsegment(&mut pr, false, 64, 64, "aux".into()).unwrap();
    assert!(child.is_subsegment);
    assert_eq!(
        pr.queues.outbound.pop(),
        Some(shm_segment::Event::FdTransferAnnounce)
    );
    match pr.queues.outbound.pop() {
        Some(shm_segment::Event::NewSegmentAnnounce { key, .. }) => {
            assert_eq!(key, child.segment_key)
        }
        other => panic!("expected NewSegmentAnnounce, got {other:?}"),
    }

    // Teardown: destroying the parent leaves it permanently dead and is
    // idempotent; the child is independent and still alive.
    pr.drive(Command::Destroy).unwrap();
    assert!(!pr.is_alive());
    pr.drive(Command::Destroy).unwrap();
    assert!(child.is_alive());
}
