mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use pg_logical::{ChangeFrame, Lsn, ReplicationError, ReplicationState, WritePath, run_receive_loop};

use common::{Sent, init_tracing, status_lsn, stream_pair};

#[tokio::test]
async fn state_advances_before_each_callback() {
    init_tracing();
    let (mut reader, writer, feed) = stream_pair();
    let writer = WritePath::new(writer);
    let state = Arc::new(ReplicationState::new());

    for end in [5, 3, 9, 9, 7] {
        feed.change(end, end, "{}");
    }
    feed.end();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut handler = {
        let seen = Arc::clone(&seen);
        let state = Arc::clone(&state);
        move |c: ChangeFrame| {
            seen.lock()
                .unwrap()
                .push((c.end_lsn.0, state.current_lsn().map(|l| l.0)));
        }
    };

    let err = run_receive_loop(&mut reader, &writer, &state, &mut handler, None).await;
    assert!(matches!(err, ReplicationError::StreamClosed), "{err:?}");

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![(5, Some(5)), (3, Some(5)), (9, Some(9)), (9, Some(9)), (7, Some(9))]
    );
    assert_eq!(state.current_lsn(), Some(Lsn(9)));
}

#[tokio::test]
async fn reply_requested_keepalive_is_answered_before_next_read() {
    let (mut reader, writer, mut feed) = stream_pair();
    let writer = WritePath::new(writer);
    let state = ReplicationState::new();

    feed.keepalive(100, true);
    feed.keepalive(200, false);
    feed.end();

    let mut handler = |_c: ChangeFrame| {};
    let err = run_receive_loop(&mut reader, &writer, &state, &mut handler, None).await;
    assert!(matches!(err, ReplicationError::StreamClosed));

    // The reply carries 100: it was written before the second keepalive was read.
    let Sent::Data(frame) = feed.next_sent().await else {
        panic!("expected a status update");
    };
    assert_eq!(status_lsn(&frame), 100);
    assert_eq!(feed.try_sent(), None);

    assert_eq!(state.current_lsn(), Some(Lsn(200)));
    assert!(state.last_report_at().is_some());
}

#[tokio::test]
async fn plain_keepalives_send_nothing() {
    let (mut reader, writer, mut feed) = stream_pair();
    let writer = WritePath::new(writer);
    let state = ReplicationState::new();

    feed.keepalive(10, false);
    feed.keepalive(20, false);
    feed.end();

    let mut handler = |_c: ChangeFrame| {};
    run_receive_loop(&mut reader, &writer, &state, &mut handler, None).await;

    assert_eq!(feed.try_sent(), None);
    assert_eq!(state.current_lsn(), Some(Lsn(20)));
    assert_eq!(state.last_report_at(), None);
}

#[tokio::test]
async fn unknown_frames_are_dropped() {
    let (mut reader, writer, feed) = stream_pair();
    let writer = WritePath::new(writer);
    let state = ReplicationState::new();

    feed.push(Bytes::from_static(b"x\x00\x01\x02"));
    feed.change(40, 41, "payload");
    feed.end();

    let payloads = Arc::new(Mutex::new(Vec::new()));
    let mut handler = {
        let payloads = Arc::clone(&payloads);
        move |c: ChangeFrame| payloads.lock().unwrap().push(c.payload)
    };
    run_receive_loop(&mut reader, &writer, &state, &mut handler, None).await;

    assert_eq!(*payloads.lock().unwrap(), vec![Bytes::from_static(b"payload")]);
    assert_eq!(state.current_lsn(), Some(Lsn(41)));
}

#[tokio::test]
async fn truncated_frame_ends_the_session() {
    let (mut reader, writer, feed) = stream_pair();
    let writer = WritePath::new(writer);
    let state = ReplicationState::new();

    feed.change(1, 2, "first");
    feed.push(Bytes::from_static(b"w\x00\x00\x00"));
    feed.change(3, 4, "never seen");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut handler = move |c: ChangeFrame| {
        let _ = tx.send(c);
    };
    let err = run_receive_loop(&mut reader, &writer, &state, &mut handler, None).await;

    assert!(
        matches!(
            err,
            ReplicationError::MalformedFrame {
                tag: Some(b'w'),
                len: 4,
                required: 25
            }
        ),
        "{err:?}"
    );
    assert_eq!(rx.try_recv().unwrap().payload, Bytes::from_static(b"first"));
    assert!(rx.try_recv().is_err());
    assert_eq!(state.current_lsn(), Some(Lsn(2)));
}

#[tokio::test]
async fn read_errors_end_the_loop() {
    let (mut reader, writer, feed) = stream_pair();
    let writer = WritePath::new(writer);
    let state = ReplicationState::new();

    feed.fail(ReplicationError::Io("connection reset by peer".into()));

    let mut handler = |_c: ChangeFrame| {};
    let err = run_receive_loop(&mut reader, &writer, &state, &mut handler, None).await;
    assert!(err.is_io());
    assert_eq!(state.current_lsn(), None);
}

#[tokio::test]
async fn failed_keepalive_reply_ends_the_loop() {
    let (mut reader, writer, feed) = stream_pair();
    let writer = WritePath::new(writer);
    let state = ReplicationState::new();

    feed.fail_writes(true);
    feed.keepalive(7, true);

    let mut handler = |_c: ChangeFrame| {};
    let err = run_receive_loop(&mut reader, &writer, &state, &mut handler, None).await;
    assert!(err.is_io(), "{err:?}");
}

#[tokio::test(start_paused = true)]
async fn idle_stream_times_out() {
    let (mut reader, writer, _feed) = stream_pair();
    let writer = WritePath::new(writer);
    let state = ReplicationState::new();

    let mut handler = |_c: ChangeFrame| {};
    let started = tokio::time::Instant::now();
    let err = run_receive_loop(
        &mut reader,
        &writer,
        &state,
        &mut handler,
        Some(Duration::from_secs(30)),
    )
    .await;

    assert!(matches!(err, ReplicationError::Timeout { .. }), "{err:?}");
    assert!(started.elapsed() >= Duration::from_secs(30));
}
