//! Producer → slot → reader behaviour through the public API.
//!
//! ```bash
//! RUST_LOG=simcam=trace cargo test --test pipeline -- --nocapture
//! ```

use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;

use simcam::frame::gradient_sample;
use simcam::{
    Device, DeviceKind, FireOutcome, FrameGeometry, PatternKind, PollEvents, ReadError, ReadMode,
    ReadOutcome,
};

static INIT_TRACING: Once = Once::new();

/// Scheduling slack allowed on top of a producer period.
const WAKE_EPSILON: Duration = Duration::from_millis(100);

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        simcam::init_tracing();
    });
}

fn manual_camera() -> Device {
    Device::open(DeviceKind::FrameProducing {
        geometry: FrameGeometry::new(32, 8, 2),
        pattern: PatternKind::Gradient,
        period: None,
    })
    .unwrap()
}

fn first_sample(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

#[test]
fn non_blocking_read_before_first_frame() {
    init_test_tracing();
    let device = manual_camera();
    let mut buf = vec![0u8; device.frame_size()];
    assert_eq!(
        device.reader().read(&mut buf, ReadMode::NonBlocking),
        Err(ReadError::WouldBlock)
    );
}

#[test]
fn unread_frames_are_replaced_by_the_latest() {
    init_test_tracing();
    let device = manual_camera();
    for _ in 0..4 {
        device.fire_now().unwrap();
    }

    let reader = device.reader();
    let ReadOutcome::Frame(frame) = reader.take(ReadMode::NonBlocking).unwrap() else {
        panic!("expected a frame");
    };
    assert_eq!(frame.seq(), 4);
    assert_eq!(first_sample(frame.as_bytes()), gradient_sample(0, 0, 4));
    drop(frame);

    assert!(matches!(
        reader.take(ReadMode::NonBlocking),
        Err(ReadError::WouldBlock)
    ));
}

#[test]
#[serial]
fn one_publish_wakes_two_readers_but_delivers_once() {
    init_test_tracing();
    let device = manual_camera();

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    let reader = device.reader();
                    match reader.take(ReadMode::blocking_for(Duration::from_millis(500))) {
                        Ok(ReadOutcome::Frame(frame)) => {
                            let seq = frame.seq();
                            drop(frame);
                            Ok(seq)
                        }
                        Ok(ReadOutcome::EndOfStream) => panic!("device not closed"),
                        Err(e) => Err(e),
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(device.fire_now().unwrap(), FireOutcome::Published(1));
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| **r == Ok(1)).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| **r == Err(ReadError::TimedOut))
            .count(),
        1
    );
}

#[test]
#[serial]
fn cancelling_one_reader_leaves_the_other_waiting() {
    init_test_tracing();
    let device = manual_camera();
    let cancelled = device.reader();
    let patient = device.reader();
    let token = cancelled.cancel_token();

    thread::scope(|s| {
        let a = s.spawn(|| cancelled.take(ReadMode::BLOCKING).map(|_| ()));
        let b = s.spawn(|| match patient.take(ReadMode::blocking_for(Duration::from_secs(5))) {
            Ok(ReadOutcome::Frame(frame)) => frame.seq(),
            other => panic!("unexpected {other:?}"),
        });

        thread::sleep(Duration::from_millis(50));
        token.cancel();
        assert_eq!(a.join().unwrap(), Err(ReadError::Interrupted));

        thread::sleep(Duration::from_millis(20));
        device.fire_now().unwrap();
        assert_eq!(b.join().unwrap(), 1);
    });
}

#[test]
#[serial]
fn close_ends_blocked_reads_with_end_of_stream() {
    init_test_tracing();
    let device = manual_camera();

    thread::scope(|s| {
        let h = s.spawn(|| {
            let mut buf = vec![0u8; 64];
            device.reader().read(&mut buf, ReadMode::BLOCKING)
        });
        thread::sleep(Duration::from_millis(50));
        device.close();
        assert_eq!(h.join().unwrap(), Ok(0));
    });

    let reader = device.reader();
    assert!(reader.poll(PollEvents::READABLE).is_hangup());
    assert_eq!(
        reader.read(&mut [0u8; 4], ReadMode::NonBlocking),
        Err(ReadError::WouldBlock)
    );
    assert_eq!(reader.read(&mut [0u8; 4], ReadMode::BLOCKING), Ok(0));
    assert!(device.fire_now().is_err());
}

#[test]
fn poll_reports_without_consuming() {
    init_test_tracing();
    let device = manual_camera();
    let reader = device.reader();
    let all = PollEvents::READABLE | PollEvents::WRITABLE;

    assert_eq!(reader.poll(all), PollEvents::WRITABLE);
    device.fire_now().unwrap();
    assert_eq!(reader.poll(all), all);
    assert_eq!(reader.poll(all), all);

    let mut buf = vec![0u8; device.frame_size()];
    assert_eq!(reader.read(&mut buf, ReadMode::NonBlocking), Ok(device.frame_size()));
    assert_eq!(reader.poll(all), PollEvents::WRITABLE);
}

#[test]
fn mio_event_loop_sees_published_frames() {
    init_test_tracing();
    let device = manual_camera();
    let reader = device.reader();

    let mut poll = mio::Poll::new().unwrap();
    let waker = std::sync::Arc::new(mio::Waker::new(poll.registry(), mio::Token(3)).unwrap());
    let _guard = reader.register_waker(waker).unwrap();

    device.fire_now().unwrap();

    let mut events = mio::Events::with_capacity(4);
    poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
    assert!(events.iter().any(|e| e.token() == mio::Token(3)));
    assert!(reader.poll(PollEvents::READABLE).is_readable());
}

#[test]
fn echo_device_round_trip() {
    init_test_tracing();
    let device = Device::open(DeviceKind::SimpleBuffer { capacity: 1024 }).unwrap();
    let reader = device.reader();

    assert_eq!(device.write(b"hello").unwrap(), 5);
    assert!(reader.poll(PollEvents::READABLE).is_readable());

    let mut buf = [0u8; 1024];
    let n = reader.read(&mut buf, ReadMode::NonBlocking).unwrap();
    assert_eq!(&buf[..n], b"hello");

    let big = vec![7u8; 2000];
    assert_eq!(device.write(&big).unwrap(), 1024);
    assert_eq!(reader.read(&mut buf, ReadMode::NonBlocking), Ok(1024));
}

#[test]
#[serial]
fn periodic_producer_delivers_in_order() {
    init_test_tracing();
    let period = Duration::from_millis(50);
    let device = Device::open(DeviceKind::FrameProducing {
        geometry: FrameGeometry::new(64, 4, 2),
        pattern: PatternKind::Gradient,
        period: Some(period),
    })
    .unwrap();
    let reader = device.reader();

    let start = Instant::now();
    let mut last = 0;
    for _ in 0..4 {
        let outcome = reader
            .take(ReadMode::blocking_for(Duration::from_secs(2)))
            .unwrap();
        let ReadOutcome::Frame(frame) = outcome else {
            panic!("unexpected end of stream");
        };
        assert!(frame.seq() > last, "frames out of order");
        last = frame.seq();
        drop(frame);
    }
    assert!(start.elapsed() >= period * 3);
    assert_eq!(device.stats().generation_failures, 0);
}

#[test]
#[serial]
fn blocked_reader_wakes_promptly_after_publish() {
    init_test_tracing();
    let device = manual_camera();

    thread::scope(|s| {
        let h = s.spawn(|| {
            let outcome = device
                .reader()
                .take(ReadMode::blocking_for(Duration::from_secs(5)));
            (matches!(outcome, Ok(ReadOutcome::Frame(_))), Instant::now())
        });
        thread::sleep(Duration::from_millis(50));

        let fired = Instant::now();
        device.fire_now().unwrap();
        let (got_frame, woke) = h.join().unwrap();
        assert!(got_frame);
        let latency = woke.duration_since(fired);
        assert!(latency < WAKE_EPSILON, "woke after {latency:?}");
    });
}

#[test]
#[serial]
fn periodic_reads_return_within_one_period() {
    init_test_tracing();
    let period = Duration::from_millis(100);
    let device = Device::open(DeviceKind::FrameProducing {
        geometry: FrameGeometry::new(64, 4, 2),
        pattern: PatternKind::Gradient,
        period: Some(period),
    })
    .unwrap();
    let reader = device.reader();

    let mut since = Instant::now();
    for _ in 0..5 {
        let outcome = reader.take(ReadMode::blocking_for(period * 10)).unwrap();
        assert!(matches!(outcome, ReadOutcome::Frame(_)));
        let now = Instant::now();
        let waited = now.duration_since(since);
        assert!(waited <= period + WAKE_EPSILON, "waited {waited:?}");
        since = now;
    }
}

#[test]
#[serial]
fn dropping_taken_frames_keeps_the_producer_running() {
    init_test_tracing();
    let device = Device::open(DeviceKind::FrameProducing {
        geometry: FrameGeometry::new(8, 8, 2),
        pattern: PatternKind::Gradient,
        period: Some(Duration::from_millis(10)),
    })
    .unwrap();
    let reader = device.reader();

    for i in 0..10 {
        match reader.take(ReadMode::blocking_for(Duration::from_millis(500))) {
            // Dropped without any explicit hand-back.
            Ok(ReadOutcome::Frame(_)) => {}
            other => panic!("take #{i} returned {other:?}"),
        }
    }
    assert_eq!(device.stats().generation_failures, 0);
}

#[test]
#[serial]
fn writes_racing_close_never_leave_a_frame_behind() {
    init_test_tracing();
    for _ in 0..50 {
        let device = Device::open(DeviceKind::SimpleBuffer { capacity: 16 }).unwrap();
        thread::scope(|s| {
            s.spawn(|| while device.write(b"frame").is_ok() {});
            thread::sleep(Duration::from_micros(200));
            device.close();
            let events = device.reader().poll(PollEvents::READABLE);
            assert!(events.is_hangup());
            assert!(!events.is_readable());
        });
    }
}

#[test]
#[serial]
#[ignore = "takes two seconds"]
fn stock_camera_first_frame_after_two_seconds() {
    init_test_tracing();
    let device = Device::open(DeviceKind::camera()).unwrap();
    let start = Instant::now();
    let mut buf = vec![0u8; device.frame_size()];
    let n = device.reader().read(&mut buf, ReadMode::BLOCKING).unwrap();
    assert_eq!(n, 614_400);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1900), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
}
