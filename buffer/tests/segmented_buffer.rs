//! Segmented mmap buffer integration tests
//!
//! Every test gets its own temporary directory. Restarts are simulated by
//! closing and dropping a buffer, then opening the same directory again.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use varasto_buffer::buffer::segment_file_name;
use varasto_buffer::{Buffer, Message, SegmentedBuffer, SegmentedOptions, VarastoError};
use varasto_core::codec;

fn open(dir: &Path, segment_size: usize) -> SegmentedBuffer {
    SegmentedBuffer::open(SegmentedOptions::new(dir).segment_size(segment_size)).unwrap()
}

fn text(msg: &Message, part: usize) -> String {
    String::from_utf8(msg.part(part).unwrap().to_vec()).unwrap()
}

fn segment_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("segment-"))
        .count()
}

async fn drain(buffer: &SegmentedBuffer) -> Vec<String> {
    let mut out = Vec::new();
    while buffer.backlog() > 0 {
        let msg = tokio::time::timeout(Duration::from_secs(1), buffer.next_message())
            .await
            .expect("pending message not readable")
            .unwrap();
        out.push(text(&msg, 0));
        buffer.shift_message().unwrap();
    }
    out
}

// ============================================================================
// Basic behaviour
// ============================================================================

#[tokio::test]
async fn mmap_basic() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = open(dir.path(), 100_000);

    let n = 100;
    for i in 0..n {
        buffer
            .push_message(Message::from_slices(["hello".to_string(), format!("test{i}")]))
            .await
            .unwrap();
    }

    for i in 0..n {
        let msg = buffer.next_message().await.unwrap();
        assert_eq!(msg.len(), 2);
        assert_eq!(text(&msg, 0), "hello");
        assert_eq!(text(&msg, 1), format!("test{i}"));
        buffer.shift_message().unwrap();
    }
    assert_eq!(buffer.backlog(), 0);
    buffer.close();
}

#[tokio::test]
async fn mmap_backlog_counter() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = open(dir.path(), 100_000);

    assert_eq!(
        buffer
            .push_message(Message::from_slices(["1234"]))
            .await
            .unwrap(),
        16
    );
    assert_eq!(
        buffer
            .push_message(Message::from_slices(["1234", "1234"]))
            .await
            .unwrap(),
        40
    );

    buffer.next_message().await.unwrap();
    assert_eq!(buffer.shift_message().unwrap(), 16);
    assert_eq!(buffer.backlog(), 24);

    buffer.next_message().await.unwrap();
    assert_eq!(buffer.shift_message().unwrap(), 24);
    assert_eq!(buffer.backlog(), 0);
}

#[tokio::test]
async fn mmap_reject_large_message() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = open(dir.path(), 10);

    let err = buffer
        .push_message(Message::from_slices([
            "hello world this message is too long!",
        ]))
        .await
        .unwrap_err();
    assert!(matches!(err, VarastoError::MessageTooLarge { limit: 10, .. }));
    assert_eq!(buffer.backlog(), 0);
    assert!(!buffer.is_closed());
}

#[tokio::test]
async fn mmap_limit_applies_backpressure() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = Arc::new(
        SegmentedBuffer::open(
            SegmentedOptions::new(dir.path())
                .segment_size(1000)
                .limit(Some(40)),
        )
        .unwrap(),
    );

    buffer
        .push_message(Message::from_slices(["0123456789"]))
        .await
        .unwrap();
    let blocked = {
        let buffer = Arc::clone(&buffer);
        tokio::spawn(async move {
            buffer
                .push_message(Message::from_slices(["abcdefghij"]))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    buffer.next_message().await.unwrap();
    buffer.shift_message().unwrap();
    let backlog = tokio::time::timeout(Duration::from_secs(1), blocked)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(backlog, 22);
}

// ============================================================================
// Segments
// ============================================================================

#[tokio::test]
async fn mmap_multi_files() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = open(dir.path(), 1000);

    let n = 10_000;
    for i in 0..n {
        buffer
            .push_message(Message::from_slices([format!("{i:05}")]))
            .await
            .unwrap();
    }
    // 17-byte records, 58 per segment
    assert!(segment_files(dir.path()) > 100);

    for i in 0..n {
        let msg = buffer.next_message().await.unwrap();
        assert_eq!(text(&msg, 0), format!("{i:05}"));
        buffer.shift_message().unwrap();
    }

    assert_eq!(buffer.backlog(), 0);
    assert_eq!(segment_files(dir.path()), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mmap_looping_across_segments() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = Arc::new(
        SegmentedBuffer::open(
            SegmentedOptions::new(dir.path())
                .segment_size(8000)
                .limit(Some(16_000)),
        )
        .unwrap(),
    );

    let total = 2000;
    let producer = {
        let buffer = Arc::clone(&buffer);
        tokio::spawn(async move {
            for i in 0..total {
                let size = (i * 37) % 100;
                buffer
                    .push_message(Message::from_slices([vec![(i % 251) as u8; size]]))
                    .await
                    .unwrap();
            }
        })
    };

    for i in 0..total {
        let msg = tokio::time::timeout(Duration::from_secs(5), buffer.next_message())
            .await
            .expect("consumer starved")
            .unwrap();
        let part = msg.part(0).unwrap();
        assert_eq!(part.len(), (i * 37) % 100);
        assert!(part.iter().all(|b| *b == (i % 251) as u8));
        buffer.shift_message().unwrap();
    }

    producer.await.unwrap();
    assert_eq!(buffer.backlog(), 0);
}

#[tokio::test]
async fn mmap_cancelled_next_removes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = open(dir.path(), 4096);

    let waited = tokio::time::timeout(Duration::from_millis(20), buffer.next_message()).await;
    assert!(waited.is_err());

    buffer
        .push_message(Message::from_slices(["x"]))
        .await
        .unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(1), buffer.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(text(&msg, 0), "x");
    assert_eq!(buffer.backlog(), 13);
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn mmap_recover_files() {
    let dir = tempfile::tempdir().unwrap();
    let n = 10_000;

    let backlog = {
        let buffer = open(dir.path(), 1000);
        for i in 0..n {
            buffer
                .push_message(Message::from_slices([format!("{i:05}")]))
                .await
                .unwrap();
        }
        let backlog = buffer.backlog();
        buffer.close();
        backlog
    };

    let buffer = open(dir.path(), 1000);
    assert_eq!(buffer.backlog(), backlog);

    let read = drain(&buffer).await;
    assert_eq!(read.len(), n);
    for (i, got) in read.iter().enumerate() {
        assert_eq!(got, &format!("{i:05}"));
    }
}

#[tokio::test]
async fn mmap_recover_without_close() {
    let dir = tempfile::tempdir().unwrap();
    {
        let buffer = open(dir.path(), 4096);
        for i in 0..20 {
            buffer
                .push_message(Message::from_slices([format!("msg{i}")]))
                .await
                .unwrap();
        }
        // dropped without close
    }

    let buffer = open(dir.path(), 4096);
    let read = drain(&buffer).await;
    let expected: Vec<String> = (0..20).map(|i| format!("msg{i}")).collect();
    assert_eq!(read, expected);
}

#[tokio::test]
async fn mmap_recover_drops_deleted_segments_only() {
    let dir = tempfile::tempdir().unwrap();
    {
        // 16-byte records, two per segment
        let buffer = open(dir.path(), 32);
        for i in 0..10 {
            buffer
                .push_message(Message::from_slices([format!("{i:04}")]))
                .await
                .unwrap();
        }
        assert_eq!(segment_files(dir.path()), 5);

        for _ in 0..4 {
            buffer.next_message().await.unwrap();
            buffer.shift_message().unwrap();
        }
        assert_eq!(segment_files(dir.path()), 3);
        buffer.close();
    }

    let buffer = open(dir.path(), 32);
    assert_eq!(buffer.backlog(), 6 * 16);
    let read = drain(&buffer).await;
    let expected: Vec<String> = (4..10).map(|i| format!("{i:04}")).collect();
    assert_eq!(read, expected);
}

#[tokio::test]
async fn mmap_recover_skips_shifted_records() {
    let dir = tempfile::tempdir().unwrap();
    {
        let buffer = open(dir.path(), 4096);
        for part in ["a", "b", "c"] {
            buffer
                .push_message(Message::from_slices([part]))
                .await
                .unwrap();
        }
        buffer.next_message().await.unwrap();
        buffer.shift_message().unwrap();
        buffer.close();
    }

    let buffer = open(dir.path(), 4096);
    assert_eq!(buffer.backlog(), 2 * 13);
    assert_eq!(drain(&buffer).await, vec!["b", "c"]);
}

#[tokio::test]
async fn mmap_recover_fully_drained_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    {
        let buffer = open(dir.path(), 4096);
        for part in ["a", "b", "c"] {
            buffer
                .push_message(Message::from_slices([part]))
                .await
                .unwrap();
        }
        assert_eq!(drain(&buffer).await, vec!["a", "b", "c"]);
        buffer.close();
    }

    let buffer = open(dir.path(), 4096);
    assert_eq!(buffer.backlog(), 0);
    assert_eq!(segment_files(dir.path()), 1);

    buffer
        .push_message(Message::from_slices(["d"]))
        .await
        .unwrap();
    assert_eq!(drain(&buffer).await, vec!["d"]);
}

#[tokio::test]
async fn mmap_recover_drained_without_close() {
    let dir = tempfile::tempdir().unwrap();
    {
        let buffer = open(dir.path(), 4096);
        for part in ["a", "b"] {
            buffer
                .push_message(Message::from_slices([part]))
                .await
                .unwrap();
        }
        drain(&buffer).await;
        // dropped without close
    }

    let buffer = open(dir.path(), 4096);
    assert_eq!(buffer.backlog(), 0);
}

#[tokio::test]
async fn mmap_recover_resumes_mid_segment() {
    let dir = tempfile::tempdir().unwrap();
    {
        // 16-byte records, two per segment
        let buffer = open(dir.path(), 32);
        for i in 0..10 {
            buffer
                .push_message(Message::from_slices([format!("{i:04}")]))
                .await
                .unwrap();
        }
        for _ in 0..5 {
            buffer.next_message().await.unwrap();
            buffer.shift_message().unwrap();
        }
        buffer.close();
    }

    let buffer = open(dir.path(), 32);
    assert_eq!(buffer.backlog(), 5 * 16);
    let read = drain(&buffer).await;
    let expected: Vec<String> = (5..10).map(|i| format!("{i:04}")).collect();
    assert_eq!(read, expected);
}

#[tokio::test]
async fn mmap_sync_writes_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let options = SegmentedOptions::new(dir.path())
        .segment_size(64)
        .sync_writes(true);
    {
        let buffer = SegmentedBuffer::open(options.clone()).unwrap();
        for i in 0..10 {
            buffer
                .push_message(Message::from_slices([format!("{i:04}")]))
                .await
                .unwrap();
        }
        // four 16-byte records per segment
        assert_eq!(segment_files(dir.path()), 3);
        for _ in 0..3 {
            buffer.next_message().await.unwrap();
            buffer.shift_message().unwrap();
        }
        buffer.close();
    }

    let buffer = SegmentedBuffer::open(options).unwrap();
    assert_eq!(buffer.backlog(), 7 * 16);
    let read = drain(&buffer).await;
    let expected: Vec<String> = (3..10).map(|i| format!("{i:04}")).collect();
    assert_eq!(read, expected);
    assert_eq!(segment_files(dir.path()), 1);
}

#[tokio::test]
async fn mmap_recover_truncates_torn_tail() {
    let dir = tempfile::tempdir().unwrap();
    let record = codec::encode(&Message::from_slices(["intact"]));
    {
        let buffer = open(dir.path(), 4096);
        for _ in 0..3 {
            buffer
                .push_message(Message::from_slices(["intact"]))
                .await
                .unwrap();
        }
        buffer.close();
    }

    // Simulate a crash halfway through writing a fourth record
    let path = dir.path().join(segment_file_name(0));
    let torn = codec::encode(&Message::from_slices([vec![7u8; 100]]));
    let offset = 3 * record.len();
    {
        let mut data = fs::read(&path).unwrap();
        data.truncate(offset);
        data.extend_from_slice(&torn[..50]);
        fs::write(&path, &data).unwrap();
    }

    let buffer = open(dir.path(), 4096);
    assert_eq!(buffer.backlog(), 3 * record.len());
    assert_eq!(fs::metadata(&path).unwrap().len(), 4096);

    buffer
        .push_message(Message::from_slices(["after"]))
        .await
        .unwrap();
    buffer.close();
    drop(buffer);

    let buffer = open(dir.path(), 4096);
    assert_eq!(
        drain(&buffer).await,
        vec!["intact", "intact", "intact", "after"]
    );
}

#[tokio::test]
async fn mmap_recover_rejects_corrupt_record() {
    let dir = tempfile::tempdir().unwrap();
    {
        let buffer = open(dir.path(), 4096);
        buffer
            .push_message(Message::from_slices(["good"]))
            .await
            .unwrap();
        buffer.close();
    }

    // total length 2 can never hold a part count
    let path = dir.path().join(segment_file_name(0));
    let mut data = fs::read(&path).unwrap();
    data[..4].copy_from_slice(&2u32.to_le_bytes());
    fs::write(&path, &data).unwrap();

    let err = SegmentedBuffer::open(SegmentedOptions::new(dir.path()).segment_size(4096))
        .err()
        .expect("corrupt segment opened");
    assert!(matches!(err, VarastoError::Corrupt(_)));
}

#[tokio::test]
async fn mmap_recover_rejects_truncated_sealed_segment() {
    let dir = tempfile::tempdir().unwrap();
    {
        let buffer = open(dir.path(), 32);
        for i in 0..4 {
            buffer
                .push_message(Message::from_slices([format!("{i:04}")]))
                .await
                .unwrap();
        }
        buffer.close();
    }

    // Cut the last record of the first (sealed) segment short
    let path = dir.path().join(segment_file_name(0));
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(20).unwrap();
    drop(file);

    let err = SegmentedBuffer::open(SegmentedOptions::new(dir.path()).segment_size(32))
        .err()
        .expect("truncated sealed segment opened");
    assert!(matches!(err, VarastoError::Corrupt(_)));
}

#[tokio::test]
async fn mmap_ignores_foreign_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("README"), b"not a segment").unwrap();

    let buffer = open(dir.path(), 4096);
    assert_eq!(buffer.backlog(), 0);
    assert!(dir.path().join("README").exists());
    assert!(dir.path().join(segment_file_name(0)).exists());
}
