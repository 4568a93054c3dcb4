//! Immutable sorted segments

pub mod format;
mod reader;
mod writer;

pub use format::{parse_segment_id, segment_path, SegmentFooter};
pub use reader::{Segment, SegmentIter};
pub use writer::{SegmentInfo, SegmentWriter};

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::{Key, Lsn, Value, VectorRecord, VersionedValue};
    use std::io::{Read, Seek, SeekFrom, Write};

    fn rec(i: u32) -> VersionedValue {
        VersionedValue {
            value: Value::Record(VectorRecord::new(vec![i as f32; 8], vec![i as u8; 3])),
            lsn: i as Lsn + 1,
        }
    }

    fn key(i: u32) -> Key {
        Key::from(format!("key-{:05}", i).as_str())
    }

    fn write_segment(dir: &std::path::Path, id: u64, n: u32) -> SegmentInfo {
        let mut w = SegmentWriter::create(dir, id, 512).unwrap();
        for i in 0..n {
            if i % 10 == 3 {
                w.add(&key(i), &VersionedValue { value: Value::Tombstone, lsn: i as Lsn + 1 })
                    .unwrap();
            } else {
                w.add(&key(i), &rec(i)).unwrap();
            }
        }
        w.finish().unwrap()
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let info = write_segment(dir.path(), 1, 200);
        assert_eq!(info.entries, 200);
        assert_eq!(info.tombstones, 20);
        assert_eq!(info.min_lsn, 1);
        assert_eq!(info.max_lsn, 200);
        assert_eq!(info.file_size % 512, 0);

        let seg = Segment::open(&info.path, 1).unwrap();
        seg.verify().unwrap();
        assert!(seg.block_count() > 1);
        assert_eq!(seg.min_key(), &key(0));
        assert_eq!(seg.max_key(), &key(199));
        assert_eq!(seg.get(&key(42)).unwrap(), Some(rec(42)));
        assert!(seg.get(&key(13)).unwrap().unwrap().value.is_tombstone());
        assert_eq!(seg.get(&Key::from("zzz")).unwrap(), None);
        assert_eq!(seg.get(&Key::from("key-00042a")).unwrap(), None);
    }

    #[test]
    fn test_iter_and_range_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let info = write_segment(dir.path(), 2, 100);
        let seg = Segment::open(&info.path, 2).unwrap();
        let all: Vec<Key> = seg.iter().map(|r| r.unwrap().0).collect();
        assert_eq!(all, (0..100).map(key).collect::<Vec<_>>());

        let some: Vec<Key> = seg
            .range(Some(&key(37)), Some(&key(61)))
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(some, (37..61).map(key).collect::<Vec<_>>());
    }

    #[test]
    fn test_out_of_order_and_empty_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = SegmentWriter::create(dir.path(), 3, 512).unwrap();
        w.add(&key(5), &rec(5)).unwrap();
        assert!(matches!(w.add(&key(5), &rec(5)), Err(crate::SegmentError::OutOfOrder)));
        assert!(matches!(w.add(&key(1), &rec(1)), Err(crate::SegmentError::OutOfOrder)));

        let empty = SegmentWriter::create(dir.path(), 4, 512).unwrap();
        assert!(matches!(empty.finish(), Err(crate::SegmentError::Empty)));
        drop(w);
        // Abandoned writers leave no temporary files behind
        assert!(std::fs::read_dir(dir.path())
            .unwrap()
            .all(|e| !e.unwrap().file_name().to_string_lossy().ends_with(".tmp")));
    }

    #[test]
    fn test_large_entry_spans_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = SegmentWriter::create(dir.path(), 5, 512).unwrap();
        let big = VersionedValue {
            value: Value::Record(VectorRecord::from_vector(vec![0.5; 600])),
            lsn: 1,
        };
        w.add(&key(0), &big).unwrap();
        w.add(&key(1), &rec(1)).unwrap();
        let info = w.finish().unwrap();
        let seg = Segment::open(&info.path, 5).unwrap();
        assert_eq!(seg.get(&key(0)).unwrap(), Some(big));
        assert_eq!(seg.get(&key(1)).unwrap(), Some(rec(1)));
    }

    #[test]
    fn test_flipped_data_byte_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let info = write_segment(dir.path(), 6, 50);
        {
            let mut f = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&info.path)
                .unwrap();
            f.seek(SeekFrom::Start(20)).unwrap();
            let mut b = [0u8; 1];
            f.read_exact(&mut b).unwrap();
            f.seek(SeekFrom::Start(20)).unwrap();
            f.write_all(&[b[0] ^ 0xff]).unwrap();
        }
        let seg = Segment::open(&info.path, 6).unwrap();
        assert_eq!(seg.verify().unwrap_err().corrupt_segment(), Some(6));
        assert_eq!(seg.get(&key(0)).unwrap_err().corrupt_segment(), Some(6));
        assert!(seg.iter().any(|r| r.is_err()));
    }

    #[test]
    fn test_truncated_file_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let info = write_segment(dir.path(), 7, 50);
        let f = std::fs::OpenOptions::new().write(true).open(&info.path).unwrap();
        f.set_len(info.file_size - 100).unwrap();
        drop(f);
        assert!(Segment::open(&info.path, 7).is_err());
    }
}
