use super::{CompactionJob, CompactionReason};
use crate::version::{LiveSegment, Version};
use quiver_core::config::CompactionSettings;

/// Chooses the next compaction job, if any.
#[derive(Debug, Clone)]
pub struct CompactionPicker {
    settings: CompactionSettings,
}

impl CompactionPicker {
    /// Picker for `settings`.
    pub fn new(settings: CompactionSettings) -> Self {
        CompactionPicker { settings }
    }

    /// Byte budget of `level` (level 1 and deeper).
    pub fn level_budget(&self, level: u32) -> u64 {
        let fanout = self.settings.level_fanout.max(1) as u64;
        (1..level).fold(self.settings.level1_bytes, |budget, _| {
            budget.saturating_mul(fanout)
        })
    }

    /// Next job, in priority order: level 0 trigger, level size, dead entries.
    pub fn pick(&self, version: &Version) -> Option<CompactionJob> {
        let bottom = version.bottom_level();
        if bottom == 0 {
            return None;
        }
        self.pick_level0(version)
            .or_else(|| self.pick_oversized(version, bottom))
            .or_else(|| self.pick_dead_entries(version, bottom))
    }

    fn pick_level0(&self, version: &Version) -> Option<CompactionJob> {
        let l0 = version.level(0);
        if l0.is_empty() || l0.len() < self.settings.level0_trigger {
            return None;
        }
        let mut inputs: Vec<LiveSegment> = l0.to_vec();
        let (min, max) = key_span(&inputs);
        inputs.extend(version.overlapping(1, &min, &max));
        Some(CompactionJob {
            inputs,
            target_level: 1,
            reason: CompactionReason::Level0,
        })
    }

    fn pick_oversized(&self, version: &Version, bottom: u32) -> Option<CompactionJob> {
        for level in 1..bottom {
            if version.level_bytes(level) <= self.level_budget(level) {
                continue;
            }
            // Oldest data moves down first
            let seg = version.level(level).iter().min_by_key(|s| (s.desc.max_lsn, s.id()))?;
            let mut inputs = vec![seg.clone()];
            inputs.extend(version.overlapping(level + 1, &seg.desc.min_key, &seg.desc.max_key));
            return Some(CompactionJob {
                inputs,
                target_level: level + 1,
                reason: CompactionReason::LevelSize(level),
            });
        }
        None
    }

    fn pick_dead_entries(&self, version: &Version, bottom: u32) -> Option<CompactionJob> {
        // Level 0 is left to its own trigger, which merges all of it: moving
        // one L0 segment to the bottom would leave older overlapping L0
        // segments shadowing the result.
        let seg = (1..bottom)
            .flat_map(|level| version.level(level).iter())
            .map(|s| (version.dead_ratio(s), s))
            .filter(|(ratio, _)| *ratio > self.settings.tombstone_ratio)
            .max_by(|(ra, a), (rb, b)| ra.total_cmp(rb).then(b.id().cmp(&a.id())))
            .map(|(_, s)| s)?;

        // Pull in every deeper segment the merged range touches, so nothing
        // older than the output is left above or beside it on the bottom level.
        let mut inputs = vec![seg.clone()];
        let (mut min, mut max) = (seg.desc.min_key.clone(), seg.desc.max_key.clone());
        loop {
            let mut grew = false;
            for level in seg.level() + 1..=bottom {
                for candidate in version.overlapping(level, &min, &max) {
                    if inputs.iter().all(|s| s.id() != candidate.id()) {
                        min = min.min(candidate.desc.min_key.clone());
                        max = max.max(candidate.desc.max_key.clone());
                        inputs.push(candidate);
                        grew = true;
                    }
                }
            }
            if !grew {
                break;
            }
        }
        Some(CompactionJob {
            reason: CompactionReason::DeadEntries { segment: seg.id() },
            inputs,
            target_level: bottom,
        })
    }
}

fn key_span(segments: &[LiveSegment]) -> (Vec<u8>, Vec<u8>) {
    let min = segments
        .iter()
        .map(|s| s.desc.min_key.clone())
        .min()
        .unwrap_or_default();
    let max = segments
        .iter()
        .map(|s| s.desc.max_key.clone())
        .max()
        .unwrap_or_default();
    (min, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{Segment, SegmentWriter};
    use quiver_core::config::ShardConfig;
    use quiver_core::{Key, Lsn, Value, VectorRecord, VersionedValue};
    use std::sync::Arc;

    fn settings() -> CompactionSettings {
        ShardConfig::for_testing().compaction
    }

    fn make(dir: &std::path::Path, id: u64, level: u32, keys: &[&str], tombstones: usize, lsn: Lsn) -> LiveSegment {
        let mut w = SegmentWriter::create(dir, id, 512).unwrap();
        for (i, k) in keys.iter().enumerate() {
            let value = if i < tombstones {
                Value::Tombstone
            } else {
                Value::Record(VectorRecord::from_vector(vec![1.0]))
            };
            w.add(&Key::from(*k), &VersionedValue { value, lsn }).unwrap();
        }
        let info = w.finish().unwrap();
        LiveSegment {
            desc: info.descriptor(level),
            segment: Arc::new(Segment::open(&info.path, id).unwrap()),
        }
    }

    #[test]
    fn test_nothing_to_do() {
        let picker = CompactionPicker::new(settings());
        assert!(picker.pick(&Version::new(3)).is_none());
    }

    #[test]
    fn test_level0_trigger_pulls_overlapping_level1() {
        let dir = tempfile::tempdir().unwrap();
        let trigger = settings().level0_trigger;
        let mut segs = Vec::new();
        for i in 0..trigger as u64 {
            segs.push(make(dir.path(), i + 1, 0, &["b", "d"], 0, i + 10));
        }
        segs.push(make(dir.path(), 50, 1, &["a", "c"], 0, 1));
        segs.push(make(dir.path(), 51, 1, &["x", "y"], 0, 1));
        let version = Version::from_segments(3, segs);

        let job = CompactionPicker::new(settings()).pick(&version).unwrap();
        assert_eq!(job.reason, CompactionReason::Level0);
        assert_eq!(job.target_level, 1);
        let ids = job.input_ids();
        assert_eq!(ids.len(), trigger + 1);
        assert!(ids.contains(&50));
        assert!(!ids.contains(&51));
    }

    #[test]
    fn test_level0_below_trigger_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let segs = vec![make(dir.path(), 1, 0, &["a"], 0, 1)];
        let version = Version::from_segments(3, segs);
        assert!(CompactionPicker::new(settings()).pick(&version).is_none());
    }

    #[test]
    fn test_tombstone_heavy_segment_forced_to_bottom() {
        let dir = tempfile::tempdir().unwrap();
        let segs = vec![
            make(dir.path(), 1, 1, &["a", "b", "c", "d", "e"], 2, 20),
            make(dir.path(), 2, 2, &["c", "k"], 0, 5),
            make(dir.path(), 3, 2, &["m", "z"], 0, 5),
        ];
        let version = Version::from_segments(3, segs);
        let job = CompactionPicker::new(settings()).pick(&version).unwrap();
        assert_eq!(job.reason, CompactionReason::DeadEntries { segment: 1 });
        assert_eq!(job.target_level, 2);
        let mut ids = job.input_ids();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_low_tombstone_ratio_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let keys: Vec<String> = (0..10).map(|i| format!("k{}", i)).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let segs = vec![make(dir.path(), 1, 1, &refs, 1, 20)];
        let version = Version::from_segments(3, segs);
        assert!(CompactionPicker::new(settings()).pick(&version).is_none());
    }

    #[test]
    fn test_overwritten_entries_count_as_dead() {
        let dir = tempfile::tempdir().unwrap();
        let keys: Vec<String> = (0..10).map(|i| format!("k{}", i)).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let segs = vec![
            make(dir.path(), 1, 1, &refs, 0, 20),
            make(dir.path(), 2, 2, &["a", "b"], 0, 5),
        ];
        let version = Version::from_segments(3, segs);
        let picker = CompactionPicker::new(settings());
        assert!(picker.pick(&version).is_none());

        // Three of ten entries overwritten by newer flushes
        let version = version.with_shadowed([(1, 3)]);
        let job = picker.pick(&version).unwrap();
        assert_eq!(job.reason, CompactionReason::DeadEntries { segment: 1 });
        assert_eq!(job.target_level, 2);
        assert_eq!(job.input_ids(), vec![1]);
    }

    #[test]
    fn test_level0_segments_not_picked_for_dead_entries() {
        let dir = tempfile::tempdir().unwrap();
        let segs = vec![
            make(dir.path(), 1, 0, &["a", "b"], 2, 20),
            make(dir.path(), 2, 2, &["a", "z"], 0, 5),
        ];
        let version = Version::from_segments(3, segs);
        assert!(CompactionPicker::new(settings()).pick(&version).is_none());
    }

    #[test]
    fn test_level_budget_grows_by_fanout() {
        let s = settings();
        let picker = CompactionPicker::new(s.clone());
        assert_eq!(picker.level_budget(1), s.level1_bytes);
        assert_eq!(
            picker.level_budget(2),
            s.level1_bytes * s.level_fanout as u64
        );
    }
}
