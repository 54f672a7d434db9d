//! Progress aggregation.
//!
//! The overall scale is split into three ranges: connect and download take
//! 0-30%, the multi-file transfer 30-90%, and the reset/finalize step
//! 90-100%.

use crate::loader::WriteProgress;

/// Progress once the chip handshake has started.
pub const CHIP_INIT_PERCENT: f64 = 10.0;
/// Progress once the chip handshake succeeded.
pub const PREPARE_PERCENT: f64 = 20.0;
/// Start of the transfer range.
pub const TRANSFER_START_PERCENT: f64 = 30.0;
/// End of the transfer range.
pub const TRANSFER_END_PERCENT: f64 = 90.0;
pub const COMPLETE_PERCENT: f64 = 100.0;

const TRANSFER_SPAN: f64 = TRANSFER_END_PERCENT - TRANSFER_START_PERCENT;

/// Map one per-file write callback onto the overall 30-90% transfer range.
///
/// A file with `total_bytes == 0` counts as fully written.
pub fn aggregate(
    file_index: usize,
    bytes_written: u64,
    total_bytes: u64,
    total_files: usize,
) -> f64 {
    let files = total_files.max(1) as f64;
    let fraction = if total_bytes == 0 {
        1.0
    } else {
        bytes_written.min(total_bytes) as f64 / total_bytes as f64
    };

    let overall = TRANSFER_START_PERCENT + TRANSFER_SPAN * (file_index as f64 + fraction) / files;
    overall.clamp(TRANSFER_START_PERCENT, TRANSFER_END_PERCENT)
}

/// Percentage of the current file, for status messages.
pub fn file_percent(bytes_written: u64, total_bytes: u64) -> u8 {
    if total_bytes == 0 {
        return 100;
    }
    ((bytes_written.min(total_bytes) * 100) / total_bytes) as u8
}

/// "Flashing part 2/3 (45%)..."
pub fn part_message(update: &WriteProgress, total_files: usize) -> String {
    format!(
        "Flashing part {}/{} ({}%)...",
        update.file_index + 1,
        total_files,
        file_percent(update.written, update.total)
    )
}

/// Stateful aggregator that keeps a high-water mark, so late or reordered
/// callbacks from the loader can never move the bar backwards.
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    total_files: usize,
    high_water: f64,
}

impl ProgressAggregator {
    pub fn new(total_files: usize) -> Self {
        Self {
            total_files,
            high_water: TRANSFER_START_PERCENT,
        }
    }

    /// Fold one loader callback in and return the overall percentage.
    pub fn update(&mut self, progress: WriteProgress) -> f64 {
        let percent = aggregate(
            progress.file_index,
            progress.written,
            progress.total,
            self.total_files,
        );
        self.high_water = self.high_water.max(percent);
        self.high_water
    }

    pub fn percent(&self) -> f64 {
        self.high_water
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wp(file_index: usize, written: u64, total: u64) -> WriteProgress {
        WriteProgress {
            file_index,
            written,
            total,
        }
    }

    #[test]
    fn test_bounds() {
        for files in 1..=4 {
            for index in 0..files {
                for written in [0, 1, 50, 99, 100] {
                    let p = aggregate(index, written, 100, files);
                    assert!((TRANSFER_START_PERCENT..=TRANSFER_END_PERCENT).contains(&p));
                }
            }
        }
    }

    #[test]
    fn test_monotonic_within_file() {
        let mut last = 0.0;
        for written in (0..=4096).step_by(256) {
            let p = aggregate(1, written, 4096, 3);
            assert!(p >= last);
            last = p;
        }
    }

    #[test]
    fn test_no_regression_across_file_boundary() {
        let end_of_first = aggregate(0, 100, 100, 3);
        let start_of_second = aggregate(1, 0, 5000, 3);
        assert!(start_of_second >= end_of_first);
        assert_eq!(end_of_first, 50.0);
    }

    #[test]
    fn test_three_file_sequence() {
        assert_eq!(aggregate(0, 0, 100, 3), 30.0);
        assert_eq!(aggregate(1, 0, 100, 3), 50.0);
        assert_eq!(aggregate(2, 100, 100, 3), 90.0);
    }

    #[test]
    fn test_clamped_at_transfer_end() {
        assert_eq!(aggregate(5, 100, 100, 3), TRANSFER_END_PERCENT);
        assert_eq!(aggregate(0, 500, 100, 1), TRANSFER_END_PERCENT);
    }

    #[test]
    fn test_empty_file_counts_as_written() {
        assert_eq!(aggregate(0, 0, 0, 2), 60.0);
        assert_eq!(file_percent(0, 0), 100);
    }

    #[test]
    fn test_aggregator_keeps_high_water() {
        let mut agg = ProgressAggregator::new(3);
        assert_eq!(agg.update(wp(1, 50, 100)), 60.0);
        // A stale callback for the first file must not pull the bar back.
        assert_eq!(agg.update(wp(0, 100, 100)), 60.0);
        assert_eq!(agg.update(wp(2, 100, 100)), 90.0);
        assert_eq!(agg.percent(), 90.0);
    }

    #[test]
    fn test_part_message() {
        assert_eq!(part_message(&wp(1, 45, 100), 3), "Flashing part 2/3 (45%)...");
    }
}
