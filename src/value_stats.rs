use medians::Medianf64;
use rolling_stats;
use statistical;

/// Summary of a series of values. Median fields are only maintained for
/// the recent window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DescriptiveStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: Option<f64>,
    pub median_absolute_deviation: Option<f64>,
}

/// Tracks statistics of a value (e.g. relative alignment error) over the
/// most recent `capacity` samples and over the whole session.
pub struct ValueStatsAccumulator {
    recent: DescriptiveStats,
    session: DescriptiveStats,

    // State for `recent`.
    circular_buffer: CircularBuffer,

    // State for `session`.
    rolling_stats: rolling_stats::Stats<f64>,
}

impl ValueStatsAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: DescriptiveStats::default(),
            session: DescriptiveStats::default(),
            circular_buffer: CircularBuffer::new(capacity.max(1)),
            rolling_stats: rolling_stats::Stats::<f64>::new(),
        }
    }

    pub fn recent(&self) -> &DescriptiveStats {
        &self.recent
    }

    pub fn session(&self) -> &DescriptiveStats {
        &self.session
    }

    pub fn add_value(&mut self, value: f64) {
        self.circular_buffer.push(value);
        self.rolling_stats.update(value);

        let recent_values = self.circular_buffer.unordered_contents();
        let recent_stats = &mut self.recent;
        recent_stats.count = recent_values.len();
        recent_stats.min = recent_values.iter().copied().fold(f64::INFINITY, f64::min);
        recent_stats.max =
            recent_values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        recent_stats.mean = statistical::mean(recent_values);
        if recent_values.len() > 1 {
            recent_stats.stddev = statistical::standard_deviation(
                recent_values, Some(recent_stats.mean));
        }
        let median = recent_values.medf_unchecked();
        recent_stats.median = Some(median);
        recent_stats.median_absolute_deviation = Some(recent_values.madf(median));

        let session_stats = &mut self.session;
        session_stats.count += 1;
        session_stats.min = self.rolling_stats.min;
        session_stats.max = self.rolling_stats.max;
        session_stats.mean = self.rolling_stats.mean;
        session_stats.stddev = self.rolling_stats.std_dev;
        // No median or median_absolute_deviation for session_stats.
    }

    pub fn reset_session(&mut self) {
        self.session = DescriptiveStats::default();
        self.rolling_stats = rolling_stats::Stats::<f64>::new();
    }
}

// We use a Vec<f64> to implement a ring buffer. We don't use VecDeque or
// similar because we want a view of all elements as a single slice, and we
// don't care about their order.
#[derive(Debug)]
struct CircularBuffer {
    start: usize,
    data: Vec<f64>,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            start: 0,
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, item: f64) {
        if self.data.len() < self.data.capacity() {
            self.data.push(item);
        } else {
            self.data[self.start] = item;
            self.start += 1;
            self.start %= self.data.capacity();
        }
    }

    pub fn unordered_contents(&self) -> &[f64] {
        self.data.as_slice()
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;

    #[test]
    fn test_circular_buffer() {
        let mut cb = CircularBuffer::new(2);
        assert_eq!(cb.unordered_contents(), &[] as &[f64]);
        cb.push(0.25);
        cb.push(0.5);
        cb.push(0.75);
        assert_eq!(cb.unordered_contents(), [0.75, 0.5]);
    }

    #[test]
    fn test_alignment_error_stats() {
        let mut stats = ValueStatsAccumulator::new(3);
        assert_eq!(*stats.recent(), DescriptiveStats::default());

        for error in [0.1, 0.3, 0.8, 0.2] {
            stats.add_value(error);
        }
        // Recent window holds the last three.
        let recent = stats.recent();
        assert_eq!(recent.count, 3);
        assert_eq!(recent.min, 0.2);
        assert_eq!(recent.max, 0.8);
        assert_abs_diff_eq!(recent.mean, 0.4333, epsilon = 0.001);
        assert_eq!(recent.median, Some(0.3));
        assert_abs_diff_eq!(recent.median_absolute_deviation.unwrap(), 0.1,
                            epsilon = 1e-9);

        let session = stats.session();
        assert_eq!(session.count, 4);
        assert_eq!(session.min, 0.1);
        assert_eq!(session.max, 0.8);
        assert_abs_diff_eq!(session.mean, 0.35, epsilon = 1e-9);
        assert_eq!(session.median, None);

        stats.reset_session();
        assert_eq!(*stats.session(), DescriptiveStats::default());
        assert_eq!(stats.recent().count, 3);
    }

}  // mod tests.
