use crate::error::LockinError;

/// An ordered table of hardware-quantized values (sensitivity full scales,
/// filter time constants) indexed by the register code that selects them.
///
/// Values are strictly monotonic. Time-constant tables increase with index on
/// both supported models; sensitivity tables increase on the SR830 and
/// decrease on the SR860.
#[derive(Debug, Clone, Copy)]
pub struct Ladder {
    values: &'static [f64],
}

impl Ladder {
    /// Wrap a value table. The table must hold at least two strictly
    /// monotonic entries; the register tables in this crate satisfy that by
    /// construction.
    pub fn new(values: &'static [f64]) -> Self {
        debug_assert!(values.len() >= 2);
        debug_assert!(
            values.windows(2).all(|w| w[0] < w[1]) || values.windows(2).all(|w| w[0] > w[1]),
            "ladder values must be strictly monotonic"
        );
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        self.values
    }

    pub fn is_increasing(&self) -> bool {
        self.values[0] < self.values[self.values.len() - 1]
    }

    /// Value selected by `index`.
    ///
    /// # Errors
    /// `IndexOutOfRange` if `index` is negative or past the end of the table.
    pub fn value_at(&self, index: i32) -> Result<f64, LockinError> {
        if index < 0 || index as usize >= self.values.len() {
            return Err(LockinError::IndexOutOfRange {
                index,
                len: self.values.len(),
            });
        }
        Ok(self.values[index as usize])
    }

    /// Index of the smallest table value that is at least `target`: the
    /// tightest quantization of `target` from above. Works for increasing
    /// and decreasing tables.
    ///
    /// # Errors
    /// `QuantizationLimit` if `target` exceeds every value in the table.
    pub fn smallest_at_least(&self, target: f64) -> Result<usize, LockinError> {
        let mut best: Option<(usize, f64)> = None;
        for (i, &value) in self.values.iter().enumerate() {
            if value >= target && best.is_none_or(|(_, b)| value < b) {
                best = Some((i, value));
            }
        }
        match best {
            Some((i, _)) => Ok(i),
            None => Err(LockinError::QuantizationLimit {
                requested: target,
                available: self.max_value(),
            }),
        }
    }

    /// Saturate `index` into the valid register range, mirroring what the
    /// hardware does when a step command runs off the end of the table.
    pub fn clamp_index(&self, index: i32) -> i32 {
        index.clamp(0, self.values.len() as i32 - 1)
    }

    fn max_value(&self) -> f64 {
        if self.is_increasing() {
            self.values[self.values.len() - 1]
        } else {
            self.values[0]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INCREASING: [f64; 6] = [1e-3, 3e-3, 1e-2, 3e-2, 1e-1, 3e-1];
    const DECREASING: [f64; 5] = [1.0, 5e-1, 2e-1, 1e-1, 5e-2];

    #[test]
    fn value_at_checks_bounds() {
        let ladder = Ladder::new(&INCREASING);
        assert_eq!(ladder.value_at(0).unwrap(), 1e-3);
        assert_eq!(ladder.value_at(5).unwrap(), 3e-1);
        assert!(matches!(
            ladder.value_at(-1),
            Err(LockinError::IndexOutOfRange { index: -1, len: 6 })
        ));
        assert!(matches!(
            ladder.value_at(6),
            Err(LockinError::IndexOutOfRange { index: 6, len: 6 })
        ));
    }

    #[test]
    fn smallest_at_least_on_increasing_ladder() {
        let ladder = Ladder::new(&INCREASING);
        // Between two entries: pick the next one up.
        assert_eq!(ladder.smallest_at_least(2e-3).unwrap(), 1);
        // Exactly on an entry: pick that entry, not the next.
        assert_eq!(ladder.smallest_at_least(1e-2).unwrap(), 2);
        // Below the whole table: the smallest entry wins.
        assert_eq!(ladder.smallest_at_least(1e-6).unwrap(), 0);
    }

    #[test]
    fn smallest_at_least_on_decreasing_ladder() {
        let ladder = Ladder::new(&DECREASING);
        // Tightest fit from above sits at the high-index (small-value) end.
        assert_eq!(ladder.smallest_at_least(6e-2).unwrap(), 3);
        assert_eq!(ladder.smallest_at_least(1e-1).unwrap(), 3);
        assert_eq!(ladder.smallest_at_least(1e-3).unwrap(), 4);
        assert_eq!(ladder.smallest_at_least(0.7).unwrap(), 0);
    }

    #[test]
    fn smallest_at_least_is_minimal() {
        // The returned value must be >= target and every other value that is
        // >= target must be larger.
        let ladder = Ladder::new(&INCREASING);
        for target in [5e-4, 1e-3, 2e-3, 9e-3, 1.5e-2, 2.9e-1] {
            let i = ladder.smallest_at_least(target).unwrap();
            let chosen = ladder.value_at(i as i32).unwrap();
            assert!(chosen >= target);
            for &other in ladder.values() {
                if other >= target {
                    assert!(other >= chosen);
                }
            }
        }
    }

    #[test]
    fn smallest_at_least_fails_past_the_top() {
        let ladder = Ladder::new(&INCREASING);
        match ladder.smallest_at_least(1.0) {
            Err(LockinError::QuantizationLimit {
                requested,
                available,
            }) => {
                assert_eq!(requested, 1.0);
                assert_eq!(available, 3e-1);
            }
            other => panic!("expected QuantizationLimit, got {other:?}"),
        }

        let ladder = Ladder::new(&DECREASING);
        assert!(matches!(
            ladder.smallest_at_least(2.0),
            Err(LockinError::QuantizationLimit { .. })
        ));
    }

    #[test]
    fn clamp_index_saturates_at_both_ends() {
        let ladder = Ladder::new(&DECREASING);
        assert_eq!(ladder.clamp_index(-3), 0);
        assert_eq!(ladder.clamp_index(2), 2);
        assert_eq!(ladder.clamp_index(17), 4);
    }
}
