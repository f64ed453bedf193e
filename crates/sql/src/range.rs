use crate::Constant;

/// A closed, open, or unbounded interval over values of a single type.
///
/// An invalid range (low above high) is representable on purpose: index
/// searches treat it as "matches nothing" rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantRange {
    low: Option<Constant>,
    low_inclusive: bool,
    high: Option<Constant>,
    high_inclusive: bool,
}

impl ConstantRange {
    pub fn new(
        low: Option<Constant>,
        low_inclusive: bool,
        high: Option<Constant>,
        high_inclusive: bool,
    ) -> Self {
        Self {
            low,
            low_inclusive,
            high,
            high_inclusive,
        }
    }

    /// The range `[value, value]` matching exactly one key.
    pub fn exact(value: Constant) -> Self {
        Self {
            low: Some(value.clone()),
            low_inclusive: true,
            high: Some(value),
            high_inclusive: true,
        }
    }

    /// The range matching every key.
    pub fn unbounded() -> Self {
        Self {
            low: None,
            low_inclusive: true,
            high: None,
            high_inclusive: true,
        }
    }

    /// At least `low`, unbounded above.
    pub fn at_least(low: Constant) -> Self {
        Self {
            low: Some(low),
            low_inclusive: true,
            high: None,
            high_inclusive: true,
        }
    }

    /// At most `high`, unbounded below.
    pub fn at_most(high: Constant) -> Self {
        Self {
            low: None,
            low_inclusive: true,
            high: Some(high),
            high_inclusive: true,
        }
    }

    /// A range is valid when some key can satisfy it.
    pub fn is_valid(&self) -> bool {
        match (&self.low, &self.high) {
            (Some(low), Some(high)) => {
                low < high || (low == high && self.low_inclusive && self.high_inclusive)
            }
            _ => true,
        }
    }

    pub fn has_lower_bound(&self) -> bool {
        self.low.is_some()
    }

    pub fn has_upper_bound(&self) -> bool {
        self.high.is_some()
    }

    pub fn low(&self) -> Option<&Constant> {
        self.low.as_ref()
    }

    pub fn high(&self) -> Option<&Constant> {
        self.high.as_ref()
    }

    pub fn contains(&self, value: &Constant) -> bool {
        let above_low = match &self.low {
            None => true,
            Some(low) => value > low || (self.low_inclusive && value == low),
        };
        let below_high = match &self.high {
            None => true,
            Some(high) => value < high || (self.high_inclusive && value == high),
        };
        above_low && below_high
    }

    /// True when `value` lies past the upper bound, i.e. a scan in key order
    /// can stop once it sees such a value.
    pub fn is_beyond_high(&self, value: &Constant) -> bool {
        match &self.high {
            None => false,
            Some(high) => value > high || (!self.high_inclusive && value == high),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i32) -> Constant {
        Constant::Integer(v)
    }

    #[test]
    fn exact_range_contains_only_its_key() {
        let range = ConstantRange::exact(int(7));
        assert!(range.is_valid());
        assert!(range.contains(&int(7)));
        assert!(!range.contains(&int(6)));
        assert!(range.is_beyond_high(&int(8)));
        assert!(!range.is_beyond_high(&int(7)));
    }

    #[test]
    fn inverted_range_is_invalid() {
        let range = ConstantRange::new(Some(int(10)), true, Some(int(5)), true);
        assert!(!range.is_valid());
    }

    #[test]
    fn half_open_endpoints() {
        let range = ConstantRange::new(Some(int(1)), false, Some(int(3)), false);
        assert!(range.is_valid());
        assert!(!range.contains(&int(1)));
        assert!(range.contains(&int(2)));
        assert!(!range.contains(&int(3)));
        assert!(range.is_beyond_high(&int(3)));
    }

    #[test]
    fn equal_endpoints_with_exclusive_side_are_invalid() {
        let range = ConstantRange::new(Some(int(4)), true, Some(int(4)), false);
        assert!(!range.is_valid());
    }

    #[test]
    fn unbounded_contains_everything() {
        let range = ConstantRange::unbounded();
        assert!(range.is_valid());
        assert!(range.contains(&int(i32::MIN)));
        assert!(range.contains(&int(i32::MAX)));
        assert!(!range.is_beyond_high(&int(i32::MAX)));
    }
}
