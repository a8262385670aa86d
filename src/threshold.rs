//! Change-ratio guard for destructive steps.

/// Result of one threshold evaluation, kept for logging and batch messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdCheck {
    pub total: u64,
    pub planned: u64,
    pub limit_percent: Option<u32>,
    pub allow: bool,
}

impl ThresholdCheck {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.planned as f64 * 100.0 / self.total as f64
        }
    }
}

/// Allows `planned` changes out of `total` unless that exceeds
/// `limit_percent`. No limit means always allow. An empty scope is allowed
/// since there is nothing to lose.
pub fn check(total: u64, planned: u64, limit_percent: Option<u32>) -> ThresholdCheck {
    let allow = match limit_percent {
        None => true,
        Some(_) if total == 0 || planned == 0 => true,
        // planned / total * 100 > limit, in integers.
        Some(limit) => (planned as u128) * 100 <= (limit as u128) * (total as u128),
    };
    ThresholdCheck {
        total,
        planned,
        limit_percent,
        allow,
    }
}

/// Size ratio used to decide whether a file is similar enough to diff:
/// `|1 - current/previous| * 100 > limit`. A previous size of zero always
/// counts as exceeding unless the current file is empty too.
pub fn file_size_change_exceeds(current: u64, previous: u64, limit_percent: u32) -> bool {
    if previous == 0 {
        return current != 0;
    }
    let diff = current.abs_diff(previous) as u128;
    diff * 100 > (limit_percent as u128) * (previous as u128)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_when_ratio_exceeds_limit() {
        // 20 of 200 is 10%.
        assert!(!check(200, 20, Some(5)).allow);
        assert!(check(200, 20, Some(10)).allow);
        assert!(check(200, 20, None).allow);
        assert!((check(200, 20, Some(5)).percent() - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_scope_and_zero_limit() {
        assert!(check(0, 0, Some(0)).allow);
        assert!(check(10, 0, Some(0)).allow);
        assert!(!check(10, 1, Some(0)).allow);
    }

    #[test]
    fn monotonic_in_planned_changes() {
        for total in [1u64, 7, 100, 1000] {
            for limit in [0u32, 1, 5, 33, 50, 100] {
                let mut blocked = false;
                for planned in 0..=total {
                    let allow = check(total, planned, Some(limit)).allow;
                    if blocked {
                        assert!(
                            !allow,
                            "total={total} limit={limit} planned={planned} re-allowed"
                        );
                    }
                    blocked |= !allow;
                }
            }
        }
    }

    #[test]
    fn file_size_ratio() {
        assert!(!file_size_change_exceeds(1000, 1000, 0));
        assert!(!file_size_change_exceeds(1050, 1000, 5));
        assert!(file_size_change_exceeds(1051, 1000, 5));
        assert!(file_size_change_exceeds(949, 1000, 5));
        assert!(file_size_change_exceeds(10, 0, 50));
        assert!(!file_size_change_exceeds(0, 0, 50));
    }
}
