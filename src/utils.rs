use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Error type for polling operations
#[derive(Debug)]
pub enum PollError<E> {
    /// Operation timed out
    Timeout,
    /// Cancellation flag was raised while waiting
    Cancelled,
    /// Error occurred in the condition/operation function
    ConditionError(E),
}

impl<E> std::fmt::Display for PollError<E>
where
    E: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Timeout => write!(f, "Operation timed out"),
            PollError::Cancelled => write!(f, "Operation cancelled"),
            PollError::ConditionError(e) => write!(f, "Condition error: {}", e),
        }
    }
}

impl<E> std::error::Error for PollError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Timeout | PollError::Cancelled => None,
            PollError::ConditionError(e) => Some(e),
        }
    }
}

/// Granularity of cancellable sleeps. Coarse enough to stay off the bus,
/// fine enough that Ctrl+C feels immediate.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Sleep for `duration`, waking early if `cancel` is raised.
///
/// Returns `true` if the full duration elapsed, `false` on cancellation.
pub fn sleep_cancellable(duration: Duration, cancel: Option<&AtomicBool>) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if let Some(flag) = cancel {
            if flag.load(Ordering::SeqCst) {
                return false;
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

/// Poll a condition until it holds `required` times in a row.
///
/// A single `Ok(false)` resets the consecutive count to zero, so an
/// intermittently-true condition (a phase lock that drops in and out) must
/// prove itself stable over the whole window before this returns.
///
/// # Arguments
/// * `condition` - Returns `Ok(true)` while the condition holds
/// * `required` - Number of consecutive `Ok(true)` results needed
/// * `poll_interval` - Sleep between checks
/// * `timeout` - Optional cap on total wait time
/// * `cancel` - Optional cancellation flag checked before every poll
///
/// # Returns
/// * `Ok(())` once the condition has held `required` consecutive times
/// * `Err(PollError::Timeout)` if `timeout` elapses first
/// * `Err(PollError::Cancelled)` if the flag is raised while waiting
/// * `Err(PollError::ConditionError(e))` if the condition itself fails
pub fn poll_consecutive<F, E>(
    mut condition: F,
    required: usize,
    poll_interval: Duration,
    timeout: Option<Duration>,
    cancel: Option<&AtomicBool>,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Result<bool, E>,
{
    let start = Instant::now();
    let mut consecutive = 0;

    while consecutive < required {
        if let Some(flag) = cancel {
            if flag.load(Ordering::SeqCst) {
                return Err(PollError::Cancelled);
            }
        }
        if let Some(timeout) = timeout {
            if start.elapsed() >= timeout {
                return Err(PollError::Timeout);
            }
        }

        match condition() {
            Ok(true) => consecutive += 1,
            Ok(false) => consecutive = 0,
            Err(e) => return Err(PollError::ConditionError(e)),
        }

        if consecutive < required {
            std::thread::sleep(poll_interval);
        }
    }

    Ok(())
}

/// `count` logarithmically spaced values from `start` to `stop` inclusive.
///
/// Both endpoints must be positive. `count == 1` yields just `start`.
pub fn logspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    if count == 0 {
        return Vec::new();
    }
    if count == 1 {
        return vec![start];
    }
    let lg_start = start.log10();
    let lg_stop = stop.log10();
    let step = (lg_stop - lg_start) / (count - 1) as f64;
    (0..count)
        .map(|i| 10f64.powf(lg_start + step * i as f64))
        .collect()
}

/// `count` linearly spaced values from `start` to `stop` inclusive.
///
/// `count == 1` yields just `start`.
pub fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    if count == 0 {
        return Vec::new();
    }
    if count == 1 {
        return vec![start];
    }
    let step = (stop - start) / (count - 1) as f64;
    (0..count).map(|i| start + step * i as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_poll_consecutive_success() {
        let calls = AtomicUsize::new(0);

        let result = poll_consecutive(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<bool, &str>(true)
            },
            3,
            Duration::from_millis(1),
            None,
            None,
        );

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_poll_consecutive_resets_on_false() {
        // true, true, false, then true forever: the false in the middle must
        // force three fresh consecutive successes.
        let calls = AtomicUsize::new(0);

        let result = poll_consecutive(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok::<bool, &str>(n != 2)
            },
            3,
            Duration::from_millis(1),
            None,
            None,
        );

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_poll_consecutive_timeout() {
        let result = poll_consecutive(
            || Ok::<bool, &str>(false), // Never holds
            5,
            Duration::from_millis(5),
            Some(Duration::from_millis(40)),
            None,
        );

        assert!(matches!(result, Err(PollError::Timeout)));
    }

    #[test]
    fn test_poll_consecutive_cancelled() {
        let cancel = AtomicBool::new(true);

        let result = poll_consecutive(
            || Ok::<bool, &str>(true),
            3,
            Duration::from_millis(1),
            None,
            Some(&cancel),
        );

        assert!(matches!(result, Err(PollError::Cancelled)));
    }

    #[test]
    fn test_poll_consecutive_error() {
        let result = poll_consecutive(
            || Err::<bool, &str>("test error"),
            3,
            Duration::from_millis(1),
            None,
            None,
        );

        assert!(matches!(result, Err(PollError::ConditionError("test error"))));
    }

    #[test]
    fn test_sleep_cancellable_completes() {
        let start = Instant::now();
        assert!(sleep_cancellable(Duration::from_millis(20), None));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_sleep_cancellable_aborts() {
        let cancel = AtomicBool::new(true);
        let start = Instant::now();
        assert!(!sleep_cancellable(Duration::from_secs(10), Some(&cancel)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_logspace_endpoints_and_spacing() {
        let values = logspace(10.0, 1000.0, 3);
        assert_eq!(values.len(), 3);
        assert!((values[0] - 10.0).abs() < 1e-9);
        assert!((values[1] - 100.0).abs() < 1e-9);
        assert!((values[2] - 1000.0).abs() < 1e-9);

        assert_eq!(logspace(1.0, 2.0, 1), vec![1.0]);
        assert!(logspace(1.0, 2.0, 0).is_empty());
    }

    #[test]
    fn test_linspace_endpoints_and_spacing() {
        let values = linspace(0.0, 1.0, 5);
        assert_eq!(values, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(linspace(3.0, 9.0, 1), vec![3.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }
}
