//! Runtime options for the guarded sampling allocator.
//!
//! Reading the environment allocates, so options are built once at process
//! start and handed to [`GuardedAlloc::init`](crate::GuardedAlloc::init);
//! nothing here runs on the allocation path.

use std::env;
use std::str::FromStr;

use thiserror::Error;

pub const ENV_SAMPLE_RATE: &str = "MEMFACADE_SAMPLE_RATE";
pub const ENV_GUARDED_SLOTS: &str = "MEMFACADE_GUARDED_SLOTS";
pub const ENV_GUARDED_MAX_PAGES: &str = "MEMFACADE_GUARDED_MAX_PAGES";
pub const ENV_HANDLE_SEGV: &str = "MEMFACADE_HANDLE_SEGV";

/// Upper bound on pool slots; slot metadata is a fixed array.
pub const MAX_SLOTS: usize = 1024;

/// Upper bound on the slot size in pages.
pub const MAX_ALLOC_PAGES: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("sample probability must be within [0, 1], got {0}")]
    Probability(f64),
    #[error("guarded slots must be within [1, {MAX_SLOTS}], got {0}")]
    Slots(usize),
    #[error("guarded slot size must be within [1, {MAX_ALLOC_PAGES}] pages, got {0}")]
    MaxPages(usize),
    #[error("invalid value {value:?} for {var}")]
    Parse { var: &'static str, value: String },
}

/// Options for [`GuardedAlloc`](crate::GuardedAlloc).
///
/// # Examples
///
/// ```rust
/// use memfacade::SamplingOptions;
///
/// let options = SamplingOptions::new()
///     .sample_probability(0.001)
///     .slots(64)
///     .handle_segv(true);
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingOptions {
    pub(crate) sample_probability: f64,
    pub(crate) slots: usize,
    pub(crate) max_alloc_pages: usize,
    pub(crate) left_align_probability: f64,
    pub(crate) handle_segv: bool,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl SamplingOptions {
    pub const fn new() -> Self {
        Self {
            sample_probability: 0.0001,
            slots: 64,
            max_alloc_pages: 1,
            left_align_probability: 0.0,
            handle_segv: false,
        }
    }

    /// Probability that any single allocation is sampled. 0 disables
    /// sampling, 1 samples every allocation.
    ///
    /// Default: `0.0001`
    pub fn sample_probability(mut self, probability: f64) -> Self {
        self.sample_probability = probability;
        self
    }

    /// Number of guarded slots, i.e. how many sampled allocations can be live
    /// at once.
    ///
    /// Default: `64`
    pub fn slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }

    /// Slot size in pages, at most [`MAX_ALLOC_PAGES`]; larger sampled
    /// requests fall through to the backend.
    ///
    /// Default: `1`
    pub fn max_alloc_pages(mut self, pages: usize) -> Self {
        self.max_alloc_pages = pages;
        self
    }

    /// Fraction of sampled allocations placed against the left guard page
    /// instead of the right one, to catch underflows.
    ///
    /// Default: `0.0`
    pub fn left_align_probability(mut self, probability: f64) -> Self {
        self.left_align_probability = probability;
        self
    }

    /// Install a SIGSEGV handler that describes faults inside the pool.
    ///
    /// Default: `false`
    pub fn handle_segv(mut self, enabled: bool) -> Self {
        self.handle_segv = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_probability(self.sample_probability)?;
        check_probability(self.left_align_probability)?;
        if self.slots == 0 || self.slots > MAX_SLOTS {
            return Err(ConfigError::Slots(self.slots));
        }
        if self.max_alloc_pages == 0 || self.max_alloc_pages > MAX_ALLOC_PAGES {
            return Err(ConfigError::MaxPages(self.max_alloc_pages));
        }
        Ok(())
    }

    /// Reads overrides from `MEMFACADE_*` variables on top of the defaults.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        let mut options = Self::new();
        if let Some(rate) = parse_var::<f64>(ENV_SAMPLE_RATE)? {
            options.sample_probability = rate;
        }
        if let Some(slots) = parse_var::<usize>(ENV_GUARDED_SLOTS)? {
            options.slots = slots;
        }
        if let Some(pages) = parse_var::<usize>(ENV_GUARDED_MAX_PAGES)? {
            options.max_alloc_pages = pages;
        }
        if let Ok(value) = env::var(ENV_HANDLE_SEGV) {
            options.handle_segv = value.eq_ignore_ascii_case("true") || value == "1";
        }
        options.validate()?;
        Ok(options)
    }

    /// Like [`try_from_env`](Self::try_from_env), keeping the defaults when
    /// the environment is invalid.
    pub fn from_env() -> Self {
        Self::try_from_env().unwrap_or_default()
    }
}

fn check_probability(p: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(ConfigError::Probability(p))
    }
}

fn parse_var<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse { var, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(SamplingOptions::new().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        assert_eq!(
            SamplingOptions::new().sample_probability(1.5).validate(),
            Err(ConfigError::Probability(1.5))
        );
        assert_eq!(
            SamplingOptions::new().slots(0).validate(),
            Err(ConfigError::Slots(0))
        );
        assert_eq!(
            SamplingOptions::new().slots(MAX_SLOTS + 1).validate(),
            Err(ConfigError::Slots(MAX_SLOTS + 1))
        );
        assert_eq!(
            SamplingOptions::new().max_alloc_pages(0).validate(),
            Err(ConfigError::MaxPages(0))
        );
        assert_eq!(
            SamplingOptions::new().max_alloc_pages(usize::MAX / 2).validate(),
            Err(ConfigError::MaxPages(usize::MAX / 2))
        );
        assert_eq!(
            SamplingOptions::new().max_alloc_pages(MAX_ALLOC_PAGES).validate(),
            Ok(())
        );
        assert!(SamplingOptions::new()
            .sample_probability(f64::NAN)
            .validate()
            .is_err());
    }

    // Single test touching the environment so parallel tests don't race on it.
    #[test]
    fn test_from_env() {
        env::set_var(ENV_SAMPLE_RATE, "0.5");
        env::set_var(ENV_GUARDED_SLOTS, "8");
        env::set_var(ENV_HANDLE_SEGV, "1");
        let options = SamplingOptions::try_from_env().unwrap();
        assert_eq!(options.sample_probability, 0.5);
        assert_eq!(options.slots, 8);
        assert!(options.handle_segv);

        env::set_var(ENV_GUARDED_SLOTS, "many");
        assert_eq!(
            SamplingOptions::try_from_env(),
            Err(ConfigError::Parse {
                var: ENV_GUARDED_SLOTS,
                value: "many".to_string()
            })
        );
        assert_eq!(SamplingOptions::from_env(), SamplingOptions::new());

        env::remove_var(ENV_SAMPLE_RATE);
        env::remove_var(ENV_GUARDED_SLOTS);
        env::remove_var(ENV_HANDLE_SEGV);
    }
}
