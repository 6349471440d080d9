use serde::{Deserialize, Serialize};

use crate::{pool::SIZE_CLASSES, Result};

macro_rules! builder {
    ($(($name:ident, $t:ty, $desc:expr)),*) => {
        $(
            #[doc=$desc]
            pub fn $name(mut self, to: $t) -> Config {
                self.$name = to;
                self
            }
        )*
    }
}

/// Tuning knobs for the pools backing an `Engine`.
///
/// None of these affect the result of any operation, only how
/// much memory is retained between calls.
///
/// # Examples
///
/// ```
/// let _config = stackfold::Config::default()
///     .scratch_capacity(4096)
///     .max_pooled_instances(16)
///     .max_buffers_per_class(8);
/// ```
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[doc(hidden)]
    pub scratch_capacity: usize,
    #[doc(hidden)]
    pub max_pooled_instances: usize,
    #[doc(hidden)]
    pub max_buffers_per_class: usize,
    #[doc(hidden)]
    pub max_pooled_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            scratch_capacity: 1000,
            max_pooled_instances: 64,
            max_buffers_per_class: 32,
            max_pooled_buffer_size: 1024 * 1024, // 1mb
        }
    }
}

impl Config {
    builder!(
        (
            scratch_capacity,
            usize,
            "number of operands a Computer or Merger holds before growing its scratch space"
        ),
        (
            max_pooled_instances,
            usize,
            "maximum number of idle Computers, and of idle Mergers, kept for reuse"
        ),
        (
            max_buffers_per_class,
            usize,
            "maximum number of idle buffers kept for each size class"
        ),
        (
            max_pooled_buffer_size,
            usize,
            "largest buffer capacity that is returned to the pool on release, and the most arena bytes an idle Merger keeps"
        )
    );

    /// Checks that the configured values can back an `Engine`.
    pub fn validate(&self) -> Result<()> {
        supported!(
            self.scratch_capacity > 0,
            "scratch_capacity must be greater than zero"
        );
        supported!(
            self.max_pooled_buffer_size >= SIZE_CLASSES[0],
            format!(
                "max_pooled_buffer_size must be at least {} bytes",
                SIZE_CLASSES[0]
            )
        );
        Ok(())
    }
}
