use std::sync::Arc;

use crate::{
    merger::MergeState,
    pool::Pool,
    BufferPool, Computed, Computer, Config, Merger, Pooled, Registry, Result,
    Value,
};

/// Reuse counters for the pools behind an `Engine`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Computers handed out from the idle pool.
    pub computers_reused: u64,
    /// Computers built because none were idle.
    pub computers_built: u64,
    /// Mergers handed out from the idle pool.
    pub mergers_reused: u64,
    /// Mergers built because none were idle.
    pub mergers_built: u64,
    /// Buffers handed out from the buffer pool.
    pub buffers_reused: u64,
    /// Buffers freshly allocated.
    pub buffers_allocated: u64,
}

/// The entry point for resolving merge operands.
///
/// An `Engine` owns the operator registry and every pool that
/// `Computer`s, `Merger`s and encoded buffers are drawn from. It is
/// cheap to clone, and clones share everything.
///
/// # Examples
///
/// ```
/// use stackfold::{builtin, Config, Engine, Operand, Registry, Value};
///
/// let registry = Registry::new(vec![builtin::concat()])?;
/// let engine = Engine::new(Config::default(), registry)?;
///
/// let out = engine.eval(&[
///     Value::full(b"ab"),
///     Value::stack(vec![Operand::new("concat", &b"cd"[..])]),
/// ])?;
/// assert_eq!(out.full(), Some(&b"abcd"[..]));
/// # Ok::<(), stackfold::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: Config,
    registry: Arc<Registry>,
    buffers: BufferPool,
    computers: Pool<Computer>,
    mergers: Pool<MergeState>,
}

impl Engine {
    /// Validates `config` and builds an engine around `registry`.
    pub fn new(config: Config, registry: Registry) -> Result<Engine> {
        config.validate()?;

        let buffers = BufferPool::new(
            config.max_buffers_per_class,
            config.max_pooled_buffer_size,
        );

        log::debug!(
            "starting engine with {} operators and {:?}",
            registry.len(),
            config
        );

        Ok(Engine {
            inner: Arc::new(Inner {
                computers: Pool::new(config.max_pooled_instances),
                mergers: Pool::new(config.max_pooled_instances),
                registry: Arc::new(registry),
                buffers,
                config,
            }),
        })
    }

    /// The operators this engine resolves.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// The pool that results and encoded values are drawn from.
    pub fn buffers(&self) -> &BufferPool {
        &self.inner.buffers
    }

    /// The configuration this engine was built with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Checks out a `Computer`. It goes back to the pool when dropped.
    pub fn computer(&self) -> Pooled<Computer> {
        self.inner.computers.checkout(|| {
            log::trace!("no idle computer, building one");
            Computer::new(
                self.inner.registry.clone(),
                self.inner.buffers.clone(),
                &self.inner.config,
            )
        })
    }

    /// Hands out an empty `Merger` for one key.
    pub fn merger(&self) -> Merger {
        let state = self.inner.mergers.checkout(|| {
            log::trace!("no idle merger, building one");
            MergeState::new(
                self.inner.config.scratch_capacity,
                self.inner.config.max_pooled_buffer_size,
            )
        });
        Merger::new(state, self.clone())
    }

    /// Folds Stack values onto a Full base. See `Computer::eval`.
    pub fn eval(&self, values: &[Value<'_>]) -> Result<Computed> {
        self.computer().eval(values)
    }

    /// Pre-reduces Stack values. See `Computer::combine`.
    pub fn combine(&self, values: &[Value<'_>]) -> Result<Computed> {
        self.computer().combine(values)
    }

    /// Resolves a Stack from its first operator's zero. See
    /// `Computer::resolve`.
    pub fn resolve(&self, value: &Value<'_>) -> Result<Computed> {
        self.computer().resolve(value)
    }

    /// A snapshot of how often pooled resources were reused.
    pub fn stats(&self) -> Stats {
        let (computers_reused, computers_built) =
            self.inner.computers.counters();
        let (mergers_reused, mergers_built) = self.inner.mergers.counters();
        let (buffers_reused, buffers_allocated) = self.inner.buffers.counters();

        Stats {
            computers_reused,
            computers_built,
            mergers_reused,
            mergers_built,
            buffers_reused,
            buffers_allocated,
        }
    }
}
