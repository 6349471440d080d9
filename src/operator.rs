use std::fmt;
use std::sync::Arc;

use fnv::FnvHashMap;

use crate::{Buf, BufferPool, Error, Result};

/// Folds a run of operand payloads onto a base value.
///
/// The returned buffer may be borrowed from the supplied pool. The
/// engine releases it once the next fold no longer needs it.
pub type ApplyFn =
    dyn Fn(&[u8], &[&[u8]], &BufferPool) -> Result<Buf> + Send + Sync;

/// Reduces a run of operand payloads into a single payload, without
/// knowing the base value they will eventually be applied to.
pub type CombineFn = dyn Fn(&[&[u8]], &BufferPool) -> Result<Buf> + Send + Sync;

/// Pluggable merge logic for one operator name.
///
/// Operators must be deterministic, since every replica evaluates the
/// same operands independently. When `combine` is provided it must
/// agree with `apply`: for every base and run of operands,
/// `apply(base, [combine(run)])` equals `apply(base, run)`, because the
/// engine is free to take either path.
///
/// # Examples
///
/// ```
/// use stackfold::Operator;
///
/// let max = Operator::new("max", vec![0], |base, operands, pool| {
///     let top = operands.iter().flat_map(|op| op.iter()).chain(base).max();
///     Ok(pool.copy_from(&[top.copied().unwrap_or(0)]))
/// });
/// assert_eq!(max.name(), "max");
/// assert!(!max.has_combine());
/// ```
pub struct Operator {
    name: String,
    zero: Vec<u8>,
    apply: Box<ApplyFn>,
    combine: Option<Box<CombineFn>>,
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("name", &self.name)
            .field("zero", &self.zero)
            .field("combine", &self.has_combine())
            .finish()
    }
}

impl Operator {
    /// Creates an operator with only an `apply` function.
    pub fn new<N, Z, A>(name: N, zero: Z, apply: A) -> Operator
    where
        N: Into<String>,
        Z: Into<Vec<u8>>,
        A: Fn(&[u8], &[&[u8]], &BufferPool) -> Result<Buf>
            + Send
            + Sync
            + 'static,
    {
        Operator {
            name: name.into(),
            zero: zero.into(),
            apply: Box::new(apply),
            combine: None,
        }
    }

    /// Adds a `combine` function for pre-reducing operand runs.
    pub fn with_combine<C>(mut self, combine: C) -> Operator
    where
        C: Fn(&[&[u8]], &BufferPool) -> Result<Buf> + Send + Sync + 'static,
    {
        self.combine = Some(Box::new(combine));
        self
    }

    /// The unique name operands use to refer to this operator.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The base used when no Full value exists yet.
    pub fn zero(&self) -> &[u8] {
        &self.zero
    }

    /// Returns true if runs of this operator can be pre-reduced.
    pub const fn has_combine(&self) -> bool {
        self.combine.is_some()
    }

    /// Folds `operands` onto `base`.
    pub fn apply(
        &self,
        base: &[u8],
        operands: &[&[u8]],
        pool: &BufferPool,
    ) -> Result<Buf> {
        (self.apply)(base, operands, pool)
    }

    /// Reduces `operands` into one payload, or returns `None` if this
    /// operator has no `combine` function.
    pub fn combine(
        &self,
        operands: &[&[u8]],
        pool: &BufferPool,
    ) -> Option<Result<Buf>> {
        self.combine.as_ref().map(|combine| combine(operands, pool))
    }
}

/// Something the host application declares that may bring its own
/// merge operators along.
pub trait Instruction {
    /// The operators this instruction needs registered. Most
    /// instructions need none.
    fn operators(&self) -> Vec<Arc<Operator>> {
        vec![]
    }
}

/// An immutable table from operator name to `Operator`.
///
/// Built once before use. Lookups take `&self` only, so a `Registry`
/// may be shared across threads without synchronization.
#[derive(Default, Debug)]
pub struct Registry {
    operators: FnvHashMap<String, Arc<Operator>>,
}

impl Registry {
    /// Builds a registry from a set of operators.
    ///
    /// The same `Arc<Operator>` may appear more than once. Two
    /// distinct operators sharing a name fail with
    /// `Error::DuplicateOperator`.
    pub fn new<I>(operators: I) -> Result<Registry>
    where
        I: IntoIterator<Item = Arc<Operator>>,
    {
        let mut map: FnvHashMap<String, Arc<Operator>> = FnvHashMap::default();

        for operator in operators {
            if operator.name.is_empty() {
                return Err(Error::Validation(
                    "operators must have a non-empty name".to_owned(),
                ));
            }
            if let Some(existing) = map.get(&operator.name) {
                if Arc::ptr_eq(existing, &operator) {
                    continue;
                }
                return Err(Error::DuplicateOperator(operator.name.clone()));
            }
            map.insert(operator.name.clone(), operator);
        }

        log::debug!("built operator registry with {} operators", map.len());

        Ok(Registry { operators: map })
    }

    /// Builds a registry from every operator declared by `instructions`.
    pub fn from_instructions<'a, I>(instructions: I) -> Result<Registry>
    where
        I: IntoIterator<Item = &'a dyn Instruction>,
    {
        Registry::new(
            instructions.into_iter().flat_map(|instruction| instruction.operators()),
        )
    }

    /// Looks up an operator by name.
    pub fn get(&self, name: &str) -> Option<&Operator> {
        self.operators.get(name).map(|operator| &**operator)
    }

    /// Looks up an operator by name, failing with
    /// `Error::UnregisteredOperator` if it is absent.
    pub fn lookup(&self, name: &str) -> Result<&Operator> {
        self.get(name)
            .ok_or_else(|| Error::UnregisteredOperator(name.to_owned()))
    }

    /// The number of registered operators.
    pub fn len(&self) -> usize {
        self.operators.len()
    }

    /// Returns true if no operators are registered.
    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// The registered operator names, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.operators.keys().map(String::as_str)
    }
}
