use std::mem;
use std::sync::Arc;

use crate::{
    codec::{poo_operand, poo_stack_header, stack_header_size},
    pool::Reset,
    Buf, BufferPool, Config, Error, Kind, Operator, Registry, Result, Value,
};

// scratch bytes retained per operand of scratch capacity
const BODY_BYTES_PER_OPERAND: usize = 32;

/// Empties `v` and changes the lifetime carried by its element type.
/// Collecting from the emptied iterator reuses the allocation in place.
pub(crate) fn recycle<T, U>(mut v: Vec<T>) -> Vec<U> {
    v.clear();
    v.into_iter().map(|_| -> U { unreachable!() }).collect()
}

/// The result of a `Computer` call, holding the buffer that backs it.
///
/// For a Full result the buffer holds the resolved payload. For a
/// Stack result it holds the complete encoded Stack value. Dropping
/// or releasing a `Computed` releases the buffer.
#[derive(Debug)]
pub struct Computed {
    kind: Kind,
    buf: Buf,
}

impl Computed {
    /// Whether this is a Full or Stack result.
    pub const fn kind(&self) -> Kind {
        self.kind
    }

    /// Borrows the result as a `Value`.
    pub fn value(&self) -> Result<Value<'_>> {
        match self.kind {
            Kind::Full => Ok(Value::full(&self.buf)),
            Kind::Stack => Value::decode(&self.buf, false),
        }
    }

    /// The resolved payload of a Full result, or `None` for a Stack
    /// result.
    pub fn full(&self) -> Option<&[u8]> {
        match self.kind {
            Kind::Full => Some(&*self.buf),
            Kind::Stack => None,
        }
    }

    /// Serializes the result as a `Value` into a new buffer.
    pub fn encode(&self, pool: Option<&BufferPool>) -> Result<Buf> {
        match (self.kind, pool) {
            (Kind::Full, _) => Value::full(&self.buf).encode(pool),
            (Kind::Stack, Some(pool)) => Ok(pool.copy_from(&self.buf)),
            (Kind::Stack, None) => Ok(Buf::copy_from(&self.buf)),
        }
    }

    /// Serializes the result as a `Value`, releasing the buffer that
    /// backed it. A Stack result is already encoded and is returned
    /// without copying.
    pub fn into_encoded(self, pool: Option<&BufferPool>) -> Result<Buf> {
        match self.kind {
            Kind::Stack => Ok(self.buf),
            Kind::Full => Value::full(&self.buf).encode(pool),
        }
    }

    /// Gives up the backing buffer without interpreting it.
    pub fn into_buf(self) -> Buf {
        self.buf
    }

    /// Releases the backing buffer. Idempotent.
    pub fn release(&mut self) {
        self.buf.release();
    }
}

/// A reusable engine that combines, evaluates and resolves runs of
/// merge operands.
///
/// A `Computer` serves one top-level call at a time and keeps only
/// scratch space between calls. It is usually checked out of an
/// `Engine`, which resets it and takes it back afterwards.
#[derive(Debug)]
pub struct Computer {
    registry: Arc<Registry>,
    pool: BufferPool,
    scratch_capacity: usize,
    // (name, payload) of every operand, in application order
    flat: Vec<(&'static str, &'static [u8])>,
    // payloads of the run currently being handled
    run: Vec<&'static [u8]>,
    // operands of a Stack result, before its header is known
    body: Vec<u8>,
}

impl Reset for Computer {
    fn reset(&mut self) {
        self.flat.clear();
        self.flat.shrink_to(self.scratch_capacity);
        self.run.clear();
        self.run.shrink_to(self.scratch_capacity);
        self.body.clear();
        self.body.shrink_to(self.scratch_capacity * BODY_BYTES_PER_OPERAND);
    }
}

impl Computer {
    /// Creates a `Computer` with scratch space sized by `config`.
    pub fn new(
        registry: Arc<Registry>,
        pool: BufferPool,
        config: &Config,
    ) -> Computer {
        let scratch_capacity = config.scratch_capacity;
        Computer {
            registry,
            pool,
            scratch_capacity,
            flat: Vec::with_capacity(scratch_capacity),
            run: Vec::with_capacity(scratch_capacity),
            body: Vec::with_capacity(scratch_capacity * BODY_BYTES_PER_OPERAND),
        }
    }

    /// Pre-reduces Stack values without a base.
    ///
    /// The operands of every value are concatenated in order, then each
    /// contiguous run sharing an operator name is replaced by the single
    /// operand its `combine` produces. Runs of operators without
    /// `combine` are kept as they are. Returns a Stack result.
    pub fn combine(&mut self, values: &[Value<'_>]) -> Result<Computed> {
        self.with_scratch(|registry, pool, flat, run, body| {
            flatten(values, flat)?;
            reduce(registry, pool, flat, run, body)
        })
    }

    /// Folds Stack values onto a Full base value.
    ///
    /// `values[0]` must be Full and every later value must be a Stack.
    /// Each contiguous run of one operator is applied to the base with
    /// a single `apply` call, oldest run first. Returns a Full result.
    pub fn eval(&mut self, values: &[Value<'_>]) -> Result<Computed> {
        supported!(
            values.len() >= 2,
            "eval requires a Full base followed by at least one Stack"
        );

        let base = match &values[0] {
            Value::Full(bytes) => &**bytes,
            Value::Stack(_) => {
                return Err(Error::UnexpectedKind {
                    expected: Kind::Full,
                    found: Kind::Stack,
                });
            }
        };

        self.with_scratch(|registry, pool, flat, run, _| {
            flatten(&values[1..], flat)?;
            fold(registry, pool, base, flat, run)
        })
    }

    /// Resolves a Stack value with no base, starting from the `zero`
    /// of the operator named by its first operand.
    pub fn resolve(&mut self, value: &Value<'_>) -> Result<Computed> {
        let Value::Stack(stack) = value else {
            return Err(Error::UnexpectedKind {
                expected: Kind::Stack,
                found: Kind::Full,
            });
        };

        let Some(first) = stack.operands.first() else {
            return Err(Error::Unsupported(
                "resolve requires at least one operand".to_owned(),
            ));
        };

        let registry = self.registry.clone();
        let zero = registry.lookup(&first.name)?.zero();

        self.with_scratch(|registry, pool, flat, run, _| {
            flatten(std::slice::from_ref(value), flat)?;
            fold(registry, pool, zero, flat, run)
        })
    }

    fn with_scratch<'a, T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(
            &Registry,
            &BufferPool,
            &mut Vec<(&'a str, &'a [u8])>,
            &mut Vec<&'a [u8]>,
            &mut Vec<u8>,
        ) -> Result<T>,
    {
        let mut flat = recycle(mem::take(&mut self.flat));
        let mut run = recycle(mem::take(&mut self.run));

        let ret = f(&*self.registry, &self.pool, &mut flat, &mut run, &mut self.body);

        self.flat = recycle(flat);
        self.run = recycle(run);

        ret
    }
}

/// Concatenates the operands of Stack values, in order.
fn flatten<'a>(
    values: &'a [Value<'_>],
    flat: &mut Vec<(&'a str, &'a [u8])>,
) -> Result<()> {
    for value in values {
        let Value::Stack(stack) = value else {
            return Err(Error::UnexpectedKind {
                expected: Kind::Stack,
                found: Kind::Full,
            });
        };
        flat.extend(
            stack.operands.iter().map(|op| (&*op.name, &*op.payload)),
        );
    }
    Ok(())
}

/// Scans `flat` once, left to right, handing each maximal run of one
/// operator name to `handle` along with that operator. Two runs of the
/// same name separated by another operator are handled separately.
///
/// Stops at the first unregistered name or `handle` error.
fn pipeline<'a, F>(
    registry: &Registry,
    flat: &[(&'a str, &'a [u8])],
    run: &mut Vec<&'a [u8]>,
    mut handle: F,
) -> Result<()>
where
    F: FnMut(&Operator, &[&'a [u8]]) -> Result<()>,
{
    let mut groups = 0;
    let mut idx = 0;

    while idx < flat.len() {
        let name = flat[idx].0;

        run.clear();
        while idx < flat.len() && flat[idx].0 == name {
            run.push(flat[idx].1);
            idx += 1;
        }

        let operator = registry.lookup(name)?;
        handle(operator, run)?;
        groups += 1;
    }

    log::trace!(
        "pipeline grouped {} operands into {} runs",
        flat.len(),
        groups
    );

    Ok(())
}

fn fold<'a>(
    registry: &Registry,
    pool: &BufferPool,
    base: &[u8],
    flat: &[(&'a str, &'a [u8])],
    run: &mut Vec<&'a [u8]>,
) -> Result<Computed> {
    // `base` belongs to the caller and is never released here. Only
    // buffers produced by `apply` are.
    let mut acc: Option<Buf> = None;

    pipeline(registry, flat, run, |operator, operands| {
        let next = operator.apply(acc.as_deref().unwrap_or(base), operands, pool)?;
        if let Some(mut previous) = acc.replace(next) {
            previous.release();
        }
        Ok(())
    })?;

    let buf = match acc {
        Some(buf) => buf,
        None => pool.copy_from(base),
    };

    Ok(Computed { kind: Kind::Full, buf })
}

fn reduce<'a>(
    registry: &Registry,
    pool: &BufferPool,
    flat: &[(&'a str, &'a [u8])],
    run: &mut Vec<&'a [u8]>,
    body: &mut Vec<u8>,
) -> Result<Computed> {
    body.clear();
    let mut count = 0;

    pipeline(registry, flat, run, |operator, operands| {
        let name = operator.name();
        match operator.combine(operands, pool) {
            None => {
                for payload in operands {
                    poo_operand(name, payload, body);
                }
                count += operands.len();
            }
            Some(combined) => {
                let mut reduced = combined?;
                poo_operand(name, &reduced, body);
                reduced.release();
                count += 1;
            }
        }
        Ok(())
    })?;

    let mut buf = pool.borrow(stack_header_size(count) + body.len());
    let out = buf.as_mut_vec();
    poo_stack_header(count, out);
    out.extend_from_slice(body);

    Ok(Computed { kind: Kind::Stack, buf })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{builtin, Operand};

    // records each run it is handed as "<name>(<payloads>)"
    fn tracer(name: &'static str) -> Arc<Operator> {
        Arc::new(Operator::new(name, vec![], move |base, operands, pool| {
            let mut buf = pool.copy_from(base);
            let out = buf.as_mut_vec();
            out.extend_from_slice(name.as_bytes());
            out.push(b'(');
            for operand in operands {
                out.extend_from_slice(operand);
            }
            out.push(b')');
            Ok(buf)
        }))
    }

    fn computer() -> Computer {
        let registry = Registry::new(vec![
            tracer("A"),
            tracer("B"),
            builtin::increment(),
            builtin::concat(),
        ])
        .unwrap();
        Computer::new(Arc::new(registry), BufferPool::default(), &Config::default())
    }

    fn op(name: &'static str, payload: &'static str) -> Operand<'static> {
        Operand::new(name, payload.as_bytes())
    }

    // replaces the base with the newest operand
    fn set() -> Arc<Operator> {
        Arc::new(Operator::new("set", vec![], |_base, operands, pool| {
            Ok(pool.copy_from(operands.last().copied().unwrap_or_default()))
        }))
    }

    fn computer_on(pool: &BufferPool) -> Computer {
        let registry =
            Registry::new(vec![set(), builtin::increment(), builtin::concat()])
                .unwrap();
        Computer::new(Arc::new(registry), pool.clone(), &Config::default())
    }

    #[test]
    #[cfg(not(feature = "disable-pooling"))]
    fn combined_operands_are_released_once_copied() {
        let pool = BufferPool::new(32, 1 << 20);
        let mut computer = computer_on(&pool);

        let operands = (0..50)
            .flat_map(|_| [op("concat", "x"), op("increment", "1")])
            .collect();
        let out = computer.combine(&[Value::stack(operands)]).unwrap();
        let size = out.value().unwrap().serialized_size();
        assert_eq!(out.into_buf().len(), size);

        // one small buffer serves all 100 runs, plus the output
        assert_eq!(pool.counters(), (99, 2));
    }

    #[test]
    #[cfg(not(feature = "disable-pooling"))]
    fn replaced_bases_are_released_during_eval() {
        let pool = BufferPool::new(32, 1 << 20);
        let mut computer = computer_on(&pool);

        let operands = (0..50)
            .flat_map(|_| [op("set", "5"), op("increment", "1")])
            .collect();
        let out = computer
            .eval(&[Value::full(b"0"), Value::stack(operands)])
            .unwrap();
        assert_eq!(out.full().unwrap(), b"6");

        // the current and previous accumulators alternate
        assert_eq!(pool.counters(), (98, 2));
    }

    #[test]
    #[cfg(not(feature = "disable-pooling"))]
    fn accumulators_are_released_when_apply_fails() {
        let pool = BufferPool::new(32, 1 << 20);
        let mut computer = computer_on(&pool);

        let stack = Value::stack(vec![
            op("set", "1"),
            op("increment", "1"),
            op("set", "2"),
            op("increment", "x"),
        ]);
        let err = computer.eval(&[Value::full(b"0"), stack]).unwrap_err();
        assert!(matches!(err, Error::Operator { .. }));
        assert_eq!(pool.counters(), (1, 2));

        // both buffers the failed fold allocated are idle again
        let _a = pool.borrow(1);
        let _b = pool.borrow(1);
        assert_eq!(pool.counters(), (3, 2));
        let _c = pool.borrow(1);
        assert_eq!(pool.counters(), (3, 3));
    }

    #[test]
    fn runs_are_contiguous_only() {
        let mut computer = computer();
        let stack = Value::stack(vec![
            op("A", "1"),
            op("A", "2"),
            op("B", "3"),
            op("A", "4"),
        ]);
        let out = computer.eval(&[Value::full(b""), stack]).unwrap();
        assert_eq!(out.full().unwrap(), b"A(12)B(3)A(4)");
    }

    #[test]
    fn split_invariance() {
        let mut computer = computer();
        let split = computer
            .eval(&[
                Value::full(b"7"),
                Value::stack(vec![op("increment", "1"), op("increment", "2")]),
                Value::stack(vec![op("increment", "3")]),
            ])
            .unwrap();
        let joined = computer
            .eval(&[
                Value::full(b"7"),
                Value::stack(vec![
                    op("increment", "1"),
                    op("increment", "2"),
                    op("increment", "3"),
                ]),
            ])
            .unwrap();
        assert_eq!(split.full(), joined.full());
        assert_eq!(split.full().unwrap(), b"13");
    }

    #[test]
    fn combine_reduces_runs_with_combine() {
        let mut computer = computer();
        let out = computer
            .combine(&[
                Value::stack(vec![op("increment", "1"), op("increment", "2")]),
                Value::stack(vec![op("A", "x"), op("A", "y"), op("increment", "5")]),
            ])
            .unwrap();
        assert_eq!(out.kind(), Kind::Stack);
        assert_eq!(
            out.value().unwrap(),
            Value::stack(vec![
                op("increment", "3"),
                op("A", "x"),
                op("A", "y"),
                op("increment", "5"),
            ])
        );
    }

    #[test]
    fn combine_of_nothing_is_an_empty_stack() {
        let mut computer = computer();
        let out = computer.combine(&[Value::stack(vec![])]).unwrap();
        assert_eq!(out.value().unwrap(), Value::stack(vec![]));
    }

    #[test]
    fn eval_with_empty_stacks_returns_the_base() {
        let mut computer = computer();
        let out = computer
            .eval(&[Value::full(b"base"), Value::stack(vec![])])
            .unwrap();
        assert_eq!(out.full().unwrap(), b"base");
    }

    #[test]
    fn resolve_starts_from_zero() {
        let mut computer = computer();
        let out = computer
            .resolve(&Value::stack(vec![op("increment", "5")]))
            .unwrap();
        assert_eq!(out.value().unwrap(), Value::full(b"5"));
    }

    #[test]
    fn argument_errors() {
        let mut computer = computer();
        assert!(matches!(
            computer.eval(&[Value::full(b"0")]),
            Err(Error::Unsupported(_))
        ));
        assert_eq!(
            computer
                .eval(&[Value::stack(vec![]), Value::stack(vec![])])
                .unwrap_err(),
            Error::UnexpectedKind { expected: Kind::Full, found: Kind::Stack }
        );
        assert_eq!(
            computer
                .eval(&[Value::full(b"0"), Value::full(b"1")])
                .unwrap_err(),
            Error::UnexpectedKind { expected: Kind::Stack, found: Kind::Full }
        );
        assert_eq!(
            computer.combine(&[Value::full(b"0")]).unwrap_err(),
            Error::UnexpectedKind { expected: Kind::Stack, found: Kind::Full }
        );
        assert!(matches!(
            computer.resolve(&Value::stack(vec![])),
            Err(Error::Unsupported(_))
        ));
        assert_eq!(
            computer.resolve(&Value::stack(vec![op("nope", "1")])).unwrap_err(),
            Error::UnregisteredOperator("nope".into())
        );
    }

    #[test]
    fn unregistered_operators_abort_the_scan() {
        let mut computer = computer();
        let values = [
            Value::full(b""),
            Value::stack(vec![op("A", "1"), op("missing", "2"), op("B", "3")]),
        ];
        assert_eq!(
            computer.eval(&values).unwrap_err(),
            Error::UnregisteredOperator("missing".into())
        );
        assert_eq!(
            computer.combine(&values[1..]).unwrap_err(),
            Error::UnregisteredOperator("missing".into())
        );
    }

    #[test]
    fn scratch_grows_past_capacity_and_shrinks_on_reset() {
        let registry = Arc::new(Registry::new(vec![builtin::increment()]).unwrap());
        let config = Config::default().scratch_capacity(4);
        let mut computer = Computer::new(registry, BufferPool::default(), &config);

        let operands = (0..100).map(|_| op("increment", "1")).collect();
        let out = computer
            .eval(&[Value::full(b"0"), Value::stack(operands)])
            .unwrap();
        assert_eq!(out.full().unwrap(), b"100");

        computer.reset();
        assert!(computer.flat.capacity() <= 4);
        assert!(computer.flat.is_empty());
        assert!(computer.run.is_empty());
        assert!(computer.body.is_empty());
    }
}
