use std::mem;
use std::ops::Range;

use inline_array::InlineArray;

use crate::{
    computer::recycle, pool::Reset, Engine, Error, Kind, Pooled, Result, Value,
};

/// The callback shape a storage engine drives when several value
/// versions exist for one key.
///
/// Blobs may arrive newest-first, oldest-first, or a mix of both.
/// `finish` consumes the merger and returns one encoded `Value`.
pub trait ValueMerger {
    /// The resolved, encoded value.
    type Output;

    /// Accumulates `blob` as newer than everything seen so far.
    fn merge_newer(&mut self, blob: &[u8]) -> Result<()>;

    /// Accumulates `blob` as older than everything seen so far.
    fn merge_older(&mut self, blob: &[u8]) -> Result<()>;

    /// Resolves everything accumulated into a single encoded value.
    fn finish(self) -> Result<Self::Output>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Unset,
    OldestFirst,
    NewestFirst,
}

/// The reusable part of a `Merger`.
#[derive(Debug)]
pub(crate) struct MergeState {
    // every accumulated blob, back to back, in arrival order
    arena: Vec<u8>,
    // one span of `arena` per blob, ordered by `direction`
    spans: Vec<Range<usize>>,
    direction: Direction,
    values: Vec<Value<'static>>,
    scratch_capacity: usize,
    // arena bytes kept across resets
    max_arena: usize,
}

impl MergeState {
    pub(crate) fn new(scratch_capacity: usize, max_arena: usize) -> MergeState {
        MergeState {
            arena: vec![],
            spans: Vec::with_capacity(scratch_capacity),
            direction: Direction::Unset,
            values: Vec::with_capacity(scratch_capacity),
            scratch_capacity,
            max_arena,
        }
    }

    fn push(&mut self, blob: &[u8], direction: Direction) {
        if self.direction != direction {
            if self.direction != Direction::Unset {
                log::trace!(
                    "merger flipping {} spans to {:?}",
                    self.spans.len(),
                    direction
                );
                self.spans.reverse();
            }
            self.direction = direction;
        }

        let start = self.arena.len();
        self.arena.extend_from_slice(blob);
        self.spans.push(start..self.arena.len());
    }
}

impl Reset for MergeState {
    fn reset(&mut self) {
        self.direction = Direction::Unset;
        self.arena.clear();
        self.arena.shrink_to(self.max_arena);
        self.spans.clear();
        self.spans.shrink_to(self.scratch_capacity);
        self.values.clear();
        self.values.shrink_to(self.scratch_capacity);
    }
}

/// Accumulates the raw encoded values of one key and resolves them
/// into a single canonical value.
///
/// Obtained from `Engine::merger`. Blobs are copied in, so the caller
/// may reuse its buffers right away. Whether `finish` succeeds or not,
/// the merger's state is reset and returned to the engine's pool.
///
/// # Examples
///
/// ```
/// use stackfold::{builtin, Config, Engine, Operand, Registry, Value};
///
/// let registry = Registry::from_instructions([builtin::instruction()])?;
/// let engine = Engine::new(Config::default(), registry)?;
///
/// let base = Value::full(b"40").encode(None)?;
/// let delta = Value::stack(vec![Operand::new("increment", &b"2"[..])]).encode(None)?;
///
/// let mut merger = engine.merger();
/// merger.merge_newer(&delta)?;
/// merger.merge_older(&base)?;
/// let merged = merger.finish()?;
///
/// assert_eq!(Value::decode(&merged, false)?, Value::full(b"42"));
/// # Ok::<(), stackfold::Error>(())
/// ```
#[derive(Debug)]
pub struct Merger {
    state: Pooled<MergeState>,
    engine: Engine,
}

impl Merger {
    pub(crate) fn new(state: Pooled<MergeState>, engine: Engine) -> Merger {
        Merger { state, engine }
    }

    /// Accumulates `blob` as newer than everything seen so far.
    ///
    /// Blobs are not decoded until `finish`.
    pub fn merge_newer(&mut self, blob: &[u8]) -> Result<()> {
        self.state.push(blob, Direction::OldestFirst);
        Ok(())
    }

    /// Accumulates `blob` as older than everything seen so far.
    pub fn merge_older(&mut self, blob: &[u8]) -> Result<()> {
        self.state.push(blob, Direction::NewestFirst);
        Ok(())
    }

    /// The number of blobs accumulated so far.
    pub fn len(&self) -> usize {
        self.state.spans.len()
    }

    /// Returns true if nothing has been accumulated.
    pub fn is_empty(&self) -> bool {
        self.state.spans.is_empty()
    }

    /// Decodes every accumulated blob, oldest first, and resolves them.
    ///
    /// If the oldest value is Full, the rest are folded onto it and a
    /// Full value is returned. If it is a Stack, every value is combined
    /// and a Stack value is returned. A Full value anywhere but the
    /// oldest position fails with `Error::Integrity`.
    pub fn finish(mut self) -> Result<InlineArray> {
        let state = &mut *self.state;

        // `merge_older` appends too, so its order is newest first
        if state.direction == Direction::NewestFirst {
            state.spans.reverse();
            state.direction = Direction::OldestFirst;
        }

        let mut values = recycle(mem::take(&mut state.values));
        let ret = resolve(&self.engine, &state.arena, &state.spans, &mut values);
        state.values = recycle(values);

        ret
    }
}

impl ValueMerger for Merger {
    type Output = InlineArray;

    fn merge_newer(&mut self, blob: &[u8]) -> Result<()> {
        Merger::merge_newer(self, blob)
    }

    fn merge_older(&mut self, blob: &[u8]) -> Result<()> {
        Merger::merge_older(self, blob)
    }

    fn finish(self) -> Result<InlineArray> {
        Merger::finish(self)
    }
}

fn resolve<'a>(
    engine: &Engine,
    arena: &'a [u8],
    spans: &[Range<usize>],
    values: &mut Vec<Value<'a>>,
) -> Result<InlineArray> {
    for span in spans {
        values.push(Value::decode(&arena[span.clone()], false)?);
    }

    supported!(!values.is_empty(), "finish called before any value was merged");

    if let Some(idx) = values[1..].iter().position(|v| v.kind() == Kind::Full) {
        return Err(Error::Integrity(format!(
            "value {} of {} is Full but only the oldest value may be",
            idx + 2,
            values.len()
        )));
    }

    let buffers = engine.buffers();

    if values.len() == 1 && values[0].kind() == Kind::Full {
        let encoded = values[0].encode(Some(buffers))?;
        return Ok(InlineArray::from(&*encoded));
    }

    let mut computer = engine.computer();
    let computed = match values[0].kind() {
        Kind::Full => computer.eval(values)?,
        Kind::Stack => computer.combine(values)?,
    };

    let encoded = computed.into_encoded(Some(buffers))?;
    Ok(InlineArray::from(&*encoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{builtin, Config, Operand, Registry};

    fn engine() -> Engine {
        let registry = Registry::from_instructions([builtin::instruction()]).unwrap();
        Engine::new(Config::default(), registry).unwrap()
    }

    fn blob(value: Value<'_>) -> Vec<u8> {
        value.encode(None).unwrap().into_vec()
    }

    fn add(n: &'static str) -> Vec<u8> {
        blob(Value::stack(vec![Operand::new(builtin::INCREMENT, n.as_bytes())]))
    }

    #[test]
    fn direction_flips_reverse_once() {
        let mut state = MergeState::new(4, 1024);
        state.push(b"b", Direction::OldestFirst);
        state.push(b"c", Direction::OldestFirst);
        state.push(b"a", Direction::NewestFirst);

        let order: Vec<&[u8]> =
            state.spans.iter().map(|span| &state.arena[span.clone()]).collect();
        assert_eq!(order, vec![b"c".as_slice(), b"b", b"a"]);
        assert_eq!(state.direction, Direction::NewestFirst);

        state.reset();
        assert!(state.arena.is_empty());
        assert!(state.spans.is_empty());
        assert_eq!(state.direction, Direction::Unset);
    }

    #[test]
    fn mixed_directions_resolve_oldest_first() {
        let engine = engine();
        let mut merger = engine.merger();
        merger.merge_newer(&add("2")).unwrap();
        merger.merge_older(&blob(Value::full(b"10"))).unwrap();
        merger.merge_newer(&add("3")).unwrap();
        assert_eq!(merger.len(), 3);

        let merged = merger.finish().unwrap();
        assert_eq!(Value::decode(&merged, false).unwrap(), Value::full(b"15"));
    }

    #[test]
    fn lone_values_round_trip() {
        let engine = engine();

        let full = blob(Value::full(b"hello"));
        let mut merger = engine.merger();
        merger.merge_newer(&full).unwrap();
        assert_eq!(&*merger.finish().unwrap(), full.as_slice());

        let stack = add("1");
        let mut merger = engine.merger();
        merger.merge_older(&stack).unwrap();
        assert_eq!(&*merger.finish().unwrap(), stack.as_slice());
    }

    #[test]
    fn stacks_only_are_combined() {
        let engine = engine();
        let mut merger = engine.merger();
        merger.merge_older(&add("1")).unwrap();
        merger.merge_older(&add("2")).unwrap();

        let merged = merger.finish().unwrap();
        assert_eq!(
            Value::decode(&merged, false).unwrap(),
            Value::stack(vec![Operand::new(builtin::INCREMENT, &b"3"[..])])
        );
    }

    #[test]
    fn newer_full_values_are_an_integrity_error() {
        let engine = engine();
        let mut merger = engine.merger();
        merger.merge_older(&add("1")).unwrap();
        merger.merge_newer(&blob(Value::full(b"7"))).unwrap();
        assert!(matches!(merger.finish(), Err(Error::Integrity(_))));

        let mut merger = engine.merger();
        merger.merge_older(&blob(Value::full(b"7"))).unwrap();
        merger.merge_older(&blob(Value::full(b"8"))).unwrap();
        assert!(matches!(merger.finish(), Err(Error::Integrity(_))));
    }

    #[test]
    fn reset_bounds_the_arena() {
        let mut state = MergeState::new(4, 1024);
        state.push(&vec![7; 1 << 16], Direction::OldestFirst);
        assert!(state.arena.capacity() >= 1 << 16);

        state.reset();
        assert!(state.arena.is_empty());
        assert!(state.arena.capacity() <= 1024);
    }

    #[test]
    #[cfg(not(feature = "disable-pooling"))]
    fn idle_mergers_do_not_keep_large_arenas() {
        let registry = Registry::from_instructions([builtin::instruction()]).unwrap();
        let config = Config::default().max_pooled_buffer_size(4096);
        let engine = Engine::new(config, registry).unwrap();

        let big = blob(Value::Full(vec![1u8; 1 << 20].into()));
        let mut merger = engine.merger();
        merger.merge_newer(&big).unwrap();
        assert_eq!(merger.finish().unwrap().len(), big.len());

        let merger = engine.merger();
        assert_eq!(engine.stats().mergers_reused, 1);
        assert!(merger.is_empty());
        assert!(merger.state.arena.capacity() <= 4096);
    }

    #[test]
    fn empty_and_corrupt_input() {
        let engine = engine();
        assert!(matches!(
            engine.merger().finish(),
            Err(Error::Unsupported(_))
        ));

        let mut merger = engine.merger();
        merger.merge_newer(&[1, 9]).unwrap();
        assert!(matches!(merger.finish(), Err(Error::Corruption { .. })));
    }
}
