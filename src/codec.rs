//! The tagged wire encoding shared by every replica.
//!
//! ```text
//! Value = [version: u8][kind: u8][tail]
//!   Full  tail = payload bytes, to the end of the buffer
//!   Stack tail = [version: u8][count: varint]{name: varstring, payload: varbytes}*
//! ```
//!
//! Every length and count is an unsigned varint. The encoding is
//! canonical, so replicas that apply the same operations produce
//! byte-identical values.

use std::borrow::Cow;
use std::ops::ControlFlow;

use crate::{varint, Buf, BufferPool, Error, Result};

/// Version byte written at the front of every value.
pub const VALUE_VERSION: u8 = 1;

/// Version byte written at the front of every stack tail.
pub const STACK_VERSION: u8 = 1;

/// The discriminant of a `Value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// A fully resolved value.
    Full = 1,
    /// A run of operands not yet folded into a Full value.
    Stack = 2,
}

impl TryFrom<u8> for Kind {
    type Error = u8;

    fn try_from(byte: u8) -> std::result::Result<Kind, u8> {
        match byte {
            1 => Ok(Kind::Full),
            2 => Ok(Kind::Stack),
            other => Err(other),
        }
    }
}

/// A single named update awaiting application to a base value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Operand<'a> {
    /// The name of the operator that interprets `payload`.
    pub name: Cow<'a, str>,
    /// Operator-specific bytes.
    pub payload: Cow<'a, [u8]>,
}

impl<'a> Operand<'a> {
    /// Creates an operand for the operator called `name`.
    pub fn new<N, P>(name: N, payload: P) -> Operand<'a>
    where
        N: Into<Cow<'a, str>>,
        P: Into<Cow<'a, [u8]>>,
    {
        Operand { name: name.into(), payload: payload.into() }
    }

    /// Copies any borrowed fields so the operand outlives its source
    /// buffer.
    pub fn into_owned(self) -> Operand<'static> {
        Operand {
            name: Cow::Owned(self.name.into_owned()),
            payload: Cow::Owned(self.payload.into_owned()),
        }
    }

    fn serialized_size(&self) -> usize {
        operand_size(&self.name, &self.payload)
    }
}

/// Operands in the chronological order they were written.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct Stack<'a> {
    /// Oldest first.
    pub operands: Vec<Operand<'a>>,
}

impl<'a> Stack<'a> {
    /// Appends an operand as the newest one.
    pub fn push(&mut self, operand: Operand<'a>) {
        self.operands.push(operand);
    }

    /// The number of operands.
    pub fn len(&self) -> usize {
        self.operands.len()
    }

    /// Returns true if there are no operands.
    pub fn is_empty(&self) -> bool {
        self.operands.is_empty()
    }

    /// See `Operand::into_owned`.
    pub fn into_owned(self) -> Stack<'static> {
        Stack {
            operands: self
                .operands
                .into_iter()
                .map(Operand::into_owned)
                .collect(),
        }
    }

    fn serialized_size(&self) -> usize {
        1 + varint::size(self.operands.len() as u64)
            + self.operands.iter().map(Operand::serialized_size).sum::<usize>()
    }
}

impl<'a> From<Vec<Operand<'a>>> for Stack<'a> {
    fn from(operands: Vec<Operand<'a>>) -> Stack<'a> {
        Stack { operands }
    }
}

/// Either a fully resolved value or a stack of pending operands.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value<'a> {
    /// A fully resolved application-level value.
    Full(Cow<'a, [u8]>),
    /// Operands not yet folded into a Full value.
    Stack(Stack<'a>),
}

impl<'a> Value<'a> {
    /// A Full value borrowing `bytes`.
    pub const fn full(bytes: &'a [u8]) -> Value<'a> {
        Value::Full(Cow::Borrowed(bytes))
    }

    /// A Stack value holding `operands`, oldest first.
    pub fn stack(operands: Vec<Operand<'a>>) -> Value<'a> {
        Value::Stack(Stack { operands })
    }

    /// The discriminant of this value.
    pub const fn kind(&self) -> Kind {
        match self {
            Value::Full(_) => Kind::Full,
            Value::Stack(_) => Kind::Stack,
        }
    }

    /// Copies any borrowed fields so the value outlives its source
    /// buffer.
    pub fn into_owned(self) -> Value<'static> {
        match self {
            Value::Full(bytes) => Value::Full(Cow::Owned(bytes.into_owned())),
            Value::Stack(stack) => Value::Stack(stack.into_owned()),
        }
    }

    /// The exact number of bytes `encode` will produce.
    pub fn serialized_size(&self) -> usize {
        2 + match self {
            Value::Full(bytes) => bytes.len(),
            Value::Stack(stack) => stack.serialized_size(),
        }
    }

    /// Serializes this value.
    ///
    /// With a `pool`, the returned buffer is borrowed from it and goes
    /// back when released. Without one it is a plain allocation.
    ///
    /// Fails if any operand has an empty name, before anything is
    /// written.
    pub fn encode(&self, pool: Option<&BufferPool>) -> Result<Buf> {
        self.validate()?;

        let size = self.serialized_size();
        let mut buf = if let Some(pool) = pool {
            pool.borrow(size)
        } else {
            Buf::owned(Vec::with_capacity(size))
        };

        self.poo(buf.as_mut_vec());

        Ok(buf)
    }

    /// Appends the serialized value to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        self.validate()?;
        out.reserve(self.serialized_size());
        self.poo(out);
        Ok(())
    }

    /// Deserializes a value.
    ///
    /// When `clone` is false, the returned value borrows its names and
    /// payloads from `buf`. When `clone` is true, every field is copied.
    pub fn decode(buf: &'a [u8], clone: bool) -> Result<Value<'a>> {
        let mut reader = Reader::new(buf);
        let value = Value::eat(&mut reader)?;
        if clone {
            Ok(value.into_owned())
        } else {
            Ok(value)
        }
    }

    fn validate(&self) -> Result<()> {
        if let Value::Stack(stack) = self {
            if let Some(idx) = stack.operands.iter().position(|op| op.name.is_empty()) {
                return Err(Error::Validation(format!(
                    "operand {} has an empty operator name",
                    idx
                )));
            }
        }
        Ok(())
    }
}

/// Streams the operands of an encoded Stack value to `visit`, in order,
/// without materializing the stack.
///
/// `visit` may return `ControlFlow::Break` to stop early, which is not
/// an error. Returns the number of operands visited.
pub fn walk<'a, F>(buf: &'a [u8], mut visit: F) -> Result<usize>
where
    F: FnMut(usize, Operand<'a>) -> Result<ControlFlow<()>>,
{
    let mut reader = Reader::new(buf);
    let kind = header(&mut reader)?;
    if kind != Kind::Stack {
        return Err(Error::UnexpectedKind { expected: Kind::Stack, found: kind });
    }

    let count = stack_header(&mut reader)?;

    for idx in 0..count {
        let operand = Operand::eat(&mut reader)?;
        if visit(idx, operand)?.is_break() {
            return Ok(idx + 1);
        }
    }

    reader.finish("stack")?;

    Ok(count)
}

/// A cursor over an input buffer that remembers how far it has read,
/// so that errors point at the offending byte.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    pub(crate) const fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, at: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.at..]
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8]> {
        if self.remaining().len() < len {
            return Err(Error::corruption(self.at, what));
        }
        let ret = &self.buf[self.at..self.at + len];
        self.at += len;
        Ok(ret)
    }

    fn rest(&mut self) -> &'a [u8] {
        let ret = self.remaining();
        self.at = self.buf.len();
        ret
    }

    fn finish(&self, what: &'static str) -> Result<()> {
        if self.at == self.buf.len() {
            Ok(())
        } else {
            Err(Error::corruption(self.at, what))
        }
    }
}

/// This is a helper trait for driving serialization.
trait EatPoo<'a>: Sized {
    /// Appends the byte representation of the item.
    fn poo(&self, buf: &mut Vec<u8>);

    /// Attempts to deserialize this type from the front of `reader`,
    /// advancing it past the consumed bytes.
    fn eat(reader: &mut Reader<'a>) -> Result<Self>;
}

impl<'a> EatPoo<'a> for u8 {
    fn poo(&self, buf: &mut Vec<u8>) {
        buf.push(*self);
    }

    fn eat(reader: &mut Reader<'a>) -> Result<u8> {
        Ok(reader.take(1, "byte")?[0])
    }
}

impl<'a> EatPoo<'a> for u64 {
    fn poo(&self, buf: &mut Vec<u8>) {
        varint::push(*self, buf);
    }

    fn eat(reader: &mut Reader<'a>) -> Result<u64> {
        let (int, sz) = varint::deserialize(reader.remaining())
            .map_err(|_| Error::corruption(reader.at, "varint"))?;
        reader.at += sz;
        Ok(int)
    }
}

fn eat_len(reader: &mut Reader<'_>, what: &'static str) -> Result<usize> {
    let at = reader.at;
    let len = u64::eat(reader)?;
    usize::try_from(len).map_err(|_| Error::corruption(at, what))
}

/// Appends one operand, for callers building a stack body directly.
pub(crate) fn poo_operand(name: &str, payload: &[u8], buf: &mut Vec<u8>) {
    (name.len() as u64).poo(buf);
    buf.extend_from_slice(name.as_bytes());
    (payload.len() as u64).poo(buf);
    buf.extend_from_slice(payload);
}

/// The number of bytes `poo_operand` appends.
pub(crate) fn operand_size(name: &str, payload: &[u8]) -> usize {
    varint::size(name.len() as u64)
        + name.len()
        + varint::size(payload.len() as u64)
        + payload.len()
}

/// Appends everything that precedes the operands of a Stack value.
pub(crate) fn poo_stack_header(count: usize, buf: &mut Vec<u8>) {
    VALUE_VERSION.poo(buf);
    (Kind::Stack as u8).poo(buf);
    STACK_VERSION.poo(buf);
    (count as u64).poo(buf);
}

/// The number of bytes `poo_stack_header` appends.
pub(crate) const fn stack_header_size(count: usize) -> usize {
    3 + varint::size(count as u64)
}

impl<'a> EatPoo<'a> for Cow<'a, [u8]> {
    fn poo(&self, buf: &mut Vec<u8>) {
        (self.len() as u64).poo(buf);
        buf.extend_from_slice(self);
    }

    fn eat(reader: &mut Reader<'a>) -> Result<Cow<'a, [u8]>> {
        let len = eat_len(reader, "payload length")?;
        Ok(Cow::Borrowed(reader.take(len, "payload")?))
    }
}

impl<'a> EatPoo<'a> for Cow<'a, str> {
    fn poo(&self, buf: &mut Vec<u8>) {
        (self.len() as u64).poo(buf);
        buf.extend_from_slice(self.as_bytes());
    }

    fn eat(reader: &mut Reader<'a>) -> Result<Cow<'a, str>> {
        let len = eat_len(reader, "name length")?;
        let at = reader.at;
        let bytes = reader.take(len, "name")?;
        std::str::from_utf8(bytes)
            .map(Cow::Borrowed)
            .map_err(|_| Error::corruption(at, "name"))
    }
}

impl<'a> EatPoo<'a> for Operand<'a> {
    fn poo(&self, buf: &mut Vec<u8>) {
        poo_operand(&self.name, &self.payload, buf);
    }

    fn eat(reader: &mut Reader<'a>) -> Result<Operand<'a>> {
        let name = <Cow<'a, str>>::eat(reader)?;
        let payload = <Cow<'a, [u8]>>::eat(reader)?;
        Ok(Operand { name, payload })
    }
}

impl<'a> EatPoo<'a> for Stack<'a> {
    fn poo(&self, buf: &mut Vec<u8>) {
        STACK_VERSION.poo(buf);
        (self.operands.len() as u64).poo(buf);
        for operand in &self.operands {
            operand.poo(buf);
        }
    }

    fn eat(reader: &mut Reader<'a>) -> Result<Stack<'a>> {
        let count = stack_header(reader)?;

        // every operand takes at least two bytes, so a corrupt count
        // can't make us reserve more than the input could hold
        let mut operands =
            Vec::with_capacity(count.min(reader.remaining().len() / 2));
        for _ in 0..count {
            operands.push(Operand::eat(reader)?);
        }

        reader.finish("stack")?;

        Ok(Stack { operands })
    }
}

impl<'a> EatPoo<'a> for Value<'a> {
    fn poo(&self, buf: &mut Vec<u8>) {
        VALUE_VERSION.poo(buf);
        (self.kind() as u8).poo(buf);
        match self {
            Value::Full(bytes) => buf.extend_from_slice(bytes),
            Value::Stack(stack) => stack.poo(buf),
        }
    }

    fn eat(reader: &mut Reader<'a>) -> Result<Value<'a>> {
        Ok(match header(reader)? {
            Kind::Full => Value::Full(Cow::Borrowed(reader.rest())),
            Kind::Stack => Value::Stack(Stack::eat(reader)?),
        })
    }
}

fn version(reader: &mut Reader<'_>, expected: u8) -> Result<()> {
    let found = u8::eat(reader)?;
    if found == expected {
        Ok(())
    } else {
        Err(Error::VersionMismatch { expected, found })
    }
}

/// Consumes the value version and kind bytes.
pub(crate) fn header(reader: &mut Reader<'_>) -> Result<Kind> {
    version(reader, VALUE_VERSION)?;
    let at = reader.at;
    Kind::try_from(u8::eat(reader)?).map_err(|_| Error::corruption(at, "kind"))
}

/// Consumes the stack version byte and operand count.
fn stack_header(reader: &mut Reader<'_>) -> Result<usize> {
    version(reader, STACK_VERSION)?;
    eat_len(reader, "operand count")
}

#[cfg(test)]
mod qc {
    use quickcheck::{Arbitrary, Gen};

    use super::*;

    const NAMES: [&str; 4] = ["increment", "concat", "a", "ünïcødé"];

    impl Arbitrary for Operand<'static> {
        fn arbitrary(g: &mut Gen) -> Operand<'static> {
            let name = *g.choose(&NAMES).unwrap();
            Operand::new(name, Vec::<u8>::arbitrary(g))
        }
    }

    impl Arbitrary for Value<'static> {
        fn arbitrary(g: &mut Gen) -> Value<'static> {
            if bool::arbitrary(g) {
                Value::Full(Cow::Owned(Vec::arbitrary(g)))
            } else {
                Value::stack(Vec::arbitrary(g))
            }
        }
    }

    fn prop_round_trip(value: Value<'static>, pooled: bool) -> bool {
        let pool = BufferPool::default();
        let encoded = value.encode(pooled.then_some(&pool)).unwrap();
        if encoded.len() != value.serialized_size() {
            return false;
        }
        let borrowed = Value::decode(&encoded, false).unwrap();
        let cloned = Value::decode(&encoded, true).unwrap();
        borrowed == value && cloned == value
    }

    quickcheck::quickcheck! {
        fn value_round_trip(value: Value<'static>, pooled: bool) -> bool {
            prop_round_trip(value, pooled)
        }
    }
}
