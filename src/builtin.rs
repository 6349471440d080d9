//! Operators that every engine may register without writing any code.

use std::io::Write;
use std::sync::{Arc, OnceLock};

use crate::{Buf, BufferPool, Error, Instruction, Operator, Result};

/// Name of the counter operator.
pub const INCREMENT: &str = "increment";

/// Name of the byte-concatenation operator.
pub const CONCAT: &str = "concat";

/// Adds signed decimal integers.
///
/// The base and every payload are ASCII decimal integers. The folded
/// result must fit in an `i64`. Combined payloads are summed in 128
/// bits, so pre-reducing never fails where folding one at a time would
/// have succeeded.
pub fn increment() -> Arc<Operator> {
    builtins()[0].clone()
}

/// Appends every payload to the base, oldest first.
pub fn concat() -> Arc<Operator> {
    builtins()[1].clone()
}

/// The built-in operators as a single declared instruction.
pub fn instruction() -> &'static dyn Instruction {
    &Builtins
}

struct Builtins;

impl Instruction for Builtins {
    fn operators(&self) -> Vec<Arc<Operator>> {
        builtins().to_vec()
    }
}

// the same instances are handed out every time so that declaring the
// built-ins more than once never looks like a naming collision
fn builtins() -> &'static [Arc<Operator>; 2] {
    static BUILTINS: OnceLock<[Arc<Operator>; 2]> = OnceLock::new();
    BUILTINS.get_or_init(|| {
        [
            Arc::new(
                Operator::new(INCREMENT, &b"0"[..], increment_apply)
                    .with_combine(increment_combine),
            ),
            Arc::new(
                Operator::new(CONCAT, vec![], concat_apply)
                    .with_combine(concat_combine),
            ),
        ]
    })
}

fn parse(bytes: &[u8]) -> Result<i128> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i128>().ok())
        .ok_or_else(|| {
            Error::operator(
                INCREMENT,
                format!("{:?} is not a decimal integer", String::from_utf8_lossy(bytes)),
            )
        })
}

fn sum(operands: &[&[u8]]) -> Result<i128> {
    let mut total: i128 = 0;
    for operand in operands {
        total = total
            .checked_add(parse(operand)?)
            .ok_or_else(|| Error::operator(INCREMENT, "sum overflowed"))?;
    }
    Ok(total)
}

fn write_decimal(int: i128, pool: &BufferPool) -> Result<Buf> {
    // 40 bytes holds any i128 in decimal, sign included
    let mut buf = pool.borrow(40);
    write!(buf.as_mut_vec(), "{}", int)
        .map_err(|e| Error::operator(INCREMENT, e.to_string()))?;
    Ok(buf)
}

fn increment_apply(
    base: &[u8],
    operands: &[&[u8]],
    pool: &BufferPool,
) -> Result<Buf> {
    let total = parse(base)?
        .checked_add(sum(operands)?)
        .ok_or_else(|| Error::operator(INCREMENT, "sum overflowed"))?;

    let Ok(result) = i64::try_from(total) else {
        return Err(Error::operator(
            INCREMENT,
            format!("result {} does not fit in 64 bits", total),
        ));
    };

    write_decimal(i128::from(result), pool)
}

fn increment_combine(operands: &[&[u8]], pool: &BufferPool) -> Result<Buf> {
    write_decimal(sum(operands)?, pool)
}

fn concat_apply(
    base: &[u8],
    operands: &[&[u8]],
    pool: &BufferPool,
) -> Result<Buf> {
    let len = base.len() + operands.iter().map(|op| op.len()).sum::<usize>();
    let mut buf = pool.borrow(len);
    let out = buf.as_mut_vec();
    out.extend_from_slice(base);
    for operand in operands {
        out.extend_from_slice(operand);
    }
    Ok(buf)
}

fn concat_combine(operands: &[&[u8]], pool: &BufferPool) -> Result<Buf> {
    concat_apply(&[], operands, pool)
}
