//! Numeric coercion and operator lattice (spec §4.1).
//!
//! `Byte, Word, Char, Boolean ⊆ Integer ⊆ Real (Float ⊆ Double ⊆ LongDouble)`.
//! Every binary operator here widens both operands to the join of their
//! two types in that lattice, computes in the wider type, then narrows
//! back only when the destination is explicitly narrower (assignment does
//! that narrowing, not the operator itself — see `ValueError::RangeCheck`
//! callers in `pvm-runtime`'s `STORE_*` opcodes).

use crate::error::ValueError;
use crate::types::RealKind;
use crate::value::Value;

fn widest_real_kind(a: RealKind, b: RealKind) -> RealKind {
    use RealKind::*;
    match (a, b) {
        (LongDouble, _) | (_, LongDouble) => LongDouble,
        (Double, _) | (_, Double) => Double,
        _ => Float,
    }
}

/// True if either operand is a `Real` (of any sub-kind), meaning the
/// operation must be carried out in floating point.
fn either_real(a: &Value, b: &Value) -> Option<RealKind> {
    match (a, b) {
        (Value::Real(k, _), Value::Real(j, _)) => Some(widest_real_kind(*k, *j)),
        (Value::Real(k, _), _) | (_, Value::Real(k, _)) => Some(*k),
        _ => None,
    }
}

fn require_numeric(v: &Value) -> Result<(), ValueError> {
    if v.var_type().is_numeric() {
        Ok(())
    } else {
        Err(ValueError::TypeMismatch(format!(
            "{} is not a numeric type",
            v.var_type()
        )))
    }
}

/// `+` (spec §4.1). `String + String` is concatenation, not arithmetic —
/// callers route that case to `Value::String`'s own `concat` before
/// reaching here; this function only ever sees numeric operands.
pub fn add(a: &Value, b: &Value) -> Result<Value, ValueError> {
    require_numeric(a)?;
    require_numeric(b)?;
    if let Some(kind) = either_real(a, b) {
        Ok(Value::Real(kind, a.as_f64()? + b.as_f64()?))
    } else {
        Ok(Value::Integer(a.ordinal()? + b.ordinal()?))
    }
}

pub fn sub(a: &Value, b: &Value) -> Result<Value, ValueError> {
    require_numeric(a)?;
    require_numeric(b)?;
    if let Some(kind) = either_real(a, b) {
        Ok(Value::Real(kind, a.as_f64()? - b.as_f64()?))
    } else {
        Ok(Value::Integer(a.ordinal()? - b.ordinal()?))
    }
}

pub fn mul(a: &Value, b: &Value) -> Result<Value, ValueError> {
    require_numeric(a)?;
    require_numeric(b)?;
    if let Some(kind) = either_real(a, b) {
        Ok(Value::Real(kind, a.as_f64()? * b.as_f64()?))
    } else {
        Ok(Value::Integer(a.ordinal()? * b.ordinal()?))
    }
}

/// `/`: always real division, regardless of operand types (spec §4.1).
pub fn div(a: &Value, b: &Value) -> Result<Value, ValueError> {
    require_numeric(a)?;
    require_numeric(b)?;
    let divisor = b.as_f64()?;
    if divisor == 0.0 {
        return Err(ValueError::RangeCheck("division by zero".into()));
    }
    let kind = either_real(a, b).unwrap_or(RealKind::Double);
    Ok(Value::Real(kind, a.as_f64()? / divisor))
}

/// `div`: integer division, truncating toward zero.
pub fn int_div(a: &Value, b: &Value) -> Result<Value, ValueError> {
    let lhs = a.ordinal()?;
    let rhs = b.ordinal()?;
    if rhs == 0 {
        return Err(ValueError::RangeCheck("integer division by zero".into()));
    }
    Ok(Value::Integer(lhs / rhs))
}

/// `mod`: remainder, sign follows the dividend (Pascal/C semantics, not
/// Euclidean).
pub fn modulo(a: &Value, b: &Value) -> Result<Value, ValueError> {
    let lhs = a.ordinal()?;
    let rhs = b.ordinal()?;
    if rhs == 0 {
        return Err(ValueError::RangeCheck("modulo by zero".into()));
    }
    Ok(Value::Integer(lhs % rhs))
}

pub fn neg(a: &Value) -> Result<Value, ValueError> {
    match a {
        Value::Real(kind, n) => Ok(Value::Real(*kind, -n)),
        other => Ok(Value::Integer(-other.ordinal()?)),
    }
}

pub fn not(a: &Value) -> Result<Value, ValueError> {
    match a {
        Value::Boolean(b) => Ok(Value::Boolean(!b)),
        other => Ok(Value::Integer(!other.ordinal()?)),
    }
}

pub fn and(a: &Value, b: &Value) -> Result<Value, ValueError> {
    match (a, b) {
        (Value::Boolean(x), Value::Boolean(y)) => Ok(Value::Boolean(*x && *y)),
        _ => Ok(Value::Integer(a.ordinal()? & b.ordinal()?)),
    }
}

pub fn or(a: &Value, b: &Value) -> Result<Value, ValueError> {
    match (a, b) {
        (Value::Boolean(x), Value::Boolean(y)) => Ok(Value::Boolean(*x || *y)),
        _ => Ok(Value::Integer(a.ordinal()? | b.ordinal()?)),
    }
}

pub fn xor(a: &Value, b: &Value) -> Result<Value, ValueError> {
    match (a, b) {
        (Value::Boolean(x), Value::Boolean(y)) => Ok(Value::Boolean(*x != *y)),
        _ => Ok(Value::Integer(a.ordinal()? ^ b.ordinal()?)),
    }
}

pub fn shl(a: &Value, b: &Value) -> Result<Value, ValueError> {
    let shift = b.ordinal()?;
    if !(0..64).contains(&shift) {
        return Err(ValueError::RangeCheck(format!("shift amount {shift} out of range")));
    }
    Ok(Value::Integer(a.ordinal()? << shift))
}

pub fn shr(a: &Value, b: &Value) -> Result<Value, ValueError> {
    let shift = b.ordinal()?;
    if !(0..64).contains(&shift) {
        return Err(ValueError::RangeCheck(format!("shift amount {shift} out of range")));
    }
    Ok(Value::Integer(a.ordinal()? >> shift))
}

/// Three-way ordering comparison feeding `EQUAL`/`GREATER`/`LESS` and their
/// negations (spec §6.3). Strings compare lexicographically; everything
/// else compares as the widened numeric value.
pub fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, ValueError> {
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Ok(x.as_str().cmp(y.as_str()));
    }
    if either_real(a, b).is_some() {
        return a
            .as_f64()?
            .partial_cmp(&b.as_f64()?)
            .ok_or_else(|| ValueError::RangeCheck("NaN is not ordered".into()));
    }
    Ok(a.ordinal()?.cmp(&b.ordinal()?))
}

/// `Inc`/`Dec` on bounded integer kinds warn and wrap modulo the kind's
/// width rather than raising (spec §4.1, §8: "`Byte` at 255 with
/// `Inc(x,1)` warns and wraps to 0 modulo 256"). The second element of the
/// returned tuple is `true` when wraparound occurred; this layer has no
/// logging dependency, so the caller (which has a line number) is the one
/// that turns it into a `runtime_warning`.
pub fn inc(v: &Value, by: i64) -> Result<(Value, bool), ValueError> {
    match v {
        Value::Integer(n) => Ok((Value::Integer(n + by), false)),
        Value::Byte(n) => {
            let widened = *n as i64 + by;
            let wrapped = widened.rem_euclid(1 << 8) as u8;
            Ok((Value::Byte(wrapped), !(0..=u8::MAX as i64).contains(&widened)))
        }
        Value::Word(n) => {
            let widened = *n as i64 + by;
            let wrapped = widened.rem_euclid(1 << 16) as u16;
            Ok((Value::Word(wrapped), !(0..=u16::MAX as i64).contains(&widened)))
        }
        Value::Cardinal(n) => {
            let widened = *n as i64 + by;
            let wrapped = widened.rem_euclid(1 << 32) as u32;
            Ok((Value::Cardinal(wrapped), !(0..=u32::MAX as i64).contains(&widened)))
        }
        Value::Char(c) => {
            let widened = *c as i64 + by;
            let wrapped = widened.rem_euclid(1 << 8) as u8;
            Ok((Value::Char(wrapped), !(0..=u8::MAX as i64).contains(&widened)))
        }
        Value::Enum { decl, ordinal } => {
            let span = decl.last_ordinal() + 1;
            let widened = ordinal + by;
            let wrapped = widened.rem_euclid(span);
            Ok((
                Value::Enum { decl: decl.clone(), ordinal: wrapped },
                widened < 0 || widened > decl.last_ordinal(),
            ))
        }
        other => Err(ValueError::TypeMismatch(format!(
            "{} cannot be incremented",
            other.var_type()
        ))),
    }
}

pub fn dec(v: &Value, by: i64) -> Result<(Value, bool), ValueError> {
    inc(v, -by)
}

/// `Succ`/`Pred`: unlike `Inc`/`Dec`, these raise `RangeCheck` on
/// over/underflow rather than wrapping (spec §4.1: "`Succ`/`Pred` raise a
/// runtime error on over/underflow").
pub fn succ(v: &Value) -> Result<Value, ValueError> {
    adjust_checked(v, 1)
}

pub fn pred(v: &Value) -> Result<Value, ValueError> {
    adjust_checked(v, -1)
}

fn adjust_checked(v: &Value, by: i64) -> Result<Value, ValueError> {
    match v {
        Value::Integer(n) => Ok(Value::Integer(n + by)),
        Value::Byte(n) => {
            let widened = *n as i64 + by;
            u8::try_from(widened)
                .map(Value::Byte)
                .map_err(|_| ValueError::RangeCheck(format!("Byte overflow: {widened}")))
        }
        Value::Word(n) => {
            let widened = *n as i64 + by;
            u16::try_from(widened)
                .map(Value::Word)
                .map_err(|_| ValueError::RangeCheck(format!("Word overflow: {widened}")))
        }
        Value::Cardinal(n) => {
            let widened = *n as i64 + by;
            u32::try_from(widened)
                .map(Value::Cardinal)
                .map_err(|_| ValueError::RangeCheck(format!("Cardinal overflow: {widened}")))
        }
        Value::Char(c) => {
            let widened = *c as i64 + by;
            u8::try_from(widened)
                .map(Value::Char)
                .map_err(|_| ValueError::RangeCheck(format!("Char overflow: {widened}")))
        }
        Value::Enum { decl, ordinal } => {
            let widened = ordinal + by;
            if widened < 0 || widened > decl.last_ordinal() {
                Err(ValueError::RangeCheck(format!(
                    "{} has no ordinal {widened}",
                    decl.type_name
                )))
            } else {
                Ok(Value::Enum {
                    decl: decl.clone(),
                    ordinal: widened,
                })
            }
        }
        other => Err(ValueError::TypeMismatch(format!(
            "{} cannot be incremented",
            other.var_type()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RealKind;

    #[test]
    fn integer_add_stays_integer() {
        let r = add(&Value::Integer(2), &Value::Integer(3)).unwrap();
        assert_eq!(r, Value::Integer(5));
    }

    #[test]
    fn mixed_int_real_add_widens_to_real() {
        let r = add(&Value::Integer(2), &Value::Real(RealKind::Double, 0.5)).unwrap();
        assert_eq!(r, Value::Real(RealKind::Double, 2.5));
    }

    #[test]
    fn real_division_always_produces_real() {
        let r = div(&Value::Integer(7), &Value::Integer(2)).unwrap();
        assert_eq!(r, Value::Real(RealKind::Double, 3.5));
    }

    #[test]
    fn division_by_zero_is_range_check() {
        let err = div(&Value::Integer(1), &Value::Integer(0)).unwrap_err();
        assert!(matches!(err, ValueError::RangeCheck(_)));
    }

    #[test]
    fn int_div_truncates_toward_zero() {
        let r = int_div(&Value::Integer(-7), &Value::Integer(2)).unwrap();
        assert_eq!(r, Value::Integer(-3));
    }

    #[test]
    fn byte_inc_overflow_warns_and_wraps() {
        let (v, wrapped) = inc(&Value::Byte(255), 1).unwrap();
        assert_eq!(v, Value::Byte(0));
        assert!(wrapped);
    }

    #[test]
    fn byte_succ_overflow_is_range_check() {
        let err = succ(&Value::Byte(255)).unwrap_err();
        assert!(matches!(err, ValueError::RangeCheck(_)));
    }

    #[test]
    fn boolean_and_short_circuits_to_boolean_kind() {
        let r = and(&Value::Boolean(true), &Value::Boolean(false)).unwrap();
        assert_eq!(r, Value::Boolean(false));
    }

    #[test]
    fn string_compare_is_lexicographic() {
        let ord = compare(
            &Value::String(crate::value::SeqString::new("abc")),
            &Value::String(crate::value::SeqString::new("abd")),
        )
        .unwrap();
        assert_eq!(ord, std::cmp::Ordering::Less);
    }
}
