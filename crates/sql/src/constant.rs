use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

/// Errors raised when encoding or decoding typed values.
#[derive(Debug, Error)]
pub enum TypeError {
    #[error("value {0} does not match type {1}")]
    TypeMismatch(Constant, ConstantType),
    #[error("value bytes truncated: expected {expected}, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("varchar of {len} bytes exceeds declared capacity {cap}")]
    VarcharOverflow { len: usize, cap: usize },
    #[error("invalid utf8 in varchar payload")]
    InvalidUtf8,
}

pub type TypeResult<T> = Result<T, TypeError>;

/// Declared type of an indexed field. Every type has a fixed on-disk width,
/// which is what makes the slotted page layout possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantType {
    Integer,
    BigInt,
    Double,
    /// Varchar with a declared maximum length in bytes.
    Varchar(usize),
}

impl ConstantType {
    /// On-disk width of a value of this type. Varchars are stored as a
    /// 4-byte length followed by the payload, padded to the declared capacity.
    pub fn serialized_size(&self) -> usize {
        match self {
            ConstantType::Integer => 4,
            ConstantType::BigInt => 8,
            ConstantType::Double => 8,
            ConstantType::Varchar(cap) => 4 + cap,
        }
    }

    /// Sentinel that sorts at or below every legal value of this type. Used
    /// as the key of the leftmost directory entry so that any search key
    /// routes somewhere.
    pub fn min_value(&self) -> Constant {
        match self {
            ConstantType::Integer => Constant::Integer(i32::MIN),
            ConstantType::BigInt => Constant::BigInt(i64::MIN),
            ConstantType::Double => Constant::Double(f64::NEG_INFINITY),
            ConstantType::Varchar(_) => Constant::Varchar(String::new()),
        }
    }

    /// Serializes `value` into exactly `serialized_size()` big-endian bytes.
    pub fn encode(&self, value: &Constant) -> TypeResult<Vec<u8>> {
        match (self, value) {
            (ConstantType::Integer, Constant::Integer(v)) => Ok(v.to_be_bytes().to_vec()),
            (ConstantType::BigInt, Constant::BigInt(v)) => Ok(v.to_be_bytes().to_vec()),
            (ConstantType::Double, Constant::Double(v)) => Ok(v.to_bits().to_be_bytes().to_vec()),
            (ConstantType::Varchar(cap), Constant::Varchar(text)) => {
                let bytes = text.as_bytes();
                if bytes.len() > *cap {
                    return Err(TypeError::VarcharOverflow {
                        len: bytes.len(),
                        cap: *cap,
                    });
                }
                let mut buffer = vec![0u8; 4 + cap];
                buffer[..4].copy_from_slice(&(bytes.len() as u32).to_be_bytes());
                buffer[4..4 + bytes.len()].copy_from_slice(bytes);
                Ok(buffer)
            }
            _ => Err(TypeError::TypeMismatch(value.clone(), *self)),
        }
    }

    /// Reads one value of this type back from `bytes`.
    pub fn decode(&self, bytes: &[u8]) -> TypeResult<Constant> {
        let expected = self.serialized_size();
        if bytes.len() < expected {
            return Err(TypeError::Truncated {
                expected,
                got: bytes.len(),
            });
        }
        match self {
            ConstantType::Integer => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&bytes[..4]);
                Ok(Constant::Integer(i32::from_be_bytes(buf)))
            }
            ConstantType::BigInt => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[..8]);
                Ok(Constant::BigInt(i64::from_be_bytes(buf)))
            }
            ConstantType::Double => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[..8]);
                Ok(Constant::Double(f64::from_bits(u64::from_be_bytes(buf))))
            }
            ConstantType::Varchar(cap) => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&bytes[..4]);
                let len = u32::from_be_bytes(buf) as usize;
                if len > *cap {
                    return Err(TypeError::VarcharOverflow { len, cap: *cap });
                }
                let text = std::str::from_utf8(&bytes[4..4 + len])
                    .map_err(|_| TypeError::InvalidUtf8)?;
                Ok(Constant::Varchar(text.to_string()))
            }
        }
    }
}

impl fmt::Display for ConstantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstantType::Integer => write!(f, "INTEGER"),
            ConstantType::BigInt => write!(f, "BIGINT"),
            ConstantType::Double => write!(f, "DOUBLE"),
            ConstantType::Varchar(cap) => write!(f, "VARCHAR({cap})"),
        }
    }
}

/// A typed value. Values of the same variant compare by their natural order;
/// doubles use the IEEE total order so that every pair of keys is comparable.
#[derive(Debug, Clone)]
pub enum Constant {
    Integer(i32),
    BigInt(i64),
    Double(f64),
    Varchar(String),
}

impl Constant {
    fn rank(&self) -> u8 {
        match self {
            Constant::Integer(_) => 0,
            Constant::BigInt(_) => 1,
            Constant::Double(_) => 2,
            Constant::Varchar(_) => 3,
        }
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Constant {}

impl Ord for Constant {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Constant::Integer(left), Constant::Integer(right)) => left.cmp(right),
            (Constant::BigInt(left), Constant::BigInt(right)) => left.cmp(right),
            (Constant::Double(left), Constant::Double(right)) => left.total_cmp(right),
            (Constant::Varchar(left), Constant::Varchar(right)) => left.cmp(right),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Constant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Integer(v) => write!(f, "{v}"),
            Constant::BigInt(v) => write!(f, "{v}"),
            Constant::Double(v) => write!(f, "{v}"),
            Constant::Varchar(v) => write!(f, "'{v}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_encode_decode() {
        let ty = ConstantType::Integer;
        let bytes = ty.encode(&Constant::Integer(-42)).unwrap();
        assert_eq!(bytes.len(), ty.serialized_size());
        assert_eq!(ty.decode(&bytes).unwrap(), Constant::Integer(-42));
    }

    #[test]
    fn varchar_pads_to_declared_capacity() {
        let ty = ConstantType::Varchar(16);
        let bytes = ty.encode(&Constant::Varchar("abc".to_string())).unwrap();
        assert_eq!(bytes.len(), 20);
        assert_eq!(ty.decode(&bytes).unwrap(), Constant::Varchar("abc".to_string()));
    }

    #[test]
    fn varchar_over_capacity_is_rejected() {
        let ty = ConstantType::Varchar(2);
        let result = ty.encode(&Constant::Varchar("toolong".to_string()));
        assert!(matches!(result, Err(TypeError::VarcharOverflow { .. })));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let ty = ConstantType::Integer;
        let result = ty.encode(&Constant::Varchar("x".to_string()));
        assert!(matches!(result, Err(TypeError::TypeMismatch(..))));
    }

    #[test]
    fn min_value_sorts_at_or_below_everything() {
        assert!(ConstantType::Integer.min_value() <= Constant::Integer(i32::MIN));
        assert!(ConstantType::BigInt.min_value() < Constant::BigInt(0));
        assert!(ConstantType::Double.min_value() < Constant::Double(f64::MIN));
        assert!(ConstantType::Varchar(8).min_value() <= Constant::Varchar(String::new()));
        assert!(ConstantType::Varchar(8).min_value() < Constant::Varchar("a".to_string()));
    }

    #[test]
    fn double_total_order_handles_negative_zero() {
        assert!(Constant::Double(-0.0) < Constant::Double(0.0));
        assert_eq!(Constant::Double(1.5), Constant::Double(1.5));
    }
}
