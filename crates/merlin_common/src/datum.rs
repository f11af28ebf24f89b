use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::types::DataType;

/// A single scalar value. This is the fundamental unit of data in MerlinDB.
/// Small enum, no heap alloc for fixed-size types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datum {
    Null,
    TinyInt(i8),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Double(f64),
    /// Fixed-point decimal for financial precision: mantissa × 10^(-scale).
    /// e.g. Decimal(12345, 2) = 123.45
    Decimal(i128, u8),
    VarChar(String),
    /// Microseconds since Unix epoch.
    Timestamp(i64),
    VarBinary(Vec<u8>),
}

impl Datum {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Datum::Null => None,
            Datum::TinyInt(_) => Some(DataType::TinyInt),
            Datum::SmallInt(_) => Some(DataType::SmallInt),
            Datum::Integer(_) => Some(DataType::Integer),
            Datum::BigInt(_) => Some(DataType::BigInt),
            Datum::Double(_) => Some(DataType::Double),
            Datum::Decimal(_, _) => Some(DataType::Decimal),
            Datum::VarChar(_) => Some(DataType::VarChar),
            Datum::Timestamp(_) => Some(DataType::Timestamp),
            Datum::VarBinary(_) => Some(DataType::VarBinary),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::TinyInt(v) => Some(*v as i64),
            Datum::SmallInt(v) => Some(*v as i64),
            Datum::Integer(v) => Some(*v as i64),
            Datum::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Double(v) => Some(*v),
            Datum::Decimal(m, s) => Some(*m as f64 / 10f64.powi(*s as i32)),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::VarChar(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Create a Decimal from a string like "123.45" or "-0.001".
    pub fn parse_decimal(s: &str) -> Option<Datum> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        let (int_part, frac_part) = if let Some(dot_pos) = s.find('.') {
            (&s[..dot_pos], &s[dot_pos + 1..])
        } else {
            (s, "")
        };
        let scale = frac_part.len() as u8;
        let combined = format!("{}{}", int_part, frac_part);
        let mantissa: i128 = combined.parse().ok()?;
        Some(Datum::Decimal(mantissa, scale))
    }

    /// Heap bytes held by this value's out-of-line storage (0 for inline types).
    pub fn out_of_line_size(&self) -> usize {
        match self {
            Datum::VarChar(s) => s.len(),
            Datum::VarBinary(b) => b.len(),
            _ => 0,
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::TinyInt(v) => write!(f, "{}", v),
            Datum::SmallInt(v) => write!(f, "{}", v),
            Datum::Integer(v) => write!(f, "{}", v),
            Datum::BigInt(v) => write!(f, "{}", v),
            Datum::Double(v) => write!(f, "{}", v),
            Datum::Decimal(m, s) => write!(f, "{}", decimal_to_string(*m, *s)),
            Datum::VarChar(s) => write!(f, "{}", s),
            Datum::Timestamp(us) => write!(f, "{}", us),
            Datum::VarBinary(bytes) => {
                write!(f, "\\x")?;
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            // NULL equals NULL for storage comparisons: lookups and index keys
            // must treat a stored NULL image as identical to itself.
            (Datum::Null, Datum::Null) => true,
            (Datum::Double(a), Datum::Double(b)) => a == b,
            (Datum::Double(a), b) | (b, Datum::Double(a)) => b.as_i64().map(|v| v as f64) == Some(*a),
            (Datum::Decimal(a, sa), Datum::Decimal(b, sb)) => {
                let (na, nb) = decimal_normalize(*a, *sa, *b, *sb);
                na == nb
            }
            (Datum::Decimal(m, s), b) | (b, Datum::Decimal(m, s)) => match b.as_i64() {
                Some(v) => *m == v as i128 * 10i128.pow(*s as u32),
                None => false,
            },
            (Datum::VarChar(a), Datum::VarChar(b)) => a == b,
            (Datum::Timestamp(a), Datum::Timestamp(b)) => a == b,
            (Datum::VarBinary(a), Datum::VarBinary(b)) => a == b,
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl Eq for Datum {}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Explicit type tags (NOT mem::discriminant) so that cross-width
        // integer equality stays consistent with hashing.
        match self {
            Datum::Null => {
                0u8.hash(state);
            }
            Datum::TinyInt(_) | Datum::SmallInt(_) | Datum::Integer(_) | Datum::BigInt(_) => {
                1u8.hash(state);
                self.as_i64().hash(state);
            }
            Datum::Double(v) => {
                2u8.hash(state);
                v.to_bits().hash(state);
            }
            Datum::Decimal(m, s) => {
                3u8.hash(state);
                let (nm, ns) = decimal_trim(*m, *s);
                nm.hash(state);
                ns.hash(state);
            }
            Datum::VarChar(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            Datum::Timestamp(us) => {
                5u8.hash(state);
                us.hash(state);
            }
            Datum::VarBinary(bytes) => {
                6u8.hash(state);
                bytes.hash(state);
            }
        }
    }
}

#[allow(clippy::non_canonical_partial_ord_impl)]
impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Datum::Null, Datum::Null) => Some(Ordering::Equal),
            (Datum::Null, _) => Some(Ordering::Less),
            (_, Datum::Null) => Some(Ordering::Greater),
            (Datum::Double(a), Datum::Double(b)) => a.partial_cmp(b),
            (Datum::Double(a), b) => a.partial_cmp(&b.as_f64()?),
            (a, Datum::Double(b)) => a.as_f64()?.partial_cmp(b),
            (Datum::Decimal(a, sa), Datum::Decimal(b, sb)) => {
                let (na, nb) = decimal_normalize(*a, *sa, *b, *sb);
                na.partial_cmp(&nb)
            }
            (Datum::Decimal(a, sa), b) => {
                let bm = b.as_i64()? as i128 * 10i128.pow(*sa as u32);
                a.partial_cmp(&bm)
            }
            (a, Datum::Decimal(b, sb)) => {
                let am = a.as_i64()? as i128 * 10i128.pow(*sb as u32);
                am.partial_cmp(b)
            }
            (Datum::VarChar(a), Datum::VarChar(b)) => a.partial_cmp(b),
            (Datum::Timestamp(a), Datum::Timestamp(b)) => a.partial_cmp(b),
            (Datum::VarBinary(a), Datum::VarBinary(b)) => a.partial_cmp(b),
            (a, b) => a.as_i64()?.partial_cmp(&b.as_i64()?),
        }
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        self.partial_cmp(other).unwrap_or(Ordering::Equal)
    }
}

/// A row is an ordered list of datums. Table rows append hidden columns
/// after the visible columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedRow {
    pub values: Vec<Datum>,
}

impl OwnedRow {
    pub fn new(values: Vec<Datum>) -> Self {
        Self { values }
    }

    pub fn get(&self, idx: usize) -> Option<&Datum> {
        self.values.get(idx)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The first `n` columns of this row as a new row. Used to strip hidden
    /// columns off a full storage image.
    pub fn prefix(&self, n: usize) -> OwnedRow {
        OwnedRow::new(self.values[..n.min(self.values.len())].to_vec())
    }

    /// Project the given column indices into a new row (index key extraction).
    pub fn project(&self, columns: &[usize]) -> OwnedRow {
        OwnedRow::new(
            columns
                .iter()
                .map(|&i| self.values.get(i).cloned().unwrap_or(Datum::Null))
                .collect(),
        )
    }
}

impl fmt::Display for OwnedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

// ── Order-preserving key encoding ───────────────────────────────────────

/// Encode a datum into a byte form whose unsigned lexicographic order matches
/// the datum order. Integers and doubles get a sign flip, text gets a NUL
/// terminator so shorter strings sort first.
pub fn encode_datum(buf: &mut Vec<u8>, datum: &Datum) {
    match datum {
        Datum::Null => {
            buf.push(0x00);
        }
        Datum::TinyInt(v) => {
            buf.push(0x01);
            buf.push((*v as u8) ^ (1 << 7));
        }
        Datum::SmallInt(v) => {
            buf.push(0x02);
            let encoded = (*v as u16) ^ (1u16 << 15);
            buf.extend_from_slice(&encoded.to_be_bytes());
        }
        Datum::Integer(v) => {
            buf.push(0x03);
            let encoded = (*v as u32) ^ (1u32 << 31);
            buf.extend_from_slice(&encoded.to_be_bytes());
        }
        Datum::BigInt(v) => {
            buf.push(0x04);
            let encoded = (*v as u64) ^ (1u64 << 63);
            buf.extend_from_slice(&encoded.to_be_bytes());
        }
        Datum::Double(v) => {
            buf.push(0x05);
            let bits = v.to_bits();
            let encoded = if bits & (1u64 << 63) != 0 {
                !bits
            } else {
                bits ^ (1u64 << 63)
            };
            buf.extend_from_slice(&encoded.to_be_bytes());
        }
        Datum::Decimal(m, s) => {
            buf.push(0x06);
            buf.push(*s);
            let encoded = (*m as u128) ^ (1u128 << 127);
            buf.extend_from_slice(&encoded.to_be_bytes());
        }
        Datum::VarChar(s) => {
            buf.push(0x07);
            buf.extend_from_slice(s.as_bytes());
            buf.push(0x00);
        }
        Datum::Timestamp(v) => {
            buf.push(0x08);
            let encoded = (*v as u64) ^ (1u64 << 63);
            buf.extend_from_slice(&encoded.to_be_bytes());
        }
        Datum::VarBinary(bytes) => {
            buf.push(0x09);
            buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            buf.extend_from_slice(bytes);
        }
    }
}

/// Encode the projection of `row` onto `columns` as an index key.
pub fn encode_key(row: &OwnedRow, columns: &[usize]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 * columns.len());
    for &idx in columns {
        encode_datum(&mut buf, row.get(idx).unwrap_or(&Datum::Null));
    }
    buf
}

// ── Decimal helper functions ────────────────────────────────────────────

/// Convert a (mantissa, scale) decimal to its string representation.
/// e.g. (12345, 2) → "123.45", (-1, 3) → "-0.001", (100, 0) → "100"
pub fn decimal_to_string(mantissa: i128, scale: u8) -> String {
    if scale == 0 {
        return mantissa.to_string();
    }
    let negative = mantissa < 0;
    let abs = mantissa.unsigned_abs();
    let s = abs.to_string();
    let scale = scale as usize;
    let result = if s.len() <= scale {
        let zeros = scale - s.len();
        format!("0.{}{}", "0".repeat(zeros), s)
    } else {
        let (int_part, frac_part) = s.split_at(s.len() - scale);
        format!("{}.{}", int_part, frac_part)
    };
    if negative {
        format!("-{}", result)
    } else {
        result
    }
}

/// Normalize two decimals to the same scale.
fn decimal_normalize(a: i128, sa: u8, b: i128, sb: u8) -> (i128, i128) {
    if sa == sb {
        (a, b)
    } else if sa > sb {
        let diff = (sa - sb) as u32;
        (a, b * 10i128.pow(diff))
    } else {
        let diff = (sb - sa) as u32;
        (a * 10i128.pow(diff), b)
    }
}

/// Remove trailing zeros from a decimal for canonical form.
fn decimal_trim(mut mantissa: i128, mut scale: u8) -> (i128, u8) {
    if mantissa == 0 {
        return (0, 0);
    }
    while scale > 0 && mantissa % 10 == 0 {
        mantissa /= 10;
        scale -= 1;
    }
    (mantissa, scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_width_integer_eq() {
        assert_eq!(Datum::TinyInt(42), Datum::BigInt(42));
        assert_eq!(Datum::Integer(-1), Datum::SmallInt(-1));
        assert_ne!(Datum::TinyInt(42), Datum::BigInt(43));
    }

    #[test]
    fn test_null_storage_eq() {
        assert_eq!(Datum::Null, Datum::Null);
        assert_ne!(Datum::Null, Datum::BigInt(0));
    }

    #[test]
    fn test_decimal_parse_and_display() {
        assert_eq!(Datum::parse_decimal("349508345.34583"), Some(Datum::Decimal(34950834534583, 5)));
        assert_eq!(Datum::parse_decimal("-0.001"), Some(Datum::Decimal(-1, 3)));
        assert_eq!(format!("{}", Datum::Decimal(12345, 2)), "123.45");
    }

    #[test]
    fn test_decimal_eq_across_scales() {
        assert_eq!(Datum::Decimal(100, 1), Datum::Decimal(1000, 2));
        assert_eq!(Datum::Decimal(1000, 2), Datum::BigInt(10));
    }

    #[test]
    fn test_key_encoding_order() {
        fn key(d: &Datum) -> Vec<u8> {
            let mut buf = Vec::new();
            encode_datum(&mut buf, d);
            buf
        }
        assert!(key(&Datum::BigInt(-5)) < key(&Datum::BigInt(3)));
        assert!(key(&Datum::BigInt(3)) < key(&Datum::BigInt(55555)));
        assert!(key(&Datum::Double(-1.5)) < key(&Datum::Double(0.25)));
        assert!(key(&Datum::VarChar("ab".into())) < key(&Datum::VarChar("b".into())));
        // Shorter string sorts before its extension.
        assert!(key(&Datum::VarChar("a".into())) < key(&Datum::VarChar("ab".into())));
    }

    #[test]
    fn test_hash_consistency_across_widths() {
        use std::collections::hash_map::DefaultHasher;
        fn hash_datum(d: &Datum) -> u64 {
            let mut h = DefaultHasher::new();
            d.hash(&mut h);
            h.finish()
        }
        assert_eq!(hash_datum(&Datum::TinyInt(7)), hash_datum(&Datum::BigInt(7)));
        assert_eq!(hash_datum(&Datum::Decimal(100, 1)), hash_datum(&Datum::Decimal(1000, 2)));
    }

    #[test]
    fn test_row_projection() {
        let row = OwnedRow::new(vec![Datum::TinyInt(1), Datum::BigInt(2), Datum::VarChar("x".into())]);
        let key = row.project(&[2, 0]);
        assert_eq!(key.values, vec![Datum::VarChar("x".into()), Datum::TinyInt(1)]);
        assert_eq!(row.prefix(2).len(), 2);
    }
}
