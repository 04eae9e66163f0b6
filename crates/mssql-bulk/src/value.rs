//! Typed cell values flowing from records to the bulk-copy transport.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Type hint for NULL values.
///
/// The TDS bulk-load row format is typed, so a NULL still has to be encoded
/// with the column's wire type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlNullType {
    Bool,
    U8,
    I16,
    I32,
    I64,
    F32,
    F64,
    String,
    Bytes,
    Uuid,
    Decimal,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
}

impl SqlNullType {
    /// Best-effort mapping from a SQL Server type name (`nvarchar(50)`,
    /// `decimal(18,2)`, `int`) to the wire type used for NULL placeholders.
    pub fn from_type_name(type_name: &str) -> Self {
        let base = type_name
            .split('(')
            .next()
            .unwrap_or(type_name)
            .trim()
            .to_lowercase();

        match base.as_str() {
            "bit" => SqlNullType::Bool,
            "tinyint" => SqlNullType::U8,
            "smallint" => SqlNullType::I16,
            "int" => SqlNullType::I32,
            "bigint" => SqlNullType::I64,
            "real" => SqlNullType::F32,
            "float" => SqlNullType::F64,
            "decimal" | "numeric" | "money" | "smallmoney" => SqlNullType::Decimal,
            "uniqueidentifier" => SqlNullType::Uuid,
            "binary" | "varbinary" | "image" | "rowversion" | "timestamp" => SqlNullType::Bytes,
            "datetime" | "datetime2" | "smalldatetime" => SqlNullType::DateTime,
            "datetimeoffset" => SqlNullType::DateTimeOffset,
            "date" => SqlNullType::Date,
            "time" => SqlNullType::Time,
            _ => SqlNullType::String,
        }
    }
}

/// SQL value enum for type-safe row handling.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL with type hint for correct wire format encoding.
    Null(SqlNullType),
    Bool(bool),
    U8(u8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Decimal(Decimal),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<FixedOffset>),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// Get the SqlNullType for this value.
    #[must_use]
    pub fn null_type(&self) -> SqlNullType {
        match self {
            SqlValue::Null(t) => *t,
            SqlValue::Bool(_) => SqlNullType::Bool,
            SqlValue::U8(_) => SqlNullType::U8,
            SqlValue::I16(_) => SqlNullType::I16,
            SqlValue::I32(_) => SqlNullType::I32,
            SqlValue::I64(_) => SqlNullType::I64,
            SqlValue::F32(_) => SqlNullType::F32,
            SqlValue::F64(_) => SqlNullType::F64,
            SqlValue::String(_) => SqlNullType::String,
            SqlValue::Bytes(_) => SqlNullType::Bytes,
            SqlValue::Uuid(_) => SqlNullType::Uuid,
            SqlValue::Decimal(_) => SqlNullType::Decimal,
            SqlValue::DateTime(_) => SqlNullType::DateTime,
            SqlValue::DateTimeOffset(_) => SqlNullType::DateTimeOffset,
            SqlValue::Date(_) => SqlNullType::Date,
            SqlValue::Time(_) => SqlNullType::Time,
        }
    }

    /// Integer view across all integer widths.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::U8(v) => Some(i64::from(*v)),
            SqlValue::I16(v) => Some(i64::from(*v)),
            SqlValue::I32(v) => Some(i64::from(*v)),
            SqlValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Equality as a SQL `=` predicate sees it: NULL never matches and
    /// integers compare across widths.
    pub fn sql_eq(&self, other: &SqlValue) -> bool {
        if self.is_null() || other.is_null() {
            return false;
        }
        match (self.as_i64(), other.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }

    /// Convert to the integer width of `target`, used when a generated key
    /// is written back into a record field of a narrower type.
    pub fn coerce_to(self, target: SqlNullType) -> SqlValue {
        let Some(v) = self.as_i64() else {
            return self;
        };
        match target {
            SqlNullType::U8 => u8::try_from(v).map(SqlValue::U8).unwrap_or(self),
            SqlNullType::I16 => i16::try_from(v).map(SqlValue::I16).unwrap_or(self),
            SqlNullType::I32 => i32::try_from(v).map(SqlValue::I32).unwrap_or(self),
            SqlNullType::I64 => SqlValue::I64(v),
            _ => self,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null(_) => f.write_str("NULL"),
            SqlValue::Bool(v) => write!(f, "{}", v),
            SqlValue::U8(v) => write!(f, "{}", v),
            SqlValue::I16(v) => write!(f, "{}", v),
            SqlValue::I32(v) => write!(f, "{}", v),
            SqlValue::I64(v) => write!(f, "{}", v),
            SqlValue::F32(v) => write!(f, "{}", v),
            SqlValue::F64(v) => write!(f, "{}", v),
            SqlValue::String(v) => write!(f, "'{}'", v),
            SqlValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            SqlValue::Uuid(v) => write!(f, "{}", v),
            SqlValue::Decimal(v) => write!(f, "{}", v),
            SqlValue::DateTime(v) => write!(f, "{}", v),
            SqlValue::DateTimeOffset(v) => write!(f, "{}", v),
            SqlValue::Date(v) => write!(f, "{}", v),
            SqlValue::Time(v) => write!(f, "{}", v),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident, $null:ident;)*) => {
        $(
            impl From<$ty> for SqlValue {
                fn from(v: $ty) -> Self {
                    SqlValue::$variant(v)
                }
            }

            impl From<Option<$ty>> for SqlValue {
                fn from(v: Option<$ty>) -> Self {
                    v.map(SqlValue::$variant)
                        .unwrap_or(SqlValue::Null(SqlNullType::$null))
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool, Bool;
    u8 => U8, U8;
    i16 => I16, I16;
    i32 => I32, I32;
    i64 => I64, I64;
    f32 => F32, F32;
    f64 => F64, F64;
    String => String, String;
    Vec<u8> => Bytes, Bytes;
    Uuid => Uuid, Uuid;
    Decimal => Decimal, Decimal;
    NaiveDateTime => DateTime, DateTime;
    DateTime<FixedOffset> => DateTimeOffset, DateTimeOffset;
    NaiveDate => Date, Date;
    NaiveTime => Time, Time;
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::String(v.to_string())
    }
}

impl From<Option<&str>> for SqlValue {
    fn from(v: Option<&str>) -> Self {
        v.map(SqlValue::from)
            .unwrap_or(SqlValue::Null(SqlNullType::String))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_type_from_type_name() {
        assert_eq!(SqlNullType::from_type_name("int"), SqlNullType::I32);
        assert_eq!(SqlNullType::from_type_name("NVARCHAR(50)"), SqlNullType::String);
        assert_eq!(SqlNullType::from_type_name("decimal(18, 2)"), SqlNullType::Decimal);
        assert_eq!(SqlNullType::from_type_name("datetime2(7)"), SqlNullType::DateTime);
        assert_eq!(SqlNullType::from_type_name("date"), SqlNullType::Date);
    }

    #[test]
    fn test_sql_eq_null_never_matches() {
        let null = SqlValue::Null(SqlNullType::I32);
        assert!(!null.sql_eq(&null));
        assert!(!SqlValue::I32(1).sql_eq(&null));
    }

    #[test]
    fn test_sql_eq_across_integer_widths() {
        assert!(SqlValue::I32(7).sql_eq(&SqlValue::I64(7)));
        assert!(!SqlValue::I16(7).sql_eq(&SqlValue::I64(8)));
        assert!(SqlValue::from("a").sql_eq(&SqlValue::from("a".to_string())));
    }

    #[test]
    fn test_option_conversion_keeps_null_type() {
        let v: SqlValue = Option::<i64>::None.into();
        assert_eq!(v, SqlValue::Null(SqlNullType::I64));
        let v: SqlValue = Some("x").into();
        assert_eq!(v.as_str(), Some("x"));
    }

    #[test]
    fn test_coerce_to_narrower_integer() {
        assert_eq!(SqlValue::I64(42).coerce_to(SqlNullType::I32), SqlValue::I32(42));
        assert_eq!(
            SqlValue::I64(i64::MAX).coerce_to(SqlNullType::I32),
            SqlValue::I64(i64::MAX)
        );
        assert_eq!(SqlValue::from("x").coerce_to(SqlNullType::I32), SqlValue::from("x"));
    }
}
