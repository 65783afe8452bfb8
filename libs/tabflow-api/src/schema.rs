use std::fmt;
use std::str::FromStr;

use crate::error::DataError;

/// Largest decimal precision any destination is expected to hold.
pub const MAX_DECIMAL_PRECISION: u8 = 38;

/// Closed set of column types.
///
/// Each variant has a canonical textual name (`decimal(10,2)`, `array<int>`);
/// unparameterized variants use the lowercased tag. The canonical name is also
/// the serialized form, so schemas can be written in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    String,
    Boolean,
    Bytes,
    Timestamp,
    Short,
    Float,
    Double,
    Date,
    Binary,
    BigInt,
    Int,
    Long,
    Char(u32),
    Varchar(u32),
    Decimal { precision: u8, scale: u8 },
    Array(Box<DataType>),
}

impl DataType {
    pub fn decimal(precision: u8, scale: u8) -> Self {
        DataType::Decimal { precision, scale }
    }

    pub fn array(element: DataType) -> Self {
        DataType::Array(Box::new(element))
    }

    pub fn canonical_name(&self) -> String {
        match self {
            DataType::String => "string".into(),
            DataType::Boolean => "boolean".into(),
            DataType::Bytes => "bytes".into(),
            DataType::Timestamp => "timestamp".into(),
            DataType::Short => "short".into(),
            DataType::Float => "float".into(),
            DataType::Double => "double".into(),
            DataType::Date => "date".into(),
            DataType::Binary => "binary".into(),
            DataType::BigInt => "bigint".into(),
            DataType::Int => "int".into(),
            DataType::Long => "long".into(),
            DataType::Char(size) => format!("char({size})"),
            DataType::Varchar(size) => format!("varchar({size})"),
            DataType::Decimal { precision, scale } => format!("decimal({precision},{scale})"),
            DataType::Array(element) => format!("array<{}>", element.canonical_name()),
        }
    }

    fn integer_rank(&self) -> Option<u8> {
        match self {
            DataType::Short => Some(1),
            DataType::Int => Some(2),
            DataType::Long => Some(3),
            DataType::BigInt => Some(4),
            _ => None,
        }
    }

    /// Decimal digits needed to hold any value of an integer type.
    fn integer_digits(&self) -> Option<u8> {
        match self {
            DataType::Short => Some(5),
            DataType::Int => Some(10),
            DataType::Long => Some(19),
            DataType::BigInt => Some(MAX_DECIMAL_PRECISION),
            _ => None,
        }
    }

    fn is_floating(&self) -> bool {
        matches!(self, DataType::Float | DataType::Double)
    }

    /// Smallest type both `self` and `other` can be read as.
    ///
    /// Incompatible pairs fall back to `string`.
    pub fn widen(&self, other: &DataType) -> DataType {
        use DataType::*;

        if self == other {
            return self.clone();
        }
        if let (Some(a), Some(b)) = (self.integer_rank(), other.integer_rank()) {
            return if a >= b { self.clone() } else { other.clone() };
        }
        match (self, other) {
            (Float, Double) | (Double, Float) => Double,
            (a, b) if a.is_floating() && b.integer_rank().is_some() => Double,
            (a, b) if b.is_floating() && a.integer_rank().is_some() => Double,
            (Decimal { precision: p1, scale: s1 }, Decimal { precision: p2, scale: s2 }) => {
                widen_decimal(p1 - s1.min(p1), *s1, p2 - s2.min(p2), *s2)
            }
            (Decimal { precision, scale }, int) | (int, Decimal { precision, scale })
                if int.integer_digits().is_some() =>
            {
                let digits = int.integer_digits().unwrap_or(MAX_DECIMAL_PRECISION);
                widen_decimal(precision - scale.min(precision), *scale, digits, 0)
            }
            (Decimal { .. }, f) | (f, Decimal { .. }) if f.is_floating() => Double,
            (Char(a), Char(b)) | (Char(a), Varchar(b)) | (Varchar(a), Char(b)) | (Varchar(a), Varchar(b)) => {
                Varchar(*a.max(b))
            }
            (Bytes, Binary) | (Binary, Bytes) => Binary,
            (Date, Timestamp) | (Timestamp, Date) => Timestamp,
            (Array(a), Array(b)) => DataType::array(a.widen(b)),
            _ => String,
        }
    }
}

fn widen_decimal(int1: u8, scale1: u8, int2: u8, scale2: u8) -> DataType {
    let scale = scale1.max(scale2);
    let precision = int1.max(int2).saturating_add(scale).min(MAX_DECIMAL_PRECISION);
    DataType::Decimal { precision, scale: scale.min(precision) }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_name())
    }
}

impl FromStr for DataType {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim().to_ascii_lowercase();
        let simple = match text.as_str() {
            "string" => Some(DataType::String),
            "boolean" => Some(DataType::Boolean),
            "bytes" => Some(DataType::Bytes),
            "timestamp" => Some(DataType::Timestamp),
            "short" => Some(DataType::Short),
            "float" => Some(DataType::Float),
            "double" => Some(DataType::Double),
            "date" => Some(DataType::Date),
            "binary" => Some(DataType::Binary),
            "bigint" => Some(DataType::BigInt),
            "int" => Some(DataType::Int),
            "long" => Some(DataType::Long),
            _ => None,
        };
        if let Some(dt) = simple {
            return Ok(dt);
        }

        let invalid = || DataError::schema(format!("unknown data type '{s}'"));

        if let Some(inner) = text.strip_prefix("array<").and_then(|r| r.strip_suffix('>')) {
            return Ok(DataType::array(inner.parse()?));
        }
        if let Some(args) = text.strip_prefix("decimal(").and_then(|r| r.strip_suffix(')')) {
            let (p, s) = args.split_once(',').ok_or_else(invalid)?;
            let precision: u8 = p.trim().parse().map_err(|_| invalid())?;
            let scale: u8 = s.trim().parse().map_err(|_| invalid())?;
            if scale > precision || precision > MAX_DECIMAL_PRECISION {
                return Err(invalid());
            }
            return Ok(DataType::decimal(precision, scale));
        }
        if let Some(size) = text.strip_prefix("varchar(").and_then(|r| r.strip_suffix(')')) {
            return Ok(DataType::Varchar(size.trim().parse().map_err(|_| invalid())?));
        }
        if let Some(size) = text.strip_prefix("char(").and_then(|r| r.strip_suffix(')')) {
            return Ok(DataType::Char(size.trim().parse().map_err(|_| invalid())?));
        }
        Err(invalid())
    }
}

impl serde::Serialize for DataType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical_name())
    }
}

impl<'de> serde::Deserialize<'de> for DataType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// A single column: name plus an optional type.
///
/// The type is `None` when a reader cannot tell (e.g. only nulls were seen).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(default, rename = "type")]
    pub data_type: Option<DataType>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self { name: name.into(), data_type: Some(data_type) }
    }

    pub fn untyped(name: impl Into<String>) -> Self {
        Self { name: name.into(), data_type: None }
    }
}

/// Ordered sequence of columns. Column position determines the value's
/// position in `Row`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Union by column name. Columns of `self` keep their positions, new
    /// columns of `other` are appended in their order, and shared columns
    /// get the widened type.
    pub fn merge(&self, other: &Schema) -> Schema {
        let mut columns = self.columns.clone();
        for column in &other.columns {
            match columns.iter_mut().find(|c| c.name == column.name) {
                Some(existing) => {
                    existing.data_type = match (&existing.data_type, &column.data_type) {
                        (Some(a), Some(b)) => Some(a.widen(b)),
                        (Some(a), None) => Some(a.clone()),
                        (None, b) => b.clone(),
                    };
                }
                None => columns.push(column.clone()),
            }
        }
        Schema { columns }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match &column.data_type {
                Some(dt) => write!(f, "{} {dt}", column.name)?,
                None => write!(f, "{} ?", column.name)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_names() {
        assert_eq!(DataType::decimal(10, 2).canonical_name(), "decimal(10,2)");
        assert_eq!(DataType::array(DataType::Int).canonical_name(), "array<int>");
        assert_eq!(DataType::Varchar(32).canonical_name(), "varchar(32)");
        assert_eq!(DataType::BigInt.canonical_name(), "bigint");
    }

    #[test]
    fn parse_back_from_name() {
        for dt in [
            DataType::decimal(10, 2),
            DataType::array(DataType::array(DataType::Long)),
            DataType::Char(3),
            DataType::Timestamp,
        ] {
            assert_eq!(dt.canonical_name().parse::<DataType>().unwrap(), dt);
        }
        assert!("decimal(2,5)".parse::<DataType>().is_err());
        assert!("uuid".parse::<DataType>().is_err());
    }

    #[test]
    fn widening_rules() {
        assert_eq!(DataType::Int.widen(&DataType::Long), DataType::Long);
        assert_eq!(DataType::Short.widen(&DataType::Float), DataType::Double);
        assert_eq!(
            DataType::decimal(10, 2).widen(&DataType::decimal(6, 4)),
            DataType::decimal(12, 4)
        );
        assert_eq!(DataType::Char(3).widen(&DataType::Varchar(10)), DataType::Varchar(10));
        assert_eq!(DataType::Boolean.widen(&DataType::Long), DataType::String);
        assert_eq!(
            DataType::array(DataType::Int).widen(&DataType::array(DataType::Long)),
            DataType::array(DataType::Long)
        );
    }

    #[test]
    fn merge_is_union_by_name() {
        let left = Schema::new(vec![
            Column::new("id", DataType::Int),
            Column::untyped("note"),
        ]);
        let right = Schema::new(vec![
            Column::new("id", DataType::Long),
            Column::new("note", DataType::String),
            Column::new("score", DataType::Double),
        ]);
        let merged = left.merge(&right);
        assert_eq!(merged.names(), vec!["id", "note", "score"]);
        assert_eq!(merged.columns[0].data_type, Some(DataType::Long));
        assert_eq!(merged.columns[1].data_type, Some(DataType::String));
    }

    #[test]
    fn schema_serde_uses_canonical_names() {
        let schema: Schema = serde_json::from_str(
            r#"{"columns":[{"name":"price","type":"decimal(18,8)"},{"name":"tag"}]}"#,
        )
        .unwrap();
        assert_eq!(schema.columns[0].data_type, Some(DataType::decimal(18, 8)));
        assert_eq!(schema.columns[1].data_type, None);
    }
}
