use super::errors::ItemError;
use super::quality::Quality;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Flag bit marking an array type in a classic VT code.
pub const VT_ARRAY: u16 = 0x2000;

/// Data kind of a [`Variant`].
///
/// Replaces the `VARTYPE` word of the COM interface. Arrays are homogeneous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    Empty,
    Bool,
    I1,
    I2,
    I4,
    I8,
    UI1,
    UI2,
    UI4,
    UI8,
    R4,
    R8,
    #[serde(rename = "string")]
    Str,
    Date,
    Array(Box<VarType>),
}

impl VarType {
    /// Classic VT code (`VT_I4` = 3, `VT_ARRAY | VT_R8` = `0x2005`, ...).
    pub fn vt_code(&self) -> u16 {
        match self {
            Self::Empty => 0,
            Self::I2 => 2,
            Self::I4 => 3,
            Self::R4 => 4,
            Self::R8 => 5,
            Self::Date => 7,
            Self::Str => 8,
            Self::Bool => 11,
            Self::I1 => 16,
            Self::UI1 => 17,
            Self::UI2 => 18,
            Self::UI4 => 19,
            Self::I8 => 20,
            Self::UI8 => 21,
            Self::Array(elem) => VT_ARRAY | elem.vt_code(),
        }
    }

    pub fn from_vt_code(code: u16) -> Option<Self> {
        if code & VT_ARRAY != 0 {
            let elem = Self::from_vt_code(code & !VT_ARRAY)?;
            return match elem {
                Self::Empty | Self::Array(_) => None,
                elem => Some(Self::Array(Box::new(elem))),
            };
        }
        Some(match code {
            0 => Self::Empty,
            2 => Self::I2,
            3 => Self::I4,
            4 => Self::R4,
            5 => Self::R8,
            7 => Self::Date,
            8 => Self::Str,
            11 => Self::Bool,
            16 => Self::I1,
            17 => Self::UI1,
            18 => Self::UI2,
            19 => Self::UI4,
            20 => Self::I8,
            21 => Self::UI8,
            _ => return None,
        })
    }

    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::I1
                | Self::I2
                | Self::I4
                | Self::I8
                | Self::UI1
                | Self::UI2
                | Self::UI4
                | Self::UI8
                | Self::R4
                | Self::R8
        )
    }

    /// Whether values of this type can in principle be coerced to `target`.
    ///
    /// A `true` answer does not guarantee every value converts: a string may
    /// fail to parse and a wide integer may not fit a narrow one.
    pub fn can_convert_to(&self, target: &Self) -> bool {
        match (self, target) {
            (a, b) if a == b => true,
            (Self::Array(a), Self::Array(b)) => a.can_convert_to(b),
            (Self::Array(_), _) | (_, Self::Array(_)) => false,
            (Self::Empty, _) | (_, Self::Empty) => false,
            (Self::Str, _) | (_, Self::Str) => true,
            (Self::Date, _) | (_, Self::Date) => false,
            _ => true,
        }
    }
}

/// Tagged union over the protocol's scalar and array data kinds.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Variant {
    #[default]
    Empty,
    Bool(bool),
    I1(i8),
    I2(i16),
    I4(i32),
    I8(i64),
    UI1(u8),
    UI2(u16),
    UI4(u32),
    UI8(u64),
    R4(f32),
    R8(f64),
    Str(String),
    Date(DateTime<Utc>),
    Array(Vec<Variant>),
}

impl Variant {
    pub fn var_type(&self) -> VarType {
        match self {
            Self::Empty => VarType::Empty,
            Self::Bool(_) => VarType::Bool,
            Self::I1(_) => VarType::I1,
            Self::I2(_) => VarType::I2,
            Self::I4(_) => VarType::I4,
            Self::I8(_) => VarType::I8,
            Self::UI1(_) => VarType::UI1,
            Self::UI2(_) => VarType::UI2,
            Self::UI4(_) => VarType::UI4,
            Self::UI8(_) => VarType::UI8,
            Self::R4(_) => VarType::R4,
            Self::R8(_) => VarType::R8,
            Self::Str(_) => VarType::Str,
            Self::Date(_) => VarType::Date,
            Self::Array(items) => {
                VarType::Array(Box::new(items.first().map_or(VarType::Empty, Self::var_type)))
            }
        }
    }

    /// Value equality for change detection: a NaN is the same as a NaN.
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::R4(a), Self::R4(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::R8(a), Self::R8(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::Array(a), Self::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
            }
            _ => self == other,
        }
    }

    /// Numeric value as `f64`, used for deadband arithmetic.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::I1(v) => Some(f64::from(*v)),
            Self::I2(v) => Some(f64::from(*v)),
            Self::I4(v) => Some(f64::from(*v)),
            Self::I8(v) => Some(*v as f64),
            Self::UI1(v) => Some(f64::from(*v)),
            Self::UI2(v) => Some(f64::from(*v)),
            Self::UI4(v) => Some(f64::from(*v)),
            Self::UI8(v) => Some(*v as f64),
            Self::R4(v) => Some(f64::from(*v)),
            Self::R8(v) => Some(*v),
            _ => None,
        }
    }

    /// Zero value of the given type.
    pub fn default_for(ty: &VarType) -> Self {
        match ty {
            VarType::Empty => Self::Empty,
            VarType::Bool => Self::Bool(false),
            VarType::I1 => Self::I1(0),
            VarType::I2 => Self::I2(0),
            VarType::I4 => Self::I4(0),
            VarType::I8 => Self::I8(0),
            VarType::UI1 => Self::UI1(0),
            VarType::UI2 => Self::UI2(0),
            VarType::UI4 => Self::UI4(0),
            VarType::UI8 => Self::UI8(0),
            VarType::R4 => Self::R4(0.0),
            VarType::R8 => Self::R8(0.0),
            VarType::Str => Self::Str(String::new()),
            VarType::Date => Self::Date(DateTime::<Utc>::UNIX_EPOCH),
            VarType::Array(_) => Self::Array(Vec::new()),
        }
    }

    /// Convert to `target`.
    ///
    /// Fails with [`ItemError::RangeError`] when the value does not fit and
    /// [`ItemError::BadType`] when no conversion exists.
    pub fn coerce(&self, target: &VarType) -> Result<Self, ItemError> {
        if !matches!(self, Self::Array(_)) && &self.var_type() == target {
            return Ok(self.clone());
        }
        match (self, target) {
            (Self::Array(items), VarType::Array(elem)) => items
                .iter()
                .map(|v| v.coerce(elem))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Array),
            (Self::Array(_), _) | (_, VarType::Array(_)) => Err(ItemError::BadType),
            (Self::Empty, _) | (_, VarType::Empty) => Err(ItemError::BadType),
            (v, VarType::Str) => Ok(Self::Str(v.to_string())),
            (Self::Str(s), VarType::Date) => DateTime::parse_from_rfc3339(s.trim())
                .map(|d| Self::Date(d.with_timezone(&Utc)))
                .map_err(|_| ItemError::BadType),
            (Self::Date(_), _) | (_, VarType::Date) => Err(ItemError::BadType),
            (Self::Str(s), VarType::Bool) => parse_bool(s).map(Self::Bool),
            (Self::Str(s), target) => Number::parse(s)?.convert_to(target),
            (v, target) => Number::from_variant(v)
                .ok_or(ItemError::BadType)?
                .convert_to(target),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => Ok(()),
            Self::Bool(v) => write!(f, "{v}"),
            Self::I1(v) => write!(f, "{v}"),
            Self::I2(v) => write!(f, "{v}"),
            Self::I4(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::UI1(v) => write!(f, "{v}"),
            Self::UI2(v) => write!(f, "{v}"),
            Self::UI4(v) => write!(f, "{v}"),
            Self::UI8(v) => write!(f, "{v}"),
            Self::R4(v) => write!(f, "{v}"),
            Self::R8(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
            Self::Date(v) => f.write_str(&v.to_rfc3339()),
            Self::Array(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Self::I4(v)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Self::R8(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

fn parse_bool(s: &str) -> Result<bool, ItemError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" => Ok(true),
        "false" | "off" | "no" => Ok(false),
        other => match Number::parse(other)? {
            Number::Int(i) => Ok(i != 0),
            Number::Float(f) => Ok(f != 0.0),
        },
    }
}

fn narrow<T: TryFrom<i128>>(value: i128) -> Result<T, ItemError> {
    T::try_from(value).map_err(|_| ItemError::RangeError)
}

#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i128),
    Float(f64),
}

impl Number {
    fn from_variant(v: &Variant) -> Option<Self> {
        Some(match v {
            Variant::Bool(b) => Self::Int(i128::from(*b)),
            Variant::I1(x) => Self::Int(i128::from(*x)),
            Variant::I2(x) => Self::Int(i128::from(*x)),
            Variant::I4(x) => Self::Int(i128::from(*x)),
            Variant::I8(x) => Self::Int(i128::from(*x)),
            Variant::UI1(x) => Self::Int(i128::from(*x)),
            Variant::UI2(x) => Self::Int(i128::from(*x)),
            Variant::UI4(x) => Self::Int(i128::from(*x)),
            Variant::UI8(x) => Self::Int(i128::from(*x)),
            Variant::R4(x) => Self::Float(f64::from(*x)),
            Variant::R8(x) => Self::Float(*x),
            _ => return None,
        })
    }

    fn parse(s: &str) -> Result<Self, ItemError> {
        let t = s.trim();
        if let Ok(i) = t.parse::<i128>() {
            Ok(Self::Int(i))
        } else if let Ok(f) = t.parse::<f64>() {
            Ok(Self::Float(f))
        } else {
            Err(ItemError::BadType)
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn to_int(self) -> Result<i128, ItemError> {
        match self {
            Self::Int(i) => Ok(i),
            Self::Float(f) => {
                if !f.is_finite() {
                    return Err(ItemError::RangeError);
                }
                let r = f.round();
                if r < i64::MIN as f64 || r > u64::MAX as f64 {
                    return Err(ItemError::RangeError);
                }
                Ok(r as i128)
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn to_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn convert_to(self, target: &VarType) -> Result<Variant, ItemError> {
        Ok(match target {
            VarType::Bool => Variant::Bool(match self {
                Self::Int(i) => i != 0,
                Self::Float(f) => f != 0.0,
            }),
            VarType::I1 => Variant::I1(narrow(self.to_int()?)?),
            VarType::I2 => Variant::I2(narrow(self.to_int()?)?),
            VarType::I4 => Variant::I4(narrow(self.to_int()?)?),
            VarType::I8 => Variant::I8(narrow(self.to_int()?)?),
            VarType::UI1 => Variant::UI1(narrow(self.to_int()?)?),
            VarType::UI2 => Variant::UI2(narrow(self.to_int()?)?),
            VarType::UI4 => Variant::UI4(narrow(self.to_int()?)?),
            VarType::UI8 => Variant::UI8(narrow(self.to_int()?)?),
            VarType::R4 => {
                let f = self.to_f64();
                if f.is_finite() && f.abs() > f64::from(f32::MAX) {
                    return Err(ItemError::RangeError);
                }
                Variant::R4(f as f32)
            }
            VarType::R8 => Variant::R8(self.to_f64()),
            _ => return Err(ItemError::BadType),
        })
    }
}

/// Value, quality and timestamp: the atomic triple observed by readers.
#[derive(Debug, Clone, PartialEq)]
pub struct Vqt {
    pub value: Variant,
    pub quality: Quality,
    pub timestamp: DateTime<Utc>,
}

impl Vqt {
    pub fn new(value: Variant, quality: Quality, timestamp: DateTime<Utc>) -> Self {
        Self {
            value,
            quality,
            timestamp,
        }
    }

    /// Good-quality sample stamped with the current time.
    pub fn good(value: impl Into<Variant>) -> Self {
        Self::new(value.into(), Quality::GOOD, Utc::now())
    }

    /// Same value with a new quality and timestamp.
    pub fn with_quality(&self, quality: Quality, timestamp: DateTime<Utc>) -> Self {
        Self::new(self.value.clone(), quality, timestamp)
    }
}

impl Default for Vqt {
    fn default() -> Self {
        Self::new(Variant::Empty, Quality::default(), Utc::now())
    }
}
