//! 资源值类型与入边收敛。
//!
//! 缓存内的值是带标签的标量；字符串只在总线入边出现，收敛一次后
//! 下游全部走封闭枚举分支。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 资源声明的值类型，决定寄存器宽度与序列化方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Bool,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    Int64,
    Uint64,
}

impl Default for ValueType {
    fn default() -> Self {
        Self::Uint16
    }
}

impl ValueType {
    /// 该类型占用的寄存器字数。
    pub fn register_count(self) -> u16 {
        match self {
            Self::Bool | Self::Int16 | Self::Uint16 => 1,
            Self::Int32 | Self::Uint32 | Self::Float32 => 2,
            Self::Int64 | Self::Uint64 | Self::Float64 => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int16 => "int16",
            Self::Uint16 => "uint16",
            Self::Int32 => "int32",
            Self::Uint32 => "uint32",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Int64 => "int64",
            Self::Uint64 => "uint64",
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 带标签的资源标量。JSON 表现为裸标量。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceValue {
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Text(String),
}

impl ResourceValue {
    /// 从 JSON 标量构造；数组/对象/null 不是合法资源值。
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::I64)
                .or_else(|| n.as_u64().map(Self::U64))
                .or_else(|| n.as_f64().map(Self::F64)),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    /// 数值视图；字符串尝试解析。
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::I64(v) => Some(*v as f64),
            Self::U64(v) => Some(*v as f64),
            Self::F64(v) => Some(*v),
            Self::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// 真值视图（线圈/离散量打包用）。
    pub fn truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::I64(v) => *v != 0,
            Self::U64(v) => *v != 0,
            Self::F64(v) => *v != 0.0,
            Self::Text(s) => matches!(s.trim(), "true" | "1" | "on"),
        }
    }

    /// 按映射声明的类型做一次入边收敛；无法表达时返回 None。
    pub fn coerce(&self, value_type: ValueType) -> Option<Self> {
        match value_type {
            ValueType::Bool => Some(Self::Bool(self.truthy())),
            ValueType::Int16 | ValueType::Int32 | ValueType::Int64 => match self {
                Self::I64(v) => Some(Self::I64(*v)),
                Self::U64(v) => i64::try_from(*v).ok().map(Self::I64),
                other => other.as_f64().map(|f| Self::I64(f as i64)),
            },
            ValueType::Uint16 | ValueType::Uint32 | ValueType::Uint64 => match self {
                Self::U64(v) => Some(Self::U64(*v)),
                Self::I64(v) => u64::try_from(*v).ok().map(Self::U64),
                other => other.as_f64().map(|f| Self::U64(f as u64)),
            },
            ValueType::Float32 | ValueType::Float64 => self.as_f64().map(Self::F64),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::I64(v) => Value::from(*v),
            Self::U64(v) => Value::from(*v),
            Self::F64(v) => Value::from(*v),
            Self::Text(s) => Value::String(s.clone()),
        }
    }
}

impl std::fmt::Display for ResourceValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::I64(v) => write!(f, "{}", v),
            Self::U64(v) => write!(f, "{}", v),
            Self::F64(v) => write!(f, "{}", v),
            Self::Text(s) => f.write_str(s),
        }
    }
}
