//! # value：消息属性的递归值树
//!
//! ## 定位与职责（Why）
//! - 消息属性、扩展属性与 Schema 校验共享同一种递归值表示；
//! - 数值类型保留位宽（`Int8` … `Float64`），Schema 的 `adjust` 才能在位宽之间做无损转换。
//!
//! ## 行为契约（What）
//! - `ValueType` 与类型名字符串双向映射，名字即 Schema 中 `type` 关键字的取值；
//! - JSON 互转：JSON 整数映射为 `Int64`（超出 `i64` 时为 `Uint64`），实数映射为 `Float64`；
//!   `Buf` 与 `Ptr` 无法序列化为 JSON；
//! - 路径语法 `a.b[2].c`：`.` 分隔对象键，`[n]` 访问数组下标；空路径指向整棵树。

use std::{any::Any, collections::BTreeMap, fmt, sync::Arc};

use bytes::Bytes;

use crate::error::{AxisError, Result};

/// 值类型标签。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum ValueType {
    Invalid,
    Null,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    String,
    Buf,
    Ptr,
    Array,
    Object,
}

impl ValueType {
    /// 类型名，与 Schema 的 `type` 关键字一致。
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Invalid => "invalid",
            ValueType::Null => "null",
            ValueType::Bool => "bool",
            ValueType::Int8 => "int8",
            ValueType::Int16 => "int16",
            ValueType::Int32 => "int32",
            ValueType::Int64 => "int64",
            ValueType::Uint8 => "uint8",
            ValueType::Uint16 => "uint16",
            ValueType::Uint32 => "uint32",
            ValueType::Uint64 => "uint64",
            ValueType::Float32 => "float32",
            ValueType::Float64 => "float64",
            ValueType::String => "string",
            ValueType::Buf => "buf",
            ValueType::Ptr => "ptr",
            ValueType::Array => "array",
            ValueType::Object => "object",
        }
    }

    /// 由类型名解析；未知名字返回 `None`。
    pub fn from_name(name: &str) -> Option<Self> {
        let ty = match name {
            "null" => ValueType::Null,
            "bool" => ValueType::Bool,
            "int8" => ValueType::Int8,
            "int16" => ValueType::Int16,
            "int32" => ValueType::Int32,
            "int64" => ValueType::Int64,
            "uint8" => ValueType::Uint8,
            "uint16" => ValueType::Uint16,
            "uint32" => ValueType::Uint32,
            "uint64" => ValueType::Uint64,
            "float32" => ValueType::Float32,
            "float64" => ValueType::Float64,
            "string" => ValueType::String,
            "buf" => ValueType::Buf,
            "ptr" => ValueType::Ptr,
            "array" => ValueType::Array,
            "object" => ValueType::Object,
            _ => return None,
        };
        Some(ty)
    }

    pub fn is_signed_int(self) -> bool {
        matches!(
            self,
            ValueType::Int8 | ValueType::Int16 | ValueType::Int32 | ValueType::Int64
        )
    }

    pub fn is_unsigned_int(self) -> bool {
        matches!(
            self,
            ValueType::Uint8 | ValueType::Uint16 | ValueType::Uint32 | ValueType::Uint64
        )
    }

    pub fn is_int(self) -> bool {
        self.is_signed_int() || self.is_unsigned_int()
    }

    pub fn is_float(self) -> bool {
        matches!(self, ValueType::Float32 | ValueType::Float64)
    }

    /// 整数与浮点类型的位宽；非数值类型返回 0。
    pub fn bit_width(self) -> u32 {
        match self {
            ValueType::Int8 | ValueType::Uint8 => 8,
            ValueType::Int16 | ValueType::Uint16 => 16,
            ValueType::Int32 | ValueType::Uint32 | ValueType::Float32 => 32,
            ValueType::Int64 | ValueType::Uint64 | ValueType::Float64 => 64,
            _ => 0,
        }
    }

    /// 判断 `self` 的值域是否被 `target` 完整覆盖（数值拓宽）。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：自反且传递，构成预序：
    ///   - 同类型恒成立；
    ///   - 有符号 → 位宽不小于自身的有符号；
    ///   - 无符号 → 位宽不小于自身的无符号，或位宽严格更大的有符号；
    ///   - 任意整数 → 任意浮点；`float32` → `float64`。
    /// - **用途 (How)**：Schema 兼容性检查中的 `type` 关键字。
    pub fn widens_to(self, target: ValueType) -> bool {
        if self == target {
            return true;
        }
        if self.is_signed_int() && target.is_signed_int() {
            return self.bit_width() <= target.bit_width();
        }
        if self.is_unsigned_int() && target.is_unsigned_int() {
            return self.bit_width() <= target.bit_width();
        }
        if self.is_unsigned_int() && target.is_signed_int() {
            return self.bit_width() < target.bit_width();
        }
        if self.is_int() && target.is_float() {
            return true;
        }
        self == ValueType::Float32 && target == ValueType::Float64
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 不透明指针载荷。
///
/// 仅用于进程内传递宿主对象；相等性按引用身份判断，无法序列化。
#[derive(Clone)]
pub struct PtrValue(pub Arc<dyn Any + Send + Sync>);

impl fmt::Debug for PtrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PtrValue(..)")
    }
}

impl PartialEq for PtrValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// 递归属性值。
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Invalid,
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
    Buf(Bytes),
    Ptr(PtrValue),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// 空对象。
    pub fn object() -> Self {
        Value::Object(BTreeMap::new())
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Invalid => ValueType::Invalid,
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Int8(_) => ValueType::Int8,
            Value::Int16(_) => ValueType::Int16,
            Value::Int32(_) => ValueType::Int32,
            Value::Int64(_) => ValueType::Int64,
            Value::Uint8(_) => ValueType::Uint8,
            Value::Uint16(_) => ValueType::Uint16,
            Value::Uint32(_) => ValueType::Uint32,
            Value::Uint64(_) => ValueType::Uint64,
            Value::Float32(_) => ValueType::Float32,
            Value::Float64(_) => ValueType::Float64,
            Value::String(_) => ValueType::String,
            Value::Buf(_) => ValueType::Buf,
            Value::Ptr(_) => ValueType::Ptr,
            Value::Array(_) => ValueType::Array,
            Value::Object(_) => ValueType::Object,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// 以 `i128` 读取任意整数，便于跨位宽比较。
    pub fn as_i128(&self) -> Option<i128> {
        let v = match self {
            Value::Int8(v) => i128::from(*v),
            Value::Int16(v) => i128::from(*v),
            Value::Int32(v) => i128::from(*v),
            Value::Int64(v) => i128::from(*v),
            Value::Uint8(v) => i128::from(*v),
            Value::Uint16(v) => i128::from(*v),
            Value::Uint32(v) => i128::from(*v),
            Value::Uint64(v) => i128::from(*v),
            _ => return None,
        };
        Some(v)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_i128().and_then(|v| i64::try_from(v).ok())
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i128().and_then(|v| u64::try_from(v).ok())
    }

    /// 以 `f64` 读取任意数值。
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float32(v) => Some(f64::from(*v)),
            Value::Float64(v) => Some(*v),
            other => other.as_i128().map(|v| v as f64),
        }
    }

    /// 将当前值无损转换为目标数值类型。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：Schema `adjust` 需要在“整数位宽”“整数/浮点”之间迁移，而不得静默截断；
    /// - **契约 (What)**：
    ///   - 整数 → 整数：超出目标范围返回 `out of range of <type>`；
    ///   - 整数 → 浮点：直接转换；
    ///   - 浮点 → 整数：仅当值为有限整数且在范围内；
    ///   - `float64` → `float32`：有限值需落在 `f32` 范围内；
    ///   - 其余组合返回 `unsupported conversion from `X` to `Y``。
    pub fn convert_to(&self, target: ValueType) -> Result<Value> {
        let source = self.value_type();
        if source == target {
            return Ok(self.clone());
        }

        if target.is_int() {
            let wide = if let Some(v) = self.as_i128() {
                v
            } else if source.is_float() {
                let f = self.as_f64().unwrap_or(f64::NAN);
                if !f.is_finite() || f.fract() != 0.0 || f.abs() > 1.9e19 {
                    return Err(out_of_range(target));
                }
                f as i128
            } else {
                return Err(unsupported(source, target));
            };
            return int_from_i128(wide, target);
        }

        if target.is_float() {
            let f = match self.as_f64() {
                Some(f) if source.is_int() || source.is_float() => f,
                _ => return Err(unsupported(source, target)),
            };
            return match target {
                ValueType::Float64 => Ok(Value::Float64(f)),
                _ => {
                    if f.is_finite() && f.abs() > f64::from(f32::MAX) {
                        Err(out_of_range(target))
                    } else {
                        Ok(Value::Float32(f as f32))
                    }
                }
            };
        }

        Err(unsupported(source, target))
    }

    /// 判断数值是否能被 `target` 类型无损承载（不做实际转换）。
    pub fn fits_in(&self, target: ValueType) -> bool {
        let source = self.value_type();
        if source == target {
            return true;
        }
        if target.is_int() && source.is_int() {
            return self.convert_to(target).is_ok();
        }
        if target.is_float() && (source.is_int() || source.is_float()) {
            return self.convert_to(target).is_ok();
        }
        false
    }

    /// 按路径读取子值。
    pub fn peek(&self, path: &str) -> Result<&Value> {
        if path.is_empty() {
            return Ok(self);
        }
        let segments = parse_path(path)?;
        let mut cursor = self;
        for segment in &segments {
            let next = match (segment, cursor) {
                (PathSegment::Key(key), Value::Object(map)) => map.get(key.as_str()),
                (PathSegment::Index(idx), Value::Array(items)) => items.get(*idx),
                _ => None,
            };
            cursor = next.ok_or_else(|| {
                AxisError::generic(format!("Failed to find property: {path}"))
            })?;
        }
        Ok(cursor)
    }

    /// 按路径写入子值，必要时创建中间对象/数组。
    ///
    /// - **契约 (What)**：空路径要求 `value` 为对象并整体替换；根节点必须为对象；
    ///   数组下标只能覆盖已有元素或恰好追加一个元素，更大的下标返回 `InvalidArgument`；
    ///   中间节点类型不符时被替换为所需容器。
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        if path.is_empty() {
            if value.value_type() != ValueType::Object {
                return Err(AxisError::invalid_argument(
                    "the whole property tree must be replaced by an object",
                ));
            }
            *self = value;
            return Ok(());
        }
        if self.value_type() != ValueType::Object {
            return Err(AxisError::invalid_argument(
                "Path is not corresponding to the value type.",
            ));
        }

        let segments = parse_path(path)?;
        let mut cursor = self;
        let last = segments.len() - 1;
        for (idx, segment) in segments.iter().enumerate() {
            let make_child = || match segments.get(idx + 1) {
                Some(PathSegment::Index(_)) => Value::Array(Vec::new()),
                _ => Value::object(),
            };
            let slot: &mut Value = match segment {
                PathSegment::Key(key) => {
                    let map = ensure_object(cursor);
                    map.entry(key.clone()).or_insert_with(make_child)
                }
                PathSegment::Index(pos) => {
                    let items = ensure_array(cursor);
                    if *pos > items.len() {
                        return Err(AxisError::invalid_argument(format!(
                            "index {pos} is out of bounds in `{path}`, the array has {} items",
                            items.len()
                        )));
                    }
                    if *pos == items.len() {
                        items.push(make_child());
                    }
                    &mut items[*pos]
                }
            };
            if idx == last {
                *slot = value;
                return Ok(());
            }
            let wants_array = matches!(segments.get(idx + 1), Some(PathSegment::Index(_)));
            match (wants_array, slot.value_type()) {
                (true, ValueType::Array) | (false, ValueType::Object) => {}
                _ => *slot = make_child(),
            }
            cursor = slot;
        }
        Ok(())
    }

    /// 由 JSON 构造值树。
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int64(i)
                } else if let Some(u) = n.as_u64() {
                    Value::Uint64(u)
                } else {
                    Value::Float64(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// 解析 JSON 文本。
    pub fn from_json_str(text: &str) -> Result<Value> {
        let json: serde_json::Value = serde_json::from_str(text)?;
        Ok(Value::from_json(&json))
    }

    /// 转换为 JSON；`Buf`、`Ptr` 与 `Invalid` 无法表示。
    pub fn to_json(&self) -> Result<serde_json::Value> {
        use serde_json::Value as Json;

        let json = match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int8(_) | Value::Int16(_) | Value::Int32(_) | Value::Int64(_) => {
                Json::from(self.as_i64().unwrap_or_default())
            }
            Value::Uint8(_) | Value::Uint16(_) | Value::Uint32(_) | Value::Uint64(_) => {
                Json::from(self.as_u64().unwrap_or_default())
            }
            Value::Float32(v) => float_to_json(f64::from(*v))?,
            Value::Float64(v) => float_to_json(*v)?,
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(
                items
                    .iter()
                    .map(Value::to_json)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json()?);
                }
                Json::Object(out)
            }
            Value::Invalid | Value::Buf(_) | Value::Ptr(_) => {
                return Err(AxisError::generic(format!(
                    "value of type `{}` can not be converted to json",
                    self.value_type()
                )));
            }
        };
        Ok(json)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float64(value)
    }
}

fn float_to_json(v: f64) -> Result<serde_json::Value> {
    serde_json::Number::from_f64(v)
        .map(serde_json::Value::Number)
        .ok_or_else(|| AxisError::generic(format!("non-finite float `{v}` has no json form")))
}

fn out_of_range(target: ValueType) -> AxisError {
    AxisError::generic(format!("out of range of {target}"))
}

fn unsupported(source: ValueType, target: ValueType) -> AxisError {
    AxisError::generic(format!(
        "unsupported conversion from `{source}` to `{target}`"
    ))
}

fn int_from_i128(v: i128, target: ValueType) -> Result<Value> {
    let converted = match target {
        ValueType::Int8 => i8::try_from(v).ok().map(Value::Int8),
        ValueType::Int16 => i16::try_from(v).ok().map(Value::Int16),
        ValueType::Int32 => i32::try_from(v).ok().map(Value::Int32),
        ValueType::Int64 => i64::try_from(v).ok().map(Value::Int64),
        ValueType::Uint8 => u8::try_from(v).ok().map(Value::Uint8),
        ValueType::Uint16 => u16::try_from(v).ok().map(Value::Uint16),
        ValueType::Uint32 => u32::try_from(v).ok().map(Value::Uint32),
        ValueType::Uint64 => u64::try_from(v).ok().map(Value::Uint64),
        _ => None,
    };
    converted.ok_or_else(|| out_of_range(target))
}

fn ensure_object(value: &mut Value) -> &mut BTreeMap<String, Value> {
    if value.value_type() != ValueType::Object {
        *value = Value::object();
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced by an object"),
    }
}

fn ensure_array(value: &mut Value) -> &mut Vec<Value> {
    if value.value_type() != ValueType::Array {
        *value = Value::Array(Vec::new());
    }
    match value {
        Value::Array(items) => items,
        _ => unreachable!("value was just replaced by an array"),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

/// 解析 `a.b[0].c` 形式的路径。
fn parse_path(path: &str) -> Result<Vec<PathSegment>> {
    let invalid = || AxisError::invalid_argument(format!("Failed to parse the path: {path}"));
    let mut segments = Vec::new();
    for part in path.split('.') {
        let mut pieces = part.split('[');
        let key = pieces.next().unwrap_or_default();
        if key.is_empty() {
            return Err(invalid());
        }
        segments.push(PathSegment::Key(key.to_owned()));
        for piece in pieces {
            let digits = piece.strip_suffix(']').ok_or_else(invalid)?;
            let index = digits.parse::<usize>().map_err(|_| invalid())?;
            segments.push(PathSegment::Index(index));
        }
    }
    Ok(segments)
}
