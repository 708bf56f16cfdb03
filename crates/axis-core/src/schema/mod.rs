//! # schema：声明式属性 Schema 引擎
//!
//! ## 定位与职责（Why）
//! - 消息在跨越组件边界前必须被校验与规整：`validate` 判定值是否满足声明，`adjust` 将值迁移到
//!   Schema 偏好的表示（例如把 `int64` 字面量收窄为 `uint8`），`is_compatible` 判定生产者的
//!   出向 Schema 能否接入消费者的入向 Schema；
//! - Schema 一经解析即不可变，由声明方的 [`SchemaStore`](crate::schema_store::SchemaStore) 持有。
//!
//! ## 结构（How）
//! - 每个节点恰有一个 `type` 关键字，并按类型携带 `properties` / `required`（对象）或 `items`（数组）；
//! - 关键字各自实现 [`keywords::SchemaKeyword`]，节点按固定顺序 `type → properties → items → required`
//!   依次调用，首个失败即中止；
//! - 错误携带结构化路径：对象属性前缀 `.name`，数组元素前缀 `[i]`，兼容性检查中的数组为 `[]`。

mod keywords;

use std::fmt;

use crate::{
    error::{AxisError, Result},
    value::{Value, ValueType},
};

use keywords::{ItemsKeyword, PropertiesKeyword, RequiredKeyword, SchemaKeyword, TypeKeyword};

/// Schema 校验错误：结构化路径 + 原因。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SchemaError {
    pub path: String,
    pub reason: String,
}

impl SchemaError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// 在路径前追加一段（由内向外构建路径）。
    pub(crate) fn prepend(mut self, segment: &str) -> Self {
        self.path.insert_str(0, segment);
        self
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.reason)
        } else {
            write!(f, "{}: {}", self.path, self.reason)
        }
    }
}

impl std::error::Error for SchemaError {}

/// Schema 节点的三种形态。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchemaKind {
    Primitive,
    Object,
    Array,
}

/// 不可变的 Schema 树节点。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `type` 必填且唯一；`properties`/`required` 仅出现在对象节点，`items` 仅出现在数组节点；
///   - 解析完成后不再修改，可在线程间共享只读引用；
/// - **设计权衡 (Trade-offs)**：关键字以具体字段而非动态表保存，关键字集合固定时可获得静态分派，
///   新增关键字需要同时扩展解析与三类操作。
#[derive(Clone, Debug, PartialEq)]
pub struct Schema {
    type_kw: TypeKeyword,
    properties: Option<PropertiesKeyword>,
    items: Option<ItemsKeyword>,
    required: Option<RequiredKeyword>,
}

impl Schema {
    /// 由 JSON 文本解析 Schema。
    pub fn from_json_str(text: &str) -> Result<Schema> {
        let json: serde_json::Value = serde_json::from_str(text)?;
        Schema::from_json(&json)
    }

    /// 由 JSON 文档解析 Schema。
    ///
    /// - **前置条件**：文档为对象且包含已知的 `type`；
    /// - **后置条件**：返回的 Schema 满足“每节点一个 `type`”的不变量，其余未知关键字被忽略。
    pub fn from_json(json: &serde_json::Value) -> Result<Schema> {
        let object = json
            .as_object()
            .ok_or_else(|| AxisError::generic("Invalid schema json, it should be an object."))?;

        let type_name = object
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| AxisError::generic("The schema should have a `type` keyword."))?;
        let ty = ValueType::from_name(type_name)
            .filter(|ty| *ty != ValueType::Null)
            .ok_or_else(|| {
                AxisError::generic(format!("Unsupported schema type `{type_name}`."))
            })?;

        let mut schema = Schema::of_type(ty);

        if let Some(properties) = object.get("properties") {
            if ty != ValueType::Object {
                return Err(AxisError::generic(
                    "The `properties` keyword is only supported in object schema.",
                ));
            }
            schema.properties = Some(PropertiesKeyword::from_json(properties)?);
        }

        if let Some(items) = object.get("items") {
            if ty != ValueType::Array {
                return Err(AxisError::generic(
                    "The `items` keyword is only supported in array schema.",
                ));
            }
            schema.items = Some(ItemsKeyword::from_json(items)?);
        }

        if let Some(required) = object.get("required") {
            if ty != ValueType::Object {
                return Err(AxisError::generic(
                    "The `required` keyword is only supported in object schema.",
                ));
            }
            schema.required = Some(RequiredKeyword::from_json(required)?);
        }

        Ok(schema)
    }

    /// 构造只含 `type` 关键字的节点。
    pub fn of_type(ty: ValueType) -> Schema {
        Schema {
            type_kw: TypeKeyword::new(ty),
            properties: None,
            items: None,
            required: None,
        }
    }

    /// 由属性表与必填列表组装对象 Schema。
    pub fn object(
        properties: impl IntoIterator<Item = (String, Schema)>,
        required: Option<Vec<String>>,
    ) -> Schema {
        let mut schema = Schema::of_type(ValueType::Object);
        schema.properties = Some(PropertiesKeyword::new(properties.into_iter().collect()));
        schema.required = required.map(RequiredKeyword::new);
        schema
    }

    pub fn value_type(&self) -> ValueType {
        self.type_kw.ty()
    }

    pub fn kind(&self) -> SchemaKind {
        match self.value_type() {
            ValueType::Object => SchemaKind::Object,
            ValueType::Array => SchemaKind::Array,
            _ => SchemaKind::Primitive,
        }
    }

    /// 对象 Schema 中某个属性的子 Schema。
    pub fn property(&self, name: &str) -> Option<&Schema> {
        self.properties.as_ref().and_then(|p| p.get(name))
    }

    /// 对象 Schema 的必填属性名。
    pub fn required(&self) -> Option<&[String]> {
        self.required.as_ref().map(RequiredKeyword::names)
    }

    /// 数组 Schema 的元素 Schema。
    pub fn items(&self) -> Option<&Schema> {
        self.items.as_ref().map(ItemsKeyword::schema)
    }

    /// 深度优先校验 `value`。
    pub fn validate(&self, value: &Value) -> std::result::Result<(), SchemaError> {
        self.type_kw.validate(value)?;
        if let Some(properties) = &self.properties {
            properties.validate(value)?;
        }
        if let Some(items) = &self.items {
            items.validate(value)?;
        }
        if let Some(required) = &self.required {
            required.validate(value)?;
        }
        Ok(())
    }

    /// 以相同遍历顺序尝试把 `value` 无损迁移到 Schema 声明的表示。
    pub fn adjust(&self, value: &mut Value) -> std::result::Result<(), SchemaError> {
        self.type_kw.adjust(value)?;
        if let Some(properties) = &self.properties {
            properties.adjust(value)?;
        }
        if let Some(items) = &self.items {
            items.adjust(value)?;
        }
        if let Some(required) = &self.required {
            required.adjust(value)?;
        }
        Ok(())
    }

    /// 判断以 `self` 为源、`target` 为目标的连接是否兼容。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：图装配时提前拒绝“生产者可能发出消费者无法接收的值”的连线；
    /// - **执行逻辑 (How)**：先比较 `type`，类型不兼容时不再比较其余关键字；随后依次比较
    ///   `properties`、`items`、`required`，首个失败中止并返回带路径的原因；
    /// - **契约 (What)**：对 `type` 与 `required` 构成预序（自反、传递）。
    pub fn is_compatible(&self, target: &Schema) -> std::result::Result<(), SchemaError> {
        TypeKeyword::is_compatible(Some(&self.type_kw), Some(&target.type_kw))?;
        PropertiesKeyword::is_compatible(self.properties.as_ref(), target.properties.as_ref())?;
        ItemsKeyword::is_compatible(self.items.as_ref(), target.items.as_ref())?;
        RequiredKeyword::is_compatible(self.required.as_ref(), target.required.as_ref())?;
        Ok(())
    }

    /// 先规整后校验，是消息与属性入站时的标准组合。
    pub fn adjust_and_validate(&self, value: &mut Value) -> Result<()> {
        self.adjust(value)?;
        self.validate(value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(text: &str) -> Schema {
        Schema::from_json_str(text).expect("测试 Schema 必须合法")
    }

    #[test]
    fn parse_rejects_misplaced_keywords() {
        assert!(Schema::from_json_str(r#"{"type":"int8","items":{"type":"int8"}}"#).is_err());
        assert!(Schema::from_json_str(r#"{"type":"array","required":["a"]}"#).is_err());
        assert!(Schema::from_json_str(r#"{"type":"object","required":[]}"#).is_err());
        assert!(Schema::from_json_str(r#"{"type":"nope"}"#).is_err());
        assert!(Schema::from_json_str(r#"{"properties":{}}"#).is_err());
    }

    #[test]
    fn validate_reports_nested_path() {
        let s = schema(
            r#"{"type":"object","properties":{"a":{"type":"array","items":{"type":"string"}}}}"#,
        );
        let value = Value::from_json(&serde_json::json!({"a": ["x", 1]}));
        let err = s.validate(&value).expect_err("第二个元素类型不符");
        assert_eq!(
            err.to_string(),
            ".a[1]: the value type does not match the schema type, given: int64, expected: string"
        );
    }

    #[test]
    fn adjust_narrows_integers_inside_objects() {
        let s = schema(r#"{"type":"object","properties":{"n":{"type":"uint16"}}}"#);
        let mut value = Value::from_json(&serde_json::json!({"n": 7, "extra": "kept"}));
        s.adjust(&mut value).expect("7 可无损收窄");
        assert_eq!(value.peek("n"), Ok(&Value::Uint16(7)));
        assert_eq!(value.peek("extra"), Ok(&Value::from("kept")));
    }

    #[test]
    fn compatibility_collects_property_failures() {
        let source = schema(
            r#"{"type":"object","properties":{"a":{"type":"string"},"b":{"type":"int64"},"c":{"type":"int8"}}}"#,
        );
        let target = schema(
            r#"{"type":"object","properties":{"a":{"type":"int8"},"b":{"type":"int8"},"d":{"type":"bool"}}}"#,
        );
        let err = source.is_compatible(&target).expect_err("a 与 b 均不兼容");
        assert_eq!(
            err.to_string(),
            "{ .a: type is incompatible, source is [string], but target is [int8]; .b: type is incompatible, source is [int64], but target is [int8] }"
        );
    }

    #[test]
    fn items_compatibility_uses_bracket_path() {
        let source = schema(r#"{"type":"array","items":{"type":"int64"}}"#);
        let target = schema(r#"{"type":"array","items":{"type":"int32"}}"#);
        let err = source.is_compatible(&target).expect_err("元素位宽收窄不兼容");
        assert_eq!(err.path, "[]");
        assert!(target.is_compatible(&source).is_ok(), "int32 可拓宽为 int64");
    }
}
