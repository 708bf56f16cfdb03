//! # schema_store：按实体聚合的消息与属性 Schema
//!
//! ## 定位与职责（Why）
//! - 每个扩展在声明中给出自身属性的 Schema 与各类消息（按名称、方向）的属性 Schema；
//! - 运行时在发送前按 `*_out` 校验，在接收前按 `*_in` 校验，在写入扩展属性前按 `property` 校验；
//! - 图装配时比较连线两端的出向/入向 Schema，提前拒绝不兼容的连接。
//!
//! ## 声明格式（What）
//! ```json
//! {
//!   "property": { "name": { "type": "string" } },
//!   "cmd_in": [ { "name": "ping", "property": { ... }, "required": ["a"],
//!                 "result": { "property": { ... }, "required": [...] } } ],
//!   "cmd_out": [], "data_in": [], "data_out": [],
//!   "audio_frame_in": [], "audio_frame_out": [],
//!   "video_frame_in": [], "video_frame_out": []
//! }
//! ```
//! - 顶层 `required` 不被接受，必填约束只属于消息 Schema；
//! - 未声明 Schema 的消息或属性视为通过。

use std::collections::HashMap;

use crate::{
    error::{AxisError, Result},
    msg::MsgKind,
    schema::{Schema, SchemaError},
    value::Value,
};

/// 消息方向。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    In,
    Out,
}

/// 单个消息名称的 Schema。
#[derive(Clone, Debug, PartialEq)]
pub struct MsgSchema {
    name: String,
    property: Option<Schema>,
    result: Option<Box<MsgSchema>>,
}

impl MsgSchema {
    fn from_json(json: &serde_json::Value, with_result: bool) -> Result<MsgSchema> {
        let object = json
            .as_object()
            .ok_or_else(|| AxisError::generic("The message schema should be an object."))?;
        let name = object
            .get("name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_owned();

        let property = parse_property_object(object.get("property"), object.get("required"))?;

        let result = match object.get("result") {
            Some(result) if with_result => {
                let mut parsed = MsgSchema::from_json(result, false)?;
                parsed.name.clone_from(&name);
                Some(Box::new(parsed))
            }
            Some(_) => {
                return Err(AxisError::generic(format!(
                    "The `result` keyword is only supported in cmd schema, msg: `{name}`."
                )));
            }
            None => None,
        };

        Ok(MsgSchema {
            name,
            property,
            result,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn property(&self) -> Option<&Schema> {
        self.property.as_ref()
    }

    /// 命令对应 `CmdResult` 的 Schema。
    pub fn result(&self) -> Option<&MsgSchema> {
        self.result.as_deref()
    }

    pub fn adjust_properties(&self, props: &mut Value) -> Result<()> {
        match &self.property {
            Some(schema) => Ok(schema.adjust(props)?),
            None => Ok(()),
        }
    }

    pub fn validate_properties(&self, props: &Value) -> Result<()> {
        match &self.property {
            Some(schema) => Ok(schema.validate(props)?),
            None => Ok(()),
        }
    }

    /// 出向 Schema（`self`）能否接入入向 Schema（`target`）。
    ///
    /// - 属性按正向比较；命令结果反向流动，因此以目标的结果 Schema 为源比较。
    pub fn is_compatible(&self, target: &MsgSchema) -> std::result::Result<(), SchemaError> {
        if let (Some(source), Some(target)) = (&self.property, &target.property) {
            source.is_compatible(target)?;
        }
        if let (Some(source_result), Some(target_result)) = (&target.result, &self.result) {
            if let (Some(source), Some(target)) = (&source_result.property, &target_result.property)
            {
                source
                    .is_compatible(target)
                    .map_err(|err| err.prepend("result"))?;
            }
        }
        Ok(())
    }
}

/// 扩展声明的全部 Schema。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SchemaStore {
    property: Option<Schema>,
    msgs: HashMap<(MsgKind, Direction), HashMap<String, MsgSchema>>,
}

impl SchemaStore {
    /// 空仓库：所有校验均通过。
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(text: &str) -> Result<SchemaStore> {
        let json: serde_json::Value = serde_json::from_str(text)?;
        SchemaStore::from_json(&json)
    }

    /// 解析声明文档。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：文档必须为对象；`property` 为属性名到 Schema 的映射；
    ///   `<kind>_<in|out>` 为消息 Schema 数组；顶层出现 `required` 视为声明错误；
    /// - **执行逻辑 (How)**：逐个键解析，任何一个 Schema 非法都会让整个仓库构建失败，
    ///   保证运行期不会出现“部分生效”的 Schema。
    pub fn from_json(json: &serde_json::Value) -> Result<SchemaStore> {
        let object = json
            .as_object()
            .ok_or_else(|| AxisError::generic("The schema definition should be an object."))?;

        if object.contains_key("required") {
            return Err(AxisError::generic(
                "The `required` keyword is only supported in the msg schema.",
            ));
        }

        let mut store = SchemaStore {
            property: parse_property_object(object.get("property"), None)?,
            msgs: HashMap::new(),
        };

        for kind in MsgKind::SENDABLE {
            for direction in [Direction::In, Direction::Out] {
                let key = format!(
                    "{}_{}",
                    kind.as_str(),
                    match direction {
                        Direction::In => "in",
                        Direction::Out => "out",
                    }
                );
                let Some(list) = object.get(&key) else {
                    continue;
                };
                let list = list.as_array().ok_or_else(|| {
                    AxisError::generic(format!("The `{key}` schema should be an array."))
                })?;
                let mut by_name = HashMap::with_capacity(list.len());
                for item in list {
                    let schema = MsgSchema::from_json(item, kind == MsgKind::Cmd)?;
                    by_name.insert(schema.name.clone(), schema);
                }
                store.msgs.insert((kind, direction), by_name);
            }
        }

        Ok(store)
    }

    /// 查找某类消息的 Schema；`CmdResult` 使用对应命令的 `result` Schema。
    ///
    /// - `CmdResult` 的入向 Schema 来自发送方 `cmd_out` 中同名命令的 `result`，
    ///   出向 Schema 来自接收方 `cmd_in` 中同名命令的 `result`。
    pub fn msg_schema(&self, kind: MsgKind, name: &str, direction: Direction) -> Option<&MsgSchema> {
        match kind {
            MsgKind::CmdResult => {
                let cmd_direction = match direction {
                    Direction::In => Direction::Out,
                    Direction::Out => Direction::In,
                };
                self.msgs
                    .get(&(MsgKind::Cmd, cmd_direction))
                    .and_then(|m| m.get(name))
                    .and_then(MsgSchema::result)
            }
            _ => self.msgs.get(&(kind, direction)).and_then(|m| m.get(name)),
        }
    }

    pub fn property_schema(&self) -> Option<&Schema> {
        self.property.as_ref()
    }

    /// 校验整棵扩展属性树。
    pub fn validate_properties(&self, props: &Value) -> Result<()> {
        match &self.property {
            Some(schema) => Ok(schema.validate(props)?),
            None => Ok(()),
        }
    }

    /// 规整整棵扩展属性树。
    pub fn adjust_properties(&self, props: &mut Value) -> Result<()> {
        match &self.property {
            Some(schema) => Ok(schema.adjust(props)?),
            None => Ok(()),
        }
    }

    /// 校验单个属性键值；未声明的属性视为通过。
    pub fn validate_property_kv(&self, name: &str, value: &Value) -> Result<()> {
        match self.property.as_ref().and_then(|p| p.property(name)) {
            Some(schema) => schema
                .validate(value)
                .map_err(|err| AxisError::from(err.prepend(&format!(".{name}")))),
            None => Ok(()),
        }
    }

    /// 规整单个属性键值；未声明的属性保持原样。
    pub fn adjust_property_kv(&self, name: &str, value: &mut Value) -> Result<()> {
        match self.property.as_ref().and_then(|p| p.property(name)) {
            Some(schema) => schema
                .adjust(value)
                .map_err(|err| AxisError::from(err.prepend(&format!(".{name}")))),
            None => Ok(()),
        }
    }
}

/// 把 `{ name: schema }` 映射与可选 `required` 组装成对象 Schema。
fn parse_property_object(
    property: Option<&serde_json::Value>,
    required: Option<&serde_json::Value>,
) -> Result<Option<Schema>> {
    if property.is_none() && required.is_none() {
        return Ok(None);
    }
    let mut body = serde_json::Map::new();
    body.insert("type".to_owned(), serde_json::Value::from("object"));
    if let Some(property) = property {
        body.insert("properties".to_owned(), property.clone());
    }
    if let Some(required) = required {
        body.insert("required".to_owned(), required.clone());
    }
    Schema::from_json(&serde_json::Value::Object(body)).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITION: &str = r#"{
        "property": { "name": { "type": "string" }, "port": { "type": "uint16" } },
        "cmd_in": [
            { "name": "ping", "property": { "n": { "type": "int32" } }, "required": ["n"],
              "result": { "property": { "detail": { "type": "string" } } } }
        ],
        "data_out": [ { "name": "frame", "property": { "seq": { "type": "uint32" } } } ]
    }"#;

    #[test]
    fn parses_messages_by_kind_and_direction() {
        let store = SchemaStore::from_json_str(DEFINITION).expect("声明合法");
        assert!(store.msg_schema(MsgKind::Cmd, "ping", Direction::In).is_some());
        assert!(store.msg_schema(MsgKind::Cmd, "ping", Direction::Out).is_none());
        assert!(
            store
                .msg_schema(MsgKind::CmdResult, "ping", Direction::Out)
                .is_some(),
            "接收方回复 ping 的结果使用 cmd_in.result"
        );
        assert!(store.msg_schema(MsgKind::Data, "frame", Direction::Out).is_some());
    }

    #[test]
    fn property_kv_is_adjusted_then_validated() {
        let store = SchemaStore::from_json_str(DEFINITION).expect("声明合法");
        let mut port = Value::Int64(8080);
        store.adjust_property_kv("port", &mut port).expect("8080 可收窄");
        assert_eq!(port, Value::Uint16(8080));

        let err = store
            .validate_property_kv("name", &Value::Int64(1))
            .expect_err("name 必须为字符串");
        assert_eq!(err.path(), Some(".name"));
        assert!(store.validate_property_kv("unknown", &Value::Null).is_ok());
    }

    #[test]
    fn top_level_required_is_rejected() {
        let err = SchemaStore::from_json_str(r#"{"required":["a"]}"#).expect_err("顶层 required 非法");
        assert!(err.to_string().contains("only supported in the msg schema"));
    }
}
