//! Schema 关键字实现：`type`、`properties`、`items`、`required`。
//!
//! 每个关键字独立实现 [`SchemaKeyword`]，节点只负责按顺序调度。

use std::collections::BTreeMap;

use crate::{
    error::{AxisError, Result},
    value::{Value, ValueType},
};

use super::{Schema, SchemaError};

type SchemaResult = std::result::Result<(), SchemaError>;

/// 单个关键字对值的三类操作。
pub(super) trait SchemaKeyword: Sized {
    fn validate(&self, value: &Value) -> SchemaResult;

    fn adjust(&self, value: &mut Value) -> SchemaResult;

    /// `source`/`target` 任一侧可能未声明该关键字。
    fn is_compatible(source: Option<&Self>, target: Option<&Self>) -> SchemaResult;
}

#[derive(Clone, Debug, PartialEq)]
pub(super) struct TypeKeyword {
    ty: ValueType,
}

impl TypeKeyword {
    pub(super) fn new(ty: ValueType) -> Self {
        Self { ty }
    }

    pub(super) fn ty(&self) -> ValueType {
        self.ty
    }

    fn mismatch(&self, given: ValueType) -> SchemaError {
        SchemaError::new(
            "",
            format!(
                "the value type does not match the schema type, given: {given}, expected: {}",
                self.ty
            ),
        )
    }
}

impl SchemaKeyword for TypeKeyword {
    fn validate(&self, value: &Value) -> SchemaResult {
        let given = value.value_type();
        if given == self.ty {
            return Ok(());
        }
        let numeric_target = self.ty.is_int() || self.ty.is_float();
        let numeric_given = given.is_int() || (given.is_float() && self.ty.is_float());
        if !(numeric_target && numeric_given) {
            return Err(self.mismatch(given));
        }
        // 数值在位宽之间可互相接受，但必须落在目标范围内。
        value
            .convert_to(self.ty)
            .map(|_| ())
            .map_err(|err| SchemaError::new("", err.message()))
    }

    fn adjust(&self, value: &mut Value) -> SchemaResult {
        if value.value_type() == self.ty {
            return Ok(());
        }
        let converted = value
            .convert_to(self.ty)
            .map_err(|err| SchemaError::new("", err.message()))?;
        *value = converted;
        Ok(())
    }

    fn is_compatible(source: Option<&Self>, target: Option<&Self>) -> SchemaResult {
        let (Some(source), Some(target)) = (source, target) else {
            return Ok(());
        };
        if source.ty.widens_to(target.ty) {
            Ok(())
        } else {
            Err(SchemaError::new(
                "",
                format!(
                    "type is incompatible, source is [{}], but target is [{}]",
                    source.ty, target.ty
                ),
            ))
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(super) struct PropertiesKeyword {
    properties: BTreeMap<String, Schema>,
}

impl PropertiesKeyword {
    pub(super) fn new(properties: BTreeMap<String, Schema>) -> Self {
        Self { properties }
    }

    pub(super) fn from_json(json: &serde_json::Value) -> Result<Self> {
        let object = json.as_object().ok_or_else(|| {
            AxisError::generic("The `properties` keyword should be an object.")
        })?;
        let mut properties = BTreeMap::new();
        for (name, schema) in object {
            let schema = Schema::from_json(schema).map_err(|err| {
                AxisError::generic(format!("Invalid schema of property `{name}`: {err}"))
            })?;
            properties.insert(name.clone(), schema);
        }
        Ok(Self { properties })
    }

    pub(super) fn get(&self, name: &str) -> Option<&Schema> {
        self.properties.get(name)
    }
}

impl SchemaKeyword for PropertiesKeyword {
    fn validate(&self, value: &Value) -> SchemaResult {
        let Some(object) = value.as_object() else {
            return Err(SchemaError::new("", "the value should be an object"));
        };
        for (name, prop_value) in object {
            if let Some(schema) = self.properties.get(name) {
                schema
                    .validate(prop_value)
                    .map_err(|err| err.prepend(&format!(".{name}")))?;
            }
        }
        Ok(())
    }

    fn adjust(&self, value: &mut Value) -> SchemaResult {
        let Some(object) = value.as_object_mut() else {
            return Err(SchemaError::new("", "the value should be an object"));
        };
        for (name, prop_value) in object.iter_mut() {
            if let Some(schema) = self.properties.get(name) {
                schema
                    .adjust(prop_value)
                    .map_err(|err| err.prepend(&format!(".{name}")))?;
            }
        }
        Ok(())
    }

    fn is_compatible(source: Option<&Self>, target: Option<&Self>) -> SchemaResult {
        let (Some(source), Some(target)) = (source, target) else {
            return Ok(());
        };
        let mut incompatible = Vec::new();
        for (name, source_schema) in &source.properties {
            let Some(target_schema) = target.properties.get(name) else {
                continue;
            };
            if let Err(err) = source_schema.is_compatible(target_schema) {
                incompatible.push(format!(".{name}{}: {}", err.path, err.reason));
            }
        }
        if incompatible.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::new(
                "",
                format!("{{ {} }}", incompatible.join("; ")),
            ))
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(super) struct ItemsKeyword {
    schema: Box<Schema>,
}

impl ItemsKeyword {
    pub(super) fn from_json(json: &serde_json::Value) -> Result<Self> {
        if !json.is_object() {
            return Err(AxisError::generic("The `items` keyword should be an object."));
        }
        Ok(Self {
            schema: Box::new(Schema::from_json(json)?),
        })
    }

    pub(super) fn schema(&self) -> &Schema {
        &self.schema
    }
}

impl SchemaKeyword for ItemsKeyword {
    fn validate(&self, value: &Value) -> SchemaResult {
        let Some(items) = value.as_array() else {
            return Err(SchemaError::new("", "the value should be an array"));
        };
        for (idx, item) in items.iter().enumerate() {
            self.schema
                .validate(item)
                .map_err(|err| err.prepend(&format!("[{idx}]")))?;
        }
        Ok(())
    }

    fn adjust(&self, value: &mut Value) -> SchemaResult {
        let Value::Array(items) = value else {
            return Err(SchemaError::new("", "the value should be an array"));
        };
        for (idx, item) in items.iter_mut().enumerate() {
            self.schema
                .adjust(item)
                .map_err(|err| err.prepend(&format!("[{idx}]")))?;
        }
        Ok(())
    }

    fn is_compatible(source: Option<&Self>, target: Option<&Self>) -> SchemaResult {
        let (Some(source), Some(target)) = (source, target) else {
            return Ok(());
        };
        source
            .schema
            .is_compatible(&target.schema)
            .map_err(|err| err.prepend("[]"))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(super) struct RequiredKeyword {
    names: Vec<String>,
}

impl RequiredKeyword {
    pub(super) fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub(super) fn from_json(json: &serde_json::Value) -> Result<Self> {
        let array = json
            .as_array()
            .ok_or_else(|| AxisError::generic("The `required` keyword should be an array."))?;
        if array.is_empty() {
            return Err(AxisError::generic(
                "The `required` keyword should not be empty.",
            ));
        }
        let mut names = Vec::with_capacity(array.len());
        for item in array {
            let name = item.as_str().ok_or_else(|| {
                AxisError::generic("The `required` keyword should only contain strings.")
            })?;
            names.push(name.to_owned());
        }
        Ok(Self { names })
    }

    pub(super) fn names(&self) -> &[String] {
        &self.names
    }
}

impl SchemaKeyword for RequiredKeyword {
    fn validate(&self, value: &Value) -> SchemaResult {
        let Some(object) = value.as_object() else {
            return Err(SchemaError::new("", "the value should be an object"));
        };
        let absent: Vec<String> = self
            .names
            .iter()
            .filter(|name| !object.contains_key(name.as_str()))
            .map(|name| format!("'{name}'"))
            .collect();
        if absent.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::new(
                "",
                format!("the required properties are absent: {}", absent.join(", ")),
            ))
        }
    }

    fn adjust(&self, _value: &mut Value) -> SchemaResult {
        Ok(())
    }

    fn is_compatible(source: Option<&Self>, target: Option<&Self>) -> SchemaResult {
        let Some(target) = target else {
            return Ok(());
        };
        let Some(source) = source else {
            return Err(SchemaError::new(
                "",
                "the `required` in the source schema is undefined",
            ));
        };
        let missing: Vec<String> = target
            .names
            .iter()
            .filter(|name| !source.names.contains(name))
            .map(|name| format!("'{name}'"))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::new(
                "",
                format!(
                    "required is incompatible, the properties [{}] are not required in the source schema",
                    missing.join(", ")
                ),
            ))
        }
    }
}
