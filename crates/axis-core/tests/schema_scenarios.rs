//! Schema 与 SchemaStore 的端到端场景：声明 → 规整 → 校验 → 连线兼容。

use axis_core::{Direction, Message, MsgKind, Schema, SchemaStore, Value, ValueType};

fn schema(text: &str) -> Schema {
    Schema::from_json_str(text).expect("测试 Schema 必须合法")
}

#[test]
fn missing_required_property_is_reported_by_name() {
    let s = schema(r#"{"type":"object","properties":{"a":{"type":"string"}},"required":["a"]}"#);
    let err = s.validate(&Value::object()).expect_err("缺少必填属性 a");
    assert!(err.to_string().contains("'a'"), "错误信息必须点名缺失属性: {err}");

    let ok = Value::from_json(&serde_json::json!({"a": "x"}));
    assert!(s.validate(&ok).is_ok());
}

#[test]
fn integral_float_adjusts_into_unsigned_slot() {
    let s = schema(r#"{"type":"uint8"}"#);

    let mut five = Value::Float64(5.0);
    s.adjust(&mut five).expect("5.0 可无损转为 uint8");
    assert_eq!(five, Value::Uint8(5));

    let mut negative = Value::Float64(-1.0);
    assert!(s.adjust(&mut negative).is_err(), "-1.0 超出 uint8 值域");

    let mut fractional = Value::Float64(2.5);
    assert!(s.adjust(&mut fractional).is_err(), "非整数浮点不得截断");
}

#[test]
fn validate_is_range_aware_for_integers() {
    let s = schema(r#"{"type":"int8"}"#);
    assert!(s.validate(&Value::Int64(127)).is_ok());
    assert!(s.validate(&Value::Int64(128)).is_err());
    assert!(
        s.validate(&Value::Float64(1.0)).is_err(),
        "整数 Schema 不接受浮点值，需先 adjust"
    );
    assert!(schema(r#"{"type":"float32"}"#).validate(&Value::Int64(3)).is_ok());
}

#[test]
fn type_compatibility_follows_widening() {
    let compatible = |a: ValueType, b: ValueType| Schema::of_type(a).is_compatible(&Schema::of_type(b));
    assert!(compatible(ValueType::Int8, ValueType::Int64).is_ok());
    assert!(compatible(ValueType::Uint8, ValueType::Int16).is_ok());
    assert!(compatible(ValueType::Uint32, ValueType::Int32).is_err());
    assert!(compatible(ValueType::Int32, ValueType::Float32).is_ok());
    assert!(compatible(ValueType::Float64, ValueType::Float32).is_err());

    let err = compatible(ValueType::String, ValueType::Bool).expect_err("字符串不能接入布尔");
    assert_eq!(
        err.to_string(),
        "type is incompatible, source is [string], but target is [bool]"
    );
}

#[test]
fn required_compatibility_demands_superset_in_source() {
    let source = schema(r#"{"type":"object","properties":{"a":{"type":"int8"}},"required":["a"]}"#);
    let strict = schema(
        r#"{"type":"object","properties":{"a":{"type":"int8"},"b":{"type":"int8"}},"required":["a","b"]}"#,
    );
    let loose = schema(r#"{"type":"object","properties":{"a":{"type":"int8"}}}"#);

    assert!(source.is_compatible(&loose).is_ok(), "目标无必填约束时恒兼容");
    let err = source.is_compatible(&strict).expect_err("源未保证 b 必填");
    assert!(err.to_string().contains("'b'"), "{err}");

    let err = loose.is_compatible(&source).expect_err("源未声明 required");
    assert!(err.to_string().contains("undefined"), "{err}");
}

const PRODUCER: &str = r#"{
    "property": { "rate": { "type": "uint32" } },
    "cmd_out": [
        { "name": "hello", "property": { "n": { "type": "int8" } }, "required": ["n"],
          "result": { "property": { "echo": { "type": "int64" } } } }
    ],
    "data_out": [ { "name": "pcm", "property": { "seq": { "type": "uint16" } } } ]
}"#;

const CONSUMER: &str = r#"{
    "cmd_in": [
        { "name": "hello", "property": { "n": { "type": "int32" } }, "required": ["n"],
          "result": { "property": { "echo": { "type": "int32" } } } }
    ],
    "data_in": [ { "name": "pcm", "property": { "seq": { "type": "int32" } } } ]
}"#;

#[test]
fn store_connects_producer_and_consumer() {
    let producer = SchemaStore::from_json_str(PRODUCER).expect("生产者声明合法");
    let consumer = SchemaStore::from_json_str(CONSUMER).expect("消费者声明合法");

    let out = producer
        .msg_schema(MsgKind::Cmd, "hello", Direction::Out)
        .expect("生产者声明了 cmd_out hello");
    let inbound = consumer
        .msg_schema(MsgKind::Cmd, "hello", Direction::In)
        .expect("消费者声明了 cmd_in hello");
    assert!(out.is_compatible(inbound).is_ok(), "int8 → int32 且结果 int32 → int64");

    let out = producer
        .msg_schema(MsgKind::Data, "pcm", Direction::Out)
        .expect("data_out pcm");
    let inbound = consumer
        .msg_schema(MsgKind::Data, "pcm", Direction::In)
        .expect("data_in pcm");
    assert!(out.is_compatible(inbound).is_ok(), "uint16 → int32");
}

#[test]
fn reversed_result_schema_is_checked() {
    // 结果从消费者流回生产者：消费者回复 int64，生产者只收 int32。
    let producer = SchemaStore::from_json_str(
        r#"{"cmd_out":[{"name":"q","result":{"property":{"v":{"type":"int32"}}}}]}"#,
    )
    .expect("声明合法");
    let consumer = SchemaStore::from_json_str(
        r#"{"cmd_in":[{"name":"q","result":{"property":{"v":{"type":"int64"}}}}]}"#,
    )
    .expect("声明合法");

    let out = producer
        .msg_schema(MsgKind::Cmd, "q", Direction::Out)
        .expect("cmd_out q");
    let inbound = consumer
        .msg_schema(MsgKind::Cmd, "q", Direction::In)
        .expect("cmd_in q");
    let err = out.is_compatible(inbound).expect_err("结果位宽收窄不兼容");
    assert!(err.path.starts_with("result"), "路径应以 result 起始: {err}");
}

#[test]
fn outbound_message_is_adjusted_before_validation() {
    let producer = SchemaStore::from_json_str(PRODUCER).expect("生产者声明合法");

    let mut cmd = Message::new_cmd("hello").expect("命令名非空");
    cmd.set_property("n", Value::Int64(7)).expect("写入属性");
    cmd.validate_schema(&producer, Direction::Out)
        .expect("7 可收窄为 int8");
    assert_eq!(cmd.peek_property("n"), Ok(&Value::Int8(7)));

    let mut missing = Message::new_cmd("hello").expect("命令名非空");
    assert!(
        missing.validate_schema(&producer, Direction::Out).is_err(),
        "缺少必填属性 n"
    );

    let mut overflow = Message::new_data("pcm");
    overflow
        .set_property("seq", Value::Int64(70_000))
        .expect("写入属性");
    assert!(overflow.validate_schema(&producer, Direction::Out).is_err());
}

#[test]
fn extension_property_is_guarded_by_store() {
    let producer = SchemaStore::from_json_str(PRODUCER).expect("生产者声明合法");
    let mut rate = Value::Int64(16_000);
    producer
        .adjust_property_kv("rate", &mut rate)
        .expect("16000 可收窄为 uint32");
    assert_eq!(rate, Value::Uint32(16_000));
    assert!(producer.validate_property_kv("rate", &rate).is_ok());
    assert!(producer.validate_property_kv("rate", &Value::from("fast")).is_err());
}
