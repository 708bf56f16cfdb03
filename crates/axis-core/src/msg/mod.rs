//! # msg：运行时消息模型
//!
//! ## 定位与职责（Why）
//! - 五类消息（Cmd、CmdResult、Data、AudioFrame、VideoFrame）共享同一信封：名称、时间戳、
//!   属性树、源地址与目标地址列表；
//! - 消息跨线程传递时一律克隆，每个线程持有的副本可以独立修改而无需同步。
//!
//! ## 行为契约（What）
//! - 类型在创建后固定；命令名不可为空；
//! - `Cmd` 携带唯一 `cmd_id` 与 `seq_id`，回复处理器保存在发送方的路径表中；
//! - `CmdResult` 携带状态码、`is_final`、`is_completed` 与原命令的类型和名称；
//! - 载荷缓冲遵循锁定协议（见 [`locked`] 子模块）；克隆出的副本不继承锁定记录。
//!
//! ## JSON 形式（How）
//! - 运行时字段位于保留键 `_ten` 之下，其余键为属性：
//!   `{"_ten": {"type": "cmd", "name": "ping", "cmd_id": "...", "dest": [...]}, "a": 1}`。

mod loc;
mod locked;

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;

pub use loc::Loc;
pub use locked::LockedBuf;

use crate::{
    error::{AxisError, Result},
    schema_store::{Direction, SchemaStore},
    value::Value,
};

use locked::LockedResList;

/// 属性树中保留给运行时字段的命名空间。
pub const RUNTIME_NAMESPACE: &str = "_ten";

/// 消息类型。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum MsgKind {
    Cmd,
    CmdResult,
    Data,
    AudioFrame,
    VideoFrame,
}

impl MsgKind {
    /// 可由扩展主动发送（并在 Schema 中按方向声明）的类型。
    pub const SENDABLE: [MsgKind; 4] = [
        MsgKind::Cmd,
        MsgKind::Data,
        MsgKind::AudioFrame,
        MsgKind::VideoFrame,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MsgKind::Cmd => "cmd",
            MsgKind::CmdResult => "cmd_result",
            MsgKind::Data => "data",
            MsgKind::AudioFrame => "audio_frame",
            MsgKind::VideoFrame => "video_frame",
        }
    }

    pub fn from_name(name: &str) -> Option<MsgKind> {
        let kind = match name {
            "cmd" => MsgKind::Cmd,
            "cmd_result" => MsgKind::CmdResult,
            "data" => MsgKind::Data,
            "audio_frame" => MsgKind::AudioFrame,
            "video_frame" => MsgKind::VideoFrame,
            _ => return None,
        };
        Some(kind)
    }
}

/// 命令结果状态码。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum StatusCode {
    #[default]
    Ok,
    Error,
}

impl StatusCode {
    pub fn as_i64(self) -> i64 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Error => 1,
        }
    }

    pub fn from_i64(code: i64) -> StatusCode {
        if code == 0 {
            StatusCode::Ok
        } else {
            StatusCode::Error
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CmdFields {
    pub cmd_id: String,
    pub seq_id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CmdResultFields {
    pub cmd_id: String,
    pub seq_id: String,
    pub status_code: StatusCode,
    pub original_cmd_kind: MsgKind,
    pub original_cmd_name: String,
    pub is_final: bool,
    pub is_completed: bool,
}

/// 音频帧数据排布。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AudioFrameDataFmt {
    #[default]
    Interleave,
    NonInterleave,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AudioFrameFields {
    pub sample_rate: i32,
    pub bytes_per_sample: i32,
    pub samples_per_channel: i32,
    pub number_of_channel: i32,
    pub data_fmt: AudioFrameDataFmt,
    pub line_size: i32,
    pub is_eof: bool,
}

impl AudioFrameDataFmt {
    pub fn as_str(self) -> &'static str {
        match self {
            AudioFrameDataFmt::Interleave => "interleave",
            AudioFrameDataFmt::NonInterleave => "non_interleave",
        }
    }

    pub fn from_name(name: &str) -> Option<AudioFrameDataFmt> {
        match name {
            "interleave" => Some(AudioFrameDataFmt::Interleave),
            "non_interleave" => Some(AudioFrameDataFmt::NonInterleave),
            _ => None,
        }
    }
}

/// 视频帧像素格式。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PixelFmt {
    #[default]
    Rgb24,
    Rgba,
    Bgr24,
    Bgra,
    I420,
    I422,
    Nv21,
    Nv12,
}

impl PixelFmt {
    pub fn as_str(self) -> &'static str {
        match self {
            PixelFmt::Rgb24 => "rgb24",
            PixelFmt::Rgba => "rgba",
            PixelFmt::Bgr24 => "bgr24",
            PixelFmt::Bgra => "bgra",
            PixelFmt::I420 => "i420",
            PixelFmt::I422 => "i422",
            PixelFmt::Nv21 => "nv21",
            PixelFmt::Nv12 => "nv12",
        }
    }

    pub fn from_name(name: &str) -> Option<PixelFmt> {
        let fmt = match name {
            "rgb24" => PixelFmt::Rgb24,
            "rgba" => PixelFmt::Rgba,
            "bgr24" => PixelFmt::Bgr24,
            "bgra" => PixelFmt::Bgra,
            "i420" => PixelFmt::I420,
            "i422" => PixelFmt::I422,
            "nv21" => PixelFmt::Nv21,
            "nv12" => PixelFmt::Nv12,
            _ => return None,
        };
        Some(fmt)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct VideoFrameFields {
    pub width: i32,
    pub height: i32,
    pub pixel_fmt: PixelFmt,
    pub is_eof: bool,
}

#[derive(Clone, Debug, PartialEq)]
enum Body {
    Cmd(CmdFields),
    CmdResult(CmdResultFields),
    Data,
    AudioFrame(AudioFrameFields),
    VideoFrame(VideoFrameFields),
}

/// 运行时消息。
///
/// # 教案式说明
/// - **意图 (Why)**：以一个拥有所有权的结构承载全部五类消息，跨线程时克隆而非共享，
///   让每个扩展线程上的副本都能被单线程独占修改；
/// - **契约 (What)**：
///   - `kind()` 在构造后不可变；类型专属字段只能通过对应访问器读写，类型不符时返回 `None`/错误；
///   - `clone()` 复制除锁定记录外的全部内容，载荷缓冲以引用计数共享（`Bytes`）；
/// - **设计权衡 (Trade-offs)**：属性树随克隆深拷贝，换取“无需锁即可修改”的简单性。
#[derive(Debug)]
pub struct Message {
    body: Body,
    name: String,
    timestamp: u64,
    properties: Value,
    src: Loc,
    dest: Vec<Loc>,
    buf: Option<Bytes>,
    locked: LockedResList,
}

impl Clone for Message {
    fn clone(&self) -> Self {
        Self {
            body: self.body.clone(),
            name: self.name.clone(),
            timestamp: self.timestamp,
            properties: self.properties.clone(),
            src: self.src.clone(),
            dest: self.dest.clone(),
            buf: self.buf.clone(),
            locked: LockedResList::default(),
        }
    }
}

impl Message {
    fn with_body(body: Body, name: impl Into<String>) -> Message {
        Message {
            body,
            name: name.into(),
            timestamp: now_micros(),
            properties: Value::object(),
            src: Loc::default(),
            dest: Vec::new(),
            buf: None,
            locked: LockedResList::default(),
        }
    }

    /// 新建命令；`cmd_id` 立即生成。
    pub fn new_cmd(name: impl Into<String>) -> Result<Message> {
        let name = name.into();
        if name.is_empty() {
            return Err(AxisError::generic(
                "Failed to set message name to an empty string.",
            ));
        }
        Ok(Message::with_body(
            Body::Cmd(CmdFields {
                cmd_id: generate_cmd_id(),
                seq_id: String::new(),
            }),
            name,
        ))
    }

    /// 为 `original` 命令构造结果，继承其 `cmd_id`、`seq_id` 与名称。
    pub fn new_cmd_result(status_code: StatusCode, original: &Message) -> Result<Message> {
        let Body::Cmd(cmd) = &original.body else {
            return Err(AxisError::invalid_argument(format!(
                "a cmd result can only answer a cmd, got `{}`",
                original.kind().as_str()
            )));
        };
        let result = Message::with_body(
            Body::CmdResult(CmdResultFields {
                cmd_id: cmd.cmd_id.clone(),
                seq_id: cmd.seq_id.clone(),
                status_code,
                original_cmd_kind: MsgKind::Cmd,
                original_cmd_name: original.name.clone(),
                is_final: true,
                is_completed: false,
            }),
            original.name.clone(),
        );
        Ok(result)
    }

    pub fn new_data(name: impl Into<String>) -> Message {
        Message::with_body(Body::Data, name)
    }

    pub fn new_audio_frame(name: impl Into<String>) -> Message {
        Message::with_body(Body::AudioFrame(AudioFrameFields::default()), name)
    }

    pub fn new_video_frame(name: impl Into<String>) -> Message {
        Message::with_body(Body::VideoFrame(VideoFrameFields::default()), name)
    }

    pub fn kind(&self) -> MsgKind {
        match self.body {
            Body::Cmd(_) => MsgKind::Cmd,
            Body::CmdResult(_) => MsgKind::CmdResult,
            Body::Data => MsgKind::Data,
            Body::AudioFrame(_) => MsgKind::AudioFrame,
            Body::VideoFrame(_) => MsgKind::VideoFrame,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 修改消息名称；命令与结果的名称不可为空。
    pub fn set_name(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if name.is_empty() && matches!(self.kind(), MsgKind::Cmd | MsgKind::CmdResult) {
            return Err(AxisError::generic(
                "Failed to set message name to an empty string.",
            ));
        }
        self.name = name;
        Ok(())
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }

    pub fn src(&self) -> &Loc {
        &self.src
    }

    pub fn set_src(&mut self, src: Loc) {
        self.src = src;
    }

    pub fn dest(&self) -> &[Loc] {
        &self.dest
    }

    /// 清空并设置唯一目标。
    pub fn set_dest(&mut self, dest: Loc) {
        self.dest.clear();
        self.dest.push(dest);
    }

    pub fn add_dest(&mut self, dest: Loc) {
        self.dest.push(dest);
    }

    pub fn clear_dest(&mut self) {
        self.dest.clear();
    }

    /// 关闭过程中仍需处理的消息类型：只有命令结果，保证未完成的命令能收到回复。
    pub fn type_to_handle_when_closing(&self) -> bool {
        self.kind() == MsgKind::CmdResult
    }

    // ---- 属性 ----

    pub fn properties(&self) -> &Value {
        &self.properties
    }

    /// 按路径读取属性；空路径返回整棵属性树。
    pub fn peek_property(&self, path: &str) -> Result<&Value> {
        self.properties.peek(path)
    }

    /// 按路径写入属性；空路径以对象整体替换属性树。
    ///
    /// 保留键 `_ten` 既不能作为路径首段写入，也不能随整棵属性树一并替换进来。
    pub fn set_property(&mut self, path: &str, value: Value) -> Result<()> {
        let head = path.split(['.', '[']).next().unwrap_or_default();
        let touches_reserved = if path.is_empty() {
            value
                .as_object()
                .is_some_and(|map| map.contains_key(RUNTIME_NAMESPACE))
        } else {
            head == RUNTIME_NAMESPACE
        };
        if touches_reserved {
            return Err(AxisError::invalid_argument(format!(
                "the `{RUNTIME_NAMESPACE}` namespace is reserved for runtime fields"
            )));
        }
        self.properties.set(path, value)
    }

    pub fn is_property_exist(&self, path: &str) -> bool {
        !path.is_empty() && self.properties.peek(path).is_ok()
    }

    // ---- 命令 ----

    pub fn cmd_id(&self) -> Option<&str> {
        match &self.body {
            Body::Cmd(cmd) => Some(&cmd.cmd_id),
            Body::CmdResult(result) => Some(&result.cmd_id),
            _ => None,
        }
    }

    pub fn set_cmd_id(&mut self, cmd_id: impl Into<String>) -> Result<()> {
        match &mut self.body {
            Body::Cmd(cmd) => cmd.cmd_id = cmd_id.into(),
            Body::CmdResult(result) => result.cmd_id = cmd_id.into(),
            _ => return Err(self.kind_mismatch("cmd_id")),
        }
        Ok(())
    }

    pub fn seq_id(&self) -> Option<&str> {
        match &self.body {
            Body::Cmd(cmd) => Some(&cmd.seq_id),
            Body::CmdResult(result) => Some(&result.seq_id),
            _ => None,
        }
    }

    pub fn set_seq_id(&mut self, seq_id: impl Into<String>) -> Result<()> {
        match &mut self.body {
            Body::Cmd(cmd) => cmd.seq_id = seq_id.into(),
            Body::CmdResult(result) => result.seq_id = seq_id.into(),
            _ => return Err(self.kind_mismatch("seq_id")),
        }
        Ok(())
    }

    pub fn cmd_result(&self) -> Option<&CmdResultFields> {
        match &self.body {
            Body::CmdResult(result) => Some(result),
            _ => None,
        }
    }

    pub fn cmd_result_mut(&mut self) -> Option<&mut CmdResultFields> {
        match &mut self.body {
            Body::CmdResult(result) => Some(result),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        self.cmd_result().map(|r| r.status_code)
    }

    pub fn is_final(&self) -> bool {
        self.cmd_result().is_some_and(|r| r.is_final)
    }

    pub fn set_final(&mut self, is_final: bool) -> Result<()> {
        match self.cmd_result_mut() {
            Some(result) => {
                result.is_final = is_final;
                Ok(())
            }
            None => Err(self.kind_mismatch("is_final")),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.cmd_result().is_some_and(|r| r.is_completed)
    }

    /// 结果的人类可读说明，存放在属性 `detail` 中。
    pub fn detail(&self) -> Option<&Value> {
        self.properties.peek("detail").ok()
    }

    pub fn set_detail(&mut self, detail: impl Into<Value>) -> Result<()> {
        self.properties.set("detail", detail.into())
    }

    // ---- 音视频帧 ----

    pub fn audio_frame(&self) -> Option<&AudioFrameFields> {
        match &self.body {
            Body::AudioFrame(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn audio_frame_mut(&mut self) -> Option<&mut AudioFrameFields> {
        match &mut self.body {
            Body::AudioFrame(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn video_frame(&self) -> Option<&VideoFrameFields> {
        match &self.body {
            Body::VideoFrame(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn video_frame_mut(&mut self) -> Option<&mut VideoFrameFields> {
        match &mut self.body {
            Body::VideoFrame(fields) => Some(fields),
            _ => None,
        }
    }

    // ---- 载荷与锁定 ----

    fn carries_buf(&self) -> bool {
        matches!(
            self.kind(),
            MsgKind::Data | MsgKind::AudioFrame | MsgKind::VideoFrame
        )
    }

    pub fn buf(&self) -> Option<&Bytes> {
        self.buf.as_ref()
    }

    /// 替换载荷；锁定期间拒绝修改。
    pub fn set_buf(&mut self, buf: impl Into<Bytes>) -> Result<()> {
        if !self.carries_buf() {
            return Err(self.kind_mismatch("buf"));
        }
        if !self.locked.is_empty() {
            return Err(AxisError::generic(
                "the buffer can not be modified while it is locked",
            ));
        }
        self.buf = Some(buf.into());
        Ok(())
    }

    /// 分配 `size` 字节的零值载荷。
    pub fn alloc_buf(&mut self, size: usize) -> Result<()> {
        self.set_buf(vec![0u8; size])
    }

    /// 钉住载荷并返回稳定视图。
    pub fn lock_buf(&mut self) -> Result<LockedBuf> {
        let Some(buf) = &self.buf else {
            return Err(AxisError::invalid_argument(
                "the message has no buffer to lock",
            ));
        };
        self.locked.lock(buf)
    }

    /// 按锁定时返回的地址解锁。
    pub fn unlock_buf(&mut self, key: usize) -> Result<()> {
        self.locked.unlock(key)
    }

    pub fn has_locked_res(&self) -> bool {
        !self.locked.is_empty()
    }

    // ---- Schema ----

    /// 按仓库中声明的 Schema 规整并校验属性。
    ///
    /// - **契约 (What)**：`direction` 为 `Out` 时使用发送方声明，为 `In` 时使用接收方声明；
    ///   未声明 Schema 视为通过；失败时属性树可能已部分规整，但不会被清空。
    pub fn validate_schema(&mut self, store: &SchemaStore, direction: Direction) -> Result<()> {
        let lookup_name = match &self.body {
            Body::CmdResult(result) => result.original_cmd_name.clone(),
            _ => self.name.clone(),
        };
        let Some(schema) = store.msg_schema(self.kind(), &lookup_name, direction) else {
            return Ok(());
        };
        schema.adjust_properties(&mut self.properties)?;
        schema.validate_properties(&self.properties)
    }

    // ---- JSON ----

    /// 序列化为 JSON；属性中含 `buf`/`ptr` 时失败。
    pub fn to_json(&self) -> Result<serde_json::Value> {
        use serde_json::{Map, Value as Json, json};

        let mut runtime = Map::new();
        runtime.insert("type".into(), Json::from(self.kind().as_str()));
        runtime.insert("name".into(), Json::from(self.name.clone()));
        runtime.insert("timestamp".into(), Json::from(self.timestamp));
        if !self.src.is_empty() {
            runtime.insert("src".into(), serde_json::to_value(&self.src)?);
        }
        if !self.dest.is_empty() {
            runtime.insert("dest".into(), serde_json::to_value(&self.dest)?);
        }
        match &self.body {
            Body::Cmd(cmd) => {
                runtime.insert("cmd_id".into(), Json::from(cmd.cmd_id.clone()));
                runtime.insert("seq_id".into(), Json::from(cmd.seq_id.clone()));
            }
            Body::CmdResult(result) => {
                runtime.insert("cmd_id".into(), Json::from(result.cmd_id.clone()));
                runtime.insert("seq_id".into(), Json::from(result.seq_id.clone()));
                runtime.insert(
                    "status_code".into(),
                    Json::from(result.status_code.as_i64()),
                );
                runtime.insert("is_final".into(), Json::from(result.is_final));
                runtime.insert("is_completed".into(), Json::from(result.is_completed));
                runtime.insert(
                    "original_cmd_type".into(),
                    Json::from(result.original_cmd_kind.as_str()),
                );
                runtime.insert(
                    "original_cmd_name".into(),
                    Json::from(result.original_cmd_name.clone()),
                );
            }
            Body::AudioFrame(frame) => {
                runtime.insert(
                    "audio_frame".into(),
                    json!({
                        "sample_rate": frame.sample_rate,
                        "bytes_per_sample": frame.bytes_per_sample,
                        "samples_per_channel": frame.samples_per_channel,
                        "number_of_channel": frame.number_of_channel,
                        "data_fmt": frame.data_fmt.as_str(),
                        "line_size": frame.line_size,
                        "is_eof": frame.is_eof,
                    }),
                );
            }
            Body::VideoFrame(frame) => {
                runtime.insert(
                    "video_frame".into(),
                    json!({
                        "width": frame.width,
                        "height": frame.height,
                        "pixel_fmt": frame.pixel_fmt.as_str(),
                        "is_eof": frame.is_eof,
                    }),
                );
            }
            Body::Data => {}
        }

        let mut out = match self.properties.to_json()? {
            Json::Object(map) => map,
            _ => Map::new(),
        };
        out.insert(RUNTIME_NAMESPACE.into(), Json::Object(runtime));
        Ok(Json::Object(out))
    }

    /// 由 JSON 构造消息；`_ten.type` 缺省为 `cmd`，与 [`Message::to_json`] 互逆。
    pub fn from_json(json: &serde_json::Value) -> Result<Message> {
        let object = json
            .as_object()
            .ok_or_else(|| AxisError::InvalidJson("the message json should be an object".into()))?;
        let empty = serde_json::Map::new();
        let runtime = object
            .get(RUNTIME_NAMESPACE)
            .and_then(serde_json::Value::as_object)
            .unwrap_or(&empty);
        let field = |key: &str| runtime.get(key).and_then(serde_json::Value::as_str);
        let flag = |key: &str| runtime.get(key).and_then(serde_json::Value::as_bool);

        let kind_name = field("type").unwrap_or("cmd");
        let kind = MsgKind::from_name(kind_name).ok_or_else(|| {
            AxisError::InvalidJson(format!("unknown message type `{kind_name}`"))
        })?;
        let name = field("name").unwrap_or_default().to_owned();

        let mut msg = match kind {
            MsgKind::Cmd => Message::new_cmd(name)?,
            MsgKind::CmdResult => {
                let status = runtime
                    .get("status_code")
                    .and_then(serde_json::Value::as_i64)
                    .map(StatusCode::from_i64)
                    .unwrap_or_default();
                let original_cmd_kind = match field("original_cmd_type") {
                    Some(type_name) => MsgKind::from_name(type_name).ok_or_else(|| {
                        AxisError::InvalidJson(format!("unknown message type `{type_name}`"))
                    })?,
                    None => MsgKind::Cmd,
                };
                let original_cmd_name = field("original_cmd_name").unwrap_or(&name).to_owned();
                Message::with_body(
                    Body::CmdResult(CmdResultFields {
                        cmd_id: String::new(),
                        seq_id: String::new(),
                        status_code: status,
                        original_cmd_kind,
                        original_cmd_name,
                        is_final: flag("is_final").unwrap_or(true),
                        is_completed: flag("is_completed").unwrap_or(false),
                    }),
                    name,
                )
            }
            MsgKind::Data => Message::new_data(name),
            MsgKind::AudioFrame => {
                let fields = match runtime.get("audio_frame") {
                    Some(frame) => audio_frame_from_json(frame)?,
                    None => AudioFrameFields::default(),
                };
                Message::with_body(Body::AudioFrame(fields), name)
            }
            MsgKind::VideoFrame => {
                let fields = match runtime.get("video_frame") {
                    Some(frame) => video_frame_from_json(frame)?,
                    None => VideoFrameFields::default(),
                };
                Message::with_body(Body::VideoFrame(fields), name)
            }
        };

        if let Some(cmd_id) = field("cmd_id") {
            msg.set_cmd_id(cmd_id)?;
        }
        if let Some(seq_id) = field("seq_id") {
            msg.set_seq_id(seq_id)?;
        }
        if let Some(ts) = runtime.get("timestamp").and_then(serde_json::Value::as_u64) {
            msg.timestamp = ts;
        }
        if let Some(src) = runtime.get("src") {
            msg.src = serde_json::from_value(src.clone())?;
        }
        if let Some(dest) = runtime.get("dest") {
            msg.dest = serde_json::from_value(dest.clone())?;
        }

        if let Some(props) = msg.properties.as_object_mut() {
            for (key, value) in object {
                if key != RUNTIME_NAMESPACE {
                    props.insert(key.clone(), Value::from_json(value));
                }
            }
        }
        Ok(msg)
    }

    fn kind_mismatch(&self, field: &str) -> AxisError {
        AxisError::invalid_argument(format!(
            "`{field}` is not available on a `{}` message",
            self.kind().as_str()
        ))
    }
}

fn frame_object<'a>(
    kind: &str,
    json: &'a serde_json::Value,
) -> Result<&'a serde_json::Map<String, serde_json::Value>> {
    json.as_object()
        .ok_or_else(|| AxisError::InvalidJson(format!("`_ten.{kind}` should be an object")))
}

fn frame_i32(map: &serde_json::Map<String, serde_json::Value>, key: &str) -> Result<i32> {
    match map.get(key) {
        None => Ok(0),
        Some(value) => value
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| AxisError::InvalidJson(format!("`{key}` should be a 32-bit integer"))),
    }
}

fn audio_frame_from_json(json: &serde_json::Value) -> Result<AudioFrameFields> {
    let map = frame_object("audio_frame", json)?;
    let data_fmt = match map.get("data_fmt").and_then(serde_json::Value::as_str) {
        Some(name) => AudioFrameDataFmt::from_name(name).ok_or_else(|| {
            AxisError::InvalidJson(format!("unknown audio frame data format `{name}`"))
        })?,
        None => AudioFrameDataFmt::default(),
    };
    Ok(AudioFrameFields {
        sample_rate: frame_i32(map, "sample_rate")?,
        bytes_per_sample: frame_i32(map, "bytes_per_sample")?,
        samples_per_channel: frame_i32(map, "samples_per_channel")?,
        number_of_channel: frame_i32(map, "number_of_channel")?,
        data_fmt,
        line_size: frame_i32(map, "line_size")?,
        is_eof: map
            .get("is_eof")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
    })
}

fn video_frame_from_json(json: &serde_json::Value) -> Result<VideoFrameFields> {
    let map = frame_object("video_frame", json)?;
    let pixel_fmt = match map.get("pixel_fmt").and_then(serde_json::Value::as_str) {
        Some(name) => PixelFmt::from_name(name)
            .ok_or_else(|| AxisError::InvalidJson(format!("unknown pixel format `{name}`")))?,
        None => PixelFmt::default(),
    };
    Ok(VideoFrameFields {
        width: frame_i32(map, "width")?,
        height: frame_i32(map, "height")?,
        pixel_fmt,
        is_eof: map
            .get("is_eof")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
    })
}

/// 生成进程内唯一的命令 ID。
pub fn generate_cmd_id() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    let seq = NEXT.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}-{seq:x}", std::process::id(), now_micros())
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_result_inherits_cmd_identity() {
        let mut cmd = Message::new_cmd("ping").expect("命令名非空");
        cmd.set_seq_id("42").expect("命令支持 seq_id");
        let result = Message::new_cmd_result(StatusCode::Ok, &cmd).expect("可以回复命令");
        assert_eq!(result.cmd_id(), cmd.cmd_id());
        assert_eq!(result.seq_id(), Some("42"));
        assert_eq!(result.kind(), MsgKind::CmdResult);
        assert!(result.is_final());
        assert!(!result.is_completed(), "完成标记由路由层设置");
        assert!(Message::new_cmd_result(StatusCode::Ok, &Message::new_data("d")).is_err());
    }

    #[test]
    fn empty_cmd_name_is_rejected() {
        assert!(Message::new_cmd("").is_err());
        let mut data = Message::new_data("d");
        assert!(data.set_name("").is_ok(), "非命令消息允许空名称");
    }

    #[test]
    fn runtime_namespace_is_reserved() {
        let mut cmd = Message::new_cmd("ping").expect("命令名非空");
        assert!(cmd.set_property("_ten.name", Value::from("x")).is_err());
        cmd.set_property("a.b", Value::Int64(1)).expect("普通属性可写");
        assert!(cmd.is_property_exist("a.b"));
    }

    #[test]
    fn clone_does_not_inherit_locks() {
        let mut data = Message::new_data("d");
        data.set_buf(vec![1u8, 2, 3]).expect("data 可携带载荷");
        let locked = data.lock_buf().expect("首次锁定成功");
        let copy = data.clone();
        assert!(data.has_locked_res());
        assert!(!copy.has_locked_res(), "克隆副本不继承锁定");
        data.unlock_buf(locked.key()).expect("解锁已锁定的地址");
    }
}
