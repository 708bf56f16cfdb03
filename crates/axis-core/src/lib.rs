#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]

//! # axis-core
//!
//! ## 定位与职责（Why）
//! - 承载扩展运行时中“与线程无关”的全部契约：错误分类、属性值树、Schema 引擎与消息模型；
//! - 这些类型只依赖所有权与克隆语义，不持有任何线程或队列，因此可以被 `axis-runtime`
//!   在任意扩展线程上独立使用，而不引入跨线程同步。
//!
//! ## 架构嵌入（Where）
//! - `value`：递归属性树及路径访问，是消息属性与 Schema 校验的共同载体；
//! - `schema`：`validate` / `adjust` / `is_compatible` 三类操作；
//! - `schema_store`：按扩展聚合的消息与属性 Schema；
//! - `msg`：Cmd / CmdResult / Data / AudioFrame / VideoFrame 五类消息及寻址、缓冲锁定协议；
//! - `error`：稳定错误码与 `thiserror` 派生的错误枚举。
//!
//! ## 设计权衡（Trade-offs）
//! - 消息在跨线程边界时一律克隆而非共享可变引用，单线程内的修改因此无需加锁；
//!   代价是大属性树在扇出时会产生复制开销。

pub mod error;
pub mod msg;
pub mod schema;
pub mod schema_store;
pub mod value;

pub use error::{AxisError, Result};
pub use msg::{
    AudioFrameDataFmt, AudioFrameFields, CmdFields, CmdResultFields, Loc, LockedBuf, Message,
    MsgKind, PixelFmt, StatusCode, VideoFrameFields,
};
pub use schema::{Schema, SchemaError};
pub use schema_store::{Direction, MsgSchema, SchemaStore};
pub use value::{Value, ValueType};
