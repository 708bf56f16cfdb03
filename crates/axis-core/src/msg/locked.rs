//! 缓冲锁定协议：为零拷贝的外部访问钉住消息载荷。
//!
//! - 锁定返回 [`LockedBuf`]，其中的指针与长度在解锁前保持稳定；
//! - 锁定期间禁止替换载荷；重复锁定与解锁未锁定的地址都会返回 `InvalidArgument`；
//! - 消息销毁前必须全部解锁，否则记录 error 并在调试构建中断言失败。

use bytes::Bytes;

use crate::error::{AxisError, Result};

/// 已锁定的缓冲视图。
///
/// `key` 为载荷首地址，解锁时以它识别锁定记录。
#[derive(Clone, Debug)]
pub struct LockedBuf {
    key: usize,
    data: Bytes,
}

impl LockedBuf {
    pub fn key(&self) -> usize {
        self.key
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

/// 消息持有的锁定记录表。
#[derive(Debug, Default)]
pub(crate) struct LockedResList {
    keys: Vec<usize>,
}

impl LockedResList {
    pub(crate) fn lock(&mut self, data: &Bytes) -> Result<LockedBuf> {
        let key = data.as_ptr() as usize;
        if self.keys.contains(&key) {
            return Err(AxisError::invalid_argument(format!(
                "the buffer at {key:#x} is already locked"
            )));
        }
        self.keys.push(key);
        Ok(LockedBuf {
            key,
            data: data.clone(),
        })
    }

    pub(crate) fn unlock(&mut self, key: usize) -> Result<()> {
        match self.keys.iter().position(|k| *k == key) {
            Some(pos) => {
                self.keys.swap_remove(pos);
                Ok(())
            }
            None => Err(AxisError::invalid_argument(format!(
                "Failed to remove locked res at {key:#x}"
            ))),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Drop for LockedResList {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        tracing::error!(
            locked = self.keys.len(),
            "message dropped while its buffer is still locked"
        );
        debug_assert!(
            std::thread::panicking(),
            "message dropped while its buffer is still locked"
        );
    }
}
