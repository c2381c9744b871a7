use thiserror::Error;

/// 字节聚合读取失败的原因。
///
/// # 契约（What）
/// - `Underflow`：请求长度超过当前剩余字节数，聚合状态保持不变；
/// - `InvalidUtf8`：按字符串读取时字节不是合法 UTF-8，同样不消费任何字节。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("requested {requested} bytes but only {remaining} remain")]
    Underflow { requested: usize, remaining: usize },
    #[error("{len} bytes are not valid UTF-8")]
    InvalidUtf8 { len: usize },
}
