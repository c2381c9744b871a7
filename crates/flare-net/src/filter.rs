use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::completion::Completion;
use crate::error::FlareError;

/// 插入连接与套接字之间的字节流变换器，例如 TLS。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 连接在建立后可以“中途升级”（STARTTLS 风格），升级前后的读写接口保持不变；
/// - 变换器只负责字节变换与握手状态，排队、回调、超时仍由反应器统一处理。
///
/// ## 逻辑（How）
/// - 反应器把从套接字读到的密文交给 `on_inbound`，把应用写入的明文交给 `on_outbound`；
/// - 变换器把产出写进 [`FilterOutput`]：`wire` 追加到写队列尾部，`plaintext` 追加到读聚合；
/// - `established` 只在握手完成的那一次调用中置位，反应器据此释放握手期间暂存的写入。
///
/// ## 契约（What）
/// - 所有方法都在持有连接变换器锁的情况下调用，同一连接上不会并发；
/// - 返回 `Err` 表示不可恢复的失败，反应器随后以该错误关闭连接；
/// - 实现者不得在这些方法中阻塞或调用连接 API。
pub trait StreamFilter: Send + 'static {
    /// 安装时调用，产出首批握手字节（客户端的 ClientHello 等）。
    fn start(&mut self, out: &mut FilterOutput) -> Result<(), FlareError>;

    /// 处理一段入站字节。
    fn on_inbound(&mut self, wire: &[u8], out: &mut FilterOutput) -> Result<(), FlareError>;

    /// 变换一段出站明文，只在握手完成后调用。
    fn on_outbound(&mut self, plaintext: &[u8], out: &mut FilterOutput)
    -> Result<(), FlareError>;

    /// 连接即将关闭，产出告别字节（如 `close_notify`）。
    fn on_close(&mut self, out: &mut FilterOutput);

    /// 会话描述信息，握手完成前也可调用。
    fn info(&self) -> FilterInfo {
        FilterInfo::default()
    }
}

/// 变换器一次调用的产出。
#[derive(Debug, Default)]
pub struct FilterOutput {
    /// 需要写到套接字的字节，按顺序排入写队列。
    pub wire: Vec<Bytes>,
    /// 解出的明文，按顺序追加到读聚合。
    pub plaintext: Vec<Bytes>,
    /// 本次调用完成了握手。
    pub established: bool,
    /// 对端发出了有序关闭通知。
    pub peer_closed: bool,
}

/// 变换器会话的描述信息。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterInfo {
    pub protocol_version: Option<String>,
    pub alpn_protocol: Option<Vec<u8>>,
    pub server_name: Option<String>,
}

/// 握手状态机。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    NotStarted,
    Handshaking,
    Established,
    Failed,
}

/// 连接上已安装的变换器及其握手簿记。
pub(crate) struct FilterSlot {
    pub(crate) filter: Box<dyn StreamFilter>,
    pub(crate) state: HandshakeState,
    pub(crate) handshake: Completion<()>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) deadline: Option<Instant>,
    /// 握手期间应用发起的写入，握手完成后按序加密。
    pub(crate) held: VecDeque<(Bytes, Completion<()>)>,
}

impl FilterSlot {
    pub(crate) fn new(
        filter: Box<dyn StreamFilter>,
        handshake: Completion<()>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            filter,
            state: HandshakeState::Handshaking,
            handshake,
            timeout,
            deadline: timeout.map(|after| Instant::now() + after),
            held: VecDeque::new(),
        }
    }

    /// 标记失败并取出所有待通知的令牌。
    pub(crate) fn fail(&mut self) -> (Completion<()>, Vec<Completion<()>>) {
        self.state = HandshakeState::Failed;
        let held = self.held.drain(..).map(|(_, token)| token).collect();
        (self.handshake.clone(), held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Passthrough;

    impl StreamFilter for Passthrough {
        fn start(&mut self, _out: &mut FilterOutput) -> Result<(), FlareError> {
            Ok(())
        }

        fn on_inbound(&mut self, wire: &[u8], out: &mut FilterOutput) -> Result<(), FlareError> {
            out.plaintext.push(Bytes::copy_from_slice(wire));
            Ok(())
        }

        fn on_outbound(
            &mut self,
            plaintext: &[u8],
            out: &mut FilterOutput,
        ) -> Result<(), FlareError> {
            out.wire.push(Bytes::copy_from_slice(plaintext));
            Ok(())
        }

        fn on_close(&mut self, _out: &mut FilterOutput) {}
    }

    #[test]
    fn failing_slot_releases_held_tokens() {
        let mut slot = FilterSlot::new(Box::new(Passthrough), Completion::new(), None);
        let held = Completion::new();
        slot.held.push_back((Bytes::from_static(b"later"), held.clone()));
        let (handshake, tokens) = slot.fail();
        assert_eq!(slot.state, HandshakeState::Failed);
        assert_eq!(tokens.len(), 1);
        assert!(slot.held.is_empty());
        assert!(!handshake.is_done());
        assert_eq!(slot.filter.info(), FilterInfo::default());
    }
}
