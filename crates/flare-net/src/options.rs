use std::io;

use socket2::SockRef;

use crate::error::FlareError;

/// 可在连接或监听端上设置的套接字选项。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketOption {
    /// 关闭 Nagle 算法，仅对 TCP 连接有效；取值 0/1。
    NoDelay,
    /// 内核发送缓冲大小（字节），必须为正。
    SendBufferSize,
    /// 内核接收缓冲大小（字节），必须为正。
    RecvBufferSize,
    /// UDP 单次接收的最大数据报长度，取值 1..=65507。
    UdpFrameSize,
    /// 读路径是否直接交付暂存区切分出的片段（1），或拷贝成精确大小的独立分配（0）。
    UseNativeBuffers,
}

pub(crate) const MAX_UDP_FRAME: i64 = 65_507;

impl SocketOption {
    pub const ALL: [SocketOption; 5] = [
        SocketOption::NoDelay,
        SocketOption::SendBufferSize,
        SocketOption::RecvBufferSize,
        SocketOption::UdpFrameSize,
        SocketOption::UseNativeBuffers,
    ];

    /// 校验取值是否落在该选项的合法区间。
    pub fn validate(self, value: i64) -> Result<(), FlareError> {
        let valid = match self {
            SocketOption::NoDelay | SocketOption::UseNativeBuffers => value == 0 || value == 1,
            SocketOption::SendBufferSize | SocketOption::RecvBufferSize => {
                value > 0 && value <= i64::from(i32::MAX)
            }
            SocketOption::UdpFrameSize => (1..=MAX_UDP_FRAME).contains(&value),
        };
        if valid {
            Ok(())
        } else {
            Err(FlareError::InvalidOption {
                option: self,
                value,
            })
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// 已被接受的选项取值记录。
///
/// 连接尚未建立时设置的选项先记在这里，套接字就绪后统一落地。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SocketOptions {
    values: [Option<i64>; 5],
}

impl SocketOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 校验并记录一个取值。
    pub fn set(&mut self, option: SocketOption, value: i64) -> Result<(), FlareError> {
        option.validate(value)?;
        self.values[option.slot()] = Some(value);
        Ok(())
    }

    pub fn get(&self, option: SocketOption) -> Option<i64> {
        self.values[option.slot()]
    }

    /// 按固定顺序遍历已记录的选项。
    pub fn iter(&self) -> impl Iterator<Item = (SocketOption, i64)> + '_ {
        SocketOption::ALL
            .into_iter()
            .filter_map(|option| self.get(option).map(|value| (option, value)))
    }
}

/// 把内核缓冲类选项应用到真实套接字上。
///
/// 返回 `Ok(false)` 表示该选项不经由 `SockRef` 落地：`NoDelay` 由持有 TCP 流的一方直接设置，
/// 其余两个选项只影响进程内状态。
pub(crate) fn apply_option(sock: SockRef<'_>, option: SocketOption, value: i64) -> io::Result<bool> {
    match option {
        SocketOption::SendBufferSize => {
            sock.set_send_buffer_size(value as usize)?;
            Ok(true)
        }
        SocketOption::RecvBufferSize => {
            sock.set_recv_buffer_size(value as usize)?;
            Ok(true)
        }
        SocketOption::NoDelay | SocketOption::UdpFrameSize | SocketOption::UseNativeBuffers => {
            Ok(false)
        }
    }
}
