use std::time::Duration;

use serde::Deserialize;

use crate::error::FlareError;
use crate::options::MAX_UDP_FRAME;

/// 反应器级配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 轮询线程数、回调通道数、读缓冲块大小决定了反应器的吞吐与内存画像，需要在启动前一次性确定；
/// - 支持从 TOML 片段反序列化，便于宿主程序把网络参数放进统一配置文件。
///
/// ## 契约（What）
/// - 所有字段均有默认值，缺省字段按 [`Default`] 补齐，未知字段直接报错；
/// - [`ReactorConfig::validate`] 在反应器构造时调用，拒绝零线程、零通道与“下限大于块大小”等组合。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ReactorConfig {
    /// 轮询线程（分片）数量。
    pub poll_threads: usize,
    /// 串行回调通道数量。
    pub callback_lanes: usize,
    /// 单次 `select` 的最长阻塞时间（毫秒）。
    pub poll_timeout_ms: u64,
    /// 每次 `select` 最多取回的就绪事件数。
    pub events_capacity: usize,
    /// 读缓冲块大小。
    pub read_chunk_size: usize,
    /// 读暂存区剩余空间低于该值时换新块。
    pub read_chunk_floor: usize,
    /// 块池退休队列上限。
    pub retired_chunk_limit: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            poll_threads: 1,
            callback_lanes: 4,
            poll_timeout_ms: 100,
            events_capacity: 1024,
            read_chunk_size: 64 * 1024,
            read_chunk_floor: 4 * 1024,
            retired_chunk_limit: 64,
        }
    }
}

impl ReactorConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), FlareError> {
        if self.poll_threads == 0 {
            return Err(config_error("poll_threads must be at least 1"));
        }
        if self.callback_lanes == 0 {
            return Err(config_error("callback_lanes must be at least 1"));
        }
        if self.events_capacity == 0 {
            return Err(config_error("events_capacity must be at least 1"));
        }
        if self.read_chunk_floor == 0 || self.read_chunk_floor > self.read_chunk_size {
            return Err(config_error(
                "read_chunk_floor must be in 1..=read_chunk_size",
            ));
        }
        Ok(())
    }
}

/// 新建连接的默认参数；单条连接可在运行期覆盖部分字段。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfig {
    /// 读聚合上限：达到后暂停从套接字读取，直到应用取走数据。
    pub max_read_buffer: usize,
    /// 写队列的建议上限，仅供应用自查 `write_buffer_len`，反应器不会据此拒绝写入。
    pub max_write_buffer: usize,
    /// 连接超时（毫秒）。
    pub connect_timeout_ms: u64,
    /// UDP 单次接收的最大数据报长度。
    pub udp_frame_size: usize,
    /// 新建 TCP 连接是否默认开启 `TCP_NODELAY`。
    pub tcp_nodelay: bool,
    /// 是否直接交付暂存区切分出的片段。
    pub native_buffers: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_read_buffer: 64 * 1024,
            max_write_buffer: 64 * 1024,
            connect_timeout_ms: 10_000,
            udp_frame_size: 1500,
            tcp_nodelay: false,
            native_buffers: true,
        }
    }
}

impl EndpointConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), FlareError> {
        if self.max_read_buffer == 0 {
            return Err(config_error("max_read_buffer must be positive"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(config_error("connect_timeout_ms must be positive"));
        }
        if self.udp_frame_size == 0 || self.udp_frame_size as i64 > MAX_UDP_FRAME {
            return Err(config_error("udp_frame_size must be in 1..=65507"));
        }
        Ok(())
    }
}

/// 顶层配置，对应 TOML 中的 `[reactor]` 与 `[endpoint]` 两节。
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FlareConfig {
    pub reactor: ReactorConfig,
    pub endpoint: EndpointConfig,
}

impl FlareConfig {
    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(text: &str) -> Result<Self, FlareError> {
        let config: FlareConfig = toml::from_str(text).map_err(|err| FlareError::Config {
            message: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FlareError> {
        self.reactor.validate()?;
        self.endpoint.validate()
    }
}

fn config_error(message: &str) -> FlareError {
    FlareError::Config {
        message: message.to_owned(),
    }
}
