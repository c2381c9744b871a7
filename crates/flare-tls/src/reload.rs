use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::ServerConfig;

/// 可热更新的 TLS 服务端配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 证书轮换时监听端无需重建：新的握手读取最新配置，已建立的会话继续持有旧配置；
/// - 读路径无锁，写路径为常数时间的原子替换。
///
/// ## 逻辑（How）
/// - 内部保存 `Arc<ArcSwap<ServerConfig>>`，克隆本结构体即共享同一容器；
/// - 每次创建服务端会话时经 [`Self::snapshot`] 取一次快照。
///
/// ## 契约（What）
/// - 写入的配置必须已装载证书链与私钥；
/// - [`Self::replace`] 只影响此后开始的握手。
///
/// ## Trade-offs
/// - 高频替换时多个旧配置可能同时存活，直到引用它们的会话全部结束。
#[derive(Clone)]
pub struct ReloadableServerConfig {
    inner: Arc<ArcSwap<ServerConfig>>,
}

impl ReloadableServerConfig {
    pub fn new(initial: Arc<ServerConfig>) -> Self {
        Self {
            inner: Arc::new(ArcSwap::new(initial)),
        }
    }

    #[inline]
    pub fn from_config(initial: ServerConfig) -> Self {
        Self::new(Arc::new(initial))
    }

    /// 当前配置的共享快照，不随后续替换而改变。
    #[inline]
    pub fn snapshot(&self) -> Arc<ServerConfig> {
        self.inner.load_full()
    }

    /// 原子替换配置并交回旧值。
    #[inline]
    pub fn replace(&self, next: Arc<ServerConfig>) -> Arc<ServerConfig> {
        self.inner.swap(next)
    }
}

impl fmt::Debug for ReloadableServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadableServerConfig").finish_non_exhaustive()
    }
}
