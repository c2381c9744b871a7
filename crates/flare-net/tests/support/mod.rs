//! 集成测试共用的等待与启动帮助函数。

#![allow(dead_code)]

use std::time::{Duration, Instant};

use flare_net::{FlareConfig, Reactor};

/// 轮询 `condition` 直到为真或超时；返回最后一次求值结果。
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return condition();
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// 手动模式下反复执行 `poll_once`，直到 `condition` 为真或超时。
pub fn pump_until(
    reactor: &Reactor,
    timeout: Duration,
    mut condition: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        reactor
            .poll_once(Some(Duration::from_millis(10)))
            .expect("手动轮询不应失败");
        if condition() {
            return true;
        }
    }
    condition()
}

/// 启动一个默认配置的线程反应器。
pub fn threaded_reactor() -> Reactor {
    threaded_reactor_with(FlareConfig::default())
}

pub fn threaded_reactor_with(config: FlareConfig) -> Reactor {
    let reactor = Reactor::threaded(config).expect("创建反应器");
    reactor.start().expect("启动反应器");
    reactor
}

pub const PATIENCE: Duration = Duration::from_secs(10);
