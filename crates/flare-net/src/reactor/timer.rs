use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use mio::Token;

/// 分片定时器能触发的事件。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    ConnectTimeout(Token),
    HandshakeTimeout(Token),
}

#[derive(Debug)]
struct Deadline {
    at: Instant,
    seq: u64,
    event: TimerEvent,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    // 反转比较，让 `BinaryHeap` 成为最早截止时间在堆顶的小顶堆；同一时刻按登记顺序。
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// 分片内的截止时间堆。
///
/// 过期事件不会被撤销：触发时由处理方检查连接是否仍处于对应状态，过时的事件直接忽略。
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Deadline>,
    seq: u64,
}

impl TimerQueue {
    pub(crate) fn schedule(&mut self, at: Instant, event: TimerEvent) {
        self.seq += 1;
        self.heap.push(Deadline {
            at,
            seq: self.seq,
            event,
        });
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|deadline| deadline.at)
    }

    /// 把轮询超时截短到最近的截止时间。
    pub(crate) fn clamp(&self, timeout: Option<Duration>, now: Instant) -> Option<Duration> {
        match self.next_deadline() {
            None => timeout,
            Some(at) => {
                let until = at.saturating_duration_since(now);
                Some(timeout.map_or(until, |timeout| timeout.min(until)))
            }
        }
    }

    /// 取出所有在 `now` 之前到期的事件，按到期顺序。
    pub(crate) fn expired(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut fired = Vec::new();
        while self.heap.peek().is_some_and(|deadline| deadline.at <= now) {
            if let Some(deadline) = self.heap.pop() {
                fired.push(deadline.event);
            }
        }
        fired
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}
