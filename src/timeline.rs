//! timeline.rs - 请求生命周期的时间线记录。

use std::time::Instant;

/// 请求途经的阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Init,
    Error,
    Kill,
    Cache,
    Stash,
    Block,
    Mode,
    Filter,
    Connect,
    Download,
    Optimize,
    Response,
}

impl Stage {
    /// 阶段的规范名称。
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Error => "error",
            Stage::Kill => "kill",
            Stage::Cache => "cache",
            Stage::Stash => "stash",
            Stage::Block => "block",
            Stage::Mode => "mode",
            Stage::Filter => "filter",
            Stage::Connect => "connect",
            Stage::Download => "download",
            Stage::Optimize => "optimize",
            Stage::Response => "response",
        }
    }
}

/// 各阶段进入时刻的一次性记录。
///
/// 每个阶段只能标记一次，重复标记会被拒绝，时刻保持首次写入的值。
#[derive(Debug, Default)]
pub struct Timeline {
    init: Option<Instant>,
    error: Option<Instant>,
    kill: Option<Instant>,
    cache: Option<Instant>,
    stash: Option<Instant>,
    block: Option<Instant>,
    mode: Option<Instant>,
    filter: Option<Instant>,
    connect: Option<Instant>,
    download: Option<Instant>,
    optimize: Option<Instant>,
    response: Option<Instant>,
}

impl Timeline {
    /// 标记一个阶段，成功写入返回 `true`，已被标记过返回 `false`。
    pub fn mark(&mut self, stage: Stage) -> bool {
        let slot = self.slot_mut(stage);
        if slot.is_some() {
            return false;
        }
        *slot = Some(Instant::now());
        true
    }

    /// 读取某阶段的进入时刻。
    pub fn get(&self, stage: Stage) -> Option<Instant> {
        match stage {
            Stage::Init => self.init,
            Stage::Error => self.error,
            Stage::Kill => self.kill,
            Stage::Cache => self.cache,
            Stage::Stash => self.stash,
            Stage::Block => self.block,
            Stage::Mode => self.mode,
            Stage::Filter => self.filter,
            Stage::Connect => self.connect,
            Stage::Download => self.download,
            Stage::Optimize => self.optimize,
            Stage::Response => self.response,
        }
    }

    fn slot_mut(&mut self, stage: Stage) -> &mut Option<Instant> {
        match stage {
            Stage::Init => &mut self.init,
            Stage::Error => &mut self.error,
            Stage::Kill => &mut self.kill,
            Stage::Cache => &mut self.cache,
            Stage::Stash => &mut self.stash,
            Stage::Block => &mut self.block,
            Stage::Mode => &mut self.mode,
            Stage::Filter => &mut self.filter,
            Stage::Connect => &mut self.connect,
            Stage::Download => &mut self.download,
            Stage::Optimize => &mut self.optimize,
            Stage::Response => &mut self.response,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_is_write_once() {
        let mut timeline = Timeline::default();
        assert!(timeline.mark(Stage::Init));
        let first = timeline.get(Stage::Init).unwrap();

        assert!(!timeline.mark(Stage::Init));
        assert_eq!(timeline.get(Stage::Init), Some(first));
    }

    #[test]
    fn test_unmarked_stages_stay_empty() {
        let mut timeline = Timeline::default();
        timeline.mark(Stage::Cache);
        assert!(timeline.get(Stage::Cache).is_some());
        assert!(timeline.get(Stage::Download).is_none());
        assert!(timeline.get(Stage::Error).is_none());
    }
}
