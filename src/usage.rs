//! 用量账本：按次记录每一次模型调用尝试，供运行结束时汇总
//!
//! 账本为运行级（随一次生成创建与销毁），只追加不修改；唯一写入者是生成主循环，
//! 因此无需加锁。汇总支持按角色细分（调用数 / token 数 / 失败尝试数）。

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

/// 角色标识：规划者 / 创作者 / 评论者（用量统计与日志的维度）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleId {
    Planner,
    Writer,
    Critic,
}

impl RoleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleId::Planner => "planner",
            RoleId::Writer => "writer",
            RoleId::Critic => "critic",
        }
    }
}

impl std::fmt::Display for RoleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次调用尝试的记录；每次尝试（无论成败）各记一条
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub role: RoleId,
    /// 第几次尝试（从 1 起）
    pub attempt: u32,
    /// 后端报告的 token 总数；失败尝试为 0
    pub tokens: u64,
    pub latency: Duration,
    pub ok: bool,
}

/// 按角色汇总的用量
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoleUsage {
    pub calls: u64,
    pub tokens: u64,
    pub failed_attempts: u64,
}

/// 用量账本：per_call 只追加，总量由记录派生
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageLedger {
    per_call: Vec<CallRecord>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, record: CallRecord) {
        self.per_call.push(record);
    }

    pub fn per_call(&self) -> &[CallRecord] {
        &self.per_call
    }

    /// 总请求数 = per_call 条数
    pub fn total_requests(&self) -> u64 {
        self.per_call.len() as u64
    }

    pub fn total_tokens(&self) -> u64 {
        self.per_call.iter().map(|r| r.tokens).sum()
    }

    /// 按角色细分：调用数、token 数、失败尝试数
    pub fn role_summary(&self) -> BTreeMap<RoleId, RoleUsage> {
        let mut summary: BTreeMap<RoleId, RoleUsage> = BTreeMap::new();
        for rec in &self.per_call {
            let entry = summary.entry(rec.role).or_default();
            entry.calls += 1;
            entry.tokens += rec.tokens;
            if !rec.ok {
                entry.failed_attempts += 1;
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(role: RoleId, attempt: u32, tokens: u64, ok: bool) -> CallRecord {
        CallRecord {
            role,
            attempt,
            tokens,
            latency: Duration::from_millis(10),
            ok,
        }
    }

    #[test]
    fn test_totals_derive_from_records() {
        let mut ledger = UsageLedger::new();
        assert_eq!(ledger.total_requests(), 0);

        ledger.record(rec(RoleId::Planner, 1, 100, true));
        ledger.record(rec(RoleId::Writer, 1, 0, false));
        ledger.record(rec(RoleId::Writer, 2, 250, true));

        assert_eq!(ledger.total_requests(), 3);
        assert_eq!(ledger.total_tokens(), 350);
        assert_eq!(ledger.per_call().len(), 3);
    }

    #[test]
    fn test_total_requests_monotonic() {
        let mut ledger = UsageLedger::new();
        let mut last = 0;
        for attempt in 1..=5 {
            ledger.record(rec(RoleId::Critic, attempt, 10, true));
            let now = ledger.total_requests();
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn test_role_summary_breakdown() {
        let mut ledger = UsageLedger::new();
        ledger.record(rec(RoleId::Writer, 1, 0, false));
        ledger.record(rec(RoleId::Writer, 2, 300, true));
        ledger.record(rec(RoleId::Critic, 1, 50, true));

        let summary = ledger.role_summary();
        let writer = &summary[&RoleId::Writer];
        assert_eq!(writer.calls, 2);
        assert_eq!(writer.tokens, 300);
        assert_eq!(writer.failed_attempts, 1);
        assert_eq!(summary[&RoleId::Critic].calls, 1);
        assert!(!summary.contains_key(&RoleId::Planner));
    }
}
