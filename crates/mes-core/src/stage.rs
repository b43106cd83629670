//! 製程站別與批次狀態

use serde::{Deserialize, Serialize};
use std::fmt;

/// 製程站別（固定四站，固定順序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// 成型
    Molding,
    /// 機加工
    Machining,
    /// 組裝
    Assembling,
    /// 測試
    Testing,
}

impl Stage {
    /// 標準站別順序
    pub const CANONICAL: [Stage; 4] = [
        Stage::Molding,
        Stage::Machining,
        Stage::Assembling,
        Stage::Testing,
    ];

    /// 站別名稱（與儲存文件欄位一致）
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Molding => "Molding",
            Stage::Machining => "Machining",
            Stage::Assembling => "Assembling",
            Stage::Testing => "Testing",
        }
    }

    /// 批號用站別代碼
    pub fn code(&self) -> &'static str {
        match self {
            Stage::Molding => "MLD",
            Stage::Machining => "MCH",
            Stage::Assembling => "ASM",
            Stage::Testing => "TST",
        }
    }

    /// 在標準順序中的位置
    pub fn ordinal(&self) -> usize {
        match self {
            Stage::Molding => 0,
            Stage::Machining => 1,
            Stage::Assembling => 2,
            Stage::Testing => 3,
        }
    }

    /// 由名稱解析站別
    pub fn parse(name: &str) -> Option<Stage> {
        Self::CANONICAL.into_iter().find(|s| s.as_str() == name)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 檢查站別列表是否為標準順序的非空、不重複子序列
pub fn is_canonical_subsequence(stages: &[Stage]) -> bool {
    !stages.is_empty() && stages.windows(2).all(|w| w[0].ordinal() < w[1].ordinal())
}

/// 批次狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    /// 已計劃（尚無任何站別開工）
    Planned,
    /// 生產中
    #[serde(rename = "In Progress")]
    InProgress,
    /// 暫停（僅由外部設定）
    #[serde(rename = "On Hold")]
    OnHold,
    /// 已完成
    Completed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Planned => "Planned",
            BatchStatus::InProgress => "In Progress",
            BatchStatus::OnHold => "On Hold",
            BatchStatus::Completed => "Completed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
