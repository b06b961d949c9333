//! 发布闸门

use serde::Serialize;

use super::staging::StagingResult;

/// 操作者意图
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorIntent {
    None,
    Confirm,
    Force,
}

/// 闸门决策
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Proceed,
    Halt,
    AwaitingApproval,
}

/// staging 未通过一律 halt；通过后需要 confirm 或 force 才继续
pub fn decide(staging: &StagingResult, intent: OperatorIntent) -> GateDecision {
    if !staging.passed() {
        return GateDecision::Halt;
    }
    match intent {
        OperatorIntent::Force | OperatorIntent::Confirm => GateDecision::Proceed,
        OperatorIntent::None => GateDecision::AwaitingApproval,
    }
}
