use orchestrator_core::OrchestratorResult;
use orchestrator_domain::{Precision, TaskPayload};
use sha2::{Digest, Sha256};

/// 计算幂等键：sha256(类型 ‖ 规范化负载的JSON)
///
/// 负载先按精度舍入并统一币种大小写，不包含任何时间信息，
/// 同一逻辑请求总是得到同一个键。
pub fn idempotency_key(payload: &TaskPayload, precision: &Precision) -> OrchestratorResult<String> {
    let normalized = payload.normalized(precision);
    let canonical = serde_json::to_vec(&normalized)?;

    let mut hasher = Sha256::new();
    hasher.update(payload.kind().as_str().as_bytes());
    hasher.update([0x1f]);
    hasher.update(&canonical);
    Ok(format!("{:x}", hasher.finalize()))
}
