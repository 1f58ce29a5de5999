use std::sync::OnceLock;
use std::time::Instant;

/// 进程级单调时钟原点，首次取值时固定。
static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// 返回自进程时钟原点以来的毫秒数。
///
/// # 设计背景（Why）
/// - 会话统计与空闲检测只需要可比较的单调刻度，不需要壁钟时间；
///   壁钟回拨会破坏空闲桶索引的推进语义。
///
/// # 契约说明（What）
/// - 同一进程内的所有读数来自同一原点，可安全做差；
/// - 返回值单调不减。
pub fn now_millis() -> u64 {
    let origin = *ORIGIN.get_or_init(Instant::now);
    Instant::now().duration_since(origin).as_millis() as u64
}
