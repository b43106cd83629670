//! 日誌初始化
//!
//! `RUST_LOG` 控制過濾條件，未設定時為 `info`。

use tracing_subscriber::{fmt, EnvFilter};

/// 初始化日誌
///
/// ```no_run
/// mes::logging::init();
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .init();
}

/// 測試用日誌，輸出交給測試框架擷取；重複呼叫不會出錯
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
