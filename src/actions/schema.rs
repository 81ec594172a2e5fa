//! 动作格式 JSON Schema（schemars 生成）
//!
//! 拼入纠错与备选计划提示词，减少协作方输出格式错误。

use schemars::schema_for;

use crate::actions::Action;

/// 返回线格式动作 `{"type": "...", "params": {...}}` 的 JSON Schema 字符串
pub fn action_schema_json() -> String {
    let schema = schema_for!(Action);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_mentions_type_and_params() {
        let schema = action_schema_json();
        assert!(schema.contains("\"type\""));
        assert!(schema.contains("\"params\""));
    }
}
