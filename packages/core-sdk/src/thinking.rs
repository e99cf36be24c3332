use crate::models::ThinkingSplit;

/** \brief 思考段开始标记 */
pub const THINK_OPEN: &str = "<think>";
/** \brief 思考段结束标记 */
pub const THINK_CLOSE: &str = "</think>";

/**
 * \brief 把当前累积的输出文本切分为思考段与正文段。
 *        纯函数：对同一文本任何时刻重算结果一致，流式期间每次增量后重新调用即可。
 *        标记按首次出现的子串匹配，不做转义处理；正文中出现的字面
 *        </think> 会被先行命中，这是既定行为。
 */
pub fn split_thinking(text: &str) -> ThinkingSplit {
    let trimmed = text.trim_start();
    if !trimmed.starts_with(THINK_OPEN) {
        return ThinkingSplit {
            thought: None,
            content: text.to_string(),
        };
    }
    let after_open = &trimmed[THINK_OPEN.len()..];
    match after_open.find(THINK_CLOSE) {
        // 结束标记未出现：模型仍在思考，正文暂为空
        None => ThinkingSplit {
            thought: Some(after_open.trim().to_string()),
            content: String::new(),
        },
        Some(pos) => ThinkingSplit {
            thought: Some(after_open[..pos].trim().to_string()),
            content: after_open[pos + THINK_CLOSE.len()..].trim().to_string(),
        },
    }
}
