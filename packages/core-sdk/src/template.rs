use std::collections::HashMap;

/**
 * \brief 扫描模板中的 {name} 占位符，按首次出现顺序去重返回。
 *        name 为 `}` 以外的任意字符序列；未闭合的 `{` 不计入。
 */
pub fn detect_placeholders(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    names
}

/**
 * \brief 用变量表替换模板中的每个 {name} 占位符。
 *        同名占位符替换为同一个值；表中缺失的名字替换为空串；
 *        未闭合的 `{` 原样保留。不是模板语言解析器：
 *        首个 `}` 即终止占位符名（如 {a{b}} 的名字为 a{b）。
 */
pub fn resolve(text: &str, variables: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&rest[..start]);
                if let Some(value) = variables.get(&after[..end]) {
                    out.push_str(value);
                }
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

/**
 * \brief 粗略估算 token 数：ceil(字符数 / 4)，空文本为 0。
 *        仅作 UI 展示参考；原始文本与替换后文本必须用同一算法，
 *        两个数字才有可比性。
 */
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}
