use serde::{Deserialize, Serialize};

/**
 * \brief Provider 配置模型，描述一个 OpenAI 兼容后端。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    /** \brief 唯一标识 */
    pub id: i64,
    /** \brief Provider 显示名称 */
    pub name: String,
    /** \brief API 基地址 */
    pub api_base: String,
    /** \brief API Key（部分本地后端无需鉴权，允许缺省） */
    pub api_key: Option<String>,
    /** \brief 可用模型列表（有序、不含重复项；发起请求前必须从中选定一个） */
    pub models: Vec<String>,
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/**
 * \brief 用量快照。后到的快照整体替换先前的值，不做累加。
 */
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /** \brief 提示词 token 数 */
    #[serde(default)]
    pub prompt_tokens: u64,
    /** \brief 补全 token 数 */
    #[serde(default)]
    pub completion_tokens: u64,
    /** \brief 总 token 数 */
    #[serde(default)]
    pub total_tokens: u64,
}

/**
 * \brief 一次解码得到的流式增量：至多各一个内容片段、用量快照、终止错误。
 *        带 error 的增量意味着流到此结束。
 */
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamIncrement {
    /** \brief 追加到输出的内容片段 */
    pub content: Option<String>,
    /** \brief 用量快照 */
    pub usage: Option<Usage>,
    /** \brief 终止性错误消息 */
    pub error: Option<String>,
}

impl StreamIncrement {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/**
 * \brief 思考/正文切分结果。由完整累积文本重新推导，不单独存储。
 *        thought 为 None 表示输出不属于推理风格回复。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThinkingSplit {
    /** \brief 思考段（去除首尾空白） */
    pub thought: Option<String>,
    /** \brief 正文段 */
    pub content: String,
}
