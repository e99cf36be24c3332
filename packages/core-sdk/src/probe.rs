use anyhow::{bail, Result};
use futures_util::future::join_all;

use crate::llm;
use crate::models::{Message, Provider};

/** \brief 探测请求使用的固定短内容 */
const PROBE_PROMPT: &str = "Hi";

/**
 * \brief 连通性探测：用首个已配置模型发送一条最小的非流式请求。
 *        未配置任何模型时立即失败，不发起网络调用；
 *        只看调用成败，不评估返回内容。
 */
pub async fn probe_provider(provider: &Provider) -> Result<()> {
    let Some(model) = provider.models.first() else {
        bail!("provider `{}` has no models configured", provider.name);
    };
    llm::chat_once(provider, model, &[Message::user(PROBE_PROMPT)]).await?;
    Ok(())
}

/**
 * \brief 并发探测多个 Provider，全部完成后按原顺序返回各自结果。
 *        探测相互独立，单个失败不影响其余。
 */
pub async fn probe_all(providers: &[Provider]) -> Vec<Result<()>> {
    join_all(providers.iter().map(probe_provider)).await
}
