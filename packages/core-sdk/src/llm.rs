use anyhow::{anyhow, Result};
use async_stream::stream;
use futures_util::{pin_mut, Stream, StreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::pin::Pin;

use crate::models::{Message, Provider, StreamIncrement, Usage};

const COMPLETIONS_PATH: &str = "/chat/completions";
const MODELS_PATH: &str = "/models";
const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/**
 * \brief 由配置的基地址推导补全请求地址：去掉末尾一个 `/`，
 *        若尚未以补全子路径结尾则追加之。纯函数，无副作用。
 */
pub fn completions_url(api_base: &str) -> String {
    let base = api_base.strip_suffix('/').unwrap_or(api_base);
    if base.ends_with(COMPLETIONS_PATH) {
        base.to_string()
    } else {
        format!("{}{}", base, COMPLETIONS_PATH)
    }
}

/**
 * \brief 由基地址推导模型列表地址：已带补全子路径时将其替换为
 *        模型子路径，否则直接追加模型子路径。
 */
pub fn models_url(api_base: &str) -> String {
    let base = api_base.strip_suffix('/').unwrap_or(api_base);
    match base.strip_suffix(COMPLETIONS_PATH) {
        Some(prefix) => format!("{}{}", prefix, MODELS_PATH),
        None => format!("{}{}", base, MODELS_PATH),
    }
}

/**
 * \brief 以流式增量返回一次补全请求的结果。
 *        所有失败（建连、非 2xx、传输中断）都以带 error 的增量就地收尾，
 *        不向外抛出；消费方按需拉取，放弃整个流即取消请求。
 */
pub fn stream_chat(
    provider: &Provider,
    model: &str,
    messages: &[Message],
) -> Pin<Box<dyn Stream<Item = StreamIncrement> + Send>> {
    let url = completions_url(&provider.api_base);
    let api_key = provider.api_key.clone();
    let body = json!({
        "model": model,
        "messages": messages,
        "temperature": 0.7,
        "stream": true
    });

    let out = stream! {
        let client = match reqwest::Client::builder().build() {
            Ok(client) => client,
            Err(e) => {
                yield StreamIncrement::error(format!("client init failed: {}", e));
                return;
            }
        };

        let mut request = client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .json(&body);
        if let Some(key) = &api_key {
            request = request.header(AUTHORIZATION, format!("Bearer {}", key));
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                yield StreamIncrement::error(format!("request failed: {}", e));
                return;
            }
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            yield StreamIncrement::error(error_message(status, &text));
            return;
        }

        let increments = decode_sse(resp.bytes_stream());
        pin_mut!(increments);
        while let Some(increment) = increments.next().await {
            yield increment;
        }
    };

    Box::pin(out)
}

/**
 * \brief 非流式调用，返回完整回复正文。连通性探测等一次性场景使用。
 */
pub async fn chat_once(provider: &Provider, model: &str, messages: &[Message]) -> Result<String> {
    let url = completions_url(&provider.api_base);
    let client = reqwest::Client::builder().build()?;
    let body = json!({
        "model": model,
        "messages": messages,
        "temperature": 0.7,
        "stream": false
    });

    let mut request = client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .json(&body);
    if let Some(key) = &provider.api_key {
        request = request.header(AUTHORIZATION, format!("Bearer {}", key));
    }

    let resp = request.send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!(error_message(status, &text)));
    }
    let v: Value = resp.json().await?;
    Ok(extract_message_content(&v))
}

/**
 * \brief 列出 Provider 的可用模型，按字典序返回。
 *        无法识别的响应形状是硬失败，不会退化为空列表。
 */
pub async fn list_models(provider: &Provider) -> Result<Vec<String>> {
    let url = models_url(&provider.api_base);
    let client = reqwest::Client::new();
    let mut request = client.get(url);
    if let Some(key) = &provider.api_key {
        request = request.header(AUTHORIZATION, format!("Bearer {}", key));
    }

    let resp = request.send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!(error_message(status, &text)));
    }
    parse_model_list(resp.json().await?)
}

/**
 * \brief 把字节流重组为按行切分的增量序列。
 *        分片边界可能落在行中间：每轮解码后残缺的尾行留在缓冲区，
 *        与下一分片拼接后再处理；单行解码失败只丢弃该行。
 */
fn decode_sse<S, B, E>(byte_stream: S) -> impl Stream<Item = StreamIncrement>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    stream! {
        pin_mut!(byte_stream);
        let mut buf = Vec::<u8>::new();
        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield StreamIncrement::error(format!("stream error: {}", e));
                    return;
                }
            };
            buf.extend_from_slice(chunk.as_ref());
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                if let Some(increment) = parse_stream_line(String::from_utf8_lossy(&line).trim()) {
                    yield increment;
                }
            }
        }
        // 传输结束后残留的未换行尾行按完整行处理
        let tail = std::mem::take(&mut buf);
        if let Some(increment) = parse_stream_line(String::from_utf8_lossy(&tail).trim()) {
            yield increment;
        }
    }
}

/**
 * \brief 解析一条完整的流式帧。空行、结束哨兵、无 data 前缀的行、
 *        解码失败的行以及既无内容也无用量的行都不产生增量。
 */
fn parse_stream_line(line: &str) -> Option<StreamIncrement> {
    let payload = line.strip_prefix(DATA_PREFIX)?.trim_start();
    if payload.is_empty() || payload == DONE_SENTINEL {
        return None;
    }
    let v: Value = serde_json::from_str(payload).ok()?;
    let content = extract_delta_content(&v);
    let usage = v
        .get("usage")
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());
    if content.is_none() && usage.is_none() {
        return None;
    }
    Some(StreamIncrement {
        content,
        usage,
        error: None,
    })
}

fn extract_delta_content(v: &Value) -> Option<String> {
    v.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

fn extract_message_content(v: &Value) -> String {
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_error_message(v: &Value) -> Option<String> {
    v.get("error")?.get("message")?.as_str().map(|s| s.to_string())
}

fn error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .as_ref()
        .and_then(extract_error_message)
        .unwrap_or_else(|| format!("HTTP Error {}", status.as_u16()))
}

fn parse_model_list(v: Value) -> Result<Vec<String>> {
    let mut ids: Vec<String> = if let Some(arr) = v.get("data").and_then(|x| x.as_array()) {
        arr.iter()
            .filter_map(|item| item.get("id").and_then(|s| s.as_str()))
            .map(|s| s.to_string())
            .collect()
    } else if let Some(arr) = v.get("models").and_then(|x| x.as_array()) {
        arr.iter()
            .filter_map(|item| item.get("name").and_then(|s| s.as_str()))
            .map(|s| s.to_string())
            .collect()
    } else {
        return Err(anyhow!("unrecognized response format: {}", v));
    };
    ids.sort();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use futures_util::stream;
    use std::sync::{Arc, Mutex};

    fn provider(api_base: &str, api_key: Option<&str>, models: &[&str]) -> Provider {
        Provider {
            id: 1,
            name: "test".to_string(),
            api_base: api_base.to_string(),
            api_key: api_key.map(|s| s.to_string()),
            models: models.iter().map(|s| s.to_string()).collect(),
        }
    }

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_completions_url_normalization() {
        assert_eq!(
            completions_url("http://h/v1"),
            "http://h/v1/chat/completions"
        );
        assert_eq!(
            completions_url("http://h/v1/"),
            "http://h/v1/chat/completions"
        );
        assert_eq!(
            completions_url("http://h/v1/chat/completions"),
            "http://h/v1/chat/completions"
        );
        assert_eq!(
            completions_url("http://h/v1/chat/completions/"),
            "http://h/v1/chat/completions"
        );
    }

    #[test]
    fn test_models_url_replaces_completion_suffix() {
        assert_eq!(models_url("http://h/v1"), "http://h/v1/models");
        assert_eq!(models_url("http://h/v1/"), "http://h/v1/models");
        assert_eq!(
            models_url("http://h/v1/chat/completions"),
            "http://h/v1/models"
        );
    }

    #[test]
    fn test_parse_stream_line_variants() {
        let inc = parse_stream_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#)
            .expect("content frame");
        assert_eq!(inc.content.as_deref(), Some("Hi"));
        assert!(inc.usage.is_none());

        let inc = parse_stream_line(
            r#"data: {"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#,
        )
        .expect("usage frame");
        let usage = inc.usage.expect("usage");
        assert_eq!(usage.prompt_tokens, 3);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 5);

        assert!(parse_stream_line("").is_none());
        assert!(parse_stream_line("data: [DONE]").is_none());
        assert!(parse_stream_line("data: {not json}").is_none());
        assert!(parse_stream_line(": keep-alive comment").is_none());
        assert!(parse_stream_line(r#"data: {"choices":[{"delta":{}}],"usage":null}"#).is_none());
    }

    #[tokio::test]
    async fn test_decode_sse_at_every_chunk_boundary() {
        let frames = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
            "data: [DONE]\n"
        );
        for split in 0..=frames.len() {
            let (a, b) = frames.as_bytes().split_at(split);
            let chunks: Vec<std::result::Result<&[u8], std::fmt::Error>> = vec![Ok(a), Ok(b)];
            let incs: Vec<StreamIncrement> =
                decode_sse(stream::iter(chunks)).collect().await;
            let parts: Vec<String> = incs.iter().filter_map(|i| i.content.clone()).collect();
            assert_eq!(parts, vec!["Hel".to_string(), "lo".to_string()]);
            assert!(incs.iter().all(|i| i.error.is_none()));
        }
    }

    #[tokio::test]
    async fn test_decode_sse_skips_malformed_line() {
        let frames = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
            "data: {not json}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
            "data: [DONE]\n"
        );
        let chunks: Vec<std::result::Result<&[u8], std::fmt::Error>> =
            vec![Ok(frames.as_bytes())];
        let incs: Vec<StreamIncrement> = decode_sse(stream::iter(chunks)).collect().await;
        let parts: Vec<String> = incs.iter().filter_map(|i| i.content.clone()).collect();
        assert_eq!(parts, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn test_decode_sse_transport_failure_is_terminal_increment() {
        let chunks: Vec<std::result::Result<&[u8], std::fmt::Error>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n".as_ref()),
            Err(std::fmt::Error),
        ];
        let incs: Vec<StreamIncrement> = decode_sse(stream::iter(chunks)).collect().await;
        assert_eq!(incs.len(), 2);
        assert_eq!(incs[0].content.as_deref(), Some("Hel"));
        assert!(incs[1].error.is_some());
    }

    #[tokio::test]
    async fn test_stream_chat_delivers_content_and_usage() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                concat!(
                    "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
                    "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
                    "data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2,\"total_tokens\":3}}\n",
                    "data: [DONE]\n"
                )
            }),
        );
        let base = spawn_server(app).await;
        let p = provider(&base, None, &["m1"]);

        let incs: Vec<StreamIncrement> =
            stream_chat(&p, "m1", &[Message::user("hi")]).collect().await;
        let text: String = incs.iter().filter_map(|i| i.content.as_deref()).collect();
        assert_eq!(text, "Hello");
        assert!(incs.iter().all(|i| i.error.is_none()));
        let usage = incs
            .iter()
            .rev()
            .find_map(|i| i.usage)
            .expect("usage snapshot");
        assert_eq!(usage.total_tokens, 3);
    }

    #[tokio::test]
    async fn test_stream_chat_error_status_yields_single_error_increment() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                (
                    axum::http::StatusCode::UNAUTHORIZED,
                    Json(serde_json::json!({"error": {"message": "Invalid API key"}})),
                )
            }),
        );
        let base = spawn_server(app).await;
        let p = provider(&base, Some("bad"), &["m1"]);

        let incs: Vec<StreamIncrement> =
            stream_chat(&p, "m1", &[Message::user("hi")]).collect().await;
        assert_eq!(incs.len(), 1);
        assert_eq!(incs[0].error.as_deref(), Some("Invalid API key"));
        assert!(incs[0].content.is_none());
    }

    #[tokio::test]
    async fn test_stream_chat_generic_error_message_without_error_body() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let base = spawn_server(app).await;
        let p = provider(&base, None, &["m1"]);

        let incs: Vec<StreamIncrement> =
            stream_chat(&p, "m1", &[Message::user("hi")]).collect().await;
        assert_eq!(incs.len(), 1);
        assert_eq!(incs[0].error.as_deref(), Some("HTTP Error 500"));
    }

    #[tokio::test]
    async fn test_bearer_header_present_only_with_credential() {
        let seen: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();
        let app = Router::new().route(
            "/chat/completions",
            post(move |headers: HeaderMap| {
                let seen = seen_in_handler.clone();
                async move {
                    let auth = headers
                        .get(axum::http::header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.to_string());
                    seen.lock().expect("lock").push(auth);
                    "data: [DONE]\n"
                }
            }),
        );
        let base = spawn_server(app).await;

        let with_key = provider(&base, Some("sk-test"), &["m1"]);
        let _ = stream_chat(&with_key, "m1", &[Message::user("hi")])
            .collect::<Vec<_>>()
            .await;
        let without_key = provider(&base, None, &["m1"]);
        let _ = stream_chat(&without_key, "m1", &[Message::user("hi")])
            .collect::<Vec<_>>()
            .await;

        let calls = seen.lock().expect("lock").clone();
        assert_eq!(
            calls,
            vec![Some("Bearer sk-test".to_string()), None]
        );
    }

    #[tokio::test]
    async fn test_chat_once_returns_full_content() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                Json(serde_json::json!({
                    "choices": [{"message": {"content": "pong"}}],
                    "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
                }))
            }),
        );
        let base = spawn_server(app).await;
        let p = provider(&base, None, &["m1"]);

        let reply = chat_once(&p, "m1", &[Message::user("ping")])
            .await
            .expect("chat once");
        assert_eq!(reply, "pong");
    }

    #[tokio::test]
    async fn test_list_models_accepts_both_shapes_and_sorts() {
        let app = Router::new()
            .route(
                "/openai/models",
                get(|| async {
                    Json(serde_json::json!({"data": [{"id": "gpt-4o-mini"}, {"id": "gpt-4o"}]}))
                }),
            )
            .route(
                "/local/models",
                get(|| async { Json(serde_json::json!({"models": [{"name": "llama2"}]})) }),
            )
            .route(
                "/odd/models",
                get(|| async { Json(serde_json::json!({"foo": 1})) }),
            );
        let base = spawn_server(app).await;

        let openai = provider(&format!("{}/openai", base), None, &[]);
        assert_eq!(
            list_models(&openai).await.expect("openai shape"),
            vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()]
        );

        let local = provider(&format!("{}/local", base), None, &[]);
        assert_eq!(
            list_models(&local).await.expect("name shape"),
            vec!["llama2".to_string()]
        );

        let odd = provider(&format!("{}/odd", base), None, &[]);
        let err = list_models(&odd).await.expect_err("unrecognized shape");
        assert!(err.to_string().contains("unrecognized response format"));
    }
}
