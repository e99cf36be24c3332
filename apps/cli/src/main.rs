use std::collections::HashMap;
use std::io::Write;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;

use promptloom_core_sdk::models::{Message, Provider, Usage};
use promptloom_core_sdk::{llm, probe, telemetry, template, thinking};

/**
 * \brief CLI 程序入口：模板渲染与流式补全的最小命令行消费端。
 */
#[derive(Parser, Debug)]
#[command(name = "promptloom", version, about = "PromptLoom templated prompt runner")]
struct Cli {
    /** \brief 开启本地遥测日志 */
    #[arg(long, global = true, default_value_t = false)]
    telemetry: bool,

    #[command(subcommand)]
    command: Commands,
}

/**
 * \brief Provider 连接参数，engine 按调用传入，不做任何持久化。
 */
#[derive(Args, Debug)]
struct ProviderOpts {
    #[arg(long, default_value = "default")]
    name: String,
    #[arg(long)]
    api_base: String,
    #[arg(long)]
    api_key: Option<String>,
    /** \brief 可重复传入；首个模型用于生成与探测 */
    #[arg(long = "model")]
    models: Vec<String>,
}

impl ProviderOpts {
    fn into_provider(self) -> Provider {
        let mut models: Vec<String> = Vec::new();
        for model in self.models {
            if !models.contains(&model) {
                models.push(model);
            }
        }
        Provider {
            id: 0,
            name: self.name,
            api_base: self.api_base,
            api_key: self.api_key,
            models,
        }
    }
}

/**
 * \brief 模板参数：system/user 模板与 name=value 变量。
 */
#[derive(Args, Debug)]
struct TemplateOpts {
    #[arg(long)]
    system: Option<String>,
    #[arg(long)]
    user: String,
    #[arg(long = "var", value_parser = parse_var)]
    vars: Vec<(String, String)>,
}

impl TemplateOpts {
    /**
     * \brief 汇总两个模板中出现的占位符（首现顺序、去重）。
     */
    fn placeholders(&self) -> Vec<String> {
        let mut names = template::detect_placeholders(self.system.as_deref().unwrap_or(""));
        for name in template::detect_placeholders(&self.user) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /**
     * \brief 构造变量表：每个检测到的占位符都有键，默认空串，再覆盖用户给定值。
     */
    fn variables(&self) -> HashMap<String, String> {
        let mut variables: HashMap<String, String> = self
            .placeholders()
            .into_iter()
            .map(|name| (name, String::new()))
            .collect();
        for (name, value) in &self.vars {
            variables.insert(name.clone(), value.clone());
        }
        variables
    }

    /**
     * \brief 渲染为有序消息对：system（若有）在前，user 在后。
     */
    fn resolve_messages(&self) -> Vec<Message> {
        let variables = self.variables();
        let mut messages = Vec::new();
        if let Some(system) = &self.system {
            messages.push(Message::system(template::resolve(system, &variables)));
        }
        messages.push(Message::user(template::resolve(&self.user, &variables)));
        messages
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 渲染模板：显示占位符、替换结果与 token 估算。
     */
    Render {
        #[command(flatten)]
        template: TemplateOpts,
    },

    /**
     * \brief 发送渲染后的消息对并流式显示回复，思考段与正文分开展示。
     */
    Chat {
        #[command(flatten)]
        provider: ProviderOpts,
        #[command(flatten)]
        template: TemplateOpts,
    },

    /**
     * \brief 列出 Provider 的可用模型。
     */
    Models {
        #[command(flatten)]
        provider: ProviderOpts,
    },

    /**
     * \brief 连通性探测：验证 Provider/模型组合可达且已授权。
     */
    Probe {
        #[command(flatten)]
        provider: ProviderOpts,
    },
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) => Ok((name.to_string(), value.to_string())),
        None => Err(format!("expected name=value, got `{}`", s)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::set_enabled(cli.telemetry);

    match cli.command {
        Commands::Render { template: opts } => {
            render(&opts);
        }
        Commands::Chat {
            provider,
            template: opts,
        } => {
            let provider = provider.into_provider();
            let model = provider
                .models
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("at least one --model is required"))?;
            let messages = opts.resolve_messages();
            chat(&provider, &model, &messages).await?;
        }
        Commands::Models { provider } => {
            let provider = provider.into_provider();
            telemetry::log_event("cli.models", &format!("base={}", provider.api_base));
            let models = llm::list_models(&provider)
                .await
                .context("list models failed")?;
            for model in models {
                println!("{}", model);
            }
        }
        Commands::Probe { provider } => {
            let provider = provider.into_provider();
            telemetry::log_event(
                "cli.probe",
                &format!("provider={} base={}", provider.name, provider.api_base),
            );
            probe::probe_provider(&provider)
                .await
                .context("connectivity check failed")?;
            println!("ok: provider `{}` is reachable", provider.name);
        }
    }

    Ok(())
}

fn render(opts: &TemplateOpts) {
    let placeholders = opts.placeholders();
    println!("placeholders: {}", placeholders.join(", "));

    let variables = opts.variables();
    if let Some(system) = &opts.system {
        let resolved = template::resolve(system, &variables);
        println!(
            "-- system (raw ~{} tokens, resolved ~{} tokens)",
            template::estimate_tokens(system),
            template::estimate_tokens(&resolved)
        );
        println!("{}", resolved);
    }
    let resolved = template::resolve(&opts.user, &variables);
    println!(
        "-- user (raw ~{} tokens, resolved ~{} tokens)",
        template::estimate_tokens(&opts.user),
        template::estimate_tokens(&resolved)
    );
    println!("{}", resolved);
}

/**
 * \brief 消费流式增量：每个增量后对累积文本重新切分，
 *        新增的思考/正文后缀即时打印；Ctrl-C 中断即放弃流（关闭连接）。
 */
async fn chat(provider: &Provider, model: &str, messages: &[Message]) -> Result<()> {
    telemetry::log_event(
        "cli.chat",
        &format!(
            "provider={} model={} msgs={}",
            provider.name,
            model,
            messages.len()
        ),
    );

    let mut stream = llm::stream_chat(provider, model, messages);
    let mut full = String::new();
    let mut printed_thought = 0usize;
    let mut printed_content = 0usize;
    let mut thought_open = false;
    let mut answer_open = false;
    let mut usage: Option<Usage> = None;

    loop {
        let increment = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                eprintln!("cancelled");
                break;
            }
            item = stream.next() => match item {
                Some(increment) => increment,
                None => break,
            },
        };

        if let Some(error) = increment.error {
            println!();
            telemetry::log_error("cli.chat", &format!("stream error: {}", error));
            return Err(anyhow!(error));
        }
        if let Some(snapshot) = increment.usage {
            usage = Some(snapshot);
        }
        let Some(delta) = increment.content else {
            continue;
        };

        full.push_str(&delta);
        let split = thinking::split_thinking(&full);
        if let Some(thought) = &split.thought {
            if !thought_open {
                println!("[thinking]");
                thought_open = true;
            }
            if thought.len() > printed_thought && thought.is_char_boundary(printed_thought) {
                print!("{}", &thought[printed_thought..]);
                printed_thought = thought.len();
            }
        }
        if !split.content.is_empty() {
            if thought_open && !answer_open {
                println!();
                println!("[answer]");
            }
            answer_open = true;
            if split.content.len() > printed_content
                && split.content.is_char_boundary(printed_content)
            {
                print!("{}", &split.content[printed_content..]);
                printed_content = split.content.len();
            }
        }
        std::io::stdout().flush().ok();
    }
    println!();

    if let Some(usage) = usage {
        println!(
            "usage: prompt={} completion={} total={}",
            usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
        );
    }
    Ok(())
}
