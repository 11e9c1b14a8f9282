//! Wiring and CLI entry points.
//!
//! [`Agent`] assembles the orchestrator from config: HTTP forum client
//! wrapped in the disk cache, DeepSeek chat client, and the configured
//! search limits. The `run_*` functions implement the CLI commands and
//! print to stdout; the web server and email bot reuse the same
//! [`Agent`].

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;

use treehole_core::{
    Answer, AgentError, Orchestrator, Query, SearchIteration, SynthesisContext,
};

use crate::cache::{CachedSearcher, SearchCache};
use crate::config::Config;
use crate::forum::HttpForumClient;
use crate::llm::DeepSeekClient;

pub struct Agent {
    orchestrator: Orchestrator,
}

impl Agent {
    pub fn from_config(config: &Config) -> Result<Self> {
        let forum = HttpForumClient::from_config(&config.forum)?;
        let cached = CachedSearcher::new(Arc::new(forum), SearchCache::from_config(&config.cache));
        let chat = DeepSeekClient::from_config(&config.llm)?;

        Ok(Agent {
            orchestrator: Orchestrator::new(
                Arc::new(cached),
                Arc::new(chat),
                config.search.limits(),
            ),
        })
    }

    /// Build an agent over pre-built collaborators, for servers and
    /// tests that inject their own.
    pub fn new(orchestrator: Orchestrator) -> Self {
        Agent { orchestrator }
    }

    pub async fn answer(&self, query: &Query) -> Result<Answer, AgentError> {
        self.orchestrator.answer(query).await
    }

    pub async fn run_context(&self, query: &Query) -> Result<SynthesisContext, AgentError> {
        self.orchestrator.run(query).await
    }
}

/// `treehole ask "<question>"`: iterative search plus streamed answer.
pub async fn run_ask(config: &Config, question: &str) -> Result<()> {
    let agent = Agent::from_config(config)?;
    println!("问题: {}", question);
    println!("正在检索树洞...");
    println!();

    stream_answer(&agent, &Query::auto(question)).await
}

/// `treehole search "<keyword>" "<question>"`: single keyword search.
pub async fn run_search(config: &Config, keyword: &str, question: &str) -> Result<()> {
    let agent = Agent::from_config(config)?;
    println!("关键词: {}", keyword);
    println!("问题: {}", question);
    println!();

    stream_answer(&agent, &Query::manual(keyword, question)).await
}

/// `treehole review "<course>" [teachers]`: course review analysis.
pub async fn run_review(config: &Config, course: &str, teachers: &str) -> Result<()> {
    let agent = Agent::from_config(config)?;
    let teacher_list = treehole_core::review::parse_teacher_input(teachers);
    if teacher_list.len() > 1 {
        println!("课程: {} (对比 {} 位老师)", course, teacher_list.len());
    } else {
        println!("课程: {}", course);
    }
    println!("正在收集测评...");
    println!();

    stream_answer(&agent, &Query::course_review(course, teacher_list)).await
}

async fn stream_answer(agent: &Agent, query: &Query) -> Result<()> {
    let answer = match agent.answer(query).await {
        Ok(answer) => answer,
        Err(AgentError::SearchExhausted) => {
            println!("没有找到相关的树洞讨论，可以换个问法或关键词再试。");
            return Ok(());
        }
        Err(AgentError::Upstream(message)) => {
            println!("抱歉，这次没能完成回答（{}），稍后再试一次吧。", message);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    print_history(&answer.context.history);
    println!(
        "共找到 {} 个相关帖子，{} 条参考内容",
        answer.context.candidate_count,
        answer.context.source_count()
    );
    println!();

    let sources = answer.context.sources();
    let mut stream = answer.stream;
    let mut wrote_any = false;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(text) => {
                print!("{}", text);
                std::io::stdout().flush().ok();
                wrote_any = true;
            }
            Err(e) => {
                // Keep whatever streamed before the failure.
                if wrote_any {
                    println!();
                }
                println!("(回答中断: {})", e);
                break;
            }
        }
    }
    println!();

    if !sources.is_empty() {
        println!();
        println!("--- 参考帖子 ---");
        for (i, source) in sources.iter().enumerate() {
            println!("{}. #{} {}", i + 1, source.post_id, source.preview);
        }
    }

    Ok(())
}

fn print_history(history: &[SearchIteration]) {
    for iteration in history {
        println!(
            "第 {} 轮检索: {} ({} 个结果)",
            iteration.index,
            iteration.keywords.join("、"),
            iteration.posts_found
        );
    }
}
