//! Email front-end for the agent.
//!
//! The bot polls a mailbox through the [`MailTransport`] trait, answers
//! every unread message whose subject starts with the configured
//! prefix, and replies in markdown. Actual IMAP/SMTP plumbing lives
//! behind the trait; everything here (mode detection, reply rendering,
//! the poll loop) is transport-agnostic and tested with a mock.
//!
//! # Subject format
//!
//! After the prefix, the subject selects the mode:
//!
//! - `树洞 手动 <关键词>` — manual keyword search, body is the question
//! - `树洞 测评 <课程> [老师...]` — course review (also triggered by `课程`)
//! - `树洞 <问题>` — automatic search; falls back to the body when the
//!   subject carries no question

use async_trait::async_trait;
use std::time::Duration;

use treehole_core::{AgentError, Query, QueryMode, SynthesisContext};

use crate::agent::Agent;
use crate::config::EmailConfig;

/// Question used when a mail carries a topic but no explicit question.
const DEFAULT_QUESTION: &str = "请介绍一下这个话题";

/// One unread message, already decoded to text.
#[derive(Debug, Clone)]
pub struct InboundMail {
    pub from: String,
    pub subject: String,
    pub body: String,
}

/// Mailbox access. Implementations own the IMAP/SMTP details.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn fetch_unread(&self) -> Result<Vec<InboundMail>, AgentError>;
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AgentError>;
}

/// Parse a mail into a query. The subject must already have the bot
/// prefix stripped.
pub fn parse_request(subject: &str, body: &str) -> Result<Query, String> {
    let subject = subject.trim();
    let body = body.trim();
    let tokens: Vec<&str> = subject.split_whitespace().collect();

    if tokens.first() == Some(&"手动") {
        let keyword = tokens[1..].join(" ");
        if keyword.is_empty() {
            return Err("手动模式需要在主题中给出关键词".to_string());
        }
        let question = if body.is_empty() { DEFAULT_QUESTION } else { body };
        return Ok(Query::manual(keyword, question));
    }

    if tokens.iter().any(|t| *t == "测评" || *t == "课程") {
        let rest: Vec<&str> = tokens
            .iter()
            .filter(|t| **t != "测评" && **t != "课程")
            .copied()
            .collect();
        let Some((course, teachers)) = rest.split_first() else {
            return Err("测评模式需要在主题中给出课程名".to_string());
        };
        return Ok(Query::course_review(
            *course,
            teachers.iter().map(|t| t.to_string()).collect(),
        ));
    }

    let question = if !subject.is_empty() {
        subject
    } else if !body.is_empty() {
        body
    } else {
        return Err("邮件中没有找到问题".to_string());
    };
    Ok(Query::auto(question))
}

/// Subject line for a reply. Kept short and free of the trigger words so
/// a reply-to-reply is not picked up again.
pub fn reply_subject(query: &Query) -> String {
    match &query.mode {
        QueryMode::CourseReview { course, .. } => {
            format!("[测评结果] {}", truncate_chars(course, 30))
        }
        _ => format!("[检索结果] {}", truncate_chars(&query.raw_text, 30)),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

/// Render the answer mail in markdown.
pub fn render_reply(query: &Query, context: &SynthesisContext, answer: &str) -> String {
    let mode_name = match &query.mode {
        QueryMode::Manual { keyword } => format!("手动检索（关键词：{}）", keyword),
        QueryMode::Auto => "自动检索".to_string(),
        QueryMode::CourseReview { course, teachers } if teachers.len() > 1 => {
            format!("课程测评（{}，对比 {} 位老师）", course, teachers.len())
        }
        QueryMode::CourseReview { course, .. } => format!("课程测评（{}）", course),
    };

    let mut out = String::new();
    out.push_str("# 树洞检索结果\n\n");
    out.push_str(&format!(
        "**查询时间**: {}\n\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str(&format!("**模式**: {}\n\n", mode_name));

    if !context.history.is_empty() {
        out.push_str("## 检索过程\n\n");
        for it in &context.history {
            out.push_str(&format!(
                "- 第 {} 轮：{}（{} 个结果）\n",
                it.index,
                it.keywords.join("、"),
                it.posts_found
            ));
        }
        out.push('\n');
    }

    out.push_str("## 回答\n\n");
    out.push_str(answer);
    out.push_str("\n\n");

    let sources = context.sources();
    if !sources.is_empty() {
        out.push_str("## 参考帖子\n\n");
        for source in &sources {
            out.push_str(&format!("- #{} {}\n", source.post_id, source.preview));
        }
    }

    out
}

/// Render the failure mail, with usage instructions.
pub fn render_error_reply(reason: &str) -> String {
    format!(
        "处理你的邮件时出了问题：{}\n\n\
         ## 使用方法\n\n\
         主题以机器人前缀开头，然后：\n\n\
         - `手动 <关键词>`：按关键词检索，正文写问题\n\
         - `测评 <课程> [老师...]`：课程测评，可给多位老师做对比\n\
         - 其他：直接把问题写在主题或正文里\n",
        reason
    )
}

/// Handle one batch of unread mail. Returns the number of messages
/// answered.
pub async fn process_batch(
    agent: &Agent,
    transport: &dyn MailTransport,
    config: &EmailConfig,
) -> Result<usize, AgentError> {
    let mails = transport.fetch_unread().await?;
    let mut handled = 0usize;

    for mail in mails {
        let Some(stripped) = mail.subject.trim().strip_prefix(&config.subject_prefix) else {
            continue;
        };
        handled += 1;

        let (subject, body) = match handle_mail(agent, stripped, &mail.body).await {
            Ok(reply) => reply,
            Err(reason) => ("[检索结果] 处理失败".to_string(), render_error_reply(&reason)),
        };
        if let Err(e) = transport.send(&mail.from, &subject, &body).await {
            tracing::warn!(to = %mail.from, error = %e, "reply send failed");
        }
    }

    Ok(handled)
}

async fn handle_mail(agent: &Agent, subject: &str, body: &str) -> Result<(String, String), String> {
    let query = parse_request(subject, body)?;
    let subject = reply_subject(&query);

    match agent.answer(&query).await {
        Ok(answer) => {
            let (context, text) = answer
                .collect()
                .await
                .map_err(|e| format!("生成回答失败：{}", e))?;
            Ok((subject, render_reply(&query, &context, &text)))
        }
        Err(AgentError::SearchExhausted) => Ok((
            subject,
            "没有找到相关的树洞讨论，可以换个问法或关键词再试。".to_string(),
        )),
        Err(e) => Err(format!("检索失败：{}", e)),
    }
}

/// Poll loop: check the mailbox every `poll_interval_secs` and answer
/// what arrived. Transport errors are logged and the loop keeps going.
pub async fn run_bot(
    agent: Agent,
    transport: Box<dyn MailTransport>,
    config: EmailConfig,
) -> anyhow::Result<()> {
    println!(
        "Email bot polling every {}s (subject prefix: {})",
        config.poll_interval_secs, config.subject_prefix
    );

    loop {
        match process_batch(&agent, transport.as_ref(), &config).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(count = n, "answered mail"),
            Err(e) => tracing::warn!(error = %e, "mailbox poll failed"),
        }
        tokio::time::sleep(Duration::from_secs(config.poll_interval_secs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use std::sync::{Arc, Mutex};
    use treehole_core::{ChatModel, Comment, ForumSearcher, Orchestrator, Post, SearchLimits};

    #[test]
    fn manual_subject_parses_keyword_and_body_question() {
        let query = parse_request(" 手动 计网", "给分怎么样").unwrap();
        match query.mode {
            QueryMode::Manual { keyword } => assert_eq!(keyword, "计网"),
            _ => panic!("expected manual"),
        }
        assert_eq!(query.raw_text, "给分怎么样");
    }

    #[test]
    fn manual_subject_without_keyword_fails() {
        assert!(parse_request("手动", "q").is_err());
    }

    #[test]
    fn manual_body_defaults_to_topic_question() {
        let query = parse_request("手动 计网", "").unwrap();
        assert_eq!(query.raw_text, DEFAULT_QUESTION);
    }

    #[test]
    fn review_subject_parses_course_and_teachers() {
        let query = parse_request("测评 计网 zhx yyx", "").unwrap();
        match query.mode {
            QueryMode::CourseReview { course, teachers } => {
                assert_eq!(course, "计网");
                assert_eq!(teachers, vec!["zhx", "yyx"]);
            }
            _ => panic!("expected course review"),
        }
    }

    #[test]
    fn course_trigger_word_also_selects_review() {
        let query = parse_request("课程 操统", "").unwrap();
        assert!(matches!(query.mode, QueryMode::CourseReview { .. }));
    }

    #[test]
    fn plain_subject_becomes_auto_question() {
        let query = parse_request("期末周图书馆还有座位吗", "").unwrap();
        assert!(matches!(query.mode, QueryMode::Auto));
        assert_eq!(query.raw_text, "期末周图书馆还有座位吗");
    }

    #[test]
    fn empty_subject_falls_back_to_body() {
        let query = parse_request("", "实验班值得上吗").unwrap();
        assert_eq!(query.raw_text, "实验班值得上吗");
        assert!(parse_request("", "").is_err());
    }

    #[test]
    fn reply_subject_avoids_trigger_words_and_truncates() {
        let long = "问".repeat(50);
        let subject = reply_subject(&Query::auto(&long));
        assert!(subject.starts_with("[检索结果] "));
        assert!(subject.chars().count() <= "[检索结果] ".chars().count() + 30);

        let subject = reply_subject(&Query::course_review("计网", vec![]));
        assert_eq!(subject, "[测评结果] 计网");
        assert!(!subject.contains("测评 "));
    }

    // ---- poll loop over a mock transport ----

    struct MockTransport {
        inbox: Mutex<Vec<InboundMail>>,
        sent: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl MailTransport for MockTransport {
        async fn fetch_unread(&self) -> Result<Vec<InboundMail>, AgentError> {
            Ok(std::mem::take(&mut *self.inbox.lock().unwrap()))
        }

        async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AgentError> {
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), subject.to_string(), body.to_string()));
            Ok(())
        }
    }

    struct OnePostForum;

    #[async_trait]
    impl ForumSearcher for OnePostForum {
        async fn search(&self, _keyword: &str, _limit: u32) -> Result<Vec<Post>, AgentError> {
            Ok(vec![Post {
                id: 1,
                text: "计网挺好的".into(),
                timestamp: 1700000000,
                like_count: 0,
                reply_count: 0,
                comment_total: 0,
                comments: vec![],
            }])
        }

        async fn fetch_comments(
            &self,
            _post_id: u64,
            _page: u32,
            _limit: u32,
        ) -> Result<Vec<Comment>, AgentError> {
            Ok(vec![])
        }
    }

    struct FixedChat;

    #[async_trait]
    impl ChatModel for FixedChat {
        async fn complete(&self, _system: Option<&str>, _user: &str) -> Result<String, AgentError> {
            Ok("{\"sufficient\": true}".to_string())
        }

        async fn complete_stream(
            &self,
            _system: Option<&str>,
            _user: &str,
        ) -> Result<BoxStream<'static, Result<String, AgentError>>, AgentError> {
            Ok(futures::stream::iter(vec![Ok("挺好的".to_string())]).boxed())
        }
    }

    #[tokio::test]
    async fn batch_answers_prefixed_mail_and_skips_others() {
        let agent = Agent::new(Orchestrator::new(
            Arc::new(OnePostForum),
            Arc::new(FixedChat),
            SearchLimits::default(),
        ));
        let transport = MockTransport {
            inbox: Mutex::new(vec![
                InboundMail {
                    from: "alice@pku.edu.cn".into(),
                    subject: "树洞 手动 计网".into(),
                    body: "怎么样".into(),
                },
                InboundMail {
                    from: "spam@example.com".into(),
                    subject: "unrelated".into(),
                    body: "".into(),
                },
            ]),
            sent: Mutex::new(vec![]),
        };
        let config = EmailConfig::default();

        let handled = process_batch(&agent, &transport, &config).await.unwrap();
        assert_eq!(handled, 1);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (to, subject, body) = &sent[0];
        assert_eq!(to, "alice@pku.edu.cn");
        assert!(subject.starts_with("[检索结果]"));
        assert!(body.contains("挺好的"));
        assert!(body.contains("## 参考帖子"));
    }

    #[tokio::test]
    async fn parse_failure_gets_usage_reply() {
        let agent = Agent::new(Orchestrator::new(
            Arc::new(OnePostForum),
            Arc::new(FixedChat),
            SearchLimits::default(),
        ));
        let transport = MockTransport {
            inbox: Mutex::new(vec![InboundMail {
                from: "bob@pku.edu.cn".into(),
                subject: "树洞 手动".into(),
                body: "".into(),
            }]),
            sent: Mutex::new(vec![]),
        };

        process_batch(&agent, &transport, &EmailConfig::default())
            .await
            .unwrap();
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].2.contains("使用方法"));
    }
}
