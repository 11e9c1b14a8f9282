//! Prompt and context assembly for the synthesis calls.
//!
//! Renders retrieved posts into the text block handed to the LLM, keeps
//! the block inside an estimated token budget, and parses the LLM's
//! keyword-proposal and sufficiency replies. All parsing is tolerant:
//! malformed replies degrade to "stop searching and answer with what we
//! have" so the user always gets an answer.

use serde_json::Value;

use crate::models::{Comment, Post, Review, TeacherReviews};

/// System prompt for manual/auto answer synthesis.
pub const ANSWER_SYSTEM_PROMPT: &str = "你是一个北大树洞问答助手。你的任务是根据提供的树洞帖子内容，回答用户的问题。

注意事项：
1. 只基于提供的树洞内容回答，不要编造信息
2. 如果树洞内容不足以回答问题，诚实地告知用户
3. 可以综合多个帖子的观点给出全面的回答
4. 保持客观，如果有不同观点要都提及
5. 回答要有条理，使用markdown格式时只能使用单级列表，不能出现多级列表";

/// Estimate the token count of mixed Chinese/English text.
///
/// Chinese runs roughly 1.5 characters per token, everything else
/// roughly 4.
pub fn estimate_tokens(text: &str) -> usize {
    let chinese = text
        .chars()
        .filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c))
        .count();
    let other = text.chars().count() - chinese;
    (chinese as f64 / 1.5 + other as f64 / 4.0) as usize
}

/// Order comment indices for truncation: poster comments first, then
/// comments mentioning the course token, then the rest. Within each tier
/// the forum order is kept.
fn comment_priority(comments: &[Comment], course_hint: Option<&str>) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..comments.len()).collect();
    indices.sort_by_key(|&i| {
        let c = &comments[i];
        let poster = u8::from(!c.author_is_poster);
        let course = match course_hint {
            Some(token) if !token.is_empty() => u8::from(!c.text.contains(token)),
            _ => 1,
        };
        (poster, course, i)
    });
    indices
}

/// Render one post (header, body, metadata, and a bounded comment list)
/// in the text layout the forum's users recognize.
///
/// `max_comments` bounds the comment list per post; the lowest-priority
/// comments are dropped first and the survivors keep their forum order.
pub fn format_post(post: &Post, max_comments: usize, course_hint: Option<&str>) -> String {
    let mut lines = Vec::new();
    lines.push(format!("=== 帖子 #{} ===", post.id));

    let time = chrono::DateTime::from_timestamp(post.timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    lines.push(format!("时间: {}", time));
    lines.push(format!("\n内容:\n{}", post.text));
    lines.push(format!(
        "\n点赞: {} | 回复: {}",
        post.like_count, post.reply_count
    ));

    if max_comments > 0 && !post.comments.is_empty() {
        let mut kept: Vec<usize> = comment_priority(&post.comments, course_hint)
            .into_iter()
            .take(max_comments)
            .collect();
        kept.sort_unstable();

        lines.push("\n--- 评论 ---".to_string());
        for (n, &i) in kept.iter().enumerate() {
            let c = &post.comments[i];
            let name = if c.author_is_poster {
                "洞主"
            } else {
                c.author_tag.as_deref().unwrap_or("Anonymous")
            };
            lines.push(format!("{}. [{}] {}", n + 1, name, c.text));
        }
    }

    lines.push("=".repeat(50));
    lines.push(String::new());
    lines.join("\n")
}

/// Render a batch of posts, stopping once the estimated token budget is
/// reached. Returns the text and the number of posts included.
pub fn format_posts_within_budget(
    posts: &[Post],
    max_comments: usize,
    token_budget: usize,
    course_hint: Option<&str>,
) -> (String, usize) {
    let mut out = String::new();
    let mut used = 0usize;
    let mut included = 0usize;

    for post in posts {
        let text = format_post(post, max_comments, course_hint);
        let cost = estimate_tokens(&text);
        if included > 0 && used + cost > token_budget {
            break;
        }
        out.push_str(&text);
        out.push('\n');
        used += cost;
        included += 1;
    }

    (out, included)
}

/// Final synthesis prompt for manual/auto modes.
pub fn build_answer_prompt(context_text: &str, question: &str) -> String {
    format!(
        "树洞内容：\n\n{}\n\n---\n\n用户问题：{}\n\n请基于以上树洞内容回答用户的问题。",
        context_text, question
    )
}

// ============ Keyword proposal ============

/// Instruction asking the LLM for an initial keyword set.
pub fn build_keyword_proposal_prompt(question: &str) -> String {
    format!(
        "用户问题：{}\n\n\
         请为在北大树洞中检索相关讨论提出 1-3 个搜索关键词。\
         每个关键词应是最基本的概念（1-2 个词），不要把多个概念放进同一个关键词，\
         例如“户外探索给分”应拆分为“户外探索”和“给分”。\n\
         只返回一个 JSON 数组，例如 [\"计网\", \"给分\"]。",
        question
    )
}

/// Parse a keyword list out of an LLM reply.
///
/// Prefers the first JSON array found in the text; falls back to
/// splitting on whitespace and commas. Returns an empty list only when
/// nothing usable remains.
pub fn parse_keyword_list(reply: &str) -> Vec<String> {
    if let Some(start) = reply.find('[') {
        if let Some(end) = reply[start..].find(']') {
            let json = &reply[start..start + end + 1];
            if let Ok(list) = serde_json::from_str::<Vec<String>>(json) {
                return list
                    .into_iter()
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect();
            }
        }
    }

    reply
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '，' | '、'))
        .map(|k| k.trim_matches(|c: char| c.is_ascii_punctuation() || c == '“' || c == '”'))
        .filter(|k| !k.is_empty())
        .take(3)
        .map(|k| k.to_string())
        .collect()
}

// ============ Sufficiency check ============

/// The LLM's verdict on whether retrieval can stop.
#[derive(Debug, Clone)]
pub struct SufficiencyDecision {
    pub sufficient: bool,
    /// Replacement keywords for the next iteration, when insufficient.
    pub keywords: Vec<String>,
}

/// Short digest of the candidate set for the sufficiency check.
pub fn build_candidate_digest(posts: &[Post], max_posts: usize) -> String {
    let mut lines = Vec::new();
    for post in posts.iter().take(max_posts) {
        let preview: String = post.text.chars().take(120).collect();
        lines.push(format!("#{} {}", post.id, preview.replace('\n', " ")));
    }
    lines.join("\n")
}

/// Instruction asking the LLM whether the evidence suffices.
pub fn build_sufficiency_prompt(question: &str, tried: &[String], digest: &str) -> String {
    format!(
        "用户问题：{}\n\n已尝试的关键词：{}\n\n目前检索到的树洞内容摘要：\n{}\n\n\
         请判断以上内容是否足以回答用户的问题。\
         只返回一个 JSON 对象：{{\"sufficient\": true/false, \"keywords\": [\"新关键词\"]}}。\
         如果不足，请给出 1-3 个与已尝试关键词不同的新关键词。",
        question,
        tried.join("、"),
        if digest.is_empty() { "（无结果）" } else { digest }
    )
}

/// Parse a sufficiency verdict. Malformed replies degrade to
/// "sufficient" so a flaky model ends the loop instead of aborting the
/// query.
pub fn parse_sufficiency(reply: &str) -> SufficiencyDecision {
    let degraded = SufficiencyDecision {
        sufficient: true,
        keywords: Vec::new(),
    };

    let Some(start) = reply.find('{') else {
        return degraded;
    };
    let Some(end) = reply.rfind('}') else {
        return degraded;
    };
    let Ok(value) = serde_json::from_str::<Value>(&reply[start..=end]) else {
        return degraded;
    };

    let sufficient = value
        .get("sufficient")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let keywords = value
        .get("keywords")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect()
        })
        .unwrap_or_default();

    SufficiencyDecision {
        sufficient,
        keywords,
    }
}

// ============ Course review prompts ============

/// System prompt for single-teacher course analysis.
pub fn build_review_system_prompt(course: &str, teacher_display: &str) -> String {
    format!(
        "你是一个专业的课程评价分析助手。你的任务是仔细分析北大树洞中关于「{}」课程（{}）的所有测评，综合多方观点，给出全面的分析。

分析要求：
1. **课程难度**: 综合评估课程的难度水平，包括作业量、考试难度等
2. **教学质量**: 分析老师的授课方式、讲课清晰度、课堂互动等
3. **课程内容**: 评价课程内容的实用性、前沿性、趣味性等
4. **考核方式**: 总结作业、项目、考试等考核方式及其特点
5. **选课建议**: 基于不同学生需求（兴趣/学分/能力等），给出针对性建议
6. **注意事项**: 提醒需要注意的先修知识、时间投入等

要点：
- 客观呈现不同观点，包括正面和负面评价
- 如果评价有分歧，要明确指出并分析原因
- 使用markdown格式时只能使用单级列表，不能出现多级列表
- 引用具体评论时要注明",
        course, teacher_display
    )
}

/// Author mark shown before a review: the poster, or the forum's
/// anonymous alias when one exists.
fn review_author_mark(review: &Review) -> String {
    if review.from_poster {
        "[洞主]".to_string()
    } else {
        match review.author_tag.as_deref() {
            Some(tag) if !tag.is_empty() => format!("[{}]", tag),
            _ => String::new(),
        }
    }
}

/// User prompt for single-teacher course analysis.
pub fn build_review_prompt(course: &str, teacher_display: &str, reviews: &[Review]) -> String {
    let mut reviews_text = String::new();
    for (i, review) in reviews.iter().enumerate() {
        reviews_text.push_str(&format!(
            "\n--- 评论 {} {} (帖子#{}) ---\n{}\n",
            i + 1,
            review_author_mark(review),
            review.post_id,
            review.text
        ));
    }

    format!(
        "以下是从北大树洞收集到的关于「{}」课程（{}）的所有测评内容：\n\n{}\n\n---\n\n\
         请仔细分析以上所有测评，从课程难度、教学质量、课程内容、考核方式、选课建议等多个维度，\
         给出全面、客观的分析和建议。",
        course, teacher_display, reviews_text
    )
}

/// System prompt for multi-teacher comparison.
pub fn build_compare_system_prompt(course: &str) -> String {
    format!(
        "你是一个专业的课程评价对比助手。你需要横向比较同一门课程「{}」在不同老师下的差异。

输出要求：
1. 先给每位老师单独总结（课程难度、教学质量、考核方式、作业负担、给分体感）。
2. 再做横向对比，明确差异点与共识点。
3. 如果数据不均衡（某位老师测评少），要提示结论置信度。
4. 最后给出按学生偏好分类的选课建议（如：追求高分、重视学习收获、时间有限）。
5. 引用具体评论时注明老师和帖子编号。
6. 使用markdown格式时只能使用单级列表，不能出现多级列表。",
        course
    )
}

/// Reviews shown per teacher in a comparison prompt.
const MAX_REVIEWS_PER_TEACHER: usize = 30;
/// Characters kept per review in a comparison prompt.
const MAX_REVIEW_CHARS: usize = 600;

/// User prompt for multi-teacher comparison, grouped by teacher with
/// per-teacher truncation to keep the context bounded.
pub fn build_compare_prompt(course: &str, groups: &[TeacherReviews]) -> String {
    let mut grouped = String::new();

    for group in groups.iter().filter(|g| !g.reviews.is_empty()) {
        grouped.push_str(&format!("\n===== 老师：{} =====\n", group.teacher));
        grouped.push_str(&format!("搜索关键词：{}\n", group.search_keyword));
        grouped.push_str(&format!(
            "帖子数：{}，测评数：{}\n",
            group.posts_found,
            group.reviews.len()
        ));

        for (i, review) in group.reviews.iter().take(MAX_REVIEWS_PER_TEACHER).enumerate() {
            let mut text: String = review.text.chars().take(MAX_REVIEW_CHARS).collect();
            if review.text.chars().count() > MAX_REVIEW_CHARS {
                text.push_str("...");
            }
            grouped.push_str(&format!(
                "\n--- {} 评论{} {} (帖子#{}) ---\n{}\n",
                group.teacher,
                i + 1,
                review_author_mark(review),
                review.post_id,
                text
            ));
        }

        if group.reviews.len() > MAX_REVIEWS_PER_TEACHER {
            grouped.push_str(&format!(
                "\n[注] {} 还有 {} 条测评未展开\n",
                group.teacher,
                group.reviews.len() - MAX_REVIEWS_PER_TEACHER
            ));
        }
    }

    let missing: Vec<&str> = groups
        .iter()
        .filter(|g| g.reviews.is_empty())
        .map(|g| g.teacher.as_str())
        .collect();
    let missing_info = if missing.is_empty() {
        "无".to_string()
    } else {
        missing.join("、")
    };

    format!(
        "以下是北大树洞中同一门课程「{}」不同老师的测评内容（已按老师分组）：\n\n{}\n\n---\n\n\
         没有提取到有效测评的老师：{}\n\n请基于以上内容，输出客观、可比较的横向测评结论。",
        course, grouped, missing_info
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Comment, ReviewKind};

    fn post(id: u64, text: &str, comments: Vec<Comment>) -> Post {
        Post {
            id,
            text: text.to_string(),
            timestamp: 1700000000,
            like_count: 0,
            reply_count: 0,
            comment_total: comments.len() as u32,
            comments,
        }
    }

    fn comment(text: &str, poster: bool) -> Comment {
        Comment {
            post_id: 0,
            author_is_poster: poster,
            text: text.to_string(),
            author_tag: None,
        }
    }

    #[test]
    fn token_estimate_weights_chinese_heavier() {
        // 7 Chinese chars ≈ 4 tokens; 8 ASCII chars ≈ 2 tokens.
        assert_eq!(estimate_tokens("计算机网络课程"), 4);
        assert_eq!(estimate_tokens("networks"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn comment_truncation_drops_lowest_priority_first() {
        let p = post(
            1,
            "计网",
            vec![
                comment("路人甲", false),
                comment("洞主补充", true),
                comment("计网给分好", false),
            ],
        );
        let text = format_post(&p, 2, Some("计网"));
        assert!(text.contains("洞主补充"));
        assert!(text.contains("计网给分好"));
        assert!(!text.contains("路人甲"));
        // Survivors keep forum order: poster comment came second.
        let poster_pos = text.find("洞主补充").unwrap();
        let course_pos = text.find("计网给分好").unwrap();
        assert!(poster_pos < course_pos);
    }

    #[test]
    fn zero_max_comments_hides_comment_section() {
        let p = post(1, "x", vec![comment("c", false)]);
        let text = format_post(&p, 0, None);
        assert!(!text.contains("--- 评论 ---"));
    }

    #[test]
    fn budget_limits_included_posts_but_keeps_at_least_one() {
        let long = "长".repeat(600);
        let posts: Vec<Post> = (1..=5).map(|i| post(i, &long, vec![])).collect();
        let (text, included) = format_posts_within_budget(&posts, 0, 500, None);
        assert_eq!(included, 1);
        assert!(text.contains("帖子 #1"));
        assert!(!text.contains("帖子 #2"));
    }

    #[test]
    fn keyword_list_parses_json_array() {
        let reply = "好的，建议搜索：[\"计网\", \"给分\"]";
        assert_eq!(parse_keyword_list(reply), vec!["计网", "给分"]);
    }

    #[test]
    fn keyword_list_falls_back_to_splitting() {
        assert_eq!(parse_keyword_list("计网 给分"), vec!["计网", "给分"]);
        assert!(parse_keyword_list("").is_empty());
    }

    #[test]
    fn sufficiency_parses_verdict_and_keywords() {
        let reply = r#"{"sufficient": false, "keywords": ["操作系统", ""]}"#;
        let decision = parse_sufficiency(reply);
        assert!(!decision.sufficient);
        assert_eq!(decision.keywords, vec!["操作系统"]);
    }

    #[test]
    fn sufficiency_degrades_to_sufficient_on_garbage() {
        let decision = parse_sufficiency("I cannot answer that");
        assert!(decision.sufficient);
        assert!(decision.keywords.is_empty());
    }

    #[test]
    fn sufficiency_handles_json_embedded_in_prose() {
        let reply = "根据分析：{\"sufficient\": false, \"keywords\": [\"计网\"]} 以上。";
        let decision = parse_sufficiency(reply);
        assert!(!decision.sufficient);
        assert_eq!(decision.keywords, vec!["计网"]);
    }

    #[test]
    fn review_prompt_marks_poster_and_tagged_authors() {
        let reviews = vec![
            Review {
                post_id: 1,
                kind: ReviewKind::Comment,
                text: "给分很好".into(),
                from_poster: true,
                author_tag: Some("Alice".into()),
            },
            Review {
                post_id: 1,
                kind: ReviewKind::Comment,
                text: "作业不少".into(),
                from_poster: false,
                author_tag: Some("Bob".into()),
            },
            Review {
                post_id: 2,
                kind: ReviewKind::Comment,
                text: "期末简单".into(),
                from_poster: false,
                author_tag: None,
            },
        ];
        let prompt = build_review_prompt("计网", "hq", &reviews);
        // The poster mark wins over any alias.
        assert!(prompt.contains("评论 1 [洞主] (帖子#1)"));
        assert!(prompt.contains("评论 2 [Bob] (帖子#1)"));
        assert!(prompt.contains("评论 3  (帖子#2)"));
    }

    #[test]
    fn compare_prompt_groups_by_teacher_and_lists_missing() {
        let groups = vec![
            TeacherReviews {
                teacher: "zhx".into(),
                search_keyword: "计网 zhx 测评".into(),
                posts_found: 3,
                reviews: vec![Review {
                    post_id: 1,
                    kind: ReviewKind::Comment,
                    text: "zhx讲得很清楚".into(),
                    from_poster: false,
                    author_tag: None,
                }],
            },
            TeacherReviews {
                teacher: "yyx".into(),
                search_keyword: "计网 yyx 测评".into(),
                posts_found: 0,
                reviews: vec![],
            },
        ];
        let prompt = build_compare_prompt("计网", &groups);
        assert!(prompt.contains("===== 老师：zhx ====="));
        assert!(prompt.contains("zhx讲得很清楚"));
        assert!(prompt.contains("没有提取到有效测评的老师：yyx"));
        assert!(!prompt.contains("===== 老师：yyx"));
    }
}
