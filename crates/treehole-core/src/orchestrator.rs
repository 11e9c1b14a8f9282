//! The retrieval loop and answer synthesis.
//!
//! [`Orchestrator`] drives the three query modes over two injected
//! collaborators: a [`ForumSearcher`] for the treehole API and a
//! [`ChatModel`] for the LLM. Retrieval is bounded by [`SearchLimits`]
//! and always terminates; per-keyword forum failures are logged and
//! absorbed so one flaky search never kills the query.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::candidates::{select, CandidateSet};
use crate::error::AgentError;
use crate::models::{
    Comment, ContextKind, Post, Query, QueryMode, SearchIteration, SynthesisContext,
    TeacherReviews,
};
use crate::prompt;
use crate::review::{build_course_keyword, extract_reviews};

/// Forum access as the orchestrator sees it. Implementations handle
/// transport, retries, and caching.
#[async_trait]
pub trait ForumSearcher: Send + Sync {
    /// Search posts by keyword, newest first, up to `limit` results.
    async fn search(&self, keyword: &str, limit: u32) -> Result<Vec<Post>, AgentError>;

    /// Fetch one page of comments for a post, oldest first.
    async fn fetch_comments(
        &self,
        post_id: u64,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Comment>, AgentError>;
}

/// LLM access for keyword proposal, sufficiency checks, and synthesis.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system: Option<&str>, user: &str) -> Result<String, AgentError>;

    /// Streaming completion; chunks arrive in model order.
    async fn complete_stream(
        &self,
        system: Option<&str>,
        user: &str,
    ) -> Result<BoxStream<'static, Result<String, AgentError>>, AgentError>;
}

/// Hard bounds on one query's retrieval work.
#[derive(Debug, Clone)]
pub struct SearchLimits {
    /// Posts requested per keyword search.
    pub max_search_results: u32,
    /// Posts selected into the synthesis context.
    pub max_context_posts: usize,
    /// Comments rendered per post in the context.
    pub max_comments_per_post: usize,
    /// Retrieval passes in auto mode.
    pub max_iterations: u32,
    /// Estimated-token ceiling for the rendered context.
    pub context_token_budget: usize,
}

impl Default for SearchLimits {
    fn default() -> Self {
        SearchLimits {
            max_search_results: 40,
            max_context_posts: 30,
            max_comments_per_post: 5,
            max_iterations: 3,
            context_token_budget: 10_000,
        }
    }
}

/// Page size when pulling a post's full comment thread.
const COMMENT_PAGE_SIZE: u32 = 100;

/// A streaming answer plus the evidence it was built from.
pub struct Answer {
    pub context: SynthesisContext,
    pub stream: BoxStream<'static, Result<String, AgentError>>,
}

impl Answer {
    /// Drain the stream into one string, for non-streaming surfaces.
    pub async fn collect(self) -> Result<(SynthesisContext, String), AgentError> {
        let mut text = String::new();
        let mut stream = self.stream;
        while let Some(chunk) = stream.next().await {
            text.push_str(&chunk?);
        }
        Ok((self.context, text))
    }
}

/// Runs queries end to end: retrieval, selection, synthesis.
pub struct Orchestrator {
    forum: Arc<dyn ForumSearcher>,
    chat: Arc<dyn ChatModel>,
    limits: SearchLimits,
}

impl Orchestrator {
    pub fn new(forum: Arc<dyn ForumSearcher>, chat: Arc<dyn ChatModel>, limits: SearchLimits) -> Self {
        Orchestrator {
            forum,
            chat,
            limits,
        }
    }

    pub fn limits(&self) -> &SearchLimits {
        &self.limits
    }

    /// Run retrieval for a query and return the bounded evidence.
    ///
    /// Fails with [`AgentError::SearchExhausted`] when every pass
    /// completed and nothing was found.
    pub async fn run(&self, query: &Query) -> Result<SynthesisContext, AgentError> {
        match &query.mode {
            QueryMode::Manual { keyword } => self.run_manual(query, keyword).await,
            QueryMode::Auto => self.run_auto(query).await,
            QueryMode::CourseReview { course, teachers } => {
                self.run_course_review(course, teachers).await
            }
        }
    }

    /// Run retrieval and stream the synthesized answer.
    pub async fn answer(&self, query: &Query) -> Result<Answer, AgentError> {
        let context = self.run(query).await?;
        let stream = self.synthesize(query, &context).await?;
        Ok(Answer { context, stream })
    }

    async fn run_manual(
        &self,
        query: &Query,
        keyword: &str,
    ) -> Result<SynthesisContext, AgentError> {
        let started_at = chrono::Utc::now();
        let posts = match self
            .forum
            .search(keyword, self.limits.max_search_results)
            .await
        {
            Ok(posts) => posts,
            Err(err) => {
                tracing::warn!(keyword = %keyword, error = %err, "keyword search failed");
                Vec::new()
            }
        };
        let found = posts.len();

        let mut candidates = CandidateSet::new();
        candidates.merge(posts);

        let history = vec![SearchIteration {
            index: 1,
            keywords: vec![keyword.to_string()],
            reason: None,
            started_at,
            posts_found: found,
        }];

        if candidates.is_empty() {
            return Err(AgentError::SearchExhausted);
        }

        let selected = select(&candidates, self.limits.max_context_posts, &query.mode);
        Ok(SynthesisContext {
            kind: ContextKind::Posts(selected),
            history,
            candidate_count: candidates.len(),
        })
    }

    async fn run_auto(&self, query: &Query) -> Result<SynthesisContext, AgentError> {
        let mut candidates = CandidateSet::new();
        let mut history = Vec::new();
        let mut tried: HashSet<String> = HashSet::new();

        let mut keywords = self.propose_keywords(&query.raw_text).await;
        let mut reason = Some("initial keywords proposed from the question".to_string());

        for iteration in 0..self.limits.max_iterations {
            keywords.retain(|k| !tried.contains(k));
            if keywords.is_empty() {
                break;
            }
            for keyword in &keywords {
                tried.insert(keyword.clone());
            }

            let started_at = chrono::Utc::now();
            let found = self.fetch_keywords(&keywords, &mut candidates).await;
            history.push(SearchIteration {
                index: iteration + 1,
                keywords: keywords.clone(),
                reason: reason.take(),
                started_at,
                posts_found: found,
            });

            // Last pass answers with whatever was found.
            if iteration + 1 == self.limits.max_iterations {
                break;
            }

            let tried_list: Vec<String> = history
                .iter()
                .flat_map(|it| it.keywords.iter().cloned())
                .collect();
            let digest = prompt::build_candidate_digest(candidates.posts(), 12);
            let check =
                prompt::build_sufficiency_prompt(&query.raw_text, &tried_list, &digest);
            let decision = match self.chat.complete(None, &check).await {
                Ok(reply) => prompt::parse_sufficiency(&reply),
                Err(err) => {
                    tracing::warn!(error = %err, "sufficiency check failed, stopping retrieval");
                    break;
                }
            };
            if decision.sufficient || decision.keywords.is_empty() {
                break;
            }
            keywords = decision.keywords;
            reason = Some("previous evidence judged insufficient".to_string());
        }

        if candidates.is_empty() {
            return Err(AgentError::SearchExhausted);
        }

        let selected = select(&candidates, self.limits.max_context_posts, &query.mode);
        Ok(SynthesisContext {
            kind: ContextKind::Posts(selected),
            history,
            candidate_count: candidates.len(),
        })
    }

    async fn run_course_review(
        &self,
        course: &str,
        teachers: &[String],
    ) -> Result<SynthesisContext, AgentError> {
        let teacher_list: Vec<String> = if teachers.is_empty() {
            vec![String::new()]
        } else {
            teachers.to_vec()
        };

        let mode = QueryMode::CourseReview {
            course: course.to_string(),
            teachers: teachers.to_vec(),
        };

        // Posts shared between teachers keep their fetched comments.
        let mut comment_cache: HashMap<u64, Vec<Comment>> = HashMap::new();
        let mut history = Vec::new();
        let mut groups = Vec::new();
        let mut total_candidates = 0usize;

        for (i, teacher) in teacher_list.iter().enumerate() {
            let keyword = build_course_keyword(course, teacher);
            let started_at = chrono::Utc::now();
            let posts = match self
                .forum
                .search(&keyword, self.limits.max_search_results)
                .await
            {
                Ok(posts) => posts,
                Err(err) => {
                    tracing::warn!(keyword = %keyword, error = %err, "course search failed");
                    Vec::new()
                }
            };
            let found = posts.len();
            history.push(SearchIteration {
                index: (i + 1) as u32,
                keywords: vec![keyword.clone()],
                reason: None,
                started_at,
                posts_found: found,
            });

            let mut candidates = CandidateSet::new();
            candidates.merge(posts);
            total_candidates += candidates.len();

            let mut selected = select(&candidates, self.limits.max_context_posts, &mode);
            for post in &mut selected {
                if post.comment_total as usize > post.comments.len() {
                    let comments = match comment_cache.get(&post.id) {
                        Some(cached) => cached.clone(),
                        None => {
                            let fetched = self.fetch_all_comments(post).await;
                            comment_cache.insert(post.id, fetched.clone());
                            fetched
                        }
                    };
                    if !comments.is_empty() {
                        post.comments = comments;
                    }
                }
            }

            let reviews = extract_reviews(&selected, course, teacher);
            groups.push(TeacherReviews {
                teacher: teacher.clone(),
                search_keyword: keyword,
                posts_found: found,
                reviews,
            });
        }

        if total_candidates == 0 {
            return Err(AgentError::SearchExhausted);
        }

        let kind = if groups.len() == 1 {
            let group = groups.remove(0);
            ContextKind::CourseReviews {
                course: course.to_string(),
                teacher: group.teacher,
                reviews: group.reviews,
            }
        } else {
            ContextKind::CourseComparison {
                course: course.to_string(),
                groups,
            }
        };

        Ok(SynthesisContext {
            kind,
            history,
            candidate_count: total_candidates,
        })
    }

    /// Search all keywords concurrently and merge results in submission
    /// order. Failed keywords are logged and skipped. Returns the post
    /// count before deduplication.
    async fn fetch_keywords(&self, keywords: &[String], candidates: &mut CandidateSet) -> usize {
        let fetches = keywords
            .iter()
            .map(|k| self.forum.search(k, self.limits.max_search_results));
        let results = join_all(fetches).await;

        let mut found = 0usize;
        for (keyword, result) in keywords.iter().zip(results) {
            match result {
                Ok(posts) => {
                    found += posts.len();
                    candidates.merge(posts);
                }
                Err(err) => {
                    tracing::warn!(keyword = %keyword, error = %err, "keyword search failed");
                }
            }
        }
        found
    }

    /// Pull a post's full comment thread, page by page. Partial results
    /// are kept when a page fails.
    async fn fetch_all_comments(&self, post: &Post) -> Vec<Comment> {
        let mut comments = Vec::new();
        let mut page = 1u32;
        loop {
            let batch = match self
                .forum
                .fetch_comments(post.id, page, COMMENT_PAGE_SIZE)
                .await
            {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::warn!(post_id = post.id, page, error = %err, "comment fetch failed");
                    break;
                }
            };
            let short_page = (batch.len() as u32) < COMMENT_PAGE_SIZE;
            for mut comment in batch {
                comment.post_id = post.id;
                comments.push(comment);
            }
            if short_page || comments.len() as u32 >= post.comment_total {
                break;
            }
            page += 1;
        }
        comments
    }

    async fn propose_keywords(&self, question: &str) -> Vec<String> {
        let request = prompt::build_keyword_proposal_prompt(question);
        match self.chat.complete(None, &request).await {
            Ok(reply) => {
                let keywords = prompt::parse_keyword_list(&reply);
                if keywords.is_empty() {
                    vec![question.to_string()]
                } else {
                    keywords
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "keyword proposal failed, searching the raw question");
                vec![question.to_string()]
            }
        }
    }

    async fn synthesize(
        &self,
        query: &Query,
        context: &SynthesisContext,
    ) -> Result<BoxStream<'static, Result<String, AgentError>>, AgentError> {
        match &context.kind {
            ContextKind::Posts(posts) => {
                let (text, _) = prompt::format_posts_within_budget(
                    posts,
                    self.limits.max_comments_per_post,
                    self.limits.context_token_budget,
                    None,
                );
                let user = prompt::build_answer_prompt(&text, &query.raw_text);
                self.chat
                    .complete_stream(Some(prompt::ANSWER_SYSTEM_PROMPT), &user)
                    .await
            }
            ContextKind::CourseReviews {
                course,
                teacher,
                reviews,
            } => {
                if reviews.is_empty() {
                    return Ok(canned_no_reviews(course, context.candidate_count));
                }
                let display = if teacher.is_empty() {
                    "不限老师".to_string()
                } else {
                    teacher.clone()
                };
                let system = prompt::build_review_system_prompt(course, &display);
                let user = prompt::build_review_prompt(course, &display, reviews);
                self.chat.complete_stream(Some(&system), &user).await
            }
            ContextKind::CourseComparison { course, groups } => {
                if groups.iter().all(|g| g.reviews.is_empty()) {
                    return Ok(canned_no_reviews(course, context.candidate_count));
                }
                let system = prompt::build_compare_system_prompt(course);
                let user = prompt::build_compare_prompt(course, groups);
                self.chat.complete_stream(Some(&system), &user).await
            }
        }
    }
}

/// Single-chunk stream for course queries that found posts but no usable
/// reviews.
fn canned_no_reviews(
    course: &str,
    candidate_count: usize,
) -> BoxStream<'static, Result<String, AgentError>> {
    let message = format!(
        "找到了 {} 个帖子，但没有发现包含「{}」的详细测评内容。可以尝试更换课程名称的写法，或在关键词中加入老师姓名。",
        candidate_count, course
    );
    futures::stream::once(async move { Ok(message) }).boxed()
}
