//! Core data models for the treehole agent.
//!
//! [`Post`] and [`Comment`] deserialize directly from the forum API wire
//! format (`pid`, `likenum`, `comment_list`, `is_lz`, ...), so the HTTP
//! client and the JSON cache share one representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// How the user wants the retrieval to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryMode {
    /// Single search with a user-supplied keyword.
    Manual { keyword: String },
    /// LLM-directed iterative search.
    Auto,
    /// Aggregate reviews for a course, optionally split by teacher.
    CourseReview {
        course: String,
        teachers: Vec<String>,
    },
}

/// One user request. Immutable once created.
#[derive(Debug, Clone)]
pub struct Query {
    /// The question as the user typed it.
    pub raw_text: String,
    pub mode: QueryMode,
}

impl Query {
    pub fn auto(question: impl Into<String>) -> Self {
        Query {
            raw_text: question.into(),
            mode: QueryMode::Auto,
        }
    }

    pub fn manual(keyword: impl Into<String>, question: impl Into<String>) -> Self {
        Query {
            raw_text: question.into(),
            mode: QueryMode::Manual {
                keyword: keyword.into(),
            },
        }
    }

    pub fn course_review(course: impl Into<String>, teachers: Vec<String>) -> Self {
        let course = course.into();
        Query {
            raw_text: course.clone(),
            mode: QueryMode::CourseReview { course, teachers },
        }
    }
}

/// A comment on a forum post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    /// Back-reference to the owning post. Not present on the wire for
    /// search results; filled in when comments are fetched per post.
    #[serde(default)]
    pub post_id: u64,
    /// Whether the comment was written by the original poster (`is_lz`).
    #[serde(
        rename = "is_lz",
        default,
        deserialize_with = "bool_from_int",
        serialize_with = "int_from_bool"
    )]
    pub author_is_poster: bool,
    #[serde(default)]
    pub text: String,
    /// Anonymous alias assigned by the forum (e.g. `"Alice"`, `"洞主"`).
    #[serde(rename = "name_tag", default)]
    pub author_tag: Option<String>,
}

/// A forum post with its comment preview. Identity is [`Post::id`]; two
/// posts with the same id from different searches are duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    #[serde(rename = "pid")]
    pub id: u64,
    #[serde(default)]
    pub text: String,
    /// Unix seconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "likenum", default)]
    pub like_count: u32,
    #[serde(rename = "reply", default)]
    pub reply_count: u32,
    /// Total comment count reported by the forum; may exceed
    /// `comments.len()` until all pages are fetched.
    #[serde(default)]
    pub comment_total: u32,
    #[serde(rename = "comment_list", alias = "comments", default)]
    pub comments: Vec<Comment>,
}

fn bool_from_int<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(u8::deserialize(d)? != 0)
}

fn int_from_bool<S: Serializer>(v: &bool, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u8(u8::from(*v))
}

/// Audit record for one pass of the retrieval loop. Never mutated after
/// creation; returned to front-ends as search history.
#[derive(Debug, Clone, Serialize)]
pub struct SearchIteration {
    pub index: u32,
    pub keywords: Vec<String>,
    /// The LLM's stated reason for this keyword set, when it gave one.
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Posts returned by this pass before deduplication.
    pub posts_found: usize,
}

/// A single extracted course review: either a relevant post body or a
/// relevant comment.
#[derive(Debug, Clone, Serialize)]
pub struct Review {
    pub post_id: u64,
    pub kind: ReviewKind,
    pub text: String,
    pub from_poster: bool,
    pub author_tag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    Post,
    Comment,
}

/// Reviews extracted for one teacher in a multi-teacher comparison.
#[derive(Debug, Clone)]
pub struct TeacherReviews {
    pub teacher: String,
    pub search_keyword: String,
    pub posts_found: usize,
    pub reviews: Vec<Review>,
}

/// The evidence handed to the final synthesis call.
#[derive(Debug, Clone)]
pub enum ContextKind {
    /// Manual/auto modes: the selected posts in candidate order.
    Posts(Vec<Post>),
    /// Course review for at most one teacher.
    CourseReviews {
        course: String,
        teacher: String,
        reviews: Vec<Review>,
    },
    /// Same course compared across several teachers.
    CourseComparison {
        course: String,
        groups: Vec<TeacherReviews>,
    },
}

/// Bounded, ordered evidence plus retrieval metadata for one query.
#[derive(Debug, Clone)]
pub struct SynthesisContext {
    pub kind: ContextKind,
    pub history: Vec<SearchIteration>,
    /// Distinct posts accumulated across all iterations.
    pub candidate_count: usize,
}

/// A pointer to evidence shown to the user alongside the answer.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub post_id: u64,
    pub preview: String,
}

impl SynthesisContext {
    /// Short previews of the evidence, for "references" footers.
    pub fn sources(&self) -> Vec<SourceRef> {
        fn preview(text: &str) -> String {
            let p: String = text.chars().take(100).collect();
            if text.chars().count() > 100 {
                format!("{}...", p.replace('\n', " "))
            } else {
                p.replace('\n', " ")
            }
        }

        match &self.kind {
            ContextKind::Posts(posts) => posts
                .iter()
                .map(|p| SourceRef {
                    post_id: p.id,
                    preview: preview(&p.text),
                })
                .collect(),
            ContextKind::CourseReviews { reviews, .. } => reviews
                .iter()
                .map(|r| SourceRef {
                    post_id: r.post_id,
                    preview: preview(&r.text),
                })
                .collect(),
            ContextKind::CourseComparison { groups, .. } => groups
                .iter()
                .flat_map(|g| g.reviews.iter().take(5))
                .map(|r| SourceRef {
                    post_id: r.post_id,
                    preview: preview(&r.text),
                })
                .collect(),
        }
    }

    /// Number of evidence items backing the answer.
    pub fn source_count(&self) -> usize {
        match &self.kind {
            ContextKind::Posts(posts) => posts.len(),
            ContextKind::CourseReviews { reviews, .. } => reviews.len(),
            ContextKind::CourseComparison { groups, .. } => {
                groups.iter().map(|g| g.reviews.len()).sum()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_deserializes_wire_format() {
        let json = r#"{
            "pid": 8006047,
            "text": "计网这门课怎么样",
            "type": "text",
            "timestamp": 1770017907,
            "likenum": 3,
            "reply": 2,
            "comment_total": 2,
            "comment_list": [
                {"text": "给分不错", "is_lz": 0, "name_tag": "Alice"},
                {"text": "是hq老师的班", "is_lz": 1}
            ]
        }"#;
        let post: Post = serde_json::from_str(json).unwrap();
        assert_eq!(post.id, 8006047);
        assert_eq!(post.like_count, 3);
        assert_eq!(post.comments.len(), 2);
        assert!(!post.comments[0].author_is_poster);
        assert!(post.comments[1].author_is_poster);
        assert_eq!(post.comments[0].author_tag.as_deref(), Some("Alice"));
    }

    #[test]
    fn post_roundtrips_through_cache_json() {
        let post = Post {
            id: 42,
            text: "hello".into(),
            timestamp: 1700000000,
            like_count: 1,
            reply_count: 1,
            comment_total: 1,
            comments: vec![Comment {
                post_id: 42,
                author_is_poster: true,
                text: "reply".into(),
                author_tag: None,
            }],
        };
        let json = serde_json::to_string(&post).unwrap();
        let back: Post = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 42);
        assert!(back.comments[0].author_is_poster);
    }

    #[test]
    fn sources_truncate_long_previews() {
        let long_text = "学".repeat(150);
        let ctx = SynthesisContext {
            kind: ContextKind::Posts(vec![Post {
                id: 1,
                text: long_text,
                timestamp: 0,
                like_count: 0,
                reply_count: 0,
                comment_total: 0,
                comments: vec![],
            }]),
            history: vec![],
            candidate_count: 1,
        };
        let sources = ctx.sources();
        assert_eq!(sources.len(), 1);
        assert!(sources[0].preview.ends_with("..."));
        assert_eq!(sources[0].preview.chars().count(), 103);
    }
}
