//! Candidate-set deduplication and ranking.
//!
//! A [`CandidateSet`] accumulates every post retrieved for one query,
//! keyed by post id. Insertion order is preserved for presentation and
//! the first-seen version of a post is never overwritten, even if the
//! same id reappears later with a larger comment count.
//!
//! [`select`] picks the posts that go into the synthesis context. For
//! auto/manual queries the upstream search order is trusted and the
//! first `max_count` candidates win; course-review queries re-rank with
//! [`CourseReviewRank`].

use std::collections::HashSet;

use crate::models::{Post, QueryMode};

/// Deduplicated, insertion-ordered accumulation of retrieved posts.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    posts: Vec<Post>,
    seen: HashSet<u64>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a batch of posts into the set.
    ///
    /// Existing entries are left untouched; posts whose id is already
    /// present are dropped, the rest are appended in `incoming` order.
    /// Returns the number of posts actually added.
    pub fn merge(&mut self, incoming: Vec<Post>) -> usize {
        let before = self.posts.len();
        for post in incoming {
            if self.seen.insert(post.id) {
                self.posts.push(post);
            }
        }
        self.posts.len() - before
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.seen.contains(&id)
    }

    /// Posts in insertion order.
    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    pub fn into_posts(self) -> Vec<Post> {
        self.posts
    }
}

/// Injectable scoring strategy for course-review selection.
///
/// Higher tuples sort first; ties keep insertion order.
pub trait RankPolicy: Send + Sync {
    fn score(&self, post: &Post) -> (u32, u32);
}

/// Default course-review heuristic: poster-comment count first, then the
/// number of comments mentioning the course token.
pub struct CourseReviewRank {
    pub course: String,
}

impl RankPolicy for CourseReviewRank {
    fn score(&self, post: &Post) -> (u32, u32) {
        let poster_comments = post
            .comments
            .iter()
            .filter(|c| c.author_is_poster)
            .count() as u32;
        let course_mentions = post
            .comments
            .iter()
            .filter(|c| c.text.contains(&self.course))
            .count() as u32;
        (poster_comments, course_mentions)
    }
}

/// Select up to `max_count` posts for the synthesis context.
pub fn select(candidates: &CandidateSet, max_count: usize, mode: &QueryMode) -> Vec<Post> {
    match mode {
        QueryMode::CourseReview { course, .. } => {
            let policy = CourseReviewRank {
                course: course.clone(),
            };
            select_ranked(candidates, max_count, &policy)
        }
        _ => candidates.posts().iter().take(max_count).cloned().collect(),
    }
}

/// Select the top `max_count` posts under an explicit ranking policy.
pub fn select_ranked(
    candidates: &CandidateSet,
    max_count: usize,
    policy: &dyn RankPolicy,
) -> Vec<Post> {
    let mut ranked: Vec<&Post> = candidates.posts().iter().collect();
    // Stable sort: equal scores keep insertion order.
    ranked.sort_by_key(|p| std::cmp::Reverse(policy.score(p)));
    ranked.into_iter().take(max_count).cloned().collect()
}
