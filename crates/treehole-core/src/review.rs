//! Course-review extraction and filtering.
//!
//! Course-review queries search for `"{course} {teacher} 测评"`, pull every
//! comment of each hit, and keep only the pieces that actually review the
//! course: poster comments, and comments mentioning the course (and the
//! teacher, when one was given).

use std::collections::HashSet;

use crate::models::{Post, Review, ReviewKind};

/// Split a raw teacher string into a deduplicated token list.
///
/// Accepts comma, whitespace, Chinese comma/enumeration comma, slash and
/// semicolon as separators, e.g. `"zhx, yyx"` or `"zhx、yyx"`.
pub fn parse_teacher_input(input: &str) -> Vec<String> {
    let mut teachers = Vec::new();
    let mut seen = HashSet::new();
    for token in input.split(|c: char| {
        c.is_whitespace() || matches!(c, ',' | '，' | '、' | '/' | ';' | '；')
    }) {
        let teacher = token.trim();
        if !teacher.is_empty() && seen.insert(teacher.to_string()) {
            teachers.push(teacher.to_string());
        }
    }
    teachers
}

/// Case-insensitive containment check for mixed Chinese/English text.
/// An empty token always matches.
pub fn contains_token(text: &str, token: &str) -> bool {
    if token.is_empty() {
        return true;
    }
    text.to_lowercase().contains(&token.to_lowercase())
}

/// Build the forum search keyword for a course review.
pub fn build_course_keyword(course: &str, teacher: &str) -> String {
    if teacher.is_empty() {
        format!("{} 测评", course)
    } else {
        format!("{} {} 测评", course, teacher)
    }
}

/// Extract course reviews from posts whose comments have been fully
/// fetched.
///
/// A post body is kept when it mentions the course and (when given) the
/// teacher. A comment is kept when:
/// - no teacher filter was given and it comes from the poster, or
/// - it mentions both the course and the teacher, or
/// - it comes from the poster of a relevant post and mentions either.
///
/// Duplicates (same post, kind, and text) are dropped.
pub fn extract_reviews(posts: &[Post], course: &str, teacher: &str) -> Vec<Review> {
    let mut reviews = Vec::new();
    let mut seen: HashSet<(u64, ReviewKind, String)> = HashSet::new();

    let mut push = |reviews: &mut Vec<Review>, review: Review| {
        let text = review.text.trim();
        if text.is_empty() {
            return;
        }
        if seen.insert((review.post_id, review.kind, text.to_string())) {
            reviews.push(review);
        }
    };

    for post in posts {
        let post_has_course = post.text.contains(course);
        let post_has_teacher = contains_token(&post.text, teacher);
        let post_relevant = post_has_course && post_has_teacher;

        if post_relevant {
            push(
                &mut reviews,
                Review {
                    post_id: post.id,
                    kind: ReviewKind::Post,
                    text: post.text.clone(),
                    from_poster: true,
                    author_tag: None,
                },
            );
        }

        for comment in &post.comments {
            let has_course = comment.text.contains(course);
            let has_teacher = contains_token(&comment.text, teacher);

            let include = (teacher.is_empty() && comment.author_is_poster)
                || (has_course && has_teacher)
                || (comment.author_is_poster && post_relevant && (has_course || has_teacher));

            if include {
                push(
                    &mut reviews,
                    Review {
                        post_id: post.id,
                        kind: ReviewKind::Comment,
                        text: comment.text.clone(),
                        from_poster: comment.author_is_poster,
                        author_tag: comment.author_tag.clone(),
                    },
                );
            }
        }
    }

    reviews
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Comment;

    fn post_with_comments(id: u64, text: &str, comments: Vec<(&str, bool)>) -> Post {
        Post {
            id,
            text: text.to_string(),
            timestamp: 0,
            like_count: 0,
            reply_count: 0,
            comment_total: comments.len() as u32,
            comments: comments
                .into_iter()
                .map(|(t, poster)| Comment {
                    post_id: id,
                    author_is_poster: poster,
                    text: t.to_string(),
                    author_tag: None,
                })
                .collect(),
        }
    }

    #[test]
    fn teacher_input_splits_on_mixed_separators() {
        assert_eq!(
            parse_teacher_input("zhx, yyx、hq/ww；zhx"),
            vec!["zhx", "yyx", "hq", "ww"]
        );
        assert!(parse_teacher_input("  ").is_empty());
        assert!(parse_teacher_input("").is_empty());
    }

    #[test]
    fn token_match_is_case_insensitive_and_empty_matches() {
        assert!(contains_token("HQ老师的计网", "hq"));
        assert!(contains_token("hq老师", "HQ"));
        assert!(!contains_token("别的老师", "hq"));
        assert!(contains_token("任何内容", ""));
    }

    #[test]
    fn course_keyword_includes_teacher_when_given() {
        assert_eq!(build_course_keyword("计网", "hq"), "计网 hq 测评");
        assert_eq!(build_course_keyword("操统", ""), "操统 测评");
    }

    #[test]
    fn relevant_post_body_becomes_a_review() {
        let posts = vec![post_with_comments(1, "计网 hq 测评来啦", vec![])];
        let reviews = extract_reviews(&posts, "计网", "hq");
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].kind, ReviewKind::Post);
        assert!(reviews[0].from_poster);
    }

    #[test]
    fn poster_comments_kept_without_teacher_filter() {
        let posts = vec![post_with_comments(
            1,
            "随便聊聊",
            vec![("洞主自己的补充", true), ("路人评论", false)],
        )];
        let reviews = extract_reviews(&posts, "计网", "");
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].text, "洞主自己的补充");
    }

    #[test]
    fn comment_needs_course_and_teacher_when_filtered() {
        let posts = vec![post_with_comments(
            1,
            "无关帖子",
            vec![
                ("计网hq给分好", false),
                ("计网很难", false),
                ("hq人很好", false),
            ],
        )];
        let reviews = extract_reviews(&posts, "计网", "hq");
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].text, "计网hq给分好");
    }

    #[test]
    fn poster_comment_on_relevant_post_needs_only_one_token() {
        let posts = vec![post_with_comments(
            1,
            "计网 hq 测评",
            vec![("补充：hq期末不难", true), ("完全无关", true)],
        )];
        let reviews = extract_reviews(&posts, "计网", "hq");
        // Post body + the one poster comment mentioning the teacher.
        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[1].text, "补充：hq期末不难");
    }

    #[test]
    fn duplicate_reviews_are_dropped() {
        let posts = vec![post_with_comments(
            1,
            "x",
            vec![("计网hq不错", false), ("计网hq不错", false)],
        )];
        let reviews = extract_reviews(&posts, "计网", "hq");
        assert_eq!(reviews.len(), 1);
    }
}
