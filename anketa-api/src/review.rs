use anyhow::Context;
use chrono::Utc;

use crate::{AnswerId, Comment, CommentPath, Error, ReviewDb, ReviewState, StatusFlags};

/// How many times a losing writer re-reads and re-applies before giving up.
pub const MAX_SUBMIT_ATTEMPTS: usize = 3;

/// Body of the review entrypoint. Everything is optional, but a submission
/// must carry at least a status or a comment.
#[derive(
    Clone, Debug, Eq, PartialEq, bolero::generator::TypeGenerator, serde::Deserialize,
    serde::Serialize,
)]
pub struct ReviewSubmit {
    #[serde(default)]
    pub status: Option<StatusFlags>,

    #[serde(default)]
    pub comment: Option<String>,

    /// Where the comment goes; top level when absent. Ignored without a
    /// comment.
    #[serde(default)]
    pub reply_to: Option<CommentPath>,
}

impl ReviewSubmit {
    pub fn validate(&self) -> Result<(), Error> {
        if self.status.is_none() && self.comment.is_none() {
            return Err(Error::EmptyReview);
        }
        if let Some(flags) = self.status {
            ReviewState::try_from(flags)?;
        }
        if let Some(text) = &self.comment {
            crate::validate_string(text)?;
            if text.trim().is_empty() {
                return Err(Error::EmptyComment);
            }
        }
        Ok(())
    }
}

/// Best-effort message for the answer owner after a reviewed transition.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Notification {
    pub to: String,
    pub form_name: String,
    pub status: String,
    pub comment: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReviewOutcome {
    pub status: crate::Status,
    pub notification: Option<Notification>,
}

/// The one mutation entrypoint of the review flow: validate, check
/// permissions, apply the status transition and append the comment at the
/// addressed node, then persist the whole row under a revision check.
/// Losing the revision check means someone else wrote in between; the loop
/// re-reads and re-applies on top of their write, so no comment is ever
/// dropped, and gives up after `MAX_SUBMIT_ATTEMPTS` losses.
///
/// The outer `Result` is for store failures, the inner one for everything
/// the caller did wrong.
pub async fn submit_review<D: ReviewDb>(
    db: &mut D,
    answer: AnswerId,
    sub: ReviewSubmit,
) -> anyhow::Result<Result<ReviewOutcome, Error>> {
    if let Err(err) = sub.validate() {
        return Ok(Err(err));
    }

    let meta = match db
        .answer_meta(answer)
        .await
        .with_context(|| format!("fetching metadata of answer {:?}", answer))?
    {
        Some(meta) => meta,
        None => return Ok(Err(Error::NotFound(String::from("answer")))),
    };
    let auth = db
        .auth_info_for(answer)
        .await
        .with_context(|| format!("fetching auth info for answer {:?}", answer))?;
    if sub.status.is_some() && !auth.can_review {
        return Ok(Err(Error::PermissionDenied));
    }
    if sub.comment.is_some() && !auth.can_comment {
        return Ok(Err(Error::PermissionDenied));
    }

    let new_state = match sub.status.map(ReviewState::try_from).transpose() {
        Ok(state) => state,
        Err(err) => return Ok(Err(err)),
    };
    // Sender and timestamp are fixed here, before the write loop: a retry
    // re-applies the identical comment, it does not write a fresher one.
    let comment = match &sub.comment {
        None => None,
        Some(text) => {
            let sender = db
                .display_name(db.current_user())
                .await
                .context("looking up caller display name")?;
            Some(Comment::new(sender, text.clone(), Utc::now()))
        }
    };
    let path = sub.reply_to.clone().unwrap_or_else(CommentPath::top_level);

    for _ in 0..MAX_SUBMIT_ATTEMPTS {
        let (mut status, revision) = match db
            .load_status(answer)
            .await
            .with_context(|| format!("loading status of answer {:?}", answer))?
        {
            Some(found) => found,
            None => return Ok(Err(Error::NotFound(String::from("status")))),
        };
        if let Some(state) = new_state {
            status.state = state;
        }
        if let Some(comment) = &comment {
            if let Err(err) = status.comments.append(&path, comment.clone()) {
                return Ok(Err(err));
            }
        }
        let stored = db
            .store_status(answer, revision, &status)
            .await
            .with_context(|| format!("storing status of answer {:?}", answer))?;
        if stored {
            let notification = match (new_state, &comment) {
                (Some(state), Some(comment)) => Some(Notification {
                    to: meta.owner_email.clone(),
                    form_name: meta.form_name.clone(),
                    status: String::from(state.label()),
                    comment: comment.text.clone(),
                }),
                _ => None,
            };
            return Ok(Ok(ReviewOutcome {
                status,
                notification,
            }));
        }
        tracing::debug!(?answer, "lost status write race, retrying");
    }
    Ok(Err(Error::ConcurrentModification(answer)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AnswerMeta, AuthInfo, FormId, Revision, Status, UserId};
    use async_trait::async_trait;
    use futures::executor::block_on;

    const ANSWER: AnswerId = AnswerId(crate::uuid!("00000000-0000-0000-0000-00000000a001"));
    const OWNER: UserId = UserId(crate::uuid!("00000000-0000-0000-0000-0000000000aa"));
    const REVIEWER: UserId = UserId(crate::uuid!("00000000-0000-0000-0000-0000000000bb"));

    struct TestDb {
        user: UserId,
        auth: AuthInfo,
        status: Option<(Status, Revision)>,
        /// Failed compare-and-swaps left to inject; each one simulates an
        /// interleaved writer appending a top-level comment.
        conflicts_left: usize,
        loads: usize,
        stores: usize,
    }

    impl TestDb {
        fn for_user(user: UserId, auth: AuthInfo) -> TestDb {
            TestDb {
                user,
                auth,
                status: Some((Status::waiting(), 0)),
                conflicts_left: 0,
                loads: 0,
                stores: 0,
            }
        }

        fn reviewer() -> TestDb {
            Self::for_user(REVIEWER, AuthInfo::for_roles(false, true))
        }

        fn owner() -> TestDb {
            Self::for_user(OWNER, AuthInfo::for_roles(true, false))
        }

        fn tree_texts(&self) -> Vec<String> {
            let (status, _) = self.status.as_ref().unwrap();
            status.comments.0.iter().map(|c| c.text.clone()).collect()
        }
    }

    #[async_trait]
    impl ReviewDb for TestDb {
        fn current_user(&self) -> UserId {
            self.user
        }

        async fn auth_info_for(&mut self, _answer: AnswerId) -> anyhow::Result<AuthInfo> {
            Ok(if self.status.is_some() {
                self.auth
            } else {
                AuthInfo::none()
            })
        }

        async fn answer_meta(&mut self, _answer: AnswerId) -> anyhow::Result<Option<AnswerMeta>> {
            Ok(self.status.as_ref().map(|_| AnswerMeta {
                form_id: FormId::stub(),
                form_name: String::from("course feedback"),
                owner_id: OWNER,
                owner_email: String::from("ivan@example.com"),
            }))
        }

        async fn display_name(&mut self, user: UserId) -> anyhow::Result<String> {
            Ok(String::from(if user == OWNER {
                "Ivan Petrov"
            } else {
                "Anna Orlova"
            }))
        }

        async fn load_status(
            &mut self,
            _answer: AnswerId,
        ) -> anyhow::Result<Option<(Status, Revision)>> {
            self.loads += 1;
            Ok(self.status.clone())
        }

        async fn store_status(
            &mut self,
            _answer: AnswerId,
            expect: Revision,
            status: &Status,
        ) -> anyhow::Result<bool> {
            self.stores += 1;
            let (row, revision) = self.status.as_mut().unwrap();
            assert_eq!(expect, *revision, "store must use the loaded revision");
            if self.conflicts_left > 0 {
                self.conflicts_left -= 1;
                row.comments
                    .append(
                        &CommentPath::top_level(),
                        Comment::new(
                            String::from("Someone Else"),
                            format!("interleaved {}", self.conflicts_left),
                            Utc::now(),
                        ),
                    )
                    .unwrap();
                *revision += 1;
                return Ok(false);
            }
            *row = status.clone();
            *revision += 1;
            Ok(true)
        }
    }

    fn approve() -> Option<StatusFlags> {
        Some(ReviewState::Approved.flags())
    }

    fn submit(db: &mut TestDb, sub: ReviewSubmit) -> Result<ReviewOutcome, Error> {
        block_on(submit_review(db, ANSWER, sub)).unwrap()
    }

    #[test]
    fn approve_with_comment_stores_both_and_notifies() {
        let mut db = TestDb::reviewer();
        let outcome = submit(
            &mut db,
            ReviewSubmit {
                status: approve(),
                comment: Some(String::from("well done")),
                reply_to: None,
            },
        )
        .unwrap();

        assert_eq!(outcome.status.state, ReviewState::Approved);
        assert_eq!(outcome.status.comments.size(), 1);
        assert_eq!(outcome.status.comments.0[0].sender, "Anna Orlova");

        let n = outcome.notification.unwrap();
        assert_eq!(n.to, "ivan@example.com");
        assert_eq!(n.form_name, "course feedback");
        assert_eq!(n.status, "approved");
        assert_eq!(n.comment, "well done");

        let (stored, revision) = db.status.clone().unwrap();
        assert_eq!(stored, outcome.status);
        assert_eq!(revision, 1);
    }

    #[test]
    fn comment_only_does_not_notify() {
        let mut db = TestDb::owner();
        let outcome = submit(
            &mut db,
            ReviewSubmit {
                status: None,
                comment: Some(String::from("fixed section 2")),
                reply_to: None,
            },
        )
        .unwrap();
        assert_eq!(outcome.status.state, ReviewState::Waiting);
        assert_eq!(outcome.notification, None);
        assert_eq!(outcome.status.comments.0[0].sender, "Ivan Petrov");
    }

    #[test]
    fn status_only_does_not_notify() {
        let mut db = TestDb::reviewer();
        let outcome = submit(
            &mut db,
            ReviewSubmit {
                status: approve(),
                comment: None,
                reply_to: None,
            },
        )
        .unwrap();
        assert_eq!(outcome.status.state, ReviewState::Approved);
        assert_eq!(outcome.notification, None);
        assert!(outcome.status.comments.is_empty());
    }

    #[test]
    fn owner_cannot_change_status() {
        let mut db = TestDb::owner();
        let res = submit(
            &mut db,
            ReviewSubmit {
                status: approve(),
                comment: None,
                reply_to: None,
            },
        );
        assert_eq!(res, Err(Error::PermissionDenied));
        assert_eq!(db.stores, 0);
    }

    #[test]
    fn stranger_cannot_comment() {
        let mut db = TestDb::for_user(REVIEWER, AuthInfo::none());
        let res = submit(
            &mut db,
            ReviewSubmit {
                status: None,
                comment: Some(String::from("hello")),
                reply_to: None,
            },
        );
        assert_eq!(res, Err(Error::PermissionDenied));
        assert_eq!(db.stores, 0);
    }

    #[test]
    fn missing_answer_is_not_found() {
        let mut db = TestDb::reviewer();
        db.status = None;
        let res = submit(
            &mut db,
            ReviewSubmit {
                status: approve(),
                comment: None,
                reply_to: None,
            },
        );
        assert_eq!(res, Err(Error::NotFound(String::from("answer"))));
    }

    #[test]
    fn empty_submission_is_rejected() {
        let mut db = TestDb::reviewer();
        let res = submit(
            &mut db,
            ReviewSubmit {
                status: None,
                comment: None,
                reply_to: Some(CommentPath(vec![0])),
            },
        );
        assert_eq!(res, Err(Error::EmptyReview));
        assert_eq!(db.loads, 0);
    }

    #[test]
    fn blank_comment_is_rejected() {
        let mut db = TestDb::reviewer();
        let res = submit(
            &mut db,
            ReviewSubmit {
                status: None,
                comment: Some(String::from("   \n")),
                reply_to: None,
            },
        );
        assert_eq!(res, Err(Error::EmptyComment));
    }

    #[test]
    fn double_flags_are_rejected() {
        let mut db = TestDb::reviewer();
        let flags = StatusFlags {
            approved: true,
            waiting: false,
            edits_required: true,
        };
        let res = submit(
            &mut db,
            ReviewSubmit {
                status: Some(flags),
                comment: None,
                reply_to: None,
            },
        );
        assert_eq!(res, Err(Error::InvalidStatusFlags(flags)));
    }

    #[test]
    fn bad_reply_path_stores_nothing() {
        let mut db = TestDb::reviewer();
        let path = CommentPath(vec![4]);
        let res = submit(
            &mut db,
            ReviewSubmit {
                status: None,
                comment: Some(String::from("into the void")),
                reply_to: Some(path.clone()),
            },
        );
        assert_eq!(res, Err(Error::InvalidCommentPath(path)));
        assert_eq!(db.stores, 0);
        assert_eq!(db.status.unwrap().1, 0);
    }

    #[test]
    fn lost_write_is_reapplied_on_top_of_the_winner() {
        let mut db = TestDb::reviewer();
        db.conflicts_left = 2;
        let outcome = submit(
            &mut db,
            ReviewSubmit {
                status: approve(),
                comment: Some(String::from("mine")),
                reply_to: None,
            },
        )
        .unwrap();

        assert_eq!(db.stores, 3);
        assert_eq!(db.loads, 3);
        assert_eq!(
            db.tree_texts(),
            vec!["interleaved 1", "interleaved 0", "mine"],
        );
        assert_eq!(outcome.status.state, ReviewState::Approved);
        // One notification for the one submission, retries or not.
        assert!(outcome.notification.is_some());
    }

    #[test]
    fn gives_up_after_bounded_attempts() {
        let mut db = TestDb::reviewer();
        db.conflicts_left = MAX_SUBMIT_ATTEMPTS;
        let res = submit(
            &mut db,
            ReviewSubmit {
                status: None,
                comment: Some(String::from("mine")),
                reply_to: None,
            },
        );
        assert_eq!(res, Err(Error::ConcurrentModification(ANSWER)));
        assert_eq!(db.stores, MAX_SUBMIT_ATTEMPTS);
        // The interleaved writes survive, ours was never applied.
        assert_eq!(db.tree_texts().len(), MAX_SUBMIT_ATTEMPTS);
    }

    #[test]
    fn validation_is_total_and_order_stable() {
        bolero::check!()
            .with_type::<ReviewSubmit>()
            .cloned()
            .for_each(|sub| {
                let res = sub.validate();
                if sub.status.is_none() && sub.comment.is_none() {
                    assert_eq!(res, Err(Error::EmptyReview));
                }
                if let (Ok(()), Some(flags)) = (&res, sub.status) {
                    assert!(ReviewState::try_from(flags).is_ok());
                }
                if let (Ok(()), Some(text)) = (&res, &sub.comment) {
                    assert!(!text.trim().is_empty());
                    assert!(!text.contains('\0'));
                }
            });
    }
}
