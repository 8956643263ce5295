use crate::{comment::null_as_empty, CommentTree, Error};

/// Review lifecycle of one answer. Storage and the wire keep the historical
/// three-flag encoding; everything in between uses this closed set, so an
/// impossible flag combination cannot even be represented.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum ReviewState {
    Waiting,
    Approved,
    EditsRequired,
    Rejected,
}

impl ReviewState {
    pub fn label(self) -> &'static str {
        match self {
            ReviewState::Waiting => "waiting",
            ReviewState::Approved => "approved",
            ReviewState::EditsRequired => "edits-required",
            ReviewState::Rejected => "rejected",
        }
    }

    pub fn flags(self) -> StatusFlags {
        let (approved, waiting, edits_required) = match self {
            ReviewState::Waiting => (false, true, false),
            ReviewState::Approved => (true, false, false),
            ReviewState::EditsRequired => (false, false, true),
            ReviewState::Rejected => (false, false, false),
        };
        StatusFlags {
            approved,
            waiting,
            edits_required,
        }
    }
}

impl std::fmt::Display for ReviewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// The boolean triple as the original data model spells it: at most one flag
/// set, all three unset meaning rejected.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
    bolero::generator::TypeGenerator,
    serde::Deserialize,
    serde::Serialize,
)]
pub struct StatusFlags {
    pub approved: bool,
    pub waiting: bool,
    pub edits_required: bool,
}

impl TryFrom<StatusFlags> for ReviewState {
    type Error = Error;

    fn try_from(flags: StatusFlags) -> Result<ReviewState, Error> {
        match (flags.approved, flags.waiting, flags.edits_required) {
            (true, false, false) => Ok(ReviewState::Approved),
            (false, true, false) => Ok(ReviewState::Waiting),
            (false, false, true) => Ok(ReviewState::EditsRequired),
            (false, false, false) => Ok(ReviewState::Rejected),
            _ => Err(Error::InvalidStatusFlags(flags)),
        }
    }
}

impl From<ReviewState> for StatusFlags {
    fn from(state: ReviewState) -> StatusFlags {
        state.flags()
    }
}

/// Review state plus discussion, attached 1:1 to an answer.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(try_from = "RawStatus", into = "RawStatus")]
pub struct Status {
    pub state: ReviewState,
    pub comments: CommentTree,
}

impl Status {
    /// State every answer starts in, and returns to when its owner edits it.
    pub fn waiting() -> Status {
        Status {
            state: ReviewState::Waiting,
            comments: CommentTree::new(),
        }
    }
}

/// Wire and storage encoding of `Status`.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct RawStatus {
    #[serde(flatten)]
    pub flags: StatusFlags,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub comments: CommentTree,
}

impl TryFrom<RawStatus> for Status {
    type Error = Error;

    fn try_from(raw: RawStatus) -> Result<Status, Error> {
        Ok(Status {
            state: raw.flags.try_into()?,
            comments: raw.comments,
        })
    }
}

impl From<Status> for RawStatus {
    fn from(status: Status) -> RawStatus {
        RawStatus {
            flags: status.state.flags(),
            comments: status.comments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_state_round_trips_through_flags() {
        for state in [
            ReviewState::Waiting,
            ReviewState::Approved,
            ReviewState::EditsRequired,
            ReviewState::Rejected,
        ] {
            assert_eq!(ReviewState::try_from(state.flags()), Ok(state));
        }
    }

    #[test]
    fn flag_decoding_is_total() {
        bolero::check!()
            .with_type::<StatusFlags>()
            .cloned()
            .for_each(|flags| {
                let set = [flags.approved, flags.waiting, flags.edits_required]
                    .iter()
                    .filter(|b| **b)
                    .count();
                match ReviewState::try_from(flags) {
                    Ok(state) => {
                        assert!(set <= 1);
                        assert_eq!(state.flags(), flags);
                    }
                    Err(Error::InvalidStatusFlags(f)) => {
                        assert!(set >= 2);
                        assert_eq!(f, flags);
                    }
                    Err(e) => panic!("unexpected error decoding flags: {e}"),
                }
            });
    }

    #[test]
    fn status_deserializes_from_stored_shape() {
        let status: Status = serde_json::from_str(
            r#"{"approved": false, "waiting": true, "edits_required": false, "comments": null}"#,
        )
        .unwrap();
        assert_eq!(status.state, ReviewState::Waiting);
        assert!(status.comments.is_empty());

        let status: Status = serde_json::from_str(
            r#"{"approved": false, "waiting": false, "edits_required": false}"#,
        )
        .unwrap();
        assert_eq!(status.state, ReviewState::Rejected);
    }

    #[test]
    fn status_rejects_double_flags_on_deserialize() {
        let res = serde_json::from_str::<Status>(
            r#"{"approved": true, "waiting": true, "edits_required": false, "comments": []}"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn status_serializes_to_flag_triple() {
        let out = serde_json::to_value(Status {
            state: ReviewState::EditsRequired,
            comments: CommentTree::new(),
        })
        .unwrap();
        assert_eq!(
            out,
            serde_json::json!({
                "approved": false,
                "waiting": false,
                "edits_required": true,
                "comments": [],
            }),
        );
    }
}
