use crate::{Error, Time};

/// One discussion entry. The tree is append-only: a comment is never edited
/// or removed once it is part of it, so positions stay stable.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Comment {
    /// Display name of the author at the time of writing
    pub sender: String,

    pub text: String,

    #[serde(with = "iso_millis")]
    pub timestamp: Time,

    /// Child comments, oldest first. Rows written before threading existed
    /// have this as null or absent, so tolerate both on input.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub replies: Vec<Comment>,
}

impl Comment {
    pub fn new(sender: String, text: String, timestamp: Time) -> Comment {
        Comment {
            sender,
            text,
            timestamp,
            replies: Vec::new(),
        }
    }
}

/// Zero-based child indices walked from the top level down. The empty path
/// names the top level itself rather than any single comment.
#[derive(
    Clone,
    Debug,
    Default,
    Eq,
    Hash,
    PartialEq,
    bolero::generator::TypeGenerator,
    serde::Deserialize,
    serde::Serialize,
)]
#[serde(transparent)]
pub struct CommentPath(pub Vec<usize>);

impl CommentPath {
    pub fn top_level() -> CommentPath {
        CommentPath(Vec::new())
    }

    pub fn is_top_level(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct CommentTree(pub Vec<Comment>);

impl CommentTree {
    pub fn new() -> CommentTree {
        CommentTree(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of comments, replies included.
    pub fn size(&self) -> usize {
        fn count(comments: &[Comment]) -> usize {
            comments.iter().map(|c| 1 + count(&c.replies)).sum()
        }
        count(&self.0)
    }

    /// Look up the comment a path names. A lookup needs at least one index:
    /// the empty path names the top level, which is not a comment.
    pub fn resolve(&self, path: &CommentPath) -> Result<&Comment, Error> {
        let mut siblings = &self.0;
        let mut found = None;
        for &idx in &path.0 {
            let c = siblings
                .get(idx)
                .ok_or_else(|| Error::InvalidCommentPath(path.clone()))?;
            siblings = &c.replies;
            found = Some(c);
        }
        found.ok_or_else(|| Error::InvalidCommentPath(path.clone()))
    }

    /// Append `comment` as the last reply of the comment `path` names, or as
    /// the last top-level comment for the empty path. The whole path is
    /// walked before the single push, so a failed append leaves the tree
    /// exactly as it was.
    pub fn append(&mut self, path: &CommentPath, comment: Comment) -> Result<(), Error> {
        let mut siblings = &mut self.0;
        for &idx in &path.0 {
            siblings = match siblings.get_mut(idx) {
                Some(c) => &mut c.replies,
                None => return Err(Error::InvalidCommentPath(path.clone())),
            };
        }
        siblings.push(comment);
        Ok(())
    }
}

/// Old rows store missing collections as JSON null; read them as empty.
pub(crate) fn null_as_empty<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + serde::Deserialize<'de>,
{
    use serde::Deserialize;
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

/// Timestamps round-trip through the stored JSON as RFC 3339 with exactly
/// three fractional digits, eg. "2023-01-06T12:31:00.106Z".
mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
