use std::collections::HashMap;

use rb_types::{Article, ArticleId, RankError, Timestamp};

pub(crate) const FIELD_TITLE: &str = "title";
pub(crate) const FIELD_LINK: &str = "link";
pub(crate) const FIELD_POSTER: &str = "poster";
pub(crate) const FIELD_TIME: &str = "time";
pub(crate) const FIELD_VOTES: &str = "votes";

/// Hash fields for a freshly posted article. The poster's vote is counted.
pub(crate) fn new_record(
    poster: &str,
    title: &str,
    link: &str,
    created_at: Timestamp,
) -> Vec<(String, String)> {
    vec![
        (FIELD_TITLE.to_string(), title.to_string()),
        (FIELD_LINK.to_string(), link.to_string()),
        (FIELD_POSTER.to_string(), poster.to_string()),
        (FIELD_TIME.to_string(), created_at.to_string()),
        (FIELD_VOTES.to_string(), "1".to_string()),
    ]
}

fn field<'a>(id: ArticleId, fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, RankError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| RankError::Storage(format!("article {id}: missing field '{name}'")))
}

fn malformed(id: ArticleId, name: &str) -> RankError {
    RankError::Storage(format!("article {id}: malformed field '{name}'"))
}

pub(crate) fn parse_votes(id: ArticleId, fields: &HashMap<String, String>) -> Result<u64, RankError> {
    field(id, fields, FIELD_VOTES)?
        .parse()
        .map_err(|_| malformed(id, FIELD_VOTES))
}

/// Hydrate a stored record into an [`Article`].
pub(crate) fn from_record(id: ArticleId, fields: &HashMap<String, String>) -> Result<Article, RankError> {
    Ok(Article {
        id,
        title: field(id, fields, FIELD_TITLE)?.to_string(),
        link: field(id, fields, FIELD_LINK)?.to_string(),
        poster: field(id, fields, FIELD_POSTER)?.to_string(),
        created_at: field(id, fields, FIELD_TIME)?
            .parse()
            .map_err(|_| malformed(id, FIELD_TIME))?,
        votes: parse_votes(id, fields)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_hydrates_back() {
        let fields: HashMap<_, _> = new_record("alice", "A_title", "www.example.com", 1_700_000_000.25)
            .into_iter()
            .collect();
        let article = from_record(3, &fields).unwrap();
        assert_eq!(article.id, 3);
        assert_eq!(article.poster, "alice");
        assert_eq!(article.created_at, 1_700_000_000.25);
        assert_eq!(article.votes, 1);
    }

    #[test]
    fn missing_and_malformed_fields_are_storage_errors() {
        let mut fields: HashMap<_, _> = new_record("a", "t", "l", 1.0).into_iter().collect();
        fields.insert(FIELD_VOTES.into(), "many".into());
        assert!(matches!(from_record(1, &fields), Err(RankError::Storage(_))));

        fields.remove(FIELD_TITLE);
        let err = from_record(1, &fields).unwrap_err();
        assert!(err.to_string().contains("title"));
    }
}
