use std::collections::HashMap;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(RelationshipType, "relationship_vocabulary", {
    description: String,
    is_active: bool,
    merged_into: Option<String>
});

/// Resolution follows `merged_into` links at most this many hops; anything
/// deeper is treated as a broken chain.
const MAX_MERGE_DEPTH: usize = 10;

impl RelationshipType {
    pub fn new(name: &str, description: String) -> Self {
        let now = Utc::now();
        Self {
            id: name.to_owned(),
            created_at: now,
            updated_at: now,
            description,
            is_active: true,
            merged_into: None,
        }
    }

    pub async fn load_all(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        Ok(db.get_all_stored_items().await?)
    }

    /// The vocabulary as a lookup table, for per-chunk caching.
    pub async fn load_map(db: &SurrealDbClient) -> Result<HashMap<String, Self>, AppError> {
        Ok(Self::load_all(db)
            .await?
            .into_iter()
            .map(|entry| (entry.id.clone(), entry))
            .collect())
    }

    pub fn active_names(map: &HashMap<String, Self>) -> Vec<String> {
        let mut names: Vec<String> = map
            .values()
            .filter(|entry| entry.is_active)
            .map(|entry| entry.id.clone())
            .collect();
        names.sort();
        names
    }

    /// Resolve a proposed rel_type to an active vocabulary entry, following
    /// `merged_into` chains. Returns `None` when the name is unknown, the
    /// chain dead-ends in an inactive entry, or the chain is degenerate.
    pub fn resolve_active(map: &HashMap<String, Self>, name: &str) -> Option<String> {
        let mut current = name;
        for _ in 0..MAX_MERGE_DEPTH {
            let entry = map.get(current)?;
            if entry.is_active {
                return Some(entry.id.clone());
            }
            current = entry.merged_into.as_deref()?;
        }
        None
    }

    /// Append a new active type (vocabulary expansion).
    pub async fn add_active(
        name: &str,
        description: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPSERT type::thing($table, $name) SET
                     description = $description,
                     is_active = true,
                     merged_into = NONE,
                     created_at = IF created_at != NONE THEN created_at ELSE time::now() END,
                     updated_at = time::now()",
            )
            .bind(("table", Self::table_name()))
            .bind(("name", name.to_owned()))
            .bind(("description", description.to_owned()))
            .await?
            .check()?;
        Ok(())
    }

    /// Admin consolidation: deactivate `from` and point it at `into`. Edges
    /// written against `from` keep resolving through the chain; nothing is
    /// rewritten eagerly.
    pub async fn merge(from: &str, into: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        let target: Option<Self> = db.get_item(into).await?;
        match target {
            Some(entry) if entry.is_active => {}
            Some(_) => {
                return Err(AppError::Validation(format!(
                    "merge target {into} is not active"
                )))
            }
            None => return Err(AppError::NotFound(format!("vocabulary type {into} not found"))),
        }

        db.client
            .query(
                "UPDATE type::thing($table, $from) SET
                     is_active = false,
                     merged_into = $into,
                     updated_at = time::now()",
            )
            .bind(("table", Self::table_name()))
            .bind(("from", from.to_owned()))
            .bind(("into", into.to_owned()))
            .await?
            .check()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn setup_test_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        db.apply_migrations().await.expect("migrations");
        db
    }

    #[tokio::test]
    async fn seeded_vocabulary_resolves() {
        let db = setup_test_db().await;
        let map = RelationshipType::load_map(&db).await.expect("load");

        assert_eq!(
            RelationshipType::resolve_active(&map, "IMPLIES"),
            Some("IMPLIES".to_string())
        );
        assert_eq!(RelationshipType::resolve_active(&map, "NONSENSE"), None);
        assert!(RelationshipType::active_names(&map).contains(&"SUPPORTS".to_string()));
    }

    #[tokio::test]
    async fn add_active_expands_vocabulary() {
        let db = setup_test_db().await;

        RelationshipType::add_active("DERIVES_FROM", "Derivation relation", &db)
            .await
            .expect("add");

        let map = RelationshipType::load_map(&db).await.expect("load");
        assert_eq!(
            RelationshipType::resolve_active(&map, "DERIVES_FROM"),
            Some("DERIVES_FROM".to_string())
        );
    }

    #[tokio::test]
    async fn merge_resolves_through_chain() {
        let db = setup_test_db().await;

        RelationshipType::add_active("BACKS_UP", "Older synonym of SUPPORTS", &db)
            .await
            .expect("add");
        RelationshipType::merge("BACKS_UP", "SUPPORTS", &db)
            .await
            .expect("merge");

        let map = RelationshipType::load_map(&db).await.expect("load");
        assert_eq!(
            RelationshipType::resolve_active(&map, "BACKS_UP"),
            Some("SUPPORTS".to_string())
        );

        let merged: RelationshipType = db.get_item("BACKS_UP").await.expect("get").expect("some");
        assert!(!merged.is_active);
        assert_eq!(merged.merged_into.as_deref(), Some("SUPPORTS"));
    }

    #[tokio::test]
    async fn merge_into_unknown_target_fails() {
        let db = setup_test_db().await;
        let result = RelationshipType::merge("IMPLIES", "MISSING", &db).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[test]
    fn resolve_bails_on_cycles() {
        let mut map = HashMap::new();
        let mut a = RelationshipType::new("A", "a".into());
        a.is_active = false;
        a.merged_into = Some("B".into());
        let mut b = RelationshipType::new("B", "b".into());
        b.is_active = false;
        b.merged_into = Some("A".into());
        map.insert("A".to_string(), a);
        map.insert("B".to_string(), b);

        assert_eq!(RelationshipType::resolve_active(&map, "A"), None);
    }
}
