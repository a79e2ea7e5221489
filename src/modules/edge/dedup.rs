use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use super::journal;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeenCommand {
    pub id: String,
    pub seen_at: DateTime<Utc>,
}

/// Ids of commands already acknowledged, kept across restarts.
///
/// Bounded two ways: entries older than `ttl` expire, and past `max_entries`
/// the oldest are evicted first.
pub struct CommandDedup {
    path: PathBuf,
    max_entries: usize,
    ttl: Duration,
    entries: VecDeque<SeenCommand>,
    ids: HashSet<String>,
}

impl CommandDedup {
    pub async fn load(path: impl AsRef<Path>, max_entries: usize, ttl: Duration) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut stored: Vec<SeenCommand> = match journal::load(&path).await {
            Ok(stored) => stored,
            Err(e) => {
                log::error!("Failed to load seen commands, starting empty: {}", e);
                Vec::new()
            }
        };
        stored.sort_by(|a, b| a.seen_at.cmp(&b.seen_at));

        let mut dedup = CommandDedup {
            path,
            max_entries: max_entries.max(1),
            ttl,
            entries: VecDeque::with_capacity(stored.len()),
            ids: HashSet::with_capacity(stored.len()),
        };
        for entry in stored {
            if dedup.ids.insert(entry.id.clone()) {
                dedup.entries.push_back(entry);
            }
        }

        if dedup.evict(Utc::now()) > 0 {
            dedup.persist().await;
        }
        dedup
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Registers `id` and returns true when it was not seen (within the bounds) before.
    pub async fn check_and_insert(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        self.evict(now);
        if self.ids.contains(id) {
            return false;
        }

        self.ids.insert(id.to_string());
        self.entries.push_back(SeenCommand {
            id: id.to_string(),
            seen_at: now,
        });
        self.evict(now);
        self.persist().await;
        true
    }

    fn evict(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.ttl;
        let mut evicted = 0;

        while let Some(oldest) = self.entries.front() {
            if oldest.seen_at > cutoff && self.entries.len() <= self.max_entries {
                break;
            }
            if let Some(old) = self.entries.pop_front() {
                self.ids.remove(&old.id);
                evicted += 1;
            }
        }
        evicted
    }

    async fn persist(&self) {
        if let Err(e) = journal::rewrite(&self.path, &self.entries).await {
            log::error!("Failed to persist seen commands: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_sighting_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut dedup = CommandDedup::load(dir.path().join("seen.jsonl"), 10, Duration::days(1)).await;
        let now = Utc::now();

        assert!(dedup.check_and_insert("c-1", now).await);
        assert!(!dedup.check_and_insert("c-1", now).await);
        assert!(dedup.check_and_insert("c-2", now).await);
        assert_eq!(dedup.len(), 2);
    }

    #[tokio::test]
    async fn test_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seen.jsonl");
        let now = Utc::now();

        let mut dedup = CommandDedup::load(&path, 10, Duration::days(1)).await;
        dedup.check_and_insert("c-1", now).await;
        drop(dedup);

        let mut dedup = CommandDedup::load(&path, 10, Duration::days(1)).await;
        assert!(dedup.contains("c-1"));
        assert!(!dedup.check_and_insert("c-1", now).await);
    }

    #[tokio::test]
    async fn test_expired_ids_are_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let mut dedup = CommandDedup::load(dir.path().join("seen.jsonl"), 10, Duration::hours(1)).await;
        let now = Utc::now();

        assert!(dedup.check_and_insert("c-1", now).await);
        let later = now + Duration::hours(2);
        assert!(dedup.check_and_insert("c-1", later).await);
        assert_eq!(dedup.len(), 1);
    }

    #[tokio::test]
    async fn test_size_bound_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seen.jsonl");
        let mut dedup = CommandDedup::load(&path, 2, Duration::days(1)).await;
        let now = Utc::now();

        for (n, id) in ["c-1", "c-2", "c-3"].iter().enumerate() {
            dedup.check_and_insert(id, now + Duration::seconds(n as i64)).await;
        }
        assert!(!dedup.contains("c-1"));
        assert!(dedup.contains("c-2"));
        assert!(dedup.contains("c-3"));

        let reloaded = CommandDedup::load(&path, 2, Duration::days(1)).await;
        assert_eq!(reloaded.len(), 2);
        assert!(!reloaded.contains("c-1"));
    }

    #[tokio::test]
    async fn test_load_drops_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seen.jsonl");
        let old = SeenCommand {
            id: "old".to_string(),
            seen_at: Utc::now() - Duration::days(30),
        };
        let fresh = SeenCommand {
            id: "fresh".to_string(),
            seen_at: Utc::now(),
        };
        journal::rewrite(&path, &[old, fresh]).await.unwrap();

        let dedup = CommandDedup::load(&path, 10, Duration::days(7)).await;
        assert!(!dedup.contains("old"));
        assert!(dedup.contains("fresh"));
    }
}
