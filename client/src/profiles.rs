//! Author profiles: the shared cache, the batched loader and the username
//! editor.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use murmur_core::feed::{AuthorProfile, ProfileSource};
use murmur_core::validate::{validate_profile_photo_url, validate_username};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::models::{collections, UserProfile};
use crate::store::{
    ChangeKind, DocPath, DocumentStore, Fields, Query, QuerySnapshot, QuerySubscription,
    MAX_IN_QUERY_IDS,
};
use crate::timeout::{store_timeout, write_timeout};

/// Generated avatar service.
pub const AVATAR_BASE_URL: &str = "https://ui-avatars.com/api/";

/// Avatar URL for a display name.
pub fn avatar_url(name: &str) -> String {
    match Url::parse_with_params(
        AVATAR_BASE_URL,
        &[("name", name), ("background", "random"), ("size", "128")],
    ) {
        Ok(url) => url.into(),
        Err(_) => AVATAR_BASE_URL.to_string(),
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Profiles keyed by user id, shared between the renderer and loaders.
#[derive(Debug, Clone, Default)]
pub struct ProfileCache {
    entries: Arc<DashMap<String, UserProfile>>,
    pending: Arc<DashSet<String>>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<UserProfile> {
        self.entries.get(user_id).map(|p| p.clone())
    }

    pub fn insert(&self, user_id: impl Into<String>, profile: UserProfile) {
        self.entries.insert(user_id.into(), profile);
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.entries.contains_key(user_id)
    }

    /// Cached ids, at most `limit`.
    pub fn ids(&self, limit: usize) -> Vec<String> {
        self.entries
            .iter()
            .take(limit)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.pending.clear();
    }

    /// Fold added and modified profiles from a `users` subscription.
    pub fn apply_snapshot(&self, snapshot: &QuerySnapshot) {
        for change in &snapshot.changes {
            if change.kind == ChangeKind::Removed {
                continue;
            }
            match change.doc.decode::<UserProfile>() {
                Ok(profile) => self.insert(change.doc.id.clone(), profile),
                Err(e) => debug!(error = %e, "Skipping undecodable profile"),
            }
        }
    }

    /// Mark `user_id` as queued. False if cached or already queued.
    fn begin_load(&self, user_id: &str) -> bool {
        !self.contains(user_id) && self.pending.insert(user_id.to_string())
    }

    fn end_load(&self, user_id: &str) {
        self.pending.remove(user_id);
    }
}

impl ProfileSource for ProfileCache {
    fn lookup(&self, user_id: &str) -> Option<AuthorProfile> {
        self.entries.get(user_id).map(|p| p.author())
    }
}

// ============================================================================
// Batched loader
// ============================================================================

/// Collects profile requests and loads them in debounced batches.
///
/// Each burst of requests is answered by one set of id-in queries once no
/// new request arrived for the debounce period. The ids loaded by a batch
/// are reported on the channel given to [`spawn`](Self::spawn).
pub struct ProfileLoader {
    cache: ProfileCache,
    requests: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl ProfileLoader {
    pub fn spawn(
        store: Arc<dyn DocumentStore>,
        cache: ProfileCache,
        config: &Config,
        loaded: mpsc::UnboundedSender<Vec<String>>,
    ) -> Self {
        let (requests, mut rx) = mpsc::unbounded_channel::<String>();
        let debounce = config.profile_batch_debounce;
        let batch_size = config.profile_batch_size;
        let task_cache = cache.clone();

        let task = tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut ids = vec![first];
                while let Ok(Some(id)) = tokio::time::timeout(debounce, rx.recv()).await {
                    ids.push(id);
                }

                let found = load_profiles(store.as_ref(), &task_cache, &ids, batch_size).await;
                for id in &ids {
                    task_cache.end_load(id);
                }
                debug!(requested = ids.len(), found = found.len(), "Profile batch loaded");
                if loaded.send(found).is_err() {
                    break;
                }
            }
        });

        Self {
            cache,
            requests,
            task,
        }
    }

    /// Queue a profile load unless it is cached or already queued.
    pub fn request(&self, user_id: &str) {
        if user_id.is_empty() || !self.cache.begin_load(user_id) {
            return;
        }
        if self.requests.send(user_id.to_string()).is_err() {
            self.cache.end_load(user_id);
        }
    }
}

impl Drop for ProfileLoader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Load `ids` into the cache in chunks, falling back to single reads for a
/// chunk whose query fails. Returns the ids that were found.
pub async fn load_profiles(
    store: &dyn DocumentStore,
    cache: &ProfileCache,
    ids: &[String],
    batch_size: usize,
) -> Vec<String> {
    let batch_size = batch_size.clamp(1, MAX_IN_QUERY_IDS);
    let mut found = Vec::new();

    for chunk in ids.chunks(batch_size) {
        let query = Query::collection(collections::USERS).where_id_in(chunk.to_vec());
        match store.query(&query).await {
            Ok(docs) => {
                for doc in docs {
                    if let Ok(profile) = doc.decode::<UserProfile>() {
                        cache.insert(doc.id.clone(), profile);
                        found.push(doc.id);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, chunk = chunk.len(), "Profile batch query failed, loading individually");
                for id in chunk {
                    match store.get(&DocPath::new(collections::USERS, id)).await {
                        Ok(Some(doc)) => {
                            if let Ok(profile) = doc.decode::<UserProfile>() {
                                cache.insert(id.clone(), profile);
                                found.push(id.clone());
                            }
                        }
                        Ok(None) => {}
                        Err(e) => debug!(error = %e, "Profile load failed"),
                    }
                }
            }
        }
    }

    found
}

// ============================================================================
// Own profile
// ============================================================================

/// Reads and writes of the current user's profile.
#[derive(Clone)]
pub struct ProfileService {
    store: Arc<dyn DocumentStore>,
    cache: ProfileCache,
    check_timeout: Duration,
    save_timeout: Duration,
}

impl ProfileService {
    pub fn new(store: Arc<dyn DocumentStore>, cache: ProfileCache, config: &Config) -> Self {
        Self {
            store,
            cache,
            check_timeout: config.username_check_timeout,
            save_timeout: config.profile_save_timeout,
        }
    }

    pub fn cache(&self) -> &ProfileCache {
        &self.cache
    }

    /// Load the user's own profile into the cache.
    pub async fn load_own(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let doc = self
            .store
            .get(&DocPath::new(collections::USERS, user_id))
            .await?;
        let Some(doc) = doc else {
            return Ok(None);
        };
        let profile: UserProfile = doc.decode()?;
        self.cache.insert(user_id, profile.clone());
        Ok(Some(profile))
    }

    /// Whether nobody but `user_id` holds `username` (exact match).
    pub async fn is_username_available(&self, user_id: &str, username: &str) -> Result<bool> {
        let query = Query::collection(collections::USERS).where_eq("username", username);
        let docs = store_timeout("username check", self.check_timeout, self.store.query(&query)).await?;
        Ok(docs.iter().all(|doc| doc.id == user_id))
    }

    /// Validate, check availability and save a new username together with
    /// a generated avatar.
    pub async fn save_username(&self, user_id: &str, input: &str) -> Result<UserProfile> {
        let username = validate_username(input)?;

        if !self.is_username_available(user_id, username).await? {
            return Err(ClientError::UsernameTaken);
        }

        let photo = avatar_url(username);
        validate_profile_photo_url(&photo)?;

        let store = self.store.clone();
        let path = DocPath::new(collections::USERS, user_id);
        let fields = Fields::new()
            .set("username", username)
            .set("profilePhotoURL", photo.clone());
        write_timeout("profile save", self.save_timeout, async move {
            store.merge(&path, fields).await
        })
        .await?;

        let mut profile = self.cache.get(user_id).unwrap_or_default();
        profile.username = username.to_string();
        profile.profile_photo_url = Some(photo);
        self.cache.insert(user_id, profile.clone());

        info!("Profile saved");
        Ok(profile)
    }

    /// Live updates for up to 30 cached profiles, if any are cached.
    pub async fn watch_cached(&self) -> Option<QuerySubscription> {
        let ids = self.cache.ids(MAX_IN_QUERY_IDS);
        if ids.is_empty() {
            return None;
        }
        let query = Query::collection(collections::USERS).where_id_in(ids);
        Some(self.store.watch_query(&query).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStore, StoreOp};
    use crate::store::StoreError;

    async fn seed_user(store: &MemoryStore, id: &str, name: &str) {
        store
            .set(
                &DocPath::new(collections::USERS, id),
                Fields::new().set("username", name),
            )
            .await
            .unwrap();
    }

    fn service(store: &MemoryStore) -> ProfileService {
        ProfileService::new(Arc::new(store.clone()), ProfileCache::new(), &Config::from_env())
    }

    #[test]
    fn avatar_url_is_allowed_and_encoded() {
        let url = avatar_url("John Doe");
        assert!(url.starts_with("https://ui-avatars.com/api/?name=John"));
        assert!(url.ends_with("&background=random&size=128"));
        assert!(!url.contains(' '));
        assert!(murmur_core::is_valid_profile_photo_url(&url));
    }

    #[tokio::test]
    async fn load_profiles_in_chunks() {
        let store = MemoryStore::new();
        for i in 0..5 {
            seed_user(&store, &format!("u{}", i), &format!("name{}", i)).await;
        }
        let cache = ProfileCache::new();
        let ids: Vec<String> = (0..6).map(|i| format!("u{}", i)).collect();

        let found = load_profiles(&store, &cache, &ids, 2).await;

        assert_eq!(found.len(), 5);
        assert_eq!(cache.lookup("u3").unwrap().username, "name3");
        assert!(cache.lookup("u5").is_none());
    }

    #[tokio::test]
    async fn failed_query_falls_back_to_single_reads() {
        let store = MemoryStore::new();
        seed_user(&store, "u1", "alice").await;
        store.fail(StoreOp::Query, collections::USERS, StoreError::Unavailable);

        let cache = ProfileCache::new();
        let found = load_profiles(&store, &cache, &["u1".to_string(), "u2".to_string()], 30).await;

        assert_eq!(found, vec!["u1".to_string()]);
        assert!(cache.contains("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn loader_coalesces_requests() {
        let store = MemoryStore::new();
        seed_user(&store, "a", "alice").await;
        seed_user(&store, "b", "bob").await;

        let cache = ProfileCache::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let loader = ProfileLoader::spawn(Arc::new(store.clone()), cache.clone(), &Config::from_env(), tx);

        loader.request("a");
        loader.request("b");
        loader.request("a");

        let mut loaded = rx.recv().await.unwrap();
        loaded.sort();
        assert_eq!(loaded, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cache.len(), 2);

        // Cached ids are not requested again.
        loader.request("a");
        assert!(tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn save_username_rejects_taken_names() {
        let store = MemoryStore::new();
        seed_user(&store, "other", "taken").await;

        let err = service(&store).save_username("me", "taken").await.unwrap_err();
        assert!(matches!(err, ClientError::UsernameTaken));
    }

    #[tokio::test]
    async fn save_username_keeps_own_name_and_writes_avatar() {
        let store = MemoryStore::new();
        seed_user(&store, "me", "samename").await;
        let profiles = service(&store);

        let saved = profiles.save_username("me", "  samename ").await.unwrap();

        assert_eq!(saved.username, "samename");
        let stored = store
            .peek(&DocPath::new(collections::USERS, "me"))
            .await
            .unwrap();
        assert!(stored["profilePhotoURL"]
            .as_str()
            .unwrap()
            .starts_with(AVATAR_BASE_URL));
        assert_eq!(profiles.cache().lookup("me").unwrap().username, "samename");
    }

    #[tokio::test]
    async fn invalid_username_never_reaches_store() {
        let store = MemoryStore::new();
        let err = service(&store).save_username("me", "admin").await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Validation(murmur_core::Error::InvalidUsername)
        ));
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_username_check_times_out() {
        let store = MemoryStore::new();
        store.set_latency(Duration::from_secs(30));

        let err = service(&store).save_username("me", "fresh").await.unwrap_err();
        assert!(matches!(err, ClientError::Store(StoreError::Timeout)));
        assert_eq!(
            err.user_hint(crate::error::Action::Profile),
            "Request timed out. Please try again."
        );
    }
}
