//! In-memory `ResourceStore` used by unit tests.
//!
//! Mirrors the Postgres adapter's semantics (shallow content overwrite,
//! one entry per user) and adds knobs to inject write failures, hung
//! writes and slow reads so error and timeout paths can be exercised
//! without a database.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};
use uuid::Uuid;

use super::store::{Collaborator, InviteStatus, LogEntry, Resource, ResourceKind, ResourceStore, Role, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
    hang_writes: AtomicBool,
    read_delay_ms: AtomicU64,
}

#[derive(Default)]
struct Inner {
    resources: HashMap<Uuid, Resource>,
    messages: HashMap<Uuid, Vec<LogEntry>>,
    users: HashMap<String, Uuid>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a resource owned by `owner_id` and return its id.
    pub fn insert_resource(&self, kind: ResourceKind, owner_id: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        let resource =
            Resource { id, kind, owner_id, content: serde_json::json!({"title": "Untitled"}), collaborators: Vec::new() };
        self.inner
            .lock()
            .expect("store mutex should lock")
            .resources
            .insert(id, resource);
        id
    }

    /// Seed a collaborator entry directly, bypassing the workflow.
    pub fn seed_collaborator(&self, resource_id: Uuid, user_id: Uuid, role: Role, status: InviteStatus) {
        let mut inner = self.inner.lock().expect("store mutex should lock");
        let resource = inner
            .resources
            .get_mut(&resource_id)
            .expect("resource should exist");
        resource.collaborators.retain(|c| c.user_id != user_id);
        resource
            .collaborators
            .push(Collaborator { user_id, role, status, joined_at: None });
    }

    /// Register a user email for invite resolution.
    pub fn register_user(&self, email: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.inner
            .lock()
            .expect("store mutex should lock")
            .users
            .insert(email.to_owned(), id);
        id
    }

    #[must_use]
    pub fn content(&self, resource_id: Uuid) -> Value {
        self.inner
            .lock()
            .expect("store mutex should lock")
            .resources
            .get(&resource_id)
            .map(|r| r.content.clone())
            .unwrap_or(Value::Null)
    }

    #[must_use]
    pub fn messages(&self, resource_id: Uuid) -> Vec<LogEntry> {
        self.inner
            .lock()
            .expect("store mutex should lock")
            .messages
            .get(&resource_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every write wait forever, as a wedged database connection would.
    pub fn set_hang_writes(&self, hang: bool) {
        self.hang_writes.store(hang, Ordering::SeqCst);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.read_delay_ms.store(ms, Ordering::SeqCst);
    }

    async fn maybe_delay(&self) {
        let ms = self.read_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    async fn check_writable(&self) -> Result<(), StoreError> {
        if self.hang_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn get_resource(&self, resource_id: Uuid) -> Result<Option<Resource>, StoreError> {
        self.maybe_delay().await;
        Ok(self
            .inner
            .lock()
            .expect("store mutex should lock")
            .resources
            .get(&resource_id)
            .cloned())
    }

    async fn is_collaborator(&self, resource_id: Uuid, user_id: Uuid) -> Result<Option<Collaborator>, StoreError> {
        self.maybe_delay().await;
        let inner = self.inner.lock().expect("store mutex should lock");
        let resource = inner
            .resources
            .get(&resource_id)
            .ok_or(StoreError::ResourceNotFound(resource_id))?;
        Ok(resource.collaborator(user_id).cloned())
    }

    async fn apply_content_update(&self, resource_id: Uuid, patch: &Map<String, Value>) -> Result<(), StoreError> {
        self.check_writable().await?;
        let mut inner = self.inner.lock().expect("store mutex should lock");
        let resource = inner
            .resources
            .get_mut(&resource_id)
            .ok_or(StoreError::ResourceNotFound(resource_id))?;
        if !resource.content.is_object() {
            resource.content = Value::Object(Map::new());
        }
        if let Value::Object(fields) = &mut resource.content {
            for (key, value) in patch {
                fields.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn append_message(&self, resource_id: Uuid, entry: &LogEntry) -> Result<(), StoreError> {
        self.check_writable().await?;
        self.inner
            .lock()
            .expect("store mutex should lock")
            .messages
            .entry(resource_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn upsert_collaborator(&self, resource_id: Uuid, collaborator: &Collaborator) -> Result<(), StoreError> {
        self.check_writable().await?;
        let mut inner = self.inner.lock().expect("store mutex should lock");
        let resource = inner
            .resources
            .get_mut(&resource_id)
            .ok_or(StoreError::ResourceNotFound(resource_id))?;
        if let Some(existing) = resource
            .collaborators
            .iter_mut()
            .find(|c| c.user_id == collaborator.user_id)
        {
            *existing = collaborator.clone();
        } else {
            resource.collaborators.push(collaborator.clone());
        }
        Ok(())
    }

    async fn remove_collaborator(&self, resource_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        self.check_writable().await?;
        let mut inner = self.inner.lock().expect("store mutex should lock");
        let resource = inner
            .resources
            .get_mut(&resource_id)
            .ok_or(StoreError::ResourceNotFound(resource_id))?;
        let before = resource.collaborators.len();
        resource.collaborators.retain(|c| c.user_id != user_id);
        Ok(resource.collaborators.len() != before)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .inner
            .lock()
            .expect("store mutex should lock")
            .users
            .get(email)
            .copied())
    }
}
