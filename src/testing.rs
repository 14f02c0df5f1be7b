//! Scripted in-memory [`RemoteApi`] for sync and resync tests.

use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::api::{server_id, ApiError, RemoteApi};
use crate::entities::EntityKind;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Create {
        kind: EntityKind,
        payload: Value,
        idempotency_key: String,
    },
    Update {
        kind: EntityKind,
        id: String,
        payload: Value,
    },
    Delete {
        kind: EntityKind,
        id: String,
    },
    List(EntityKind),
}

#[derive(Default)]
struct State {
    online: bool,
    next_id: u64,
    collections: HashMap<EntityKind, Vec<Value>>,
    /// Upload keys the server already processed, mapped to the created id.
    upload_keys: HashMap<String, String>,
    failures: VecDeque<ApiError>,
    list_failures: HashMap<EntityKind, ApiError>,
    drop_next_ack: bool,
    /// Answer creates as `{ "data": doc }` the way some deployments do.
    wrap_documents: bool,
    calls: Vec<Call>,
}

/// Fake server. Like the real backend it only honours idempotency keys of
/// scan uploads (`scan:` prefix); every other create is applied again.
pub struct FakeRemote {
    state: Mutex<State>,
}

impl FakeRemote {
    pub fn online() -> Self {
        Self {
            state: Mutex::new(State {
                online: true,
                ..State::default()
            }),
        }
    }

    pub fn offline() -> Self {
        let fake = Self::online();
        fake.set_online(false);
        fake
    }

    pub fn set_online(&self, online: bool) {
        self.state.lock().unwrap().online = online;
    }

    /// Fail the next mutation calls with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = ApiError>) {
        self.state.lock().unwrap().failures.extend(errors);
    }

    pub fn fail_list(&self, kind: EntityKind, error: ApiError) {
        self.state.lock().unwrap().list_failures.insert(kind, error);
    }

    /// Apply the next mutation but report a network error to the caller.
    pub fn drop_next_ack(&self) {
        self.state.lock().unwrap().drop_next_ack = true;
    }

    pub fn wrap_documents(&self) {
        self.state.lock().unwrap().wrap_documents = true;
    }

    pub fn seed(&self, kind: EntityKind, docs: Vec<Value>) {
        self.state.lock().unwrap().collections.insert(kind, docs);
    }

    pub fn docs(&self, kind: EntityKind) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .collections
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    fn check(state: &mut State) -> Result<(), ApiError> {
        if !state.online {
            return Err(ApiError::Network("fake://offline".into()));
        }
        match state.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn ack<T>(state: &mut State, value: T) -> Result<T, ApiError> {
        if std::mem::take(&mut state.drop_next_ack) {
            return Err(ApiError::Network("fake://connection reset".into()));
        }
        Ok(value)
    }
}

impl RemoteApi for FakeRemote {
    async fn create(
        &self,
        kind: EntityKind,
        payload: &Value,
        idempotency_key: &str,
    ) -> Result<Value, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Create {
            kind,
            payload: payload.clone(),
            idempotency_key: idempotency_key.to_string(),
        });
        Self::check(&mut state)?;

        if idempotency_key.starts_with("scan:") {
            if let Some(existing) = state.upload_keys.get(idempotency_key).cloned() {
                let doc = state
                    .collections
                    .get(&kind)
                    .and_then(|docs| {
                        docs.iter()
                            .find(|d| server_id(d).as_deref() == Some(existing.as_str()))
                    })
                    .cloned()
                    .unwrap_or_else(|| json!({ "_id": existing }));
                return Self::ack(&mut state, doc);
            }
        }

        state.next_id += 1;
        let id = format!("srv-{}", state.next_id);
        let mut doc = payload.clone();
        if let Value::Object(map) = &mut doc {
            map.insert("_id".into(), Value::String(id.clone()));
        }
        state.collections.entry(kind).or_default().push(doc.clone());
        if idempotency_key.starts_with("scan:") {
            state.upload_keys.insert(idempotency_key.to_string(), id);
        }
        let body = if state.wrap_documents {
            json!({ "data": doc })
        } else {
            doc
        };
        Self::ack(&mut state, body)
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Value,
    ) -> Result<Option<Value>, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Update {
            kind,
            id: id.to_string(),
            payload: payload.clone(),
        });
        Self::check(&mut state)?;

        let docs = state.collections.entry(kind).or_default();
        let Some(doc) = docs
            .iter_mut()
            .find(|d| server_id(d).as_deref() == Some(id))
        else {
            return Err(ApiError::NotFound);
        };
        if let (Value::Object(target), Value::Object(patch)) = (&mut *doc, payload) {
            for (k, v) in patch {
                target.insert(k.clone(), v.clone());
            }
        }
        let updated = doc.clone();
        Self::ack(&mut state, Some(updated))
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Delete {
            kind,
            id: id.to_string(),
        });
        Self::check(&mut state)?;

        let docs = state.collections.entry(kind).or_default();
        let before = docs.len();
        docs.retain(|d| server_id(d).as_deref() != Some(id));
        if docs.len() == before {
            return Err(ApiError::NotFound);
        }
        Self::ack(&mut state, ())
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Value>, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::List(kind));
        if !state.online {
            return Err(ApiError::Network("fake://offline".into()));
        }
        if let Some(err) = state.list_failures.get(&kind) {
            return Err(err.clone());
        }
        Ok(state.collections.get(&kind).cloned().unwrap_or_default())
    }

    async fn health(&self) -> Result<(), ApiError> {
        if self.state.lock().unwrap().online {
            Ok(())
        } else {
            Err(ApiError::Network("fake://offline".into()))
        }
    }
}
