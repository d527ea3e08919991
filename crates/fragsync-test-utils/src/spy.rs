//! Recording remote client with scripted failures

use async_trait::async_trait;
use fragsync_model::ExternalResourceKey;
use fragsync_sync::{RemoteClient, RemoteError};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Exists,
    Create,
    Update,
    Delete,
    ConfigVersion,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Exists { key: String },
    Create { key: String, document: JsonValue },
    Update { remote_id: String, document: JsonValue },
    Delete { remote_id: String },
    ConfigVersion { remote_id: String },
}

impl RemoteCall {
    pub fn op(&self) -> RemoteOp {
        match self {
            Self::Exists { .. } => RemoteOp::Exists,
            Self::Create { .. } => RemoteOp::Create,
            Self::Update { .. } => RemoteOp::Update,
            Self::Delete { .. } => RemoteOp::Delete,
            Self::ConfigVersion { .. } => RemoteOp::ConfigVersion,
        }
    }
}

#[derive(Debug, Default)]
struct SpyState {
    calls: Vec<RemoteCall>,
    failures: VecDeque<(RemoteOp, RemoteError)>,
    objects: BTreeMap<String, (String, JsonValue, u64)>,
    next_id: u64,
}

/// Remote client that records every call
///
/// Objects live in memory; ids are `remote-1`, `remote-2`, ... Failures
/// queued with [`SpyRemote::fail_next`] are returned, in order, by the next
/// call of the matching operation, before any state change.
#[derive(Debug, Default)]
pub struct SpyRemote {
    state: Mutex<SpyState>,
}

impl SpyRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, op: RemoteOp, error: RemoteError) {
        self.state.lock().failures.push_back((op, error));
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn count(&self, op: RemoteOp) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.op() == op)
            .count()
    }

    pub fn reset_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Document held for `key`, if an object exists
    pub fn document_for(&self, key: &ExternalResourceKey) -> Option<JsonValue> {
        let storage_key = key.storage_key();
        self.state
            .lock()
            .objects
            .values()
            .find(|(k, _, _)| *k == storage_key)
            .map(|(_, document, _)| document.clone())
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Remove an object behind the aggregator's back
    pub fn delete_out_of_band(&self, key: &ExternalResourceKey) {
        let storage_key = key.storage_key();
        self.state
            .lock()
            .objects
            .retain(|_, (k, _, _)| *k != storage_key);
    }

    fn begin(&self, call: RemoteCall) -> Result<parking_lot::MutexGuard<'_, SpyState>, RemoteError> {
        let mut state = self.state.lock();
        let op = call.op();
        state.calls.push(call);
        if let Some(pos) = state.failures.iter().position(|(o, _)| *o == op) {
            if let Some((_, error)) = state.failures.remove(pos) {
                return Err(error);
            }
        }
        Ok(state)
    }
}

#[async_trait]
impl RemoteClient for SpyRemote {
    async fn exists(&self, key: &ExternalResourceKey) -> Result<Option<String>, RemoteError> {
        let storage_key = key.storage_key();
        let state = self.begin(RemoteCall::Exists {
            key: storage_key.clone(),
        })?;
        Ok(state
            .objects
            .iter()
            .find(|(_, (k, _, _))| *k == storage_key)
            .map(|(id, _)| id.clone()))
    }

    async fn create(
        &self,
        key: &ExternalResourceKey,
        document: &JsonValue,
    ) -> Result<String, RemoteError> {
        let mut state = self.begin(RemoteCall::Create {
            key: key.storage_key(),
            document: document.clone(),
        })?;
        state.next_id += 1;
        let id = format!("remote-{}", state.next_id);
        state
            .objects
            .insert(id.clone(), (key.storage_key(), document.clone(), 1));
        Ok(id)
    }

    async fn update(&self, remote_id: &str, document: &JsonValue) -> Result<(), RemoteError> {
        let mut state = self.begin(RemoteCall::Update {
            remote_id: remote_id.to_string(),
            document: document.clone(),
        })?;
        let Some(object) = state.objects.get_mut(remote_id) else {
            return Err(RemoteError::not_found(remote_id));
        };
        object.1 = document.clone();
        object.2 += 1;
        Ok(())
    }

    async fn delete(&self, remote_id: &str) -> Result<(), RemoteError> {
        let mut state = self.begin(RemoteCall::Delete {
            remote_id: remote_id.to_string(),
        })?;
        match state.objects.remove(remote_id) {
            Some(_) => Ok(()),
            None => Err(RemoteError::not_found(remote_id)),
        }
    }

    async fn config_version(&self, remote_id: &str) -> Result<Option<String>, RemoteError> {
        let state = self.begin(RemoteCall::ConfigVersion {
            remote_id: remote_id.to_string(),
        })?;
        Ok(state
            .objects
            .get(remote_id)
            .map(|(_, _, version)| version.to_string()))
    }
}
