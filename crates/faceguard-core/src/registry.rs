//! Enrolled identities. Append-only: no update or delete is exposed.

use crate::persistence::{self, PersistenceError, SnapshotStore};
use crate::types::{Identity, IdentityCandidate};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingField {
    Name,
    Department,
    ReferenceImage,
}

impl std::fmt::Display for MissingField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MissingField::Name => "name",
            MissingField::Department => "department",
            MissingField::ReferenceImage => "reference image",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("missing required fields: {}", join_fields(.missing))]
pub struct ValidationError {
    pub missing: Vec<MissingField>,
}

fn join_fields(fields: &[MissingField]) -> String {
    fields
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("could not persist registry: {0}")]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered { id: String, name: String },
}

/// Resolve an identity by id. Used by the ledger for denormalization.
pub trait IdentityLookup {
    fn lookup(&self, id: &str) -> Option<&Identity>;
}

impl IdentityLookup for [Identity] {
    fn lookup(&self, id: &str) -> Option<&Identity> {
        self.iter().find(|i| i.id == id)
    }
}

impl IdentityLookup for Vec<Identity> {
    fn lookup(&self, id: &str) -> Option<&Identity> {
        self.as_slice().lookup(id)
    }
}

pub struct UserRegistry {
    identities: Vec<Identity>,
    store: Arc<dyn SnapshotStore>,
    events: broadcast::Sender<RegistryEvent>,
}

impl UserRegistry {
    /// Restore the registry from its snapshot (empty if absent or unreadable).
    pub fn load(store: Arc<dyn SnapshotStore>) -> Self {
        let identities: Vec<Identity> =
            persistence::load_collection(store.as_ref(), persistence::IDENTITIES);
        tracing::info!(count = identities.len(), "registry loaded");
        let (events, _) = broadcast::channel(32);
        Self {
            identities,
            store,
            events,
        }
    }

    /// Validate, assign an id, append and persist.
    pub fn register(&mut self, candidate: IdentityCandidate) -> Result<Identity, RegistryError> {
        self.register_at(candidate, Utc::now())
    }

    pub fn register_at(
        &mut self,
        candidate: IdentityCandidate,
        now: DateTime<Utc>,
    ) -> Result<Identity, RegistryError> {
        validate(&candidate)?;

        let identity = Identity {
            id: uuid::Uuid::new_v4().to_string(),
            name: candidate.name.trim().to_string(),
            department: candidate.department.trim().to_string(),
            reference_image: candidate.reference_image,
            registered_at: now,
        };

        self.identities.push(identity.clone());
        if let Err(e) = persistence::save_collection(
            self.store.as_ref(),
            persistence::IDENTITIES,
            &self.identities,
        ) {
            self.identities.pop();
            tracing::error!(error = %e, "registry save failed; registration rolled back");
            return Err(e.into());
        }

        tracing::info!(
            id = %identity.id,
            department = %identity.department,
            image_bytes = identity.reference_image.len(),
            "identity registered"
        );
        let _ = self.events.send(RegistryEvent::Registered {
            id: identity.id.clone(),
            name: identity.name.clone(),
        });
        Ok(identity)
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn get(&self, id: &str) -> Option<&Identity> {
        self.identities.lookup(id)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Owned copy for a matching pass, so no lock is held while the oracle runs.
    pub fn snapshot(&self) -> Vec<Identity> {
        self.identities.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}

impl IdentityLookup for UserRegistry {
    fn lookup(&self, id: &str) -> Option<&Identity> {
        self.get(id)
    }
}

fn validate(candidate: &IdentityCandidate) -> Result<(), ValidationError> {
    let mut missing = Vec::new();
    if candidate.name.trim().is_empty() {
        missing.push(MissingField::Name);
    }
    if candidate.department.trim().is_empty() {
        missing.push(MissingField::Department);
    }
    if candidate.reference_image.is_empty() {
        missing.push(MissingField::ReferenceImage);
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { missing })
    }
}
