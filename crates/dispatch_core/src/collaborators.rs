//! External services the dispatch core consumes, plus in-memory stand-ins.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bevy_ecs::prelude::Resource;
use serde::{Deserialize, Serialize};

use crate::ecs::{ParticipantPid, Ride, RidePid, RideStatus, Role};
use crate::error::CollaboratorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub participant: ParticipantPid,
    /// Roles the session may connect as.
    pub roles: Vec<Role>,
}

pub trait SessionVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<SessionIdentity, CollaboratorError>;
}

/// Booking service's ride records.
pub trait RideRepository: Send + Sync {
    fn find(&self, ride: RidePid) -> Result<Ride, CollaboratorError>;
    fn store(&self, ride: &Ride) -> Result<(), CollaboratorError>;
}

/// Charge raised against whoever cancels an accepted ride after the grace window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pendency {
    pub ride: RidePid,
    pub party: ParticipantPid,
    pub role: Role,
    pub raised_at: u64,
    pub accepted_at: u64,
}

pub trait BillingService: Send + Sync {
    fn issue_pendency(&self, pendency: &Pendency) -> Result<(), CollaboratorError>;
}

/// Collaborator handles available to systems.
#[derive(Clone, Resource)]
pub struct Collaborators {
    pub sessions: Arc<dyn SessionVerifier>,
    pub rides: Arc<dyn RideRepository>,
    pub billing: Arc<dyn BillingService>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    pub fn new(
        sessions: Arc<dyn SessionVerifier>,
        rides: Arc<dyn RideRepository>,
        billing: Arc<dyn BillingService>,
    ) -> Self {
        Self {
            sessions,
            rides,
            billing,
        }
    }
}

/// Token table filled by tests and demos.
#[derive(Debug, Default)]
pub struct StaticSessions {
    tokens: Mutex<HashMap<String, SessionIdentity>>,
}

impl StaticSessions {
    pub fn insert(&self, token: impl Into<String>, identity: SessionIdentity) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(token.into(), identity);
        }
    }
}

impl SessionVerifier for StaticSessions {
    fn verify(&self, token: &str) -> Result<SessionIdentity, CollaboratorError> {
        let tokens = self.tokens.lock().map_err(|_| CollaboratorError::Unavailable {
            service: "sessions",
            reason: "lock poisoned".into(),
        })?;
        tokens
            .get(token)
            .cloned()
            .ok_or(CollaboratorError::UnknownToken)
    }
}

#[derive(Debug, Default)]
struct RideTable {
    rides: HashMap<RidePid, Ride>,
    history: Vec<(RidePid, RideStatus)>,
}

/// Ride store that also records every persisted status, in order.
#[derive(Debug, Default)]
pub struct InMemoryRideRepository {
    table: Mutex<RideTable>,
}

impl InMemoryRideRepository {
    pub fn insert(&self, ride: Ride) {
        if let Ok(mut table) = self.table.lock() {
            table.rides.insert(ride.pid, ride);
        }
    }

    pub fn get(&self, ride: RidePid) -> Option<Ride> {
        self.table.lock().ok()?.rides.get(&ride).cloned()
    }

    /// Statuses stored for `ride`, oldest first.
    pub fn history(&self, ride: RidePid) -> Vec<RideStatus> {
        self.table
            .lock()
            .map(|t| {
                t.history
                    .iter()
                    .filter(|(pid, _)| *pid == ride)
                    .map(|(_, status)| *status)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl RideRepository for InMemoryRideRepository {
    fn find(&self, ride: RidePid) -> Result<Ride, CollaboratorError> {
        self.get(ride).ok_or(CollaboratorError::RideNotFound(ride))
    }

    fn store(&self, ride: &Ride) -> Result<(), CollaboratorError> {
        let mut table = self.table.lock().map_err(|_| CollaboratorError::Unavailable {
            service: "rides",
            reason: "lock poisoned".into(),
        })?;
        table.history.push((ride.pid, ride.status));
        table.rides.insert(ride.pid, ride.clone());
        Ok(())
    }
}

/// Billing stand-in that records issued pendencies; can be switched to fail.
#[derive(Debug, Default)]
pub struct RecordingBilling {
    issued: Mutex<Vec<Pendency>>,
    failing: AtomicBool,
}

impl RecordingBilling {
    pub fn issued(&self) -> Vec<Pendency> {
        self.issued.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

impl BillingService for RecordingBilling {
    fn issue_pendency(&self, pendency: &Pendency) -> Result<(), CollaboratorError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(CollaboratorError::Unavailable {
                service: "billing",
                reason: "configured to fail".into(),
            });
        }
        let mut issued = self.issued.lock().map_err(|_| CollaboratorError::Unavailable {
            service: "billing",
            reason: "lock poisoned".into(),
        })?;
        issued.push(pendency.clone());
        Ok(())
    }
}
