//! Application arena plus the waiting-registration and resume side sets.
//!
//! The arena owns every registered [`Application`]; listeners only ever
//! see app ids. The waiting set carries HMI app ids for applications
//! announced before they register; the resume set remembers HMI app ids
//! of unregistered-pending-resume applications so a reconnect can
//! restore them.

use std::collections::HashMap;

use crate::manager::application::{Application, AudioClass, HmiLevel};
use crate::session::ConnectionKey;
use crate::trace::debug;

/// An application announced but not yet registered.
#[derive(Debug, Clone)]
pub struct WaitingApp {
    pub hmi_app_id: u32,
    pub device_handle: u32,
}

/// Canonical application state, owned by the manager.
#[derive(Debug, Default)]
pub struct AppRegistry {
    apps: HashMap<ConnectionKey, Application>,
    waiting: HashMap<String, WaitingApp>,
    resumed: HashMap<String, u32>,
}

impl AppRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, app: Application) {
        self.apps.insert(app.app_id, app);
    }

    pub fn remove(&mut self, app_id: ConnectionKey) -> Option<Application> {
        self.apps.remove(&app_id)
    }

    #[must_use]
    pub fn get(&self, app_id: ConnectionKey) -> Option<&Application> {
        self.apps.get(&app_id)
    }

    #[must_use]
    pub fn get_mut(&mut self, app_id: ConnectionKey) -> Option<&mut Application> {
        self.apps.get_mut(&app_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Application> {
        self.apps.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Application> {
        self.apps.values_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.apps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// The single application in HMI Full, if any.
    #[must_use]
    pub fn active_application(&self) -> Option<ConnectionKey> {
        self.apps
            .values()
            .find(|app| app.hmi_level == HmiLevel::Full)
            .map(|app| app.app_id)
    }

    /// The Limited application of an exclusivity class, if any.
    #[must_use]
    pub fn limited_app_in_class(&self, class: AudioClass) -> Option<ConnectionKey> {
        self.apps
            .values()
            .find(|app| app.hmi_level == HmiLevel::Limited && app.types.in_class(class))
            .map(|app| app.app_id)
    }

    /// Whether another audio app sharing a class with `app` already sits
    /// in Full or Limited.
    #[must_use]
    pub fn class_occupied_in_full_or_limited(&self, app: &Application) -> bool {
        self.apps.values().any(|other| {
            other.app_id != app.app_id
                && other.hmi_level.is_audible_tier()
                && app.types.classes().iter().any(|c| other.types.in_class(*c))
        })
    }

    /// Whether an HMI app id is already spoken for anywhere: registered,
    /// waiting, or saved for resume.
    #[must_use]
    pub fn hmi_app_id_known(&self, hmi_app_id: u32) -> bool {
        self.apps.values().any(|app| app.hmi_app_id == hmi_app_id)
            || self.waiting.values().any(|w| w.hmi_app_id == hmi_app_id)
            || self.resumed.values().any(|id| *id == hmi_app_id)
    }

    /// Generates a random non-zero HMI app id avoiding every known one.
    #[must_use]
    pub fn generate_hmi_app_id(&self) -> u32 {
        loop {
            let candidate: u32 = rand::random();
            if candidate != 0 && !self.hmi_app_id_known(candidate) {
                debug!(hmi_app_id = candidate, "generated hmi app id");
                return candidate;
            }
        }
    }

    // --------------------------------------------------------------
    // Waiting-registration set
    // --------------------------------------------------------------

    pub fn add_waiting(&mut self, policy_app_id: String, waiting: WaitingApp) {
        self.waiting.insert(policy_app_id, waiting);
    }

    /// Removes and returns the waiting entry for an app now registering.
    pub fn take_waiting(&mut self, policy_app_id: &str) -> Option<WaitingApp> {
        self.waiting.remove(policy_app_id)
    }

    /// Drops waiting entries for a disappearing device.
    pub fn remove_waiting_for_device(&mut self, device_handle: u32) {
        self.waiting.retain(|_, w| w.device_handle != device_handle);
    }

    // --------------------------------------------------------------
    // Resume side set
    // --------------------------------------------------------------

    pub fn save_for_resume(&mut self, policy_app_id: String, hmi_app_id: u32) {
        self.resumed.insert(policy_app_id, hmi_app_id);
    }

    #[must_use]
    pub fn resumed_hmi_app_id(&self, policy_app_id: &str) -> Option<u32> {
        self.resumed.get(policy_app_id).copied()
    }

    pub fn forget_resumed(&mut self, policy_app_id: &str) {
        self.resumed.remove(policy_app_id);
    }
}
