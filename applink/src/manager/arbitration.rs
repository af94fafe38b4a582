//! HMI-level arbitration: one Full slot, one Limited app per audio class.
//!
//! Every mutation returns the set of affected applications as
//! [`StatusChange`] records, exactly one per application, so the caller
//! can emit a single OnHMIStatus notification each and drive the
//! streaming hooks off the level transitions.

use thiserror::Error;

use crate::manager::application::{AudioClass, AudioStreamingState, HmiLevel};
use crate::manager::registry::AppRegistry;
use crate::session::ConnectionKey;
use crate::trace::debug;

/// One application's post-arbitration status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub app_id: ConnectionKey,
    /// Level before the arbitration pass touched the app.
    pub from: HmiLevel,
    pub to: HmiLevel,
    pub audio: AudioStreamingState,
}

/// Why an activation was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ActivateError {
    #[error("application is not registered")]
    NotRegistered,
    #[error("application is already active")]
    AlreadyFull,
}

/// Folds repeated touches of one app into a single record, keeping the
/// level it started the pass with.
fn record(
    changes: &mut Vec<StatusChange>,
    app_id: ConnectionKey,
    from: HmiLevel,
    to: HmiLevel,
    audio: AudioStreamingState,
) {
    if let Some(existing) = changes.iter_mut().find(|c| c.app_id == app_id) {
        existing.to = to;
        existing.audio = audio;
    } else {
        changes.push(StatusChange {
            app_id,
            from,
            to,
            audio,
        });
    }
}

/// Moves `key` to HMI Full, demoting whoever stands in the way.
pub fn activate(
    registry: &mut AppRegistry,
    key: ConnectionKey,
) -> Result<Vec<StatusChange>, ActivateError> {
    let app = registry.get(key).ok_or(ActivateError::NotRegistered)?;
    if app.hmi_level == HmiLevel::Full {
        return Err(ActivateError::AlreadyFull);
    }
    let new_types = app.types;
    let mut changes = Vec::new();

    // Clear the Full slot.
    if let Some(current_key) = registry.active_application() {
        let current_is_media = registry
            .get(current_key)
            .map_or(false, |a| a.types.is_media);
        if new_types.is_media && current_is_media {
            // Two media apps cannot share an audible tier.
            let current = registry.get_mut(current_key).expect("active app exists");
            let from = current.hmi_level;
            current.hmi_level = HmiLevel::Background;
            current.audio_state = AudioStreamingState::NotAudible;
            record(
                &mut changes,
                current_key,
                from,
                HmiLevel::Background,
                AudioStreamingState::NotAudible,
            );
        } else {
            demote_from_full(registry, current_key, &mut changes);
        }
    }

    // Claim the slot.
    let app = registry.get_mut(key).expect("checked above");
    let from = app.hmi_level;
    app.hmi_level = HmiLevel::Full;
    app.audio_state = if app.is_audio() {
        AudioStreamingState::Audible
    } else {
        AudioStreamingState::NotAudible
    };
    let new_audio = app.audio_state;
    record(&mut changes, key, from, HmiLevel::Full, new_audio);

    // Sweep the exclusivity classes the newcomer belongs to.
    if new_types.is_media {
        if let Some(limited_key) = registry
            .limited_app_in_class(AudioClass::Media)
            .filter(|k| *k != key)
        {
            let limited_is_navi = registry
                .get(limited_key)
                .map_or(false, |a| a.types.is_navi);
            if limited_is_navi {
                // The navi streamer keeps its audio; the newcomer ducks.
                let app = registry.get_mut(key).expect("checked above");
                app.audio_state = AudioStreamingState::Attenuated;
                record(
                    &mut changes,
                    key,
                    from,
                    HmiLevel::Full,
                    AudioStreamingState::Attenuated,
                );
            } else {
                let limited = registry.get_mut(limited_key).expect("limited app exists");
                let limited_from = limited.hmi_level;
                limited.audio_state = AudioStreamingState::NotAudible;
                let to = limited.hmi_level;
                record(
                    &mut changes,
                    limited_key,
                    limited_from,
                    to,
                    AudioStreamingState::NotAudible,
                );
            }
        }
    }

    for class in [AudioClass::Voice, AudioClass::Navi] {
        if !new_types.in_class(class) {
            continue;
        }
        if let Some(limited_key) = registry.limited_app_in_class(class).filter(|k| *k != key) {
            let limited = registry.get_mut(limited_key).expect("limited app exists");
            let limited_from = limited.hmi_level;
            if limited.types.is_media {
                limited.audio_state = AudioStreamingState::NotAudible;
            }
            limited.hmi_level = HmiLevel::Background;
            let audio = limited.audio_state;
            record(
                &mut changes,
                limited_key,
                limited_from,
                HmiLevel::Background,
                audio,
            );
        }
    }

    debug!(key = %key, affected = changes.len(), "application activated");
    Ok(changes)
}

/// Drops a Full app to Limited when its audio classes stay free, to
/// Background otherwise.
fn demote_from_full(
    registry: &mut AppRegistry,
    key: ConnectionKey,
    changes: &mut Vec<StatusChange>,
) {
    let Some(app) = registry.get(key) else {
        return;
    };
    let goes_limited = app.is_audio() && !registry.class_occupied_in_full_or_limited(app);
    let app = registry.get_mut(key).expect("checked above");
    let from = app.hmi_level;
    app.hmi_level = if goes_limited {
        HmiLevel::Limited
    } else {
        HmiLevel::Background
    };
    let to = app.hmi_level;
    let audio = app.audio_state;
    record(changes, key, from, to, audio);
}

/// Direct level assignment driven from the HMI side, e.g. a deactivation
/// or an exit. Returns the change when the level actually moved.
pub fn change_level(
    registry: &mut AppRegistry,
    key: ConnectionKey,
    to: HmiLevel,
) -> Option<StatusChange> {
    let app = registry.get_mut(key)?;
    let from = app.hmi_level;
    if from == to {
        return None;
    }
    app.hmi_level = to;
    if !to.is_audible_tier() {
        app.audio_state = AudioStreamingState::NotAudible;
    }
    let audio = app.audio_state;
    Some(StatusChange {
        app_id: key,
        from,
        to,
        audio,
    })
}
