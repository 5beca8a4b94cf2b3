//! Store facade for settings and runtime state
//!
//! All mutations go through closure-based `update_*` primitives so a change
//! is computed and committed under one lock. `JsonFileStore` persists across
//! restarts; `MemoryStore` backs unit tests.

use crate::config::Settings;
use crate::error::Result;
use crate::state::{ChargingContext, ControlState, PlugTracking};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Store contract consumed by every subsystem
pub trait Store: Send + Sync {
    fn settings(&self) -> Settings;
    fn set_settings(&self, settings: Settings) -> Result<()>;
    fn update_settings(&self, patch: &dyn Fn(&mut Settings)) -> Result<Settings>;

    fn control_state(&self) -> ControlState;
    fn update_control_state(&self, patch: &dyn Fn(&mut ControlState)) -> Result<ControlState>;

    fn charging_context(&self) -> ChargingContext;
    fn update_charging_context(
        &self,
        patch: &dyn Fn(&mut ChargingContext),
    ) -> Result<ChargingContext>;

    fn plug_tracking(&self) -> PlugTracking;
    fn set_plug_tracking(&self, tracking: PlugTracking) -> Result<()>;
}

/// Runtime state persisted as one JSON document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PersistedState {
    control: ControlState,
    context: ChargingContext,
    plug: PlugTracking,
}

struct Inner {
    settings: Settings,
    state: PersistedState,
}

/// In-memory store for unit tests and demo runs
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(Inner {
                settings,
                state: PersistedState::default(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

fn read_inner<'a>(lock: &'a RwLock<Inner>) -> std::sync::RwLockReadGuard<'a, Inner> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_inner<'a>(lock: &'a RwLock<Inner>) -> std::sync::RwLockWriteGuard<'a, Inner> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Store for MemoryStore {
    fn settings(&self) -> Settings {
        read_inner(&self.inner).settings.clone()
    }

    fn set_settings(&self, settings: Settings) -> Result<()> {
        write_inner(&self.inner).settings = settings;
        Ok(())
    }

    fn update_settings(&self, patch: &dyn Fn(&mut Settings)) -> Result<Settings> {
        let mut inner = write_inner(&self.inner);
        patch(&mut inner.settings);
        Ok(inner.settings.clone())
    }

    fn control_state(&self) -> ControlState {
        read_inner(&self.inner).state.control
    }

    fn update_control_state(&self, patch: &dyn Fn(&mut ControlState)) -> Result<ControlState> {
        let mut inner = write_inner(&self.inner);
        patch(&mut inner.state.control);
        Ok(inner.state.control)
    }

    fn charging_context(&self) -> ChargingContext {
        read_inner(&self.inner).state.context.clone()
    }

    fn update_charging_context(
        &self,
        patch: &dyn Fn(&mut ChargingContext),
    ) -> Result<ChargingContext> {
        let mut inner = write_inner(&self.inner);
        patch(&mut inner.state.context);
        Ok(inner.state.context.clone())
    }

    fn plug_tracking(&self) -> PlugTracking {
        read_inner(&self.inner).state.plug
    }

    fn set_plug_tracking(&self, tracking: PlugTracking) -> Result<()> {
        write_inner(&self.inner).state.plug = tracking;
        Ok(())
    }
}

/// File-backed store: settings as YAML, runtime state as JSON
pub struct JsonFileStore {
    inner: RwLock<Inner>,
    settings_path: PathBuf,
    state_path: PathBuf,
    logger: crate::logging::StructuredLogger,
}

impl JsonFileStore {
    /// Open (or initialize) a store rooted at `dir`
    pub fn open<P: AsRef<Path>>(dir: P, initial_settings: Settings) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let settings_path = dir.join("settings.yaml");
        let state_path = dir.join("state.json");
        let logger = crate::logging::get_logger(crate::logging::LogCategory::System);

        let settings = if settings_path.exists() {
            Settings::from_file(&settings_path)?
        } else {
            initial_settings
        };

        let state = if state_path.exists() {
            let contents = std::fs::read_to_string(&state_path)?;
            serde_json::from_str(&contents)?
        } else {
            PersistedState::default()
        };

        Ok(Self {
            inner: RwLock::new(Inner { settings, state }),
            settings_path,
            state_path,
            logger,
        })
    }

    fn persist_settings(&self, settings: &Settings) -> Result<()> {
        let yaml = serde_yaml::to_string(settings)?;
        write_atomically(&self.settings_path, yaml.as_bytes())
    }

    fn persist_state(&self, state: &PersistedState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        write_atomically(&self.state_path, json.as_bytes())
    }
}

/// Write to a sibling temp file, then rename over the target
fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl Store for JsonFileStore {
    fn settings(&self) -> Settings {
        read_inner(&self.inner).settings.clone()
    }

    fn set_settings(&self, settings: Settings) -> Result<()> {
        let mut inner = write_inner(&self.inner);
        self.persist_settings(&settings)?;
        inner.settings = settings;
        Ok(())
    }

    fn update_settings(&self, patch: &dyn Fn(&mut Settings)) -> Result<Settings> {
        let mut inner = write_inner(&self.inner);
        let mut settings = inner.settings.clone();
        patch(&mut settings);
        self.persist_settings(&settings)?;
        inner.settings = settings.clone();
        Ok(settings)
    }

    fn control_state(&self) -> ControlState {
        read_inner(&self.inner).state.control
    }

    fn update_control_state(&self, patch: &dyn Fn(&mut ControlState)) -> Result<ControlState> {
        let mut inner = write_inner(&self.inner);
        let mut state = inner.state.clone();
        patch(&mut state.control);
        self.persist_state(&state)?;
        inner.state = state;
        Ok(inner.state.control)
    }

    fn charging_context(&self) -> ChargingContext {
        read_inner(&self.inner).state.context.clone()
    }

    fn update_charging_context(
        &self,
        patch: &dyn Fn(&mut ChargingContext),
    ) -> Result<ChargingContext> {
        let mut inner = write_inner(&self.inner);
        let mut state = inner.state.clone();
        patch(&mut state.context);
        if !state.context.invariants_hold() {
            self.logger.warn("Charging context update left invariants unsatisfied");
        }
        self.persist_state(&state)?;
        inner.state = state;
        Ok(inner.state.context.clone())
    }

    fn plug_tracking(&self) -> PlugTracking {
        read_inner(&self.inner).state.plug
    }

    fn set_plug_tracking(&self, tracking: PlugTracking) -> Result<()> {
        let mut inner = write_inner(&self.inner);
        let mut state = inner.state.clone();
        state.plug = tracking;
        self.persist_state(&state)?;
        inner.state = state;
        Ok(())
    }
}
