//! State patch levels
//!
//! A persisted state records the patch level it was written at. On start the
//! overlord migrates older states forward one level at a time; every step
//! commits on its own, so a failing step leaves the state at the last level
//! that succeeded.

use std::collections::BTreeMap;

use overlord_state::{State, StateGuard};
use tracing::info;

use crate::error::{Error, Result};

pub const PATCH_LEVEL_KEY: &str = "patch-level";

/// Migrates the state from `level - 1` to `level`.
pub type PatchFn = dyn Fn(&mut StateGuard<'_>) -> anyhow::Result<()> + Send + Sync;

pub struct Patches {
    level: u32,
    migrations: BTreeMap<u32, Box<PatchFn>>,
}

impl Default for Patches {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Patches {
    /// A set of migrations whose newest state format is `level`.
    pub fn new(level: u32) -> Self {
        Self {
            level,
            migrations: BTreeMap::new(),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Registers the migration producing `level` from `level - 1`.
    pub fn add<F>(mut self, level: u32, patch: F) -> Self
    where
        F: Fn(&mut StateGuard<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.migrations.insert(level, Box::new(patch));
        self
    }

    /// Stamps a fresh state with the current level.
    pub fn init(&self, state: &State) -> Result<()> {
        state.lock().set(PATCH_LEVEL_KEY, &self.level)?;
        Ok(())
    }

    /// Brings `state` up to the current level.
    pub fn apply(&self, state: &State) -> Result<()> {
        let stored = match state.lock().get::<u32>(PATCH_LEVEL_KEY) {
            Ok(level) => level,
            // a malformed level must not restart migrations from scratch
            Err(overlord_state::Error::NoState) => 0,
            Err(e) => return Err(e.into()),
        };
        if stored > self.level {
            return Err(Error::PatchDowngrade {
                stored,
                supported: self.level,
            });
        }
        for from in stored..self.level {
            let to = from + 1;
            let patch = self
                .migrations
                .get(&to)
                .ok_or(Error::MissingPatch { from, to })?;
            let mut st = state.lock();
            patch(&mut st).map_err(|source| Error::PatchFailed { from, to, source })?;
            st.set(PATCH_LEVEL_KEY, &to)?;
            info!("Patched state from level {} to {}", from, to);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_at(level: Option<u32>) -> State {
        let state = State::new(None);
        if let Some(level) = level {
            state.lock().set(PATCH_LEVEL_KEY, &level).unwrap();
        }
        state
    }

    #[test]
    fn migrates_step_by_step() {
        let patches = Patches::new(2)
            .add(1, |st| Ok(st.set("one", &true)?))
            .add(2, |st| {
                let one: bool = st.get("one")?;
                Ok(st.set("two", &one)?)
            });
        let state = state_at(None);
        patches.apply(&state).unwrap();

        let st = state.lock();
        assert_eq!(st.get::<u32>(PATCH_LEVEL_KEY).unwrap(), 2);
        assert!(st.get::<bool>("two").unwrap());
    }

    #[test]
    fn newer_state_is_refused() {
        let state = state_at(Some(5));
        let err = Patches::new(3).apply(&state).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot downgrade: state patch level 5 is newer than supported level 3"
        );
    }

    #[test]
    fn gap_in_migrations_is_reported() {
        let state = state_at(Some(1));
        let patches = Patches::new(3).add(2, |_| Ok(()));
        let err = patches.apply(&state).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot migrate from state patch level 2 to 3: no supported migration"
        );
        assert_eq!(state.lock().get::<u32>(PATCH_LEVEL_KEY).unwrap(), 2);
    }

    #[test]
    fn failing_migration_keeps_last_good_level() {
        let state = state_at(Some(0));
        let patches = Patches::new(2)
            .add(1, |_| Ok(()))
            .add(2, |_| Err(anyhow::anyhow!("bad data")));
        let err = patches.apply(&state).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot migrate from state patch level 1 to 2: bad data"
        );
        assert_eq!(state.lock().get::<u32>(PATCH_LEVEL_KEY).unwrap(), 1);
    }

    #[test]
    fn malformed_level_is_an_error() {
        let state = State::new(None);
        state.lock().set(PATCH_LEVEL_KEY, "two").unwrap();
        let err = Patches::new(1).add(1, |_| Ok(())).apply(&state).unwrap_err();
        assert!(matches!(err, Error::State(overlord_state::Error::Unmarshal { .. })), "{err}");
        assert_eq!(state.lock().get::<String>(PATCH_LEVEL_KEY).unwrap(), "two");
    }
}
