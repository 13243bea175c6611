use crate::vm::RegistryKey;

/// Capability for one registry slot: the VM key plus the generation it was
/// issued under. Keys are reused by the VM after release, generations never are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceToken {
    key: RegistryKey,
    generation: u64,
}

impl InstanceToken {
    pub fn key(&self) -> RegistryKey {
        self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    generation: u64,
    live: bool,
}

/// Liveness table for the handles a session has issued, indexed by registry key.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    slots: Vec<Slot>,
    live: usize,
    next_generation: u64,
}

impl HandleRegistry {
    pub fn new() -> Self {
        HandleRegistry::default()
    }

    /// Record a freshly pinned registry slot.
    pub fn register(&mut self, key: RegistryKey) -> InstanceToken {
        let index = key.index();
        if index >= self.slots.len() {
            self.slots.resize(index + 1, Slot::default());
        }
        self.next_generation += 1;
        let slot = &mut self.slots[index];
        if slot.live {
            tracing::error!(key = index, "registry key reissued while still live");
        } else {
            self.live += 1;
        }
        *slot = Slot { generation: self.next_generation, live: true };
        InstanceToken { key, generation: self.next_generation }
    }

    pub fn is_live(&self, token: InstanceToken) -> bool {
        self.slots
            .get(token.key.index())
            .is_some_and(|slot| slot.live && slot.generation == token.generation)
    }

    /// Mark the token dead. Returns true only the first time.
    pub fn release(&mut self, token: InstanceToken) -> bool {
        if !self.is_live(token) {
            return false;
        }
        self.slots[token.key.index()].live = false;
        self.live -= 1;
        true
    }

    /// Mark every slot dead, returning how many were live.
    pub fn invalidate_all(&mut self) -> usize {
        for slot in &mut self.slots {
            slot.live = false;
        }
        std::mem::take(&mut self.live)
    }

    pub fn live_count(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{State, Value};

    fn key(state: &State) -> RegistryKey {
        state.push(Value::Boolean(true));
        state.reference()
    }

    #[test]
    fn register_and_release() {
        let state = State::new();
        let mut registry = HandleRegistry::new();
        let token = registry.register(key(&state));
        assert!(registry.is_live(token));
        assert_eq!(registry.live_count(), 1);
        assert!(registry.release(token));
        assert!(!registry.release(token));
        assert!(!registry.is_live(token));
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn reused_key_does_not_revive_old_token() {
        let state = State::new();
        let mut registry = HandleRegistry::new();
        let k = key(&state);
        let old = registry.register(k);
        registry.release(old);
        state.unreference(k);

        let reused = key(&state);
        assert_eq!(reused.index(), k.index());
        let fresh = registry.register(reused);
        assert!(registry.is_live(fresh));
        assert!(!registry.is_live(old));
        assert_ne!(old.generation(), fresh.generation());
    }

    #[test]
    fn invalidate_all_kills_everything() {
        let state = State::new();
        let mut registry = HandleRegistry::new();
        let tokens: Vec<_> = (0..3).map(|_| registry.register(key(&state))).collect();
        assert_eq!(registry.invalidate_all(), 3);
        assert!(tokens.iter().all(|t| !registry.is_live(*t)));
        assert_eq!(registry.live_count(), 0);
    }
}
